mod error;

use std::fs::File;
use std::io::{self, BufWriter, Read, SeekFrom, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use sluice_engine::{
    ContentKind, Preference, SchemeTransport, SessionConfig, StreamSession,
};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Playlist or manifest to play (URL or local path)
    mrl: String,

    /// Write the stream here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Preferred picture width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Preferred picture height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Preferred bitrate in bits per second
    #[arg(long, default_value_t = 2_000_000)]
    bitrate: u32,

    /// Preferred language (BCP-47)
    #[arg(long)]
    lang: Option<String>,

    /// Play the audio rendition instead of video
    #[arg(long)]
    audio: bool,

    /// Start at this time, in milliseconds (on-demand streams only)
    #[arg(long)]
    seek_ms: Option<u64>,

    /// Stop after this many bytes
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) | Err(AppError::BrokenPipe) => {}
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sluice_engine=debug,sluice=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sluice_engine=info,sluice=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(verbose))
        .init();
}

fn run(args: Args) -> Result<()> {
    if args.mrl.trim().is_empty() {
        return Err(AppError::InvalidInput("empty MRL".to_string()));
    }

    let kind = if args.audio {
        ContentKind::AUDIO
    } else {
        ContentKind::VIDEO
    };
    let config = SessionConfig::default().with_preference(Preference {
        width: args.width,
        height: args.height,
        bitrate: args.bitrate,
        language: args.lang,
        kind,
    });
    let transport = Arc::new(SchemeTransport::new()?);
    let mut session = StreamSession::open(&args.mrl, transport, config)?;
    info!(
        mode = session.mode().as_str(),
        capabilities = ?session.capabilities(),
        "Session ready"
    );

    if let Some(ms) = args.seek_ms {
        let offset = session.seek_time(SeekFrom::Start(ms))?;
        info!(ms, offset, "Seeked");
    }

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = BufWriter::new(sink);

    let copied = match args.max_bytes {
        Some(limit) => copy(&mut (&mut session).take(limit), &mut sink)?,
        None => copy(&mut session, &mut sink)?,
    };
    sink.flush().map_err(pipe_error)?;
    session.close();
    info!(bytes = copied, "Done");
    Ok(())
}

fn copy(reader: &mut impl Read, writer: &mut impl Write) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).map_err(pipe_error)?;
        total += n as u64;
    }
}

fn pipe_error(e: io::Error) -> AppError {
    if e.kind() == io::ErrorKind::BrokenPipe {
        AppError::BrokenPipe
    } else {
        AppError::Io(e)
    }
}
