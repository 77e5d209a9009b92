use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, RANGE};
use tracing::{debug, warn};

use super::{SubStream, Transport};
use crate::error::{Result, SluiceError};

// --- HTTP Transport Configuration ---
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub user_agent: String,
    /// Whole-request timeout; zero disables it
    pub timeout: Duration,
    /// Connection establishment timeout; zero disables it
    pub connect_timeout: Duration,
    /// Maximum number of HTTP redirects followed per request
    pub max_redirects: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("sluice/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
        }
    }
}

/// Blocking HTTP(S) transport. Seeking re-issues the request with a
/// `Range` header.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(5)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }
        if !config.connect_timeout.is_zero() {
            builder = builder.connect_timeout(config.connect_timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SluiceError::Io { source: io::Error::other(e) })?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, locator: &str) -> Result<Box<dyn SubStream>> {
        let response = request(&self.client, locator, 0)
            .map_err(|e| SluiceError::transport(locator, e))?;
        let length = response.content_length();
        debug!(url = %locator, ?length, "Opened HTTP stream");
        Ok(Box::new(HttpStream {
            client: self.client.clone(),
            locator: locator.to_string(),
            response: Some(response),
            pos: 0,
            length,
        }))
    }
}

fn request(client: &Client, url: &str, from: u64) -> io::Result<Response> {
    let mut req = client.get(url);
    if from > 0 {
        req = req.header(RANGE, format!("bytes={from}-"));
    }
    let response = req.send().map_err(io::Error::other)?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("HTTP {status}")));
    }
    if !status.is_success() {
        return Err(io::Error::other(format!("HTTP {status}")));
    }
    Ok(response)
}

struct HttpStream {
    client: Client,
    locator: String,
    response: Option<Response>,
    pos: u64,
    length: Option<u64>,
}

impl HttpStream {
    fn reopen_at(&mut self, target: u64) -> io::Result<()> {
        self.response = None;
        if self.length.is_some_and(|len| target >= len) {
            self.pos = target;
            return Ok(());
        }

        let mut response = request(&self.client, &self.locator, target)?;
        if target > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!(url = %self.locator, target, "Server ignored range request, skipping ahead");
            io::copy(&mut (&mut response).take(target), &mut io::sink())?;
        } else if let Some(total) = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.length = Some(total);
        }
        self.response = Some(response);
        self.pos = target;
        Ok(())
    }
}

impl Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(response) = self.response.as_mut() else {
            return Ok(0);
        };
        let n = response.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => match self.length {
                Some(len) => len.checked_add_signed(delta),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "length of HTTP resource is unknown",
                    ));
                }
            },
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;

        if target != self.pos || self.response.is_none() {
            self.reopen_at(target)?;
        }
        Ok(self.pos)
    }
}

impl SubStream for HttpStream {
    fn length(&self) -> Option<u64> {
        self.length
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}
