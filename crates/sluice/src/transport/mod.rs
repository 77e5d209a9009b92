//! Byte transports the engine reads manifests and fragments through.
//!
//! The engine only ever talks to [`Transport`] and [`SubStream`]; the
//! concrete implementations here cover local files and, with the `http`
//! feature, HTTP(S).

mod file;
#[cfg(feature = "http")]
mod http;

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, SluiceError};
use crate::manifest::ByteRange;

pub use file::FileTransport;
#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportConfig};

/// An open, blocking byte stream for one locator.
pub trait SubStream: Read + Seek + Send {
    /// Total length in bytes, when the transport knows it.
    fn length(&self) -> Option<u64>;

    /// The locator this stream was opened for.
    fn locator(&self) -> &str;

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Opens sub-streams by locator.
pub trait Transport: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn SubStream>>;
}

/// Dispatches on the locator scheme: `http(s)://` goes to HTTP, everything
/// else is treated as a local path.
#[derive(Debug)]
pub struct SchemeTransport {
    file: FileTransport,
    #[cfg(feature = "http")]
    http: HttpTransport,
}

impl SchemeTransport {
    #[cfg(feature = "http")]
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: FileTransport,
            http: HttpTransport::new(HttpTransportConfig::default())?,
        })
    }

    #[cfg(not(feature = "http"))]
    pub fn new() -> Result<Self> {
        Ok(Self { file: FileTransport })
    }
}

impl Transport for SchemeTransport {
    fn open(&self, locator: &str) -> Result<Box<dyn SubStream>> {
        let lower = locator.get(..8).unwrap_or(locator).to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            #[cfg(feature = "http")]
            return self.http.open(locator);
            #[cfg(not(feature = "http"))]
            return Err(SluiceError::transport(
                locator,
                io::Error::new(io::ErrorKind::Unsupported, "built without HTTP support"),
            ));
        }
        self.file.open(locator)
    }
}

/// Read a whole document (manifest, timing probe), refusing anything larger
/// than `limit` bytes.
pub fn fetch(transport: &dyn Transport, locator: &str, limit: usize) -> Result<Bytes> {
    let mut stream = transport.open(locator)?;
    let hint = stream.length().unwrap_or(16 * 1024).min(limit as u64) as usize;
    let mut body = Vec::with_capacity(hint);
    stream
        .by_ref()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| SluiceError::transport(locator, e))?;
    if body.len() > limit {
        return Err(SluiceError::manifest(format!(
            "document at {locator} exceeds {limit} bytes"
        )));
    }
    trace!(locator, bytes = body.len(), "Fetched document");
    Ok(Bytes::from(body))
}

/// Confines a sub-stream to one byte range of its resource.
pub struct RangeStream {
    inner: Box<dyn SubStream>,
    range: ByteRange,
    pos: u64,
}

impl RangeStream {
    /// Position `inner` at the start of `range`.
    pub fn new(mut inner: Box<dyn SubStream>, range: ByteRange) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(range.offset))?;
        Ok(Self {
            inner,
            range,
            pos: 0,
        })
    }

    /// Continue on `inner` without repositioning; it must already sit at
    /// `range.offset`.
    pub fn resume(inner: Box<dyn SubStream>, range: ByteRange) -> Self {
        Self {
            inner,
            range,
            pos: 0,
        }
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Whether the whole range has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.range.length
    }

    pub fn into_inner(self) -> Box<dyn SubStream> {
        self.inner
    }
}

impl Read for RangeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.range.length.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..len])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RangeStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.range.length.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before range start"))?;
        let target = target.min(self.range.length);
        self.inner.seek(SeekFrom::Start(self.range.offset + target))?;
        self.pos = target;
        Ok(target)
    }
}

impl SubStream for RangeStream {
    fn length(&self) -> Option<u64> {
        Some(self.range.length)
    }

    fn locator(&self) -> &str {
        self.inner.locator()
    }

    fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;

    #[test]
    fn range_stream_reads_only_its_slice() {
        let transport = MemoryTransport::new();
        transport.insert("mem://all.ts", b"0123456789abcdef".to_vec());
        let inner = transport.open("mem://all.ts").unwrap();

        let mut range = RangeStream::new(inner, ByteRange { offset: 4, length: 6 }).unwrap();
        let mut out = String::new();
        range.read_to_string(&mut out).unwrap();
        assert_eq!(out, "456789");
        assert!(range.is_exhausted());

        range.seek(SeekFrom::Start(2)).unwrap();
        let mut out = String::new();
        range.read_to_string(&mut out).unwrap();
        assert_eq!(out, "6789");

        let mut next = RangeStream::resume(range.into_inner(), ByteRange { offset: 10, length: 3 });
        let mut out = String::new();
        next.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn fetch_enforces_size_limit() {
        let transport = MemoryTransport::new();
        transport.insert("mem://big.m3u8", vec![b'#'; 64]);
        assert_eq!(fetch(&transport, "mem://big.m3u8", 64).unwrap().len(), 64);
        let err = fetch(&transport, "mem://big.m3u8", 63).unwrap_err();
        assert!(matches!(err, SluiceError::Manifest { .. }));
    }

    #[test]
    fn scheme_transport_opens_local_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"local bytes").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let transport = SchemeTransport::new().unwrap();
        let mut stream = transport.open(&path).unwrap();
        assert_eq!(stream.length(), Some(11));
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "local bytes");
    }
}
