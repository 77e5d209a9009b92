use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use super::{SubStream, Transport};
use crate::error::{Result, SluiceError};

/// Local files, addressed by plain path or `file://` locator.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

impl Transport for FileTransport {
    fn open(&self, locator: &str) -> Result<Box<dyn SubStream>> {
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        let file = File::open(path).map_err(|e| SluiceError::transport(locator, e))?;
        let length = file
            .metadata()
            .map_err(|e| SluiceError::transport(locator, e))?
            .len();
        debug!(path, length, "Opened local file");
        Ok(Box::new(FileStream {
            file,
            length,
            locator: locator.to_string(),
        }))
    }
}

struct FileStream {
    file: File,
    length: u64,
    locator: String,
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SubStream for FileStream {
    fn length(&self) -> Option<u64> {
        Some(self.length)
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn opens_plain_and_file_scheme_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frag1.ts");
        File::create(&path).unwrap().write_all(b"fragment-one").unwrap();

        let plain = path.to_string_lossy().into_owned();
        let mut stream = FileTransport.open(&plain).unwrap();
        assert_eq!(stream.length(), Some(12));
        stream.seek(SeekFrom::Start(9)).unwrap();
        let mut tail = String::new();
        stream.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "one");

        let scheme = format!("file://{plain}");
        let stream = FileTransport.open(&scheme).unwrap();
        assert_eq!(stream.locator(), scheme);
    }

    #[test]
    fn missing_file_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.m3u8");
        let err = FileTransport
            .open(&missing.to_string_lossy())
            .err()
            .expect("open should fail");
        assert!(err.is_recoverable());
        assert!(matches!(err, SluiceError::Transport { .. }));
    }
}
