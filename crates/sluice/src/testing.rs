//! In-memory collaborators for driving sessions in tests.

use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{Result, SluiceError};
use crate::transport::{SubStream, Transport};

#[derive(Debug, Default)]
struct Resource {
    versions: Vec<Bytes>,
    served: usize,
}

/// Transport serving byte buffers from memory.
///
/// Every `open` is recorded. A resource may carry several versions; each
/// open serves the next one and the last version sticks, which is how live
/// playlists are simulated.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, Resource>>,
    failing: Mutex<HashSet<String>>,
    hidden_lengths: Mutex<HashSet<String>>,
    cut: Mutex<HashMap<String, u64>>,
    opens: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `locator`, replacing any earlier versions.
    pub fn insert(&self, locator: impl Into<String>, body: impl Into<Bytes>) {
        self.resources.lock().insert(
            locator.into(),
            Resource {
                versions: vec![body.into()],
                served: 0,
            },
        );
    }

    /// Queue another version of `locator`, served after the earlier ones.
    pub fn push_version(&self, locator: impl Into<String>, body: impl Into<Bytes>) {
        self.resources
            .lock()
            .entry(locator.into())
            .or_default()
            .versions
            .push(body.into());
    }

    pub fn remove(&self, locator: &str) {
        self.resources.lock().remove(locator);
    }

    /// Make every open of `locator` fail with a transport error.
    pub fn fail(&self, locator: impl Into<String>) {
        self.failing.lock().insert(locator.into());
    }

    /// Serve `locator` without announcing its length.
    pub fn hide_length(&self, locator: impl Into<String>) {
        self.hidden_lengths.lock().insert(locator.into());
    }

    /// Reset the connection once `bytes` of `locator` have been read.
    pub fn cut_after(&self, locator: impl Into<String>, bytes: u64) {
        self.cut.lock().insert(locator.into(), bytes);
    }

    pub fn opens(&self) -> Vec<String> {
        self.opens.lock().clone()
    }

    pub fn open_count(&self, locator: &str) -> usize {
        self.opens.lock().iter().filter(|l| *l == locator).count()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, locator: &str) -> Result<Box<dyn SubStream>> {
        self.opens.lock().push(locator.to_string());
        if self.failing.lock().contains(locator) {
            return Err(SluiceError::transport(
                locator,
                io::Error::new(io::ErrorKind::ConnectionRefused, "injected failure"),
            ));
        }

        let mut resources = self.resources.lock();
        let Some(resource) = resources
            .get_mut(locator)
            .filter(|r| !r.versions.is_empty())
        else {
            return Err(SluiceError::transport(
                locator,
                io::Error::new(io::ErrorKind::NotFound, "no such resource"),
            ));
        };
        let index = resource.served.min(resource.versions.len() - 1);
        resource.served += 1;
        let body = resource.versions[index].clone();
        let length = (!self.hidden_lengths.lock().contains(locator)).then_some(body.len() as u64);

        Ok(Box::new(MemoryStream {
            length,
            cut_at: self.cut.lock().get(locator).copied(),
            cursor: Cursor::new(body),
            locator: locator.to_string(),
        }))
    }
}

struct MemoryStream {
    cursor: Cursor<Bytes>,
    length: Option<u64>,
    cut_at: Option<u64>,
    locator: String,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(cut_at) = self.cut_at else {
            return self.cursor.read(buf);
        };
        let left = cut_at.saturating_sub(self.cursor.position());
        if left == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset mid-fragment",
            ));
        }
        let n = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        self.cursor.read(&mut buf[..n])
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl SubStream for MemoryStream {
    fn length(&self) -> Option<u64> {
        self.length
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}

/// Manually driven clock; `sleep` advances time instead of blocking.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    slept: Mutex<Vec<Duration>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
        self.advance(duration);
    }
}
