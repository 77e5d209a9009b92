//! Shared live epoch for sibling renditions of one hierarchical manifest.
//!
//! The first session to need the epoch probes the server time and publishes
//! an immutable [`SyncSnapshot`]; every sibling reads that same snapshot, so
//! audio, video and subtitles compute fragment numbers from one clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LiveConfig;
use crate::error::{Result, SluiceError};
use crate::manifest::{EpochType, LiveTiming, UtcTiming, parse_date};
use crate::transport::{Transport, fetch};

/// Largest timing probe response accepted.
const PROBE_SIZE_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// Wall-clock time of media time zero
    pub avail_start: DateTime<Utc>,
    /// Media time playback starts at
    pub play_start: Duration,
    /// Local clock reading taken when `play_start` was computed
    pub play_systime: DateTime<Utc>,
    /// Distance kept behind the live edge
    pub lag: Duration,
    pub epoch_type: EpochType,
}

impl SyncSnapshot {
    /// Media time being played at local time `now`.
    pub fn media_time(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - self.play_systime).to_std().unwrap_or_default();
        self.play_start + elapsed
    }

    /// Fragment number playing at `now` for a template with the given start
    /// number and fragment duration.
    pub fn fragment_number(
        &self,
        start_number: u64,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> u64 {
        if duration.is_zero() {
            return start_number;
        }
        let elapsed = self.media_time(now).as_nanos() / duration.as_nanos();
        start_number + u64::try_from(elapsed).unwrap_or(u64::MAX - start_number)
    }

    /// How long to wait until fragment `relative` (counted from the start
    /// number) has been fully published, or `None` when it already is.
    pub fn wait_for(
        &self,
        relative: u64,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let count = u32::try_from(relative + 1).unwrap_or(u32::MAX);
        let published_at = duration.saturating_mul(count);
        let edge = self.media_time(now) + self.lag;
        published_at.checked_sub(edge).filter(|wait| !wait.is_zero())
    }
}

/// Mutex-guarded, write-once holder of the shared [`SyncSnapshot`].
#[derive(Debug, Default)]
pub struct SyncBlock {
    snapshot: Mutex<Option<SyncSnapshot>>,
}

impl SyncBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SyncSnapshot> {
        *self.snapshot.lock()
    }

    /// Return the published snapshot, computing and publishing it with
    /// `establish` if nobody has yet. `establish` runs under the lock, so it
    /// runs at most once per block even with concurrent siblings.
    pub fn get_or_publish(
        &self,
        establish: impl FnOnce() -> Result<SyncSnapshot>,
    ) -> Result<SyncSnapshot> {
        let mut guard = self.snapshot.lock();
        if let Some(snapshot) = *guard {
            return Ok(snapshot);
        }
        let snapshot = establish()?;
        *guard = Some(snapshot);
        Ok(snapshot)
    }
}

/// Compute the epoch for a live manifest: probe the server time, then step
/// back by the presentation delay.
pub fn establish(
    timing: &LiveTiming,
    fragment_duration: Duration,
    config: &LiveConfig,
    transport: &dyn Transport,
    clock: &dyn Clock,
) -> SyncSnapshot {
    let (server_now, epoch_type) =
        probe_server_time(timing.utc_timing.as_ref(), transport, clock);
    let avail_start = timing.availability_start.unwrap_or(server_now);
    let lag = timing
        .suggested_presentation_delay
        .unwrap_or_else(|| fragment_duration.saturating_mul(config.lag_fragments));
    let elapsed = (server_now - avail_start).to_std().unwrap_or_default();

    let snapshot = SyncSnapshot {
        avail_start,
        play_start: elapsed.saturating_sub(lag),
        play_systime: clock.now(),
        lag,
        epoch_type,
    };
    info!(
        avail_start = %snapshot.avail_start,
        play_start_ms = snapshot.play_start.as_millis() as u64,
        lag_ms = snapshot.lag.as_millis() as u64,
        epoch = ?epoch_type,
        "Published live epoch"
    );
    snapshot
}

/// Server time according to the manifest's timing element, falling back to
/// the local clock when there is none or the probe fails.
fn probe_server_time(
    timing: Option<&UtcTiming>,
    transport: &dyn Transport,
    clock: &dyn Clock,
) -> (DateTime<Utc>, EpochType) {
    let Some(timing) = timing else {
        return (clock.now(), EpochType::LocalClock);
    };
    let probed = if timing.epoch_type.is_http() {
        fetch(transport, &timing.value, PROBE_SIZE_LIMIT).and_then(|body| {
            let text = String::from_utf8_lossy(&body);
            parse_date(&text).ok_or_else(|| {
                SluiceError::manifest(format!(
                    "unparsable time from {}: {}",
                    timing.value,
                    text.trim()
                ))
            })
        })
    } else {
        parse_date(&timing.value).ok_or_else(|| {
            SluiceError::manifest(format!("unparsable UTCTiming value `{}`", timing.value))
        })
    };

    match probed {
        Ok(now) => {
            debug!(source = %timing.value, server_time = %now, "Probed server time");
            (now, timing.epoch_type)
        }
        Err(e) => {
            warn!(error = %e, "Timing probe failed, using local clock");
            (clock.now(), EpochType::LocalClock)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedClock, MemoryTransport};
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn timing(utc: Option<UtcTiming>) -> LiveTiming {
        LiveTiming {
            availability_start: Some(epoch()),
            suggested_presentation_delay: Some(Duration::from_secs(6)),
            utc_timing: utc,
            ..LiveTiming::default()
        }
    }

    #[test]
    fn establishes_epoch_from_http_probe() {
        let transport = MemoryTransport::new();
        transport.insert("mem://time", "2024-01-01T00:01:02Z\n");
        let clock = FixedClock::new(epoch() + chrono::TimeDelta::seconds(1000));
        let timing = timing(Some(UtcTiming {
            epoch_type: EpochType::HttpIso,
            value: "mem://time".to_string(),
        }));

        let snapshot = establish(
            &timing,
            Duration::from_secs(2),
            &LiveConfig::default(),
            &transport,
            &clock,
        );
        assert_eq!(snapshot.epoch_type, EpochType::HttpIso);
        assert_eq!(snapshot.play_start, Duration::from_secs(56));
        let now = clock.now();
        assert_eq!(snapshot.fragment_number(0, Duration::from_secs(2), now), 28);
        assert_eq!(snapshot.fragment_number(0, Duration::from_secs(4), now), 14);

        clock.advance(Duration::from_secs(4));
        let now = clock.now();
        assert_eq!(snapshot.fragment_number(0, Duration::from_secs(2), now), 30);
    }

    #[test]
    fn failed_probe_falls_back_to_local_clock() {
        let transport = MemoryTransport::new();
        let clock = FixedClock::new(epoch() + chrono::TimeDelta::seconds(20));
        let timing = timing(Some(UtcTiming {
            epoch_type: EpochType::HttpXsDate,
            value: "mem://missing".to_string(),
        }));
        let snapshot = establish(
            &timing,
            Duration::from_secs(2),
            &LiveConfig::default(),
            &transport,
            &clock,
        );
        assert_eq!(snapshot.epoch_type, EpochType::LocalClock);
        assert_eq!(snapshot.play_start, Duration::from_secs(14));
    }

    #[test]
    fn direct_timing_needs_no_fetch() {
        let transport = MemoryTransport::new();
        let clock = FixedClock::new(epoch());
        let timing = LiveTiming {
            availability_start: Some(epoch()),
            utc_timing: Some(UtcTiming {
                epoch_type: EpochType::DirectIso,
                value: "2024-01-01T00:00:30Z".to_string(),
            }),
            ..LiveTiming::default()
        };
        let config = LiveConfig {
            lag_fragments: 2,
            ..LiveConfig::default()
        };
        let snapshot = establish(&timing, Duration::from_secs(5), &config, &transport, &clock);
        assert_eq!(snapshot.lag, Duration::from_secs(10));
        assert_eq!(snapshot.play_start, Duration::from_secs(20));
        assert!(transport.opens().is_empty());
    }

    #[test]
    fn waits_until_fragment_is_published() {
        let snapshot = SyncSnapshot {
            avail_start: epoch(),
            play_start: Duration::from_secs(10),
            play_systime: epoch(),
            lag: Duration::from_secs(4),
            epoch_type: EpochType::LocalClock,
        };
        // edge at 14s: fragment 6 ends at 14s, fragment 7 at 16s
        assert_eq!(snapshot.wait_for(6, Duration::from_secs(2), epoch()), None);
        assert_eq!(
            snapshot.wait_for(7, Duration::from_secs(2), epoch()),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn publishes_exactly_once() {
        let block = SyncBlock::new();
        let snapshot = SyncSnapshot {
            avail_start: epoch(),
            play_start: Duration::ZERO,
            play_systime: epoch(),
            lag: Duration::ZERO,
            epoch_type: EpochType::LocalClock,
        };
        let mut calls = 0;
        let first = block
            .get_or_publish(|| {
                calls += 1;
                Ok(snapshot)
            })
            .unwrap();
        let second = block
            .get_or_publish(|| {
                calls += 1;
                Err(SluiceError::Closed)
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls, 1);
        assert_eq!(block.get(), Some(snapshot));
    }
}
