use std::time::Duration;

use crate::manifest::ContentKind;

/// Rendition the caller would like to receive.
///
/// Selection is a nearest fit against these values, see
/// [`select_representation`](crate::select::select_representation).
#[derive(Debug, Clone)]
pub struct Preference {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u32,
    /// BCP-47 language tag, matched case-insensitively by primary subtag
    pub language: Option<String>,
    pub kind: ContentKind,
}

impl Default for Preference {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            language: None,
            kind: ContentKind::VIDEO,
        }
    }
}

// --- Live Configuration ---
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Delay between manifest re-fetches that revealed no new fragment
    pub refresh_interval: Duration,
    /// Number of empty re-fetches (or failed live-edge opens) before the
    /// stream is treated as ended
    pub max_refresh_retries: u32,
    /// Allow guessing the next fragment by incrementing a URL token
    pub allow_bump: bool,
    /// Fragments kept between the live edge and the play position when the
    /// manifest does not suggest a presentation delay
    pub lag_fragments: u32,
    /// Delay before retrying a templated fragment that is not yet published
    pub edge_retry_delay: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(2),
            max_refresh_retries: 5,
            allow_bump: true,
            lag_fragments: 3,
            edge_retry_delay: Duration::from_millis(500),
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub preference: Preference,
    /// Master to media playlist hops allowed while opening
    pub max_manifest_hops: u32,
    /// Bytes read at open time and replayed to the first reader
    pub preview_size: usize,
    /// Largest manifest document accepted
    pub manifest_size_limit: usize,
    pub live: LiveConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preference: Preference::default(),
            max_manifest_hops: 4,
            preview_size: 4096,
            manifest_size_limit: 8 * 1024 * 1024,
            live: LiveConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_preference(mut self, preference: Preference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_preview_size(mut self, preview_size: usize) -> Self {
        self.preview_size = preview_size;
        self
    }

    pub fn with_live(mut self, live: LiveConfig) -> Self {
        self.live = live;
        self
    }
}
