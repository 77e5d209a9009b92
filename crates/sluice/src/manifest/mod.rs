//! Manifest model shared by the flat playlist and hierarchical manifest
//! parsers.
//!
//! Both front-ends produce the same [`Manifest`]; the variant is picked by
//! sniffing the document in [`parse_manifest`].

mod mpd;
mod playlist;
pub mod tree;

use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use memchr::memmem;

use crate::error::{Result, SluiceError};

pub use mpd::HierarchicalManifestParser;
pub(crate) use mpd::parse_date;
pub use playlist::{FlatPlaylistParser, VOD_HEURISTIC_MIN_FRAGMENTS};

bitflags! {
    /// Media carried by a representation. Muxed renditions set several bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContentKind: u8 {
        const AUDIO = 0b001;
        const VIDEO = 0b010;
        const SUBTITLE = 0b100;
    }
}

impl ContentKind {
    /// Guess the kind from a MIME type and an optional RFC 6381 codec list.
    pub fn from_mime(mime: &str, codecs: &str) -> Self {
        let mut kind = ContentKind::empty();
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("audio") {
            kind |= ContentKind::AUDIO;
        } else if mime.starts_with("video") {
            kind |= ContentKind::VIDEO;
        } else if mime.starts_with("text") || mime.contains("ttml") || mime.contains("vtt") {
            kind |= ContentKind::SUBTITLE;
        }

        for codec in codecs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let family = codec.split('.').next().unwrap_or(codec).to_ascii_lowercase();
            match family.as_str() {
                "mp4a" | "ac-3" | "ec-3" | "opus" | "flac" | "mp3" => kind |= ContentKind::AUDIO,
                "avc1" | "avc3" | "hvc1" | "hev1" | "av01" | "vp09" | "vp9" => {
                    kind |= ContentKind::VIDEO
                }
                "wvtt" | "stpp" => kind |= ContentKind::SUBTITLE,
                _ => {}
            }
        }
        kind
    }
}

/// Which front-end produced a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// Line oriented playlist (`#EXTM3U`)
    Flat,
    /// Period / AdaptationSet / Representation tree (MPD)
    Hierarchical,
}

/// `(offset, length)` slice of a physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A reference usable as-is after resolution against the base URL
    Explicit(String),
    /// A reference still containing `$...$` placeholders
    Templated(String),
}

impl Locator {
    pub fn as_str(&self) -> &str {
        match self {
            Locator::Explicit(s) | Locator::Templated(s) => s,
        }
    }
}

/// One enumerated fragment. Index 0 is the initialization segment.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentRef {
    pub index: u32,
    pub locator: Locator,
    pub duration: Option<Duration>,
    pub byte_range: Option<ByteRange>,
}

/// One `S` element of a `SegmentTimeline`, in timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSegment {
    pub start: Option<u64>,
    pub duration: u64,
    /// Additional repetitions (`-1` repeats until the end of the period)
    pub repeat: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTemplate {
    pub init_locator: Option<String>,
    pub media_pattern: String,
    pub start_number: u64,
    /// Fragment duration in `timescale` units
    pub fixed_duration: Option<u64>,
    pub timescale: u64,
    pub presentation_time_offset: u64,
    pub timeline: Vec<TimelineSegment>,
}

impl SegmentTemplate {
    /// Nominal fragment duration; falls back to the first timeline entry.
    pub fn fragment_duration(&self) -> Option<Duration> {
        let units = self
            .fixed_duration
            .or_else(|| self.timeline.first().map(|s| s.duration))?;
        if units == 0 || self.timescale == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(units as f64 / self.timescale as f64))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepresentationSource {
    /// Fragments addressed through a segment template
    Template(SegmentTemplate),
    /// Another playlist to fetch (master playlist variant or rendition)
    Playlist(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub language: Option<String>,
    pub kind: ContentKind,
    /// Resolution root for this representation's references
    pub base_url: String,
    pub source: RepresentationSource,
}

impl Representation {
    pub fn template(&self) -> Option<&SegmentTemplate> {
        match &self.source {
            RepresentationSource::Template(template) => Some(template),
            RepresentationSource::Playlist(_) => None,
        }
    }

    pub fn playlist(&self) -> Option<&str> {
        match &self.source {
            RepresentationSource::Playlist(uri) => Some(uri),
            RepresentationSource::Template(_) => None,
        }
    }
}

/// How a hierarchical manifest's wall-clock epoch is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochType {
    /// No timing probe; the local clock is trusted
    #[default]
    LocalClock,
    HttpIso,
    HttpXsDate,
    DirectIso,
    DirectXsDate,
}

impl EpochType {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.trim() {
            "urn:mpeg:dash:utc:http-iso:2014" => Some(Self::HttpIso),
            "urn:mpeg:dash:utc:http-xsdate:2014" => Some(Self::HttpXsDate),
            "urn:mpeg:dash:utc:direct:2014" | "urn:mpeg:dash:utc:direct-iso:2014" => {
                Some(Self::DirectIso)
            }
            "urn:mpeg:dash:utc:direct-xsdate:2014" => Some(Self::DirectXsDate),
            _ => None,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::HttpIso | Self::HttpXsDate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcTiming {
    pub epoch_type: EpochType,
    pub value: String,
}

/// Wall-clock information of a hierarchical manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTiming {
    pub availability_start: Option<DateTime<Utc>>,
    pub presentation_duration: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub minimum_update_period: Option<Duration>,
    pub utc_timing: Option<UtcTiming>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub format: ManifestFormat,
    pub base_url: String,
    pub live: bool,
    /// First fragment's sequence number (flat) or template start number
    pub sequence_start: u64,
    /// Whether `sequence_start` was declared rather than defaulted
    pub sequence_declared: bool,
    pub fragments: Vec<FragmentRef>,
    pub init: Option<FragmentRef>,
    pub representations: Vec<Representation>,
    pub target_duration: Option<Duration>,
    pub discontinuities: u32,
    pub timing: LiveTiming,
}

impl Manifest {
    pub fn new(format: ManifestFormat, base_url: impl Into<String>) -> Self {
        Self {
            format,
            base_url: base_url.into(),
            live: false,
            sequence_start: 0,
            sequence_declared: false,
            fragments: Vec::new(),
            init: None,
            representations: Vec::new(),
            target_duration: None,
            discontinuities: 0,
            timing: LiveTiming::default(),
        }
    }

    /// A manifest that only points at other playlists.
    pub fn is_redirect(&self) -> bool {
        self.fragments.is_empty()
            && !self.representations.is_empty()
            && self.representations.iter().all(|r| r.playlist().is_some())
    }
}

/// A manifest front-end.
pub trait ManifestParser {
    /// Parse `raw` fetched from `base_url`.
    fn parse(&self, raw: &[u8], base_url: &str) -> Result<Manifest>;
}

/// Pick the parser by looking at the document.
pub fn sniff(raw: &[u8]) -> Option<ManifestFormat> {
    let body = strip_bom(raw);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let body = &body[start..];

    if body.starts_with(b"#EXTM3U") {
        return Some(ManifestFormat::Flat);
    }
    if body.starts_with(b"<") && memmem::find(body, b"<MPD").is_some() {
        return Some(ManifestFormat::Hierarchical);
    }
    if memmem::find(body, b"#EXT").is_some() {
        return Some(ManifestFormat::Flat);
    }
    None
}

/// Sniff and parse a manifest document.
pub fn parse_manifest(raw: &[u8], base_url: &str) -> Result<Manifest> {
    match sniff(raw) {
        Some(ManifestFormat::Flat) => FlatPlaylistParser.parse(raw, base_url),
        Some(ManifestFormat::Hierarchical) => HierarchicalManifestParser.parse(raw, base_url),
        None => Err(SluiceError::manifest(format!(
            "unrecognized manifest format at {base_url}"
        ))),
    }
}

pub(crate) fn strip_bom(raw: &[u8]) -> &[u8] {
    raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw)
}
