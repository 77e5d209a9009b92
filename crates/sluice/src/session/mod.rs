//! The stream session: opens a manifest, picks a representation and turns
//! its fragments into one readable, seekable byte stream.
//!
//! Sessions are single-consumer and blocking. The only state shared between
//! sessions is the [`SyncBlock`] of sibling renditions opened through
//! [`StreamSession::side_session`].

mod timeline;

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::{Result, SluiceError};
use crate::index::FragmentIndex;
use crate::live::{Reconcile, SyncBlock, bump, reget, sync};
use crate::locator::{self, NumberSlot};
use crate::manifest::{
    ByteRange, ContentKind, Manifest, ManifestFormat, Representation, parse_manifest,
};
use crate::select::select_representation;
use crate::transport::{RangeStream, SubStream, Transport, fetch};
use timeline::{ListedFragment, Timeline};

/// How the session finds the fragment after the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every fragment is known up front.
    Vod,
    /// Live; the next locator is computed (URL token increment, or fragment
    /// number arithmetic for templated manifests).
    LiveBump,
    /// Live; the manifest is re-fetched to discover new fragments.
    LiveReget,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Vod => "vod",
            Mode::LiveBump => "live-bump",
            Mode::LiveReget => "live-reget",
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Mode::Vod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    InitSegment,
    Streaming,
    Seeking,
    Closed,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const LIVE = 0b0001;
        const SEEKABLE = 0b0010;
        const TIME_SEEKABLE = 0b0100;
        const PREVIEW = 0b1000;
    }
}

/// The sub-stream of the current fragment.
enum Active {
    Whole(Box<dyn SubStream>),
    Slice(RangeStream),
}

impl Active {
    fn stream(&mut self) -> &mut dyn SubStream {
        match self {
            Active::Whole(stream) => stream.as_mut(),
            Active::Slice(stream) => stream,
        }
    }

    fn length(&self) -> Option<u64> {
        match self {
            Active::Whole(stream) => stream.length(),
            Active::Slice(stream) => stream.length(),
        }
    }

    fn locator(&self) -> &str {
        match self {
            Active::Whole(stream) => stream.locator(),
            Active::Slice(stream) => stream.locator(),
        }
    }
}

struct Target {
    locator: String,
    range: Option<ByteRange>,
    duration: Option<Duration>,
}

pub struct StreamSession {
    mrl: String,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    /// Document fetched from `mrl`: master playlist, media playlist or MPD
    root: Arc<Manifest>,
    /// Document the fragments come from, and where it is re-fetched from
    manifest: Arc<Manifest>,
    manifest_locator: String,
    representation: Option<Representation>,
    sync: Arc<SyncBlock>,

    timeline: Timeline,
    init: Option<ListedFragment>,
    index: FragmentIndex,
    mode: Mode,
    state: SessionState,
    /// Bump token, while bump continuation is still trusted
    bump: Option<NumberSlot>,
    /// Slot added by a bump guess that has not been opened yet
    guessed: Option<u32>,

    current: u32,
    pos: u64,
    fragment_start_pos: u64,
    /// Stream position the next read from `active` produces
    sub_pos: u64,
    active: Option<Active>,
    preview: Bytes,
    ended: bool,
}

impl StreamSession {
    /// Open `mrl` and prepare the first fragment.
    ///
    /// On error nothing stays open.
    pub fn open(mrl: &str, transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        Self::open_with_clock(mrl, transport, config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        mrl: &str,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!(mrl, "Opening stream");
        let root = load_manifest(transport.as_ref(), mrl, config.manifest_size_limit)?;
        Self::from_root(
            mrl.to_string(),
            Arc::new(root),
            transport,
            clock,
            config,
            Arc::new(SyncBlock::new()),
        )
    }

    /// Open a sibling rendition of another kind (audio next to video, ...)
    /// from the same manifest, sharing its live epoch.
    pub fn side_session(&self, kind: ContentKind) -> Result<StreamSession> {
        if !self
            .root
            .representations
            .iter()
            .any(|r| r.kind.intersects(kind))
        {
            return Err(SluiceError::representation_unavailable(format!(
                "no {kind:?} representation in {}",
                self.mrl
            )));
        }

        let mut config = self.config.clone();
        config.preference.kind = kind;
        if !kind.contains(ContentKind::VIDEO) {
            // audio and subtitle renditions have no picture size
            config.preference.width = 0;
            config.preference.height = 0;
        }
        Self::from_root(
            self.mrl.clone(),
            Arc::clone(&self.root),
            Arc::clone(&self.transport),
            Arc::clone(&self.clock),
            config,
            Arc::clone(&self.sync),
        )
    }

    fn from_root(
        mrl: String,
        root: Arc<Manifest>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
        sync: Arc<SyncBlock>,
    ) -> Result<Self> {
        let (manifest_locator, manifest, representation) = resolve_media(
            transport.as_ref(),
            &config,
            &mrl,
            Arc::clone(&root),
            config.max_manifest_hops,
        )?;

        let (timeline, init) = match manifest.format {
            ManifestFormat::Flat => (
                Timeline::Listed(timeline::listed_from_flat(&manifest)),
                timeline::init_from_flat(&manifest),
            ),
            ManifestFormat::Hierarchical => {
                let rep = representation.as_ref().ok_or_else(|| {
                    SluiceError::representation_unavailable("no representation selected")
                })?;
                let template = rep.template().ok_or_else(|| {
                    SluiceError::representation_unavailable(format!(
                        "representation `{}` has no segment template",
                        rep.id
                    ))
                })?;
                (
                    timeline::from_template(rep, template, &manifest)?,
                    timeline::init_from_template(rep, template),
                )
            }
        };
        if timeline.count() == Some(0) {
            return Err(SluiceError::manifest(format!(
                "{manifest_locator} lists no fragments"
            )));
        }

        let mut session = Self {
            mrl,
            config,
            transport,
            clock,
            root,
            manifest,
            manifest_locator,
            representation,
            sync,
            timeline,
            init,
            index: FragmentIndex::new(),
            mode: Mode::Vod,
            state: SessionState::Opening,
            bump: None,
            guessed: None,
            current: 0,
            pos: 0,
            fragment_start_pos: 0,
            sub_pos: 0,
            active: None,
            preview: Bytes::new(),
            ended: false,
        };

        session.mode = session.decide_mode();
        session.skip_to_live_edge()?;
        session.seed_index();
        session.start()?;
        Ok(session)
    }

    fn decide_mode(&mut self) -> Mode {
        let mode = if !self.manifest.live {
            Mode::Vod
        } else {
            match &self.timeline {
                Timeline::Template(_) => Mode::LiveBump,
                // expanded timelines carry $Time$ in their locators
                Timeline::Listed(_)
                    if !self.config.live.allow_bump
                        || self.manifest.format == ManifestFormat::Hierarchical =>
                {
                    Mode::LiveReget
                }
                Timeline::Listed(entries) => {
                    let slot = match entries.as_slice() {
                        [.., prev, last] => bump::discover(&prev.locator, &last.locator),
                        _ => None,
                    }
                    .or_else(|| {
                        let last = entries.last()?;
                        if !self.manifest.sequence_declared {
                            return None;
                        }
                        bump::discover_by_sequence(&last.locator, last.sequence)
                    });
                    match slot {
                        Some(slot) => {
                            debug!(locator = slot.as_str(), token = ?slot.token(), "Discovered bump token");
                            self.bump = Some(slot);
                            Mode::LiveBump
                        }
                        None => Mode::LiveReget,
                    }
                }
            }
        };
        info!(mode = mode.as_str(), mrl = %self.mrl, "Selected stream mode");
        mode
    }

    /// Start live playback a few fragments behind the edge.
    fn skip_to_live_edge(&mut self) -> Result<()> {
        if !self.manifest.live {
            return Ok(());
        }
        match &mut self.timeline {
            Timeline::Listed(entries) => {
                let keep = (self.config.live.lag_fragments as usize).max(1);
                if entries.len() > keep {
                    let skipped = entries.len() - keep;
                    entries.drain(..skipped);
                    debug!(skipped, "Starting near the live edge");
                }
            }
            Timeline::Template(template) => {
                let duration = template.duration;
                let (manifest, live) = (&self.manifest, &self.config.live);
                let (transport, clock) = (self.transport.as_ref(), self.clock.as_ref());
                let snapshot = self.sync.get_or_publish(|| {
                    Ok(sync::establish(
                        &manifest.timing,
                        duration,
                        live,
                        transport,
                        clock,
                    ))
                })?;
                template.first_number =
                    snapshot.fragment_number(template.start_number, duration, clock.now());
                debug!(
                    first_number = template.first_number,
                    "Aligned template to the live epoch"
                );
            }
        }
        Ok(())
    }

    fn seed_index(&mut self) {
        let init_size = match &self.init {
            Some(init) => init.range.map(|r| r.length),
            None => Some(0),
        };
        self.index.set(0, Some(Duration::ZERO), init_size);

        match &self.timeline {
            Timeline::Listed(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    self.index
                        .set(i as u32 + 1, entry.duration, entry.range.map(|r| r.length));
                }
            }
            Timeline::Template(template) => {
                if let Some(count) = template.count {
                    for slot in 1..=count {
                        self.index.set(slot, Some(template.duration), None);
                    }
                }
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        let first = if self.init.is_some() { 0 } else { 1 };
        if !self.open_next(first)? {
            let locator = self.target(first)?.locator;
            return Err(SluiceError::transport(
                locator,
                io::Error::new(io::ErrorKind::TimedOut, "live edge never became available"),
            ));
        }
        self.fill_preview()?;
        info!(
            mrl = %self.mrl,
            mode = self.mode.as_str(),
            fragments = ?self.timeline.count(),
            preview = self.preview.len(),
            "Stream opened"
        );
        Ok(())
    }

    fn fill_preview(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let mut buf = vec![0u8; self.config.preview_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = active
                .stream()
                .read(&mut buf[filled..])
                .map_err(|e| SluiceError::transport(active.locator(), e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.sub_pos += filled as u64;
        self.preview = Bytes::from(buf);
        Ok(())
    }

    // --- Reading ---

    /// Read up to `buf.len()` bytes, crossing fragment boundaries.
    ///
    /// Returns 0 at the end of the stream. A failure after some bytes were
    /// copied returns those bytes instead of the error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state == SessionState::Closed {
            return Err(SluiceError::Closed);
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_some(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if filled > 0 => {
                    warn!(error = %e, bytes = filled, "Read failed mid-stream, returning partial data");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos < self.preview.len() as u64 {
            let start = self.pos as usize;
            let n = buf.len().min(self.preview.len() - start);
            buf[..n].copy_from_slice(&self.preview[start..start + n]);
            self.pos += n as u64;
            return Ok(n);
        }
        if self.ended {
            return Ok(0);
        }
        if self.sub_pos != self.pos {
            self.reposition(self.pos)?;
            if self.ended {
                return Ok(0);
            }
        }

        loop {
            let Some(active) = self.active.as_mut() else {
                if !self.advance()? {
                    self.ended = true;
                    return Ok(0);
                }
                continue;
            };
            let read = active
                .stream()
                .read(buf)
                .map_err(|e| SluiceError::transport(active.locator(), e));
            match read {
                Ok(0) => {}
                Ok(n) => {
                    self.pos += n as u64;
                    self.sub_pos += n as u64;
                    trace!(fragment = self.current, bytes = n, pos = self.pos, "Read");
                    return Ok(n);
                }
                Err(e) if e.is_recoverable() && self.mode.is_live() => {
                    warn!(fragment = self.current, error = %e, "Live fragment cut short, moving on");
                    self.active = None;
                }
                Err(e) => return Err(e),
            }

            self.finish_fragment();
            if !self.advance()? {
                debug!(pos = self.pos, "End of stream");
                self.ended = true;
                return Ok(0);
            }
        }
    }

    /// Record the real size of the fragment that just reached EOF.
    fn finish_fragment(&mut self) {
        let size = self.sub_pos.saturating_sub(self.fragment_start_pos);
        if self.index.size(self.current) != Some(size) {
            debug!(fragment = self.current, size, "Refined fragment size");
        }
        self.index.set(self.current, None, Some(size));
    }

    /// Move to the fragment after the current one, extending the timeline
    /// through live continuation when needed. `false` means end of stream.
    fn advance(&mut self) -> Result<bool> {
        let mut next = self.current + 1;
        let mut skipped = 0;
        loop {
            if !self.timeline.contains(next) && !self.extend(next)? {
                return Ok(false);
            }
            match self.open_next(next) {
                Ok(opened) => return Ok(opened),
                Err(e) if e.is_recoverable() && self.bump.is_some() => self.downgrade(next, &e),
                Err(e)
                    if e.is_recoverable()
                        && self.mode == Mode::LiveReget
                        && skipped < self.config.live.max_refresh_retries =>
                {
                    skipped += 1;
                    warn!(fragment = next, error = %e, "Skipping unavailable live fragment");
                    self.index.set(next, None, Some(0));
                    next += 1;
                }
                Err(e)
                    if e.is_recoverable()
                        && self.mode == Mode::Vod
                        && self.timeline.count().is_none() =>
                {
                    debug!(fragment = next, error = %e, "Open-ended timeline exhausted");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn extend(&mut self, slot: u32) -> Result<bool> {
        match self.mode {
            Mode::Vod => Ok(false),
            Mode::LiveBump => Ok(self.extend_by_bump(slot)),
            Mode::LiveReget => self.refresh(),
        }
    }

    fn extend_by_bump(&mut self, slot: u32) -> bool {
        let (Some(bump), Timeline::Listed(entries)) = (self.bump.as_mut(), &mut self.timeline)
        else {
            return false;
        };
        let Some(last) = entries.last() else {
            return false;
        };
        let sequence = last.sequence + 1;
        let duration = last.duration.or(self.manifest.target_duration);
        let Some(locator) = bump.bump() else {
            return false;
        };
        debug!(fragment = slot, locator, "Guessed next live fragment");
        entries.push(ListedFragment {
            sequence,
            locator: locator.to_string(),
            range: None,
            duration,
        });
        self.guessed = Some(slot);
        true
    }

    /// A bump guess failed: never bump again in this session.
    fn downgrade(&mut self, slot: u32, error: &SluiceError) {
        warn!(
            fragment = slot,
            error = %error,
            "Bump guess failed, switching to manifest refresh for the rest of the session"
        );
        if self.guessed == Some(slot)
            && let Timeline::Listed(entries) = &mut self.timeline
        {
            entries.truncate(slot as usize - 1);
        }
        self.guessed = None;
        self.bump = None;
        self.mode = Mode::LiveReget;
    }

    /// Re-fetch the manifest and append what follows the last known
    /// fragment. `false` means the stream has ended.
    fn refresh(&mut self) -> Result<bool> {
        let Timeline::Listed(entries) = &self.timeline else {
            return Ok(false);
        };
        let (expected, last_locator) = match entries.last() {
            Some(last) => (last.sequence + 1, last.locator.clone()),
            None => (self.manifest.sequence_start, String::new()),
        };
        let retries = self.config.live.max_refresh_retries;

        for attempt in 0..=retries {
            if attempt > 0 {
                self.clock.sleep(self.config.live.refresh_interval);
            }
            let fresh = match load_manifest(
                self.transport.as_ref(),
                &self.manifest_locator,
                self.config.manifest_size_limit,
            ) {
                Ok(fresh) => fresh,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, attempt, "Manifest refresh failed");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let fresh_entries = self.listed_entries(&fresh)?;
            let Some(first) = fresh_entries.first().map(|e| e.sequence) else {
                continue;
            };

            let outcome = if fresh.sequence_declared {
                reget::reconcile(expected, first, fresh_entries.len())
            } else {
                reget::reconcile_by_locator(
                    &last_locator,
                    fresh_entries.iter().map(|e| e.locator.as_str()),
                    expected,
                    first,
                )
            };
            match outcome {
                Reconcile::Next(offset) => {
                    debug!(
                        new = fresh_entries.len() - offset,
                        sequence = expected,
                        "Manifest refresh found new fragments"
                    );
                    self.append(fresh_entries, offset);
                    self.manifest = Arc::new(fresh);
                    return Ok(true);
                }
                Reconcile::Discontinuity {
                    expected,
                    first_available,
                } => {
                    let gap = SluiceError::Discontinuity {
                        expected,
                        first_available,
                    };
                    warn!(error = %gap, "Resetting to the first available fragment");
                    self.append(fresh_entries, 0);
                    self.manifest = Arc::new(fresh);
                    return Ok(true);
                }
                Reconcile::Wait if !fresh.live => {
                    info!("Live stream ended");
                    return Ok(false);
                }
                Reconcile::Wait => trace!(attempt, "Manifest has no new fragment yet"),
            }
        }
        info!(retries, "Live manifest stopped advancing, ending stream");
        Ok(false)
    }

    fn listed_entries(&self, manifest: &Manifest) -> Result<Vec<ListedFragment>> {
        match manifest.format {
            ManifestFormat::Flat => Ok(timeline::listed_from_flat(manifest)),
            ManifestFormat::Hierarchical => {
                let id = self.representation.as_ref().map(|r| r.id.as_str());
                let rep = manifest
                    .representations
                    .iter()
                    .find(|r| Some(r.id.as_str()) == id)
                    .ok_or_else(|| {
                        SluiceError::representation_unavailable(format!(
                            "representation {id:?} vanished from the manifest"
                        ))
                    })?;
                let template = rep.template().ok_or_else(|| {
                    SluiceError::representation_unavailable("representation lost its template")
                })?;
                Ok(timeline::expand_timeline(rep, template, manifest))
            }
        }
    }

    fn append(&mut self, fresh: Vec<ListedFragment>, offset: usize) {
        let Timeline::Listed(entries) = &mut self.timeline else {
            return;
        };
        for entry in fresh.into_iter().skip(offset) {
            let slot = entries.len() as u32 + 1;
            self.index
                .set(slot, entry.duration, entry.range.map(|r| r.length));
            entries.push(entry);
        }
    }

    // --- Fragment access ---

    fn target(&mut self, slot: u32) -> Result<Target> {
        if slot == 0 {
            return self
                .init
                .as_ref()
                .map(|init| Target {
                    locator: init.locator.clone(),
                    range: init.range,
                    duration: Some(Duration::ZERO),
                })
                .ok_or_else(|| SluiceError::manifest("stream has no initialization segment"));
        }
        match &mut self.timeline {
            Timeline::Listed(entries) => entries
                .get(slot as usize - 1)
                .map(|entry| Target {
                    locator: entry.locator.clone(),
                    range: entry.range,
                    duration: entry.duration,
                })
                .ok_or_else(|| SluiceError::manifest(format!("fragment {slot} is not listed"))),
            Timeline::Template(template) => Ok(Target {
                locator: template.locator(slot),
                range: None,
                duration: Some(template.duration),
            }),
        }
    }

    /// Open `slot`, waiting for the live edge of templated live streams.
    /// `false` means the edge never reached the fragment.
    fn open_next(&mut self, slot: u32) -> Result<bool> {
        let template_live =
            slot > 0 && self.manifest.live && matches!(self.timeline, Timeline::Template(_));
        if !template_live {
            self.open_slot(slot)?;
            return Ok(true);
        }

        self.wait_for_edge(slot);
        let mut attempts = 0;
        loop {
            match self.open_slot(slot) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_recoverable() && attempts < self.config.live.max_refresh_retries => {
                    attempts += 1;
                    debug!(fragment = slot, attempt = attempts, error = %e, "Fragment not published yet");
                    self.clock.sleep(self.config.live.edge_retry_delay);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(fragment = slot, error = %e, "Live edge stopped advancing");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_for_edge(&self, slot: u32) {
        let (Timeline::Template(template), Some(snapshot)) = (&self.timeline, self.sync.get())
        else {
            return;
        };
        let relative = template.number(slot).saturating_sub(template.start_number);
        if let Some(wait) = snapshot.wait_for(relative, template.duration, self.clock.now()) {
            trace!(fragment = slot, wait_ms = wait.as_millis() as u64, "Waiting for live edge");
            self.clock.sleep(wait);
        }
    }

    fn open_slot(&mut self, slot: u32) -> Result<()> {
        let target = self.target(slot)?;

        let reusable = match self.active.take() {
            Some(Active::Slice(current))
                if current.is_exhausted()
                    && current.locator() == target.locator
                    && target
                        .range
                        .is_some_and(|range| range.offset == current.range().end()) =>
            {
                Some(current.into_inner())
            }
            _ => None,
        };

        let active = match (reusable, target.range) {
            (Some(inner), Some(range)) => {
                trace!(fragment = slot, "Continuing on the open sub-stream");
                Active::Slice(RangeStream::resume(inner, range))
            }
            (_, Some(range)) => {
                let inner = self.transport.open(&target.locator)?;
                let slice = RangeStream::new(inner, range)
                    .map_err(|e| SluiceError::transport(&target.locator, e))?;
                Active::Slice(slice)
            }
            (_, None) => Active::Whole(self.transport.open(&target.locator)?),
        };

        let length = active.length();
        self.index.set(slot, target.duration, length);
        self.fragment_start_pos = self
            .index
            .get_start(slot)
            .map(|start| start.byte_offset)
            .unwrap_or(self.pos);
        self.sub_pos = self.fragment_start_pos;
        self.current = slot;
        self.active = Some(active);
        if self.guessed == Some(slot) {
            self.guessed = None;
        }
        if self.state != SessionState::Seeking {
            self.state = if slot == 0 {
                SessionState::InitSegment
            } else {
                SessionState::Streaming
            };
        }
        debug!(fragment = slot, locator = %target.locator, ?length, "Opened fragment");
        Ok(())
    }

    // --- Seeking ---

    /// Seek to a byte position. Only on-demand streams seek; live sessions
    /// accept a seek to the current position only.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.state == SessionState::Closed {
            return Err(SluiceError::Closed);
        }
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let length = self
                    .get_length()
                    .ok_or_else(|| SluiceError::invalid_seek("stream length is unknown"))?;
                length.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| SluiceError::invalid_seek("position before the start of the stream"))?;

        if target == self.pos {
            return Ok(target);
        }
        if self.mode.is_live() {
            return Err(SluiceError::NotSeekable {
                mode: self.mode.as_str(),
            });
        }

        debug!(from = self.pos, to = target, "Seeking");
        self.state = SessionState::Seeking;
        self.ended = false;
        if target >= self.preview.len() as u64 {
            if !self.preview.is_empty() {
                trace!("Seek left the preview, dropping it");
                self.preview = Bytes::new();
            }
            if let Err(e) = self.reposition(target) {
                self.state = SessionState::Streaming;
                return Err(e);
            }
        }
        self.pos = target;
        self.state = if self.current == 0 {
            SessionState::InitSegment
        } else {
            SessionState::Streaming
        };
        Ok(target)
    }

    /// Seek to a time, in milliseconds, landing on the start of the
    /// fragment that contains it. Returns the new byte position.
    pub fn seek_time(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.state == SessionState::Closed {
            return Err(SluiceError::Closed);
        }
        if self.mode.is_live() {
            return Err(SluiceError::NotSeekable {
                mode: self.mode.as_str(),
            });
        }

        let now_ms = self
            .index
            .get_start(self.current)
            .map_or(0, |start| start.time.as_millis() as u64);
        let target_ms = match pos {
            SeekFrom::Start(ms) => Some(ms),
            SeekFrom::Current(delta) => now_ms.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let total = self
                    .total_duration()
                    .ok_or_else(|| SluiceError::invalid_seek("stream duration is unknown"))?;
                (total.as_millis() as u64).checked_add_signed(delta)
            }
        }
        .ok_or_else(|| SluiceError::invalid_seek("time before the start of the stream"))?;

        let slot = self
            .index
            .find_by_time(Duration::from_millis(target_ms))
            .ok_or_else(|| SluiceError::invalid_seek("stream has no fragments"))?;
        for earlier in 0..slot {
            if self.index.size(earlier).is_none() {
                self.measure(earlier)?;
            }
        }
        let offset = self
            .index
            .get_start(slot)
            .map_or(0, |start| start.byte_offset);
        debug!(target_ms, fragment = slot, offset, "Seeking by time");
        self.seek(SeekFrom::Start(offset))
    }

    /// Point the sub-stream at stream position `target`, refining unknown
    /// fragment sizes on the way.
    fn reposition(&mut self, target: u64) -> Result<()> {
        if self.mode.is_live() {
            return Err(SluiceError::NotSeekable {
                mode: self.mode.as_str(),
            });
        }
        loop {
            let mut slot = self
                .index
                .find_by_byte(target)
                .ok_or_else(|| SluiceError::invalid_seek("stream has no fragments"))?;
            if slot == 0 && self.init.is_none() {
                slot = 1;
            }
            if slot != self.current || self.active.is_none() {
                self.open_slot(slot)?;
            }

            let start = self.fragment_start_pos;
            if let Some(size) = self.index.size(slot)
                && target >= start + size
            {
                let last = self.timeline.count().is_none_or(|count| slot >= count);
                if !last {
                    continue;
                }
                trace!(target, "Seek past the end of the stream");
                self.active = None;
                self.sub_pos = target;
                self.ended = true;
                return Ok(());
            }
            if self.position_within(target.saturating_sub(start))? {
                self.sub_pos = target;
                return Ok(());
            }
        }
    }

    /// Move the current sub-stream to `offset` inside its fragment. `false`
    /// means the fragment turned out shorter; its size has been recorded.
    fn position_within(&mut self, offset: u64) -> Result<bool> {
        let Some(active) = self.active.as_mut() else {
            return Ok(false);
        };
        let locator = active.locator().to_string();
        let stream = active.stream();
        let to_transport = |e: io::Error| SluiceError::transport(&locator, e);

        if stream.length().is_some() {
            stream.seek(SeekFrom::Start(offset)).map_err(to_transport)?;
            return Ok(true);
        }
        stream.seek(SeekFrom::Start(0)).map_err(to_transport)?;
        let skipped = io::copy(&mut stream.take(offset), &mut io::sink()).map_err(to_transport)?;
        if skipped == offset {
            return Ok(true);
        }
        debug!(fragment = self.current, size = skipped, "Fragment shorter than seek offset");
        self.index.set(self.current, None, Some(skipped));
        Ok(false)
    }

    /// Learn the size of `slot` without disturbing the current sub-stream.
    fn measure(&mut self, slot: u32) -> Result<()> {
        let target = self.target(slot)?;
        let size = match target.range {
            Some(range) => range.length,
            None => {
                let mut stream = self.transport.open(&target.locator)?;
                match stream.length() {
                    Some(length) => length,
                    None => io::copy(&mut stream, &mut io::sink())
                        .map_err(|e| SluiceError::transport(&target.locator, e))?,
                }
            }
        };
        debug!(fragment = slot, size, "Measured fragment size");
        self.index.set(slot, target.duration, Some(size));
        Ok(())
    }

    fn total_duration(&self) -> Option<Duration> {
        let last = self.timeline.count()?;
        let start = self.index.get_start(last)?;
        Some(start.time + self.index.duration(last)?)
    }

    // --- Accessors ---

    /// Total stream length, known for on-demand streams once every fragment
    /// size is.
    pub fn get_length(&self) -> Option<u64> {
        if self.mode.is_live() {
            return None;
        }
        let count = self.timeline.count()?;
        if self.index.frag_count() < count + 1 {
            return None;
        }
        self.index.total_bytes()
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.mode.is_live() {
            caps |= Capabilities::LIVE;
        } else {
            caps |= Capabilities::SEEKABLE;
            if self.index.duration(1).is_some() {
                caps |= Capabilities::TIME_SEEKABLE;
            }
        }
        if !self.preview.is_empty() {
            caps |= Capabilities::PREVIEW;
        }
        caps
    }

    pub fn mrl(&self) -> &str {
        &self.mrl
    }

    /// Bytes read at open time; empty once a seek has left them.
    pub fn preview(&self) -> &[u8] {
        &self.preview
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Slot of the current fragment (0 is the initialization segment).
    pub fn current_fragment(&self) -> u32 {
        self.current
    }

    pub fn current_pos(&self) -> u64 {
        self.pos
    }

    /// Number of media fragments, when bounded.
    pub fn fragment_count(&self) -> Option<u32> {
        self.timeline.count()
    }

    pub fn representation(&self) -> Option<&Representation> {
        self.representation.as_ref()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn index(&self) -> &FragmentIndex {
        &self.index
    }

    /// Release the sub-stream, the preview and the fragment index. Reads and
    /// seeks fail afterwards.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.active = None;
        self.preview = Bytes::new();
        self.index = FragmentIndex::new();
        self.state = SessionState::Closed;
        debug!(mrl = %self.mrl, pos = self.pos, "Session closed");
    }
}

impl Read for StreamSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StreamSession::read(self, buf).map_err(Into::into)
    }
}

impl Seek for StreamSession {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        StreamSession::seek(self, pos).map_err(Into::into)
    }
}

fn load_manifest(transport: &dyn Transport, locator: &str, limit: usize) -> Result<Manifest> {
    let body = fetch(transport, locator, limit)?;
    parse_manifest(&body, locator)
}

/// Follow master playlists down to the document that lists fragments,
/// spending one of `hops_remaining` per indirection.
fn resolve_media(
    transport: &dyn Transport,
    config: &SessionConfig,
    locator: &str,
    manifest: Arc<Manifest>,
    hops_remaining: u32,
) -> Result<(String, Arc<Manifest>, Option<Representation>)> {
    if manifest.format == ManifestFormat::Hierarchical {
        let representation = pick_representation(config, &manifest)?;
        return Ok((locator.to_string(), manifest, Some(representation)));
    }
    if !manifest.is_redirect() {
        return Ok((locator.to_string(), manifest, None));
    }
    if hops_remaining == 0 {
        return Err(SluiceError::RedirectLoop {
            locator: locator.to_string(),
            hops: config.max_manifest_hops,
        });
    }

    let representation = pick_representation(config, &manifest)?;
    let reference = representation.playlist().unwrap_or_default();
    let next = locator::resolve(&representation.base_url, reference);
    debug!(from = locator, to = %next, hops_remaining, "Following master playlist");

    let media = load_manifest(transport, &next, config.manifest_size_limit)?;
    let (media_locator, media, inner) =
        resolve_media(transport, config, &next, Arc::new(media), hops_remaining - 1)?;
    Ok((media_locator, media, inner.or(Some(representation))))
}

fn pick_representation(config: &SessionConfig, manifest: &Manifest) -> Result<Representation> {
    let viable: Vec<Representation> = manifest
        .representations
        .iter()
        .filter(|r| match r.template() {
            Some(template) => {
                template.fragment_duration().is_some() || !template.timeline.is_empty()
            }
            None => r.playlist().is_some_and(|uri| !uri.trim().is_empty()),
        })
        .cloned()
        .collect();

    let chosen = select_representation(&config.preference, &viable).ok_or_else(|| {
        SluiceError::representation_unavailable(format!(
            "none of {} representations in {} is usable",
            manifest.representations.len(),
            manifest.base_url
        ))
    })?;
    let representation = viable[chosen].clone();
    info!(
        id = %representation.id,
        width = representation.width,
        height = representation.height,
        bitrate = representation.bitrate,
        kind = ?representation.kind,
        "Selected representation"
    );
    Ok(representation)
}
