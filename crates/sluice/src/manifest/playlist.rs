// Flat playlist front-end: line-oriented directives interleaved with bare
// fragment references.
//
// Media playlists are walked by hand so that a single malformed numeric
// field only drops that directive. Master playlists are delegated to m3u8-rs.

use std::time::Duration;

use m3u8_rs::{AlternativeMediaType, MasterPlaylist};
use tracing::{debug, trace, warn};

use super::{
    ByteRange, ContentKind, FragmentRef, Locator, Manifest, ManifestFormat, ManifestParser,
    Representation, RepresentationSource, strip_bom,
};
use crate::error::{Result, SluiceError};

/// Playlists with at least this many fragments and a declared start
/// sequence of 1 are assumed to be on-demand even without a type marker.
///
/// This is a best-effort guess inherited from deployed servers that omit
/// `#EXT-X-PLAYLIST-TYPE`, not something the playlist format guarantees.
pub const VOD_HEURISTIC_MIN_FRAGMENTS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatPlaylistParser;

impl ManifestParser for FlatPlaylistParser {
    fn parse(&self, raw: &[u8], base_url: &str) -> Result<Manifest> {
        let body = strip_bom(raw);
        let text = String::from_utf8_lossy(body);

        let manifest = if text.contains("#EXT-X-STREAM-INF") {
            parse_master(body, base_url)?
        } else {
            parse_media(&text, base_url)
        };

        if manifest.fragments.is_empty() && manifest.representations.is_empty() {
            return Err(SluiceError::manifest(format!(
                "playlist at {base_url} lists no fragments"
            )));
        }
        Ok(manifest)
    }
}

/// Running state of the `#EXT-X-BYTERANGE` continuation rule: a range
/// without offset starts where the previous range of the same resource ended.
#[derive(Default)]
struct RangeCursor {
    resource: Option<String>,
    next_offset: u64,
}

// Not m3u8-rs: it rejects the whole playlist over one malformed tag, while
// here a bad numeric field drops only that directive.
fn parse_media(text: &str, base_url: &str) -> Manifest {
    let mut manifest = Manifest::new(ManifestFormat::Flat, base_url);
    let mut playlist_type: Option<String> = None;
    let mut end_list = false;

    let mut pending_duration: Option<Duration> = None;
    let mut pending_range: Option<(u64, Option<u64>)> = None;
    let mut ranges = RangeCursor::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(directive) = line.strip_prefix('#') else {
            let index = manifest.fragments.len() as u32 + 1;
            let byte_range = pending_range
                .take()
                .map(|(length, offset)| ranges.place(line, length, offset));
            manifest.fragments.push(FragmentRef {
                index,
                locator: Locator::Explicit(line.to_string()),
                duration: pending_duration.take(),
                byte_range,
            });
            continue;
        };

        let (tag, value) = directive.split_once(':').unwrap_or((directive, ""));
        match tag {
            "EXTM3U" => {}
            "EXTINF" => {
                let seconds = value.split(',').next().unwrap_or("").trim();
                match seconds.parse::<f64>() {
                    Ok(secs) if secs >= 0.0 && secs.is_finite() => {
                        pending_duration = Some(Duration::from_secs_f64(secs))
                    }
                    _ => debug!(value, "Skipping EXTINF with unparsable duration"),
                }
            }
            "EXT-X-BYTERANGE" => match parse_byte_range(value) {
                Some(range) => pending_range = Some(range),
                None => debug!(value, "Skipping malformed EXT-X-BYTERANGE"),
            },
            "EXT-X-MEDIA-SEQUENCE" => match value.trim().parse::<u64>() {
                Ok(sequence) => {
                    manifest.sequence_start = sequence;
                    manifest.sequence_declared = true;
                }
                Err(_) => debug!(value, "Skipping malformed EXT-X-MEDIA-SEQUENCE"),
            },
            "EXT-X-TARGETDURATION" => match value.trim().parse::<f64>() {
                Ok(secs) if secs >= 0.0 && secs.is_finite() => {
                    manifest.target_duration = Some(Duration::from_secs_f64(secs))
                }
                _ => debug!(value, "Skipping malformed EXT-X-TARGETDURATION"),
            },
            "EXT-X-PLAYLIST-TYPE" => playlist_type = Some(value.trim().to_ascii_uppercase()),
            "EXT-X-ENDLIST" => end_list = true,
            "EXT-X-DISCONTINUITY" => manifest.discontinuities += 1,
            "EXT-X-MAP" => {
                let attributes = parse_attributes(value);
                let uri = attributes
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("URI"))
                    .map(|(_, v)| v.to_string());
                let Some(uri) = uri else {
                    debug!(value, "Skipping EXT-X-MAP without URI");
                    continue;
                };
                let byte_range = attributes
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("BYTERANGE"))
                    .and_then(|(_, v)| parse_byte_range(v))
                    .map(|(length, offset)| ByteRange {
                        offset: offset.unwrap_or(0),
                        length,
                    });
                manifest.init = Some(FragmentRef {
                    index: 0,
                    locator: Locator::Explicit(uri),
                    duration: Some(Duration::ZERO),
                    byte_range,
                });
            }
            _ => trace!(tag, "Ignoring playlist directive"),
        }
    }

    let explicit_vod = end_list || playlist_type.as_deref() == Some("VOD");
    let heuristic_vod = manifest.fragments.len() >= VOD_HEURISTIC_MIN_FRAGMENTS
        && manifest.sequence_declared
        && manifest.sequence_start == 1;
    if heuristic_vod && !explicit_vod {
        debug!(
            fragments = manifest.fragments.len(),
            "Treating untyped playlist as on-demand"
        );
    }
    manifest.live = !(explicit_vod || heuristic_vod);

    if manifest.discontinuities > 0 {
        debug!(
            count = manifest.discontinuities,
            "Playlist declares discontinuities"
        );
    }
    manifest
}

impl RangeCursor {
    fn place(&mut self, resource: &str, length: u64, offset: Option<u64>) -> ByteRange {
        let offset = match offset {
            Some(offset) => offset,
            None if self.resource.as_deref() == Some(resource) => self.next_offset,
            None => 0,
        };
        self.resource = Some(resource.to_string());
        self.next_offset = offset + length;
        ByteRange { offset, length }
    }
}

/// `<length>[@<offset>]`
fn parse_byte_range(value: &str) -> Option<(u64, Option<u64>)> {
    let value = value.trim().trim_matches('"');
    let (length, offset) = match value.split_once('@') {
        Some((length, offset)) => (length, Some(offset.trim().parse::<u64>().ok()?)),
        None => (value, None),
    };
    Some((length.trim().parse::<u64>().ok()?, offset))
}

/// Split `KEY=VALUE,KEY="VALUE,WITH,COMMAS"` keeping quoted values intact.
fn parse_attributes(rest: &str) -> Vec<(&str, &str)> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&rest[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim(), value))
        })
        .collect()
}

fn parse_master(body: &[u8], base_url: &str) -> Result<Manifest> {
    let master = m3u8_rs::parse_master_playlist_res(body)
        .map_err(|e| SluiceError::manifest(format!("malformed master playlist: {e:?}")))?;

    let mut manifest = Manifest::new(ManifestFormat::Flat, base_url);
    manifest.representations = master_representations(&master, base_url);
    debug!(
        variants = manifest.representations.len(),
        "Parsed master playlist"
    );
    Ok(manifest)
}

fn master_representations(master: &MasterPlaylist, base_url: &str) -> Vec<Representation> {
    let mut representations = Vec::new();

    for (idx, variant) in master.variants.iter().enumerate() {
        if variant.is_i_frame || variant.uri.trim().is_empty() {
            continue;
        }
        let codecs = variant.codecs.as_deref().unwrap_or("");
        let mut kind = ContentKind::from_mime("", codecs);
        if kind.is_empty() {
            kind = ContentKind::VIDEO | ContentKind::AUDIO;
        }
        let (width, height) = variant
            .resolution
            .map(|r| (clamp_u32(r.width), clamp_u32(r.height)))
            .unwrap_or((0, 0));
        representations.push(Representation {
            id: format!("variant-{idx}"),
            bitrate: clamp_u32(variant.bandwidth),
            width,
            height,
            language: None,
            kind,
            base_url: base_url.to_string(),
            source: RepresentationSource::Playlist(variant.uri.clone()),
        });
    }

    for (idx, media) in master.alternatives.iter().enumerate() {
        let Some(uri) = media.uri.as_deref().filter(|u| !u.trim().is_empty()) else {
            continue;
        };
        let kind = match media.media_type {
            AlternativeMediaType::Audio => ContentKind::AUDIO,
            AlternativeMediaType::Subtitles => ContentKind::SUBTITLE,
            AlternativeMediaType::Video => ContentKind::VIDEO,
            _ => {
                warn!(uri, "Ignoring unsupported alternative rendition");
                continue;
            }
        };
        representations.push(Representation {
            id: format!("{}-{idx}", media.group_id),
            bitrate: 0,
            width: 0,
            height: 0,
            language: media.language.clone(),
            kind,
            base_url: base_url.to_string(),
            source: RepresentationSource::Playlist(uri.to_string()),
        });
    }

    representations
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
