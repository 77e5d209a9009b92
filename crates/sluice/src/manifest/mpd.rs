// Hierarchical manifest front-end (MPD): Period -> AdaptationSet ->
// Representation, each representation addressed through a SegmentTemplate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::tree::{NodeId, Tree};
use super::{
    ContentKind, EpochType, LiveTiming, Manifest, ManifestFormat, ManifestParser, Representation,
    RepresentationSource, SegmentTemplate, TimelineSegment, UtcTiming,
};
use crate::error::{Result, SluiceError};
use crate::locator;

#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchicalManifestParser;

impl ManifestParser for HierarchicalManifestParser {
    fn parse(&self, raw: &[u8], base_url: &str) -> Result<Manifest> {
        let tree = Tree::parse(raw)?;
        let root = tree.root();
        if tree.name(root) != "MPD" {
            return Err(SluiceError::manifest(format!(
                "expected MPD root element, found `{}`",
                tree.name(root)
            )));
        }

        let mut manifest = Manifest::new(ManifestFormat::Hierarchical, base_url);
        manifest.live = tree.find("type", root) == "dynamic";
        manifest.timing = parse_timing(&tree, root);

        let mpd_base = join_base(base_url, tree.find("BaseURL", root));

        let Some(period) = tree.child(root, "Period", 0) else {
            return Err(SluiceError::manifest("manifest has no Period"));
        };
        if tree.child(root, "Period", 1).is_some() {
            debug!("Manifest has several periods, only the first one is played");
        }
        if manifest.timing.presentation_duration.is_none() {
            manifest.timing.presentation_duration = parse_iso_duration(tree.find("duration", period));
        }

        let period_base = join_base(&mpd_base, tree.find("BaseURL", period));
        let period_template = TemplateAttributes::read(&tree, period);

        for set_index in 0.. {
            let Some(set) = tree.select(&format!("AdaptationSet[{set_index}]"), period) else {
                break;
            };
            let set_base = join_base(&period_base, tree.find("BaseURL", set));
            let set_template = period_template.clone().merge(TemplateAttributes::read(&tree, set));

            for rep_index in 0.. {
                let Some(rep) = tree.select(&format!("Representation[{rep_index}]"), set) else {
                    break;
                };
                let rep_base = join_base(&set_base, tree.find("BaseURL", rep));
                let attributes = set_template.clone().merge(TemplateAttributes::read(&tree, rep));
                match read_representation(&tree, set, rep, rep_base, attributes) {
                    Some(representation) => manifest.representations.push(representation),
                    None => debug!(
                        adaptation_set = set_index,
                        representation = rep_index,
                        "Skipping representation without segment template"
                    ),
                }
            }
        }

        manifest.sequence_start = manifest
            .representations
            .iter()
            .find_map(|r| r.template().map(|t| t.start_number))
            .unwrap_or(1);
        manifest.sequence_declared = true;

        if manifest.representations.is_empty() {
            return Err(SluiceError::manifest(format!(
                "manifest at {base_url} has no addressable representation"
            )));
        }
        debug!(
            representations = manifest.representations.len(),
            live = manifest.live,
            "Parsed hierarchical manifest"
        );
        Ok(manifest)
    }
}

fn parse_timing(tree: &Tree, root: NodeId) -> LiveTiming {
    let mut timing = LiveTiming {
        availability_start: parse_date(tree.find("availabilityStartTime", root)),
        presentation_duration: parse_iso_duration(tree.find("mediaPresentationDuration", root)),
        suggested_presentation_delay: parse_iso_duration(
            tree.find("suggestedPresentationDelay", root),
        ),
        time_shift_buffer_depth: parse_iso_duration(tree.find("timeShiftBufferDepth", root)),
        minimum_update_period: parse_iso_duration(tree.find("minimumUpdatePeriod", root)),
        utc_timing: None,
    };

    for index in 0.. {
        let Some(node) = tree.child(root, "UTCTiming", index) else {
            break;
        };
        let scheme = tree.find("schemeIdUri", node);
        match EpochType::from_scheme(scheme) {
            Some(epoch_type) => {
                timing.utc_timing = Some(UtcTiming {
                    epoch_type,
                    value: tree.find("value", node).trim().to_string(),
                });
                break;
            }
            None => debug!(scheme, "Ignoring unsupported UTCTiming scheme"),
        }
    }
    timing
}

fn read_representation(
    tree: &Tree,
    set: NodeId,
    rep: NodeId,
    base_url: String,
    attributes: TemplateAttributes,
) -> Option<Representation> {
    let id = tree.find("id", rep).to_string();
    let bitrate = tree.find("bandwidth", rep).parse::<u32>().unwrap_or(0);
    let width = inherited(tree, rep, set, "width").parse::<u32>().unwrap_or(0);
    let height = inherited(tree, rep, set, "height").parse::<u32>().unwrap_or(0);
    let language = Some(tree.find("lang", set))
        .filter(|lang| !lang.is_empty())
        .map(str::to_string);

    let mut kind = ContentKind::from_mime(
        inherited(tree, rep, set, "mimeType"),
        inherited(tree, rep, set, "codecs"),
    );
    if kind.is_empty() {
        kind = match tree.find("contentType", set) {
            "audio" => ContentKind::AUDIO,
            "text" => ContentKind::SUBTITLE,
            _ => ContentKind::VIDEO,
        };
    }

    let template = attributes.into_template(&id, bitrate)?;
    Some(Representation {
        id,
        bitrate,
        width,
        height,
        language,
        kind,
        base_url,
        source: RepresentationSource::Template(template),
    })
}

/// Attribute of the representation, falling back to its adaptation set.
fn inherited<'t>(tree: &'t Tree, rep: NodeId, set: NodeId, name: &str) -> &'t str {
    match tree.find(name, rep) {
        "" => tree.find(name, set),
        value => value,
    }
}

/// SegmentTemplate attributes at one level; lower levels override upper ones
/// attribute by attribute.
#[derive(Debug, Clone, Default)]
struct TemplateAttributes {
    media: Option<String>,
    initialization: Option<String>,
    start_number: Option<u64>,
    duration: Option<u64>,
    timescale: Option<u64>,
    presentation_time_offset: Option<u64>,
    timeline: Option<Vec<TimelineSegment>>,
}

impl TemplateAttributes {
    fn read(tree: &Tree, scope: NodeId) -> Self {
        let Some(node) = tree.child(scope, "SegmentTemplate", 0) else {
            return Self::default();
        };
        let text = |name: &str| Some(tree.find(name, node)).filter(|v| !v.is_empty());
        let number = |name: &str| match text(name).map(str::parse::<u64>) {
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => {
                warn!(attribute = name, "Skipping malformed SegmentTemplate attribute");
                None
            }
            None => None,
        };

        let timeline = tree.child(node, "SegmentTimeline", 0).map(|timeline| {
            let mut entries = Vec::new();
            for index in 0.. {
                let Some(s) = tree.child(timeline, "S", index) else {
                    break;
                };
                let Ok(duration) = tree.find("d", s).parse::<u64>() else {
                    warn!(index, "Skipping SegmentTimeline entry without duration");
                    continue;
                };
                entries.push(TimelineSegment {
                    start: tree.find("t", s).parse().ok(),
                    duration,
                    repeat: tree.find("r", s).parse().unwrap_or(0),
                });
            }
            entries
        });

        Self {
            media: text("media").map(str::to_string),
            initialization: text("initialization").map(str::to_string),
            start_number: number("startNumber"),
            duration: number("duration"),
            timescale: number("timescale"),
            presentation_time_offset: number("presentationTimeOffset"),
            timeline,
        }
    }

    fn merge(self, lower: Self) -> Self {
        Self {
            media: lower.media.or(self.media),
            initialization: lower.initialization.or(self.initialization),
            start_number: lower.start_number.or(self.start_number),
            duration: lower.duration.or(self.duration),
            timescale: lower.timescale.or(self.timescale),
            presentation_time_offset: lower
                .presentation_time_offset
                .or(self.presentation_time_offset),
            timeline: lower.timeline.or(self.timeline),
        }
    }

    fn into_template(self, id: &str, bitrate: u32) -> Option<SegmentTemplate> {
        let bandwidth = bitrate.to_string();
        let fill = |pattern: &str| {
            let pattern = locator::substitute(pattern, "RepresentationID", id);
            locator::substitute(&pattern, "Bandwidth", &bandwidth)
        };

        let media = fill(&self.media?);
        Some(SegmentTemplate {
            init_locator: self.initialization.as_deref().map(fill),
            media_pattern: media,
            start_number: self.start_number.unwrap_or(1),
            fixed_duration: self.duration,
            timescale: self.timescale.filter(|&t| t > 0).unwrap_or(1),
            presentation_time_offset: self.presentation_time_offset.unwrap_or(0),
            timeline: self.timeline.unwrap_or_default(),
        })
    }
}

fn join_base(parent: &str, base: &str) -> String {
    if base.trim().is_empty() {
        parent.to_string()
    } else {
        locator::resolve(parent, base)
    }
}

pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        // xs:dateTime without a zone designator is UTC
        Err(_) => DateTime::parse_from_rfc3339(&format!("{value}Z"))
            .ok()
            .map(|date| date.with_timezone(&Utc)),
    }
}

fn parse_iso_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    iso8601_duration::Duration::parse(value)
        .ok()
        .and_then(|d| d.to_std())
}
