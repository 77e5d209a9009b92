// Session-relative fragment numbering.
//
// Slot 0 is the initialization segment, slot k >= 1 the k-th media fragment
// of the session. Listed timelines carry resolved locators; template
// timelines compute them from a fragment number on demand.

use std::time::Duration;

use tracing::warn;

use crate::error::{Result, SluiceError};
use crate::locator::{self, NumberSlot};
use crate::manifest::{ByteRange, Manifest, Representation, SegmentTemplate};

#[derive(Debug, Clone, PartialEq)]
pub(super) struct ListedFragment {
    pub sequence: u64,
    pub locator: String,
    pub range: Option<ByteRange>,
    pub duration: Option<Duration>,
}

#[derive(Debug)]
pub(super) struct TemplateTimeline {
    pattern: String,
    slot: Option<NumberSlot>,
    has_time: bool,
    units: u64,
    presentation_time_offset: u64,
    pub start_number: u64,
    /// Fragment number of slot 1
    pub first_number: u64,
    pub duration: Duration,
    pub count: Option<u32>,
}

impl TemplateTimeline {
    pub fn number(&self, slot: u32) -> u64 {
        self.first_number + u64::from(slot.saturating_sub(1))
    }

    pub fn locator(&mut self, slot: u32) -> String {
        let number = self.number(slot);
        let time = number.saturating_sub(self.start_number) * self.units
            + self.presentation_time_offset;
        match self.slot.as_mut() {
            Some(numbered) => {
                let text = numbered.bind(number);
                if self.has_time {
                    locator::substitute(text, "Time", &time.to_string())
                } else {
                    text.to_string()
                }
            }
            None => locator::unescape_dollars(&locator::substitute(
                &self.pattern,
                "Time",
                &time.to_string(),
            )),
        }
    }
}

#[derive(Debug)]
pub(super) enum Timeline {
    Listed(Vec<ListedFragment>),
    Template(TemplateTimeline),
}

impl Timeline {
    /// Whether media slot `slot` is addressable without live continuation.
    pub fn contains(&self, slot: u32) -> bool {
        if slot == 0 {
            return false;
        }
        match self {
            Timeline::Listed(entries) => slot as usize <= entries.len(),
            Timeline::Template(template) => template.count.is_none_or(|count| slot <= count),
        }
    }

    /// Number of media fragments, when bounded.
    pub fn count(&self) -> Option<u32> {
        match self {
            Timeline::Listed(entries) => Some(entries.len() as u32),
            Timeline::Template(template) => template.count,
        }
    }
}

pub(super) fn listed_from_flat(manifest: &Manifest) -> Vec<ListedFragment> {
    manifest
        .fragments
        .iter()
        .enumerate()
        .map(|(i, fragment)| ListedFragment {
            sequence: manifest.sequence_start + i as u64,
            locator: locator::resolve(&manifest.base_url, fragment.locator.as_str()),
            range: fragment.byte_range,
            duration: fragment.duration,
        })
        .collect()
}

pub(super) fn init_from_flat(manifest: &Manifest) -> Option<ListedFragment> {
    manifest.init.as_ref().map(|init| ListedFragment {
        sequence: 0,
        locator: locator::resolve(&manifest.base_url, init.locator.as_str()),
        range: init.byte_range,
        duration: Some(Duration::ZERO),
    })
}

pub(super) fn init_from_template(
    representation: &Representation,
    template: &SegmentTemplate,
) -> Option<ListedFragment> {
    let init = template.init_locator.as_deref()?;
    Some(ListedFragment {
        sequence: 0,
        locator: locator::unescape_dollars(&locator::resolve(&representation.base_url, init)),
        range: None,
        duration: Some(Duration::ZERO),
    })
}

/// Build the timeline of a templated representation. A `SegmentTimeline`
/// is expanded into a listed timeline.
pub(super) fn from_template(
    representation: &Representation,
    template: &SegmentTemplate,
    manifest: &Manifest,
) -> Result<Timeline> {
    if !template.timeline.is_empty() {
        return Ok(Timeline::Listed(expand_timeline(
            representation,
            template,
            manifest,
        )));
    }

    let units = template.fixed_duration.filter(|&d| d > 0).ok_or_else(|| {
        SluiceError::manifest(format!(
            "representation `{}` has no fragment duration",
            representation.id
        ))
    })?;
    let duration = units_to_duration(units, template.timescale);
    let pattern = locator::resolve(&representation.base_url, &template.media_pattern);
    let slot = NumberSlot::from_template(&pattern, "Number", template.start_number);
    let has_time = locator::has_placeholder(&pattern, "Time");
    if slot.is_none() && !has_time {
        return Err(SluiceError::manifest(format!(
            "media template `{}` has no $Number$ or $Time$ placeholder",
            template.media_pattern
        )));
    }

    let count = if manifest.live {
        None
    } else {
        manifest.timing.presentation_duration.map(|total| {
            let count = total.as_nanos().div_ceil(duration.as_nanos().max(1));
            u32::try_from(count).unwrap_or(u32::MAX)
        })
    };

    Ok(Timeline::Template(TemplateTimeline {
        pattern,
        slot,
        has_time,
        units,
        presentation_time_offset: template.presentation_time_offset,
        start_number: template.start_number,
        first_number: template.start_number,
        duration,
        count,
    }))
}

/// Most fragments one `SegmentTimeline` may expand to.
pub(super) const MAX_TIMELINE_FRAGMENTS: u64 = 100_000;

/// Expand `S@t/@d/@r` entries into explicit fragments.
///
/// Repeats never run past the end of the period when it is known, and the
/// expansion stops at [`MAX_TIMELINE_FRAGMENTS`].
pub(super) fn expand_timeline(
    representation: &Representation,
    template: &SegmentTemplate,
    manifest: &Manifest,
) -> Vec<ListedFragment> {
    let timescale = template.timescale.max(1);
    let period_end = manifest.timing.presentation_duration.map(|total| {
        (total.as_nanos() * u128::from(timescale) / 1_000_000_000) as u64
            + template.presentation_time_offset
    });

    let mut fragments = Vec::new();
    let mut time = 0u64;
    let mut number = template.start_number;
    for (i, segment) in template.timeline.iter().enumerate() {
        if let Some(start) = segment.start {
            time = start;
        }
        let mut repeats = if segment.repeat >= 0 {
            segment.repeat as u64
        } else {
            // repeat until the next entry's start, or the end of the period
            let end = template
                .timeline
                .get(i + 1)
                .and_then(|next| next.start)
                .or(period_end);
            match end {
                Some(end) if end > time && segment.duration > 0 => {
                    (end - time).div_ceil(segment.duration) - 1
                }
                _ => 0,
            }
        };

        if segment.repeat > 0
            && segment.duration > 0
            && let Some(end) = period_end
        {
            let fitting = end
                .saturating_sub(time)
                .div_ceil(segment.duration)
                .saturating_sub(1);
            repeats = repeats.min(fitting);
        }
        let room = MAX_TIMELINE_FRAGMENTS.saturating_sub(fragments.len() as u64);
        if room == 0 {
            warn!(entry = i, "SegmentTimeline too long, dropping the remaining entries");
            break;
        }
        if repeats >= room {
            warn!(entry = i, repeat = segment.repeat, kept = room, "Clamping SegmentTimeline repeat");
            repeats = room - 1;
        }

        for _ in 0..=repeats {
            let media = locator::substitute(&template.media_pattern, "Number", &number.to_string());
            let media = locator::substitute(&media, "Time", &time.to_string());
            fragments.push(ListedFragment {
                sequence: number,
                locator: locator::unescape_dollars(&locator::resolve(
                    &representation.base_url,
                    &media,
                )),
                range: None,
                duration: Some(units_to_duration(segment.duration, timescale)),
            });
            time += segment.duration;
            number += 1;
        }
    }
    fragments
}

fn units_to_duration(units: u64, timescale: u64) -> Duration {
    let nanos = u128::from(units) * 1_000_000_000 / u128::from(timescale.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ContentKind, ManifestFormat, RepresentationSource, TimelineSegment};

    fn template(media: &str) -> SegmentTemplate {
        SegmentTemplate {
            init_locator: Some("init-$$1.mp4".to_string()),
            media_pattern: media.to_string(),
            start_number: 1,
            fixed_duration: Some(4000),
            timescale: 1000,
            presentation_time_offset: 0,
            timeline: Vec::new(),
        }
    }

    fn representation(template: SegmentTemplate) -> Representation {
        Representation {
            id: "v1".to_string(),
            bitrate: 1_000_000,
            width: 1280,
            height: 720,
            language: None,
            kind: ContentKind::VIDEO,
            base_url: "http://cdn/dash/".to_string(),
            source: RepresentationSource::Template(template),
        }
    }

    fn manifest(total_secs: Option<u64>) -> Manifest {
        let mut manifest = Manifest::new(ManifestFormat::Hierarchical, "http://cdn/dash/a.mpd");
        manifest.timing.presentation_duration = total_secs.map(Duration::from_secs);
        manifest
    }

    #[test]
    fn numbered_template_counts_fragments() {
        let rep = representation(template("v1/$Number%04d$.m4s"));
        let tpl = rep.template().unwrap();
        let Timeline::Template(mut timeline) = from_template(&rep, tpl, &manifest(Some(10))).unwrap()
        else {
            panic!("expected template timeline");
        };
        assert_eq!(timeline.count, Some(3));
        assert_eq!(timeline.duration, Duration::from_secs(4));
        assert_eq!(timeline.locator(1), "http://cdn/dash/v1/0001.m4s");
        assert_eq!(timeline.locator(3), "http://cdn/dash/v1/0003.m4s");

        let init = init_from_template(&rep, tpl).unwrap();
        assert_eq!(init.locator, "http://cdn/dash/init-$1.mp4");
    }

    #[test]
    fn time_template_without_timeline() {
        let rep = representation(template("v1/$Time$.m4s"));
        let tpl = rep.template().unwrap();
        let Timeline::Template(mut timeline) = from_template(&rep, tpl, &manifest(None)).unwrap()
        else {
            panic!("expected template timeline");
        };
        assert_eq!(timeline.count, None);
        assert_eq!(timeline.locator(1), "http://cdn/dash/v1/0.m4s");
        assert_eq!(timeline.locator(3), "http://cdn/dash/v1/8000.m4s");
    }

    #[test]
    fn expands_segment_timeline() {
        let mut tpl = template("a/$Time$-$Number$.m4s");
        tpl.fixed_duration = None;
        tpl.timeline = vec![
            TimelineSegment {
                start: Some(100),
                duration: 2000,
                repeat: 1,
            },
            TimelineSegment {
                start: None,
                duration: 1000,
                repeat: -1,
            },
        ];
        let rep = representation(tpl);
        let timeline = from_template(&rep, rep.template().unwrap(), &manifest(Some(7))).unwrap();
        let Timeline::Listed(entries) = timeline else {
            panic!("expected listed timeline");
        };
        let locators: Vec<_> = entries.iter().map(|e| e.locator.as_str()).collect();
        assert_eq!(
            locators,
            [
                "http://cdn/dash/a/100-1.m4s",
                "http://cdn/dash/a/2100-2.m4s",
                "http://cdn/dash/a/4100-3.m4s",
                "http://cdn/dash/a/5100-4.m4s",
                "http://cdn/dash/a/6100-5.m4s",
            ]
        );
        assert_eq!(entries[0].duration, Some(Duration::from_secs(2)));
        assert_eq!(entries[4].sequence, 5);
    }

    fn huge_repeat(total_secs: Option<u64>) -> Vec<ListedFragment> {
        let mut tpl = template("a/$Number$.m4s");
        tpl.fixed_duration = None;
        tpl.timeline = vec![TimelineSegment {
            start: Some(0),
            duration: 1000,
            repeat: 4_000_000_000,
        }];
        let rep = representation(tpl);
        expand_timeline(&rep, rep.template().unwrap(), &manifest(total_secs))
    }

    #[test]
    fn repeats_stop_at_period_end() {
        let entries = huge_repeat(Some(7));
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[6].locator, "http://cdn/dash/a/7.m4s");
    }

    #[test]
    fn unbounded_repeats_are_capped() {
        let entries = huge_repeat(None);
        assert_eq!(entries.len() as u64, MAX_TIMELINE_FRAGMENTS);
        assert_eq!(entries.last().unwrap().sequence, MAX_TIMELINE_FRAGMENTS);
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let rep = representation(template("v1/static.m4s"));
        let err = from_template(&rep, rep.template().unwrap(), &manifest(Some(8))).unwrap_err();
        assert!(matches!(err, SluiceError::Manifest { .. }));
    }
}
