//! Representation selection.
//!
//! This is a **nearest fit**, not a "best quality" policy: a caller asking
//! for 720p at 2 Mbit/s gets the rendition closest to that, even when a
//! 1080p one is available. Size distance is measured per axis relative to
//! the preferred dimension; bitrate distance only breaks ties.

use tracing::debug;

use crate::config::Preference;
use crate::manifest::Representation;

const SCALE: u64 = 1_000_000;

/// Pick the representation closest to `preference`.
///
/// Candidates of another kind, and of another language when one is
/// preferred, are only considered when nothing matches. Returns `None` when
/// `candidates` is empty.
pub fn select_representation(
    preference: &Preference,
    candidates: &[Representation],
) -> Option<usize> {
    let best = narrow(preference, candidates).into_iter().min_by_key(|&idx| {
        let candidate = &candidates[idx];
        (
            size_distance(preference, candidate),
            bitrate_distance(preference, candidate),
            idx,
        )
    })?;

    let chosen = &candidates[best];
    debug!(
        id = %chosen.id,
        width = chosen.width,
        height = chosen.height,
        bitrate = chosen.bitrate,
        "Selected representation"
    );
    Some(best)
}

fn narrow(preference: &Preference, candidates: &[Representation]) -> Vec<usize> {
    let all: Vec<usize> = (0..candidates.len()).collect();

    let by_kind: Vec<usize> = all
        .iter()
        .copied()
        .filter(|&i| candidates[i].kind.intersects(preference.kind))
        .collect();
    let pool = if by_kind.is_empty() { all } else { by_kind };

    let Some(wanted) = preference.language.as_deref().map(primary_subtag) else {
        return pool;
    };
    let by_language: Vec<usize> = pool
        .iter()
        .copied()
        .filter(|&i| {
            candidates[i]
                .language
                .as_deref()
                .is_some_and(|lang| primary_subtag(lang).eq_ignore_ascii_case(wanted))
        })
        .collect();
    if by_language.is_empty() { pool } else { by_language }
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag).trim()
}

fn size_distance(preference: &Preference, candidate: &Representation) -> u64 {
    let pref_width = u64::from(preference.width.max(1));
    let pref_height = u64::from(preference.height.max(1));
    let dw = u64::from(candidate.width.abs_diff(preference.width));
    let dh = u64::from(candidate.height.abs_diff(preference.height));
    dw * SCALE / pref_width + dh * SCALE / pref_height
}

fn bitrate_distance(preference: &Preference, candidate: &Representation) -> u32 {
    candidate.bitrate.abs_diff(preference.bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ContentKind, RepresentationSource};

    fn rep(id: &str, width: u32, height: u32, bitrate: u32) -> Representation {
        Representation {
            id: id.to_string(),
            bitrate,
            width,
            height,
            language: None,
            kind: ContentKind::VIDEO,
            base_url: "http://cdn/".to_string(),
            source: RepresentationSource::Playlist(format!("{id}.m3u8")),
        }
    }

    fn audio(id: &str, language: &str) -> Representation {
        Representation {
            kind: ContentKind::AUDIO,
            language: Some(language.to_string()),
            ..rep(id, 0, 0, 128_000)
        }
    }

    #[test]
    fn picks_nearest_fit_not_highest_quality() {
        let candidates = vec![
            rep("360p", 640, 360, 500_000),
            rep("720p", 1280, 720, 1_800_000),
            rep("1080p", 1920, 1080, 4_000_000),
        ];
        let preference = Preference {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            ..Preference::default()
        };
        assert_eq!(select_representation(&preference, &candidates), Some(1));
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert_eq!(select_representation(&Preference::default(), &[]), None);
    }

    #[test]
    fn bitrate_breaks_size_ties_then_first_wins() {
        let candidates = vec![
            rep("a", 1280, 720, 3_000_000),
            rep("b", 1280, 720, 2_100_000),
            rep("c", 1280, 720, 1_900_000),
        ];
        assert_eq!(select_representation(&Preference::default(), &candidates), Some(1));
    }

    #[test]
    fn zero_preference_does_not_divide_by_zero() {
        let candidates = vec![rep("big", 1920, 1080, 0), rep("small", 320, 180, 0)];
        let preference = Preference {
            width: 0,
            height: 0,
            bitrate: 0,
            ..Preference::default()
        };
        assert_eq!(select_representation(&preference, &candidates), Some(1));
    }

    #[test]
    fn prefers_requested_kind_and_language() {
        let candidates = vec![
            rep("video", 1280, 720, 2_000_000),
            audio("en", "en-US"),
            audio("de", "de"),
        ];
        let preference = Preference {
            kind: ContentKind::AUDIO,
            language: Some("DE-at".to_string()),
            ..Preference::default()
        };
        assert_eq!(select_representation(&preference, &candidates), Some(2));

        let preference = Preference {
            kind: ContentKind::AUDIO,
            language: Some("fr".to_string()),
            ..Preference::default()
        };
        assert_eq!(select_representation(&preference, &candidates), Some(1));
    }
}
