// Bump continuation: find the decimal token that grows by one between
// neighbouring fragment locators, then keep incrementing it.

use tracing::trace;

use crate::locator::NumberSlot;

/// Discover the incrementing token shared by two consecutive locators.
///
/// The differing window is located through the longest common prefix and
/// suffix, widened to whole digit runs, and accepted only when both sides
/// are decimal and `last == prev + 1`. The returned slot is bound to `last`.
pub fn discover(prev: &str, last: &str) -> Option<NumberSlot> {
    let a = prev.as_bytes();
    let b = last.as_bytes();

    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    // The prefix is shared, so widening left is the same on both sides.
    let mut start = prefix;
    while start > 0 && b[start - 1].is_ascii_digit() {
        start -= 1;
    }
    let mut end_b = b.len() - suffix;
    while end_b < b.len() && b[end_b].is_ascii_digit() {
        end_b += 1;
    }
    let end_a = a.len() - (b.len() - end_b);

    let old = prev.get(start..end_a)?;
    let new = last.get(start..end_b)?;
    let old_value = parse_digits(old)?;
    let new_value = parse_digits(new)?;
    if old_value.checked_add(1) != Some(new_value) {
        trace!(prev, last, "Neighbouring locators do not increment by one");
        return None;
    }

    Some(NumberSlot::new(
        last.to_string(),
        start..end_b,
        new.len(),
        new_value,
    ))
}

/// Locate the right-most digit run of `last` equal to `sequence`.
///
/// Used when only one fragment is listed but the playlist declares its
/// sequence number.
pub fn discover_by_sequence(last: &str, sequence: u64) -> Option<NumberSlot> {
    let bytes = last.as_bytes();
    let mut end = bytes.len();
    while end > 0 {
        if !bytes[end - 1].is_ascii_digit() {
            end -= 1;
            continue;
        }
        let mut start = end;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if parse_digits(&last[start..end]) == Some(sequence) {
            return Some(NumberSlot::new(
                last.to_string(),
                start..end,
                end - start,
                sequence,
            ));
        }
        end = start;
    }
    None
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
