// Reget continuation: after re-fetching the manifest, work out where the
// next fragment sits in the fresh listing.

/// Where to continue in a freshly fetched fragment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Continue with the fresh fragment at this offset.
    Next(usize),
    /// The fresh listing has nothing new yet.
    Wait,
    /// The expected fragment is not in the fresh listing; restart from the
    /// first available one.
    Discontinuity { expected: u64, first_available: u64 },
}

/// Reconcile by sequence number.
///
/// `next_sequence` is the absolute sequence number of the fragment the
/// session wants next; the fresh listing declares `fresh_first` and holds
/// `fresh_count` fragments.
pub fn reconcile(next_sequence: u64, fresh_first: u64, fresh_count: usize) -> Reconcile {
    let gap = Reconcile::Discontinuity {
        expected: next_sequence,
        first_available: fresh_first,
    };
    let Some(offset) = next_sequence.checked_sub(fresh_first) else {
        return gap;
    };
    match usize::try_from(offset) {
        Ok(offset) if offset < fresh_count => Reconcile::Next(offset),
        Ok(offset) if offset == fresh_count => Reconcile::Wait,
        _ => gap,
    }
}

/// Reconcile by locator, for playlists that do not declare a sequence.
///
/// `last` is the locator of the last fragment consumed.
pub fn reconcile_by_locator<'a>(
    last: &str,
    fresh: impl IntoIterator<Item = &'a str>,
    expected: u64,
    first_available: u64,
) -> Reconcile {
    let mut count = 0;
    let mut found = None;
    for (idx, locator) in fresh.into_iter().enumerate() {
        if locator == last {
            found = Some(idx);
        }
        count = idx + 1;
    }
    match found {
        Some(idx) if idx + 1 < count => Reconcile::Next(idx + 1),
        Some(_) => Reconcile::Wait,
        None => Reconcile::Discontinuity {
            expected,
            first_available,
        },
    }
}
