/// Stable identifier for a keyframe stored in the [`Map`](crate::Map).
///
/// Ids are assigned once at insertion and never reused, even after the
/// keyframe is soft-deleted, so stale ids held by a concurrent reader fail a
/// lookup instead of silently resolving to an unrelated keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

/// Stable identifier for a map point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

/// Identifier for a bag-of-words vocabulary entry ("visual word").
///
/// The vocabulary and the quantization step that produces these ids are
/// external to this crate; a [`KeyFrameId`]'s word set is supplied by
/// whatever service owns the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_id_ordering_matches_insertion_order() {
        let mut ids = vec![KeyFrameId(3), KeyFrameId(1), KeyFrameId(2)];
        ids.sort();
        assert_eq!(ids, vec![KeyFrameId(1), KeyFrameId(2), KeyFrameId(3)]);
    }
}
