use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::{KeyFrameId, MapPointId};

use crate::error::{SlamError, SlamResult};
use crate::keyframe::KeyFrame;
use crate::map_point::MapPoint;

/// Owns the keyframe and map-point sets.
///
/// All mutating operations take the map's exclusive lock; read operations
/// take a shared lock and return owned snapshots, so callers can iterate
/// without holding the lock across a matcher or optimizer call. Erasure is
/// soft: `erase_keyframe`/`erase_map_point` drop membership, not the
/// underlying object, which stays alive as long as any `Arc` clone
/// (obtained from an earlier snapshot) still references it.
pub struct Map {
    keyframes: RwLock<BTreeMap<KeyFrameId, Arc<KeyFrame>>>,
    map_points: RwLock<BTreeMap<MapPointId, Arc<MapPoint>>>,
    reference_points: RwLock<Vec<MapPointId>>,
    next_keyframe_id: AtomicU64,
    next_map_point_id: AtomicU64,
    /// Incremented by loop closure so cache holders (e.g. a tracker's local
    /// copy of reference points) know to invalidate.
    big_change_index: AtomicU64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: RwLock::new(BTreeMap::new()),
            map_points: RwLock::new(BTreeMap::new()),
            reference_points: RwLock::new(Vec::new()),
            next_keyframe_id: AtomicU64::new(0),
            next_map_point_id: AtomicU64::new(0),
            big_change_index: AtomicU64::new(0),
        }
    }

    pub fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId(self.next_keyframe_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_map_point_id(&self) -> MapPointId {
        MapPointId(self.next_map_point_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_keyframe(&self, kf: Arc<KeyFrame>) {
        self.keyframes.write().unwrap().insert(kf.id, kf);
    }

    pub fn add_map_point(&self, mp: Arc<MapPoint>) {
        self.map_points.write().unwrap().insert(mp.id, mp);
    }

    pub fn erase_keyframe(&self, id: KeyFrameId) {
        self.keyframes.write().unwrap().remove(&id);
    }

    pub fn erase_map_point(&self, id: MapPointId) {
        self.map_points.write().unwrap().remove(&id);
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.keyframes.read().unwrap().get(&id).cloned()
    }

    pub fn require_keyframe(&self, id: KeyFrameId) -> SlamResult<Arc<KeyFrame>> {
        self.keyframe(id).ok_or(SlamError::UnknownKeyFrame(id))
    }

    pub fn map_point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        self.map_points.read().unwrap().get(&id).cloned()
    }

    pub fn require_map_point(&self, id: MapPointId) -> SlamResult<Arc<MapPoint>> {
        self.map_point(id).ok_or(SlamError::UnknownMapPoint(id))
    }

    pub fn all_keyframes(&self) -> Vec<Arc<KeyFrame>> {
        self.keyframes.read().unwrap().values().cloned().collect()
    }

    pub fn all_map_points(&self) -> Vec<Arc<MapPoint>> {
        self.map_points.read().unwrap().values().cloned().collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.read().unwrap().len()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.read().unwrap().len()
    }

    pub fn set_reference_map_points(&self, points: Vec<MapPointId>) {
        *self.reference_points.write().unwrap() = points;
    }

    pub fn reference_map_points(&self) -> Vec<MapPointId> {
        self.reference_points.read().unwrap().clone()
    }

    pub fn clear(&self) {
        self.keyframes.write().unwrap().clear();
        self.map_points.write().unwrap().clear();
        self.reference_points.write().unwrap().clear();
    }

    pub fn increment_change_index(&self) {
        self.big_change_index.fetch_add(1, Ordering::Relaxed);
    }

    pub fn change_index(&self) -> u64 {
        self.big_change_index.load(Ordering::Relaxed)
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::KeyFrame;
    use nalgebra::Point3;
    use crate::Pose3;
    use crate::{CameraIntrinsics, Descriptor256, ScaleLevels};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        }
    }

    fn keyframe(map: &Map) -> Arc<KeyFrame> {
        let id = map.next_keyframe_id();
        Arc::new(KeyFrame::new(
            id,
            id.0,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            vec![],
            vec![],
            vec![],
            Pose3::identity(),
        ))
    }

    #[test]
    fn keyframe_ids_are_monotonic_and_unique() {
        let map = Map::new();
        let a = map.next_keyframe_id();
        let b = map.next_keyframe_id();
        assert!(b.0 > a.0);
    }

    #[test]
    fn add_and_fetch_keyframe_round_trips() {
        let map = Map::new();
        let kf = keyframe(&map);
        let id = kf.id;
        map.add_keyframe(kf);
        assert!(map.keyframe(id).is_some());
        assert_eq!(map.num_keyframes(), 1);
    }

    #[test]
    fn erase_keyframe_removes_membership_but_not_outstanding_clones() {
        let map = Map::new();
        let kf = keyframe(&map);
        let id = kf.id;
        map.add_keyframe(kf.clone());
        map.erase_keyframe(id);
        assert!(map.keyframe(id).is_none());
        // the clone obtained before erasure is still a valid, usable object
        assert_eq!(kf.id, id);
    }

    #[test]
    fn require_keyframe_errors_on_unknown_id() {
        let map = Map::new();
        assert!(matches!(
            map.require_keyframe(KeyFrameId(42)),
            Err(SlamError::UnknownKeyFrame(KeyFrameId(42)))
        ));
    }

    #[test]
    fn require_map_point_errors_on_unknown_id() {
        let map = Map::new();
        assert!(matches!(
            map.require_map_point(MapPointId(1)),
            Err(SlamError::UnknownMapPoint(MapPointId(1)))
        ));
    }

    #[test]
    fn add_map_point_is_visible_via_all_map_points() {
        let map = Map::new();
        let id = map.next_map_point_id();
        let mp = Arc::new(MapPoint::new(id, KeyFrameId(0), Point3::new(0.0, 0.0, 1.0), Descriptor256::ZERO));
        map.add_map_point(mp);
        assert_eq!(map.all_map_points().len(), 1);
        assert_eq!(map.num_map_points(), 1);
    }

    #[test]
    fn change_index_increments() {
        let map = Map::new();
        assert_eq!(map.change_index(), 0);
        map.increment_change_index();
        map.increment_change_index();
        assert_eq!(map.change_index(), 2);
    }

    #[test]
    fn clear_empties_all_sets() {
        let map = Map::new();
        let kf = keyframe(&map);
        map.add_keyframe(kf);
        map.set_reference_map_points(vec![MapPointId(0)]);
        map.clear();
        assert_eq!(map.num_keyframes(), 0);
        assert!(map.reference_map_points().is_empty());
    }
}
