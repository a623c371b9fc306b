use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use nalgebra::{Point3, Vector3};
use crate::{Descriptor256, KeyFrameId, MapPointId, ScaleLevels};

/// A triangulated 3-D landmark and the bookkeeping needed to cull, fuse and
/// match it.
pub struct MapPoint {
    pub id: MapPointId,
    pub first_keyframe: KeyFrameId,
    position: RwLock<Point3<f64>>,
    descriptor: RwLock<Descriptor256>,
    normal: RwLock<Vector3<f64>>,
    min_distance: RwLock<f64>,
    max_distance: RwLock<f64>,
    /// keyframe -> observing feature index.
    observations: RwLock<BTreeMap<KeyFrameId, usize>>,
    n_visible: AtomicU32,
    n_found: AtomicU32,
    bad: AtomicBool,
    replaced_by: RwLock<Option<MapPointId>>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        first_keyframe: KeyFrameId,
        position: Point3<f64>,
        descriptor: Descriptor256,
    ) -> Self {
        Self {
            id,
            first_keyframe,
            position: RwLock::new(position),
            descriptor: RwLock::new(descriptor),
            normal: RwLock::new(Vector3::zeros()),
            min_distance: RwLock::new(0.0),
            max_distance: RwLock::new(f64::MAX),
            observations: RwLock::new(BTreeMap::new()),
            n_visible: AtomicU32::new(1),
            n_found: AtomicU32::new(1),
            bad: AtomicBool::new(false),
            replaced_by: RwLock::new(None),
        }
    }

    pub fn position(&self) -> Point3<f64> {
        *self.position.read().unwrap()
    }

    pub fn set_position(&self, p: Point3<f64>) {
        *self.position.write().unwrap() = p;
    }

    pub fn descriptor(&self) -> Descriptor256 {
        *self.descriptor.read().unwrap()
    }

    pub fn set_descriptor(&self, d: Descriptor256) {
        *self.descriptor.write().unwrap() = d;
    }

    pub fn normal(&self) -> Vector3<f64> {
        *self.normal.read().unwrap()
    }

    pub fn distance_bounds(&self) -> (f64, f64) {
        (*self.min_distance.read().unwrap(), *self.max_distance.read().unwrap())
    }

    pub fn set_distance_bounds(&self, min: f64, max: f64) {
        *self.min_distance.write().unwrap() = min;
        *self.max_distance.write().unwrap() = max;
    }

    pub fn set_normal(&self, n: Vector3<f64>) {
        *self.normal.write().unwrap() = n;
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn replaced_by(&self) -> Option<MapPointId> {
        *self.replaced_by.read().unwrap()
    }

    pub fn observations(&self) -> BTreeMap<KeyFrameId, usize> {
        self.observations.read().unwrap().clone()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.read().unwrap().len()
    }

    pub fn observation_at(&self, kf: KeyFrameId) -> Option<usize> {
        self.observations.read().unwrap().get(&kf).copied()
    }

    /// Record that `kf` observes this point at feature index `idx`. Returns
    /// `false` if `kf` already had an observation (caller should not double
    /// count visibility/found in that case).
    pub fn add_observation(&self, kf: KeyFrameId, idx: usize) -> bool {
        self.observations.write().unwrap().insert(kf, idx).is_none()
    }

    /// Remove `kf`'s observation. Returns the number of observations left.
    pub fn erase_observation(&self, kf: KeyFrameId) -> usize {
        let mut obs = self.observations.write().unwrap();
        obs.remove(&kf);
        obs.len()
    }

    pub fn increment_visible(&self, by: u32) {
        self.n_visible.fetch_add(by, Ordering::Relaxed);
    }

    pub fn increment_found(&self, by: u32) {
        self.n_found.fetch_add(by, Ordering::Relaxed);
    }

    pub fn n_visible(&self) -> u32 {
        self.n_visible.load(Ordering::Relaxed)
    }

    pub fn n_found(&self) -> u32 {
        self.n_found.load(Ordering::Relaxed)
    }

    /// `nFound / nVisible`, or 1.0 if never marked visible (never
    /// considered for culling on that basis).
    pub fn found_ratio(&self) -> f64 {
        let visible = self.n_visible();
        if visible == 0 {
            1.0
        } else {
            self.n_found() as f64 / visible as f64
        }
    }

    /// Mark this point `bad`, emptying its observation table. The caller is
    /// responsible for clearing the corresponding `feature->mapPoint`
    /// entries on each observing keyframe.
    pub fn set_bad(&self) -> BTreeMap<KeyFrameId, usize> {
        self.bad.store(true, Ordering::Release);
        std::mem::take(&mut *self.observations.write().unwrap())
    }

    /// Forward this point to `target`, leaving a tombstone. Returns this
    /// point's observation table so the caller can re-home each observing
    /// keyframe's `feature->mapPoint` entry onto `target`.
    pub fn set_replaced_by(&self, target: MapPointId) -> BTreeMap<KeyFrameId, usize> {
        self.bad.store(true, Ordering::Release);
        *self.replaced_by.write().unwrap() = Some(target);
        std::mem::take(&mut *self.observations.write().unwrap())
    }

    /// Resolve a possible chain of `Replace` forwarding to the live target
    /// id, at most one hop per the documented access contract.
    pub fn resolve(&self) -> MapPointId {
        self.replaced_by().unwrap_or(self.id)
    }

    /// Predict the pyramid octave a feature observing this point from
    /// `current_dist` away would land on, given the point's own
    /// scale-invariance distance bounds. Out-of-range predictions are
    /// clamped rather than skipped (see `ScaleLevels::clamp_level`).
    pub fn predict_scale(&self, current_dist: f64, scale_levels: &ScaleLevels) -> usize {
        let (_, max_distance) = self.distance_bounds();
        let ratio = max_distance / current_dist.max(1e-6);
        let log_scale_factor = (*scale_levels.scale_factors.get(1).unwrap_or(&1.2f32) as f64).ln();
        let level = (ratio.max(1e-6).ln() / log_scale_factor).ceil() as i32;
        scale_levels.clamp_level(level)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("bad", &self.is_bad())
            .field("num_observations", &self.num_observations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp() -> MapPoint {
        MapPoint::new(MapPointId(1), KeyFrameId(0), Point3::new(1.0, 2.0, 3.0), Descriptor256::ZERO)
    }

    #[test]
    fn new_map_point_starts_with_found_ratio_one() {
        let p = mp();
        assert_eq!(p.found_ratio(), 1.0);
    }

    #[test]
    fn add_observation_reports_first_insertion() {
        let p = mp();
        assert!(p.add_observation(KeyFrameId(1), 5));
        assert!(!p.add_observation(KeyFrameId(1), 6));
        assert_eq!(p.observation_at(KeyFrameId(1)), Some(6));
    }

    #[test]
    fn found_ratio_tracks_visible_and_found_counters() {
        let p = mp();
        p.increment_visible(3);
        p.increment_found(1);
        // started at 1/1, plus 3 visible and 1 found => 2/4
        assert_eq!(p.found_ratio(), 0.5);
    }

    #[test]
    fn set_bad_empties_observations_and_flags() {
        let p = mp();
        p.add_observation(KeyFrameId(1), 0);
        p.add_observation(KeyFrameId(2), 1);
        let dropped = p.set_bad();
        assert!(p.is_bad());
        assert_eq!(p.num_observations(), 0);
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn replace_leaves_a_resolvable_tombstone() {
        let p = mp();
        p.add_observation(KeyFrameId(1), 0);
        let dropped = p.set_replaced_by(MapPointId(99));
        assert!(p.is_bad());
        assert_eq!(p.resolve(), MapPointId(99));
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn resolve_without_replacement_is_self() {
        let p = mp();
        assert_eq!(p.resolve(), p.id);
    }

    #[test]
    fn predict_scale_is_higher_for_closer_observations() {
        let p = mp();
        p.set_distance_bounds(0.1, 10.0);
        let levels = ScaleLevels::new(8, 1.2);
        let near = p.predict_scale(0.2, &levels);
        let far = p.predict_scale(9.0, &levels);
        assert!(near >= far);
    }

    #[test]
    fn erase_observation_reports_remaining_count() {
        let p = mp();
        p.add_observation(KeyFrameId(1), 0);
        p.add_observation(KeyFrameId(2), 1);
        assert_eq!(p.erase_observation(KeyFrameId(1)), 1);
        assert_eq!(p.erase_observation(KeyFrameId(2)), 0);
    }
}
