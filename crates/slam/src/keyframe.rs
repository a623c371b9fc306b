use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use nalgebra::Point3;
use crate::Pose3;
use crate::{CameraIntrinsics, Descriptor256, KeyFrameId, Keypoint, MapPointId, ScaleLevels, WordId};

const GRID_COLS: usize = 64;
const GRID_ROWS: usize = 48;

/// Bucket index over a keyframe's keypoints by pixel location, built once
/// at construction time and never mutated, matching the invariant that the
/// feature arrays are immutable after a keyframe is created.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    cell_width: f64,
    cell_height: f64,
    cells: Vec<Vec<u32>>,
}

impl FeatureGrid {
    pub(crate) fn build(keypoints: &[Keypoint], width: u32, height: u32) -> Self {
        let cell_width = width as f64 / GRID_COLS as f64;
        let cell_height = height as f64 / GRID_ROWS as f64;
        let mut cells = vec![Vec::new(); GRID_COLS * GRID_ROWS];
        for (i, kp) in keypoints.iter().enumerate() {
            let col = ((kp.x as f64 / cell_width) as usize).min(GRID_COLS - 1);
            let row = ((kp.y as f64 / cell_height) as usize).min(GRID_ROWS - 1);
            cells[row * GRID_COLS + col].push(i as u32);
        }
        Self {
            cell_width,
            cell_height,
            cells,
        }
    }

    /// Feature indices whose keypoint falls within `radius` pixels of
    /// `(x, y)`, optionally filtered to an octave range.
    pub fn features_in_area(
        &self,
        keypoints: &[Keypoint],
        x: f64,
        y: f64,
        radius: f64,
        min_level: Option<u32>,
        max_level: Option<u32>,
    ) -> Vec<u32> {
        let min_col = (((x - radius) / self.cell_width).floor().max(0.0) as usize).min(GRID_COLS - 1);
        let max_col = (((x + radius) / self.cell_width).ceil().max(0.0) as usize).min(GRID_COLS - 1);
        let min_row = (((y - radius) / self.cell_height).floor().max(0.0) as usize).min(GRID_ROWS - 1);
        let max_row = (((y + radius) / self.cell_height).ceil().max(0.0) as usize).min(GRID_ROWS - 1);

        let mut out = Vec::new();
        if min_col > max_col || min_row > max_row {
            return out;
        }
        for row in min_row..=max_row {
            for col in min_col..=max_col {
                for &idx in &self.cells[row * GRID_COLS + col] {
                    let kp = &keypoints[idx as usize];
                    if let Some(min_l) = min_level {
                        if kp.octave < min_l {
                            continue;
                        }
                    }
                    if let Some(max_l) = max_level {
                        if kp.octave > max_l {
                            continue;
                        }
                    }
                    let dx = kp.x as f64 - x;
                    let dy = kp.y as f64 - y;
                    if dx * dx + dy * dy <= radius * radius {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}

/// Bag-of-words weight vector: word id -> weight, supplied by an external
/// vocabulary service.
#[derive(Debug, Clone, Default)]
pub struct BowVector {
    pub weights: BTreeMap<WordId, f32>,
}

/// Bag-of-words feature vector: word id -> indices of the keypoints that
/// quantize to it, used by the merge-join matchers.
#[derive(Debug, Clone, Default)]
pub struct FeatureVector {
    pub indices: BTreeMap<WordId, Vec<u32>>,
}

/// Covisibility and spanning-tree edges owned by a keyframe, guarded by a
/// single lock alongside the rest of the "connections" state named in the
/// concurrency model.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    pub covisibility_weights: BTreeMap<KeyFrameId, u32>,
    pub ordered_neighbors: Vec<(KeyFrameId, u32)>,
    pub parent: Option<KeyFrameId>,
    pub children: BTreeSet<KeyFrameId>,
    pub loop_edges: BTreeSet<KeyFrameId>,
}

/// A tracked frame promoted into the persistent map graph.
pub struct KeyFrame {
    pub id: KeyFrameId,
    pub source_frame_id: u64,
    pub intrinsics: CameraIntrinsics,
    pub scale_levels: ScaleLevels,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor256>,
    /// Per-feature depth in meters, `None` where depth is unavailable.
    depths: Vec<Option<f64>>,
    grid: FeatureGrid,
    /// World -> camera rigid transform (`Tcw` in the original convention).
    pose: RwLock<Pose3>,
    connections: RwLock<Connections>,
    /// feature index -> observing map point, or none.
    features: RwLock<Vec<Option<MapPointId>>>,
    bow: RwLock<BowVector>,
    feature_vector: RwLock<FeatureVector>,
    bad: AtomicBool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        source_frame_id: u64,
        intrinsics: CameraIntrinsics,
        scale_levels: ScaleLevels,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor256>,
        depths: Vec<Option<f64>>,
        pose: Pose3,
    ) -> Self {
        assert_eq!(keypoints.len(), descriptors.len());
        assert_eq!(keypoints.len(), depths.len());
        let grid = FeatureGrid::build(&keypoints, intrinsics.width, intrinsics.height);
        let n = keypoints.len();
        Self {
            id,
            source_frame_id,
            intrinsics,
            scale_levels,
            keypoints,
            descriptors,
            depths,
            grid,
            pose: RwLock::new(pose),
            connections: RwLock::new(Connections::default()),
            features: RwLock::new(vec![None; n]),
            bow: RwLock::new(BowVector::default()),
            feature_vector: RwLock::new(FeatureVector::default()),
            bad: AtomicBool::new(false),
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn keypoint(&self, i: usize) -> &Keypoint {
        &self.keypoints[i]
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptor(&self, i: usize) -> &Descriptor256 {
        &self.descriptors[i]
    }

    pub fn descriptors(&self) -> &[Descriptor256] {
        &self.descriptors
    }

    pub fn depth(&self, i: usize) -> Option<f64> {
        self.depths[i]
    }

    pub fn grid(&self) -> &FeatureGrid {
        &self.grid
    }

    pub fn pose(&self) -> Pose3 {
        *self.pose.read().unwrap()
    }

    pub fn set_pose(&self, pose: Pose3) {
        *self.pose.write().unwrap() = pose;
    }

    /// Camera center in the world frame.
    pub fn camera_center(&self) -> Point3<f64> {
        let t = self.pose().inverse().translation();
        Point3::new(t.x, t.y, t.z)
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn set_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }

    /// Called by the external vocabulary service once features are fixed.
    pub fn set_bow(&self, bow: BowVector, feature_vector: FeatureVector) {
        *self.bow.write().unwrap() = bow;
        *self.feature_vector.write().unwrap() = feature_vector;
    }

    pub fn bow(&self) -> BowVector {
        self.bow.read().unwrap().clone()
    }

    pub fn feature_vector(&self) -> FeatureVector {
        self.feature_vector.read().unwrap().clone()
    }

    pub fn map_point_at(&self, i: usize) -> Option<MapPointId> {
        self.features.read().unwrap()[i]
    }

    pub fn all_map_points(&self) -> Vec<Option<MapPointId>> {
        self.features.read().unwrap().clone()
    }

    pub fn set_map_point_at(&self, i: usize, mp: Option<MapPointId>) {
        self.features.write().unwrap()[i] = mp;
    }

    pub fn connections(&self) -> Connections {
        self.connections.read().unwrap().clone()
    }

    pub fn with_connections_mut<R>(&self, f: impl FnOnce(&mut Connections) -> R) -> R {
        f(&mut self.connections.write().unwrap())
    }

    pub fn covisibility_weight(&self, other: KeyFrameId) -> u32 {
        self.connections
            .read()
            .unwrap()
            .covisibility_weights
            .get(&other)
            .copied()
            .unwrap_or(0)
    }

    /// Top-N covisibility neighbors by descending weight.
    pub fn best_covisibility_neighbors(&self, n: usize) -> Vec<KeyFrameId> {
        self.connections
            .read()
            .unwrap()
            .ordered_neighbors
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn covisibles_by_weight(&self, min_weight: u32) -> Vec<KeyFrameId> {
        self.connections
            .read()
            .unwrap()
            .ordered_neighbors
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn parent(&self) -> Option<KeyFrameId> {
        self.connections.read().unwrap().parent
    }

    pub fn children(&self) -> BTreeSet<KeyFrameId> {
        self.connections.read().unwrap().children.clone()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field("bad", &self.is_bad())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

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

    fn make_keyframe(id: u64, n: usize) -> KeyFrame {
        let keypoints: Vec<Keypoint> = (0..n)
            .map(|i| Keypoint {
                x: (i % 640) as f32,
                y: (i / 640) as f32,
                octave: 0,
                angle: 0.0,
            })
            .collect();
        let descriptors = vec![Descriptor256::ZERO; n];
        let depths = vec![Some(1.0); n];
        KeyFrame::new(
            KeyFrameId(id),
            id,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            keypoints,
            descriptors,
            depths,
            Pose3::new(Vector3::zeros(), UnitQuaternion::identity()),
        )
    }

    #[test]
    fn new_keyframe_starts_with_no_map_points() {
        let kf = make_keyframe(0, 10);
        assert!(kf.all_map_points().iter().all(|mp| mp.is_none()));
    }

    #[test]
    fn set_and_get_map_point_roundtrips() {
        let kf = make_keyframe(0, 10);
        kf.set_map_point_at(3, Some(MapPointId(7)));
        assert_eq!(kf.map_point_at(3), Some(MapPointId(7)));
        assert_eq!(kf.map_point_at(4), None);
    }

    #[test]
    fn set_bad_is_observable() {
        let kf = make_keyframe(0, 1);
        assert!(!kf.is_bad());
        kf.set_bad();
        assert!(kf.is_bad());
    }

    #[test]
    fn feature_grid_finds_nearby_features() {
        let kf = make_keyframe(0, 4);
        // features at (0,0), (1,0), (2,0), (3,0)
        let found = kf.grid().features_in_area(kf.keypoints(), 1.0, 0.0, 1.5, None, None);
        assert!(found.contains(&0));
        assert!(found.contains(&1));
        assert!(found.contains(&2));
        assert!(!found.contains(&3));
    }

    #[test]
    fn feature_grid_respects_octave_filter() {
        let mut kf = make_keyframe(0, 2);
        // promote feature 1 to a different octave via a fresh keyframe
        let keypoints = vec![
            Keypoint { x: 0.0, y: 0.0, octave: 0, angle: 0.0 },
            Keypoint { x: 0.0, y: 0.0, octave: 3, angle: 0.0 },
        ];
        kf = KeyFrame::new(
            KeyFrameId(1),
            1,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            keypoints,
            vec![Descriptor256::ZERO; 2],
            vec![Some(1.0); 2],
            Pose3::identity(),
        );
        let found = kf.grid().features_in_area(kf.keypoints(), 0.0, 0.0, 1.0, Some(0), Some(0));
        assert_eq!(found, vec![0]);
    }

    #[test]
    fn camera_center_matches_translation_for_identity_rotation() {
        let kf = KeyFrame::new(
            KeyFrameId(0),
            0,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            vec![],
            vec![],
            vec![],
            Pose3::new(Vector3::new(1.0, 2.0, 3.0), UnitQuaternion::identity()),
        );
        // Tcw translation (1,2,3) means camera center in world is (-1,-2,-3)
        let center = kf.camera_center();
        assert!((center.x + 1.0).abs() < 1e-9);
        assert!((center.y + 2.0).abs() < 1e-9);
        assert!((center.z + 3.0).abs() < 1e-9);
    }

    #[test]
    fn best_covisibility_neighbors_respects_order() {
        let kf = make_keyframe(0, 1);
        kf.with_connections_mut(|c| {
            c.ordered_neighbors = vec![(KeyFrameId(2), 30), (KeyFrameId(3), 20), (KeyFrameId(4), 10)];
        });
        assert_eq!(kf.best_covisibility_neighbors(2), vec![KeyFrameId(2), KeyFrameId(3)]);
    }

    #[test]
    fn covisibles_by_weight_stops_at_threshold() {
        let kf = make_keyframe(0, 1);
        kf.with_connections_mut(|c| {
            c.ordered_neighbors = vec![(KeyFrameId(2), 30), (KeyFrameId(3), 20), (KeyFrameId(4), 10)];
        });
        assert_eq!(kf.covisibles_by_weight(15), vec![KeyFrameId(2), KeyFrameId(3)]);
    }
}
