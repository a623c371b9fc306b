use std::sync::RwLock;

use crate::Pose3;
use crate::{CameraIntrinsics, Descriptor256, Keypoint, MapPointId, ScaleLevels};

use crate::keyframe::{BowVector, FeatureGrid, FeatureVector};

/// A feature's candidate map-point slot on a `Frame`, mirroring the tracking
/// front-end's distinction between a point with real map observations
/// (never silently overwritten by a later match) and a temporary point
/// created for a single stereo frame and not yet promoted into the `Map`
/// (fair game for a better match to replace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMapPointSlot {
    None,
    /// Not yet backed by any `Map` observation; a later, better match may
    /// overwrite it.
    Temporary(MapPointId),
    /// Has at least one real observation recorded in the `Map`; matching
    /// never overwrites this slot.
    Tracked(MapPointId),
}

impl FrameMapPointSlot {
    pub fn id(&self) -> Option<MapPointId> {
        match self {
            FrameMapPointSlot::None => None,
            FrameMapPointSlot::Temporary(id) | FrameMapPointSlot::Tracked(id) => Some(*id),
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, FrameMapPointSlot::Tracked(_))
    }
}

/// A single tracked frame, not yet promoted to a `KeyFrame`. Exists only so
/// the `Matcher`'s tracking-frame-projection operations (`SearchByProjection`
/// against the last frame or the local map, `SearchByBoW` against a
/// keyframe) have something to write matches into; the tracking front-end
/// that produces and consumes frames is a non-goal, so this type carries
/// only the fields those matcher operations read or write.
pub struct Frame {
    pub intrinsics: CameraIntrinsics,
    pub scale_levels: ScaleLevels,
    pub pose: Pose3,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor256>,
    grid: FeatureGrid,
    map_points: RwLock<Vec<FrameMapPointSlot>>,
    bow: RwLock<BowVector>,
    feature_vector: RwLock<FeatureVector>,
}

impl Frame {
    pub fn new(
        intrinsics: CameraIntrinsics,
        scale_levels: ScaleLevels,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor256>,
        pose: Pose3,
    ) -> Self {
        assert_eq!(keypoints.len(), descriptors.len());
        let grid = FeatureGrid::build(&keypoints, intrinsics.width, intrinsics.height);
        let n = keypoints.len();
        Self {
            intrinsics,
            scale_levels,
            pose,
            keypoints,
            descriptors,
            grid,
            map_points: RwLock::new(vec![FrameMapPointSlot::None; n]),
            bow: RwLock::new(BowVector::default()),
            feature_vector: RwLock::new(FeatureVector::default()),
        }
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

    pub fn grid(&self) -> &FeatureGrid {
        &self.grid
    }

    pub fn map_point_at(&self, i: usize) -> FrameMapPointSlot {
        self.map_points.read().unwrap()[i]
    }

    pub fn set_map_point_at(&self, i: usize, slot: FrameMapPointSlot) {
        self.map_points.write().unwrap()[i] = slot;
    }

    pub fn all_map_points(&self) -> Vec<FrameMapPointSlot> {
        self.map_points.read().unwrap().clone()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("num_features", &self.num_features()).finish()
    }
}

/// A map point already established as visible to a `Frame` by a prior
/// frustum-culling pass (non-goal: the culling itself lives in the
/// tracking front-end). Carries the two quantities
/// `SearchByProjection(frame, mapPoints, th)` needs to have been
/// precomputed: the predicted pyramid level and the viewing-direction
/// cosine relative to the camera's bearing.
#[derive(Debug, Clone, Copy)]
pub struct FrustumCandidate {
    pub id: MapPointId,
    pub predicted_level: usize,
    pub view_cos: f64,
    pub proj_x: f64,
    pub proj_y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn new_frame_starts_with_no_map_points() {
        let kp = vec![Keypoint { x: 10.0, y: 10.0, octave: 0, angle: 0.0 }];
        let frame = Frame::new(intrinsics(), ScaleLevels::new(8, 1.2), kp, vec![Descriptor256::ZERO], Pose3::identity());
        assert_eq!(frame.map_point_at(0), FrameMapPointSlot::None);
    }

    #[test]
    fn tracked_slot_reports_tracked() {
        let slot = FrameMapPointSlot::Tracked(MapPointId(3));
        assert!(slot.is_tracked());
        assert_eq!(slot.id(), Some(MapPointId(3)));
    }

    #[test]
    fn temporary_slot_is_not_tracked() {
        let slot = FrameMapPointSlot::Temporary(MapPointId(3));
        assert!(!slot.is_tracked());
    }
}
