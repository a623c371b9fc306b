use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use tracing::{debug, warn};
use crate::{KeyFrameId, MapPointId};

use crate::config::LocalMapperConfig;
use crate::error::{SlamError, SlamResult};
use crate::map::Map;

/// Observations the adjuster judged inconsistent with the refined geometry
/// once it converged (or was aborted). `LocalMapper` owns what happens to
/// them — erasing the observation, and retiring the map point outright if
/// nothing is left to observe it.
#[derive(Debug, Default, Clone)]
pub struct LocalBundleAdjustmentReport {
    pub outlier_observations: Vec<(KeyFrameId, MapPointId)>,
    pub aborted: bool,
}

/// Pluggable nonlinear optimizer boundary. The mapper hands it the local
/// window (the keyframe that triggered the round plus its strong
/// covisibility neighbors), the fixed window (other keyframes that observe
/// the same points but sit outside the local window, held constant), and the
/// map points those keyframes jointly observe. The optimizer's own math is a
/// non-goal — callers only depend on this trait, never a concrete solver.
pub trait OptimizerBridge: Send + Sync {
    fn local_bundle_adjustment(
        &self,
        map: &Map,
        local_keyframes: &[KeyFrameId],
        fixed_keyframes: &[KeyFrameId],
        local_map_points: &[MapPointId],
        abort: &Arc<AtomicBool>,
        cfg: &LocalMapperConfig,
    ) -> SlamResult<LocalBundleAdjustmentReport>;
}

/// Reference `OptimizerBridge`: refines only map-point positions by
/// Gauss-Newton on reprojection error, holding every keyframe pose
/// (local and fixed alike) constant. A full bundle adjuster would also
/// refine the local keyframes' poses; that joint optimization is the
/// non-goal this trait exists to wall off, so this implementation solves
/// the strictly-smaller per-point problem, which is still enough to pull a
/// freshly triangulated point cloud toward consistency with every
/// keyframe that observes it.
pub struct GaussNewtonLocalBundleAdjuster;

impl GaussNewtonLocalBundleAdjuster {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GaussNewtonLocalBundleAdjuster {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerBridge for GaussNewtonLocalBundleAdjuster {
    fn local_bundle_adjustment(
        &self,
        map: &Map,
        _local_keyframes: &[KeyFrameId],
        _fixed_keyframes: &[KeyFrameId],
        local_map_points: &[MapPointId],
        abort: &Arc<AtomicBool>,
        cfg: &LocalMapperConfig,
    ) -> SlamResult<LocalBundleAdjustmentReport> {
        let mut report = LocalBundleAdjustmentReport::default();

        for &mp_id in local_map_points {
            if abort.load(Ordering::Acquire) {
                report.aborted = true;
                break;
            }
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            let observations = mp.observations();
            if observations.len() < 2 {
                continue;
            }

            let mut position = mp.position();
            for _ in 0..cfg.local_ba_max_iterations {
                if abort.load(Ordering::Acquire) {
                    report.aborted = true;
                    break;
                }
                let mut h = Matrix3::zeros();
                let mut b = Vector3::zeros();
                for (&kf_id, &idx) in &observations {
                    let Some(kf) = map.keyframe(kf_id) else { continue };
                    if kf.is_bad() {
                        continue;
                    }
                    let rcw = kf.pose().rotation().to_rotation_matrix().into_inner();
                    let tcw = kf.pose().translation();
                    let p_c = rcw * position.coords + tcw;
                    if p_c.z <= 1e-6 {
                        continue;
                    }
                    let kp = kf.keypoint(idx);
                    let fx = kf.intrinsics.fx;
                    let fy = kf.intrinsics.fy;
                    let inv_z = 1.0 / p_c.z;
                    let predicted_u = fx * p_c.x * inv_z + kf.intrinsics.cx;
                    let predicted_v = fy * p_c.y * inv_z + kf.intrinsics.cy;
                    let residual = nalgebra::Vector2::new(predicted_u - kp.x as f64, predicted_v - kp.y as f64);

                    // d(pixel)/d(camera point), 2x3, chained through R to get d(pixel)/d(world point).
                    let d_cam = nalgebra::Matrix2x3::new(
                        fx * inv_z, 0.0, -fx * p_c.x * inv_z * inv_z, //
                        0.0, fy * inv_z, -fy * p_c.y * inv_z * inv_z,
                    );
                    let jacobian = d_cam * rcw;

                    let weight = kf.scale_levels.inv_level_sigma2[kp.octave as usize] as f64;
                    h += jacobian.transpose() * weight * jacobian;
                    b += jacobian.transpose() * weight * residual;
                }

                let Some(h_inv) = h.try_inverse() else {
                    break;
                };
                let delta = -(h_inv * b);
                if delta.norm() < 1e-9 {
                    position += delta;
                    break;
                }
                position += delta;
            }

            mp.set_position(position);

            for (&kf_id, &idx) in &observations {
                let Some(kf) = map.keyframe(kf_id) else { continue };
                if kf.is_bad() {
                    continue;
                }
                let rcw = kf.pose().rotation().to_rotation_matrix().into_inner();
                let tcw = kf.pose().translation();
                let p_c = rcw * position.coords + tcw;
                if p_c.z <= 1e-6 {
                    report.outlier_observations.push((kf_id, mp_id));
                    continue;
                }
                let kp = kf.keypoint(idx);
                let Some((u, v)) = kf.intrinsics.project(&nalgebra::Point3::from(p_c)) else {
                    report.outlier_observations.push((kf_id, mp_id));
                    continue;
                };
                let sigma2 = kf.scale_levels.level_sigma2[kp.octave as usize] as f64;
                let error = (u - kp.x as f64).powi(2) + (v - kp.y as f64).powi(2);
                if error > cfg.chi2_2dof * sigma2 {
                    report.outlier_observations.push((kf_id, mp_id));
                }
            }

            if report.aborted {
                break;
            }
        }

        if report.aborted {
            debug!(num_outliers = report.outlier_observations.len(), "local bundle adjustment aborted mid-pass");
        }
        if local_map_points.is_empty() {
            warn!("local bundle adjustment invoked with no local map points");
        }
        Ok(report)
    }
}

/// Used by callers that only need to report a hard optimizer failure rather
/// than a partial, abort-carrying report (e.g. a future solver backend that
/// can fail outright rather than merely flag outliers).
pub fn optimization_failed() -> SlamError {
    SlamError::OptimizationFailed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::KeyFrame;
    use crate::map_point::MapPoint;
    use nalgebra::{Point3, UnitQuaternion};
    use std::sync::atomic::AtomicBool;
    use crate::Pose3;
    use crate::{CameraIntrinsics, Descriptor256, Keypoint, ScaleLevels};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        }
    }

    fn keyframe_observing(id: u64, pose: Pose3, u: f64, v: f64) -> Arc<KeyFrame> {
        let kp = Keypoint { x: u as f32, y: v as f32, octave: 0, angle: 0.0 };
        Arc::new(KeyFrame::new(
            KeyFrameId(id),
            id,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            vec![kp],
            vec![Descriptor256::ZERO],
            vec![Some(1.0)],
            pose,
        ))
    }

    #[test]
    fn local_ba_moves_a_perturbed_point_toward_its_observations() {
        let map = Map::new();
        let true_point = Point3::new(0.1, 0.05, 2.0);

        let kf1 = keyframe_observing(0, Pose3::identity(), 0.0, 0.0);
        let (u1, v1) = kf1.intrinsics.project(&true_point).unwrap();
        kf1.set_map_point_at(0, None);
        let kf1 = keyframe_observing(0, Pose3::identity(), u1, v1);

        let pose2 = Pose3::new(Vector3::new(0.2, 0.0, 0.0), UnitQuaternion::identity());
        let p_c2 = pose2.rotation() * true_point.coords + pose2.translation();
        let (u2, v2) = kf1.intrinsics.project(&Point3::from(p_c2)).unwrap();
        let kf2 = keyframe_observing(1, pose2, u2, v2);

        map.add_keyframe(kf1.clone());
        map.add_keyframe(kf2.clone());

        let mp_id = map.next_map_point_id();
        let mp = Arc::new(MapPoint::new(mp_id, kf1.id, true_point + Vector3::new(0.3, -0.2, 0.4), Descriptor256::ZERO));
        mp.add_observation(kf1.id, 0);
        mp.add_observation(kf2.id, 0);
        map.add_map_point(mp.clone());
        kf1.set_map_point_at(0, Some(mp_id));
        kf2.set_map_point_at(0, Some(mp_id));

        let before = (mp.position() - true_point).norm();

        let adjuster = GaussNewtonLocalBundleAdjuster::new();
        let cfg = LocalMapperConfig::default();
        let abort = Arc::new(AtomicBool::new(false));
        let report = adjuster
            .local_bundle_adjustment(&map, &[kf1.id], &[kf2.id], &[mp_id], &abort, &cfg)
            .unwrap();

        let after = (mp.position() - true_point).norm();
        assert!(after < before, "expected refinement to reduce error: before={before} after={after}");
        assert!(!report.aborted);
    }

    #[test]
    fn an_already_set_abort_flag_stops_the_pass_immediately() {
        let map = Map::new();
        let kf1 = keyframe_observing(0, Pose3::identity(), 320.0, 240.0);
        let kf2 = keyframe_observing(1, Pose3::identity(), 320.0, 240.0);
        map.add_keyframe(kf1.clone());
        map.add_keyframe(kf2.clone());

        let mp_id = map.next_map_point_id();
        let mp = Arc::new(MapPoint::new(mp_id, kf1.id, Point3::new(0.0, 0.0, 2.0), Descriptor256::ZERO));
        mp.add_observation(kf1.id, 0);
        mp.add_observation(kf2.id, 0);
        map.add_map_point(mp.clone());

        let adjuster = GaussNewtonLocalBundleAdjuster::new();
        let cfg = LocalMapperConfig::default();
        let abort = Arc::new(AtomicBool::new(true));
        let report = adjuster
            .local_bundle_adjustment(&map, &[kf1.id], &[kf2.id], &[mp_id], &abort, &cfg)
            .unwrap();
        assert!(report.aborted);
    }

    #[test]
    fn points_with_fewer_than_two_observations_are_left_untouched() {
        let map = Map::new();
        let kf1 = keyframe_observing(0, Pose3::identity(), 320.0, 240.0);
        map.add_keyframe(kf1.clone());
        let mp_id = map.next_map_point_id();
        let original = Point3::new(1.0, 1.0, 3.0);
        let mp = Arc::new(MapPoint::new(mp_id, kf1.id, original, Descriptor256::ZERO));
        mp.add_observation(kf1.id, 0);
        map.add_map_point(mp.clone());

        let adjuster = GaussNewtonLocalBundleAdjuster::new();
        let cfg = LocalMapperConfig::default();
        let abort = Arc::new(AtomicBool::new(false));
        adjuster.local_bundle_adjustment(&map, &[kf1.id], &[], &[mp_id], &abort, &cfg).unwrap();
        assert_eq!(mp.position(), original);
    }
}
