use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};
use crate::{CameraIntrinsics, Descriptor256, Keypoint, MapPointId, ScaleLevels};

use crate::config::LocalMapperConfig;
use crate::frame::{Frame, FrameMapPointSlot, FrustumCandidate};
use crate::keyframe::KeyFrame;
use crate::map::Map;
use crate::map_point::MapPoint;

/// A 3-D similarity transform (scale + rotation + translation), used only by
/// the loop-closing hand-off operations (`SearchBySim3`, the `Scw` variant
/// of `Fuse`). The loop closer that produces these is a non-goal; this type
/// exists so those two operations have something to take as an argument.
#[derive(Debug, Clone, Copy)]
pub struct Sim3 {
    pub scale: f64,
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Sim3 {
    pub fn new(scale: f64, rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { scale, rotation, translation }
    }

    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.scale * (self.rotation * p.coords) + self.translation)
    }

    pub fn inverse(&self) -> Sim3 {
        let inv_scale = 1.0 / self.scale;
        let inv_rotation = self.rotation.inverse();
        let translation = -(inv_scale * (inv_rotation * self.translation));
        Sim3 {
            scale: inv_scale,
            rotation: inv_rotation,
            translation,
        }
    }
}

/// Orientation-consistency histogram used by every matcher operation that
/// checks rotation consistency: bucket each accepted match by its angle
/// difference, then after the pass keep only matches whose bucket is among
/// the three largest (discarding the 2nd/3rd largest if they fall below 10%
/// of the largest). Ties in bucket counts favor the earlier bucket index.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new(length: usize) -> Self {
        Self {
            bins: vec![Vec::new(); length.max(1)],
        }
    }

    /// Record `payload` (an opaque index the caller can use to undo this
    /// match later) under the bucket for `angle_diff_deg`.
    fn add(&mut self, angle_diff_deg: f64, payload: usize) -> usize {
        let len = self.bins.len();
        let mut rot = angle_diff_deg % 360.0;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot * len as f64 / 360.0).round() as usize;
        if bin >= len {
            bin = 0;
        }
        self.bins[bin].push(payload);
        bin
    }

    fn keep_bins(&self) -> BTreeSet<usize> {
        three_maxima(&self.bins)
    }

    fn rejected_payloads(&self, keep: &BTreeSet<usize>) -> Vec<usize> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(i, _)| !keep.contains(i))
            .flat_map(|(_, v)| v.iter().copied())
            .collect()
    }
}

/// The three largest histogram bins, discarding the 2nd/3rd if their count
/// is under 10% of the largest. Bucket counts are compared with strict `>`,
/// so the earliest bucket wins any tie.
fn three_maxima(bins: &[Vec<usize>]) -> BTreeSet<usize> {
    let mut max1 = 0i64;
    let mut max2 = 0i64;
    let mut max3 = 0i64;
    let mut ind1 = -1i32;
    let mut ind2 = -1i32;
    let mut ind3 = -1i32;
    for (i, bin) in bins.iter().enumerate() {
        let s = bin.len() as i64;
        if s > max1 {
            max3 = max2;
            max2 = max1;
            max1 = s;
            ind3 = ind2;
            ind2 = ind1;
            ind1 = i as i32;
        } else if s > max2 {
            max3 = max2;
            max2 = s;
            ind3 = ind2;
            ind2 = i as i32;
        } else if s > max3 {
            max3 = s;
            ind3 = i as i32;
        }
    }
    if (max2 as f64) < 0.1 * max1 as f64 {
        ind2 = -1;
        ind3 = -1;
    } else if (max3 as f64) < 0.1 * max1 as f64 {
        ind3 = -1;
    }
    [ind1, ind2, ind3].into_iter().filter(|i| *i >= 0).map(|i| i as usize).collect()
}

fn camera_matrix(k: &CameraIntrinsics) -> Matrix3<f64> {
    Matrix3::new(k.fx, 0.0, k.cx, 0.0, k.fy, k.cy, 0.0, 0.0, 1.0)
}

/// Fundamental matrix from `kf1` to `kf2`, used by `SearchForTriangulation`'s
/// epipolar-line test.
pub fn compute_f12(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
    let r1 = kf1.pose().rotation();
    let t1 = kf1.pose().translation();
    let r2 = kf2.pose().rotation();
    let t2 = kf2.pose().translation();
    let r12 = r1 * r2.inverse();
    let t12 = t1 - r12 * t2;
    let k1_inv_t = camera_matrix(&kf1.intrinsics).try_inverse().expect("camera matrix is invertible").transpose();
    let k2_inv = camera_matrix(&kf2.intrinsics).try_inverse().expect("camera matrix is invertible");
    k1_inv_t * crate::skew_symmetric(&t12) * r12.to_rotation_matrix().into_inner() * k2_inv
}

/// `kp2`'s squared distance to the epipolar line `F12 . [kp1.x kp1.y 1]^T`,
/// accepted when below `chi2_1dof * sigma2` for `kp2`'s octave.
fn check_dist_epipolar_line(kp1: &Keypoint, kp2: &Keypoint, f12: &Matrix3<f64>, scale_levels2: &ScaleLevels, chi2_1dof: f64) -> bool {
    let x1 = kp1.x as f64;
    let y1 = kp1.y as f64;
    let a = x1 * f12[(0, 0)] + y1 * f12[(1, 0)] + f12[(2, 0)];
    let b = x1 * f12[(0, 1)] + y1 * f12[(1, 1)] + f12[(2, 1)];
    let c = x1 * f12[(0, 2)] + y1 * f12[(1, 2)] + f12[(2, 2)];
    let num = a * kp2.x as f64 + b * kp2.y as f64 + c;
    let den = a * a + b * b;
    if den <= 0.0 {
        return false;
    }
    let sigma2 = scale_levels2.level_sigma2[kp2.octave as usize] as f64;
    num * num / den < chi2_1dof * sigma2
}

/// Recompute a map point's representative descriptor as the median (by
/// Hamming distance) of its current observations' descriptors.
pub(crate) fn refresh_descriptor(map: &Map, mp: &MapPoint) {
    let descriptors: Vec<Descriptor256> = mp
        .observations()
        .into_iter()
        .filter_map(|(kf_id, idx)| map.keyframe(kf_id).map(|kf| *kf.descriptor(idx)))
        .collect();
    if let Some(d) = Descriptor256::median_of(&descriptors) {
        mp.set_descriptor(d);
    }
}

/// Recompute a map point's mean viewing-direction normal and its
/// scale-invariance distance bounds from its current observations,
/// preferring the first observing keyframe as the distance reference.
pub(crate) fn refresh_normal_and_depth(map: &Map, mp: &MapPoint) {
    let obs = mp.observations();
    if obs.is_empty() {
        return;
    }
    let position = mp.position();
    let mut normal_sum = Vector3::zeros();
    let mut reference: Option<Arc<KeyFrame>> = None;
    let mut reference_idx = 0usize;
    for (&kf_id, &idx) in &obs {
        let Some(kf) = map.keyframe(kf_id) else { continue };
        let center = kf.camera_center();
        let to_point = position - center;
        let n = to_point.norm();
        if n > 1e-9 {
            normal_sum += to_point / n;
        }
        if reference.is_none() || kf_id == mp.first_keyframe {
            reference_idx = idx;
            reference = Some(kf);
        }
    }
    mp.set_normal(normal_sum / obs.len() as f64);
    if let Some(kf) = reference {
        let dist = (position - kf.camera_center()).norm();
        let octave = kf.keypoint(reference_idx).octave as usize;
        let n_levels = kf.scale_levels.num_levels();
        let max_d = dist * kf.scale_levels.scale_factors[octave] as f64;
        let min_d = max_d / kf.scale_levels.scale_factors[n_levels - 1] as f64;
        mp.set_distance_bounds(min_d, max_d);
    }
}

/// Forward `loser`'s observations onto `winner` and leave `loser` a
/// resolvable tombstone, mirroring `MapPoint::Replace`: a keyframe that
/// already observes `winner` simply drops its slot for `loser` instead of
/// double-observing; `winner`'s visibility/found counters and descriptor are
/// refreshed afterward.
pub(crate) fn replace_map_point(map: &Map, loser_id: MapPointId, winner_id: MapPointId) {
    if loser_id == winner_id {
        return;
    }
    let Some(loser) = map.map_point(loser_id) else { return };
    let Some(winner) = map.map_point(winner_id) else { return };
    let n_visible = loser.n_visible();
    let n_found = loser.n_found();
    let dropped = loser.set_replaced_by(winner_id);
    for (kf_id, idx) in dropped {
        let Some(kf) = map.keyframe(kf_id) else { continue };
        if winner.observation_at(kf_id).is_some() {
            kf.set_map_point_at(idx, None);
        } else {
            kf.set_map_point_at(idx, Some(winner_id));
            winner.add_observation(kf_id, idx);
        }
    }
    winner.increment_visible(n_visible);
    winner.increment_found(n_found);
    refresh_descriptor(map, &winner);
}

/// Pure geometric/descriptor matcher. Stateless except for the two
/// construction parameters every operation shares: the nearest-neighbor
/// ratio and whether to apply the orientation-consistency filter. All
/// distance thresholds and chi-squared gates come from the caller's
/// [`LocalMapperConfig`] rather than being baked into the matcher.
pub struct Matcher {
    nn_ratio: f64,
    check_orientation: bool,
}

impl Matcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self { nn_ratio, check_orientation }
    }

    /// Project `last`'s map points into `current` using `current`'s pose,
    /// classifying the motion as forward/backward/neither to pick a
    /// search-window octave range, and match by descriptor with the ratio
    /// and orientation tests. Returns the number of features newly matched
    /// on `current`.
    pub fn search_by_projection_last_frame(&self, current: &Frame, last: &Frame, map: &Map, cfg: &LocalMapperConfig, th: f64) -> usize {
        let rcw = current.pose.rotation();
        let tcw = current.pose.translation();
        let twc = current.pose.inverse().translation();
        let rlw = last.pose.rotation();
        let tlw = last.pose.translation();
        let tlc = rlw * twc + tlw;
        let forward = tlc.z > cfg.projection_motion_threshold;
        let backward = -tlc.z > cfg.projection_motion_threshold;

        let mut matched = 0usize;
        let mut hist = RotationHistogram::new(cfg.histo_length);
        for i in 0..last.num_features() {
            let Some(mp_id) = last.map_point_at(i).id() else { continue };
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            let p_c = Point3::from(rcw * mp.position().coords + tcw);
            if p_c.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = current.intrinsics.project(&p_c) else { continue };
            if !current.intrinsics.in_bounds(u, v) {
                continue;
            }
            let last_octave = last.keypoint(i).octave;
            let radius = th * last.scale_levels.scale_factors[last_octave as usize] as f64;
            let (min_level, max_level) = if forward {
                (Some(last_octave), None)
            } else if backward {
                (Some(0), Some(last_octave))
            } else {
                (Some(last_octave.saturating_sub(1)), Some(last_octave + 1))
            };
            let candidates = current.grid().features_in_area(current.keypoints(), u, v, radius, min_level, max_level);
            if candidates.is_empty() {
                continue;
            }
            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx2 in candidates {
                let idx2 = idx2 as usize;
                if current.map_point_at(idx2).is_tracked() {
                    continue;
                }
                let dist = descriptor.hamming_distance(current.descriptor(idx2));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx2);
                }
            }
            if best_dist > cfg.th_high {
                continue;
            }
            let Some(idx2) = best_idx else { continue };
            current.set_map_point_at(idx2, FrameMapPointSlot::Tracked(mp_id));
            matched += 1;
            if self.check_orientation {
                hist.add(last.keypoint(i).angle as f64 - current.keypoint(idx2).angle as f64, idx2);
            }
        }
        if self.check_orientation {
            let keep = hist.keep_bins();
            for idx2 in hist.rejected_payloads(&keep) {
                current.set_map_point_at(idx2, FrameMapPointSlot::None);
                matched -= 1;
            }
        }
        matched
    }

    /// Match `frame` against a pre-frustum-culled candidate list from the
    /// local map. Each candidate already carries its predicted pyramid
    /// level and viewing cosine (frustum culling itself is the tracking
    /// front-end's job, out of scope here).
    pub fn search_by_projection_local_map(&self, frame: &Frame, candidates: &[FrustumCandidate], map: &Map, cfg: &LocalMapperConfig, th: f64) -> usize {
        let mut matched = 0usize;
        for cand in candidates {
            let Some(mp) = map.map_point(cand.id) else { continue };
            if mp.is_bad() {
                continue;
            }
            let radius_base = if cand.view_cos > 0.998 { 2.5 } else { 4.0 };
            let radius = radius_base * th * frame.scale_levels.scale_factors[cand.predicted_level] as f64;
            let min_level = cand.predicted_level.saturating_sub(1) as u32;
            let max_level = (cand.predicted_level + 1) as u32;
            let feats = frame.grid().features_in_area(frame.keypoints(), cand.proj_x, cand.proj_y, radius, Some(min_level), Some(max_level));
            if feats.is_empty() {
                continue;
            }
            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_level = 0u32;
            let mut second_dist = u32::MAX;
            let mut second_level = 0u32;
            let mut best_idx = None;
            for idx in feats {
                let idx = idx as usize;
                if frame.map_point_at(idx).is_tracked() {
                    continue;
                }
                let kp = frame.keypoint(idx);
                let dist = descriptor.hamming_distance(frame.descriptor(idx));
                if dist < best_dist {
                    second_dist = best_dist;
                    second_level = best_level;
                    best_dist = dist;
                    best_level = kp.octave;
                    best_idx = Some(idx);
                } else if dist < second_dist {
                    second_dist = dist;
                    second_level = kp.octave;
                }
            }
            if best_dist > cfg.th_high {
                continue;
            }
            if best_level == second_level && (best_dist as f64) > self.nn_ratio * second_dist as f64 {
                continue;
            }
            if let Some(idx) = best_idx {
                frame.set_map_point_at(idx, FrameMapPointSlot::Tracked(cand.id));
                matched += 1;
            }
        }
        matched
    }

    /// Merge-join `keyframe` and `frame`'s feature vectors on word id,
    /// matching within each shared word; each frame feature matches at
    /// most once.
    pub fn search_by_bow_frame(&self, keyframe: &KeyFrame, frame: &Frame, map: &Map, cfg: &LocalMapperConfig) -> usize {
        let kf_fv = keyframe.feature_vector();
        let frame_fv = frame.feature_vector();
        let mut matched = 0usize;
        let mut used2: BTreeSet<usize> = BTreeSet::new();
        let mut hist = RotationHistogram::new(cfg.histo_length);

        for (word, idxs1) in &kf_fv.indices {
            let Some(idxs2) = frame_fv.indices.get(word) else { continue };
            for &idx1 in idxs1 {
                let idx1 = idx1 as usize;
                let Some(mp_id) = keyframe.map_point_at(idx1) else { continue };
                if map.map_point(mp_id).map(|mp| mp.is_bad()).unwrap_or(true) {
                    continue;
                }
                let d1 = keyframe.descriptor(idx1);
                let mut best_dist = u32::MAX;
                let mut second_dist = u32::MAX;
                let mut best_idx2 = None;
                for &idx2 in idxs2 {
                    let idx2 = idx2 as usize;
                    if used2.contains(&idx2) {
                        continue;
                    }
                    let dist = d1.hamming_distance(frame.descriptor(idx2));
                    if dist < best_dist {
                        second_dist = best_dist;
                        best_dist = dist;
                        best_idx2 = Some(idx2);
                    } else if dist < second_dist {
                        second_dist = dist;
                    }
                }
                if best_dist > cfg.th_low {
                    continue;
                }
                if (best_dist as f64) >= self.nn_ratio * second_dist as f64 {
                    continue;
                }
                let Some(idx2) = best_idx2 else { continue };
                used2.insert(idx2);
                frame.set_map_point_at(idx2, FrameMapPointSlot::Tracked(mp_id));
                matched += 1;
                if self.check_orientation {
                    hist.add(keyframe.keypoint(idx1).angle as f64 - frame.keypoint(idx2).angle as f64, idx2);
                }
            }
        }
        if self.check_orientation {
            let keep = hist.keep_bins();
            for idx2 in hist.rejected_payloads(&keep) {
                frame.set_map_point_at(idx2, FrameMapPointSlot::None);
                matched -= 1;
            }
        }
        matched
    }

    /// Symmetric keyframe-to-keyframe variant: `out[i1]` is `kf2`'s map
    /// point matched to `kf1`'s feature `i1`, each `kf2` feature consumed
    /// at most once.
    pub fn search_by_bow_keyframes(&self, kf1: &KeyFrame, kf2: &KeyFrame, map: &Map, cfg: &LocalMapperConfig) -> Vec<Option<MapPointId>> {
        let fv1 = kf1.feature_vector();
        let fv2 = kf2.feature_vector();
        let mut out: Vec<Option<MapPointId>> = vec![None; kf1.num_features()];
        let mut used2: BTreeSet<usize> = BTreeSet::new();
        let mut hist = RotationHistogram::new(cfg.histo_length);

        for (word, idxs1) in &fv1.indices {
            let Some(idxs2) = fv2.indices.get(word) else { continue };
            for &idx1 in idxs1 {
                let idx1 = idx1 as usize;
                let Some(mp1_id) = kf1.map_point_at(idx1) else { continue };
                if map.map_point(mp1_id).map(|mp| mp.is_bad()).unwrap_or(true) {
                    continue;
                }
                let d1 = kf1.descriptor(idx1);
                let mut best_dist = u32::MAX;
                let mut second_dist = u32::MAX;
                let mut best_idx2 = None;
                for &idx2 in idxs2 {
                    let idx2 = idx2 as usize;
                    if used2.contains(&idx2) {
                        continue;
                    }
                    let Some(mp2_id) = kf2.map_point_at(idx2) else { continue };
                    if map.map_point(mp2_id).map(|mp| mp.is_bad()).unwrap_or(true) {
                        continue;
                    }
                    let dist = d1.hamming_distance(kf2.descriptor(idx2));
                    if dist < best_dist {
                        second_dist = best_dist;
                        best_dist = dist;
                        best_idx2 = Some(idx2);
                    } else if dist < second_dist {
                        second_dist = dist;
                    }
                }
                if best_dist > cfg.th_low {
                    continue;
                }
                if (best_dist as f64) >= self.nn_ratio * second_dist as f64 {
                    continue;
                }
                let Some(idx2) = best_idx2 else { continue };
                let Some(mp2_id) = kf2.map_point_at(idx2) else { continue };
                used2.insert(idx2);
                out[idx1] = Some(mp2_id);
                if self.check_orientation {
                    hist.add(kf1.keypoint(idx1).angle as f64 - kf2.keypoint(idx2).angle as f64, idx1);
                }
            }
        }
        if self.check_orientation {
            let keep = hist.keep_bins();
            for idx1 in hist.rejected_payloads(&keep) {
                out[idx1] = None;
            }
        }
        out
    }

    /// Relocalization variant: match `kf`'s map points (excluding
    /// `already_found`) into `frame`, predicting the search octave from the
    /// point's own scale-invariance distance bounds.
    pub fn search_by_projection_relocalization(
        &self,
        frame: &Frame,
        kf: &KeyFrame,
        already_found: &BTreeSet<MapPointId>,
        map: &Map,
        cfg: &LocalMapperConfig,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let rcw = frame.pose.rotation();
        let tcw = frame.pose.translation();
        let ow = frame.pose.inverse().translation();
        let mut matched = 0usize;
        let mut hist = RotationHistogram::new(cfg.histo_length);

        for i in 0..kf.num_features() {
            let Some(mp_id) = kf.map_point_at(i) else { continue };
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            let p_world = mp.position();
            let p_c = Point3::from(rcw * p_world.coords + tcw);
            if p_c.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = frame.intrinsics.project(&p_c) else { continue };
            if !frame.intrinsics.in_bounds(u, v) {
                continue;
            }
            let (min_d, max_d) = mp.distance_bounds();
            let dist3d = (p_world - ow).norm();
            if dist3d < min_d || dist3d > max_d {
                continue;
            }
            let predicted = mp.predict_scale(dist3d, &frame.scale_levels);
            let radius = th * frame.scale_levels.scale_factors[predicted] as f64;
            let candidates = frame.grid().features_in_area(
                frame.keypoints(),
                u,
                v,
                radius,
                Some(predicted.saturating_sub(1) as u32),
                Some((predicted + 1) as u32),
            );
            if candidates.is_empty() {
                continue;
            }
            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx2 in candidates {
                let idx2 = idx2 as usize;
                if !matches!(frame.map_point_at(idx2), FrameMapPointSlot::None) {
                    continue;
                }
                let dist = descriptor.hamming_distance(frame.descriptor(idx2));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx2);
                }
            }
            if best_dist > orb_dist {
                continue;
            }
            let Some(idx2) = best_idx else { continue };
            frame.set_map_point_at(idx2, FrameMapPointSlot::Tracked(mp_id));
            matched += 1;
            if self.check_orientation {
                hist.add(kf.keypoint(i).angle as f64 - frame.keypoint(idx2).angle as f64, idx2);
            }
        }
        if self.check_orientation {
            let keep = hist.keep_bins();
            for idx2 in hist.rejected_payloads(&keep) {
                frame.set_map_point_at(idx2, FrameMapPointSlot::None);
                matched -= 1;
            }
        }
        matched
    }

    /// Propose new triangulation pairs between `kf1` and `kf2`: features on
    /// both sides with no existing map point, joined by shared word,
    /// filtered by epipolar-line distance and epipole proximity.
    pub fn search_for_triangulation(
        &self,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        f12: &Matrix3<f64>,
        cfg: &LocalMapperConfig,
        stereo_only: bool,
    ) -> Vec<(usize, usize)> {
        let fv1 = kf1.feature_vector();
        let fv2 = kf2.feature_vector();

        let r2 = kf2.pose().rotation();
        let t2 = kf2.pose().translation();
        let c1_in_kf2 = Point3::from(r2 * kf1.camera_center().coords + t2);
        let epipole = kf2.intrinsics.project(&c1_in_kf2).unwrap_or((0.0, 0.0));

        let mut used2: BTreeSet<usize> = BTreeSet::new();
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut hist = RotationHistogram::new(cfg.histo_length);

        for (word, idxs1) in &fv1.indices {
            let Some(idxs2) = fv2.indices.get(word) else { continue };
            for &idx1 in idxs1 {
                let idx1 = idx1 as usize;
                if kf1.map_point_at(idx1).is_some() {
                    continue;
                }
                if stereo_only && kf1.depth(idx1).is_none() {
                    continue;
                }
                let d1 = kf1.descriptor(idx1);
                let kp1 = kf1.keypoint(idx1);
                let mut best_dist = u32::MAX;
                let mut best_idx2 = None;
                for &idx2 in idxs2 {
                    let idx2 = idx2 as usize;
                    if used2.contains(&idx2) || kf2.map_point_at(idx2).is_some() {
                        continue;
                    }
                    if stereo_only && kf2.depth(idx2).is_none() {
                        continue;
                    }
                    let dist = d1.hamming_distance(kf2.descriptor(idx2));
                    if dist > cfg.th_low {
                        continue;
                    }
                    let kp2 = kf2.keypoint(idx2);
                    let dx = kp2.x as f64 - epipole.0;
                    let dy = kp2.y as f64 - epipole.1;
                    if dx * dx + dy * dy < cfg.epipole_exclusion_factor * kf2.scale_levels.scale_factors[kp2.octave as usize] as f64 {
                        continue;
                    }
                    if !check_dist_epipolar_line(kp1, kp2, f12, &kf2.scale_levels, cfg.chi2_1dof) {
                        continue;
                    }
                    if dist < best_dist {
                        best_dist = dist;
                        best_idx2 = Some(idx2);
                    }
                }
                if let Some(idx2) = best_idx2 {
                    used2.insert(idx2);
                    let pos = pairs.len();
                    pairs.push((idx1, idx2));
                    if self.check_orientation {
                        hist.add(kp1.angle as f64 - kf2.keypoint(idx2).angle as f64, pos);
                    }
                }
            }
        }
        if self.check_orientation {
            let keep = hist.keep_bins();
            let reject: BTreeSet<usize> = hist.rejected_payloads(&keep).into_iter().collect();
            pairs = pairs.into_iter().enumerate().filter(|(i, _)| !reject.contains(i)).map(|(_, p)| p).collect();
        }
        pairs
    }

    /// Bidirectional project-and-match under a similarity transform from
    /// `kf1` to `kf2`; only symmetric matches (kf1->kf2 round-trips to
    /// itself) are accepted into `matches12`. Returns the number of newly
    /// confirmed matches.
    pub fn search_by_sim3(&self, kf1: &KeyFrame, kf2: &KeyFrame, matches12: &mut [Option<MapPointId>], sim3_12: &Sim3, map: &Map, cfg: &LocalMapperConfig, th: f64) -> usize {
        let r1 = kf1.pose().rotation();
        let t1 = kf1.pose().translation();
        let r2 = kf2.pose().rotation();
        let t2 = kf2.pose().translation();
        let sim3_21 = sim3_12.inverse();

        let mut already1_idx: BTreeSet<usize> = BTreeSet::new();
        let mut already2_idx: BTreeSet<usize> = BTreeSet::new();
        for (i1, m) in matches12.iter().enumerate() {
            if let Some(mp2_id) = m {
                already1_idx.insert(i1);
                if let Some(mp2) = map.map_point(*mp2_id) {
                    if let Some(idx2) = mp2.observation_at(kf2.id) {
                        already2_idx.insert(idx2);
                    }
                }
            }
        }

        let n1 = kf1.num_features();
        let n2 = kf2.num_features();
        let mut match1: Vec<Option<usize>> = vec![None; n1];
        let mut match2: Vec<Option<usize>> = vec![None; n2];

        for i1 in 0..n1 {
            if already1_idx.contains(&i1) {
                continue;
            }
            let Some(mp1_id) = kf1.map_point_at(i1) else { continue };
            let Some(mp1) = map.map_point(mp1_id) else { continue };
            if mp1.is_bad() {
                continue;
            }
            let p_c1 = Point3::from(r1 * mp1.position().coords + t1);
            let p_c2 = sim3_21.transform(&p_c1);
            if p_c2.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = kf2.intrinsics.project(&p_c2) else { continue };
            if !kf2.intrinsics.in_bounds(u, v) {
                continue;
            }
            let (min_d, max_d) = mp1.distance_bounds();
            let dist3d = p_c2.coords.norm();
            if dist3d < min_d || dist3d > max_d {
                continue;
            }
            let predicted = mp1.predict_scale(dist3d, &kf2.scale_levels);
            let radius = th * kf2.scale_levels.scale_factors[predicted] as f64;
            let candidates = kf2.grid().features_in_area(kf2.keypoints(), u, v, radius, None, None);
            if candidates.is_empty() {
                continue;
            }
            let d1 = mp1.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx2 in candidates {
                let idx2 = idx2 as usize;
                let kp2 = kf2.keypoint(idx2);
                if (kp2.octave as i64) < predicted as i64 - 1 || kp2.octave as usize > predicted {
                    continue;
                }
                let dist = d1.hamming_distance(kf2.descriptor(idx2));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx2);
                }
            }
            if best_dist <= cfg.th_high {
                match1[i1] = best_idx;
            }
        }

        for i2 in 0..n2 {
            if already2_idx.contains(&i2) {
                continue;
            }
            let Some(mp2_id) = kf2.map_point_at(i2) else { continue };
            let Some(mp2) = map.map_point(mp2_id) else { continue };
            if mp2.is_bad() {
                continue;
            }
            let p_c2 = Point3::from(r2 * mp2.position().coords + t2);
            let p_c1 = sim3_12.transform(&p_c2);
            if p_c1.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = kf1.intrinsics.project(&p_c1) else { continue };
            if !kf1.intrinsics.in_bounds(u, v) {
                continue;
            }
            let (min_d, max_d) = mp2.distance_bounds();
            let dist3d = p_c1.coords.norm();
            if dist3d < min_d || dist3d > max_d {
                continue;
            }
            let predicted = mp2.predict_scale(dist3d, &kf1.scale_levels);
            let radius = th * kf1.scale_levels.scale_factors[predicted] as f64;
            let candidates = kf1.grid().features_in_area(kf1.keypoints(), u, v, radius, None, None);
            if candidates.is_empty() {
                continue;
            }
            let d2 = mp2.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx1 in candidates {
                let idx1 = idx1 as usize;
                let kp1 = kf1.keypoint(idx1);
                if (kp1.octave as i64) < predicted as i64 - 1 || kp1.octave as usize > predicted {
                    continue;
                }
                let dist = d2.hamming_distance(kf1.descriptor(idx1));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx1);
                }
            }
            if best_dist <= cfg.th_high {
                match2[i2] = best_idx;
            }
        }

        let mut found = 0usize;
        for i1 in 0..n1 {
            if let Some(idx2) = match1[i1] {
                if match2[idx2] == Some(i1) {
                    if let Some(mp2_id) = kf2.map_point_at(idx2) {
                        matches12[i1] = Some(mp2_id);
                        found += 1;
                    }
                }
            }
        }
        found
    }

    /// Fuse `candidates` into `kf`: project each into `kf`, reject on the
    /// usual geometric gates, and either attach a new observation or merge
    /// with whatever map point the best-matching feature already carries
    /// (more observations survives, ties favor the existing point).
    pub fn fuse(&self, kf: &KeyFrame, candidates: &[MapPointId], map: &Map, cfg: &LocalMapperConfig, th: f64) -> usize {
        let rcw = kf.pose().rotation();
        let tcw = kf.pose().translation();
        let center = kf.camera_center();
        let mut fused = 0usize;

        for &mp_id in candidates {
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() || mp.observation_at(kf.id).is_some() {
                continue;
            }
            let p_world = mp.position();
            let p_c = Point3::from(rcw * p_world.coords + tcw);
            if p_c.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = kf.intrinsics.project(&p_c) else { continue };
            if !kf.intrinsics.in_bounds(u, v) {
                continue;
            }
            let (min_d, max_d) = mp.distance_bounds();
            let dist3d = p_c.coords.norm();
            if dist3d < min_d || dist3d > max_d {
                continue;
            }
            let view_vec = p_world - center;
            if view_vec.norm() < 1e-9 {
                continue;
            }
            if view_vec.normalize().dot(&mp.normal()) < cfg.fov_cos_threshold {
                continue;
            }
            let predicted = mp.predict_scale(dist3d, &kf.scale_levels);
            let radius = th * kf.scale_levels.scale_factors[predicted] as f64;
            let candidate_features = kf.grid().features_in_area(
                kf.keypoints(),
                u,
                v,
                radius,
                Some(predicted.saturating_sub(1) as u32),
                Some((predicted + 1) as u32),
            );
            if candidate_features.is_empty() {
                continue;
            }
            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidate_features {
                let idx = idx as usize;
                let kp = kf.keypoint(idx);
                let ex = u - kp.x as f64;
                let ey = v - kp.y as f64;
                let sigma2 = kf.scale_levels.level_sigma2[kp.octave as usize] as f64;
                if ex * ex + ey * ey > cfg.chi2_2dof * sigma2 {
                    continue;
                }
                let dist = descriptor.hamming_distance(kf.descriptor(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }
            if best_dist > cfg.th_low {
                continue;
            }
            let Some(best_idx) = best_idx else { continue };
            match kf.map_point_at(best_idx) {
                Some(existing_id) if existing_id != mp_id => {
                    let existing_is_bad = map.map_point(existing_id).map(|e| e.is_bad()).unwrap_or(true);
                    if existing_is_bad {
                        mp.add_observation(kf.id, best_idx);
                        kf.set_map_point_at(best_idx, Some(mp_id));
                    } else {
                        let existing = map.map_point(existing_id).expect("checked not bad above");
                        if mp.num_observations() > existing.num_observations() {
                            replace_map_point(map, existing_id, mp_id);
                        } else {
                            replace_map_point(map, mp_id, existing_id);
                        }
                    }
                    fused += 1;
                }
                Some(_) => {}
                None => {
                    mp.add_observation(kf.id, best_idx);
                    kf.set_map_point_at(best_idx, Some(mp_id));
                    fused += 1;
                }
            }
        }
        fused
    }

    /// Loop-closing variant of `Fuse`: projects `candidates` into `kf` under
    /// the corrected similarity pose `scw` but never mutates the graph
    /// directly on a merge — it defers to the caller via the returned
    /// `(existing, candidate)` replacement pairs so loop closure can commit
    /// atomically.
    pub fn fuse_sim3(&self, kf: &KeyFrame, scw: &Sim3, candidates: &[MapPointId], map: &Map, cfg: &LocalMapperConfig, th: f64) -> Vec<(MapPointId, MapPointId)> {
        let center = Point3::from(scw.inverse().translation);
        let mut replace_points = Vec::new();

        for &mp_id in candidates {
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() || mp.observation_at(kf.id).is_some() {
                continue;
            }
            let p_world = mp.position();
            let p_c = scw.transform(&p_world);
            if p_c.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = kf.intrinsics.project(&p_c) else { continue };
            if !kf.intrinsics.in_bounds(u, v) {
                continue;
            }
            let (min_d, max_d) = mp.distance_bounds();
            let dist3d = p_c.coords.norm();
            if dist3d < min_d || dist3d > max_d {
                continue;
            }
            let view_vec = p_world - center;
            if view_vec.norm() < 1e-9 {
                continue;
            }
            if view_vec.normalize().dot(&mp.normal()) < cfg.fov_cos_threshold {
                continue;
            }
            let predicted = mp.predict_scale(dist3d, &kf.scale_levels);
            let radius = th * kf.scale_levels.scale_factors[predicted] as f64;
            let candidate_features = kf.grid().features_in_area(
                kf.keypoints(),
                u,
                v,
                radius,
                Some(predicted.saturating_sub(1) as u32),
                Some((predicted + 1) as u32),
            );
            if candidate_features.is_empty() {
                continue;
            }
            let descriptor = mp.descriptor();
            let mut best_dist = u32::MAX;
            let mut best_idx = None;
            for idx in candidate_features {
                let idx = idx as usize;
                let dist = descriptor.hamming_distance(kf.descriptor(idx));
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }
            if best_dist > cfg.th_low {
                continue;
            }
            let Some(best_idx) = best_idx else { continue };
            match kf.map_point_at(best_idx) {
                Some(existing_id) if existing_id != mp_id => {
                    replace_points.push((existing_id, mp_id));
                }
                Some(_) => {}
                None => {
                    mp.add_observation(kf.id, best_idx);
                    kf.set_map_point_at(best_idx, Some(mp_id));
                }
            }
        }
        replace_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::sync::Arc;
    use crate::Pose3;
    use crate::{Descriptor256, KeyFrameId, Keypoint, MapPointId, ScaleLevels};

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

    fn keyframe_with(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor256>, pose: Pose3) -> Arc<KeyFrame> {
        let depths = vec![Some(1.0); keypoints.len()];
        Arc::new(KeyFrame::new(KeyFrameId(0), 0, intrinsics(), ScaleLevels::new(8, 1.2), keypoints, descriptors, depths, pose))
    }

    #[test]
    fn three_maxima_picks_largest_bins_and_drops_small_ones() {
        let mut bins: Vec<Vec<usize>> = vec![Vec::new(); 30];
        bins[0] = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        bins[5] = vec![11, 12, 13];
        bins[10] = vec![14]; // < 10% of bin 0's count (10) -> dropped
        let keep = three_maxima(&bins);
        assert!(keep.contains(&0));
        assert!(keep.contains(&5));
        assert!(!keep.contains(&10));
    }

    #[test]
    fn three_maxima_ties_favor_earlier_bin() {
        let mut bins: Vec<Vec<usize>> = vec![Vec::new(); 30];
        bins[2] = vec![1, 2];
        bins[7] = vec![3, 4];
        let keep = three_maxima(&bins);
        assert!(keep.contains(&2));
        assert!(keep.contains(&7));
    }

    #[test]
    fn sim3_inverse_round_trips() {
        let s = Sim3::new(2.0, UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        let p = Point3::new(1.0, 2.0, 3.0);
        let round = s.inverse().transform(&s.transform(&p));
        assert!((round.x - p.x).abs() < 1e-9);
        assert!((round.y - p.y).abs() < 1e-9);
        assert!((round.z - p.z).abs() < 1e-9);
    }

    #[test]
    fn fuse_merges_ties_in_favor_of_existing_point() {
        let map = Map::new();
        let kf = keyframe_with(
            vec![Keypoint { x: 320.0, y: 240.0, octave: 0, angle: 0.0 }],
            vec![Descriptor256::ZERO],
            Pose3::identity(),
        );
        map.add_keyframe(kf.clone());

        let existing_id = map.next_map_point_id();
        let existing = Arc::new(MapPoint::new(existing_id, kf.id, Point3::new(0.0, 0.0, 1.0), Descriptor256::ZERO));
        existing.add_observation(kf.id, 0);
        existing.set_distance_bounds(0.5, 1.0);
        map.add_map_point(existing.clone());
        kf.set_map_point_at(0, Some(existing_id));

        let other_kf = keyframe_with(vec![Keypoint { x: 0.0, y: 0.0, octave: 0, angle: 0.0 }], vec![Descriptor256::ZERO], Pose3::identity());
        map.add_keyframe(other_kf.clone());
        let candidate_id = map.next_map_point_id();
        let candidate = Arc::new(MapPoint::new(candidate_id, other_kf.id, Point3::new(0.0, 0.0, 1.0), Descriptor256::ZERO));
        candidate.add_observation(other_kf.id, 0);
        candidate.set_distance_bounds(0.5, 1.0);
        candidate.set_normal(Vector3::new(0.0, 0.0, 1.0));
        map.add_map_point(candidate.clone());
        other_kf.set_map_point_at(0, Some(candidate_id));

        let matcher = Matcher::new(0.8, true);
        let cfg = LocalMapperConfig::default();
        matcher.fuse(&kf, &[candidate_id], &map, &cfg, 3.0);

        // both have one observation -- tie favors the existing point
        assert_eq!(kf.map_point_at(0), Some(existing_id));
        assert_eq!(candidate.resolve(), existing_id);
    }

    #[test]
    fn compute_f12_is_nonzero_for_distinct_poses() {
        let kf1 = keyframe_with(vec![], vec![], Pose3::identity());
        let kf2 = keyframe_with(
            vec![],
            vec![],
            Pose3::new(Vector3::new(0.1, 0.0, 0.0), UnitQuaternion::identity()),
        );
        let f12 = compute_f12(&kf1, &kf2);
        assert!(f12.iter().any(|v| v.abs() > 1e-12));
    }
}
