use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use nalgebra::{Matrix3x4, Matrix4, Point3, Vector3};
use tracing::{debug, info, warn};
use crate::{KeyFrameId, MapPointId};

use crate::config::LocalMapperConfig;
use crate::coordinator::Coordinator;
use crate::covisibility::CovisibilityGraph;
use crate::error::SlamResult;
use crate::keyframe::KeyFrame;
use crate::keyframe_database::KeyFrameDatabase;
use crate::map::Map;
use crate::map_point::MapPoint;
use crate::matcher::{compute_f12, refresh_descriptor, refresh_normal_and_depth, Matcher};
use crate::optimizer::OptimizerBridge;
use crate::spanning_tree::SpanningTree;

/// Receives fully processed keyframes from the mapper. The loop closer
/// itself (candidate detection, Sim3 estimation, pose-graph correction) is a
/// non-goal; this is the one seam it needs into the mapper's output.
pub trait LoopCloserSink: Send + Sync {
    fn insert_keyframe(&self, kf: Arc<KeyFrame>);
}

/// A sink that drops every keyframe handed to it. Used where the loop
/// closer genuinely has nothing to do (tests, or a deployment that disables
/// loop closing outright).
pub struct NullLoopCloserSink;

impl LoopCloserSink for NullLoopCloserSink {
    fn insert_keyframe(&self, _kf: Arc<KeyFrame>) {}
}

/// Drives the nine-phase local mapping cycle: drain the new-keyframe queue,
/// link its observations into the map, cull unreliable recent map points,
/// triangulate new ones against covisibility neighbors, fuse redundant
/// observations, run local bundle adjustment, cull redundant keyframes, and
/// hand the processed keyframe to the loop closer — all gated by the
/// [`Coordinator`]'s stop/reset/finish flags.
///
/// Exposes both [`LocalMapper::run`] (a dedicated worker thread, polling
/// with short sleeps) and [`LocalMapper::step_once`] (a single synchronous
/// iteration), the latter for deterministic tests that need to assert state
/// after exactly one cycle without racing a background thread.
pub struct LocalMapper {
    map: Arc<Map>,
    covisibility: Arc<CovisibilityGraph>,
    spanning_tree: Arc<SpanningTree>,
    database: Arc<KeyFrameDatabase>,
    coordinator: Arc<Coordinator>,
    optimizer: Arc<dyn OptimizerBridge>,
    loop_closer: Arc<dyn LoopCloserSink>,
    cfg: LocalMapperConfig,
    queue: Mutex<VecDeque<Arc<KeyFrame>>>,
    /// Map points created or linked recently, watched for a few keyframes
    /// before graduating or being culled (`MapPointCulling`).
    recently_added: Mutex<Vec<MapPointId>>,
}

impl LocalMapper {
    pub fn new(
        map: Arc<Map>,
        covisibility: Arc<CovisibilityGraph>,
        spanning_tree: Arc<SpanningTree>,
        database: Arc<KeyFrameDatabase>,
        coordinator: Arc<Coordinator>,
        optimizer: Arc<dyn OptimizerBridge>,
        loop_closer: Arc<dyn LoopCloserSink>,
        cfg: LocalMapperConfig,
    ) -> Self {
        Self {
            map,
            covisibility,
            spanning_tree,
            database,
            coordinator,
            optimizer,
            loop_closer,
            cfg,
            queue: Mutex::new(VecDeque::new()),
            recently_added: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a tracked keyframe for processing. Always accepted — the
    /// queue is unbounded, matching the documented backpressure policy; the
    /// `accept_keyframes` flag only advises a well-behaved tracker not to
    /// insert more while the mapper is busy, it does not gate this method.
    pub fn queue_keyframe(&self, kf: Arc<KeyFrame>) {
        self.queue.lock().unwrap().push_back(kf);
    }

    pub fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Spawn the dedicated worker thread. Polls the queue with the
    /// configured sleep interval between iterations; exits once a finish has
    /// been requested and the queue has drained.
    pub fn run(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            if self.coordinator.check_finish() && !self.has_new_keyframes() {
                self.coordinator.set_finished();
                info!("local mapper worker thread finished");
                return;
            }
            self.step_once();
            std::thread::sleep(self.cfg.worker_poll_interval);
        })
    }

    /// Run exactly one iteration of the work cycle: servicing a pending
    /// reset takes priority, then a single queued keyframe (if any and if
    /// not currently stopped) goes through all nine phases.
    pub fn step_once(&self) {
        if self.coordinator.reset_requested() {
            self.queue.lock().unwrap().clear();
            self.recently_added.lock().unwrap().clear();
            self.coordinator.clear_reset_request();
            info!("local mapper reset serviced");
            return;
        }

        if self.coordinator.stop_requested() {
            self.coordinator.stop();
        }
        if self.coordinator.is_stopped() {
            return;
        }

        let kf = {
            let mut queue = self.queue.lock().unwrap();
            queue.pop_front()
        };
        let Some(kf) = kf else {
            self.coordinator.set_accept_keyframes(true);
            return;
        };

        self.coordinator.set_accept_keyframes(false);
        self.coordinator.clear_abort_ba();

        self.process_new_keyframe(&kf);
        self.cull_map_points(kf.id);
        self.create_new_map_points(&kf);

        if !self.has_new_keyframes() {
            self.search_in_neighbors(&kf);
        }

        if !self.has_new_keyframes() && !self.coordinator.stop_requested() {
            if let Err(err) = self.local_bundle_adjustment(&kf) {
                warn!(%err, "local bundle adjustment failed");
            }
            self.cull_keyframes(&kf);
        }

        self.loop_closer.insert_keyframe(kf.clone());
        self.coordinator.set_accept_keyframes(true);
        debug!(keyframe = kf.id.0, "local mapper processed keyframe");
    }

    /// Phase 1: link the keyframe's already-attached map points into the
    /// map's observation tables, register it with the keyframe database,
    /// and refresh its covisibility/spanning-tree edges.
    fn process_new_keyframe(&self, kf: &Arc<KeyFrame>) {
        self.map.add_keyframe(kf.clone());
        self.database.add(kf.id, &kf.bow());

        for idx in 0..kf.num_features() {
            let Some(mp_id) = kf.map_point_at(idx) else { continue };
            let Some(mp) = self.map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            if mp.observation_at(kf.id).is_none() {
                mp.add_observation(kf.id, idx);
                refresh_normal_and_depth(&self.map, &mp);
                refresh_descriptor(&self.map, &mp);
            }
            if mp.first_keyframe == kf.id {
                self.recently_added.lock().unwrap().push(mp.id);
            }
        }

        self.covisibility.update_connections(&self.map, kf.id);
        self.spanning_tree.update_connections(&self.map, kf.id);
    }

    /// Phase 2: drop map points from the recent-watch list that fail the
    /// found-ratio test or have at most `culling_min_observations`
    /// observations once they reach `culling_age_recent`, measured in
    /// keyframe-id age since `KeyFrameId`s are assigned monotonically by
    /// `Map::next_keyframe_id`. A point younger than `culling_age_recent`
    /// is never culled, regardless of its found-ratio or observation count.
    fn cull_map_points(&self, current_id: KeyFrameId) {
        let pending = std::mem::take(&mut *self.recently_added.lock().unwrap());
        let mut kept = Vec::with_capacity(pending.len());
        for mp_id in pending {
            let Some(mp) = self.map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            let age = current_id.0.saturating_sub(mp.first_keyframe.0);
            if age < self.cfg.culling_age_recent {
                kept.push(mp_id);
                continue;
            }

            if mp.found_ratio() < self.cfg.found_ratio_threshold {
                self.erase_map_point(&mp);
                continue;
            }
            if mp.num_observations() <= self.cfg.culling_min_observations as usize {
                self.erase_map_point(&mp);
                continue;
            }
            if age >= self.cfg.culling_age_retire {
                // survived probation; stop watching it but keep it in the map
                continue;
            }
            kept.push(mp_id);
        }
        *self.recently_added.lock().unwrap() = kept;
    }

    /// Phase 3: triangulate new map points between `kf` and its strongest
    /// covisibility neighbors, matched via `SearchForTriangulation` and
    /// validated by parallax, baseline, reprojection and scale-consistency
    /// gates.
    fn create_new_map_points(&self, kf: &Arc<KeyFrame>) {
        let neighbors = self.covisibility.best_covisibility_keyframes(&self.map, kf.id, self.cfg.top_neighbors_for_triangulation);
        let matcher = Matcher::new(self.cfg.nn_ratio_triangulation, true);

        for neighbor_id in neighbors {
            if self.coordinator.stop_requested() || self.coordinator.reset_requested() {
                break;
            }
            let Some(neighbor) = self.map.keyframe(neighbor_id) else { continue };
            if neighbor.is_bad() {
                continue;
            }
            let baseline = (kf.camera_center() - neighbor.camera_center()).norm();
            if baseline < self.cfg.min_triangulation_baseline {
                continue;
            }

            let f12 = compute_f12(kf, &neighbor);
            let pairs = matcher.search_for_triangulation(kf, &neighbor, &f12, &self.cfg, false);

            for (idx1, idx2) in pairs {
                let Some(world_point) = triangulate(kf, &neighbor, idx1, idx2, &self.cfg) else { continue };

                let mp_id = self.map.next_map_point_id();
                let mp = Arc::new(MapPoint::new(mp_id, kf.id, world_point, *kf.descriptor(idx1)));
                mp.add_observation(kf.id, idx1);
                mp.add_observation(neighbor_id, idx2);
                kf.set_map_point_at(idx1, Some(mp_id));
                neighbor.set_map_point_at(idx2, Some(mp_id));
                refresh_normal_and_depth(&self.map, &mp);
                refresh_descriptor(&self.map, &mp);
                self.map.add_map_point(mp);
                self.recently_added.lock().unwrap().push(mp_id);
            }
        }
    }

    /// Phase 4: fuse `kf`'s map points into its second-order covisibility
    /// neighborhood and vice versa, then refresh `kf`'s own covisibility
    /// edges to reflect the new shared observations.
    fn search_in_neighbors(&self, kf: &Arc<KeyFrame>) {
        let first_order = self.covisibility.best_covisibility_keyframes(&self.map, kf.id, self.cfg.top_neighbors_for_fusion);
        let mut targets: BTreeSet<KeyFrameId> = BTreeSet::new();
        for &n in &first_order {
            targets.insert(n);
            for n2 in self.covisibility.best_covisibility_keyframes(&self.map, n, self.cfg.top_neighbors_for_fusion) {
                if n2 != kf.id {
                    targets.insert(n2);
                }
            }
        }

        let matcher = Matcher::new(self.cfg.nn_ratio_projection, true);
        let own_points: Vec<MapPointId> = kf.all_map_points().into_iter().flatten().collect();

        for &target_id in &targets {
            let Some(target) = self.map.keyframe(target_id) else { continue };
            if target.is_bad() {
                continue;
            }
            matcher.fuse(&target, &own_points, &self.map, &self.cfg, self.cfg.fuse_radius_th);
        }

        let mut candidate_points: BTreeSet<MapPointId> = BTreeSet::new();
        for &target_id in &targets {
            let Some(target) = self.map.keyframe(target_id) else { continue };
            candidate_points.extend(target.all_map_points().into_iter().flatten());
        }
        let candidates: Vec<MapPointId> = candidate_points.into_iter().collect();
        matcher.fuse(kf, &candidates, &self.map, &self.cfg, self.cfg.fuse_radius_th);

        self.covisibility.update_connections(&self.map, kf.id);
    }

    /// Phase 5: hand the current local window off to the [`OptimizerBridge`]
    /// and act on the outlier observations it reports.
    fn local_bundle_adjustment(&self, kf: &Arc<KeyFrame>) -> SlamResult<()> {
        let mut local_ids: Vec<KeyFrameId> = vec![kf.id];
        local_ids.extend(self.covisibility.best_covisibility_keyframes(&self.map, kf.id, usize::MAX));
        let local_set: BTreeSet<KeyFrameId> = local_ids.iter().copied().collect();

        let mut local_points: BTreeSet<MapPointId> = BTreeSet::new();
        for &id in &local_ids {
            let Some(k) = self.map.keyframe(id) else { continue };
            for mp_id in k.all_map_points().into_iter().flatten() {
                if let Some(mp) = self.map.map_point(mp_id) {
                    if !mp.is_bad() {
                        local_points.insert(mp_id);
                    }
                }
            }
        }

        let mut fixed_set: BTreeSet<KeyFrameId> = BTreeSet::new();
        for &mp_id in &local_points {
            let Some(mp) = self.map.map_point(mp_id) else { continue };
            for &obs_kf in mp.observations().keys() {
                if !local_set.contains(&obs_kf) {
                    fixed_set.insert(obs_kf);
                }
            }
        }

        let local_points: Vec<MapPointId> = local_points.into_iter().collect();
        let fixed_ids: Vec<KeyFrameId> = fixed_set.into_iter().collect();

        let report = self.optimizer.local_bundle_adjustment(
            &self.map,
            &local_ids,
            &fixed_ids,
            &local_points,
            &self.coordinator.abort_flag(),
            &self.cfg,
        )?;

        for (kf_id, mp_id) in report.outlier_observations {
            let (Some(observing_kf), Some(mp)) = (self.map.keyframe(kf_id), self.map.map_point(mp_id)) else { continue };
            if let Some(idx) = mp.observation_at(kf_id) {
                observing_kf.set_map_point_at(idx, None);
            }
            let remaining = mp.erase_observation(kf_id);
            if remaining == 0 {
                self.erase_map_point(&mp);
            }
        }

        for &id in &local_ids {
            self.covisibility.update_connections(&self.map, id);
        }
        Ok(())
    }

    /// Phase 6: mark a covisibility neighbor of `kf` bad if most of its
    /// depth-eligible observations are redundantly seen (at an equal or
    /// finer pyramid level) by at least `keyframe_culling_min_observers`
    /// other keyframes. `KeyFrameId(0)` is never culled.
    fn cull_keyframes(&self, kf: &Arc<KeyFrame>) {
        let neighbors = self.covisibility.best_covisibility_keyframes(&self.map, kf.id, usize::MAX);
        for n_id in neighbors {
            if n_id == KeyFrameId(0) {
                continue;
            }
            let Some(n) = self.map.keyframe(n_id) else { continue };
            if n.is_bad() {
                continue;
            }

            let mut eligible = 0usize;
            let mut redundant = 0usize;
            for idx in 0..n.num_features() {
                let Some(mp_id) = n.map_point_at(idx) else { continue };
                let Some(mp) = self.map.map_point(mp_id) else { continue };
                if mp.is_bad() {
                    continue;
                }
                let Some(depth) = n.depth(idx) else { continue };
                if depth > self.cfg.keyframe_culling_max_depth {
                    continue;
                }
                eligible += 1;

                let my_octave = n.keypoint(idx).octave;
                let mut observers = 0u32;
                for (&obs_kf_id, &obs_idx) in mp.observations().iter() {
                    if obs_kf_id == n_id {
                        continue;
                    }
                    let Some(obs_kf) = self.map.keyframe(obs_kf_id) else { continue };
                    if obs_kf.keypoint(obs_idx).octave <= my_octave + 1 {
                        observers += 1;
                        if observers >= self.cfg.keyframe_culling_min_observers {
                            break;
                        }
                    }
                }
                if observers >= self.cfg.keyframe_culling_min_observers {
                    redundant += 1;
                }
            }

            if eligible > 0 && redundant as f64 >= self.cfg.keyframe_culling_redundancy_ratio * eligible as f64 {
                info!(keyframe = n_id.0, "culling redundant keyframe");
                self.erase_keyframe(&n);
            }
        }
    }

    fn erase_map_point(&self, mp: &Arc<MapPoint>) {
        let dropped = mp.set_bad();
        for (kf_id, idx) in dropped {
            if let Some(kf) = self.map.keyframe(kf_id) {
                kf.set_map_point_at(idx, None);
            }
        }
        self.map.erase_map_point(mp.id);
    }

    fn erase_keyframe(&self, kf: &Arc<KeyFrame>) {
        kf.set_bad();
        for idx in 0..kf.num_features() {
            if let Some(mp_id) = kf.map_point_at(idx) {
                if let Some(mp) = self.map.map_point(mp_id) {
                    mp.erase_observation(kf.id);
                }
            }
        }
        self.covisibility.erase(&self.map, kf.id);
        self.spanning_tree.erase(&self.map, kf.id);
        self.database.erase(kf.id, &kf.bow());
        self.map.erase_keyframe(kf.id);
    }
}

fn projection_matrix(kf: &KeyFrame) -> Matrix3x4<f64> {
    let r = kf.pose().rotation().to_rotation_matrix().into_inner();
    let t = kf.pose().translation();
    let rt = Matrix3x4::new(
        r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x, //
        r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y, //
        r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
    );
    let k = nalgebra::Matrix3::new(kf.intrinsics.fx, 0.0, kf.intrinsics.cx, 0.0, kf.intrinsics.fy, kf.intrinsics.cy, 0.0, 0.0, 1.0);
    k * rt
}

/// Linear (DLT) triangulation of the ray pair `(kf1, idx1)`/`(kf2, idx2)`,
/// gated by parallax, positive depth in both cameras, reprojection error
/// and scale consistency — the geometric checks `CreateNewMapPoints` applies
/// before accepting a candidate triangulated point.
fn triangulate(kf1: &KeyFrame, kf2: &KeyFrame, idx1: usize, idx2: usize, cfg: &LocalMapperConfig) -> Option<Point3<f64>> {
    let kp1 = kf1.keypoint(idx1);
    let kp2 = kf2.keypoint(idx2);

    let r1 = kf1.pose().rotation();
    let t1 = kf1.pose().translation();
    let r2 = kf2.pose().rotation();
    let t2 = kf2.pose().translation();

    let xn1 = Vector3::new((kp1.x as f64 - kf1.intrinsics.cx) / kf1.intrinsics.fx, (kp1.y as f64 - kf1.intrinsics.cy) / kf1.intrinsics.fy, 1.0);
    let xn2 = Vector3::new((kp2.x as f64 - kf2.intrinsics.cx) / kf2.intrinsics.fx, (kp2.y as f64 - kf2.intrinsics.cy) / kf2.intrinsics.fy, 1.0);
    let ray1 = r1.inverse() * xn1;
    let ray2 = r2.inverse() * xn2;
    let cos_parallax = ray1.normalize().dot(&ray2.normalize());
    if cos_parallax >= cfg.parallax_cos_max || cos_parallax <= 0.0 {
        return None;
    }

    let p1 = projection_matrix(kf1);
    let p2 = projection_matrix(kf2);
    let a = Matrix4::new(
        kp1.x as f64 * p1[(2, 0)] - p1[(0, 0)],
        kp1.x as f64 * p1[(2, 1)] - p1[(0, 1)],
        kp1.x as f64 * p1[(2, 2)] - p1[(0, 2)],
        kp1.x as f64 * p1[(2, 3)] - p1[(0, 3)],
        kp1.y as f64 * p1[(2, 0)] - p1[(1, 0)],
        kp1.y as f64 * p1[(2, 1)] - p1[(1, 1)],
        kp1.y as f64 * p1[(2, 2)] - p1[(1, 2)],
        kp1.y as f64 * p1[(2, 3)] - p1[(1, 3)],
        kp2.x as f64 * p2[(2, 0)] - p2[(0, 0)],
        kp2.x as f64 * p2[(2, 1)] - p2[(0, 1)],
        kp2.x as f64 * p2[(2, 2)] - p2[(0, 2)],
        kp2.x as f64 * p2[(2, 3)] - p2[(0, 3)],
        kp2.y as f64 * p2[(2, 0)] - p2[(1, 0)],
        kp2.y as f64 * p2[(2, 1)] - p2[(1, 1)],
        kp2.y as f64 * p2[(2, 2)] - p2[(1, 2)],
        kp2.y as f64 * p2[(2, 3)] - p2[(1, 3)],
    );

    let svd = nalgebra::linalg::SVD::new(a, false, true);
    let v_t = svd.v_t?;
    let x = v_t.row(3).transpose();
    if x[3].abs() < 1e-12 {
        return None;
    }
    let world = Point3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);

    let z1 = (r1 * world.coords + t1).z;
    if z1 <= 0.0 {
        return None;
    }
    let z2 = (r2 * world.coords + t2).z;
    if z2 <= 0.0 {
        return None;
    }

    let p_c1 = Point3::from(r1 * world.coords + t1);
    let (u1, v1) = kf1.intrinsics.project(&p_c1)?;
    let sigma1 = kf1.scale_levels.level_sigma2[kp1.octave as usize] as f64;
    let e1 = (u1 - kp1.x as f64).powi(2) + (v1 - kp1.y as f64).powi(2);
    if e1 > cfg.chi2_2dof * sigma1 {
        return None;
    }

    let p_c2 = Point3::from(r2 * world.coords + t2);
    let (u2, v2) = kf2.intrinsics.project(&p_c2)?;
    let sigma2 = kf2.scale_levels.level_sigma2[kp2.octave as usize] as f64;
    let e2 = (u2 - kp2.x as f64).powi(2) + (v2 - kp2.y as f64).powi(2);
    if e2 > cfg.chi2_2dof * sigma2 {
        return None;
    }

    let dist1 = (world - kf1.camera_center()).norm();
    let dist2 = (world - kf2.camera_center()).norm();
    if dist1 < 1e-9 || dist2 < 1e-9 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = kf1.scale_levels.scale_factors[kp1.octave as usize] as f64 / kf2.scale_levels.scale_factors[kp2.octave as usize] as f64;
    if ratio_dist * cfg.ratio_factor < ratio_octave || ratio_dist > ratio_octave * cfg.ratio_factor {
        return None;
    }

    Some(world)
}
