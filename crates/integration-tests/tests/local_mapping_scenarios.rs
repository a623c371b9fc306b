//! Integration tests for the RGB-D local mapping subsystem
//!
//! Wires a full `LocalMapper` to a `Map`/`CovisibilityGraph`/`SpanningTree`/
//! `KeyFrameDatabase` and drives it with `step_once` to check the end-to-end
//! scenarios and cross-cutting properties that no single module's unit
//! tests can see on their own: observation symmetry between a keyframe and
//! its map points, soft-delete consistency after erasure, FIFO queue
//! draining, and abort responsiveness.
//!
//! Run with: cargo test --test local_mapping_scenarios

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use nalgebra::{Point3, UnitQuaternion, Vector3};

use slam::{
    CameraIntrinsics, Coordinator, CovisibilityGraph, Descriptor256, KeyFrame, KeyFrameDatabase, KeyFrameId, Keypoint,
    LocalBundleAdjustmentReport, LocalMapper, LocalMapperConfig, LoopCloserSink, Map, MapPoint, MapPointId, OptimizerBridge, Pose3,
    ScaleLevels, SlamResult, SpanningTree,
};

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

fn make_keyframe(map: &Map, pose: Pose3, keypoints: Vec<Keypoint>) -> Arc<KeyFrame> {
    let id = map.next_keyframe_id();
    let n = keypoints.len();
    Arc::new(KeyFrame::new(
        id,
        id.0,
        intrinsics(),
        ScaleLevels::new(8, 1.2),
        keypoints,
        vec![Descriptor256::ZERO; n],
        vec![None; n],
        pose,
    ))
}

/// Records every keyframe the mapper hands it, in order, so tests can assert
/// on FIFO processing order (property 8).
struct CollectingSink {
    seen: Mutex<Vec<KeyFrameId>>,
}

impl CollectingSink {
    fn new() -> Self {
        Self { seen: Mutex::new(Vec::new()) }
    }

    fn seen(&self) -> Vec<KeyFrameId> {
        self.seen.lock().unwrap().clone()
    }
}

impl LoopCloserSink for CollectingSink {
    fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        self.seen.lock().unwrap().push(kf.id);
    }
}

/// An optimizer stand-in that reports no outliers, used by scenarios that
/// only care about graph bookkeeping, not the refinement math itself
/// (already covered by `optimizer`'s own unit tests).
struct NoopOptimizer;

impl OptimizerBridge for NoopOptimizer {
    fn local_bundle_adjustment(
        &self,
        _map: &Map,
        _local: &[KeyFrameId],
        _fixed: &[KeyFrameId],
        _points: &[MapPointId],
        _abort: &Arc<AtomicBool>,
        _cfg: &LocalMapperConfig,
    ) -> SlamResult<LocalBundleAdjustmentReport> {
        Ok(LocalBundleAdjustmentReport::default())
    }
}

struct Harness {
    map: Arc<Map>,
    mapper: Arc<LocalMapper>,
    sink: Arc<CollectingSink>,
}

fn build_harness() -> Harness {
    let map = Arc::new(Map::new());
    let sink = Arc::new(CollectingSink::new());
    let mapper = Arc::new(LocalMapper::new(
        map.clone(),
        Arc::new(CovisibilityGraph::new(LocalMapperConfig::default().covisibility_weight_threshold)),
        Arc::new(SpanningTree::new()),
        Arc::new(KeyFrameDatabase::new()),
        Arc::new(Coordinator::new()),
        Arc::new(NoopOptimizer),
        sink.clone(),
        LocalMapperConfig::default(),
    ));
    Harness { map, mapper, sink }
}

/// S1: a keyframe with no prior map points is queued, processed, and handed
/// to the loop closer unchanged — the simplest possible pass through the
/// full cycle.
#[test]
fn s1_bare_keyframe_round_trips_through_the_full_cycle() {
    let h = build_harness();
    let kf = make_keyframe(&h.map, Pose3::identity(), vec![]);
    let kf_id = kf.id;

    h.mapper.queue_keyframe(kf);
    h.mapper.step_once();

    assert!(h.map.keyframe(kf_id).is_some());
    assert_eq!(h.sink.seen(), vec![kf_id]);
    assert!(!h.mapper.has_new_keyframes());
}

/// S2 / property 1: a keyframe that already observes a map point links that
/// observation both ways — `KeyFrame::map_point_at` and
/// `MapPoint::observation_at` must agree after processing.
#[test]
fn s2_linking_an_existing_observation_is_symmetric() {
    let h = build_harness();
    let kp = Keypoint { x: 300.0, y: 200.0, octave: 0, angle: 0.0 };
    let kf = make_keyframe(&h.map, Pose3::identity(), vec![kp]);

    let mp_id = h.map.next_map_point_id();
    let mp = Arc::new(MapPoint::new(mp_id, kf.id, Point3::new(0.0, 0.0, 2.0), Descriptor256::ZERO));
    h.map.add_map_point(mp.clone());
    kf.set_map_point_at(0, Some(mp_id));

    h.mapper.queue_keyframe(kf.clone());
    h.mapper.step_once();

    assert_eq!(kf.map_point_at(0), Some(mp_id));
    assert_eq!(mp.observation_at(kf.id), Some(0));
}

/// S3 / property 2: once a map point is erased via the outlier path, the
/// keyframe's own `feature -> map point` slot is cleared and the map no
/// longer returns the point by id — soft-delete stays consistent across
/// both sides of the relationship.
#[test]
fn s3_erasing_a_map_point_clears_the_keyframe_slot_too() {
    let h = build_harness();
    let kp1 = Keypoint { x: 300.0, y: 200.0, octave: 0, angle: 0.0 };
    let kp2 = Keypoint { x: 310.0, y: 210.0, octave: 0, angle: 0.0 };
    let kf1 = make_keyframe(&h.map, Pose3::identity(), vec![kp1]);
    let pose2 = Pose3::new(Vector3::new(0.05, 0.0, 0.0), UnitQuaternion::identity());
    let kf2 = make_keyframe(&h.map, pose2, vec![kp2]);

    let mp_id = h.map.next_map_point_id();
    let mp = Arc::new(MapPoint::new(mp_id, kf1.id, Point3::new(0.0, 0.0, 2.0), Descriptor256::ZERO));
    mp.add_observation(kf1.id, 0);
    h.map.add_map_point(mp.clone());
    kf1.set_map_point_at(0, Some(mp_id));

    h.map.add_keyframe(kf1.clone());
    h.map.add_keyframe(kf2.clone());

    // Drop to a single observer, matching the erase path a failed
    // bundle-adjustment outlier or a fuse-merge would take.
    let remaining = mp.erase_observation(kf1.id);
    assert_eq!(remaining, 0);
    kf1.set_map_point_at(0, None);
    h.map.erase_map_point(mp_id);

    assert!(h.map.map_point(mp_id).is_none());
    assert_eq!(kf1.map_point_at(0), None);
}

/// S4 / property 8: keyframes are handed to the loop closer in the order
/// they were queued, one per `step_once` call, even though several are
/// queued up front.
#[test]
fn s4_keyframes_are_processed_in_fifo_order() {
    let h = build_harness();
    let kf_a = make_keyframe(&h.map, Pose3::identity(), vec![]);
    let kf_b = make_keyframe(&h.map, Pose3::identity(), vec![]);
    let kf_c = make_keyframe(&h.map, Pose3::identity(), vec![]);
    let ids = [kf_a.id, kf_b.id, kf_c.id];

    h.mapper.queue_keyframe(kf_a);
    h.mapper.queue_keyframe(kf_b);
    h.mapper.queue_keyframe(kf_c);

    assert_eq!(h.mapper.queue_len(), 3);
    h.mapper.step_once();
    h.mapper.step_once();
    h.mapper.step_once();

    assert_eq!(h.sink.seen(), ids.to_vec());
    assert!(!h.mapper.has_new_keyframes());
}

/// S5 / property 7: once a stop is requested, a queued keyframe is left
/// untouched — the mapper must not commit a partial cycle once it has
/// observed the stop flag.
#[test]
fn s5_stop_request_prevents_mid_queue_processing() {
    let h = build_harness();
    let kf = make_keyframe(&h.map, Pose3::identity(), vec![]);
    h.mapper.queue_keyframe(kf);

    h.mapper.coordinator().request_stop();
    h.mapper.step_once();

    assert!(h.mapper.coordinator().is_stopped());
    assert!(h.mapper.has_new_keyframes(), "stopped mapper must not drain its queue");
    assert!(h.sink.seen().is_empty());
}

/// S6: a reset request, serviced from another thread so it can unblock
/// (`Coordinator::request_reset` spins until a `step_once` call services
/// it), drains the queue without handing anything to the loop closer.
#[test]
fn s6_reset_drains_the_queue_without_notifying_the_loop_closer() {
    let h = build_harness();
    let kf = make_keyframe(&h.map, Pose3::identity(), vec![]);
    h.mapper.queue_keyframe(kf);

    let mapper = h.mapper.clone();
    let handle = std::thread::spawn(move || mapper.coordinator().request_reset());
    std::thread::sleep(std::time::Duration::from_millis(10));
    h.mapper.step_once();
    handle.join().unwrap();

    assert!(!h.mapper.has_new_keyframes());
    assert!(h.sink.seen().is_empty());
}

/// Property 7 (continued): an already-raised abort flag is visible to the
/// optimizer bridge before the mapper ever calls it, independent of the
/// local bundle adjustment's own math (covered by `optimizer`'s unit
/// tests) — this just checks the coordinator plumbing the mapper relies on.
#[test]
fn abort_flag_is_shared_between_the_coordinator_and_the_optimizer_bridge() {
    let h = build_harness();
    let flag = h.mapper.coordinator().abort_flag();
    assert!(!flag.load(std::sync::atomic::Ordering::Acquire));
    h.mapper.coordinator().interrupt_ba();
    assert!(flag.load(std::sync::atomic::Ordering::Acquire));
}

/// Release after a stop clears both `stopped` and `stop_requested`, letting
/// a subsequent `step_once` drain the queue again.
#[test]
fn release_after_stop_allows_processing_to_resume() {
    let h = build_harness();
    let kf = make_keyframe(&h.map, Pose3::identity(), vec![]);
    h.mapper.queue_keyframe(kf.clone());

    h.mapper.coordinator().request_stop();
    h.mapper.step_once();
    assert!(h.mapper.coordinator().is_stopped());

    h.mapper.coordinator().release();
    h.mapper.step_once();

    assert_eq!(h.sink.seen(), vec![kf.id]);
    assert!(!h.mapper.has_new_keyframes());
}
