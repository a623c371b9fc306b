use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::KeyFrameId;

use crate::map::Map;

/// Rooted tree over live keyframes, used as a stable backbone for
/// propagation during loop closure. Parent/children live on each
/// `KeyFrame`'s `Connections` field; this type only serializes the
/// multi-keyframe re-parenting done on erasure.
pub struct SpanningTree {
    lock: Mutex<()>,
}

impl SpanningTree {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Install `kf`'s parent as its best covisibility neighbor, but only if
    /// it doesn't have one yet. In the ordinary work loop the covisibility
    /// update already does this; this method exists so the tree's own
    /// first-call contract holds even when called independently (e.g. a
    /// root keyframe inserted with no covisibility data).
    pub fn update_connections(&self, map: &Map, kf_id: KeyFrameId) {
        let _guard = self.lock.lock().unwrap();
        let Some(kf) = map.keyframe(kf_id) else { return };
        if kf.parent().is_some() {
            return;
        }
        let top = kf.best_covisibility_neighbors(1).into_iter().next();
        if let Some(parent_id) = top {
            kf.with_connections_mut(|c| c.parent = Some(parent_id));
            if let Some(parent) = map.keyframe(parent_id) {
                parent.with_connections_mut(|c| {
                    c.children.insert(kf_id);
                });
            }
        }
    }

    /// Re-parent `kf`'s children on deletion, preferring a candidate parent
    /// already (transitively) connected to the tree through covisibility;
    /// unreachable orphans fall back to `kf`'s own parent. Loop edges are
    /// preserved (not used for parenting).
    pub fn erase(&self, map: &Map, kf_id: KeyFrameId) {
        let _guard = self.lock.lock().unwrap();
        let Some(kf) = map.keyframe(kf_id) else { return };
        let grandparent = kf.parent();
        let mut remaining: BTreeSet<KeyFrameId> = kf.children();
        let mut connected: BTreeSet<KeyFrameId> = BTreeSet::new();
        if let Some(gp) = grandparent {
            connected.insert(gp);
        }

        loop {
            let mut best: Option<(KeyFrameId, KeyFrameId, u32)> = None;
            for &child_id in &remaining {
                let Some(child) = map.keyframe(child_id) else { continue };
                for (neighbor_id, weight) in child.connections().ordered_neighbors {
                    if connected.contains(&neighbor_id) {
                        let better = match best {
                            None => true,
                            Some((_, _, best_w)) => weight > best_w,
                        };
                        if better {
                            best = Some((child_id, neighbor_id, weight));
                        }
                        break; // ordered_neighbors is weight-descending; first hit is best for this child
                    }
                }
            }
            match best {
                Some((child_id, parent_id, _)) => {
                    remaining.remove(&child_id);
                    connected.insert(child_id);
                    if let Some(child) = map.keyframe(child_id) {
                        child.with_connections_mut(|c| c.parent = Some(parent_id));
                    }
                    if let Some(parent) = map.keyframe(parent_id) {
                        parent.with_connections_mut(|c| {
                            c.children.insert(child_id);
                        });
                    }
                }
                None => break,
            }
        }

        for &child_id in &remaining {
            if let Some(child) = map.keyframe(child_id) {
                child.with_connections_mut(|c| c.parent = grandparent);
            }
            if let Some(gp) = grandparent {
                if let Some(gp_kf) = map.keyframe(gp) {
                    gp_kf.with_connections_mut(|c| {
                        c.children.insert(child_id);
                    });
                }
            }
        }

        if let Some(gp) = grandparent {
            if let Some(gp_kf) = map.keyframe(gp) {
                gp_kf.with_connections_mut(|c| {
                    c.children.remove(&kf_id);
                });
            }
        }
        kf.with_connections_mut(|c| {
            c.children.clear();
            c.parent = None;
        });
    }
}

impl Default for SpanningTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covisibility::CovisibilityGraph;
    use crate::keyframe::KeyFrame;
    use crate::map_point::MapPoint;
    use nalgebra::Point3;
    use std::sync::Arc;
    use crate::Pose3;
    use crate::{CameraIntrinsics, Descriptor256, Keypoint, MapPointId, ScaleLevels};

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

    fn add_keyframe(map: &Map, n: usize) -> Arc<KeyFrame> {
        let id = map.next_keyframe_id();
        let keypoints: Vec<Keypoint> = (0..n).map(|i| Keypoint { x: i as f32, y: 0.0, octave: 0, angle: 0.0 }).collect();
        let kf = Arc::new(KeyFrame::new(
            id,
            id.0,
            intrinsics(),
            ScaleLevels::new(8, 1.2),
            keypoints,
            vec![Descriptor256::ZERO; n],
            vec![Some(1.0); n],
            Pose3::identity(),
        ));
        map.add_keyframe(kf.clone());
        kf
    }

    fn co_observe(map: &Map, a: &Arc<KeyFrame>, b: &Arc<KeyFrame>, n: usize) {
        for i in 0..n {
            let id = map.next_map_point_id();
            map.add_map_point(Arc::new(MapPoint::new(id, a.id, Point3::new(0.0, 0.0, 1.0), Descriptor256::ZERO)));
            let mp = map.map_point(id).unwrap();
            mp.add_observation(a.id, i);
            mp.add_observation(b.id, i);
            a.set_map_point_at(i, Some(id));
            b.set_map_point_at(i, Some(id));
        }
    }

    #[test]
    fn first_keyframe_has_no_parent() {
        let map = Map::new();
        let tree = SpanningTree::new();
        let root = add_keyframe(&map, 5);
        tree.update_connections(&map, root.id);
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn second_keyframe_parents_to_covisibility_neighbor() {
        let map = Map::new();
        let graph = CovisibilityGraph::new(15);
        let tree = SpanningTree::new();
        let a = add_keyframe(&map, 20);
        let b = add_keyframe(&map, 20);
        co_observe(&map, &a, &b, 20);
        graph.update_connections(&map, a.id);
        graph.update_connections(&map, b.id);
        tree.update_connections(&map, a.id);
        tree.update_connections(&map, b.id);
        assert_eq!(b.parent(), Some(a.id));
        assert!(a.children().contains(&b.id));
    }

    #[test]
    fn erase_reparents_children_via_best_connected_candidate() {
        let map = Map::new();
        let graph = CovisibilityGraph::new(1);
        let tree = SpanningTree::new();
        let root = add_keyframe(&map, 20);
        let child = add_keyframe(&map, 20);
        let grandchild = add_keyframe(&map, 20);

        co_observe(&map, &root, &child, 20);
        co_observe(&map, &child, &grandchild, 5);
        co_observe(&map, &root, &grandchild, 1);

        graph.update_connections(&map, root.id);
        graph.update_connections(&map, child.id);
        graph.update_connections(&map, grandchild.id);
        tree.update_connections(&map, root.id);
        tree.update_connections(&map, child.id);
        tree.update_connections(&map, grandchild.id);

        assert_eq!(child.parent(), Some(root.id));
        assert_eq!(grandchild.parent(), Some(child.id));

        tree.erase(&map, child.id);

        // grandchild should be reparented, not left dangling
        assert!(grandchild.parent().is_some());
        assert_ne!(grandchild.parent(), Some(child.id));
    }

    #[test]
    fn erase_falls_back_to_grandparent_when_no_candidate_connects() {
        let map = Map::new();
        let tree = SpanningTree::new();
        let root = add_keyframe(&map, 1);
        let child = add_keyframe(&map, 1);
        let orphan = add_keyframe(&map, 1);

        child.with_connections_mut(|c| c.parent = Some(root.id));
        root.with_connections_mut(|c| {
            c.children.insert(child.id);
        });
        orphan.with_connections_mut(|c| c.parent = Some(child.id));
        child.with_connections_mut(|c| {
            c.children.insert(orphan.id);
        });

        tree.erase(&map, child.id);
        assert_eq!(orphan.parent(), Some(root.id));
    }
}
