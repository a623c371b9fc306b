use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::KeyFrameId;

use crate::map::Map;

/// Weighted undirected graph over keyframes, derived from shared map-point
/// observations. Stores no state of its own beyond a serialization lock;
/// weights and neighbor lists live on each `KeyFrame`'s own `Connections`
/// field so readers can take a keyframe-local lock instead of a global one.
pub struct CovisibilityGraph {
    /// Serializes multi-keyframe updates so two concurrent
    /// `update_connections` calls can't interleave their symmetric writes.
    lock: Mutex<()>,
    weight_threshold: u32,
}

impl CovisibilityGraph {
    pub fn new(weight_threshold: u32) -> Self {
        Self {
            lock: Mutex::new(()),
            weight_threshold,
        }
    }

    /// Recompute `kf`'s neighbors from the current observation tables of
    /// every map point it sees, install the symmetric edges, and (per the
    /// component design) set `kf`'s spanning-tree parent to its top
    /// neighbor if it does not already have one.
    pub fn update_connections(&self, map: &Map, kf_id: KeyFrameId) {
        let _guard = self.lock.lock().unwrap();
        let Some(kf) = map.keyframe(kf_id) else {
            return;
        };
        if kf.is_bad() {
            return;
        }

        let mut counts: BTreeMap<KeyFrameId, u32> = BTreeMap::new();
        for mp_slot in kf.all_map_points() {
            let Some(mp_id) = mp_slot else { continue };
            let Some(mp) = map.map_point(mp_id) else { continue };
            if mp.is_bad() {
                continue;
            }
            for (&other_id, _) in mp.observations().iter() {
                if other_id == kf_id {
                    continue;
                }
                *counts.entry(other_id).or_insert(0) += 1;
            }
        }

        let mut edges: Vec<(KeyFrameId, u32)> = if counts.values().any(|&w| w >= self.weight_threshold) {
            counts
                .into_iter()
                .filter(|(_, w)| *w >= self.weight_threshold)
                .collect()
        } else if let Some((&best_id, &best_w)) = counts.iter().max_by_key(|(id, w)| (**w, std::cmp::Reverse(**id))) {
            vec![(best_id, best_w)]
        } else {
            Vec::new()
        };

        // descending weight, tie-break ascending keyframe id
        edges.sort_by(|(id_a, w_a), (id_b, w_b)| w_b.cmp(w_a).then(id_a.cmp(id_b)));

        for &(other_id, weight) in &edges {
            if let Some(other) = map.keyframe(other_id) {
                other.with_connections_mut(|c| {
                    c.covisibility_weights.insert(kf_id, weight);
                    resort(c);
                });
            }
        }

        let top_neighbor = edges.first().map(|(id, _)| *id);
        kf.with_connections_mut(|c| {
            c.covisibility_weights = edges.iter().copied().collect();
            c.ordered_neighbors = edges.clone();
            if c.parent.is_none() {
                c.parent = top_neighbor;
            }
        });
    }

    pub fn best_covisibility_keyframes(&self, map: &Map, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        map.keyframe(kf_id)
            .map(|kf| kf.best_covisibility_neighbors(n))
            .unwrap_or_default()
    }

    pub fn covisibles_by_weight(&self, map: &Map, kf_id: KeyFrameId, min_weight: u32) -> Vec<KeyFrameId> {
        map.keyframe(kf_id)
            .map(|kf| kf.covisibles_by_weight(min_weight))
            .unwrap_or_default()
    }

    pub fn vector_covisible_keyframes(&self, map: &Map, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        map.keyframe(kf_id)
            .map(|kf| kf.connections().ordered_neighbors.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    /// Drop `kf` from every other keyframe's neighbor list, used by
    /// `KeyFrameCulling`/`SetBadFlag`.
    pub fn erase(&self, map: &Map, kf_id: KeyFrameId) {
        let _guard = self.lock.lock().unwrap();
        let Some(kf) = map.keyframe(kf_id) else { return };
        let neighbors: Vec<KeyFrameId> = kf.connections().ordered_neighbors.into_iter().map(|(id, _)| id).collect();
        for other_id in neighbors {
            if let Some(other) = map.keyframe(other_id) {
                other.with_connections_mut(|c| {
                    c.covisibility_weights.remove(&kf_id);
                    resort(c);
                });
            }
        }
        kf.with_connections_mut(|c| {
            c.covisibility_weights.clear();
            c.ordered_neighbors.clear();
        });
    }
}

fn resort(c: &mut crate::keyframe::Connections) {
    let mut edges: Vec<(KeyFrameId, u32)> = c.covisibility_weights.iter().map(|(&id, &w)| (id, w)).collect();
    edges.sort_by(|(id_a, w_a), (id_b, w_b)| w_b.cmp(w_a).then(id_a.cmp(id_b)));
    c.ordered_neighbors = edges;
}
