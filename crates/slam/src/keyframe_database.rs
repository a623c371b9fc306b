use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::{KeyFrameId, WordId};

use crate::covisibility::CovisibilityGraph;
use crate::keyframe::BowVector;
use crate::map::Map;

/// Inverted index mapping visual word id to the set of keyframes whose BoW
/// contains that word, used to propose loop-closure and relocalization
/// candidates. The vocabulary that assigns words is external; this type
/// only maintains the index and runs the two candidate queries.
pub struct KeyFrameDatabase {
    inverted: RwLock<BTreeMap<WordId, BTreeSet<KeyFrameId>>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, kf_id: KeyFrameId, bow: &BowVector) {
        let mut index = self.inverted.write().unwrap();
        for &word in bow.weights.keys() {
            index.entry(word).or_default().insert(kf_id);
        }
    }

    pub fn erase(&self, kf_id: KeyFrameId, bow: &BowVector) {
        let mut index = self.inverted.write().unwrap();
        for &word in bow.weights.keys() {
            if let Some(set) = index.get_mut(&word) {
                set.remove(&kf_id);
            }
        }
    }

    fn keyframes_sharing_a_word(&self, bow: &BowVector) -> BTreeMap<KeyFrameId, u32> {
        let index = self.inverted.read().unwrap();
        let mut shared = BTreeMap::new();
        for &word in bow.weights.keys() {
            if let Some(set) = index.get(&word) {
                for &kf in set {
                    *shared.entry(kf).or_insert(0) += 1;
                }
            }
        }
        shared
    }

    pub fn detect_loop_candidates(
        &self,
        map: &Map,
        covis: &CovisibilityGraph,
        kf_id: KeyFrameId,
        group_size: usize,
        word_ratio: f64,
        group_ratio: f64,
    ) -> Vec<KeyFrameId> {
        let Some(kf) = map.keyframe(kf_id) else { return Vec::new() };
        let bow = kf.bow();
        let neighbors: BTreeSet<KeyFrameId> = covis.vector_covisible_keyframes(map, kf_id).into_iter().collect();

        let mut shared = self.keyframes_sharing_a_word(&bow);
        shared.remove(&kf_id);
        for n in &neighbors {
            shared.remove(n);
        }
        if shared.is_empty() {
            return Vec::new();
        }

        let max_shared = *shared.values().max().unwrap();
        let survivor_floor = (max_shared as f64 * word_ratio) as u32;

        let mut scores: BTreeMap<KeyFrameId, f32> = BTreeMap::new();
        for (&cand_id, &count) in &shared {
            if count < survivor_floor {
                continue;
            }
            if let Some(cand) = map.keyframe(cand_id) {
                scores.insert(cand_id, bow_score(&bow, &cand.bow()));
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        group_and_select(map, covis, &scores, group_size, group_ratio)
    }

    pub fn detect_relocalization_candidates(
        &self,
        map: &Map,
        covis: &CovisibilityGraph,
        query_bow: &BowVector,
        group_size: usize,
        word_ratio: f64,
        group_ratio: f64,
    ) -> Vec<KeyFrameId> {
        let shared = self.keyframes_sharing_a_word(query_bow);
        if shared.is_empty() {
            return Vec::new();
        }
        let max_shared = *shared.values().max().unwrap();
        let survivor_floor = (max_shared as f64 * word_ratio) as u32;

        let mut scores: BTreeMap<KeyFrameId, f32> = BTreeMap::new();
        for (&cand_id, &count) in &shared {
            if count < survivor_floor {
                continue;
            }
            if let Some(cand) = map.keyframe(cand_id) {
                scores.insert(cand_id, bow_score(query_bow, &cand.bow()));
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }
        group_and_select(map, covis, &scores, group_size, group_ratio)
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Group each survivor with its best covisibility neighbors, accumulate
/// scores within a group, and keep the best-scoring member of every group
/// whose accumulated score survives `group_ratio` of the best group.
fn group_and_select(
    map: &Map,
    covis: &CovisibilityGraph,
    scores: &BTreeMap<KeyFrameId, f32>,
    group_size: usize,
    group_ratio: f64,
) -> Vec<KeyFrameId> {
    let mut groups: Vec<(KeyFrameId, f32)> = Vec::new();
    for (&s, &self_score) in scores {
        let mut acc = self_score;
        let mut best_kf = s;
        let mut best_score = self_score;
        for n in covis.best_covisibility_keyframes(map, s, group_size) {
            if let Some(&sc) = scores.get(&n) {
                acc += sc;
                if sc > best_score {
                    best_score = sc;
                    best_kf = n;
                }
            }
        }
        groups.push((best_kf, acc));
    }

    let best_acc = groups.iter().map(|(_, acc)| *acc).fold(0.0f32, f32::max);
    let floor = best_acc * group_ratio as f32;

    let mut out: BTreeMap<KeyFrameId, f32> = BTreeMap::new();
    for (kf, acc) in groups {
        if acc >= floor {
            out.entry(kf).and_modify(|best| { if acc > *best { *best = acc } }).or_insert(acc);
        }
    }
    out.into_keys().collect()
}

/// L1 bag-of-words similarity score in `[0, 1]`, 1 for identical vectors.
pub fn bow_score(a: &BowVector, b: &BowVector) -> f32 {
    let mut l1 = 0.0f32;
    let mut words: BTreeSet<WordId> = a.weights.keys().copied().collect();
    words.extend(b.weights.keys().copied());
    for w in words {
        let va = a.weights.get(&w).copied().unwrap_or(0.0);
        let vb = b.weights.get(&w).copied().unwrap_or(0.0);
        l1 += (va - vb).abs();
    }
    (1.0 - 0.5 * l1).clamp(0.0, 1.0)
}
