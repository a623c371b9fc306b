/// Tunable constants for the local mapping backend.
///
/// Every numeric threshold named in the component design is surfaced here
/// rather than hard-coded, including the one the original source flags as a
/// probably-wrong magic number (`projection_motion_threshold`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMapperConfig {
    /// Minimum shared-observation count for a covisibility edge; below this
    /// only the single heaviest edge is kept.
    pub covisibility_weight_threshold: u32,
    /// `nFound / nVisible` floor below which a map point is culled.
    pub found_ratio_threshold: f64,
    /// Keyframe-age (in keyframes inserted since creation) at which a point
    /// with too few observations is culled.
    pub culling_age_recent: u64,
    /// Keyframe-age at which a point leaves probation regardless of outcome.
    pub culling_age_retire: u64,
    /// Minimum observation count required to survive `culling_age_recent`.
    pub culling_min_observations: u32,
    /// High Hamming-distance acceptance bound for wide-baseline matches.
    pub th_high: u32,
    /// Low Hamming-distance acceptance bound for epipolar-constrained matches.
    pub th_low: u32,
    /// Number of bins in the rotation-consistency histogram.
    pub histo_length: usize,
    /// Field-of-view gate: reject a candidate whose viewing cosine is below
    /// this (`cos(60 deg)`).
    pub fov_cos_threshold: f64,
    /// Chi-squared 95% threshold, 2 degrees of freedom (reprojection error).
    pub chi2_2dof: f64,
    /// Chi-squared 95% threshold, 1 degree of freedom (epipolar distance).
    pub chi2_1dof: f64,
    /// Epipole-proximity exclusion radius factor used by
    /// `SearchForTriangulation`.
    pub epipole_exclusion_factor: f64,
    /// Scale-consistency tolerance factor (`1.5 * scaleFactor`).
    pub ratio_factor: f64,
    /// Fraction of a keyframe's stereo points that must be redundantly
    /// observed for `KeyFrameCulling` to mark it bad.
    pub keyframe_culling_redundancy_ratio: f64,
    /// Minimum number of other observers (at an equal-or-finer scale) for a
    /// point to count as redundant.
    pub keyframe_culling_min_observers: u32,
    /// Number of top covisibility neighbors considered by
    /// `CreateNewMapPoints` and `SearchInNeighbors`.
    pub top_neighbors_for_triangulation: usize,
    pub top_neighbors_for_fusion: usize,
    /// `DetectLoopCandidates`' shared-word survival fraction of the max.
    pub loop_candidate_word_ratio: f64,
    /// `DetectLoopCandidates`' group-score survival fraction of the best.
    pub loop_candidate_group_ratio: f64,
    /// Number of covisibility neighbors grouped with each loop candidate.
    pub loop_candidate_group_size: usize,
    /// Forward/backward motion classification threshold used by the
    /// last-frame projection search. Units are unclear in the source this
    /// was distilled from, which flags it as possibly wrong; kept
    /// configurable rather than hard-coded for that reason.
    pub projection_motion_threshold: f64,
    /// Sleep between worker loop iterations when there is no work.
    pub worker_poll_interval: std::time::Duration,
    /// Minimum camera-center separation between two keyframes required
    /// before `CreateNewMapPoints` attempts triangulation between them
    /// (stands in for the stereo `bf/fx` baseline gate of a system with a
    /// real stereo rig; this backend is RGB-D/monocular-keyframe, so the
    /// gate is expressed directly in meters).
    pub min_triangulation_baseline: f64,
    /// Upper bound (exclusive) on triangulated parallax cosine; paired with
    /// a lower bound of `0.0` (both hard-coded per spec, not configurable,
    /// since they define what "parallax" even means here).
    pub parallax_cos_max: f64,
    /// Nearest-neighbor ratio used when matching for triangulation.
    pub nn_ratio_triangulation: f64,
    /// Nearest-neighbor ratio used when matching for local-map projection.
    pub nn_ratio_projection: f64,
    /// Search radius scale (`th`) passed to `Fuse` during `SearchInNeighbors`.
    pub fuse_radius_th: f64,
    /// Maximum per-feature depth (meters) counted as "eligible" for
    /// `KeyFrameCulling`'s redundancy ratio (stand-in for ORB-SLAM2's
    /// `mThDepth`).
    pub keyframe_culling_max_depth: f64,
    /// Outer Gauss-Newton iteration cap for `LocalBundleAdjustment`.
    pub local_ba_max_iterations: usize,
}

impl Default for LocalMapperConfig {
    fn default() -> Self {
        Self {
            covisibility_weight_threshold: 15,
            found_ratio_threshold: 0.25,
            culling_age_recent: 2,
            culling_age_retire: 3,
            culling_min_observations: 3,
            th_high: 100,
            th_low: 50,
            histo_length: 30,
            fov_cos_threshold: 0.5,
            chi2_2dof: 5.991,
            chi2_1dof: 3.84,
            epipole_exclusion_factor: 100.0,
            ratio_factor: 1.5,
            keyframe_culling_redundancy_ratio: 0.9,
            keyframe_culling_min_observers: 3,
            top_neighbors_for_triangulation: 10,
            top_neighbors_for_fusion: 10,
            loop_candidate_word_ratio: 0.8,
            loop_candidate_group_ratio: 0.75,
            loop_candidate_group_size: 10,
            projection_motion_threshold: 40.0,
            worker_poll_interval: std::time::Duration::from_millis(3),
            min_triangulation_baseline: 0.01,
            parallax_cos_max: 0.9998,
            nn_ratio_triangulation: 0.6,
            nn_ratio_projection: 0.8,
            fuse_radius_th: 3.0,
            keyframe_culling_max_depth: 3.0,
            local_ba_max_iterations: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_constants() {
        let cfg = LocalMapperConfig::default();
        assert_eq!(cfg.th_high, 100);
        assert_eq!(cfg.th_low, 50);
        assert_eq!(cfg.histo_length, 30);
        assert_eq!(cfg.covisibility_weight_threshold, 15);
        assert!((cfg.chi2_2dof - 5.991).abs() < 1e-9);
        assert!((cfg.chi2_1dof - 3.84).abs() < 1e-9);
        assert!((cfg.fov_cos_threshold - 0.5).abs() < 1e-9);
    }
}
