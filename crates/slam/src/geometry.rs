/// Pinhole camera intrinsics for an RGB-D sensor, plus the depth scale used
/// to convert raw depth samples to meters. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Depth units per meter (e.g. 5000.0 for a TUM-style 16-bit depth image).
    pub depth_scale: f64,
}

impl CameraIntrinsics {
    /// Project a camera-frame point to a pixel, returning `None` if it falls
    /// behind the camera.
    pub fn project(&self, p: &nalgebra::Point3<f64>) -> Option<(f64, f64)> {
        if p.z <= 0.0 {
            return None;
        }
        Some((
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Back-project a pixel plus metric depth to a camera-frame point.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> nalgebra::Point3<f64> {
        nalgebra::Point3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    pub fn in_bounds(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64
    }
}

/// A detected feature location in an image, already undistorted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the feature was detected at (0 = full resolution).
    pub octave: u32,
    /// Dominant orientation in degrees, `[0, 360)`, used for the matcher's
    /// rotation-consistency histogram.
    pub angle: f32,
}

/// Per-pyramid-level scale bookkeeping, precomputed once for a camera's
/// feature pyramid (mirrors the constant tables an ORB extractor publishes
/// alongside its keypoints).
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLevels {
    pub scale_factors: Vec<f32>,
    pub inv_scale_factors: Vec<f32>,
    pub level_sigma2: Vec<f32>,
    pub inv_level_sigma2: Vec<f32>,
}

impl ScaleLevels {
    /// Build the standard geometric pyramid: level `i` has scale
    /// `scale_factor.powi(i)` and sigma^2 `scale^2`.
    pub fn new(n_levels: usize, scale_factor: f32) -> Self {
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut level_sigma2 = Vec::with_capacity(n_levels);
        scale_factors.push(1.0f32);
        level_sigma2.push(1.0f32);
        for i in 1..n_levels {
            let s = scale_factors[i - 1] * scale_factor;
            scale_factors.push(s);
            level_sigma2.push(s * s);
        }
        let inv_scale_factors = scale_factors.iter().map(|s| 1.0 / s).collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s| 1.0 / s).collect();
        Self {
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Clamp a predicted pyramid level into the valid range, per the open
    /// question in the design notes on out-of-range scale predictions.
    pub fn clamp_level(&self, level: i32) -> usize {
        level.clamp(0, self.num_levels() as i32 - 1) as usize
    }
}

/// 256-bit binary feature descriptor (32 bytes, packed as four `u64`s),
/// compared by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor256(pub [u64; 4]);

impl Descriptor256 {
    pub const ZERO: Descriptor256 = Descriptor256([0; 4]);

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(buf);
        }
        Descriptor256(words)
    }

    /// Number of differing bits between two descriptors.
    pub fn hamming_distance(&self, other: &Descriptor256) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Componentwise mean descriptor (nearest integer, bit-majority per
    /// byte), used when building a map point's representative descriptor
    /// from all of its observations. Mirrors the original's "pick the
    /// observation whose distance to all others is smallest" median rule
    /// rather than an actual bitwise average, since binary descriptors
    /// don't average meaningfully.
    pub fn median_of(descriptors: &[Descriptor256]) -> Option<Descriptor256> {
        if descriptors.is_empty() {
            return None;
        }
        if descriptors.len() == 1 {
            return Some(descriptors[0]);
        }
        let n = descriptors.len();
        let mut distances = vec![vec![0u32; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = descriptors[i].hamming_distance(&descriptors[j]);
                distances[i][j] = d;
                distances[j][i] = d;
            }
        }
        let mut best_idx = 0;
        let mut best_median = u32::MAX;
        for (i, row) in distances.iter().enumerate() {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            let median = sorted[n / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }
        Some(descriptors[best_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_distance_identical_is_zero() {
        let a = Descriptor256([0x1234_5678_9abc_def0; 4]);
        assert_eq!(a.hamming_distance(&a), 0);
    }

    #[test]
    fn hamming_distance_counts_all_differing_bits() {
        let a = Descriptor256([0, 0, 0, 0]);
        let b = Descriptor256([u64::MAX, 0, 0, 0]);
        assert_eq!(a.hamming_distance(&b), 64);
    }

    #[test]
    fn hamming_distance_is_symmetric() {
        let a = Descriptor256([1, 2, 3, 4]);
        let b = Descriptor256([5, 6, 7, 8]);
        assert_eq!(a.hamming_distance(&b), b.hamming_distance(&a));
    }

    #[test]
    fn from_bytes_round_trips_through_words() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let d = Descriptor256::from_bytes(&bytes);
        assert_eq!(d.0[0], u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn median_of_single_descriptor_is_itself() {
        let d = Descriptor256([9, 9, 9, 9]);
        assert_eq!(Descriptor256::median_of(&[d]), Some(d));
    }

    #[test]
    fn median_of_empty_is_none() {
        assert_eq!(Descriptor256::median_of(&[]), None);
    }

    #[test]
    fn median_of_picks_most_central_descriptor() {
        let center = Descriptor256([0, 0, 0, 0]);
        let near = Descriptor256([0b1, 0, 0, 0]);
        let far = Descriptor256([u64::MAX, u64::MAX, u64::MAX, u64::MAX]);
        let picked = Descriptor256::median_of(&[far, center, near]).unwrap();
        assert_eq!(picked, center);
    }

    #[test]
    fn scale_levels_first_level_is_identity() {
        let levels = ScaleLevels::new(8, 1.2);
        assert_eq!(levels.scale_factors[0], 1.0);
        assert_eq!(levels.level_sigma2[0], 1.0);
        assert_eq!(levels.num_levels(), 8);
    }

    #[test]
    fn scale_levels_grow_geometrically() {
        let levels = ScaleLevels::new(4, 2.0);
        assert_eq!(levels.scale_factors, vec![1.0, 2.0, 4.0, 8.0]);
        assert_eq!(levels.level_sigma2, vec![1.0, 4.0, 16.0, 64.0]);
    }

    #[test]
    fn scale_levels_inverse_tables_are_reciprocal() {
        let levels = ScaleLevels::new(5, 1.2);
        for i in 0..5 {
            assert!((levels.inv_scale_factors[i] * levels.scale_factors[i] - 1.0).abs() < 1e-6);
            assert!((levels.inv_level_sigma2[i] * levels.level_sigma2[i] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn clamp_level_keeps_in_range_values() {
        let levels = ScaleLevels::new(8, 1.2);
        assert_eq!(levels.clamp_level(3), 3);
    }

    #[test]
    fn clamp_level_clamps_out_of_range_values() {
        let levels = ScaleLevels::new(8, 1.2);
        assert_eq!(levels.clamp_level(-1), 0);
        assert_eq!(levels.clamp_level(100), 7);
    }

    #[test]
    fn camera_intrinsics_project_and_unproject_round_trip() {
        let k = CameraIntrinsics {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        };
        let p = k.unproject(300.0, 200.0, 2.5);
        let (u, v) = k.project(&p).unwrap();
        assert!((u - 300.0).abs() < 1e-9);
        assert!((v - 200.0).abs() < 1e-9);
    }

    #[test]
    fn camera_intrinsics_rejects_points_behind_camera() {
        let k = CameraIntrinsics {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        };
        let behind = nalgebra::Point3::new(0.0, 0.0, -1.0);
        assert_eq!(k.project(&behind), None);
    }

    #[test]
    fn camera_intrinsics_in_bounds() {
        let k = CameraIntrinsics {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        };
        assert!(k.in_bounds(0.0, 0.0));
        assert!(k.in_bounds(639.9, 479.9));
        assert!(!k.in_bounds(640.0, 0.0));
        assert!(!k.in_bounds(-0.1, 0.0));
    }
}
