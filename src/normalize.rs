use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::volume::VoxelArray;

/// Mean of the `[0, 1]` normalized LUNA16 scans, subtracted to zero-center.
pub const PIXEL_MEAN: f32 = 0.25;

pub const HISTOGRAM_BINS: usize = 80;
pub const HISTOGRAM_DOMAIN: (f64, f64) = (-1000.0, 600.0);

/// Clinically relevant HU window, `lo < hi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct TissueRange {
    pub lo: i32,
    pub hi: i32,
}

impl TissueRange {
    pub fn new(lo: i32, hi: i32) -> Option<Self> {
        (lo < hi).then_some(Self { lo, hi })
    }

    pub fn width(&self) -> i32 {
        self.hi - self.lo
    }
}

impl Default for TissueRange {
    fn default() -> Self {
        Self { lo: -1000, hi: 400 }
    }
}

impl From<[i32; 2]> for TissueRange {
    fn from([lo, hi]: [i32; 2]) -> Self {
        Self { lo, hi }
    }
}

impl From<TissueRange> for [i32; 2] {
    fn from(range: TissueRange) -> Self {
        [range.lo, range.hi]
    }
}

/// Clip a scan to the tissue range. Integer scans are shifted to
/// `[0, hi - lo]`; float scans are scaled to `[0, 1]` and zero-centered.
pub fn normalize(voxels: VoxelArray, range: TissueRange) -> VoxelArray {
    match voxels {
        VoxelArray::Int16(data) => VoxelArray::Int16(clip_int16(data, range)),
        VoxelArray::Float32(data) => {
            VoxelArray::Float32(zero_center(normalize_unit(data, range)))
        }
    }
}

pub fn clip_int16(mut data: Array3<i16>, range: TissueRange) -> Array3<i16> {
    let width = range.width();
    data.mapv_inplace(|v| (i32::from(v) - range.lo).clamp(0, width) as i16);
    data
}

/// `(v - lo) / (hi - lo)`, clamped to `[0, 1]`.
pub fn normalize_unit(mut data: Array3<f32>, range: TissueRange) -> Array3<f32> {
    let lo = range.lo as f32;
    let width = range.width() as f32;
    data.mapv_inplace(|v| ((v - lo) / width).clamp(0.0, 1.0));
    data
}

pub fn zero_center(mut data: Array3<f32>) -> Array3<f32> {
    data.mapv_inplace(|v| v - PIXEL_MEAN);
    data
}

/// Density-normalized value histogram over a fixed HU domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueHistogram {
    pub density: Vec<f64>,
    /// `density.len() + 1` bin edges.
    pub bin_edges: Vec<f64>,
}

/// Histogram of the scan before it is clipped, over [`HISTOGRAM_DOMAIN`].
/// Values outside the domain are not counted; the last bin is closed.
pub fn value_histogram(voxels: &VoxelArray) -> ValueHistogram {
    let (lo, hi) = HISTOGRAM_DOMAIN;
    let bin_width = (hi - lo) / HISTOGRAM_BINS as f64;
    let mut counts = vec![0u64; HISTOGRAM_BINS];

    for value in voxels.values() {
        if !(lo..=hi).contains(&value) {
            continue;
        }
        let bin = (((value - lo) / bin_width) as usize).min(HISTOGRAM_BINS - 1);
        counts[bin] += 1;
    }

    let total: u64 = counts.iter().sum();
    let density = if total == 0 {
        vec![0.0; HISTOGRAM_BINS]
    } else {
        counts
            .iter()
            .map(|&count| count as f64 / (total as f64 * bin_width))
            .collect()
    };
    let bin_edges = (0..=HISTOGRAM_BINS)
        .map(|i| lo + i as f64 * bin_width)
        .collect();

    ValueHistogram { density, bin_edges }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<i16> {
        vec![-3000, -1200, -1000, -999, -500, 0, 399, 400, 401, 3071, i16::MIN, i16::MAX]
    }

    fn as_f32(values: &[i16]) -> Array3<f32> {
        Array3::from_shape_vec((1, 1, values.len()), values.iter().map(|&v| f32::from(v)).collect())
            .unwrap()
    }

    #[test]
    fn int16_output_stays_within_the_window() {
        for (lo, hi) in [(-1000, 400), (-1200, 600), (-160, 240), (0, 1), (-32767, 0)] {
            let range = TissueRange::new(lo, hi).unwrap();
            let data = Array3::from_shape_vec((1, 1, 12), values()).unwrap();
            let clipped = clip_int16(data, range);
            let width = hi - lo;
            assert!(clipped.iter().all(|&v| (0..=width).contains(&i32::from(v))));
        }
    }

    #[test]
    fn float_output_stays_within_unit_range_before_centering() {
        for (lo, hi) in [(-1000, 400), (-1200, 600), (-160, 240), (0, 1)] {
            let range = TissueRange::new(lo, hi).unwrap();
            let unit = normalize_unit(as_f32(&values()), range);
            assert!(unit.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn values_below_the_window_clip_to_zero() {
        let data = Array3::from_shape_vec((1, 1, 3), vec![-1200i16, -1000, 400]).unwrap();
        let VoxelArray::Int16(clipped) =
            normalize(VoxelArray::Int16(data), TissueRange::default())
        else {
            panic!("expected int16 storage");
        };
        assert_eq!(clipped.as_slice().unwrap(), &[0, 0, 1400]);
    }

    #[test]
    fn float_normalization_is_zero_centered() {
        let VoxelArray::Float32(out) = normalize(
            VoxelArray::Float32(as_f32(&[-1200, -300, 400, 900])),
            TissueRange::default(),
        ) else {
            panic!("expected float32 storage");
        };
        let expected = [-0.25, 0.25, 0.75, 0.75];
        for (v, e) in out.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6);
        }
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(TissueRange::new(400, -1000).is_none());
        assert!(TissueRange::new(0, 0).is_none());
    }

    #[test]
    fn histogram_is_a_density_over_the_fixed_domain() {
        let data = Array3::from_shape_vec((1, 1, 5), vec![-2000i16, -1000, -990, 600, 1000]).unwrap();
        let histogram = value_histogram(&VoxelArray::Int16(data));

        assert_eq!(histogram.density.len(), HISTOGRAM_BINS);
        assert_eq!(histogram.bin_edges.len(), HISTOGRAM_BINS + 1);
        assert_eq!(histogram.bin_edges[0], -1000.0);
        assert_eq!(histogram.bin_edges[HISTOGRAM_BINS], 600.0);

        // three values in range, bin width 20
        let per_value = 1.0 / (3.0 * 20.0);
        assert!((histogram.density[0] - 2.0 * per_value).abs() < 1e-12);
        assert!((histogram.density[HISTOGRAM_BINS - 1] - per_value).abs() < 1e-12);
        let integral: f64 = histogram.density.iter().map(|d| d * 20.0).sum();
        assert!((integral - 1.0).abs() < 1e-9);
    }

    #[test]
    fn histogram_of_out_of_domain_scan_is_empty() {
        let data = Array3::from_elem((2, 2, 2), 2000i16);
        let histogram = value_histogram(&VoxelArray::Int16(data));
        assert!(histogram.density.iter().all(|&d| d == 0.0));
    }
}
