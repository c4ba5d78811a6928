use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use tracing::debug;

use crate::enums::StorageType;
use crate::volume::{RawVolume, ResampledVolume, VoxelArray};

/// Pole of the cubic B-spline prefilter.
const CUBIC_POLE: f64 = -0.267_949_192_431_122_7; // sqrt(3) - 2

/// Edge samples repeated on each side of a line before prefiltering, so the
/// spline sees the edge value extended past the boundary.
const EDGE_PADDING: usize = 12;

/// Order-3 spline resampling between two voxel spacings.
pub struct Interpolator;

impl Interpolator {
    /// Shape that keeps the physical extent when going from `old_spacing` to
    /// `new_spacing`, rounded to whole voxels.
    pub fn target_shape(
        shape: (usize, usize, usize),
        old_spacing: [f64; 3],
        new_spacing: [f64; 3],
    ) -> (usize, usize, usize) {
        // empty axes stay empty
        let axis = |n: usize, i: usize| -> usize {
            if n == 0 {
                return 0;
            }
            ((n as f64 * old_spacing[i] / new_spacing[i]).round() as usize).max(1)
        };
        (axis(shape.0, 0), axis(shape.1, 1), axis(shape.2, 2))
    }

    /// Resize factor actually applied per axis, derived from the rounded
    /// target shape rather than the raw spacing ratio.
    pub fn resize_factor(
        shape: (usize, usize, usize),
        target: (usize, usize, usize),
    ) -> [f64; 3] {
        [
            target.0 as f64 / shape.0 as f64,
            target.1 as f64 / shape.1 as f64,
            target.2 as f64 / shape.2 as f64,
        ]
    }

    /// Resample `data` from `old_spacing` to `new_spacing`.
    pub fn resample(data: &Array3<f32>, old_spacing: [f64; 3], new_spacing: [f64; 3]) -> Array3<f32> {
        let target = Self::target_shape(data.dim(), old_spacing, new_spacing);
        Self::zoom(data, target)
    }

    /// Resize `data` to `target` with a separable cubic B-spline, extending
    /// edge values past the boundary.
    pub fn zoom(data: &Array3<f32>, target: (usize, usize, usize)) -> Array3<f32> {
        let target = [target.0, target.1, target.2];
        let mut current = data.clone();
        for (axis, &len) in target.iter().enumerate() {
            if current.len_of(Axis(axis)) != len {
                current = Self::zoom_axis(&current, Axis(axis), len);
            }
        }
        current
    }

    fn zoom_axis(data: &Array3<f32>, axis: Axis, len: usize) -> Array3<f32> {
        let mut shape = data.raw_dim();
        shape[axis.index()] = len;
        let mut out = Array3::<f32>::zeros(shape);
        Zip::from(out.lanes_mut(axis))
            .and(data.lanes(axis))
            .par_for_each(|out_lane, in_lane| Self::zoom_line(in_lane, out_lane));
        out
    }

    fn zoom_line(input: ArrayView1<'_, f32>, mut output: ArrayViewMut1<'_, f32>) {
        let n_in = input.len();
        let n_out = output.len();
        match n_in {
            0 => {
                output.fill(0.0);
                return;
            }
            1 => {
                output.fill(input[0]);
                return;
            }
            _ => {}
        }

        let mut coefficients = Self::pad_edges(input);
        Self::prefilter(&mut coefficients);

        let step = if n_out > 1 {
            (n_in - 1) as f64 / (n_out - 1) as f64
        } else {
            0.0
        };
        let offset = EDGE_PADDING as f64;
        for (j, value) in output.iter_mut().enumerate() {
            let x = (j as f64 * step).clamp(0.0, (n_in - 1) as f64);
            *value = Self::cubic_interpolate(&coefficients, x + offset) as f32;
        }
    }

    /// `input` widened to `f64` with [`EDGE_PADDING`] copies of its first and
    /// last sample on either side.
    fn pad_edges(input: ArrayView1<'_, f32>) -> Vec<f64> {
        let n = input.len();
        let first = f64::from(input[0]);
        let last = f64::from(input[n - 1]);
        std::iter::repeat_n(first, EDGE_PADDING)
            .chain(input.iter().map(|&v| f64::from(v)))
            .chain(std::iter::repeat_n(last, EDGE_PADDING))
            .collect()
    }

    /// In-place conversion of samples to cubic B-spline coefficients with
    /// mirror-symmetric boundaries. Lines are edge-padded first, so the
    /// mirror only ever reflects copies of the edge value.
    fn prefilter(c: &mut [f64]) {
        let n = c.len();
        if n < 2 {
            return;
        }
        let z = CUBIC_POLE;
        let gain = (1.0 - z) * (1.0 - 1.0 / z);
        for v in c.iter_mut() {
            *v *= gain;
        }

        // causal initialisation, truncated once z^k drops below f64 precision
        let horizon = (f64::EPSILON.ln() / z.abs().ln()).ceil() as usize;
        c[0] = if horizon < n {
            let mut zn = z;
            let mut sum = c[0];
            for &v in &c[1..horizon] {
                sum += zn * v;
                zn *= z;
            }
            sum
        } else {
            let iz = 1.0 / z;
            let mut zn = z;
            let mut z2n = z.powi(n as i32 - 1);
            let mut sum = c[0] + z2n * c[n - 1];
            z2n *= z2n * iz;
            for &v in &c[1..n - 1] {
                sum += (zn + z2n) * v;
                zn *= z;
                z2n *= iz;
            }
            sum / (1.0 - zn * zn)
        };
        for k in 1..n {
            c[k] += z * c[k - 1];
        }

        c[n - 1] = (z / (z * z - 1.0)) * (c[n - 1] + z * c[n - 2]);
        for k in (0..n - 1).rev() {
            c[k] = z * (c[k + 1] - c[k]);
        }
    }

    #[inline]
    fn mirror(index: isize, n: usize) -> usize {
        let n = n as isize;
        let period = 2 * (n - 1);
        let mut i = index.rem_euclid(period);
        if i >= n {
            i = period - i;
        }
        i as usize
    }

    #[inline]
    pub(crate) fn cubic_interpolate(coefficients: &[f64], x: f64) -> f64 {
        let n = coefficients.len();
        let x = x.clamp(0.0, (n - 1) as f64);
        let i = x.floor();
        let t = x - i;
        let i = i as isize;

        let one_minus_t = 1.0 - t;
        let t2 = t * t;
        let t3 = t2 * t;
        let weights = [
            one_minus_t * one_minus_t * one_minus_t / 6.0,
            (4.0 - 6.0 * t2 + 3.0 * t3) / 6.0,
            (1.0 + 3.0 * t + 3.0 * t2 - 3.0 * t3) / 6.0,
            t3 / 6.0,
        ];

        weights
            .iter()
            .enumerate()
            .map(|(k, w)| w * coefficients[Self::mirror(i - 1 + k as isize, n)])
            .sum()
    }
}

/// Resample a raw scan to `new_spacing`, stored as `storage`
///
/// # Arguments
///
/// * `raw` - Scan in Hounsfield units with its native spacing
/// * `new_spacing` - Target millimetres per voxel, (z, y, x)
/// * `storage` - Representation of the resampled voxels
///
/// The raw shape, spacing, origin and acquisition diagnostics are carried
/// over so the result can be mapped back to the raw scan.
pub fn resample_volume(
    raw: RawVolume,
    new_spacing: [f64; 3],
    storage: StorageType,
) -> ResampledVolume {
    let raw_shape = raw.dim();
    let target = Interpolator::target_shape(raw_shape, raw.spacing, new_spacing);
    debug!(
        ?raw_shape,
        ?target,
        factor = ?Interpolator::resize_factor(raw_shape, target),
        "resampling"
    );
    let resampled = Interpolator::zoom(&raw.data.mapv(f32::from), target);
    let data = VoxelArray::Float32(resampled).into_storage(storage);

    ResampledVolume {
        data,
        spacing: new_spacing,
        raw_shape,
        raw_spacing: raw.spacing,
        raw_origin: raw.origin,
        acquisition_exception: raw.acquisition_exception,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
        Array3::from_shape_fn(shape, |(z, y, x)| (z * 7 + y * 3 + x) as f32)
    }

    #[test]
    fn target_shape_preserves_physical_extent() {
        let shape = Interpolator::target_shape((10, 100, 100), [2.0, 1.0, 1.0], [1.0, 1.0, 1.0]);
        assert_eq!(shape, (20, 100, 100));

        let shape = Interpolator::target_shape((133, 512, 512), [2.5, 0.7, 0.7], [1.0, 1.0, 1.0]);
        assert_eq!(shape, (333, 358, 358));
    }

    #[test]
    fn resize_factor_comes_from_the_rounded_shape() {
        let target = Interpolator::target_shape((3, 3, 3), [1.0, 1.0, 1.0], [0.7, 0.7, 0.7]);
        assert_eq!(target, (4, 4, 4));
        let factor = Interpolator::resize_factor((3, 3, 3), target);
        assert_eq!(factor, [4.0 / 3.0; 3]);
    }

    #[test]
    fn round_trip_restores_the_original_shape() {
        let data = ramp((6, 9, 12));
        let a = [2.0, 1.5, 0.5];
        let b = [1.0, 0.75, 1.0];
        let there = Interpolator::resample(&data, a, b);
        assert_eq!(there.dim(), (12, 18, 6));
        let back = Interpolator::resample(&there, b, a);
        assert_eq!(back.dim(), data.dim());
    }

    #[test]
    fn identity_spacing_reproduces_the_input() {
        let data = ramp((4, 5, 6));
        let out = Interpolator::resample(&data, [1.0; 3], [1.0; 3]);
        assert_eq!(out, data);
    }

    #[test]
    fn cubic_spline_passes_through_the_samples() {
        let samples: Vec<f64> = (0..8).map(|v| 3.0 * v as f64 - 4.0).collect();
        let mut coefficients = samples.clone();
        Interpolator::prefilter(&mut coefficients);
        for (i, &s) in samples.iter().enumerate() {
            assert!((Interpolator::cubic_interpolate(&coefficients, i as f64) - s).abs() < 1e-6);
        }
    }

    #[test]
    fn constant_lines_stay_constant_when_upsampled() {
        let line = Array1::from_elem(5, -1000.0f32);
        let mut out = Array1::<f32>::zeros(11);
        Interpolator::zoom_line(line.view(), out.view_mut());
        assert!(out.iter().all(|&v| (v + 1000.0).abs() < 1e-3));
    }

    #[test]
    fn edge_values_extend_past_the_boundary() {
        let line = Array1::from(vec![100.0f32, 0.0, 0.0, 0.0, 0.0]);
        let mut out = Array1::<f32>::zeros(9);
        Interpolator::zoom_line(line.view(), out.view_mut());

        assert!((out[0] - 100.0).abs() < 1e-3);
        assert!((out[1] - 50.0).abs() < 1e-3);
        assert!(out[8].abs() < 1e-3);
        // a mirrored boundary would pull the first half-step towards 60
        assert!(out[1] < 55.0);
    }

    #[test]
    fn empty_lines_and_axes_do_not_panic() {
        let line = Array1::<f32>::zeros(0);
        let mut out = Array1::<f32>::from_elem(3, 7.0);
        Interpolator::zoom_line(line.view(), out.view_mut());
        assert!(out.iter().all(|&v| v == 0.0));

        let target = Interpolator::target_shape((4, 4, 0), [2.0, 1.0, 1.0], [1.0; 3]);
        assert_eq!(target, (8, 4, 0));
        let out = Interpolator::zoom(&Array3::zeros((4, 4, 0)), target);
        assert_eq!(out.dim(), (8, 4, 0));
    }

    #[test]
    fn resampled_volume_keeps_raw_metadata() {
        let raw = RawVolume {
            data: Array3::from_elem((10, 100, 100), -500),
            spacing: [2.0, 1.0, 1.0],
            origin: Some([1.0, 2.0, 3.0]),
            acquisition_exception: None,
        };
        let resampled = resample_volume(raw, [1.0, 1.0, 1.0], StorageType::Int16);
        assert_eq!(resampled.dim(), (20, 100, 100));
        assert_eq!(resampled.raw_shape, (10, 100, 100));
        assert_eq!(resampled.raw_spacing, [2.0, 1.0, 1.0]);
        assert_eq!(resampled.raw_origin, Some([1.0, 2.0, 3.0]));
        assert_eq!(resampled.extent(), [20.0, 100.0, 100.0]);
        let VoxelArray::Int16(data) = resampled.data else {
            panic!("expected int16 storage");
        };
        assert!(data.iter().all(|&v| v == -500));
    }
}
