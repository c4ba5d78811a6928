//! Per-slice lung rectangles and their reduction to one in-plane crop box.

use image::GrayImage;
use imageproc::{
    contours::{BorderType, Contour, find_contours},
    point::Point,
};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Mask values above this count as lung.
pub const MASK_THRESHOLD: u8 = 128;

/// Smallest contour kept, both in boundary points and in enclosed area.
const MIN_CONTOUR_POINTS: usize = 3;
const MIN_CONTOUR_AREA: f64 = 3.0;

/// Extent of the lung contours found on one slice, in native pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceRect {
    pub y_min: usize,
    pub y_max: usize,
    pub x_min: usize,
    pub x_max: usize,
}

/// In-plane crop applied over the full depth of a scan. Upper bounds are
/// exclusive slice limits and never exceed the native extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropBox {
    pub y_min: usize,
    pub y_max: usize,
    pub x_min: usize,
    pub x_max: usize,
}

impl CropBox {
    pub fn full(rows: usize, cols: usize) -> Self {
        Self {
            y_min: 0,
            y_max: rows,
            x_min: 0,
            x_max: cols,
        }
    }

    /// (rows, cols), counting both bounds.
    pub fn shape(&self) -> (usize, usize) {
        (self.y_max - self.y_min + 1, self.x_max - self.x_min + 1)
    }

    /// `[y_min, y_max, x_min, x_max]`
    pub fn coords(&self) -> [usize; 4] {
        [self.y_min, self.y_max, self.x_min, self.x_max]
    }
}

fn shoelace_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y)
        })
        .sum();
    (twice as f64 / 2.0).abs()
}

fn is_lung_contour(contour: &Contour<i32>) -> bool {
    contour.border_type == BorderType::Outer
        && contour.parent.is_none()
        && contour.points.len() >= MIN_CONTOUR_POINTS
        && shoelace_area(&contour.points) >= MIN_CONTOUR_AREA
}

fn binarize(mask: ArrayView2<'_, u8>) -> GrayImage {
    let (rows, cols) = mask.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        let lung = mask[[y as usize, x as usize]] > MASK_THRESHOLD;
        image::Luma([if lung { 255 } else { 0 }])
    })
}

/// Bounding rectangle of the external lung contours of one mask.
///
/// `bounds_yx` is the part of the mask covered by the scan (the rest of the
/// model canvas is padding); maxima are clamped to it before scaling back to
/// native pixels with `inverse_scale_yx`. Returns `None` when no contour
/// survives the noise filter.
pub fn slice_rectangle(
    mask: ArrayView2<'_, u8>,
    bounds_yx: [usize; 2],
    inverse_scale_yx: [f64; 2],
) -> Option<SliceRect> {
    let contours = find_contours::<i32>(&binarize(mask));
    let mut points = contours
        .iter()
        .filter(|contour| is_lung_contour(contour))
        .flat_map(|contour| contour.points.iter());

    let first = points.next()?;
    let (mut y_min, mut y_max, mut x_min, mut x_max) = (first.y, first.y, first.x, first.x);
    for p in points {
        y_min = y_min.min(p.y);
        y_max = y_max.max(p.y);
        x_min = x_min.min(p.x);
        x_max = x_max.max(p.x);
    }

    let y_max = (y_max.max(0) as usize).min(bounds_yx[0]);
    let x_max = (x_max.max(0) as usize).min(bounds_yx[1]);
    let scale = |v: usize, axis: usize| (v as f64 * inverse_scale_yx[axis]) as usize;

    Some(SliceRect {
        y_min: scale(y_min.max(0) as usize, 0),
        y_max: scale(y_max, 0),
        x_min: scale(x_min.max(0) as usize, 1),
        x_max: scale(x_max, 1),
    })
}

/// Union of the slice rectangles, widened by `buffer_yx` and clamped to the
/// native in-plane extent. `None` when no slice found lung tissue.
pub fn reduce_rectangles(
    rects: impl IntoIterator<Item = SliceRect>,
    native_yx: (usize, usize),
    buffer_yx: [usize; 2],
) -> Option<CropBox> {
    let (rows, cols) = native_yx;
    let union = rects.into_iter().reduce(|a, b| SliceRect {
        y_min: a.y_min.min(b.y_min),
        y_max: a.y_max.max(b.y_max),
        x_min: a.x_min.min(b.x_min),
        x_max: a.x_max.max(b.x_max),
    })?;

    let y_min = union.y_min.saturating_sub(buffer_yx[0]).min(rows);
    let x_min = union.x_min.saturating_sub(buffer_yx[1]).min(cols);
    Some(CropBox {
        y_min,
        y_max: (union.y_max + buffer_yx[0]).clamp(y_min, rows),
        x_min,
        x_max: (union.x_max + buffer_yx[1]).clamp(x_min, cols),
    })
}

/// Crop box for a whole scan from its per-slice masks, falling back to the
/// full in-plane extent when no lung is detected on any slice.
pub fn aggregate(
    masks: &[Array2<u8>],
    bounds_yx: [usize; 2],
    inverse_scale_yx: [f64; 2],
    native_yx: (usize, usize),
    buffer_yx: [usize; 2],
) -> CropBox {
    let rects = masks
        .iter()
        .filter_map(|mask| slice_rectangle(mask.view(), bounds_yx, inverse_scale_yx));
    reduce_rectangles(rects, native_yx, buffer_yx).unwrap_or_else(|| {
        warn!(
            slices = masks.len(),
            "no lung detected on any slice, keeping the full extent"
        );
        CropBox::full(native_yx.0, native_yx.1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn rect(y_min: usize, y_max: usize, x_min: usize, x_max: usize) -> SliceRect {
        SliceRect {
            y_min,
            y_max,
            x_min,
            x_max,
        }
    }

    fn mask_with_blob(shape: (usize, usize), ys: (usize, usize), xs: (usize, usize)) -> Array2<u8> {
        let mut mask = Array2::zeros(shape);
        mask.slice_mut(s![ys.0..=ys.1, xs.0..=xs.1]).fill(255);
        mask
    }

    #[test]
    fn rectangles_are_merged_and_buffered() {
        let rects = [rect(10, 50, 10, 50), rect(20, 60, 20, 60)];
        let crop = reduce_rectangles(rects, (100, 100), [5, 5]).unwrap();
        assert_eq!(crop.coords(), [5, 65, 5, 65]);
    }

    #[test]
    fn buffered_box_is_clamped_to_the_scan() {
        let crop = reduce_rectangles([rect(2, 95, 0, 99)], (100, 100), [12, 12]).unwrap();
        assert_eq!(crop.coords(), [0, 100, 0, 100]);
    }

    #[test]
    fn no_detection_falls_back_to_the_full_extent() {
        assert_eq!(reduce_rectangles([], (80, 90), [5, 5]), None);
        let masks = vec![Array2::zeros((16, 16)); 3];
        let crop = aggregate(&masks, [16, 16], [1.0, 1.0], (80, 90), [5, 5]);
        assert_eq!(crop, CropBox::full(80, 90));
    }

    #[test]
    fn crop_shape_counts_both_bounds() {
        let crop = CropBox {
            y_min: 10,
            y_max: 20,
            x_min: 5,
            x_max: 15,
        };
        assert_eq!(crop.shape(), (11, 11));
    }

    #[test]
    fn slice_rectangle_covers_the_blob() {
        let mask = mask_with_blob((32, 32), (4, 12), (6, 20));
        let found = slice_rectangle(mask.view(), [32, 32], [1.0, 1.0]).unwrap();
        assert_eq!(found, rect(4, 12, 6, 20));
    }

    #[test]
    fn slice_rectangle_is_scaled_back_and_clamped() {
        let mask = mask_with_blob((32, 32), (4, 30), (2, 10));
        let found = slice_rectangle(mask.view(), [20, 32], [2.0, 2.0]).unwrap();
        assert_eq!(found, rect(8, 40, 4, 20));
    }

    #[test]
    fn specks_and_faint_pixels_are_ignored() {
        let mut mask = Array2::<u8>::zeros((16, 16));
        mask[[3, 3]] = 255;
        mask.slice_mut(s![8..14, 8..14]).fill(100);
        assert_eq!(slice_rectangle(mask.view(), [16, 16], [1.0, 1.0]), None);
    }

    #[test]
    fn aggregate_spans_all_slices() {
        let masks = vec![
            mask_with_blob((32, 32), (4, 10), (4, 10)),
            Array2::zeros((32, 32)),
            mask_with_blob((32, 32), (8, 20), (2, 6)),
        ];
        let crop = aggregate(&masks, [32, 32], [1.0, 1.0], (32, 32), [1, 1]);
        assert_eq!(crop.coords(), [3, 21, 1, 11]);
    }
}
