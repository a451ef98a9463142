// src/preprocess.rs
//
// Canvas to classifier-input normalisation, following the MNIST recipe:
// crop to the ink, scale the longer side to 20 px, paste into a 28x28 frame,
// move the intensity centroid to the frame centre, scale to [0, 1].

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array2, Array4, ArrayView4, ArrayViewMut1, Axis};

/// Side length of the square classifier input.
pub const FRAME_SIZE: usize = 28;
/// Longer side of the digit after rescaling; leaves a 4 px margin.
pub const DIGIT_SIZE: f64 = 20.0;

const FRAME_CENTER: f64 = (FRAME_SIZE / 2) as f64;

// Pole of the cubic B-spline prefilter, sqrt(3) - 2.
const SPLINE_POLE: f64 = -0.267_949_192_431_122_7;
// Slack for sample positions that land on the frame border up to rounding.
const EDGE_TOLERANCE: f64 = 1e-9;

type UnitImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Inclusive extent of the non-zero pixels of a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub row_min: u32,
    pub row_max: u32,
    pub col_min: u32,
    pub col_max: u32,
}

impl BoundingBox {
    pub fn height(&self) -> u32 {
        self.row_max - self.row_min + 1
    }

    pub fn width(&self) -> u32 {
        self.col_max - self.col_min + 1
    }
}

/// A `1 x 1 x 28 x 28` tensor with values in `[0, 1]`, the only input the
/// classifier accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor(Array4<f32>);

impl NormalizedTensor {
    fn from_frame(frame: &Array2<f64>) -> Self {
        let data = Array4::from_shape_fn((1, 1, FRAME_SIZE, FRAME_SIZE), |(_, _, row, col)| {
            frame[[row, col]].clamp(0.0, 1.0) as f32
        });
        Self(data)
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }
}

#[cfg(test)]
impl NormalizedTensor {
    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Value at `(row, col)` of the single channel.
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.0[[0, 0, row, col]]
    }

    pub fn sum(&self) -> f32 {
        self.0.sum()
    }
}

/// Normalises a grayscale canvas for the digit classifier.
///
/// Returns `None` for a blank canvas (no pixel above zero). Every other input,
/// including a single lit pixel or a canvas larger than the frame, goes
/// through the same crop, rescale, recentre and scale steps.
pub fn normalize(image: &GrayImage) -> Option<NormalizedTensor> {
    let bbox = bounding_box(image)?;
    let crop = crop_to_unit(image, &bbox);

    let (new_height, new_width) = rescaled_size(bbox.height(), bbox.width());
    assert!(
        (1..=DIGIT_SIZE as u32).contains(&new_height) && (1..=DIGIT_SIZE as u32).contains(&new_width),
        "rescaled digit {new_height}x{new_width} does not fit the frame"
    );
    let resized = imageops::resize(&crop, new_width, new_height, FilterType::Lanczos3);

    let mut frame = embed(&resized);
    if let Some((center_row, center_col)) = center_of_mass(&frame) {
        frame = shift(&frame, FRAME_CENTER - center_row, FRAME_CENTER - center_col);
    }

    Some(NormalizedTensor::from_frame(&frame))
}

/// Smallest box holding every non-zero pixel, or `None` for a blank image.
pub fn bounding_box(image: &GrayImage) -> Option<BoundingBox> {
    image
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0[0] > 0)
        .fold(None, |bbox: Option<BoundingBox>, (col, row, _)| {
            Some(match bbox {
                None => BoundingBox { row_min: row, row_max: row, col_min: col, col_max: col },
                Some(b) => BoundingBox {
                    row_min: b.row_min.min(row),
                    row_max: b.row_max.max(row),
                    col_min: b.col_min.min(col),
                    col_max: b.col_max.max(col),
                },
            })
        })
}

/// Target `(height, width)` after scaling the longer side to 20 px.
///
/// Both sides share one factor and are floored, then clamped to at least 1.
pub fn rescaled_size(height: u32, width: u32) -> (u32, u32) {
    let scale = DIGIT_SIZE / f64::from(height.max(width));
    let scaled = |side: u32| ((f64::from(side) * scale) as u32).max(1);
    (scaled(height), scaled(width))
}

// Crops to the box and maps intensities to [0, 1]. The resampler clamps
// float pixels to that range, so the division by 255 happens here rather
// than at the end; every later step is linear. The clamp also drops the
// negative Lanczos ringing before the centroid is taken, which moves the
// centroid by a few hundredths of a pixel on asymmetric glyphs.
fn crop_to_unit(image: &GrayImage, bbox: &BoundingBox) -> UnitImage {
    let crop = imageops::crop_imm(image, bbox.col_min, bbox.row_min, bbox.width(), bbox.height())
        .to_image();
    ImageBuffer::from_fn(crop.width(), crop.height(), |x, y| {
        Luma([f32::from(crop.get_pixel(x, y).0[0]) / 255.0])
    })
}

fn embed(digit: &UnitImage) -> Array2<f64> {
    let (width, height) = (digit.width() as usize, digit.height() as usize);
    debug_assert!(width <= FRAME_SIZE && height <= FRAME_SIZE);

    let top = (FRAME_SIZE - height) / 2;
    let left = (FRAME_SIZE - width) / 2;

    let mut frame = Array2::zeros((FRAME_SIZE, FRAME_SIZE));
    for (x, y, pixel) in digit.enumerate_pixels() {
        frame[[top + y as usize, left + x as usize]] = f64::from(pixel.0[0]);
    }
    frame
}

/// Intensity-weighted `(row, col)` centre, `None` if the frame has no mass.
fn center_of_mass(frame: &Array2<f64>) -> Option<(f64, f64)> {
    let total = frame.sum();
    if total <= 0.0 {
        return None;
    }
    let (row_moment, col_moment) = frame
        .indexed_iter()
        .fold((0.0, 0.0), |(r, c), ((row, col), &v)| (r + row as f64 * v, c + col as f64 * v));
    Some((row_moment / total, col_moment / total))
}

/// Translates `frame` by a sub-pixel offset with cubic B-spline
/// interpolation. Positions that fall outside the frame read zero.
fn shift(frame: &Array2<f64>, d_row: f64, d_col: f64) -> Array2<f64> {
    let mut coeffs = frame.clone();
    for axis in [Axis(0), Axis(1)] {
        for lane in coeffs.lanes_mut(axis) {
            spline_prefilter(lane);
        }
    }

    Array2::from_shape_fn(frame.dim(), |(row, col)| {
        sample(&coeffs, row as f64 - d_row, col as f64 - d_col)
    })
}

// Turns samples into cubic B-spline coefficients in place, with mirror
// boundary conditions.
fn spline_prefilter(mut c: ArrayViewMut1<'_, f64>) {
    let n = c.len();
    if n < 2 {
        return;
    }
    let z = SPLINE_POLE;
    let gain = (1.0 - z) * (1.0 - 1.0 / z);
    c.mapv_inplace(|v| v * gain);

    let z_last = z.powi(n as i32 - 1);
    let mut z_i = z;
    let mut first = c[0] + z_last * c[n - 1];
    for i in 1..n - 1 {
        first += z_i * (c[i] + z_last * c[n - 1 - i]);
        z_i *= z;
    }
    c[0] = first / (1.0 - z_last * z_last);
    for i in 1..n {
        let prev = c[i - 1];
        c[i] += z * prev;
    }

    c[n - 1] = (z * c[n - 2] + c[n - 1]) * z / (z * z - 1.0);
    for i in (0..n - 1).rev() {
        let next = c[i + 1];
        c[i] = z * (next - c[i]);
    }
}

fn sample(coeffs: &Array2<f64>, row: f64, col: f64) -> f64 {
    let (rows, cols) = coeffs.dim();
    if !inside(row, rows) || !inside(col, cols) {
        return 0.0;
    }
    let (row_base, row_weights) = bspline_weights(row);
    let (col_base, col_weights) = bspline_weights(col);

    let mut acc = 0.0;
    for (i, wr) in row_weights.iter().enumerate() {
        let r = mirror(row_base + i as isize, rows);
        for (j, wc) in col_weights.iter().enumerate() {
            let c = mirror(col_base + j as isize, cols);
            acc += wr * wc * coeffs[[r, c]];
        }
    }
    acc
}

fn inside(pos: f64, len: usize) -> bool {
    pos >= -EDGE_TOLERANCE && pos <= (len - 1) as f64 + EDGE_TOLERANCE
}

// First contributing index and the four cubic B-spline weights at `pos`.
fn bspline_weights(pos: f64) -> (isize, [f64; 4]) {
    let base = pos.floor();
    let t = pos - base;
    let t2 = t * t;
    let t3 = t2 * t;
    let weights = [
        (1.0 - t).powi(3) / 6.0,
        (4.0 - 6.0 * t2 + 3.0 * t3) / 6.0,
        (1.0 + 3.0 * t + 3.0 * t2 - 3.0 * t3) / 6.0,
        t3 / 6.0,
    ];
    (base as isize - 1, weights)
}

// Reflects an index about 0 and len - 1 without repeating the edge sample.
fn mirror(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * len as isize - 2;
    let folded = index.rem_euclid(period);
    if folded >= len as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}
