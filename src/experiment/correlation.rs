//! Correlation score between a focused image and its stored reference.
//!
//! Both images are binned to a coarse grid and flattened by subtracting a large box blur.
//! A central crop of the reference is then cross-correlated (valid region only) against the
//! flattened reference and against the flattened new image. The peak is taken where the
//! Laplacian of the new correlation surface is strongest, which ignores broad plateaus, and
//! the score is the new correlation at that peak over the maximum of the reference
//! autocorrelation. Identical images score 1.

use crate::error::{AppResult, HimError};
use ndarray::{s, Array2, ArrayView2, Axis};
use num_complex::Complex;
use rustfft::FftPlanner;

// Below this the reference autocorrelation is rounding noise.
const MIN_TEXTURE: f64 = 1e-6;

/// Geometry of the correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationParams {
    /// Side of the coarse grid both images are binned to
    pub grid: usize,
    /// Side of the central reference crop
    pub crop: usize,
    /// Half width of the background box blur, in grid pixels
    pub background_radius: usize,
}

impl Default for CorrelationParams {
    fn default() -> Self {
        Self {
            grid: 512,
            crop: 256,
            background_radius: 32,
        }
    }
}

/// Score and location of the correlation peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationScore {
    /// Normalised peak height, 1.0 for identical images
    pub score: f64,
    /// Peak position in the valid correlation surface
    pub peak: (usize, usize),
}

/// Compare `image` against `reference`.
///
/// # Errors
///
/// `HimError::Processing` if the images differ in shape, are smaller than the grid, or the
/// reference has no texture left after background flattening.
pub fn correlation_score(
    reference: &Array2<u16>,
    image: &Array2<u16>,
    params: CorrelationParams,
) -> AppResult<CorrelationScore> {
    if reference.dim() != image.dim() {
        return Err(HimError::Processing(format!(
            "reference is {:?} but image is {:?}",
            reference.dim(),
            image.dim()
        )));
    }
    let (rows, cols) = reference.dim();
    if rows < params.grid || cols < params.grid {
        return Err(HimError::Processing(format!(
            "image {rows}x{cols} is smaller than the {0}x{0} grid",
            params.grid
        )));
    }
    if params.crop == 0 || params.crop >= params.grid {
        return Err(HimError::Processing(format!(
            "crop {} must be positive and smaller than grid {}",
            params.crop, params.grid
        )));
    }

    let radius = params.background_radius;
    let reference = flatten_background(&downsample(reference, params.grid), radius);
    let image = flatten_background(&downsample(image, params.grid), radius);

    let start = (params.grid - params.crop) / 2;
    let end = start + params.crop;
    let template = reference.slice(s![start..end, start..end]);

    let mut planner = FftPlanner::new();
    let corr_ref = cross_correlate_valid(&mut planner, template, &reference);
    let corr_new = cross_correlate_valid(&mut planner, template, &image);

    let max_ref = corr_ref.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max_ref.is_finite() && max_ref > MIN_TEXTURE) {
        return Err(HimError::Processing(
            "reference has no texture after background flattening".to_string(),
        ));
    }

    let lap = laplacian(&corr_new);
    let peak = argmax_abs(&lap);
    Ok(CorrelationScore {
        score: corr_new[peak] / max_ref,
        peak,
    })
}

/// Bin `image` to `grid` x `grid` by block means. Trailing pixels that do not fill a block
/// are dropped.
fn downsample(image: &Array2<u16>, grid: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let (br, bc) = (rows / grid, cols / grid);
    let norm = (br * bc) as f64;
    Array2::from_shape_fn((grid, grid), |(i, j)| {
        image
            .slice(s![i * br..(i + 1) * br, j * bc..(j + 1) * bc])
            .iter()
            .map(|&v| f64::from(v))
            .sum::<f64>()
            / norm
    })
}

/// Subtract a three-pass box blur (close to a Gaussian) from `image`.
fn flatten_background(image: &Array2<f64>, radius: usize) -> Array2<f64> {
    let mut blurred = image.clone();
    for _ in 0..3 {
        blurred = box_blur(&blurred, radius, Axis(0));
        blurred = box_blur(&blurred, radius, Axis(1));
    }
    image - &blurred
}

/// Moving average of width `2 * radius + 1` along `axis`, edges clamped.
fn box_blur(image: &Array2<f64>, radius: usize, axis: Axis) -> Array2<f64> {
    let mut out = Array2::zeros(image.raw_dim());
    let width = (2 * radius + 1) as f64;
    for (lane, mut out_lane) in image.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = lane.len();
        let at = |k: isize| lane[k.clamp(0, n as isize - 1) as usize];
        let r = radius as isize;
        let mut sum: f64 = (-r..=r).map(&at).sum();
        for i in 0..n {
            out_lane[i] = sum / width;
            let i = i as isize;
            sum += at(i + r + 1) - at(i - r);
        }
    }
    out
}

/// Cross-correlation of `template` over `image`, valid region only.
///
/// Output has shape `image - template + 1`; element `(y, x)` is the dot product of the
/// template with the window of `image` starting at `(y, x)`.
fn cross_correlate_valid(
    planner: &mut FftPlanner<f64>,
    template: ArrayView2<f64>,
    image: &Array2<f64>,
) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let (tr, tc) = template.dim();

    let mut padded = Array2::<Complex<f64>>::zeros((rows, cols));
    padded
        .slice_mut(s![..tr, ..tc])
        .zip_mut_with(&template, |p, &t| *p = Complex::new(t, 0.0));
    let mut spectrum = image.mapv(|v| Complex::new(v, 0.0));

    fft2(planner, &mut padded, false);
    fft2(planner, &mut spectrum, false);
    spectrum.zip_mut_with(&padded, |x, t| *x *= t.conj());
    fft2(planner, &mut spectrum, true);

    let norm = (rows * cols) as f64;
    spectrum
        .slice(s![..=rows - tr, ..=cols - tc])
        .mapv(|c| c.re / norm)
}

/// In-place unnormalised 2D FFT.
fn fft2(planner: &mut FftPlanner<f64>, data: &mut Array2<Complex<f64>>, inverse: bool) {
    for axis in [Axis(1), Axis(0)] {
        let len = data.len_of(axis);
        let fft = if inverse {
            planner.plan_fft_inverse(len)
        } else {
            planner.plan_fft_forward(len)
        };
        let mut buffer = vec![Complex::new(0.0, 0.0); len];
        for mut lane in data.lanes_mut(axis) {
            buffer.iter_mut().zip(lane.iter()).for_each(|(b, v)| *b = *v);
            fft.process(&mut buffer);
            lane.iter_mut().zip(buffer.iter()).for_each(|(v, b)| *v = *b);
        }
    }
}

/// Five-point Laplacian, edge values repeated outside the array.
fn laplacian(a: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = a.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let up = a[[i.saturating_sub(1), j]];
        let down = a[[(i + 1).min(rows - 1), j]];
        let left = a[[i, j.saturating_sub(1)]];
        let right = a[[i, (j + 1).min(cols - 1)]];
        up + down + left + right - 4.0 * a[[i, j]]
    })
}

fn argmax_abs(a: &Array2<f64>) -> (usize, usize) {
    a.indexed_iter()
        .fold(((0, 0), f64::NEG_INFINITY), |best, (idx, &v)| {
            if v.abs() > best.1 {
                (idx, v.abs())
            } else {
                best
            }
        })
        .0
}
