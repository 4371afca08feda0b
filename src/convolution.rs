// convolution.rs — Separable and dense 2D convolution for Image.
//
// A Gaussian kernel is separable: the 2D blur decomposes into a horizontal
// pass followed by a vertical pass, reducing cost from O(k²) to O(2k) per
// pixel. `convolve_2d` applies an arbitrary dense kernel directly and is
// used by derivative filters that are not separable.
//
// BORDER HANDLING: Clamp (replicate edge pixels).
// When the kernel window extends beyond the image boundary, out-of-bounds
// indices are clamped to the nearest edge pixel. The WGSL blur kernel in
// shaders/blur.wgsl clamps identically so the CPU and GPU scale spaces
// agree within floating-point tolerance.

use crate::image::Image;

/// Convolve each row of `src` with a 1D kernel (horizontal pass).
///
/// The kernel is applied centered: for a kernel of length K, the center
/// element is at index K/2. Interior pixels (where the window never leaves
/// the image) use unchecked access; border pixels clamp.
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_rows(src: &Image, kernel: &[f32]) -> Image {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::new(w, h);

    for y in 0..h {
        // Left border: x in [0, half)
        for x in 0..half.min(w) {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize) + (ki as isize) - (half as isize);
                let sx = sx.clamp(0, (w - 1) as isize) as usize;
                acc += src.get(sx, y) * kv;
            }
            dst.set(x, y, acc);
        }

        // Interior: x in [half, w - half) — no bounds checks needed.
        if w > 2 * half {
            for x in half..(w - half) {
                let mut acc = 0.0f32;
                // SAFETY: x - half >= 0 and x + half < w, all within bounds.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x + ki - half, y) * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }

        // Right border: x in [w - half, w)
        let right_start = if w > half { w - half } else { half.min(w) };
        for x in right_start..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize) + (ki as isize) - (half as isize);
                let sx = sx.clamp(0, (w - 1) as isize) as usize;
                acc += src.get(sx, y) * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Convolve each column of `src` with a 1D kernel (vertical pass).
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_cols(src: &Image, kernel: &[f32]) -> Image {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::new(w, h);

    // Top border rows: y in [0, half)
    for y in 0..half.min(h) {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize) + (ki as isize) - (half as isize);
                let sy = sy.clamp(0, (h - 1) as isize) as usize;
                acc += src.get(x, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }

    // Interior rows: y in [half, h - half).
    if h > 2 * half {
        for y in half..(h - half) {
            for x in 0..w {
                let mut acc = 0.0f32;
                // SAFETY: y - half >= 0 and y + half < h, all within bounds.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        acc += src.get_unchecked(x, y + ki - half) * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }
    }

    // Bottom border rows: y in [h - half, h)
    let bottom_start = if h > half { h - half } else { half.min(h) };
    for y in bottom_start..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize) + (ki as isize) - (half as isize);
                let sy = sy.clamp(0, (h - 1) as isize) as usize;
                acc += src.get(x, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Full separable 2D convolution: horizontal pass then vertical pass.
///
/// For a Gaussian blur call `convolve_separable(&img, &g, &g)` since the
/// Gaussian is symmetric.
pub fn convolve_separable(src: &Image, kernel_row: &[f32], kernel_col: &[f32]) -> Image {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// Dense 2D convolution with an arbitrary (kw × kh) kernel, clamp borders.
///
/// `kernel` is row-major with dimensions `kw × kh`, both odd. Used for
/// non-separable derivative filters; the blur path should use
/// `convolve_separable`.
///
/// # Panics
/// Panics if either kernel dimension is even or zero, or if
/// `kernel.len() != kw * kh`.
pub fn convolve_2d(src: &Image, kernel: &[f32], kw: usize, kh: usize) -> Image {
    assert!(kw % 2 == 1 && kh % 2 == 1, "kernel dimensions must be odd (got {kw}×{kh})");
    assert_eq!(kernel.len(), kw * kh, "kernel length must equal kw * kh");

    let w = src.width();
    let h = src.height();
    let half_x = (kw / 2) as isize;
    let half_y = (kh / 2) as isize;
    let mut dst = Image::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for ky in 0..kh {
                let sy = (y as isize + ky as isize - half_y).clamp(0, (h - 1) as isize) as usize;
                for kx in 0..kw {
                    let sx =
                        (x as isize + kx as isize - half_x).clamp(0, (w - 1) as isize) as usize;
                    acc += src.get(sx, sy) * kernel[ky * kw + kx];
                }
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Kernel half-width for a Gaussian of the given sigma: `ceil(3σ)`, at
/// least 1. Shared with the GPU path, which packs at most 32 coefficients
/// into its uniform buffer (half-width ≤ 31, i.e. σ up to ≈ 10).
#[inline]
pub fn gaussian_half_width(sigma: f32) -> usize {
    (3.0 * sigma).ceil().max(1.0) as usize
}

/// Generate a 1D Gaussian kernel for the given sigma.
///
/// Returns a kernel of length `2 * gaussian_half_width(sigma) + 1`,
/// normalized so the coefficients sum to 1.0.
///
/// # Examples
/// ```
/// let k = blitzen::convolution::gaussian_kernel_1d(1.0);
/// assert_eq!(k.len(), 7);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
///
/// # Panics
/// Panics if `sigma <= 0`.
pub fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive (got {sigma})");
    let half = gaussian_half_width(sigma);
    let len = 2 * half + 1;
    let mut kernel = Vec::with_capacity(len);
    let two_sigma_sq = 2.0 * sigma * sigma;

    for i in 0..len {
        let x = i as f32 - half as f32;
        kernel.push((-x * x / two_sigma_sq).exp());
    }

    // Normalize so coefficients sum to 1 (preserves image brightness).
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}
