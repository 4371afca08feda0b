// resample.rs — Spatial resampling between octaves.
//
// `decimate_2x` seeds the next octave from a sufficiently-blurred slice;
// `upsample_2x` prepares the delta_min = 0.5 base image (detection at twice
// the native resolution recovers keypoints below the input sampling rate).
//
// The GPU mirror reimplements both as compute kernels (shaders/decimate.wgsl,
// shaders/upsample.wgsl) with the exact same index arithmetic so that host
// and device octaves stay comparable pixel-for-pixel.

use crate::image::Image;

/// Downsample an image by 2× in both dimensions.
///
/// Takes every other pixel: `dst(x, y) = src(2x, 2y)`. Output dimensions are
/// `(width / 2, height / 2)` with integer division (odd dimensions drop the
/// last row/column). No additional filtering — the caller is responsible for
/// blurring enough before decimating (the octave builder always is).
pub fn decimate_2x(src: &Image) -> Image {
    let new_w = src.width() / 2;
    let new_h = src.height() / 2;
    let mut dst = Image::new(new_w, new_h);

    for y in 0..new_h {
        for x in 0..new_w {
            // SAFETY: 2x < width and 2y < height since x < width/2, y < height/2.
            unsafe {
                dst.set_unchecked(x, y, src.get_unchecked(x * 2, y * 2));
            }
        }
    }
    dst
}

/// Upsample an image to exactly double resolution with bilinear
/// interpolation: `dst(x, y)` samples `src` at `(x/2, y/2)`, clamping at the
/// right/bottom edge.
///
/// Even destination pixels land on source pixels and copy them exactly; odd
/// pixels average their two (or four) neighbors.
pub fn upsample_2x(src: &Image) -> Image {
    let w = src.width();
    let h = src.height();
    let mut dst = Image::new(w * 2, h * 2);

    for y in 0..h * 2 {
        let sy = y / 2;
        let fy = if y % 2 == 0 { 0.0f32 } else { 0.5 };
        let sy1 = (sy + 1).min(h - 1);
        for x in 0..w * 2 {
            let sx = x / 2;
            let fx = if x % 2 == 0 { 0.0f32 } else { 0.5 };
            let sx1 = (sx + 1).min(w - 1);
            // SAFETY: sx, sx1 < w and sy, sy1 < h by construction.
            unsafe {
                let p00 = src.get_unchecked(sx, sy);
                let p10 = src.get_unchecked(sx1, sy);
                let p01 = src.get_unchecked(sx, sy1);
                let p11 = src.get_unchecked(sx1, sy1);
                let v = (1.0 - fx) * (1.0 - fy) * p00
                    + fx * (1.0 - fy) * p10
                    + (1.0 - fx) * fy * p01
                    + fx * fy * p11;
                dst.set_unchecked(x, y, v);
            }
        }
    }
    dst
}
