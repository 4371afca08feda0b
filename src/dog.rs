// dog.rs — Difference-of-Gaussian stacks and the discrete extrema scan.
//
// The DoG stack approximates a scale-normalised Laplacian: subtracting
// adjacent slices of an octave leaves a band-pass response peaked on blobs
// whose radius matches the slice blur. Candidates are strict 3D extrema
// over the 26-neighborhood (8 in-slice + 9 below + 9 above).
//
// The GPU mirror (gpu/dog.rs + shaders/dog_extrema.wgsl) applies the exact
// same inequality — strictly greater for maxima, strictly less for minima,
// no tie tolerance — and the same pre-filter fraction, so host and device
// candidate sets agree.

use crate::image::Image;
use crate::keypoint::Candidate;
use crate::scale_space::Octave;

/// Fraction of `peak_threshold` used as the cheap discrete pre-filter
/// before refinement (the classic 80% rule). Shared with the WGSL extrema
/// kernel, which bakes the product into its uniform buffer.
pub const PREFILTER_FRACTION: f32 = 0.8;

/// The DoG response stack of one octave. Immutable after construction.
#[derive(Debug, Clone)]
pub struct DogStack {
    /// Level of the source octave.
    pub octave_level: u32,
    /// Sampling step of the source octave.
    pub delta: f32,
    /// Per-slice sigmas, copied from the source octave with the last entry
    /// dropped (the stack has one fewer slice).
    pub sigmas: Vec<f32>,
    /// Signed responses: `slices[s] = octave.slices[s+1] − octave.slices[s]`.
    pub slices: Vec<Image>,
}

impl DogStack {
    /// Derive the DoG stack from an octave. Returns `None` if the octave
    /// has fewer than 2 slices (no adjacent pair to subtract).
    pub fn from_octave(octave: &Octave) -> Option<DogStack> {
        if octave.slices.len() < 2 {
            return None;
        }
        let slices = octave
            .slices
            .windows(2)
            .map(|pair| subtract(&pair[1], &pair[0]))
            .collect();
        Some(DogStack {
            octave_level: octave.level,
            delta: octave.delta,
            sigmas: octave.sigmas[..octave.sigmas.len() - 1].to_vec(),
            slices,
        })
    }
}

/// Pixel-wise `a − b`. Signed, no clamping.
///
/// # Panics
/// Panics if the dimensions differ (octave slices never do).
fn subtract(a: &Image, b: &Image) -> Image {
    assert_eq!(a.width(), b.width(), "slice width mismatch");
    assert_eq!(a.height(), b.height(), "slice height mismatch");
    let mut out = Image::new(a.width(), a.height());
    let (av, bv, ov) = (a.as_slice(), b.as_slice(), out.as_mut_slice());
    for i in 0..av.len() {
        ov[i] = av[i] - bv[i];
    }
    out
}

/// Scan the interior of the stack for strict 3D extrema.
///
/// Interior means scales `1..=len-2` and pixels excluding a 1-pixel image
/// border, so every candidate already satisfies the bounds the quadratic
/// fit needs. Pixels whose absolute response is at or below
/// `PREFILTER_FRACTION * peak_threshold` are skipped before the
/// neighborhood test. One full pass per call.
pub fn find_candidates(stack: &DogStack, peak_threshold: f32) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let nb = stack.slices.len();
    if nb < 3 {
        return candidates;
    }
    let threshold = PREFILTER_FRACTION * peak_threshold;

    for s in 1..nb - 1 {
        let w = stack.slices[s].width();
        let h = stack.slices[s].height();
        if w < 3 || h < 3 {
            continue;
        }
        for j in 1..h - 1 {
            for i in 1..w - 1 {
                // SAFETY: 1 <= i < w-1 and 1 <= j < h-1, all neighbor
                // accesses below stay within bounds.
                let v = unsafe { stack.slices[s].get_unchecked(i, j) };
                if v.abs() <= threshold {
                    continue;
                }
                if is_extremum(&stack.slices[s - 1..=s + 1], i, j, v) {
                    candidates.push(Candidate {
                        i,
                        j,
                        s,
                        octave: stack.octave_level,
                        x: stack.delta * i as f32,
                        y: stack.delta * j as f32,
                        value: v,
                    });
                }
            }
        }
    }
    candidates
}

/// Strict extremum test against the 26 neighbors of (i, j) in the three
/// slices [below, center, above]. Ties disqualify.
#[inline]
fn is_extremum(tri: &[Image], i: usize, j: usize, v: f32) -> bool {
    let mut is_max = true;
    let mut is_min = true;
    for (si, slice) in tri.iter().enumerate() {
        for dj in 0..3 {
            for di in 0..3 {
                if si == 1 && di == 1 && dj == 1 {
                    continue; // the pixel itself
                }
                // SAFETY: caller guarantees (i, j) is interior.
                let n = unsafe { slice.get_unchecked(i + di - 1, j + dj - 1) };
                if n >= v {
                    is_max = false;
                }
                if n <= v {
                    is_min = false;
                }
                if !is_max && !is_min {
                    return false;
                }
            }
        }
    }
    is_max || is_min
}
