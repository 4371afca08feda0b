// scale_space.rs — Gaussian scale-space octaves (CPU reference).
//
// An octave is a run of progressively blurred slices at one sampling step
// (`delta`); advancing to the next octave decimates a sufficiently-blurred
// slice and doubles delta. Blur is applied incrementally: convolving with
// G(a) then G(b) equals convolving with G(sqrt(a²+b²)), so slice s is
// produced from slice s-1 with sigma_extra = sqrt(σ[s]² − σ[s-1]²) / δ
// (the division converts from native units to the octave's sampling grid).
//
// `OctaveSource` is the seam between the CPU and GPU strategies: both
// expose {set_image, next_octave} and the detector drives either through
// the trait, selected at construction time.

use crate::convolution::{convolve_separable, gaussian_kernel_1d};
use crate::image::Image;
use crate::params::{ConfigError, ScaleSpaceParams};
use crate::resample::{decimate_2x, upsample_2x};

/// Minimum dimension of the coarsest octave. The octave count is clamped
/// so the last octave's smaller side never falls below this.
pub const MIN_OCTAVE_DIM: usize = 32;

/// One doubling-level of the scale-space pyramid.
#[derive(Debug, Clone)]
pub struct Octave {
    /// Octave index, 0 = finest.
    pub level: u32,
    /// Sampling step relative to native resolution; doubles every octave.
    pub delta: f32,
    /// Absolute blur of each slice, strictly increasing. Same length as
    /// `slices`.
    pub sigmas: Vec<f32>,
    /// Blurred slices, all at this octave's resolution.
    pub slices: Vec<Image>,
}

/// The host/accelerator strategy seam: something that can ingest a base
/// image and then stream octaves until the pyramid is exhausted.
pub trait OctaveSource {
    /// Prepare the base image. Validates the configuration; a
    /// `ConfigError` here aborts detection before any octave is produced.
    fn set_image(&mut self, image: &Image) -> Result<(), ConfigError>;

    /// Produce the next octave, or `None` once the clamped octave count is
    /// reached. Each call supersedes the previous octave's seed state.
    fn next_octave(&mut self) -> Option<Octave>;

    /// Native (input) image dimensions, available after `set_image`.
    fn native_size(&self) -> (usize, usize);
}

/// Maximum number of octaves for a native image size: ⌈log2(min(w,h)/32)⌉,
/// floored at 1. Keeps the coarsest octave's smaller dimension >= 32.
///
/// The floor is deliberate: an input already smaller than 32 pixels still
/// gets its single octave and flows through the ordinary candidate path
/// (usually yielding nothing) instead of being special-cased to an empty
/// pyramid.
pub fn max_octave_count(width: usize, height: usize) -> u32 {
    let m = width.min(height) as f32;
    if m <= MIN_OCTAVE_DIM as f32 {
        return 1;
    }
    ((m / MIN_OCTAVE_DIM as f32).log2().ceil() as u32).max(1)
}

/// Absolute blur of slice `s` in an octave with sampling step `delta`:
/// `(delta / delta_min) * sigma_min * 2^(s / nspo)`.
#[inline]
pub(crate) fn slice_sigma(params: &ScaleSpaceParams, delta: f32, s: usize) -> f32 {
    (delta / params.delta_min)
        * params.sigma_min
        * 2f32.powf(s as f32 / params.nb_scales_per_octave as f32)
}

/// Which slice seeds the next octave: the one whose blur equals the next
/// octave's first slice (index nspo when extra slices exist, index 1
/// otherwise).
#[inline]
pub(crate) fn seed_slice_index(params: &ScaleSpaceParams) -> usize {
    if params.extra_slices == 0 {
        1
    } else {
        params.slices_per_octave() - params.extra_slices as usize
    }
}

/// CPU scale-space builder (the reference `OctaveSource` strategy).
pub struct ScaleSpace {
    params: ScaleSpaceParams,
    /// Seed image for the next octave; replaced by the decimated slice on
    /// every `next_octave` call.
    base: Option<Image>,
    native_size: (usize, usize),
    octave_index: u32,
    max_octaves: u32,
    delta: f32,
}

impl ScaleSpace {
    pub fn new(params: ScaleSpaceParams) -> Self {
        ScaleSpace {
            params,
            base: None,
            native_size: (0, 0),
            octave_index: 0,
            max_octaves: 0,
            delta: params.delta_min,
        }
    }

    pub fn params(&self) -> &ScaleSpaceParams {
        &self.params
    }

    /// Prepare the octave-0 base image from a [0, 1] input.
    ///
    /// For delta_min = 0.5 the input is first doubled in resolution; then
    /// the image is blurred up to sigma_min assuming the input already
    /// carries sigma_in of blur: σ_extra = sqrt(max(0, σ_min² − σ_in²)) / δ_min.
    pub(crate) fn prepare_base(
        params: &ScaleSpaceParams,
        image: &Image,
    ) -> Result<Image, ConfigError> {
        params.validate()?;

        let working = if params.delta_min == 0.5 {
            upsample_2x(image)
        } else {
            image.clone()
        };

        let sigma_extra = (params.sigma_min * params.sigma_min
            - params.sigma_in * params.sigma_in)
            .max(0.0)
            .sqrt()
            / params.delta_min;
        if sigma_extra > 0.0 {
            let k = gaussian_kernel_1d(sigma_extra);
            Ok(convolve_separable(&working, &k, &k))
        } else {
            Ok(working)
        }
    }
}

impl OctaveSource for ScaleSpace {
    fn set_image(&mut self, image: &Image) -> Result<(), ConfigError> {
        let base = Self::prepare_base(&self.params, image)?;
        self.native_size = (image.width(), image.height());
        self.max_octaves = self
            .params
            .nb_octaves
            .min(max_octave_count(image.width(), image.height()));
        self.octave_index = 0;
        self.delta = self.params.delta_min;
        self.base = Some(base);
        Ok(())
    }

    fn next_octave(&mut self) -> Option<Octave> {
        if self.octave_index >= self.max_octaves {
            return None;
        }
        let base = self.base.take()?;

        let n = self.params.slices_per_octave();
        let delta = self.delta;
        let sigmas: Vec<f32> = (0..n).map(|s| slice_sigma(&self.params, delta, s)).collect();

        let mut slices = Vec::with_capacity(n);
        slices.push(base);
        for s in 1..n {
            let sigma_extra =
                (sigmas[s] * sigmas[s] - sigmas[s - 1] * sigmas[s - 1]).sqrt() / delta;
            let k = gaussian_kernel_1d(sigma_extra);
            let blurred = convolve_separable(&slices[s - 1], &k, &k);
            slices.push(blurred);
        }

        // Seed the next octave before handing the slices out: the slice at
        // the seed index carries exactly the blur the next octave's first
        // slice needs (its sigma doubles along with delta).
        let seed = seed_slice_index(&self.params);
        self.base = Some(decimate_2x(&slices[seed]));
        self.delta *= 2.0;

        let octave = Octave {
            level: self.octave_index,
            delta,
            sigmas,
            slices,
        };
        self.octave_index += 1;
        Some(octave)
    }

    fn native_size(&self) -> (usize, usize) {
        self.native_size
    }
}
