// params.rs — Scale-space and detector configuration.
//
// Parameter structs are validated once, up front, before any octave is
// produced. An invalid configuration is fatal for the whole detection and
// is never retried; per-candidate rejections later in the pipeline are a
// separate, silent mechanism (see refine.rs).

use std::fmt;

/// Gaussian scale-space geometry.
///
/// `sigma` values are absolute blur levels in native-image pixel units;
/// `delta` values are sampling steps relative to native resolution
/// (1.0 = native, 0.5 = one 2× upsample).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleSpaceParams {
    /// Requested number of octaves. Clamped at runtime so the coarsest
    /// octave keeps a minimum dimension of at least 32 pixels.
    pub nb_octaves: u32,
    /// Scales per octave doubling (3 in the classic formulation).
    pub nb_scales_per_octave: u32,
    /// Blur level of the first scale-space slice.
    pub sigma_min: f32,
    /// Sampling step of the first octave. Supported values: 1.0 (native)
    /// and 0.5 (one bilinear upsample).
    pub delta_min: f32,
    /// Assumed blur of the input image.
    pub sigma_in: f32,
    /// Extra slices per octave beyond `nb_scales_per_octave`, so the DoG
    /// stack has interior scales to scan at both ends.
    pub extra_slices: u32,
}

impl Default for ScaleSpaceParams {
    fn default() -> Self {
        ScaleSpaceParams {
            nb_octaves: 8,
            nb_scales_per_octave: 3,
            sigma_min: 1.6,
            delta_min: 0.5,
            sigma_in: 0.5,
            extra_slices: 3,
        }
    }
}

impl ScaleSpaceParams {
    /// Slices per octave: `nb_scales_per_octave + extra_slices`.
    #[inline]
    pub fn slices_per_octave(&self) -> usize {
        (self.nb_scales_per_octave + self.extra_slices) as usize
    }

    /// Check the configuration. Called by every octave source before the
    /// base image is prepared.
    ///
    /// Rules:
    /// - `delta_min` must be exactly 1.0 or 0.5 — any other sampling step
    ///   has no supported base-image preparation.
    /// - `sigma_min >= sigma_in * delta_min` — the extra smoothing applied
    ///   at ingestion must be non-negative.
    /// - at least one scale per octave and at least one slice.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delta_min != 1.0 && self.delta_min != 0.5 {
            return Err(ConfigError::UnsupportedDeltaMin(self.delta_min));
        }
        if self.sigma_min < self.sigma_in * self.delta_min {
            return Err(ConfigError::InconsistentSigmas {
                sigma_min: self.sigma_min,
                sigma_in: self.sigma_in,
                delta_min: self.delta_min,
            });
        }
        if self.nb_scales_per_octave == 0 {
            return Err(ConfigError::NoScales);
        }
        Ok(())
    }
}

/// Full detector configuration: scale-space geometry plus the acceptance
/// thresholds applied during refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    pub scale_space: ScaleSpaceParams,
    /// Minimum absolute DoG response of an accepted keypoint (applied to
    /// the interpolated peak value; 80% of it pre-filters discrete extrema).
    pub peak_threshold: f32,
    /// Maximum principal-curvature ratio `r`: candidates whose 2D Hessian
    /// trace²/det exceeds `(r+1)²/r` are edge responses, not blobs.
    pub edge_threshold: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        DetectorParams {
            scale_space: ScaleSpaceParams::default(),
            peak_threshold: 0.015,
            edge_threshold: 10.0,
        }
    }
}

/// Fatal configuration errors, surfaced before any octave is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `delta_min` is neither 1.0 nor 0.5.
    UnsupportedDeltaMin(f32),
    /// `sigma_min < sigma_in * delta_min`: the ingestion blur would need a
    /// negative variance.
    InconsistentSigmas {
        sigma_min: f32,
        sigma_in: f32,
        delta_min: f32,
    },
    /// `nb_scales_per_octave == 0`.
    NoScales,
    /// A feature mask was supplied whose dimensions differ from the input
    /// image.
    MaskSizeMismatch {
        image: (usize, usize),
        mask: (usize, usize),
    },
    /// The configured sigmas require a blur kernel wider than the
    /// accelerator can apply in one pass. CPU-only detection still works;
    /// the device path reports this before touching the GPU.
    KernelCapacityExceeded { half_width: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnsupportedDeltaMin(d) => {
                write!(f, "unsupported delta_min {d} (supported: 1.0, 0.5)")
            }
            ConfigError::InconsistentSigmas { sigma_min, sigma_in, delta_min } => write!(
                f,
                "sigma_min ({sigma_min}) must be >= sigma_in * delta_min ({})",
                sigma_in * delta_min
            ),
            ConfigError::NoScales => write!(f, "nb_scales_per_octave must be >= 1"),
            ConfigError::MaskSizeMismatch { image, mask } => write!(
                f,
                "mask size {}×{} does not match image size {}×{}",
                mask.0, mask.1, image.0, image.1
            ),
            ConfigError::KernelCapacityExceeded { half_width, max } => write!(
                f,
                "blur kernel half-width {half_width} exceeds the device capacity of {max}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(ScaleSpaceParams::default().validate(), Ok(()));
    }

    #[test]
    fn test_native_resolution_is_valid() {
        let p = ScaleSpaceParams { delta_min: 1.0, ..Default::default() };
        assert_eq!(p.validate(), Ok(()));
    }

    #[test]
    fn test_unsupported_delta_min() {
        let p = ScaleSpaceParams { delta_min: 0.25, ..Default::default() };
        assert!(matches!(p.validate(), Err(ConfigError::UnsupportedDeltaMin(_))));
    }

    #[test]
    fn test_inconsistent_sigmas() {
        let p = ScaleSpaceParams {
            sigma_min: 0.2,
            sigma_in: 0.5,
            delta_min: 1.0,
            ..Default::default()
        };
        assert!(matches!(p.validate(), Err(ConfigError::InconsistentSigmas { .. })));
    }

    #[test]
    fn test_zero_scales_rejected() {
        let p = ScaleSpaceParams { nb_scales_per_octave: 0, ..Default::default() };
        assert_eq!(p.validate(), Err(ConfigError::NoScales));
    }

    #[test]
    fn test_slices_per_octave() {
        let p = ScaleSpaceParams::default();
        assert_eq!(p.slices_per_octave(), 6);
    }
}
