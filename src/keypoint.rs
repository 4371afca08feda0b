// keypoint.rs — Candidate and Keypoint records, mask-aware assembly.
//
// A Candidate is a discrete-grid DoG extremum before refinement; a Keypoint
// is an accepted, refined, scored candidate. The `theta` slot is left at
// 0.0 for the downstream orientation-assignment stage.

use crate::params::ConfigError;

/// A discrete local extremum in a DoG stack, prior to sub-pixel refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Discrete column within the octave's sampling grid.
    pub i: usize,
    /// Discrete row within the octave's sampling grid.
    pub j: usize,
    /// Discrete scale index within the DoG stack (interior: 1..=len-2).
    pub s: usize,
    /// Octave the candidate was found in.
    pub octave: u32,
    /// Column position in native image coordinates (`delta * i`).
    pub x: f32,
    /// Row position in native image coordinates (`delta * j`).
    pub y: f32,
    /// Raw DoG response at (i, j, s).
    pub value: f32,
}

/// An accepted keypoint, ready for orientation/descriptor computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Sub-pixel column in native image coordinates.
    pub x: f32,
    /// Sub-pixel row in native image coordinates.
    pub y: f32,
    /// Absolute blur level, logarithmically interpolated between slices.
    pub sigma: f32,
    /// Octave the keypoint was detected in.
    pub octave: u32,
    /// Interpolated DoG response at the refined position.
    pub peak_value: f32,
    /// Principal-curvature ratio (trace²/det of the 2D Hessian).
    pub edge_response: f32,
    /// Dominant orientation — assigned by a downstream stage, 0.0 here.
    pub theta: f32,
}

/// An 8-bit feature mask at native image resolution. Zero pixels exclude
/// keypoints; any nonzero value keeps them.
#[derive(Debug, Clone)]
pub struct Mask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Mask {
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "mask length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Mask { width, height, data }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Whether the native-resolution position (x, y) is allowed. Positions
    /// are rounded to the nearest pixel and clamped to the mask bounds.
    pub fn allows(&self, x: f32, y: f32) -> bool {
        let px = (x.round().max(0.0) as usize).min(self.width - 1);
        let py = (y.round().max(0.0) as usize).min(self.height - 1);
        self.data[py * self.width + px] != 0
    }
}

/// Apply an optional feature mask to a set of refined keypoints.
///
/// With no mask this is a pass-through. With a mask, keypoints whose
/// native-resolution position falls on a zero mask pixel are dropped; all
/// others are returned unchanged and in order. A mask whose dimensions
/// differ from the native image size is a configuration error.
pub fn assemble(
    keypoints: Vec<Keypoint>,
    native_size: (usize, usize),
    mask: Option<&Mask>,
) -> Result<Vec<Keypoint>, ConfigError> {
    let Some(mask) = mask else {
        return Ok(keypoints);
    };
    if (mask.width(), mask.height()) != native_size {
        return Err(ConfigError::MaskSizeMismatch {
            image: native_size,
            mask: (mask.width(), mask.height()),
        });
    }
    Ok(keypoints
        .into_iter()
        .filter(|kp| mask.allows(kp.x, kp.y))
        .collect())
}
