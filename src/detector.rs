// detector.rs — the end-to-end keypoint detector.
//
// Pipeline per octave: blurred slices → DoG stack → discrete extrema →
// quadratic refinement → threshold/edge/border gates. Octaves stream one
// at a time through an `OctaveSource`, so peak memory is one octave's
// slices plus its DoG stack regardless of image size.
//
// Two entry points share the whole downstream pipeline:
//   `detect`     — CPU scale space.
//   `detect_gpu` — device scale space + device extrema; only the DoG
//                  slices of octaves that actually produced candidates
//                  are downloaded, and the refinement runs on the CPU so
//                  both paths apply identical accept/reject arithmetic.

use std::fmt;

use crate::dog::{find_candidates, DogStack};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::dog::{GpuDogPipelines, GpuDogStack};
use crate::gpu::scale_space::GpuScaleSpace;
use crate::image::Image;
use crate::keypoint::{assemble, Keypoint, Mask};
use crate::params::{ConfigError, DetectorParams};
use crate::refine::Refiner;
use crate::scale_space::{OctaveSource, ScaleSpace};

/// Scale-invariant blob detector. Construction validates the parameters;
/// a `Detector` that exists can always run.
pub struct Detector {
    params: DetectorParams,
}

impl Detector {
    pub fn new(params: DetectorParams) -> Result<Self, ConfigError> {
        params.scale_space.validate()?;
        Ok(Detector { params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect keypoints on the CPU.
    ///
    /// `image` is grayscale with values in [0, 1] (`peak_threshold` is
    /// calibrated to that range). `mask`, if given, must match the image
    /// dimensions; keypoints on zero mask pixels are dropped.
    pub fn detect(
        &self,
        image: &Image,
        mask: Option<&Mask>,
    ) -> Result<Vec<Keypoint>, DetectError> {
        let mut source = ScaleSpace::new(self.params.scale_space);
        self.detect_on(&mut source, image, mask)
    }

    /// Detect keypoints with the scale space built by `source`. The
    /// downstream stages (DoG, extrema, refinement, mask) are identical
    /// for every source.
    pub fn detect_on(
        &self,
        source: &mut dyn OctaveSource,
        image: &Image,
        mask: Option<&Mask>,
    ) -> Result<Vec<Keypoint>, DetectError> {
        source.set_image(image)?;
        let native_size = source.native_size();

        let mut keypoints = Vec::new();
        while let Some(octave) = source.next_octave() {
            let Some(stack) = DogStack::from_octave(&octave) else {
                continue;
            };
            let candidates = find_candidates(&stack, self.params.peak_threshold);
            if candidates.is_empty() {
                continue;
            }
            let refiner = Refiner::new(
                &stack,
                self.params.peak_threshold,
                self.params.edge_threshold,
                native_size,
            );
            keypoints.extend(candidates.iter().filter_map(|c| refiner.refine(c)));
        }

        Ok(assemble(keypoints, native_size, mask)?)
    }

    /// Detect keypoints with the scale space and extrema scan on the GPU.
    ///
    /// Refinement stays on the CPU: the DoG stack of each octave that
    /// produced candidates is downloaded once and fed through the same
    /// `Refiner` the host path uses.
    pub fn detect_gpu(
        &self,
        gpu: &GpuDevice,
        image: &Image,
        mask: Option<&Mask>,
    ) -> Result<Vec<Keypoint>, DetectError> {
        let pipelines = GpuDogPipelines::new(gpu);
        let mut source = GpuScaleSpace::new(gpu, self.params.scale_space);
        source.set_image(image)?;
        let native_size = source.native_size();

        let mut keypoints = Vec::new();
        while let Some(octave) = source.next_device_octave() {
            let Some(device_stack) = GpuDogStack::from_octave(gpu, &pipelines, &octave) else {
                continue;
            };
            let candidates =
                device_stack.find_candidates(gpu, &pipelines, self.params.peak_threshold);
            if candidates.is_empty() {
                continue;
            }
            let stack = device_stack.download(gpu);
            let refiner = Refiner::new(
                &stack,
                self.params.peak_threshold,
                self.params.edge_threshold,
                native_size,
            );
            keypoints.extend(candidates.iter().filter_map(|c| refiner.refine(c)));
        }

        Ok(assemble(keypoints, native_size, mask)?)
    }
}

// ============================================================
// Error type
// ============================================================

/// Detection failures. Per-candidate rejections are not errors — only a
/// bad configuration or a broken GPU context aborts a detection.
#[derive(Debug)]
pub enum DetectError {
    Config(ConfigError),
    Gpu(GpuError),
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::Config(e) => write!(f, "configuration error: {e}"),
            DetectError::Gpu(e) => write!(f, "GPU error: {e}"),
        }
    }
}

impl std::error::Error for DetectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DetectError::Config(e) => Some(e),
            DetectError::Gpu(e) => Some(e),
        }
    }
}

impl From<ConfigError> for DetectError {
    fn from(e: ConfigError) -> Self {
        DetectError::Config(e)
    }
}

impl From<GpuError> for DetectError {
    fn from(e: GpuError) -> Self {
        DetectError::Gpu(e)
    }
}

// ============================================================
// Tests
// ============================================================
