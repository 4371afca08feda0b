// Blitzen — scale-invariant blob (DoG) keypoint detector.
// CPU reference implementation with a wgpu compute mirror.
//
// References: Lowe — "Distinctive Image Features from Scale-Invariant
// Keypoints" (IJCV 2004); Rey-Otero, Delbracio — "Anatomy of the SIFT
// Method" (IPOL 2014).
//
// Pipeline:
//   image → Gaussian scale space (octaves of blurred slices)
//         → Difference-of-Gaussian stacks
//         → discrete 3D extrema → sub-pixel refinement → keypoints
//
// Every stage exists twice: a CPU implementation (the authoritative
// reference) and a GPU compute mirror under `gpu::` that is validated
// against it slice-for-slice. Orientation/descriptor computation is a
// downstream stage; the detector stops at located, scored keypoints.

pub mod convolution;
pub mod detector;
pub mod dog;
pub mod image;
pub mod keypoint;
pub mod params;
pub mod refine;
pub mod resample;
pub mod scale_space;

pub mod gpu;
