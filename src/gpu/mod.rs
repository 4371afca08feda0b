// gpu/mod.rs — compute-accelerator mirror of the CPU detector.
//
// Every kernel here reproduces a CPU stage bit-for-bit in structure:
//   upload → base preparation (upsample + blur) → octave blur chain →
//   DoG subtraction → discrete extrema scan.
// The CPU modules remain the authoritative reference; the GPU path is
// validated against them numerically (see the inner_* tests).
//
// The split between device and host work follows the data sizes: full
// slices stay resident on the device across the whole octave chain, and
// only two things ever cross back — the dense extrema score buffer and,
// once per octave, the DoG slices the quadratic refinement needs. The
// refinement itself is a scalar 3×3 solve per candidate and stays on the
// CPU, shared verbatim with the host path so both paths accept and reject
// identically.

pub mod device;
pub mod dog;
pub mod scale_space;
pub mod slice;

pub use device::{GpuDevice, GpuError, WorkgroupSize};
