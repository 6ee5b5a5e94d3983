//! Runtime implementations
//!
//! - `sim` - host-memory reference runtime (always available)
//! - `cuda` - CUDA driver runtime (NVIDIA GPUs, feature `cuda`)

pub mod cuda;
pub mod sim;

pub use cuda::CudaRuntime;
pub use sim::{RuntimeEvent, SimRuntime};
