//! Accelerator runtime boundary for mirrored buffers.
//!
//! This crate provides:
//! - **Runtime trait**: host/device allocation, transfer channels, copies,
//!   channel drains and texture bindings behind [`AcceleratorRuntime`]
//! - **Capabilities**: the static per-device limits a launch geometry is
//!   computed from ([`CapabilityDescriptor`])
//! - **Simulated runtime**: a host-memory reference implementation with FIFO
//!   channels, fault injection and a call log ([`SimRuntime`])
//! - **CUDA runtime**: the same boundary over the CUDA driver API (feature `cuda`)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      MirroredBuffer / MirroredTexture        │
//! │              (mirror-core)                   │
//! └──────────────────────┬───────────────────────┘
//!                        │ AcceleratorRuntime
//!              ┌─────────┴─────────┐
//!              ▼                   ▼
//!        ┌───────────┐       ┌───────────┐
//!        │ Simulated │       │   CUDA    │
//!        │  Runtime  │       │  Runtime  │
//!        └───────────┘       └───────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use mirror_runtime::{AcceleratorRuntime, ChannelId, SimRuntime};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = SimRuntime::new();
//!
//! let host = runtime.alloc_host(16, 4)?;
//! let device = runtime.alloc_device(16)?;
//!
//! // SAFETY: both regions are 16 bytes and stay alive until the drain below.
//! unsafe { runtime.copy_host_to_device(device, host, 16, ChannelId::DEFAULT)? };
//! runtime.synchronize(ChannelId::DEFAULT)?;
//!
//! runtime.free_device(device)?;
//! // SAFETY: allocated above with the same size and alignment.
//! unsafe { runtime.free_host(host, 16, 4)? };
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod runtime;
pub mod runtimes;

pub use device::{preferred_device, CapabilityDescriptor, DeviceInfo};
pub use error::{ErrorKind, MirrorError, Region, Result, TransferDirection};
pub use runtime::{
    AcceleratorRuntime, BlockDim, ChannelFormat, ChannelFormatKind, ChannelId, DevicePtr, ExecutionContext, GridDim,
    HostPtr, ReadMode, ResourceDesc, TextureDesc, TextureHandle,
};
pub use runtimes::{CudaRuntime, RuntimeEvent, SimRuntime};
