//! # mirror-core - mirrored host/device buffers and launch geometry
//!
//! Keeps a host allocation and an accelerator allocation of the same size in
//! step, optionally exposes the accelerator copy as a read-only texture, and
//! computes launch geometries that visit every element of an input exactly
//! once.
//!
//! ## Architecture
//!
//! ```text
//! LaunchPolicy ──plan(capability, N)──▶ LaunchPlan { groups, threads }
//!
//! MirroredTexture<T>
//! └── MirroredBuffer<T> ── host region ◀─push/pop─▶ device region
//!                      │
//!                      ▼ Arc<dyn AcceleratorRuntime>
//!               SimRuntime | CudaRuntime
//! ```
//!
//! ## Example
//!
//! ```rust
//! use mirror_core::{compute_launch_plan, open_runtime, MirroredBuffer, RuntimeKind, Transfer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = open_runtime(RuntimeKind::Simulated)?;
//! let capability = runtime.capability(runtime.active_device())?;
//!
//! let mut buffer = MirroredBuffer::<f32>::new(runtime, 1024)?;
//! buffer.host_mut()?.fill(1.5);
//! buffer.push(Transfer::Sync)?;
//!
//! let plan = compute_launch_plan(&capability, buffer.len() as u64)?;
//! assert_eq!(plan.stride(), 32);
//!
//! buffer.pop(Transfer::Sync)?;
//! buffer.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`launch`] - launch policy, plans and the coverage check
//! - [`buffer`] - [`MirroredBuffer`] and [`Transfer`] modes
//! - [`texture`] - [`MirroredTexture`]
//! - [`context`] - runtime selection

pub mod buffer;
pub mod context;
pub mod launch;
pub mod texture;

pub use buffer::{MirroredBuffer, Transfer};
pub use context::{open_auto, open_runtime, RuntimeKind};
pub use launch::{
    ceil_div, compute_launch_plan, plan_for_device, LaunchPlan, LaunchPolicy, StridedIndices,
    DEFAULT_MAX_THREADS_PER_GROUP, DEFAULT_MIN_ELEMENTS_PER_THREAD,
};
pub use texture::MirroredTexture;

pub use mirror_runtime::{
    AcceleratorRuntime, CapabilityDescriptor, ChannelId, DeviceInfo, DevicePtr, ErrorKind, HostPtr, MirrorError,
    Result, SimRuntime, TextureHandle,
};
