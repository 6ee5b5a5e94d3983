//! The accelerator runtime boundary
//!
//! Everything a mirrored buffer needs from an accelerator runtime: device
//! enumeration and selection, host/device allocation, ordered transfer
//! channels and texture bindings.

use super::types::{ChannelId, DevicePtr, HostPtr, ResourceDesc, TextureDesc, TextureHandle};
use crate::device::{CapabilityDescriptor, DeviceInfo};
use crate::error::Result;

/// Accelerator runtime boundary
///
/// # Memory Model
///
/// The runtime hands out two kinds of memory:
///
/// 1. **Host memory** - addressable by the CPU, suitable as the source or
///    destination of asynchronous copies (page-locked on real hardware)
/// 2. **Device memory** - accelerator memory, only reachable through copies,
///    kernels and texture bindings
///
/// # Channels
///
/// ```text
/// channel 0 (default): [H2D copy] -> [kernel] -> [D2H copy] -> ...
/// channel 1          : [H2D copy] -> ...
/// ```
///
/// Copies are only *enqueued*; [`synchronize`](Self::synchronize) drains a
/// channel. Operations on the same channel complete in enqueue order, so a
/// kernel enqueued after a copy sees the copied data. Distinct channels are
/// unordered with respect to each other.
///
/// # Usage
///
/// ```rust
/// use mirror_runtime::{AcceleratorRuntime, ChannelId, SimRuntime};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = SimRuntime::new();
/// let channel = runtime.create_channel()?;
///
/// let host = runtime.alloc_host(64, 8)?;
/// let device = runtime.alloc_device(64)?;
///
/// // SAFETY: 64 valid bytes on both sides until the drain.
/// unsafe {
///     runtime.copy_host_to_device(device, host, 64, channel)?;
///     runtime.copy_device_to_host(host, device, 64, channel)?;
/// }
/// runtime.synchronize(channel)?;
///
/// runtime.free_device(device)?;
/// // SAFETY: allocated above with the same size and alignment.
/// unsafe { runtime.free_host(host, 64, 8)? };
/// runtime.destroy_channel(channel)?;
/// # Ok(())
/// # }
/// ```
pub trait AcceleratorRuntime: Send + Sync {
    /// Short runtime name for logs
    fn name(&self) -> &'static str;

    // ============================================================================================
    // Devices
    // ============================================================================================

    /// Number of accelerators visible to this runtime
    fn device_count(&self) -> Result<usize>;

    /// Static description of device `index`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `index` is not below [`device_count`](Self::device_count).
    fn device_info(&self, index: usize) -> Result<DeviceInfo>;

    /// Make `index` the device subsequent allocations and launches target
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `index` is out of range.
    fn set_active_device(&self, index: usize) -> Result<()>;

    /// Index of the currently active device
    fn active_device(&self) -> usize;

    /// Capability limits of device `index`
    fn capability(&self, index: usize) -> Result<CapabilityDescriptor> {
        Ok(self.device_info(index)?.capability)
    }

    /// Descriptions of every visible device, in index order
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        (0..self.device_count()?).map(|index| self.device_info(index)).collect()
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Allocate `bytes` of zeroed host memory aligned to `align`
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for `bytes == 0` or an alignment that is not a power of two
    /// - `AllocationFailure` when the memory cannot be provided
    fn alloc_host(&self, bytes: usize, align: usize) -> Result<HostPtr>;

    /// Free host memory from [`alloc_host`](Self::alloc_host)
    ///
    /// Drains every channel first, since queued copies may still reference it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_host` on this runtime with the same `bytes`
    /// and `align`, must not have been freed, and must not be used afterwards.
    unsafe fn free_host(&self, ptr: HostPtr, bytes: usize, align: usize) -> Result<()>;

    /// Allocate `bytes` of device memory on the active device
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for `bytes == 0`
    /// - `AllocationFailure` when device memory is exhausted
    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr>;

    /// Free device memory from [`alloc_device`](Self::alloc_device)
    ///
    /// Drains every channel first. The memory is released even when the drain
    /// reports an earlier asynchronous failure; that failure is returned.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `ptr` is not a live allocation.
    fn free_device(&self, ptr: DevicePtr) -> Result<()>;

    // ============================================================================================
    // Channels and transfers
    // ============================================================================================

    /// Create a new channel
    fn create_channel(&self) -> Result<ChannelId>;

    /// Drain and destroy a channel; the default channel cannot be destroyed
    fn destroy_channel(&self, channel: ChannelId) -> Result<()>;

    /// Enqueue a copy of `bytes` from host `src` to device `dst` on `channel`
    ///
    /// # Safety
    ///
    /// `src` must point to at least `bytes` readable bytes that stay valid and
    /// unmodified until `channel` has been drained.
    ///
    /// # Errors
    ///
    /// `TransferFailure` if the runtime rejects the copy.
    unsafe fn copy_host_to_device(&self, dst: DevicePtr, src: HostPtr, bytes: usize, channel: ChannelId) -> Result<()>;

    /// Enqueue a copy of `bytes` from device `src` to host `dst` on `channel`
    ///
    /// # Safety
    ///
    /// `dst` must point to at least `bytes` writable bytes that stay valid and
    /// are not accessed until `channel` has been drained.
    ///
    /// # Errors
    ///
    /// `TransferFailure` if the runtime rejects the copy.
    unsafe fn copy_device_to_host(&self, dst: HostPtr, src: DevicePtr, bytes: usize, channel: ChannelId) -> Result<()>;

    /// Block until everything queued on `channel` has completed
    ///
    /// # Errors
    ///
    /// `TransferFailure` if a queued operation failed; operations queued
    /// behind the failing one are discarded.
    fn synchronize(&self, channel: ChannelId) -> Result<()>;

    // ============================================================================================
    // Textures
    // ============================================================================================

    /// Create a read-only texture view over device memory
    ///
    /// # Errors
    ///
    /// `BindingFailure` if the descriptors are rejected (unsupported element
    /// width, memory that is not a live allocation, ...).
    fn create_texture(&self, resource: &ResourceDesc, texture: &TextureDesc) -> Result<TextureHandle>;

    /// Destroy a texture view; the viewed memory is untouched
    fn destroy_texture(&self, handle: TextureHandle) -> Result<()>;

    /// Downcast to the concrete runtime (e.g. [`SimRuntime`](crate::SimRuntime) in tests)
    fn as_any(&self) -> &dyn std::any::Any;
}
