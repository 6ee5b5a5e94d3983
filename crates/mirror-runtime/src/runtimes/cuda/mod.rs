//! CUDA runtime for NVIDIA GPUs
//!
//! Implements [`AcceleratorRuntime`](crate::AcceleratorRuntime) over the CUDA
//! driver API through `cudarc`.
//!
//! # Architecture
//!
//! ```text
//! CudaRuntime
//! ├── Devices   - one primary context per visible GPU
//! ├── Channels  - channel 0 is the null stream, others are non-blocking streams
//! ├── Host      - page-locked allocations (cuMemHostAlloc)
//! └── Textures  - linear texture objects (cuTexObjectCreate)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mirror_runtime::{AcceleratorRuntime, CudaRuntime};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! if CudaRuntime::is_available() {
//!     let runtime = CudaRuntime::new()?;
//!     let device = runtime.alloc_device(1024)?;
//!     runtime.free_device(device)?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{MirrorError, Result};

#[cfg(feature = "cuda")]
use crate::device::{CapabilityDescriptor, DeviceInfo};
#[cfg(feature = "cuda")]
use crate::error::{Region, TransferDirection};
#[cfg(feature = "cuda")]
use crate::runtime::{
    AcceleratorRuntime, ChannelFormatKind, ChannelId, DevicePtr, HostPtr, ReadMode, ResourceDesc, TextureDesc,
    TextureHandle,
};
#[cfg(feature = "cuda")]
use cudarc::driver::{result, sys, CudaDevice, DriverError};
#[cfg(feature = "cuda")]
use parking_lot::Mutex;
#[cfg(feature = "cuda")]
use std::collections::{HashMap, HashSet};
#[cfg(feature = "cuda")]
use std::sync::Arc;

/// `CU_TRSF_READ_AS_INTEGER`: fetch raw integers instead of normalized floats
#[cfg(feature = "cuda")]
const TRSF_READ_AS_INTEGER: u32 = 0x01;

/// A CUDA stream handle
///
/// Streams belong to a context, not a thread; the driver API is thread-safe
/// once the context is current.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone, Copy)]
struct Stream(sys::CUstream);

#[cfg(feature = "cuda")]
unsafe impl Send for Stream {}

#[cfg(feature = "cuda")]
impl Stream {
    const NULL: Stream = Stream(std::ptr::null_mut());
}

#[cfg(feature = "cuda")]
struct CudaState {
    active: usize,
    channels: HashMap<u64, Stream>,
    next_channel: u64,
    /// Page-locked host allocations: address -> bytes
    host: HashMap<usize, usize>,
    device: HashMap<u64, usize>,
    textures: HashSet<u64>,
}

/// CUDA driver runtime
#[cfg(feature = "cuda")]
pub struct CudaRuntime {
    devices: Vec<Arc<CudaDevice>>,
    infos: Vec<DeviceInfo>,
    state: Mutex<CudaState>,
}

#[cfg(feature = "cuda")]
fn driver_error(context: &str, err: DriverError) -> MirrorError {
    MirrorError::invalid_state(format!("{context}: {err}"))
}

#[cfg(feature = "cuda")]
fn query_device(device: &CudaDevice) -> Result<DeviceInfo> {
    use sys::CUdevice_attribute as Attr;

    let attribute = |attr: Attr| -> Result<u32> {
        let value = device
            .attribute(attr)
            .map_err(|e| driver_error("device attribute query failed", e))?;
        Ok(u32::try_from(value).unwrap_or(0))
    };

    let capability = CapabilityDescriptor::new(
        attribute(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR)?,
        attribute(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?,
        attribute(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
    );
    let timeout = attribute(Attr::CU_DEVICE_ATTRIBUTE_KERNEL_EXEC_TIMEOUT)? != 0;
    let name = device.name().map_err(|e| driver_error("device name query failed", e))?;

    Ok(DeviceInfo::new(name, capability, timeout))
}

#[cfg(feature = "cuda")]
impl CudaRuntime {
    /// Open every visible CUDA device
    ///
    /// Device 0 is active until [`set_active_device`](AcceleratorRuntime::set_active_device).
    ///
    /// # Errors
    ///
    /// `InvalidState` if the driver cannot be initialised or no device is visible.
    pub fn new() -> Result<Self> {
        let count = CudaDevice::count().map_err(|e| driver_error("CUDA driver initialisation failed", e))?;
        let count = usize::try_from(count).unwrap_or(0);
        if count == 0 {
            return Err(MirrorError::invalid_state("no CUDA device is visible"));
        }

        let mut devices = Vec::with_capacity(count);
        let mut infos = Vec::with_capacity(count);
        for ordinal in 0..count {
            let device = CudaDevice::new(ordinal).map_err(|e| driver_error("CUDA device initialisation failed", e))?;
            let info = query_device(&device)?;
            tracing::debug!(ordinal, name = %info.name, capability = %info.capability, "opened CUDA device");
            infos.push(info);
            devices.push(device);
        }

        let mut channels = HashMap::new();
        channels.insert(ChannelId::DEFAULT.id(), Stream::NULL);

        Ok(Self {
            devices,
            infos,
            state: Mutex::new(CudaState {
                active: 0,
                channels,
                next_channel: 1,
                host: HashMap::new(),
                device: HashMap::new(),
                textures: HashSet::new(),
            }),
        })
    }

    /// Check if a CUDA device can be opened on this system
    pub fn is_available() -> bool {
        CudaDevice::count().map(|n| n > 0).unwrap_or(false)
    }

    fn bind(&self, active: usize) -> Result<()> {
        self.devices[active]
            .bind_to_thread()
            .map_err(|e| driver_error("binding CUDA context failed", e))
    }

    fn stream(state: &CudaState, channel: ChannelId, direction: TransferDirection) -> Result<Stream> {
        state
            .channels
            .get(&channel.id())
            .copied()
            .ok_or_else(|| MirrorError::transfer(direction, format!("unknown {channel}")))
    }

    fn drain(stream: Stream) -> std::result::Result<(), DriverError> {
        // SAFETY: the stream is live for as long as it is in the channel map.
        unsafe { result::stream::synchronize(stream.0) }
    }

    /// Drain every channel, reporting the first failure
    fn drain_all(&self, state: &CudaState) -> Result<()> {
        let mut first_error = None;
        for stream in state.channels.values() {
            if let Err(err) = Self::drain(*stream) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            // An asynchronous failure cannot be attributed to one direction.
            Some(err) => Err(MirrorError::transfer(TransferDirection::DeviceToHost, err)),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "cuda")]
impl AcceleratorRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.infos.len())
    }

    fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        self.infos.get(index).cloned().ok_or_else(|| {
            MirrorError::invalid_argument(format!("device index {index} out of range ({} devices)", self.infos.len()))
        })
    }

    fn set_active_device(&self, index: usize) -> Result<()> {
        self.device_info(index)?;
        let mut state = self.state.lock();
        if index != state.active && state.channels.len() > 1 {
            return Err(MirrorError::invalid_state(
                "cannot switch devices while channels of the current device exist",
            ));
        }
        self.bind(index)?;
        state.active = index;
        Ok(())
    }

    fn active_device(&self) -> usize {
        self.state.lock().active
    }

    fn alloc_host(&self, bytes: usize, align: usize) -> Result<HostPtr> {
        if bytes == 0 || !align.is_power_of_two() {
            return Err(MirrorError::invalid_argument(format!("host allocation of {bytes}B aligned to {align}")));
        }
        let mut state = self.state.lock();
        self.bind(state.active)?;

        let mut raw = std::ptr::null_mut();
        // SAFETY: the context is current; `raw` receives the allocation.
        unsafe { sys::lib().cuMemHostAlloc(&mut raw, bytes, 0).result() }
            .map_err(|e| MirrorError::allocation(Region::Host, bytes, e))?;
        let ptr = HostPtr::new(raw.cast())
            .ok_or_else(|| MirrorError::allocation(Region::Host, bytes, "driver returned null"))?;

        // Pinned allocations are page aligned.
        if ptr.addr() % align != 0 {
            // SAFETY: just allocated, never shared.
            unsafe {
                let _ = sys::lib().cuMemFreeHost(raw);
            }
            return Err(MirrorError::allocation(Region::Host, bytes, format!("alignment {align} not satisfied")));
        }

        state.host.insert(ptr.addr(), bytes);
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: HostPtr, bytes: usize, _align: usize) -> Result<()> {
        let mut state = self.state.lock();
        match state.host.get(&ptr.addr()) {
            Some(&len) if len == bytes => {}
            _ => {
                return Err(MirrorError::invalid_argument(format!(
                    "host pointer {ptr} is not a live {bytes}-byte allocation"
                )))
            }
        }
        self.bind(state.active)?;
        let drained = self.drain_all(&state);

        // SAFETY: allocated by cuMemHostAlloc and no queued copy references it any more.
        unsafe { sys::lib().cuMemFreeHost(ptr.as_ptr().cast()).result() }
            .map_err(|e| driver_error("cuMemFreeHost failed", e))?;
        state.host.remove(&ptr.addr());
        drained
    }

    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(MirrorError::invalid_argument("device allocation of 0 bytes"));
        }
        let mut state = self.state.lock();
        self.bind(state.active)?;

        // SAFETY: the active context is current.
        let raw = unsafe { result::malloc_sync(bytes) }.map_err(|e| MirrorError::allocation(Region::Device, bytes, e))?;
        state.device.insert(raw, bytes);
        Ok(DevicePtr::new(raw))
    }

    fn free_device(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        if !state.device.contains_key(&ptr.addr()) {
            return Err(MirrorError::invalid_argument(format!("device pointer {ptr} is not a live allocation")));
        }
        self.bind(state.active)?;
        let drained = self.drain_all(&state);

        // SAFETY: allocated by cuMemAlloc and every channel is drained.
        unsafe { result::free_sync(ptr.addr()) }.map_err(|e| driver_error("cuMemFree failed", e))?;
        state.device.remove(&ptr.addr());
        drained
    }

    fn create_channel(&self) -> Result<ChannelId> {
        let mut state = self.state.lock();
        self.bind(state.active)?;
        let raw = result::stream::create(result::stream::StreamKind::NonBlocking)
            .map_err(|e| driver_error("cuStreamCreate failed", e))?;

        let channel = ChannelId::new(state.next_channel);
        state.next_channel += 1;
        state.channels.insert(channel.id(), Stream(raw));
        Ok(channel)
    }

    fn destroy_channel(&self, channel: ChannelId) -> Result<()> {
        if channel.is_default() {
            return Err(MirrorError::invalid_argument("the default channel cannot be destroyed"));
        }
        let mut state = self.state.lock();
        let stream = state
            .channels
            .remove(&channel.id())
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown {channel}")))?;
        self.bind(state.active)?;
        let drained = Self::drain(stream);
        // SAFETY: removed from the map, so nothing can enqueue on it any more.
        unsafe { result::stream::destroy(stream.0) }.map_err(|e| driver_error("cuStreamDestroy failed", e))?;
        drained.map_err(|e| MirrorError::transfer(TransferDirection::DeviceToHost, e))
    }

    unsafe fn copy_host_to_device(&self, dst: DevicePtr, src: HostPtr, bytes: usize, channel: ChannelId) -> Result<()> {
        let direction = TransferDirection::HostToDevice;
        let state = self.state.lock();
        let stream = Self::stream(&state, channel, direction)?;
        self.bind(state.active)?;

        // SAFETY: the caller guarantees `bytes` readable bytes at `src` until the drain.
        unsafe {
            let src = std::slice::from_raw_parts(src.as_ptr().cast_const(), bytes);
            result::memcpy_htod_async(dst.addr(), src, stream.0)
        }
        .map_err(|e| MirrorError::transfer(direction, e))
    }

    unsafe fn copy_device_to_host(&self, dst: HostPtr, src: DevicePtr, bytes: usize, channel: ChannelId) -> Result<()> {
        let direction = TransferDirection::DeviceToHost;
        let state = self.state.lock();
        let stream = Self::stream(&state, channel, direction)?;
        self.bind(state.active)?;

        // SAFETY: the caller guarantees `bytes` writable bytes at `dst` until the drain.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(dst.as_ptr(), bytes);
            result::memcpy_dtoh_async(dst, src.addr(), stream.0)
        }
        .map_err(|e| MirrorError::transfer(direction, e))
    }

    fn synchronize(&self, channel: ChannelId) -> Result<()> {
        let state = self.state.lock();
        let stream = state
            .channels
            .get(&channel.id())
            .copied()
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown {channel}")))?;
        self.bind(state.active)?;
        Self::drain(stream).map_err(|e| MirrorError::transfer(TransferDirection::DeviceToHost, e))
    }

    fn create_texture(&self, resource: &ResourceDesc, texture: &TextureDesc) -> Result<TextureHandle> {
        use sys::CUarray_format as Format;

        let ResourceDesc::Linear { ptr, size_bytes, format } = *resource;
        let array_format = match (format.kind, format.bits_per_channel) {
            (ChannelFormatKind::Unsigned, 8) => Format::CU_AD_FORMAT_UNSIGNED_INT8,
            (ChannelFormatKind::Unsigned, 16) => Format::CU_AD_FORMAT_UNSIGNED_INT16,
            (ChannelFormatKind::Unsigned, 32) => Format::CU_AD_FORMAT_UNSIGNED_INT32,
            (ChannelFormatKind::Signed, 8) => Format::CU_AD_FORMAT_SIGNED_INT8,
            (ChannelFormatKind::Signed, 16) => Format::CU_AD_FORMAT_SIGNED_INT16,
            (ChannelFormatKind::Signed, 32) => Format::CU_AD_FORMAT_SIGNED_INT32,
            (ChannelFormatKind::Float, 16) => Format::CU_AD_FORMAT_HALF,
            (ChannelFormatKind::Float, 32) => Format::CU_AD_FORMAT_FLOAT,
            (kind, bits) => {
                return Err(MirrorError::binding(format!(
                    "{bits}-bit {kind:?} channels are not supported for linear textures"
                )))
            }
        };

        let mut state = self.state.lock();
        match state.device.get(&ptr.addr()) {
            Some(&len) if size_bytes > 0 && size_bytes <= len => {}
            _ => {
                return Err(MirrorError::binding(format!(
                    "{ptr} is not a live allocation of at least {size_bytes} bytes"
                )))
            }
        }
        self.bind(state.active)?;

        // SAFETY: both descriptors are plain C structs for which all-zero is valid;
        // only the linear member of the resource union is written and read.
        let handle = unsafe {
            let mut res_desc: sys::CUDA_RESOURCE_DESC = std::mem::zeroed();
            res_desc.resType = sys::CUresourcetype::CU_RESOURCE_TYPE_LINEAR;
            res_desc.res.linear.devPtr = ptr.addr();
            res_desc.res.linear.format = array_format;
            res_desc.res.linear.numChannels = 1;
            res_desc.res.linear.sizeInBytes = size_bytes;

            let mut tex_desc: sys::CUDA_TEXTURE_DESC = std::mem::zeroed();
            if texture.read_mode == ReadMode::ElementType {
                tex_desc.flags = TRSF_READ_AS_INTEGER;
            }

            let mut object: sys::CUtexObject = 0;
            sys::lib()
                .cuTexObjectCreate(&mut object, &res_desc, &tex_desc, std::ptr::null())
                .result()
                .map_err(|e| MirrorError::binding(e.to_string()))?;
            object
        };

        state.textures.insert(handle);
        Ok(TextureHandle::new(handle))
    }

    fn destroy_texture(&self, handle: TextureHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.textures.remove(&handle.id()) {
            return Err(MirrorError::invalid_argument(format!("unknown texture {handle}")));
        }
        self.bind(state.active)?;
        // SAFETY: created by cuTexObjectCreate and removed from the live set.
        unsafe { sys::lib().cuTexObjectDestroy(handle.id()).result() }
            .map_err(|e| driver_error("cuTexObjectDestroy failed", e))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(feature = "cuda")]
impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if self.bind(state.active).is_err() {
            return;
        }
        for (_, stream) in state.channels.drain() {
            if !stream.0.is_null() {
                // SAFETY: owned by this runtime and no longer reachable.
                unsafe {
                    let _ = result::stream::synchronize(stream.0);
                    let _ = result::stream::destroy(stream.0);
                }
            }
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub struct CudaRuntime;

#[cfg(not(feature = "cuda"))]
impl CudaRuntime {
    pub fn new() -> Result<Self> {
        Err(MirrorError::invalid_state(
            "CUDA runtime requires the 'cuda' feature to be enabled",
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_availability() {
        // Depends on hardware and the `cuda` feature.
        let _ = CudaRuntime::is_available();
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_stub_reports_missing_feature() {
        assert!(!CudaRuntime::is_available());
        assert!(matches!(CudaRuntime::new(), Err(MirrorError::InvalidState(_))));
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn test_cuda_round_trip() {
        if !CudaRuntime::is_available() {
            return;
        }
        let runtime = CudaRuntime::new().unwrap();
        let channel = runtime.create_channel().unwrap();
        let host = runtime.alloc_host(16, 16).unwrap();
        let device = runtime.alloc_device(16).unwrap();

        // SAFETY: 16 pinned bytes, alive for the whole test.
        let bytes = unsafe { std::slice::from_raw_parts_mut(host.as_ptr(), 16) };
        bytes.copy_from_slice(b"mirrored buffers");
        unsafe {
            runtime.copy_host_to_device(device, host, 16, channel).unwrap();
        }
        runtime.synchronize(channel).unwrap();
        bytes.fill(0);
        unsafe {
            runtime.copy_device_to_host(host, device, 16, channel).unwrap();
        }
        runtime.synchronize(channel).unwrap();
        assert_eq!(bytes, b"mirrored buffers");

        runtime.free_device(device).unwrap();
        unsafe { runtime.free_host(host, 16, 16).unwrap() };
        runtime.destroy_channel(channel).unwrap();
    }
}
