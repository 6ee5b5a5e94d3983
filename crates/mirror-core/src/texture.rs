//! Read-only texture views over mirrored buffers
//!
//! [`MirroredTexture<T>`] owns a [`MirroredBuffer<T>`] and, while the device
//! region exists, a texture handle viewing it. The handle never outlives the
//! memory: releasing destroys the texture first, then frees the buffer.
//! The buffer is only reachable immutably; host edits go through the
//! texture so the regions cannot be released behind the handle.

use crate::buffer::{MirroredBuffer, Transfer};
use mirror_runtime::{
    AcceleratorRuntime, ChannelFormat, ChannelId, MirrorError, ReadMode, ResourceDesc, Result, TextureDesc,
    TextureHandle,
};
use std::fmt;
use std::sync::Arc;

/// A mirrored buffer whose device region is also bound to a texture
#[derive(Debug)]
pub struct MirroredTexture<T: bytemuck::Pod> {
    buffer: MirroredBuffer<T>,
    handle: Option<TextureHandle>,
}

impl<T: bytemuck::Pod> MirroredTexture<T> {
    /// Allocate `len` elements on the default channel and bind them
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>, len: usize) -> Result<Self> {
        Self::with_channel(runtime, len, ChannelId::DEFAULT)
    }

    /// Allocate `len` elements transferring on `channel` and bind them
    ///
    /// # Errors
    ///
    /// Allocation errors from [`MirroredBuffer::with_options`], or
    /// `BindingFailure` if the runtime rejects the texture (the buffer is
    /// released before returning).
    pub fn with_channel(runtime: Arc<dyn AcceleratorRuntime>, len: usize, channel: ChannelId) -> Result<Self> {
        let mut texture = Self {
            buffer: MirroredBuffer::with_options(runtime, len, channel, false)?,
            handle: None,
        };
        if let Err(err) = texture.bind() {
            if let Err(release) = texture.release() {
                tracing::warn!(error = %release, "releasing buffer after failed binding failed");
            }
            return Err(err);
        }
        Ok(texture)
    }

    /// Linear, single-channel, unsigned view of the whole device region
    ///
    /// # Errors
    ///
    /// `InvalidState` while the buffer holds no device region.
    pub fn resource_desc(&self) -> Result<ResourceDesc> {
        let ptr = self
            .buffer
            .device_ptr()
            .ok_or_else(|| MirrorError::invalid_state("texture has no device region to view"))?;
        Ok(ResourceDesc::linear(ptr, self.buffer.byte_size(), ChannelFormat::unsigned_for::<T>()))
    }

    /// Fetches return the raw element type
    pub fn texture_desc(&self) -> TextureDesc {
        TextureDesc {
            read_mode: ReadMode::ElementType,
        }
    }

    /// (Re)create the texture over the current device region
    ///
    /// Needed after the device pointer changes; a push into the same region
    /// is visible through the existing handle.
    pub fn bind(&mut self) -> Result<()> {
        let _span = mirror_tracing::perf_span!("texture_bind", bytes = self.buffer.byte_size());
        self.unbind()?;
        let resource = self.resource_desc()?;
        let handle = self.buffer.runtime().create_texture(&resource, &self.texture_desc())?;
        tracing::debug!(%handle, bytes = self.buffer.byte_size(), "bound texture");
        self.handle = Some(handle);
        Ok(())
    }

    /// Destroy the texture, keeping the buffer
    pub fn unbind(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.buffer.runtime().destroy_texture(handle),
            None => Ok(()),
        }
    }

    /// Handle to pass to kernels, `None` while unbound
    pub fn handle(&self) -> Option<TextureHandle> {
        self.handle
    }

    /// Allocate the buffer if needed and make sure the texture views it
    pub fn allocate(&mut self) -> Result<()> {
        self.buffer.allocate()?;
        if self.handle.is_none() {
            self.bind()?;
        }
        Ok(())
    }

    pub fn push(&mut self, mode: Transfer) -> Result<()> {
        self.buffer.push(mode)
    }

    pub fn pop(&mut self, mode: Transfer) -> Result<()> {
        self.buffer.pop(mode)
    }

    pub fn synchronize(&mut self) -> Result<()> {
        self.buffer.synchronize()
    }

    pub fn buffer(&self) -> &MirroredBuffer<T> {
        &self.buffer
    }

    /// See [`MirroredBuffer::host`]
    pub fn host(&self) -> Result<&[T]> {
        self.buffer.host()
    }

    /// Mutable host region; push to make edits visible through the texture
    pub fn host_mut(&mut self) -> Result<&mut [T]> {
        self.buffer.host_mut()
    }

    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        self.buffer.copy_from_slice(src)
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.buffer.to_vec()
    }

    /// Destroy the texture, then release the buffer; a no-op when released
    pub fn release(&mut self) -> Result<()> {
        let unbound = self.unbind();
        let released = self.buffer.release();
        unbound.and(released)
    }
}

impl<T: bytemuck::Pod> Drop for MirroredTexture<T> {
    fn drop(&mut self) {
        // Runs before `buffer` is dropped, so the handle goes first.
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "releasing mirrored texture during drop failed");
        }
    }
}

impl<T: bytemuck::Pod> fmt::Display for MirroredTexture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(handle) => write!(f, "{} bound to {handle}", self.buffer),
            None => write!(f, "{} unbound", self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_runtime::{ErrorKind, RuntimeEvent, SimRuntime};

    fn sim() -> (Arc<SimRuntime>, Arc<dyn AcceleratorRuntime>) {
        let sim = Arc::new(SimRuntime::new());
        let runtime: Arc<dyn AcceleratorRuntime> = sim.clone();
        (sim, runtime)
    }

    #[test]
    fn test_texture_views_pushed_data() {
        let (sim, runtime) = sim();
        let mut texture = MirroredTexture::<u32>::new(runtime, 4).unwrap();
        texture.copy_from_slice(&[5, 6, 7, 8]).unwrap();
        texture.push(Transfer::Sync).unwrap();

        let handle = texture.handle().unwrap();
        assert_eq!(sim.texture_fetch::<u32>(handle, 2).unwrap(), 7);

        // Same pointer: the handle sees new contents without rebinding.
        texture.copy_from_slice(&[1, 1, 1, 1]).unwrap();
        texture.push(Transfer::Sync).unwrap();
        assert_eq!(sim.texture_fetch::<u32>(handle, 2).unwrap(), 1);
    }

    #[test]
    fn test_descriptors() {
        let (_sim, runtime) = sim();
        let texture = MirroredTexture::<u16>::new(runtime, 8).unwrap();
        let resource = texture.resource_desc().unwrap();
        assert_eq!(
            resource,
            ResourceDesc::linear(texture.buffer().device_ptr().unwrap(), 16, ChannelFormat::unsigned_for::<u16>())
        );
        assert_eq!(texture.texture_desc().read_mode, ReadMode::ElementType);
    }

    #[test]
    fn test_release_destroys_texture_before_device_memory() {
        let (sim, runtime) = sim();
        let mut texture = MirroredTexture::<u32>::new(runtime, 4).unwrap();
        sim.clear_events();
        texture.release().unwrap();

        let events = sim.events();
        let destroyed = events
            .iter()
            .position(|e| matches!(e, RuntimeEvent::TextureDestroyed { .. }))
            .unwrap();
        let freed = events
            .iter()
            .position(|e| matches!(e, RuntimeEvent::DeviceFree { .. }))
            .unwrap();
        assert!(destroyed < freed);
        assert!(texture.handle().is_none());
        assert_eq!(sim.live_textures(), 0);

        texture.release().unwrap();
    }

    #[test]
    fn test_unsupported_width_rolls_back() {
        let (sim, runtime) = sim();
        let err = MirroredTexture::<u64>::new(runtime, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BindingFailure);
        assert_eq!(sim.live_device_allocations(), 0);
        assert_eq!(sim.live_host_allocations(), 0);
    }

    #[test]
    fn test_reallocate_rebinds() {
        let (sim, runtime) = sim();
        let mut texture = MirroredTexture::<u8>::new(runtime, 16).unwrap();
        let first = texture.handle().unwrap();
        texture.release().unwrap();
        assert!(texture.resource_desc().is_err());

        texture.allocate().unwrap();
        let second = texture.handle().unwrap();
        assert_ne!(first, second);
        assert_eq!(sim.live_textures(), 1);
        assert_eq!(sim.texture_fetch::<u8>(second, 0).unwrap(), 0);
    }

    #[test]
    fn test_rebind_replaces_handle() {
        let (sim, runtime) = sim();
        let mut texture = MirroredTexture::<u32>::new(runtime, 4).unwrap();
        texture.bind().unwrap();
        texture.bind().unwrap();
        assert_eq!(sim.live_textures(), 1);
        texture.unbind().unwrap();
        assert_eq!(sim.live_textures(), 0);
        assert!(texture.buffer().is_allocated());
    }

    #[test]
    fn test_host_edits_keep_binding_intact() {
        let (sim, runtime) = sim();
        let mut texture = MirroredTexture::<u16>::new(runtime, 4).unwrap();
        let handle = texture.handle().unwrap();

        texture.host_mut().unwrap().fill(9);
        texture.push(Transfer::Sync).unwrap();
        texture.host_mut().unwrap().fill(0);
        texture.pop(Transfer::Async).unwrap();
        assert!(texture.host().is_err());
        texture.synchronize().unwrap();

        assert_eq!(texture.to_vec().unwrap(), vec![9; 4]);
        assert_eq!(texture.handle(), Some(handle));
        assert!(texture.buffer().is_allocated());
        assert_eq!(sim.live_textures(), 1);
        assert_eq!(sim.live_device_allocations(), 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (sim, runtime) = sim();
        drop(MirroredTexture::<i32>::new(runtime, 32).unwrap());
        assert_eq!(sim.live_textures(), 0);
        assert_eq!(sim.live_device_allocations(), 0);
    }
}
