//! Runtime trait and the handle/descriptor types crossing it

mod traits;
mod types;

pub use traits::AcceleratorRuntime;
pub use types::{
    BlockDim, ChannelFormat, ChannelFormatKind, ChannelId, DevicePtr, ExecutionContext, GridDim, HostPtr, ReadMode,
    ResourceDesc, TextureDesc, TextureHandle,
};
