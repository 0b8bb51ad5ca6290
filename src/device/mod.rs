//! The narrow capability interface the orchestration layer needs from a compute device.
//!
//! Implementations own the actual driver objects; the rest of the crate only
//! stores the opaque [`Device::Handle`]s they hand out and asks the device to
//! bind, dispatch, fence and transfer.

use std::fmt::Debug;

use derive_more::Display;
use thiserror::Error;

use crate::{
    config::{QueueType, SyncStage},
    dispatch::DispatchDimensions,
    texture::{TextureDescriptor, TextureRegion},
};

pub use cpu::{Cpu, CpuBuilder, Invocation};
pub use gpu::{Gpu, GpuBuilder};

pub mod cpu;
pub mod gpu;

/// Index of a kernel known to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("#{_0}")]
pub struct KernelId(pub u32);

/// Usage of a structured buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferUsage {
    #[default]
    Structured,
    Append,
    Counter,
    Raw,
}

/// Range of a device resource to copy back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransferRange {
    #[display("bytes {offset}..{}", offset + len)]
    Bytes { offset: usize, len: usize },
    #[display("region {_0}")]
    Region(TextureRegion),
}

/// Options forwarded to the device with an asynchronous dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AsyncOptions {
    pub queue: QueueType,
    pub stage: SyncStage,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("kernel {0} does not exist")]
    Kernel(KernelId),
    #[error("kernel {0} has no slot named {1}")]
    Slot(KernelId, String),
    #[error("kernel {0} slot {1} is not bound")]
    Unbound(KernelId, String),
    #[error("handle {0} is not a live device resource")]
    Handle(String),
    #[error("failed to release {0}")]
    Release(String),
    #[error("write of {0} bytes does not fit into {1} bytes")]
    Overflow(usize, usize),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("device allocation failed: {0}")]
    Alloc(String),
    #[error("asynchronous dispatch is not supported")]
    Unsupported,
    #[error("failed to poll device")]
    Poll(#[from] wgpu::PollError),
}

/// A compute device as seen by the orchestration layer.
///
/// Every method takes `&self`; implementations keep their mutable state behind
/// their own locks so one device can be shared by several contexts.
pub trait Device: Send + Sync + 'static {
    /// Opaque handle to a device buffer or texture.
    type Handle: Debug + Clone + Send + Sync;
    /// Signals once previously submitted work has completed.
    type Fence: Send + Sync;
    /// An in-flight device-to-host copy.
    type Transfer: Send + Sync;

    /// Number of kernels the device can dispatch.
    fn kernel_count(&self) -> usize;
    /// Looks a kernel up by its entry point name.
    fn find_kernel(&self, name: &str) -> Option<KernelId>;
    /// Threads per group the kernel declares along x, y and z.
    fn thread_group_size(&self, kernel: KernelId) -> Result<[u32; 3], DeviceError>;
    /// Whether [`Device::dispatch_async`] is available.
    fn supports_async(&self) -> bool;

    fn allocate_buffer(
        &self,
        stride: usize,
        count: usize,
        usage: BufferUsage,
    ) -> Result<Self::Handle, DeviceError>;
    fn allocate_texture(&self, descriptor: &TextureDescriptor) -> Result<Self::Handle, DeviceError>;
    fn release(&self, handle: &Self::Handle) -> Result<(), DeviceError>;

    /// Uploads `contents` to the start of a buffer.
    fn write_buffer(&self, handle: &Self::Handle, contents: &[u8]) -> Result<(), DeviceError>;
    /// Reads a whole buffer back, blocking until the data is available.
    fn read_buffer(&self, handle: &Self::Handle) -> Result<Vec<u8>, DeviceError>;

    /// Binds a resource to the kernel slot of the same name.
    fn bind(&self, kernel: KernelId, slot: &str, handle: &Self::Handle) -> Result<(), DeviceError>;
    /// Fails if `slot` cannot hold a constant of `kernel`.
    fn check_constant(&self, kernel: KernelId, slot: &str) -> Result<(), DeviceError>;
    /// Sets the raw value of a kernel constant.
    fn set_constant(&self, kernel: KernelId, slot: &str, value: &[u8]) -> Result<(), DeviceError>;

    /// Dispatches a kernel and blocks until the device has finished it.
    fn dispatch(&self, kernel: KernelId, groups: DispatchDimensions) -> Result<(), DeviceError>;
    /// Submits a kernel and returns a fence that signals on completion.
    fn dispatch_async(
        &self,
        kernel: KernelId,
        groups: DispatchDimensions,
        options: AsyncOptions,
    ) -> Result<Self::Fence, DeviceError>;
    /// Non-blocking check of a fence. May make progress on pending device work.
    fn is_fence_signaled(&self, fence: &Self::Fence) -> bool;

    fn request_transfer(
        &self,
        handle: &Self::Handle,
        range: TransferRange,
    ) -> Result<Self::Transfer, DeviceError>;
    /// Non-blocking check of a transfer. May make progress on pending device work.
    fn is_transfer_done(&self, transfer: &Self::Transfer) -> bool;
    fn transfer_has_error(&self, transfer: &Self::Transfer) -> bool;
    /// Takes the bytes of a finished transfer and frees its staging memory.
    fn read_transfer_bytes(&self, transfer: Self::Transfer) -> Result<Vec<u8>, DeviceError>;
}
