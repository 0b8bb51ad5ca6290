//! Asynchronous copies of device resources back into host memory.
//!
//! A request is validated and issued at once, so its data is a snapshot of
//! the resource at that moment; several requests on the same resource may be
//! in flight together. The request is consumed by waiting on it exactly once.

use std::{sync::Arc, time::Duration};

use derive_more::Display;
use thiserror::Error;

use crate::{
    context::ComputeContext,
    device::{Device, DeviceError, TransferRange},
    num::Element,
    platform,
    registry::ScopeKind,
    texture::{TextureData, TextureFormat, TextureRegion},
};

#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("resource {0} not found")]
    NotFound(String),
    #[error("resource {name} does not hold {expected}")]
    Mismatch { name: String, expected: String },
    #[error("{range} is out of bounds of {name}")]
    OutOfBounds { name: String, range: String },
    #[error("readback of {name} holds {found} bytes, destination takes {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("readback of {0} failed")]
    Failed(String, #[source] DeviceError),
    #[error("readback of {0} did not finish in time")]
    TimedOut(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Shape of the data a readback delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Extent {
    #[display("{len} × {stride} bytes")]
    Bytes { stride: usize, len: usize },
    #[display("{width}×{height}×{depth} {format}")]
    Region {
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
    },
}

impl Extent {
    /// Total bytes of the data.
    pub const fn size(&self) -> usize {
        match *self {
            Extent::Bytes { stride, len } => stride * len,
            Extent::Region {
                width,
                height,
                depth,
                format,
            } => width as usize * height as usize * depth as usize * format.bytes_per_pixel(),
        }
    }
}

/// An issued, not yet completed, device-to-host copy.
#[must_use = "a readback does nothing unless waited on"]
pub struct ReadbackRequest<D: Device> {
    device: Arc<D>,
    name: String,
    extent: Extent,
    transfer: D::Transfer,
    timeout: Option<Duration>,
}

impl<D: Device> std::fmt::Debug for ReadbackRequest<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackRequest")
            .field("name", &self.name)
            .field("extent", &self.extent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<D: Device> ReadbackRequest<D> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Non-blocking check. Makes progress on the transfer.
    pub fn is_done(&self) -> bool {
        self.device.is_transfer_done(&self.transfer)
    }

    /// Waits for the copy, yielding to the executor between checks.
    pub async fn wait(self) -> Result<Readback, ReadbackError> {
        let Self {
            device,
            name,
            extent,
            transfer,
            timeout,
        } = self;

        let done = platform::poll_until(|| device.is_transfer_done(&transfer));
        if platform::deadline(timeout, done).await.is_none() {
            log::error!("readback of {name} timed out");
            return Err(ReadbackError::TimedOut(name));
        }
        if device.transfer_has_error(&transfer) {
            log::error!("readback of {name} failed: device reported an error");
            drop(transfer);
            let err = DeviceError::Transfer("device reported an error".into());
            return Err(ReadbackError::Failed(name, err));
        }
        let bytes = match device.read_transfer_bytes(transfer) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("readback of {name} failed: {err}");
                return Err(ReadbackError::Failed(name, err));
            }
        };
        if bytes.len() != extent.size() {
            log::error!("readback of {name} delivered {} bytes, not {extent}", bytes.len());
            return Err(ReadbackError::ShapeMismatch {
                name,
                expected: extent.size(),
                found: bytes.len(),
            });
        }

        log::debug!("readback of {name} finished: {extent}");
        Ok(Readback {
            name,
            extent,
            bytes,
        })
    }

    /// Waits for the copy and hands it to `callback`. The callback is not invoked on failure.
    pub async fn complete_with<F>(self, callback: F) -> Result<(), ReadbackError>
    where
        F: FnOnce(&str, Readback),
    {
        let readback = self.wait().await?;
        let name = readback.name.clone();
        callback(&name, readback);
        Ok(())
    }

    /// Waits for the copy on a separate task.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<Readback, ReadbackError>> {
        platform::spawn(self.wait())
    }
}

/// Bytes of a finished readback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readback {
    name: String,
    extent: Extent,
    bytes: Vec<u8>,
}

impl Readback {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn mismatch(&self, expected: usize) -> ReadbackError {
        log::warn!(
            "readback of {} holds {} bytes, destination takes {expected}",
            self.name,
            self.bytes.len()
        );
        ReadbackError::ShapeMismatch {
            name: self.name.clone(),
            expected,
            found: self.bytes.len(),
        }
    }

    /// Fills `output` element by element. Its byte size must equal the readback's.
    pub fn copy_to_slice<T: Element>(&self, output: &mut [T]) -> Result<(), ReadbackError> {
        let size = size_of_val(output);
        if size != self.bytes.len() {
            return Err(self.mismatch(size));
        }
        if size == 0 {
            return Ok(());
        }
        output
            .iter_mut()
            .zip(self.bytes.chunks_exact(size_of::<T>()))
            .for_each(|(x, bytes)| *x = bytemuck::pod_read_unaligned(bytes));
        Ok(())
    }

    /// Collects the data as elements of `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ReadbackError> {
        let stride = size_of::<T>();
        if stride == 0 || self.bytes.len() % stride != 0 {
            let expected = self.bytes.len().next_multiple_of(stride.max(1));
            return Err(self.mismatch(expected));
        }
        Ok(self
            .bytes
            .chunks_exact(stride)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Blits the raw pixel bytes into `texture`, which must have the readback's shape.
    pub fn copy_to_texture(&self, texture: &mut TextureData) -> Result<(), ReadbackError> {
        let shape = Extent::Region {
            width: texture.width,
            height: texture.height,
            depth: texture.depth,
            format: texture.format,
        };
        let same = match self.extent {
            Extent::Region { .. } => self.extent == shape,
            Extent::Bytes { .. } => true,
        };
        if !same || texture.bytes.len() != self.bytes.len() {
            return Err(self.mismatch(texture.bytes.len()));
        }
        texture.bytes.copy_from_slice(&self.bytes);
        Ok(())
    }
}

impl<D: Device> ComputeContext<D> {
    /// Issues a copy of `len` elements from element `start` of a buffer.
    ///
    /// `start` defaults to the first element and `len` to the rest of the buffer. The range
    /// is checked before anything is sent to the device.
    pub fn request_buffer_readback(
        &self,
        kind: ScopeKind,
        name: &str,
        len: Option<usize>,
        start: Option<usize>,
    ) -> Result<ReadbackRequest<D>, ReadbackError> {
        let scope = self.scope(kind);
        let handle = scope.find(name).ok_or_else(|| {
            log::warn!("[{kind}] readback of missing resource {name}");
            ReadbackError::NotFound(name.into())
        })?;
        let (Some(r#type), Some(count)) = (handle.element_type(), handle.count()) else {
            log::warn!("[{kind}] buffer readback of texture {name}");
            return Err(ReadbackError::Mismatch {
                name: name.into(),
                expected: "a buffer".into(),
            });
        };

        let start = start.unwrap_or(0);
        let len = len.unwrap_or(count.saturating_sub(start));
        if start.checked_add(len).is_none_or(|end| end > count) {
            log::warn!("[{kind}] readback of {name}: {len} elements at {start} out of {count}");
            return Err(ReadbackError::OutOfBounds {
                name: name.into(),
                range: format!("elements {start}..{}", start.saturating_add(len)),
            });
        }

        let stride = r#type.stride();
        let range = TransferRange::Bytes {
            offset: start * stride,
            len: len * stride,
        };
        let transfer = self
            .device()
            .request_transfer(&handle.data, range)
            .inspect_err(|err| log::error!("[{kind}] readback of {name} failed: {err}"))?;

        Ok(ReadbackRequest {
            device: self.device().clone(),
            name: name.into(),
            extent: Extent::Bytes { stride, len },
            transfer,
            timeout: self.config().timeout,
        })
    }

    /// Issues a copy of a box of one texture mip level.
    ///
    /// The box must start inside, and fit within, the extent of that level.
    pub fn request_texture_readback(
        &self,
        kind: ScopeKind,
        name: &str,
        region: TextureRegion,
    ) -> Result<ReadbackRequest<D>, ReadbackError> {
        let scope = self.scope(kind);
        let handle = scope.find(name).ok_or_else(|| {
            log::warn!("[{kind}] readback of missing resource {name}");
            ReadbackError::NotFound(name.into())
        })?;
        let Some(texture) = handle.texture() else {
            log::warn!("[{kind}] texture readback of buffer {name}");
            return Err(ReadbackError::Mismatch {
                name: name.into(),
                expected: "a texture".into(),
            });
        };
        if !texture.contains(&region) {
            log::warn!("[{kind}] readback of {name}: {region} out of texture");
            return Err(ReadbackError::OutOfBounds {
                name: name.into(),
                range: region.to_string(),
            });
        }

        let transfer = self
            .device()
            .request_transfer(&handle.data, TransferRange::Region(region))
            .inspect_err(|err| log::error!("[{kind}] readback of {name} failed: {err}"))?;

        Ok(ReadbackRequest {
            device: self.device().clone(),
            name: name.into(),
            extent: Extent::Region {
                width: region.width,
                height: region.height,
                depth: region.depth,
                format: texture.format,
            },
            transfer,
            timeout: self.config().timeout,
        })
    }

    /// Reads a whole buffer of `T` back without blocking the executor.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn read_buffer_async<T: Element>(
        &self,
        kind: ScopeKind,
        name: &str,
    ) -> Result<Vec<T>, ReadbackError> {
        let matches = self
            .scope(kind)
            .find(name)
            .and_then(|handle| handle.element_type())
            .map(|x| x.is::<T>());
        if matches == Some(false) {
            return Err(ReadbackError::Mismatch {
                name: name.into(),
                expected: T::element_type().to_string(),
            });
        }
        let request = self.request_buffer_readback(kind, name, None, None)?;
        request.wait().await?.to_vec()
    }

    /// Reads a texture region back, or the whole base level if `region` is `None`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn read_texture_async(
        &self,
        kind: ScopeKind,
        name: &str,
        region: Option<TextureRegion>,
    ) -> Result<TextureData, ReadbackError> {
        let region = match region {
            Some(region) => region,
            None => self
                .scope(kind)
                .find(name)
                .and_then(|handle| handle.texture().map(TextureRegion::full))
                .unwrap_or_default(),
        };
        let request = self.request_texture_readback(kind, name, region)?;
        let Extent::Region { format, .. } = request.extent() else {
            return Err(ReadbackError::Mismatch {
                name: name.into(),
                expected: "a texture".into(),
            });
        };
        let readback = request.wait().await?;
        let mut data = TextureData::new(region.width, region.height, region.depth, format);
        readback.copy_to_texture(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc, time::Duration};

    use super::{Extent, ReadbackError};
    use crate::{
        config::ContextConfig,
        context::ComputeContext,
        device::{
            AsyncOptions, BufferUsage, Cpu, CpuBuilder, Device, DeviceError, KernelId,
            TransferRange,
        },
        dispatch::DispatchDimensions,
        registry::{BufferDescriptor, ScopeKind},
        texture::{TextureData, TextureDescriptor, TextureFormat, TextureRegion},
    };

    fn context(cpu: &Cpu) -> ComputeContext<Cpu> {
        ComputeContext::new(Arc::new(cpu.clone()))
    }

    #[tokio::test]
    async fn test_buffer_readback() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().transfer_latency(3).build();
        let context = context(&cpu);
        let data: Vec<f32> = (0..256).map(|_| fastrand::f32()).collect();
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<f32>("data", 256))?;
        context.set_buffer_data(ScopeKind::Local, "data", &data)?;

        let request = context.request_buffer_readback(ScopeKind::Local, "data", Some(16), Some(8))?;
        assert_eq!(request.extent(), Extent::Bytes { stride: 4, len: 16 });
        let readback = request.wait().await?;
        assert_eq!(readback.to_vec::<f32>()?, data[8..24]);

        let mut output = [0.0f32; 16];
        readback.copy_to_slice(&mut output)?;
        assert_eq!(output, data[8..24]);

        let output: Vec<f32> = context.read_buffer_async(ScopeKind::Local, "data").await?;
        assert_eq!(output, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_bounds() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let context = context(&cpu);
        let texture = TextureDescriptor::new(256, 256, TextureFormat::R32Float).mip_count(2);
        context.register_texture(ScopeKind::Local, "image", texture, &[])?;
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<u32>("data", 256))?;

        let region = TextureRegion {
            x: 250,
            width: 300,
            height: 1,
            depth: 1,
            ..Default::default()
        };
        let result = context.request_texture_readback(ScopeKind::Local, "image", region);
        assert!(matches!(result, Err(ReadbackError::OutOfBounds { .. })));

        // mip 1 is only 128 texels wide
        let region = TextureRegion {
            width: 256,
            height: 1,
            depth: 1,
            mip: 1,
            ..Default::default()
        };
        let result = context.request_texture_readback(ScopeKind::Local, "image", region);
        assert!(matches!(result, Err(ReadbackError::OutOfBounds { .. })));

        let result = context.request_buffer_readback(ScopeKind::Local, "data", Some(10), Some(250));
        assert!(matches!(result, Err(ReadbackError::OutOfBounds { .. })));
        let result =
            context.request_buffer_readback(ScopeKind::Local, "data", Some(usize::MAX), Some(1));
        assert!(matches!(result, Err(ReadbackError::OutOfBounds { .. })));
        let result = context.request_buffer_readback(ScopeKind::Global, "data", None, None);
        assert!(matches!(result, Err(ReadbackError::NotFound(_))));
        let result = context.request_buffer_readback(ScopeKind::Local, "image", None, None);
        assert!(matches!(result, Err(ReadbackError::Mismatch { .. })));

        assert_eq!(cpu.stats().transfers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_transfer() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let context = context(&cpu);
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<f32>("data", 4))?;

        cpu.fail_transfers(true);
        let mut called = false;
        let request = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        let result = request.complete_with(|_, _| called = true).await;
        assert!(matches!(result, Err(ReadbackError::Failed(..))));
        assert!(!called);

        cpu.fail_transfers(false);
        let request = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        request
            .complete_with(|name, readback| {
                called = name == "data" && readback.bytes().len() == 16;
            })
            .await?;
        assert!(called);
        Ok(())
    }

    /// Delivers transfer bytes normally but flags every transfer as errored.
    struct Flagged(Cpu);

    impl Device for Flagged {
        type Handle = <Cpu as Device>::Handle;
        type Fence = <Cpu as Device>::Fence;
        type Transfer = <Cpu as Device>::Transfer;

        fn kernel_count(&self) -> usize {
            self.0.kernel_count()
        }

        fn find_kernel(&self, name: &str) -> Option<KernelId> {
            self.0.find_kernel(name)
        }

        fn thread_group_size(&self, kernel: KernelId) -> Result<[u32; 3], DeviceError> {
            self.0.thread_group_size(kernel)
        }

        fn supports_async(&self) -> bool {
            self.0.supports_async()
        }

        fn allocate_buffer(
            &self,
            stride: usize,
            count: usize,
            usage: BufferUsage,
        ) -> Result<Self::Handle, DeviceError> {
            self.0.allocate_buffer(stride, count, usage)
        }

        fn allocate_texture(
            &self,
            descriptor: &TextureDescriptor,
        ) -> Result<Self::Handle, DeviceError> {
            self.0.allocate_texture(descriptor)
        }

        fn release(&self, handle: &Self::Handle) -> Result<(), DeviceError> {
            self.0.release(handle)
        }

        fn write_buffer(&self, handle: &Self::Handle, contents: &[u8]) -> Result<(), DeviceError> {
            self.0.write_buffer(handle, contents)
        }

        fn read_buffer(&self, handle: &Self::Handle) -> Result<Vec<u8>, DeviceError> {
            self.0.read_buffer(handle)
        }

        fn bind(
            &self,
            kernel: KernelId,
            slot: &str,
            handle: &Self::Handle,
        ) -> Result<(), DeviceError> {
            self.0.bind(kernel, slot, handle)
        }

        fn check_constant(&self, kernel: KernelId, slot: &str) -> Result<(), DeviceError> {
            self.0.check_constant(kernel, slot)
        }

        fn set_constant(
            &self,
            kernel: KernelId,
            slot: &str,
            value: &[u8],
        ) -> Result<(), DeviceError> {
            self.0.set_constant(kernel, slot, value)
        }

        fn dispatch(
            &self,
            kernel: KernelId,
            groups: DispatchDimensions,
        ) -> Result<(), DeviceError> {
            self.0.dispatch(kernel, groups)
        }

        fn dispatch_async(
            &self,
            kernel: KernelId,
            groups: DispatchDimensions,
            options: AsyncOptions,
        ) -> Result<Self::Fence, DeviceError> {
            self.0.dispatch_async(kernel, groups, options)
        }

        fn is_fence_signaled(&self, fence: &Self::Fence) -> bool {
            self.0.is_fence_signaled(fence)
        }

        fn request_transfer(
            &self,
            handle: &Self::Handle,
            range: TransferRange,
        ) -> Result<Self::Transfer, DeviceError> {
            self.0.request_transfer(handle, range)
        }

        fn is_transfer_done(&self, transfer: &Self::Transfer) -> bool {
            self.0.is_transfer_done(transfer)
        }

        fn transfer_has_error(&self, _transfer: &Self::Transfer) -> bool {
            true
        }

        fn read_transfer_bytes(&self, transfer: Self::Transfer) -> Result<Vec<u8>, DeviceError> {
            self.0.read_transfer_bytes(transfer)
        }
    }

    #[tokio::test]
    async fn test_flagged_transfer() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().transfer_latency(2).build();
        let context = ComputeContext::new(Arc::new(Flagged(cpu.clone())));
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<u32>("data", 4))?;
        context.set_buffer_data(ScopeKind::Local, "data", &[1u32, 2, 3, 4])?;

        let mut called = false;
        let request = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        let result = request.complete_with(|_, _| called = true).await;
        assert!(matches!(
            result,
            Err(ReadbackError::Failed(_, DeviceError::Transfer(_)))
        ));
        assert!(!called);

        let request = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        assert!(matches!(request.wait().await, Err(ReadbackError::Failed(..))));
        Ok(())
    }

    #[tokio::test]
    async fn test_shape_mismatch() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let context = context(&cpu);
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<f32>("data", 16))?;
        let readback = context
            .request_buffer_readback(ScopeKind::Local, "data", None, None)?
            .wait()
            .await?;

        assert!(matches!(
            readback.to_vec::<[f32; 3]>(),
            Err(ReadbackError::ShapeMismatch { .. })
        ));

        let mut output = [7.0f32; 8];
        assert!(matches!(
            readback.copy_to_slice(&mut output),
            Err(ReadbackError::ShapeMismatch { .. })
        ));
        assert_eq!(output, [7.0; 8]);

        let mut texture = TextureData::new(2, 2, 1, TextureFormat::Rgba8Unorm);
        assert!(matches!(
            readback.copy_to_texture(&mut texture),
            Err(ReadbackError::ShapeMismatch { .. })
        ));
        assert!(texture.bytes.iter().all(|&x| x == 0));

        let result = context.read_buffer_async::<u32>(ScopeKind::Local, "data").await;
        assert!(matches!(result, Err(ReadbackError::Mismatch { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_texture_readback() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().transfer_latency(2).build();
        let context = context(&cpu);
        let texture = TextureDescriptor::new(4, 4, TextureFormat::R8Unorm);
        context.register_texture(ScopeKind::Global, "image", texture, &[])?;

        let mut data = TextureData::new(4, 4, 1, TextureFormat::R8Unorm);
        data.bytes = (0..16).collect();
        context.set_texture_data(ScopeKind::Global, "image", &data)?;

        let region = TextureRegion {
            x: 1,
            y: 1,
            width: 2,
            height: 2,
            depth: 1,
            ..Default::default()
        };
        let output = context
            .read_texture_async(ScopeKind::Global, "image", Some(region))
            .await?;
        assert_eq!((output.width, output.height), (2, 2));
        assert_eq!(output.bytes, vec![5, 6, 9, 10]);

        let output = context.read_texture_async(ScopeKind::Global, "image", None).await?;
        assert_eq!(output, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_overlapping() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().transfer_latency(4).build();
        let context = context(&cpu);
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<u32>("data", 4))?;

        context.set_buffer_data(ScopeKind::Local, "data", &[1u32, 2, 3, 4])?;
        let first = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        context.set_buffer_data(ScopeKind::Local, "data", &[5u32, 6, 7, 8])?;
        let second = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;

        let (first, second) = tokio::join!(first.wait(), second.spawn());
        assert_eq!(first?.to_vec::<u32>()?, [1, 2, 3, 4]);
        assert_eq!(second??.to_vec::<u32>()?, [5, 6, 7, 8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().transfer_latency(usize::MAX).build();
        let config = ContextConfig::default().timeout(Duration::from_millis(10));
        let context = ComputeContext::new(Arc::new(cpu)).with_config(config);
        context.register_buffer(ScopeKind::Local, BufferDescriptor::new::<u8>("data", 4))?;

        let request = context.request_buffer_readback(ScopeKind::Local, "data", None, None)?;
        assert!(!request.is_done());
        assert!(matches!(request.wait().await, Err(ReadbackError::TimedOut(_))));
        Ok(())
    }
}
