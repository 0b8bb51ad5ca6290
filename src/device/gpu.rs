use std::{
    borrow::Cow,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{AsyncOptions, BufferUsage, Device, DeviceError, KernelId, TransferRange};
use crate::{
    dispatch::DispatchDimensions,
    texture::{FilterMode, TextureDescriptor, TextureDimension, TextureFormat, WrapMode},
};

/// A device buffer or texture.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuHandle {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture, TextureDescriptor),
}

impl std::fmt::Display for GpuHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuHandle::Buffer(buffer) => write!(f, "buffer of {} bytes", buffer.size()),
            GpuHandle::Texture(_, texture) => write!(
                f,
                "texture {}×{}×{} {}",
                texture.width, texture.height, texture.depth, texture.format
            ),
        }
    }
}

/// A binding slot reflected from the kernel's shader.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub binding: u32,
    pub ty: wgpu::BindingType,
}

/// What the kernel's entry point declares, as read from its shader module.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub threads: [u32; 3],
    /// Slots of bind group 0, ordered by binding index.
    pub slots: Vec<Slot>,
}

#[derive(Debug)]
struct GpuKernel {
    name: String,
    threads: [u32; 3],
    slots: HashMap<String, Slot>,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

#[derive(Debug, Clone)]
enum Bound {
    Resource(GpuHandle),
    Sampler(wgpu::Sampler),
    Constant(Vec<u8>),
}

#[derive(Debug)]
pub struct GpuFence {
    done: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Bytes { skip: usize, len: usize },
    Rows { padded: usize, row: usize, rows: usize },
}

#[derive(Debug)]
pub struct GpuTransfer {
    staging: wgpu::Buffer,
    layout: Layout,
    status: Arc<OnceLock<bool>>,
}

#[derive(Debug, Clone)]
pub struct Gpu {
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Kernels the device is able to dispatch.
    kernels: Arc<Vec<GpuKernel>>,
    /// Resources bound to each kernel, keyed by binding index.
    bindings: Arc<Mutex<HashMap<KernelId, HashMap<u32, Bound>>>>,
    async_support: bool,
}

const fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
    }
}

const fn address_mode(wrap: WrapMode) -> wgpu::AddressMode {
    match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
        WrapMode::Mirror => wgpu::AddressMode::MirrorRepeat,
    }
}

fn extent(width: u32, height: u32, depth: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: depth,
    }
}

impl Gpu {
    fn kernel(&self, kernel: KernelId) -> Result<&GpuKernel, DeviceError> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or(DeviceError::Kernel(kernel))
    }

    /// Binding index of the uniform buffer slot that backs a constant.
    fn uniform_binding(&self, kernel: KernelId, slot: &str) -> Result<u32, DeviceError> {
        let GpuKernel { slots, .. } = self.kernel(kernel)?;
        match slots.get(slot) {
            Some(Slot {
                binding,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    ..
                },
                ..
            }) => Ok(*binding),
            _ => Err(DeviceError::Slot(kernel, slot.into())),
        }
    }

    /// Runs `f` inside error scopes and reports any validation or allocation error it raised.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let output = f();
        let memory = futures::executor::block_on(self.device.pop_error_scope());
        let validation = futures::executor::block_on(self.device.pop_error_scope());
        match memory.or(validation) {
            Some(err) => Err(DeviceError::Alloc(err.to_string())),
            None => Ok(output),
        }
    }

    fn sampler(&self, texture: &TextureDescriptor) -> wgpu::Sampler {
        let address_mode = address_mode(texture.wrap);
        let (filter, mipmap_filter) = match texture.filter {
            FilterMode::Point => (wgpu::FilterMode::Nearest, wgpu::FilterMode::Nearest),
            FilterMode::Bilinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Nearest),
            FilterMode::Trilinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear),
        };
        // anisotropy requires every filter to be linear
        let anisotropy_clamp = match texture.filter {
            FilterMode::Trilinear => texture.anisotropy.clamp(1, 16),
            _ => 1,
        };
        self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter,
            anisotropy_clamp,
            ..Default::default()
        })
    }

    fn encode(
        &self,
        kernel: KernelId,
        groups: DispatchDimensions,
    ) -> Result<wgpu::CommandBuffer, DeviceError> {
        enum Resolved {
            Buffer(wgpu::Buffer),
            View(wgpu::TextureView),
            Sampler(wgpu::Sampler),
        }

        let GpuKernel {
            slots,
            layout,
            pipeline,
            name,
            ..
        } = self.kernel(kernel)?;

        let resolved = {
            let bindings = self.bindings.lock().expect("failed to lock");
            let bound = bindings.get(&kernel);
            slots
                .values()
                .sorted_by_key(|slot| slot.binding)
                .map(|slot| {
                    let resource = bound
                        .and_then(|x| x.get(&slot.binding))
                        .ok_or_else(|| DeviceError::Unbound(kernel, slot.name.clone()))?;
                    let resource = match resource {
                        Bound::Resource(GpuHandle::Buffer(buffer)) => {
                            Resolved::Buffer(buffer.clone())
                        }
                        Bound::Resource(GpuHandle::Texture(texture, _)) => {
                            Resolved::View(texture.create_view(&Default::default()))
                        }
                        Bound::Sampler(sampler) => Resolved::Sampler(sampler.clone()),
                        Bound::Constant(value) => {
                            // uniform blocks are sized in multiples of 16 bytes
                            let mut contents = value.clone();
                            contents.resize(value.len().max(1).next_multiple_of(16), 0);
                            let descriptor = wgpu::util::BufferInitDescriptor {
                                label: Some(slot.name.as_str()),
                                contents: &contents,
                                usage: wgpu::BufferUsages::UNIFORM,
                            };
                            let buffer = self.device.create_buffer_init(&descriptor);
                            Resolved::Buffer(buffer)
                        }
                    };
                    Ok::<_, DeviceError>((slot.binding, resource))
                })
                .collect::<Result<Vec<_>, DeviceError>>()?
        };

        let entries = resolved
            .iter()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: match resource {
                    Resolved::Buffer(buffer) => buffer.as_entire_binding(),
                    Resolved::View(view) => wgpu::BindingResource::TextureView(view),
                    Resolved::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                },
            })
            .collect_vec();
        let binding = self.scoped(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(name.as_str()),
                layout,
                entries: &entries,
            })
        })?;

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &binding, &[]);
            pass.dispatch_workgroups(groups.x(), groups.y(), groups.z());
        }
        Ok(encoder.finish())
    }

    fn submit_transfer(
        &self,
        encoder: wgpu::CommandEncoder,
        staging: wgpu::Buffer,
        layout: Layout,
    ) -> GpuTransfer {
        self.queue.submit(Some(encoder.finish()));
        let status = Arc::new(OnceLock::new());
        let sender = status.clone();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            _ = sender.set(result.is_ok());
        });
        GpuTransfer {
            staging,
            layout,
            status,
        }
    }
}

impl Device for Gpu {
    type Handle = GpuHandle;
    type Fence = GpuFence;
    type Transfer = GpuTransfer;

    fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    fn find_kernel(&self, name: &str) -> Option<KernelId> {
        self.kernels
            .iter()
            .position(|kernel| kernel.name == name)
            .map(|index| KernelId(index as u32))
    }

    fn thread_group_size(&self, kernel: KernelId) -> Result<[u32; 3], DeviceError> {
        Ok(self.kernel(kernel)?.threads)
    }

    fn supports_async(&self) -> bool {
        self.async_support
    }

    fn allocate_buffer(
        &self,
        stride: usize,
        count: usize,
        usage: BufferUsage,
    ) -> Result<Self::Handle, DeviceError> {
        let size = stride
            .checked_mul(count)
            .ok_or_else(|| DeviceError::Alloc(format!("{count} × {stride} bytes")))?;
        let size = (size.max(4) as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if !matches!(usage, BufferUsage::Structured | BufferUsage::Raw) {
            log::debug!("{usage} buffer is backed by a plain storage buffer");
        }
        let buffer = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        })?;
        Ok(GpuHandle::Buffer(buffer))
    }

    fn allocate_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<Self::Handle, DeviceError> {
        let dimension = match descriptor.dimension {
            TextureDimension::D3 => wgpu::TextureDimension::D3,
            TextureDimension::D2 | TextureDimension::D2Array => wgpu::TextureDimension::D2,
        };
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        if descriptor.random_write {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if descriptor.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let texture = self.scoped(|| {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: extent(descriptor.width, descriptor.height, descriptor.depth),
                mip_level_count: descriptor.mip_count,
                sample_count: 1,
                dimension,
                format: texture_format(descriptor.format),
                usage,
                view_formats: &[],
            })
        })?;
        Ok(GpuHandle::Texture(texture, *descriptor))
    }

    fn release(&self, handle: &Self::Handle) -> Result<(), DeviceError> {
        self.bindings
            .lock()
            .expect("failed to lock")
            .values_mut()
            .for_each(|bindings| {
                bindings.retain(|_, bound| !matches!(bound, Bound::Resource(x) if x == handle))
            });
        match handle {
            GpuHandle::Buffer(buffer) => buffer.destroy(),
            GpuHandle::Texture(texture, _) => texture.destroy(),
        }
        Ok(())
    }

    fn write_buffer(&self, handle: &Self::Handle, contents: &[u8]) -> Result<(), DeviceError> {
        match handle {
            GpuHandle::Buffer(buffer) => {
                if contents.len() as u64 > buffer.size() {
                    return Err(DeviceError::Overflow(contents.len(), buffer.size() as usize));
                }
                let len = (contents.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
                match len as usize == contents.len() {
                    true => self.queue.write_buffer(buffer, 0, contents),
                    false => {
                        let mut padded = contents.to_vec();
                        padded.resize(len as usize, 0);
                        self.queue.write_buffer(buffer, 0, &padded);
                    }
                }
            }
            GpuHandle::Texture(texture, descriptor) => {
                let size = descriptor.pixel_bytes();
                if contents.len() != size {
                    return Err(DeviceError::Overflow(contents.len(), size));
                }
                let bytes_per_row = descriptor.width * descriptor.format.bytes_per_pixel() as u32;
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    contents,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(descriptor.height),
                    },
                    extent(descriptor.width, descriptor.height, descriptor.depth),
                );
            }
        }
        Ok(())
    }

    fn read_buffer(&self, handle: &Self::Handle) -> Result<Vec<u8>, DeviceError> {
        let len = match handle {
            GpuHandle::Buffer(buffer) => buffer.size() as usize,
            GpuHandle::Texture(..) => return Err(DeviceError::Handle(handle.to_string())),
        };
        let transfer = self.request_transfer(handle, TransferRange::Bytes { offset: 0, len })?;
        self.device.poll(wgpu::PollType::Wait)?;
        self.read_transfer_bytes(transfer)
    }

    fn bind(&self, kernel: KernelId, slot: &str, handle: &Self::Handle) -> Result<(), DeviceError> {
        let GpuKernel { slots, .. } = self.kernel(kernel)?;
        let binding = slots
            .get(slot)
            .ok_or_else(|| DeviceError::Slot(kernel, slot.into()))?
            .binding;

        let mut bindings = self.bindings.lock().expect("failed to lock");
        let bindings = bindings.entry(kernel).or_default();
        bindings.insert(binding, Bound::Resource(handle.clone()));

        // a texture brings its sampling state along to a `sampler_<name>` slot
        if let GpuHandle::Texture(_, texture) = handle {
            if let Some(sampler) = slots.get(&format!("sampler_{slot}")) {
                bindings.insert(sampler.binding, Bound::Sampler(self.sampler(texture)));
            }
        }
        Ok(())
    }

    fn check_constant(&self, kernel: KernelId, slot: &str) -> Result<(), DeviceError> {
        self.uniform_binding(kernel, slot).map(|_| ())
    }

    fn set_constant(&self, kernel: KernelId, slot: &str, value: &[u8]) -> Result<(), DeviceError> {
        let binding = self.uniform_binding(kernel, slot)?;
        self.bindings
            .lock()
            .expect("failed to lock")
            .entry(kernel)
            .or_default()
            .insert(binding, Bound::Constant(value.to_vec()));
        Ok(())
    }

    fn dispatch(&self, kernel: KernelId, groups: DispatchDimensions) -> Result<(), DeviceError> {
        let command = self.encode(kernel, groups)?;
        let index = self.queue.submit(Some(command));
        self.device.poll(wgpu::PollType::WaitForSubmissionIndex(index))?;
        Ok(())
    }

    fn dispatch_async(
        &self,
        kernel: KernelId,
        groups: DispatchDimensions,
        options: AsyncOptions,
    ) -> Result<Self::Fence, DeviceError> {
        if !self.async_support {
            return Err(DeviceError::Unsupported);
        }
        // wgpu exposes a single queue; queue type and stage only matter for logging
        log::debug!(
            "dispatch {kernel} on {} queue, waiting for {}",
            options.queue,
            options.stage
        );
        let command = self.encode(kernel, groups)?;
        self.queue.submit(Some(command));

        let done = Arc::new(AtomicBool::new(false));
        let signal = done.clone();
        self.queue
            .on_submitted_work_done(move || signal.store(true, Ordering::Release));
        Ok(GpuFence { done })
    }

    fn is_fence_signaled(&self, fence: &Self::Fence) -> bool {
        _ = self.device.poll(wgpu::PollType::Poll);
        fence.done.load(Ordering::Acquire)
    }

    fn request_transfer(
        &self,
        handle: &Self::Handle,
        range: TransferRange,
    ) -> Result<Self::Transfer, DeviceError> {
        let mut encoder = self.device.create_command_encoder(&Default::default());
        let (staging, layout) = match (handle, range) {
            (GpuHandle::Buffer(buffer), TransferRange::Bytes { offset, len }) => {
                let align = wgpu::COPY_BUFFER_ALIGNMENT;
                let begin = offset as u64 / align * align;
                let end = ((offset + len) as u64).next_multiple_of(align);
                if end > buffer.size() {
                    return Err(DeviceError::Transfer(format!(
                        "{range} out of {} bytes",
                        buffer.size()
                    )));
                }
                let size = (end - begin).max(align);
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: None,
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                if end > begin {
                    encoder.copy_buffer_to_buffer(buffer, begin, &staging, 0, end - begin);
                }
                let skip = (offset as u64 - begin) as usize;
                (staging, Layout::Bytes { skip, len })
            }
            (GpuHandle::Texture(texture, descriptor), TransferRange::Region(region)) => {
                if !descriptor.contains(&region) {
                    return Err(DeviceError::Transfer(format!("{range} out of texture")));
                }
                let row = region.width as usize * descriptor.format.bytes_per_pixel();
                let padded = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize);
                let rows = region.height as usize * region.depth as usize;
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: None,
                    size: (padded * rows).max(4) as u64,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_texture_to_buffer(
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: region.mip,
                        origin: wgpu::Origin3d {
                            x: region.x,
                            y: region.y,
                            z: region.z,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::TexelCopyBufferInfo {
                        buffer: &staging,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(padded as u32),
                            rows_per_image: Some(region.height),
                        },
                    },
                    extent(region.width, region.height, region.depth),
                );
                (staging, Layout::Rows { padded, row, rows })
            }
            _ => {
                return Err(DeviceError::Transfer(format!(
                    "{range} does not apply to {handle}"
                )));
            }
        };
        Ok(self.submit_transfer(encoder, staging, layout))
    }

    fn is_transfer_done(&self, transfer: &Self::Transfer) -> bool {
        _ = self.device.poll(wgpu::PollType::Poll);
        transfer.status.get().is_some()
    }

    fn transfer_has_error(&self, transfer: &Self::Transfer) -> bool {
        matches!(transfer.status.get(), Some(false))
    }

    fn read_transfer_bytes(&self, transfer: Self::Transfer) -> Result<Vec<u8>, DeviceError> {
        let GpuTransfer {
            staging,
            layout,
            status,
        } = transfer;
        if status.get() != Some(&true) {
            staging.destroy();
            return Err(DeviceError::Transfer("staging buffer failed to map".into()));
        }
        let bytes = {
            let view = staging.slice(..).get_mapped_range();
            match layout {
                Layout::Bytes { skip, len } => view[skip..skip + len].to_vec(),
                Layout::Rows { padded, row, rows } => view
                    .chunks(padded)
                    .take(rows)
                    .flat_map(|x| x[..row].iter().copied())
                    .collect(),
            }
        };
        staging.unmap();
        staging.destroy();
        Ok(bytes)
    }
}

fn view_dimension(dim: naga::ImageDimension, arrayed: bool) -> wgpu::TextureViewDimension {
    match (dim, arrayed) {
        (naga::ImageDimension::D1, _) => wgpu::TextureViewDimension::D1,
        (naga::ImageDimension::D2, false) => wgpu::TextureViewDimension::D2,
        (naga::ImageDimension::D2, true) => wgpu::TextureViewDimension::D2Array,
        (naga::ImageDimension::D3, _) => wgpu::TextureViewDimension::D3,
        (naga::ImageDimension::Cube, false) => wgpu::TextureViewDimension::Cube,
        (naga::ImageDimension::Cube, true) => wgpu::TextureViewDimension::CubeArray,
    }
}

fn storage_format(format: naga::StorageFormat) -> Option<wgpu::TextureFormat> {
    use naga::StorageFormat as F;
    let format = match format {
        F::R8Unorm => wgpu::TextureFormat::R8Unorm,
        F::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        F::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        F::R16Float => wgpu::TextureFormat::R16Float,
        F::Rg16Float => wgpu::TextureFormat::Rg16Float,
        F::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        F::R32Float => wgpu::TextureFormat::R32Float,
        F::Rg32Float => wgpu::TextureFormat::Rg32Float,
        F::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        F::R32Uint => wgpu::TextureFormat::R32Uint,
        F::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
        _ => return None,
    };
    Some(format)
}

fn binding_type(
    module: &naga::Module,
    variable: &naga::GlobalVariable,
) -> Result<wgpu::BindingType, GpuBuildError> {
    let name = variable.name.clone().unwrap_or_default();
    let unsupported = || GpuBuildError::Reflect(name.clone());
    let ty = match variable.space {
        naga::AddressSpace::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        naga::AddressSpace::Storage { access } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: !access.contains(naga::StorageAccess::STORE),
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        naga::AddressSpace::Handle => match &module.types[variable.ty].inner {
            naga::TypeInner::Sampler { comparison } => {
                wgpu::BindingType::Sampler(match *comparison {
                    true => wgpu::SamplerBindingType::Comparison,
                    false => wgpu::SamplerBindingType::Filtering,
                })
            }
            naga::TypeInner::Image {
                dim,
                arrayed,
                class,
            } => {
                let view_dimension = view_dimension(*dim, *arrayed);
                match class {
                    naga::ImageClass::Sampled { kind, multi } => wgpu::BindingType::Texture {
                        sample_type: match kind {
                            naga::ScalarKind::Sint => wgpu::TextureSampleType::Sint,
                            naga::ScalarKind::Uint => wgpu::TextureSampleType::Uint,
                            _ => wgpu::TextureSampleType::Float { filterable: true },
                        },
                        view_dimension,
                        multisampled: *multi,
                    },
                    naga::ImageClass::Depth { multi } => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension,
                        multisampled: *multi,
                    },
                    naga::ImageClass::Storage { format, access } => {
                        let load = access.contains(naga::StorageAccess::LOAD);
                        let store = access.contains(naga::StorageAccess::STORE);
                        wgpu::BindingType::StorageTexture {
                            access: match (load, store) {
                                (true, true) => wgpu::StorageTextureAccess::ReadWrite,
                                (false, true) => wgpu::StorageTextureAccess::WriteOnly,
                                _ => wgpu::StorageTextureAccess::ReadOnly,
                            },
                            format: storage_format(*format).ok_or_else(unsupported)?,
                            view_dimension,
                        }
                    }
                    #[allow(unreachable_patterns)]
                    _ => return Err(unsupported()),
                }
            }
            _ => return Err(unsupported()),
        },
        _ => return Err(unsupported()),
    };
    Ok(ty)
}

/// Reads the workgroup size and the bind group 0 slots of an entry point.
pub fn reflect(module: &naga::Module, entry_point: &str) -> Result<Reflection, GpuBuildError> {
    let entry = module
        .entry_points
        .iter()
        .find(|x| x.name == entry_point && x.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| GpuBuildError::EntryPoint(entry_point.into()))?;

    let mut slots = vec![];
    for (_, variable) in module.global_variables.iter() {
        let (Some(name), Some(binding)) = (&variable.name, &variable.binding) else {
            continue;
        };
        if binding.group != 0 {
            log::warn!("slot {name} of group {} is ignored", binding.group);
            continue;
        }
        let ty = binding_type(module, variable)?;
        slots.push(Slot {
            name: name.clone(),
            binding: binding.binding,
            ty,
        });
    }
    slots.sort_by_key(|slot| slot.binding);

    let threads = entry.workgroup_size.map(|x| x.max(1));
    Ok(Reflection { threads, slots })
}

/// WGSL source of one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub source: String,
    pub entry_point: String,
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    pub kernels: Vec<KernelSource>,
    pub async_support: bool,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
    #[error("failed to parse kernel source: {0}")]
    Parse(String),
    #[error("compute entry point {0} not found")]
    EntryPoint(String),
    #[error("slot {0} has an unsupported binding type")]
    Reflect(String),
    #[error("failed to create kernel: {0}")]
    Create(String),
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        Self {
            adapter,
            features: wgpu::Features::empty(),
            limits: Default::default(),
            kernels: Vec::new(),
            async_support: true,
        }
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
            kernels,
            async_support,
        } = self;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let kernels = kernels
            .into_iter()
            .map(|kernel| create_kernel(&device, kernel))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Gpu {
            device,
            queue,
            kernels: Arc::new(kernels),
            bindings: Default::default(),
            async_support,
        })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }

    pub fn async_support(mut self, async_support: bool) -> Self {
        self.async_support = async_support;
        self
    }

    /// Adds a kernel from WGSL `source`. Kernels are indexed in the order they are added.
    pub fn add_kernel(mut self, source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        self.kernels.push(KernelSource {
            source: source.into(),
            entry_point: entry_point.into(),
        });
        self
    }
}

fn create_kernel(device: &wgpu::Device, kernel: KernelSource) -> Result<GpuKernel, GpuBuildError> {
    let KernelSource {
        source,
        entry_point,
    } = kernel;
    let module = naga::front::wgsl::parse_str(&source)
        .map_err(|err| GpuBuildError::Parse(err.emit_to_string(&source)))?;
    let Reflection { threads, slots } = reflect(&module, &entry_point)?;

    let entries = slots
        .iter()
        .map(|slot| wgpu::BindGroupLayoutEntry {
            binding: slot.binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: slot.ty,
            count: None,
        })
        .collect_vec();

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(entry_point.as_str()),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry_point.as_str()),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(entry_point.as_str()),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point.as_str()),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some(entry_point.as_str()),
        compilation_options: Default::default(),
        cache: None,
    });
    if let Some(err) = futures::executor::block_on(device.pop_error_scope()) {
        return Err(GpuBuildError::Create(err.to_string()));
    }

    let slots = slots
        .into_iter()
        .map(|slot| (slot.name.clone(), slot))
        .collect();
    Ok(GpuKernel {
        name: entry_point,
        threads,
        slots,
        layout,
        pipeline,
    })
}
