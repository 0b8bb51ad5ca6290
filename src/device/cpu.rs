//! A software device that runs kernels as host closures.
//!
//! Fences and transfers complete after a configurable number of polls so that
//! the cooperative waits of the orchestration layer can be exercised without a
//! GPU. Release and transfer failures can be injected.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use bytemuck::Pod;
use derive_more::{Deref, Display};
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use super::{AsyncOptions, BufferUsage, Device, DeviceError, KernelId, TransferRange};
use crate::{
    dispatch::DispatchDimensions,
    texture::{TextureDescriptor, TextureRegion},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deref)]
pub struct CpuHandle(uid::Id<CpuHandle>);

pub type KernelFn = Arc<dyn Fn(&mut Invocation<'_>) + Send + Sync>;

#[derive(Clone)]
pub struct CpuKernel {
    name: String,
    threads: [u32; 3],
    slots: Vec<String>,
    body: KernelFn,
}

impl std::fmt::Debug for CpuKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuKernel")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Resource {
    /// Mip levels, tightly packed. Buffers have exactly one.
    levels: Vec<Vec<u8>>,
    texture: Option<TextureDescriptor>,
}

/// Counters of device calls, for inspection in tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuStats {
    pub allocations: usize,
    pub releases: usize,
    pub dispatches: usize,
    pub async_dispatches: usize,
    pub transfers: usize,
}

#[derive(Debug, Default)]
struct State {
    resources: HashMap<CpuHandle, Resource>,
    bindings: HashMap<KernelId, HashMap<String, CpuHandle>>,
    constants: HashMap<KernelId, HashMap<String, Vec<u8>>>,
    /// Resources that refuse to be released.
    stuck: HashSet<CpuHandle>,
    fail_transfers: bool,
    hold_fences: bool,
    stats: CpuStats,
}

/// View of the bound resources handed to a kernel body.
pub struct Invocation<'a> {
    pub kernel: KernelId,
    pub groups: DispatchDimensions,
    pub threads: [u32; 3],
    resources: &'a mut HashMap<CpuHandle, Resource>,
    bindings: Option<&'a HashMap<String, CpuHandle>>,
    constants: Option<&'a HashMap<String, Vec<u8>>>,
}

impl Invocation<'_> {
    fn slot(&self, slot: &str) -> Option<CpuHandle> {
        self.bindings.and_then(|x| x.get(slot)).copied()
    }

    /// Reads the base level of the resource bound to `slot`.
    pub fn read<T: Pod>(&self, slot: &str) -> Option<Vec<T>> {
        let handle = self.slot(slot)?;
        let bytes = self.resources.get(&handle)?.levels.first()?;
        let len = bytes.len() / size_of::<T>().max(1);
        Some(bytemuck::pod_collect_to_vec(&bytes[..len * size_of::<T>()]))
    }

    /// Overwrites the head of the resource bound to `slot`. Returns `false` if nothing was written.
    pub fn write<T: Pod>(&mut self, slot: &str, data: &[T]) -> bool {
        let Some(handle) = self.slot(slot) else {
            return false;
        };
        let Some(bytes) = self
            .resources
            .get_mut(&handle)
            .and_then(|x| x.levels.first_mut())
        else {
            return false;
        };
        let data: &[u8] = bytemuck::cast_slice(data);
        if data.len() > bytes.len() {
            return false;
        }
        bytes[..data.len()].copy_from_slice(data);
        true
    }

    /// Value of a constant, if set and large enough for `T`.
    pub fn constant<T: Pod>(&self, slot: &str) -> Option<T> {
        let bytes = self.constants.and_then(|x| x.get(slot))?;
        let size = size_of::<T>();
        (bytes.len() >= size).then(|| bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Total number of threads launched along each axis.
    pub fn extent(&self) -> [u64; 3] {
        let groups = *self.groups;
        [0, 1, 2].map(|i| groups[i] as u64 * self.threads[i].max(1) as u64)
    }
}

#[derive(Debug)]
pub struct CpuFence {
    remaining: AtomicUsize,
}

#[derive(Debug)]
pub struct CpuTransfer {
    bytes: Vec<u8>,
    error: bool,
    remaining: AtomicUsize,
}

/// Counts one poll down. Returns `true` once nothing remains.
fn count_down(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| x.checked_sub(1))
        .is_err()
}

#[derive(Debug, Clone)]
pub struct Cpu {
    kernels: Arc<Vec<CpuKernel>>,
    state: Arc<RwLock<State>>,
    async_support: bool,
    fence_latency: usize,
    transfer_latency: usize,
}

impl Cpu {
    pub fn stats(&self) -> CpuStats {
        self.state.read().expect("failed to lock").stats
    }

    /// Number of resources currently allocated.
    pub fn live_count(&self) -> usize {
        self.state.read().expect("failed to lock").resources.len()
    }

    pub fn is_live(&self, handle: &CpuHandle) -> bool {
        self.state
            .read()
            .expect("failed to lock")
            .resources
            .contains_key(handle)
    }

    /// Makes every later release of `handle` fail.
    pub fn fail_release(&self, handle: &CpuHandle) {
        self.state.write().expect("failed to lock").stuck.insert(*handle);
    }

    /// Makes every later transfer report a device error.
    pub fn fail_transfers(&self, fail: bool) {
        self.state.write().expect("failed to lock").fail_transfers = fail;
    }

    /// While held, no fence signals.
    pub fn hold_fences(&self, hold: bool) {
        self.state.write().expect("failed to lock").hold_fences = hold;
    }

    /// Content of the base level of a resource.
    pub fn contents(&self, handle: &CpuHandle) -> Option<Vec<u8>> {
        let state = self.state.read().expect("failed to lock");
        state.resources.get(handle).and_then(|x| x.levels.first().cloned())
    }

    fn kernel(&self, kernel: KernelId) -> Result<&CpuKernel, DeviceError> {
        self.kernels
            .get(kernel.0 as usize)
            .ok_or(DeviceError::Kernel(kernel))
    }

    fn run(&self, kernel: KernelId, groups: DispatchDimensions) -> Result<(), DeviceError> {
        let CpuKernel {
            threads,
            slots,
            body,
            ..
        } = self.kernel(kernel)?;

        let mut state = self.state.write().expect("failed to lock");
        let State {
            resources,
            bindings,
            constants,
            ..
        } = &mut *state;
        let bindings = bindings.get(&kernel);

        if let Some(slot) = slots
            .iter()
            .find(|&slot| bindings.and_then(|x| x.get(slot)).is_none())
        {
            return Err(DeviceError::Unbound(kernel, slot.clone()));
        }

        let mut invocation = Invocation {
            kernel,
            groups,
            threads: *threads,
            resources,
            bindings,
            constants: constants.get(&kernel),
        };
        (**body)(&mut invocation);
        Ok(())
    }
}

fn copy_region(resource: &Resource, region: &TextureRegion) -> Result<Vec<u8>, DeviceError> {
    let texture = resource
        .texture
        .as_ref()
        .ok_or_else(|| DeviceError::Transfer("region copy from a buffer".into()))?;
    if !texture.contains(region) {
        return Err(DeviceError::Transfer(format!("region {region} out of texture")));
    }
    let level = resource
        .levels
        .get(region.mip as usize)
        .ok_or_else(|| DeviceError::Transfer(format!("mip {} missing", region.mip)))?;

    let [width, height, _] = texture.mip_extent(region.mip).map(|x| x as usize);
    let bpp = texture.format.bytes_per_pixel();
    let row = region.width as usize * bpp;
    let bytes = (region.z..region.z + region.depth)
        .cartesian_product(region.y..region.y + region.height)
        .flat_map(move |(z, y)| {
            let start = ((z as usize * height + y as usize) * width + region.x as usize) * bpp;
            level[start..start + row].iter().copied()
        })
        .collect();
    Ok(bytes)
}

impl Device for Cpu {
    type Handle = CpuHandle;
    type Fence = CpuFence;
    type Transfer = CpuTransfer;

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
        _usage: BufferUsage,
    ) -> Result<Self::Handle, DeviceError> {
        let size = stride
            .checked_mul(count)
            .ok_or_else(|| DeviceError::Alloc(format!("{count} × {stride} bytes")))?;
        let handle = CpuHandle(uid::Id::new());
        let resource = Resource {
            levels: vec![vec![0; size]],
            texture: None,
        };
        let mut state = self.state.write().expect("failed to lock");
        state.resources.insert(handle, resource);
        state.stats.allocations += 1;
        Ok(handle)
    }

    fn allocate_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<Self::Handle, DeviceError> {
        let bpp = descriptor.format.bytes_per_pixel();
        let levels = (0..descriptor.mip_count)
            .map(|mip| descriptor.mip_extent(mip))
            .map(|[w, h, d]| vec![0; w as usize * h as usize * d as usize * bpp])
            .collect();
        let handle = CpuHandle(uid::Id::new());
        let resource = Resource {
            levels,
            texture: Some(*descriptor),
        };
        let mut state = self.state.write().expect("failed to lock");
        state.resources.insert(handle, resource);
        state.stats.allocations += 1;
        Ok(handle)
    }

    fn release(&self, handle: &Self::Handle) -> Result<(), DeviceError> {
        let mut state = self.state.write().expect("failed to lock");
        if state.stuck.contains(handle) {
            return Err(DeviceError::Release(handle.to_string()));
        }
        state
            .resources
            .remove(handle)
            .ok_or_else(|| DeviceError::Handle(handle.to_string()))?;
        for bindings in state.bindings.values_mut() {
            bindings.retain(|_, bound| bound != handle);
        }
        state.stats.releases += 1;
        Ok(())
    }

    fn write_buffer(&self, handle: &Self::Handle, contents: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.write().expect("failed to lock");
        let bytes = state
            .resources
            .get_mut(handle)
            .and_then(|x| x.levels.first_mut())
            .ok_or_else(|| DeviceError::Handle(handle.to_string()))?;
        if contents.len() > bytes.len() {
            return Err(DeviceError::Overflow(contents.len(), bytes.len()));
        }
        bytes[..contents.len()].copy_from_slice(contents);
        Ok(())
    }

    fn read_buffer(&self, handle: &Self::Handle) -> Result<Vec<u8>, DeviceError> {
        self.contents(handle)
            .ok_or_else(|| DeviceError::Handle(handle.to_string()))
    }

    fn bind(&self, kernel: KernelId, slot: &str, handle: &Self::Handle) -> Result<(), DeviceError> {
        let CpuKernel { slots, .. } = self.kernel(kernel)?;
        if !slots.iter().any(|x| x == slot) {
            return Err(DeviceError::Slot(kernel, slot.into()));
        }
        let mut state = self.state.write().expect("failed to lock");
        if !state.resources.contains_key(handle) {
            return Err(DeviceError::Handle(handle.to_string()));
        }
        state
            .bindings
            .entry(kernel)
            .or_default()
            .insert(slot.into(), *handle);
        Ok(())
    }

    fn check_constant(&self, kernel: KernelId, _slot: &str) -> Result<(), DeviceError> {
        self.kernel(kernel).map(|_| ())
    }

    fn set_constant(&self, kernel: KernelId, slot: &str, value: &[u8]) -> Result<(), DeviceError> {
        self.check_constant(kernel, slot)?;
        let mut state = self.state.write().expect("failed to lock");
        state
            .constants
            .entry(kernel)
            .or_default()
            .insert(slot.into(), value.to_vec());
        Ok(())
    }

    fn dispatch(&self, kernel: KernelId, groups: DispatchDimensions) -> Result<(), DeviceError> {
        self.run(kernel, groups)?;
        self.state.write().expect("failed to lock").stats.dispatches += 1;
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
        log::debug!(
            "cpu async dispatch of {kernel} on {} queue, waiting for {}",
            options.queue,
            options.stage
        );
        self.run(kernel, groups)?;
        self.state.write().expect("failed to lock").stats.async_dispatches += 1;
        let remaining = AtomicUsize::new(self.fence_latency);
        Ok(CpuFence { remaining })
    }

    fn is_fence_signaled(&self, fence: &Self::Fence) -> bool {
        if self.state.read().expect("failed to lock").hold_fences {
            return false;
        }
        count_down(&fence.remaining)
    }

    fn request_transfer(
        &self,
        handle: &Self::Handle,
        range: TransferRange,
    ) -> Result<Self::Transfer, DeviceError> {
        let mut state = self.state.write().expect("failed to lock");
        let resource = state
            .resources
            .get(handle)
            .ok_or_else(|| DeviceError::Handle(handle.to_string()))?;
        let bytes = match range {
            TransferRange::Bytes { offset, len } => {
                let level = &resource.levels[0];
                let bytes = level.get(offset..offset + len).ok_or_else(|| {
                    DeviceError::Transfer(format!("{range} out of {}", level.len()))
                })?;
                bytes.to_vec()
            }
            TransferRange::Region(region) => copy_region(resource, &region)?,
        };
        let error = state.fail_transfers;
        state.stats.transfers += 1;
        let remaining = AtomicUsize::new(self.transfer_latency);
        Ok(CpuTransfer {
            bytes,
            error,
            remaining,
        })
    }

    fn is_transfer_done(&self, transfer: &Self::Transfer) -> bool {
        count_down(&transfer.remaining)
    }

    fn transfer_has_error(&self, transfer: &Self::Transfer) -> bool {
        transfer.error
    }

    fn read_transfer_bytes(&self, transfer: Self::Transfer) -> Result<Vec<u8>, DeviceError> {
        match transfer.error {
            true => Err(DeviceError::Transfer("device reported an error".into())),
            false => Ok(transfer.bytes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuBuilder {
    pub kernels: Vec<CpuKernel>,
    pub async_support: bool,
    pub fence_latency: usize,
    pub transfer_latency: usize,
}

impl Default for CpuBuilder {
    fn default() -> Self {
        Self {
            kernels: Vec::new(),
            async_support: true,
            fence_latency: 1,
            transfer_latency: 1,
        }
    }
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Cpu {
        Cpu {
            kernels: Arc::new(self.kernels),
            state: Default::default(),
            async_support: self.async_support,
            fence_latency: self.fence_latency,
            transfer_latency: self.transfer_latency,
        }
    }

    /// Adds a kernel that must have every slot in `slots` bound before it runs.
    pub fn add_kernel<F>(mut self, name: &str, threads: [u32; 3], slots: &[&str], body: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
    {
        self.kernels.push(CpuKernel {
            name: name.into(),
            threads,
            slots: slots.iter().map(|&x| x.into()).collect(),
            body: Arc::new(body),
        });
        self
    }

    pub fn async_support(mut self, async_support: bool) -> Self {
        self.async_support = async_support;
        self
    }

    /// Number of polls before a fence signals.
    pub fn fence_latency(mut self, polls: usize) -> Self {
        self.fence_latency = polls;
        self
    }

    /// Number of polls before a transfer completes.
    pub fn transfer_latency(mut self, polls: usize) -> Self {
        self.transfer_latency = polls;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuBuilder, Invocation};
    use crate::{
        device::{AsyncOptions, BufferUsage, Device, DeviceError, KernelId, TransferRange},
        dispatch::DispatchDimensions,
        texture::{TextureDescriptor, TextureFormat, TextureRegion},
    };

    fn double(invocation: &mut Invocation<'_>) {
        if let Some(data) = invocation.read::<f32>("data") {
            let data: Vec<f32> = data.into_iter().map(|x| x * 2.0).collect();
            invocation.write("data", &data);
        }
    }

    #[test]
    fn test_dispatch() -> Result<(), DeviceError> {
        let cpu = CpuBuilder::new()
            .add_kernel("double", [64, 1, 1], &["data"], double)
            .build();
        let kernel = cpu.find_kernel("double").ok_or(DeviceError::Kernel(KernelId(0)))?;
        assert_eq!(cpu.thread_group_size(kernel)?, [64, 1, 1]);

        let handle = cpu.allocate_buffer(4, 4, BufferUsage::Structured)?;
        cpu.write_buffer(&handle, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]))?;

        // unbound slots are rejected
        assert!(matches!(
            cpu.dispatch(kernel, DispatchDimensions::default()),
            Err(DeviceError::Unbound(_, _))
        ));

        cpu.bind(kernel, "data", &handle)?;
        cpu.dispatch(kernel, DispatchDimensions::default())?;
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&cpu.read_buffer(&handle)?);
        assert_eq!(data, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(cpu.stats().dispatches, 1);
        Ok(())
    }

    #[test]
    fn test_fence_latency() -> Result<(), DeviceError> {
        let cpu = CpuBuilder::new()
            .add_kernel("noop", [1, 1, 1], &[], |_| {})
            .fence_latency(2)
            .build();
        let fence = cpu.dispatch_async(KernelId(0), Default::default(), AsyncOptions::default())?;
        assert!(!cpu.is_fence_signaled(&fence));
        assert!(!cpu.is_fence_signaled(&fence));
        assert!(cpu.is_fence_signaled(&fence));
        assert!(cpu.is_fence_signaled(&fence));
        Ok(())
    }

    #[test]
    fn test_region_transfer() -> Result<(), DeviceError> {
        let cpu = CpuBuilder::new().transfer_latency(0).build();
        let texture = TextureDescriptor::new(4, 2, TextureFormat::R8Unorm);
        let handle = cpu.allocate_texture(&texture)?;
        cpu.write_buffer(&handle, &[0, 1, 2, 3, 4, 5, 6, 7])?;

        let region = TextureRegion {
            x: 1,
            y: 0,
            width: 2,
            height: 2,
            depth: 1,
            ..Default::default()
        };
        let transfer = cpu.request_transfer(&handle, TransferRange::Region(region))?;
        assert!(cpu.is_transfer_done(&transfer));
        assert!(!cpu.transfer_has_error(&transfer));
        assert_eq!(cpu.read_transfer_bytes(transfer)?, vec![1, 2, 5, 6]);
        Ok(())
    }

    #[test]
    fn test_release() -> Result<(), DeviceError> {
        let cpu = CpuBuilder::new().build();
        let x = cpu.allocate_buffer(4, 1, BufferUsage::Raw)?;
        let y = cpu.allocate_buffer(4, 1, BufferUsage::Raw)?;
        cpu.fail_release(&y);

        cpu.release(&x)?;
        assert!(cpu.release(&x).is_err());
        assert!(matches!(cpu.release(&y), Err(DeviceError::Release(_))));
        assert_eq!(cpu.live_count(), 1);
        Ok(())
    }
}
