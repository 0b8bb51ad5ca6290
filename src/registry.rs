//! Named device resources and the scopes that own them.
//!
//! A [`Scope`] maps names to device buffers and textures and accounts for
//! their memory in a [`MemoryLedger`]. Every compute context owns a local
//! scope; a [`SharedScope`] is a global scope several contexts hold onto.

use std::sync::{Arc, Mutex};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

use crate::{
    device::{BufferUsage, Device, DeviceError, KernelId},
    ledger::MemoryLedger,
    num::{Element, ElementType},
    texture::{TextureData, TextureDescriptor},
};

/// A global scope, shared between contexts. The first registration of a name wins.
pub type SharedScope<D> = Arc<Mutex<Scope<D>>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ScopeKind {
    #[default]
    Local,
    Global,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {0} not found")]
    NotFound(String),
    #[error("resource {0} already exists")]
    AlreadyExists(String),
    #[error("resource {name} holds {found}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },
    #[error("resource {name} holds {found} elements, not {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResourceKind {
    #[display("{count} × {} ({usage})", r#type)]
    Buffer {
        r#type: ElementType,
        count: usize,
        usage: BufferUsage,
    },
    #[display("{}×{}×{} {} texture", _0.width, _0.height, _0.depth, _0.format)]
    Texture(TextureDescriptor),
}

impl ResourceKind {
    /// Bytes this resource accounts for in the ledger.
    pub fn size(&self) -> usize {
        match self {
            ResourceKind::Buffer { r#type, count, .. } => r#type.size(*count),
            ResourceKind::Texture(texture) => texture.pixel_bytes(),
        }
    }
}

/// A named device resource and the kernels it is bound to.
#[derive(Debug, Clone)]
pub struct ResourceHandle<H> {
    pub name: String,
    pub kind: ResourceKind,
    pub data: H,
    pub kernels: HashSet<KernelId>,
}

impl<H> ResourceHandle<H> {
    #[inline]
    pub fn size(&self) -> usize {
        self.kind.size()
    }

    /// Element count of a buffer, or `None` for a texture.
    pub fn count(&self) -> Option<usize> {
        match self.kind {
            ResourceKind::Buffer { count, .. } => Some(count),
            ResourceKind::Texture(_) => None,
        }
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self.kind {
            ResourceKind::Buffer { r#type, .. } => Some(r#type),
            ResourceKind::Texture(_) => None,
        }
    }

    pub fn texture(&self) -> Option<&TextureDescriptor> {
        match &self.kind {
            ResourceKind::Buffer { .. } => None,
            ResourceKind::Texture(texture) => Some(texture),
        }
    }

    fn mismatch(&self, expected: impl ToString) -> ResourceError {
        let found = match self.kind {
            ResourceKind::Buffer { r#type, .. } => r#type.to_string(),
            ResourceKind::Texture(_) => self.kind.to_string(),
        };
        ResourceError::TypeMismatch {
            name: self.name.clone(),
            expected: expected.to_string(),
            found,
        }
    }
}

/// Creation parameters of a structured buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub name: String,
    pub r#type: ElementType,
    pub count: usize,
    pub usage: BufferUsage,
    pub kernels: Vec<KernelId>,
}

impl BufferDescriptor {
    pub fn new<T: Element>(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            r#type: T::element_type(),
            count,
            usage: BufferUsage::Structured,
            kernels: vec![],
        }
    }

    pub fn usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Binds the buffer to `kernel` on registration.
    pub fn kernel(mut self, kernel: KernelId) -> Self {
        self.kernels.push(kernel);
        self
    }

    pub fn kernels(mut self, kernels: impl IntoIterator<Item = KernelId>) -> Self {
        self.kernels.extend(kernels);
        self
    }
}

#[derive(Debug, Clone)]
struct Constant {
    value: Vec<u8>,
    kernels: HashSet<KernelId>,
}

#[derive(Debug)]
pub struct Scope<D: Device> {
    kind: ScopeKind,
    resources: HashMap<String, ResourceHandle<D::Handle>>,
    constants: HashMap<String, Constant>,
    ledger: MemoryLedger,
}

impl<D: Device> Default for Scope<D> {
    fn default() -> Self {
        Self::new(ScopeKind::Local)
    }
}

impl<D: Device> Scope<D> {
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            resources: Default::default(),
            constants: Default::default(),
            ledger: Default::default(),
        }
    }

    /// Creates an empty global scope to be handed to several contexts.
    pub fn shared() -> SharedScope<D> {
        Arc::new(Mutex::new(Self::new(ScopeKind::Global)))
    }

    #[inline]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    #[inline]
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Total bytes of every resource and constant in this scope.
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.ledger.total()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str).sorted()
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<&ResourceHandle<D::Handle>> {
        self.resources.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<&ResourceHandle<D::Handle>, ResourceError> {
        self.resources.get(name).ok_or_else(|| {
            log::warn!("[{}] resource {name} not found", self.kind);
            ResourceError::NotFound(name.into())
        })
    }

    fn check_vacant(&self, name: &str) -> Result<(), ResourceError> {
        match self.resources.contains_key(name) || self.constants.contains_key(name) {
            true => {
                log::warn!("[{}] resource {name} already exists", self.kind);
                Err(ResourceError::AlreadyExists(name.into()))
            }
            false => Ok(()),
        }
    }

    /// Allocates and binds a resource, then records it. On failure nothing is recorded and the
    /// allocation is given back.
    fn insert(
        &mut self,
        device: &D,
        name: String,
        kind: ResourceKind,
        kernels: HashSet<KernelId>,
        data: Result<D::Handle, DeviceError>,
    ) -> Result<&ResourceHandle<D::Handle>, ResourceError> {
        let data = data
            .inspect_err(|err| log::error!("[{}] failed to allocate {name}: {err}", self.kind))?;
        if let Err(err) = kernels
            .iter()
            .try_for_each(|&kernel| device.bind(kernel, &name, &data))
        {
            log::error!("[{}] failed to bind {name}: {err}", self.kind);
            if let Err(err) = device.release(&data) {
                log::error!("[{}] failed to release {name}: {err}", self.kind);
            }
            return Err(err.into());
        }

        let handle = ResourceHandle {
            name: name.clone(),
            kind,
            data,
            kernels,
        };
        self.ledger.track(&name, handle.size());
        log::debug!("[{}] registered {name}: {kind}", self.kind);
        Ok(self.resources.entry(name).or_insert(handle))
    }

    /// Allocates a structured buffer of `count × stride` bytes and binds it to the listed kernels.
    ///
    /// Registering a name twice leaves the first registration untouched and returns
    /// [`ResourceError::AlreadyExists`].
    pub fn register_buffer(
        &mut self,
        device: &D,
        descriptor: BufferDescriptor,
    ) -> Result<&ResourceHandle<D::Handle>, ResourceError> {
        let BufferDescriptor {
            name,
            r#type,
            count,
            usage,
            kernels,
        } = descriptor;
        self.check_vacant(&name)?;

        let kind = ResourceKind::Buffer {
            r#type,
            count,
            usage,
        };
        let data = device.allocate_buffer(r#type.stride(), count, usage);
        self.insert(device, name, kind, kernels.into_iter().collect(), data)
    }

    /// Allocates a texture and binds it to the listed kernels.
    pub fn register_texture(
        &mut self,
        device: &D,
        name: impl Into<String>,
        descriptor: TextureDescriptor,
        kernels: &[KernelId],
    ) -> Result<&ResourceHandle<D::Handle>, ResourceError> {
        let name = name.into();
        self.check_vacant(&name)?;

        let kind = ResourceKind::Texture(descriptor);
        let data = device.allocate_texture(&descriptor);
        self.insert(device, name, kind, kernels.iter().copied().collect(), data)
    }

    fn buffer<T: Element>(
        &self,
        name: &str,
        len: usize,
    ) -> Result<&ResourceHandle<D::Handle>, ResourceError> {
        let handle = self.get(name)?;
        let ResourceKind::Buffer { r#type, count, .. } = handle.kind else {
            log::warn!("[{}] {name} is not a buffer", self.kind);
            return Err(handle.mismatch(T::element_type()));
        };
        if !r#type.is::<T>() {
            log::warn!("[{}] {name} holds {}, not {}", self.kind, r#type, T::element_type());
            return Err(handle.mismatch(T::element_type()));
        }
        if count != len {
            log::warn!("[{}] {name} holds {count} elements, not {len}", self.kind);
            return Err(ResourceError::LengthMismatch {
                name: name.into(),
                expected: len,
                found: count,
            });
        }
        Ok(handle)
    }

    /// Uploads `data` into a buffer. The element type and count must match the registration
    /// exactly.
    pub fn set_buffer_data<T: Element>(
        &self,
        device: &D,
        name: &str,
        data: &[T],
    ) -> Result<(), ResourceError> {
        let handle = self.buffer::<T>(name, data.len())?;
        if size_of_val(data) == 0 {
            return Ok(());
        }
        device.write_buffer(&handle.data, bytemuck::cast_slice(data))?;
        Ok(())
    }

    /// Reads a buffer back into `output`, blocking until the device delivers the data.
    pub fn get_buffer_data<T: Element>(
        &self,
        device: &D,
        name: &str,
        output: &mut [T],
    ) -> Result<(), ResourceError> {
        let handle = self.buffer::<T>(name, output.len())?;
        let len = size_of_val(output);
        if len == 0 {
            return Ok(());
        }
        let bytes = device.read_buffer(&handle.data)?;
        let bytes = bytes
            .get(..len)
            .ok_or(DeviceError::Overflow(len, bytes.len()))?;
        bytemuck::cast_slice_mut::<T, u8>(output).copy_from_slice(bytes);
        Ok(())
    }

    /// Uploads the base level of a texture. Format and extent must match the registration.
    pub fn set_texture_data(
        &self,
        device: &D,
        name: &str,
        data: &TextureData,
    ) -> Result<(), ResourceError> {
        let handle = self.get(name)?;
        let Some(texture) = handle.texture() else {
            return Err(handle.mismatch(data.format));
        };
        if texture.format != data.format {
            return Err(handle.mismatch(data.format));
        }
        let expected = texture.pixel_bytes();
        let shape = [data.width, data.height, data.depth];
        if data.bytes.len() != expected || shape != [texture.width, texture.height, texture.depth] {
            return Err(ResourceError::LengthMismatch {
                name: name.into(),
                expected,
                found: data.bytes.len(),
            });
        }
        device.write_buffer(&handle.data, &data.bytes)?;
        Ok(())
    }

    /// Replaces a buffer with one of `count` elements.
    ///
    /// The element type, usage and kernel bindings carry over; the contents do not. The new
    /// buffer starts zeroed.
    pub fn resize(&mut self, device: &D, name: &str, count: usize) -> Result<(), ResourceError> {
        let handle = self.get(name)?;
        let ResourceKind::Buffer { r#type, usage, .. } = handle.kind else {
            log::warn!("[{}] only buffers can be resized, {name} is a texture", self.kind);
            return Err(handle.mismatch("buffer"));
        };

        let data = device
            .allocate_buffer(r#type.stride(), count, usage)
            .inspect_err(|err| log::error!("[{}] failed to resize {name}: {err}", self.kind))?;
        if let Err(err) = handle
            .kernels
            .iter()
            .try_for_each(|&kernel| device.bind(kernel, name, &data))
        {
            log::error!("[{}] failed to bind resized {name}: {err}", self.kind);
            if let Err(err) = device.release(&data) {
                log::error!("[{}] failed to release {name}: {err}", self.kind);
            }
            return Err(err.into());
        }

        let kind = self.kind;
        let Some(handle) = self.resources.get_mut(name) else {
            return Err(ResourceError::NotFound(name.into()));
        };
        let old = std::mem::replace(&mut handle.data, data);
        if let Err(err) = device.release(&old) {
            log::error!("[{kind}] failed to release old buffer of {name}: {err}");
        }

        let size = handle.size();
        handle.kind = ResourceKind::Buffer {
            r#type,
            count,
            usage,
        };
        self.ledger.untrack(name, size);
        self.ledger.track(name, r#type.size(count));
        Ok(())
    }

    /// Binds a registered resource to one more kernel.
    pub fn bind(&mut self, device: &D, name: &str, kernel: KernelId) -> Result<(), ResourceError> {
        let handle = self.get(name)?;
        device.bind(kernel, name, &handle.data)?;
        if let Some(handle) = self.resources.get_mut(name) {
            handle.kernels.insert(kernel);
        }
        Ok(())
    }

    /// Sets a kernel constant and records its size in the ledger.
    ///
    /// Setting the same name again replaces the value and its ledger entry.
    pub fn set_constant<T: Element>(
        &mut self,
        device: &D,
        name: &str,
        value: T,
        kernels: &[KernelId],
    ) -> Result<(), ResourceError> {
        if self.resources.contains_key(name) {
            log::warn!("[{}] {name} is a resource, not a constant", self.kind);
            return Err(ResourceError::AlreadyExists(name.into()));
        }
        if let Err(err) = kernels
            .iter()
            .try_for_each(|&kernel| device.check_constant(kernel, name))
        {
            log::warn!("[{}] failed to set constant {name}: {err}", self.kind);
            return Err(err.into());
        }
        let value = bytemuck::bytes_of(&value);
        kernels
            .iter()
            .try_for_each(|&kernel| device.set_constant(kernel, name, value))?;

        let constant = self.constants.entry(name.into()).or_insert_with(|| Constant {
            value: vec![],
            kernels: Default::default(),
        });
        constant.value = value.to_vec();
        constant.kernels.extend(kernels);
        self.ledger.track(name, value.len());
        Ok(())
    }

    /// Rebinds every resource and constant registered for `kernel`.
    pub fn apply(&self, device: &D, kernel: KernelId) -> Result<(), DeviceError> {
        for handle in self
            .resources
            .values()
            .filter(|handle| handle.kernels.contains(&kernel))
        {
            device.bind(kernel, &handle.name, &handle.data)?;
        }
        for (name, constant) in self
            .constants
            .iter()
            .filter(|(_, constant)| constant.kernels.contains(&kernel))
        {
            device.set_constant(kernel, name, &constant.value)?;
        }
        Ok(())
    }

    /// Releases a resource. The entry and its ledger record are dropped even if the device
    /// fails to release it. Returns `false` if the name was not registered.
    pub fn dispose(&mut self, device: &D, name: &str) -> bool {
        let Some(handle) = self.resources.remove(name) else {
            return false;
        };
        self.release(device, handle);
        true
    }

    /// Releases every resource and forgets every constant.
    pub fn dispose_all(&mut self, device: &D) {
        let resources = std::mem::take(&mut self.resources);
        for (_, handle) in resources {
            self.release(device, handle);
        }
        self.constants.clear();
        self.ledger.clear();
    }

    fn release(&mut self, device: &D, handle: ResourceHandle<D::Handle>) {
        if let Err(err) = device.release(&handle.data) {
            log::error!("[{}] disposal of {} failed: {err}", self.kind, handle.name);
        }
        self.ledger.untrack(&handle.name, handle.size());
    }
}
