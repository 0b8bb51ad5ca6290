use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use derive_more::Display;
use instant::Instant;
use thiserror::Error;

use crate::{
    config::ContextConfig,
    device::{AsyncOptions, Device, DeviceError, KernelId},
    dispatch::{self, DispatchDimensions},
    num::Element,
    platform,
    registry::{BufferDescriptor, ResourceError, Scope, ScopeKind, SharedScope},
    texture::{TextureData, TextureDescriptor},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ExecutionState {
    #[default]
    Idle,
    Dispatching,
}

/// Sent to every subscriber after a kernel has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{kernel} finished in {elapsed:?}")]
pub struct Completion {
    pub kernel: KernelId,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("kernel index {0} is out of range")]
    InvalidKernelIndex(i32),
    #[error("device does not support asynchronous dispatch")]
    UnsupportedAsyncExecution,
    #[error("kernel {0} did not finish in time")]
    TimedOut(KernelId),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Puts the context back to [`ExecutionState::Idle`] however the dispatch ends.
struct DispatchGuard<'a>(&'a Mutex<ExecutionState>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        // a poisoned lock must not leave the context stuck in dispatch
        *self.0.lock().unwrap_or_else(|err| err.into_inner()) = ExecutionState::Idle;
    }
}

/// Dispatches kernels on a device over the resources of a local and a global scope.
///
/// At most one dispatch is in flight per context. A dispatch requested while another is
/// running is dropped and reported as `Ok(None)`.
pub struct ComputeContext<D: Device> {
    device: Arc<D>,
    local: Mutex<Scope<D>>,
    global: SharedScope<D>,
    config: ContextConfig,
    state: Mutex<ExecutionState>,
    dimensions: Mutex<DispatchDimensions>,
    last_elapsed: Mutex<Option<Duration>>,
    subscribers: Mutex<Vec<flume::Sender<Completion>>>,
}

impl<D: Device> std::fmt::Debug for ComputeContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("dimensions", &self.dimensions())
            .finish_non_exhaustive()
    }
}

impl<D: Device> ComputeContext<D> {
    /// Creates a context with its own, unshared global scope.
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            local: Mutex::new(Scope::new(ScopeKind::Local)),
            global: Scope::shared(),
            config: Default::default(),
            state: Default::default(),
            dimensions: Default::default(),
            last_elapsed: Default::default(),
            subscribers: Default::default(),
        }
    }

    /// Shares `global` with every other context holding it.
    pub fn with_global(mut self, global: SharedScope<D>) -> Self {
        self.global = global;
        self
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[inline]
    pub fn global(&self) -> &SharedScope<D> {
        &self.global
    }

    /// Locks one of the two scopes. Do not hold the guard across an `.await`.
    pub fn scope(&self, kind: ScopeKind) -> MutexGuard<'_, Scope<D>> {
        match kind {
            ScopeKind::Local => &self.local,
            ScopeKind::Global => &*self.global,
        }
        .lock()
        .expect("failed to lock")
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().expect("failed to lock")
    }

    pub fn dimensions(&self) -> DispatchDimensions {
        *self.dimensions.lock().expect("failed to lock")
    }

    /// Duration of the most recent completed dispatch.
    pub fn last_elapsed(&self) -> Option<Duration> {
        *self.last_elapsed.lock().expect("failed to lock")
    }

    /// Receives a [`Completion`] for every kernel this context finishes from now on.
    pub fn subscribe(&self) -> flume::Receiver<Completion> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers.lock().expect("failed to lock").push(sender);
        receiver
    }

    pub fn find_kernel(&self, name: &str) -> Option<KernelId> {
        self.device.find_kernel(name)
    }

    fn kernel(&self, index: i32) -> Result<KernelId, ExecutionError> {
        u32::try_from(index)
            .ok()
            .filter(|&x| (x as usize) < self.device.kernel_count())
            .map(KernelId)
            .ok_or_else(|| {
                log::error!("kernel index {index} is out of range");
                ExecutionError::InvalidKernelIndex(index)
            })
    }

    /// Overrides the group counts of the next dispatches.
    pub fn set_dimensions(&self, dimensions: DispatchDimensions) {
        *self.dimensions.lock().expect("failed to lock") = dimensions;
    }

    /// Lays `len` items out for `kernel`'s thread groups. Returns the thread width along x.
    pub fn set_dimensions_1d(&self, kernel: i32, len: i64) -> Result<u32, ExecutionError> {
        let threads = self.device.thread_group_size(self.kernel(kernel)?)?;
        let (dimensions, width) = dispatch::groups_1d(len, threads);
        self.set_dimensions(dimensions);
        Ok(width)
    }

    pub fn set_dimensions_2d(
        &self,
        kernel: i32,
        width: i64,
        height: i64,
    ) -> Result<DispatchDimensions, ExecutionError> {
        let threads = self.device.thread_group_size(self.kernel(kernel)?)?;
        let dimensions = dispatch::groups_2d(width, height, threads);
        self.set_dimensions(dimensions);
        Ok(dimensions)
    }

    pub fn set_dimensions_3d(
        &self,
        kernel: i32,
        width: i64,
        height: i64,
        depth: i64,
    ) -> Result<DispatchDimensions, ExecutionError> {
        let threads = self.device.thread_group_size(self.kernel(kernel)?)?;
        let dimensions = dispatch::groups_3d(width, height, depth, threads);
        self.set_dimensions(dimensions);
        Ok(dimensions)
    }

    fn begin(&self, kernel: KernelId) -> Option<DispatchGuard<'_>> {
        let mut state = self.state.lock().expect("failed to lock");
        match *state {
            ExecutionState::Dispatching => {
                log::debug!("dispatch of {kernel} dropped: context is busy");
                None
            }
            ExecutionState::Idle => {
                *state = ExecutionState::Dispatching;
                Some(DispatchGuard(&self.state))
            }
        }
    }

    /// Binds global resources first so that local ones of the same slot take precedence.
    fn apply(&self, kernel: KernelId) -> Result<(), DeviceError> {
        self.scope(ScopeKind::Global).apply(&self.device, kernel)?;
        self.scope(ScopeKind::Local).apply(&self.device, kernel)
    }

    fn complete(&self, kernel: KernelId, elapsed: Duration) -> Completion {
        let completion = Completion { kernel, elapsed };
        *self.last_elapsed.lock().expect("failed to lock") = Some(elapsed);
        self.subscribers
            .lock()
            .expect("failed to lock")
            .retain(|sender| sender.send(completion).is_ok());
        completion
    }

    /// Dispatches a kernel and blocks until the device has finished it.
    ///
    /// Returns `Ok(None)` without dispatching if the context is busy.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn execute_sync(&self, kernel: i32) -> Result<Option<Completion>, ExecutionError> {
        let kernel = self.kernel(kernel)?;
        let Some(guard) = self.begin(kernel) else {
            return Ok(None);
        };

        let dimensions = self.dimensions();
        let start = Instant::now();
        self.apply(kernel)
            .and_then(|_| self.device.dispatch(kernel, dimensions))
            .inspect_err(|err| log::error!("dispatch of {kernel} failed: {err}"))?;
        let elapsed = start.elapsed();

        drop(guard);
        Ok(Some(self.complete(kernel, elapsed)))
    }

    /// Submits a kernel and waits for its fence without blocking the executor.
    ///
    /// Returns `Ok(None)` without dispatching if the context is busy. Dropping the future
    /// stops waiting and returns the context to idle.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn execute_async(&self, kernel: i32) -> Result<Option<Completion>, ExecutionError> {
        let kernel = self.kernel(kernel)?;
        if !self.device.supports_async() {
            log::error!("dispatch of {kernel} failed: device has no asynchronous queue");
            return Err(ExecutionError::UnsupportedAsyncExecution);
        }
        let Some(guard) = self.begin(kernel) else {
            return Ok(None);
        };

        let dimensions = self.dimensions();
        let options = AsyncOptions {
            queue: self.config.queue,
            stage: self.config.stage,
        };
        let start = Instant::now();
        let fence = self
            .apply(kernel)
            .and_then(|_| self.device.dispatch_async(kernel, dimensions, options))
            .inspect_err(|err| log::error!("dispatch of {kernel} failed: {err}"))?;

        let signaled = platform::poll_until(|| self.device.is_fence_signaled(&fence));
        if platform::deadline(self.config.timeout, signaled).await.is_none() {
            log::error!("dispatch of {kernel} timed out after {:?}", start.elapsed());
            return Err(ExecutionError::TimedOut(kernel));
        }
        let elapsed = start.elapsed();

        drop(guard);
        Ok(Some(self.complete(kernel, elapsed)))
    }

    pub fn register_buffer(
        &self,
        kind: ScopeKind,
        descriptor: BufferDescriptor,
    ) -> Result<(), ResourceError> {
        let mut scope = self.scope(kind);
        scope.register_buffer(&self.device, descriptor).map(|_| ())
    }

    pub fn register_texture(
        &self,
        kind: ScopeKind,
        name: impl Into<String>,
        descriptor: TextureDescriptor,
        kernels: &[KernelId],
    ) -> Result<(), ResourceError> {
        let mut scope = self.scope(kind);
        scope
            .register_texture(&self.device, name, descriptor, kernels)
            .map(|_| ())
    }

    pub fn set_buffer_data<T: Element>(
        &self,
        kind: ScopeKind,
        name: &str,
        data: &[T],
    ) -> Result<(), ResourceError> {
        self.scope(kind).set_buffer_data(&self.device, name, data)
    }

    pub fn get_buffer_data<T: Element>(
        &self,
        kind: ScopeKind,
        name: &str,
        output: &mut [T],
    ) -> Result<(), ResourceError> {
        self.scope(kind).get_buffer_data(&self.device, name, output)
    }

    pub fn set_texture_data(
        &self,
        kind: ScopeKind,
        name: &str,
        data: &TextureData,
    ) -> Result<(), ResourceError> {
        self.scope(kind).set_texture_data(&self.device, name, data)
    }

    pub fn resize(&self, kind: ScopeKind, name: &str, count: usize) -> Result<(), ResourceError> {
        self.scope(kind).resize(&self.device, name, count)
    }

    pub fn bind(&self, kind: ScopeKind, name: &str, kernel: KernelId) -> Result<(), ResourceError> {
        self.scope(kind).bind(&self.device, name, kernel)
    }

    pub fn set_constant<T: Element>(
        &self,
        kind: ScopeKind,
        name: &str,
        value: T,
        kernels: &[KernelId],
    ) -> Result<(), ResourceError> {
        self.scope(kind)
            .set_constant(&self.device, name, value, kernels)
    }

    pub fn dispose(&self, kind: ScopeKind, name: &str) -> bool {
        self.scope(kind).dispose(&self.device, name)
    }

    pub fn dispose_all(&self, kind: ScopeKind) {
        self.scope(kind).dispose_all(&self.device)
    }
}

impl<D: Device> Drop for ComputeContext<D> {
    fn drop(&mut self) {
        let local = self.local.get_mut().unwrap_or_else(|err| err.into_inner());
        local.dispose_all(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc, time::Duration};

    use super::{ComputeContext, ExecutionError, ExecutionState};
    use crate::{
        config::ContextConfig,
        device::{Cpu, CpuBuilder, DeviceError, Invocation, KernelId},
        dispatch::DispatchDimensions,
        platform,
        registry::{BufferDescriptor, ResourceError, Scope, ScopeKind},
    };

    fn double(invocation: &mut Invocation<'_>) {
        let [len, _, _] = invocation.extent();
        if let Some(mut data) = invocation.read::<f32>("data") {
            data.iter_mut().take(len as usize).for_each(|x| *x *= 2.0);
            invocation.write("data", &data);
        }
    }

    fn device() -> Cpu {
        CpuBuilder::new()
            .add_kernel("double", [64, 1, 1], &["data"], double)
            .add_kernel("blur", [8, 8, 1], &[], |_| {})
            .build()
    }

    #[tokio::test]
    async fn test_execute_sync() -> Result<(), Box<dyn Error>> {
        let cpu = device();
        let context = ComputeContext::new(Arc::new(cpu.clone()));
        let kernel = context.find_kernel("double").ok_or("kernel not found")?;
        let receiver = context.subscribe();

        let data: Vec<f32> = (0..100).map(|_| fastrand::f32()).collect();
        context.register_buffer(
            ScopeKind::Local,
            BufferDescriptor::new::<f32>("data", 100).kernel(kernel),
        )?;
        context.set_buffer_data(ScopeKind::Local, "data", &data)?;

        assert_eq!(context.set_dimensions_1d(0, 100)?, 128);
        assert_eq!(context.dimensions(), DispatchDimensions::new(2, 1, 1));
        let completion = context.execute_sync(0)?.ok_or("dispatch dropped")?;
        assert_eq!(completion.kernel, kernel);
        assert_eq!(context.last_elapsed(), Some(completion.elapsed));
        assert_eq!(receiver.recv_async().await?, completion);

        let mut output = vec![0.0f32; 100];
        context.get_buffer_data(ScopeKind::Local, "data", &mut output)?;
        let expected: Vec<f32> = data.iter().map(|x| x * 2.0).collect();
        assert_eq!(output, expected);
        assert_eq!(context.state(), ExecutionState::Idle);
        Ok(())
    }

    #[test]
    fn test_poisoned_guard() {
        let context = ComputeContext::new(Arc::new(device()));
        let guard = context.begin(KernelId(0));
        assert!(guard.is_some());

        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _state = context.state.lock();
                    panic!("poison the state lock");
                })
                .join()
                .is_err()
        });
        assert!(poisoned);
        assert!(context.state.is_poisoned());

        drop(guard);
        let state = *context.state.lock().unwrap_or_else(|err| err.into_inner());
        assert_eq!(state, ExecutionState::Idle);

        context.state.clear_poison();
        assert_eq!(context.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_busy_context() -> Result<(), Box<dyn Error>> {
        let cpu = device();
        cpu.hold_fences(true);
        let context = ComputeContext::new(Arc::new(cpu.clone()));
        context.register_buffer(
            ScopeKind::Local,
            BufferDescriptor::new::<f32>("data", 4).kernel(KernelId(0)),
        )?;

        let (first, second) = tokio::join!(context.execute_async(0), async {
            platform::poll_until(|| context.state() == ExecutionState::Dispatching).await;
            let second = context.execute_sync(0);
            let third = context.execute_async(0).await;
            assert_eq!(context.state(), ExecutionState::Dispatching);
            cpu.hold_fences(false);
            (second, third)
        });
        assert!(first?.is_some());
        assert!(second.0?.is_none());
        assert!(second.1?.is_none());

        let stats = cpu.stats();
        assert_eq!(stats.dispatches, 0);
        assert_eq!(stats.async_dispatches, 1);
        assert_eq!(context.state(), ExecutionState::Idle);

        assert!(context.execute_sync(0)?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_kernel() {
        let context = ComputeContext::new(Arc::new(device()));
        for index in [-1, 2, i32::MAX] {
            assert!(matches!(
                context.execute_sync(index),
                Err(ExecutionError::InvalidKernelIndex(x)) if x == index
            ));
            assert!(matches!(
                context.execute_async(index).await,
                Err(ExecutionError::InvalidKernelIndex(_))
            ));
        }
        assert_eq!(context.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_unsupported_async() {
        let cpu = CpuBuilder::new()
            .add_kernel("noop", [1, 1, 1], &[], |_| {})
            .async_support(false)
            .build();
        let context = ComputeContext::new(Arc::new(cpu.clone()));
        assert!(matches!(
            context.execute_async(0).await,
            Err(ExecutionError::UnsupportedAsyncExecution)
        ));
        assert_eq!(context.state(), ExecutionState::Idle);
        assert_eq!(cpu.stats().async_dispatches, 0);
    }

    #[tokio::test]
    async fn test_failures_release_guard() -> Result<(), Box<dyn Error>> {
        let cpu = device();
        let config = ContextConfig::default().timeout(Duration::from_millis(10));
        let context = ComputeContext::new(Arc::new(cpu.clone())).with_config(config);

        // the slot of kernel 0 is never bound
        assert!(matches!(
            context.execute_sync(0),
            Err(ExecutionError::Device(DeviceError::Unbound(..)))
        ));
        assert_eq!(context.state(), ExecutionState::Idle);

        cpu.hold_fences(true);
        assert!(matches!(
            context.execute_async(1).await,
            Err(ExecutionError::TimedOut(KernelId(1)))
        ));
        assert_eq!(context.state(), ExecutionState::Idle);
        assert_eq!(context.last_elapsed(), None);

        cpu.hold_fences(false);
        assert!(context.execute_async(1).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_dimensions() -> Result<(), ExecutionError> {
        let context = ComputeContext::new(Arc::new(device()));
        assert_eq!(context.dimensions(), DispatchDimensions::new(1, 1, 1));

        let dimensions = context.set_dimensions_2d(1, 1024, 1024)?;
        assert_eq!(dimensions, DispatchDimensions::new(128, 128, 1));
        assert_eq!(context.set_dimensions_3d(1, 0, -5, 3)?, DispatchDimensions::new(1, 1, 3));

        context.set_dimensions(DispatchDimensions::new(7, 0, 2));
        assert_eq!(context.dimensions(), DispatchDimensions::new(7, 1, 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_scopes() -> Result<(), ResourceError> {
        let cpu = device();
        let device = Arc::new(cpu.clone());
        let global = Scope::<Cpu>::shared();
        let first = ComputeContext::new(device.clone()).with_global(global.clone());
        let second = ComputeContext::new(device.clone()).with_global(global.clone());

        first.register_buffer(ScopeKind::Global, BufferDescriptor::new::<f32>("shared", 16))?;
        first.register_buffer(ScopeKind::Local, BufferDescriptor::new::<f32>("scratch", 16))?;

        // first writer wins
        let err =
            second.register_buffer(ScopeKind::Global, BufferDescriptor::new::<u32>("shared", 4));
        assert!(matches!(err, Err(ResourceError::AlreadyExists(_))));
        second.set_buffer_data(ScopeKind::Global, "shared", &[1.0f32; 16])?;

        // both contexts see one global resource; the local one is private
        assert!(second.scope(ScopeKind::Local).find("scratch").is_none());
        assert_eq!(cpu.live_count(), 2);

        drop(first);
        assert_eq!(cpu.live_count(), 1);
        let mut output = [0.0f32; 16];
        second.get_buffer_data(ScopeKind::Global, "shared", &mut output)?;
        assert_eq!(output, [1.0; 16]);

        drop(second);
        assert_eq!(global.lock().map(|x| x.len()).unwrap_or_default(), 1);
        Ok(())
    }
}
