//! `spindle` orchestrates compute work on a GPU from the host side.
//!
//! ## Key Components
//! 1. **Resources**:
//!    - Named buffers and textures live in a [`Scope`](registry::Scope), either local to one
//!      [`ComputeContext`](context::ComputeContext) or global and shared between many.
//!    - Every scope accounts for its device memory in a [`MemoryLedger`](ledger::MemoryLedger).
//!
//! 2. **Dispatch**:
//!    - Workload sizes turn into thread group counts through the [`dispatch`] helpers.
//!    - A context runs one kernel at a time, blocking or as a future; requests made while
//!      busy are dropped.
//!
//! 3. **Readback**:
//!    - Device data is copied back asynchronously into typed host slices or pixel storage.
//!
//! 4. **Devices**:
//!    - Backends implement the narrow [`Device`](device::Device) trait. A `wgpu` backend runs
//!      WGSL kernels; a software backend runs host closures.

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod ledger;
pub mod num;
pub mod platform;
pub mod readback;
pub mod registry;
pub mod texture;
