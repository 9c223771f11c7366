//! # gpu-submit
//!
//! GPU command-queue submission core.
//!
//! For every batch of command buffers submitted to a hardware queue this
//! crate decides which auxiliary GPU resources (scratch memory, shader
//! interconnect rings, tessellation/task/mesh rings, the attribute ring
//! and global data-share allocations) are required, grows a persistent
//! per-queue pool of them on demand, rebuilds the preamble sequences that
//! point hardware state at the current resources, and submits the user's
//! command buffers with the correct preamble and postamble sets through
//! the winsys.
//!
//! ## Overview
//!
//! - [`ring`] — requirement sizing, the grow-only per-queue resource pool
//!   and preamble generation
//! - [`submit`] — the per-queue submission driver
//! - [`gang`] — the two-engine gang handshake
//! - [`sparse`] — virtual-bind coalescing and the sparse queue thread
//! - [`winsys`] — the kernel-facing boundary, as a trait
//!
//! ## Example
//!
//! ```ignore
//! use gpu_submit::{Device, DeviceCaps, DeviceOptions, Queue, Submission};
//!
//! let device = Device::new(winsys, DeviceCaps::default(), DeviceOptions::default());
//! let mut queue = Queue::new(&device, EngineType::Graphics);
//! queue.submit(&Submission { cmd_bufs, ..Default::default() })?;
//! ```

pub mod device;
pub mod error;
pub mod gang;
pub mod hw;
pub mod ring;
pub mod sparse;
pub mod submit;
pub mod winsys;

// Re-export the public surface for convenience.
pub use device::{Device, DeviceCaps, DeviceOptions};
pub use error::{SubmitError, SubmitResult};
pub use gang::GangLink;
pub use ring::{ComputeScratchBudget, RingPool, RingRequirement};
pub use sparse::{bind_sparse, SparseBindInfo, SparseQueue};
pub use submit::{CmdBuf, PreambleKind, Queue, Submission};
pub use winsys::{EngineType, SyncId, Winsys};
