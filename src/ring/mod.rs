//! Ring resource management: sizing, the per-queue pool and preambles.

pub mod pool;
pub mod preamble;
pub mod requirement;

pub use pool::RingPool;
pub use preamble::{PoolView, PreambleSet};
pub use requirement::{compute_requirement, ComputeScratchBudget, RingRequirement};
