//! Submission device.
//!
//! A [`Device`] bundles the winsys, the hardware-generation capabilities
//! and the small amount of process-wide state the submission path reads:
//! the lost flag, the shader-upload sequence counter and the shared
//! worst-case compute-scratch budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hw::HwGeneration;
use crate::ring::requirement::ComputeScratchBudget;
use crate::winsys::{SyncId, Winsys};

/// Fixed capabilities of the device, selected once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Hardware generation tier; selects the register-layout tables.
    pub generation: HwGeneration,
    /// Maximum number of scratch waves the device can have in flight.
    pub max_scratch_waves: u32,
    /// Required alignment for scratch and ring buffers.
    pub ring_alignment: u64,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            generation: HwGeneration::Gfx10,
            max_scratch_waves: 32 * 64,
            ring_alignment: 256,
        }
    }
}

/// Behavioral options, fixed at device creation.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Submit one command buffer at a time and poll for GPU faults after
    /// each.
    pub fault_detection: bool,
    /// Indirectly-bound compute pipelines are in use; ring sizing must
    /// honor the device-tracked worst-case compute scratch.
    pub indirect_compute_pipelines: bool,
    /// Pre-encoded graphics context initialization replayed by preambles
    /// instead of emitting the fixed state.
    pub graphics_init: Option<Vec<u32>>,
}

/// A submission device: one per kernel GPU context.
pub struct Device {
    ws: Arc<dyn Winsys>,
    caps: DeviceCaps,
    options: DeviceOptions,
    lost: AtomicBool,
    /// Bumped by the shader-upload path each time an upload retires;
    /// queues compare it against the last value they synchronized with.
    shader_upload_seq: AtomicU64,
    /// Device-wide semaphore the shader-upload path signals. Queues wait
    /// on it when a referenced upload has not been observed yet.
    shader_upload_sem: SyncId,
    scratch_budget: Arc<Mutex<ComputeScratchBudget>>,
}

impl Device {
    pub fn new(ws: Arc<dyn Winsys>, caps: DeviceCaps, options: DeviceOptions) -> Arc<Self> {
        log::debug!(
            "creating device on {} winsys, generation {:?}",
            ws.name(),
            caps.generation
        );
        Arc::new(Self {
            ws,
            caps,
            options,
            lost: AtomicBool::new(false),
            shader_upload_seq: AtomicU64::new(0),
            shader_upload_sem: SyncId(0),
            scratch_budget: Arc::new(Mutex::new(ComputeScratchBudget::default())),
        })
    }

    pub fn winsys(&self) -> &Arc<dyn Winsys> {
        &self.ws
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Shared worst-case compute-scratch budget, written whenever a larger
    /// indirect-dispatch requirement is discovered elsewhere in the driver.
    pub fn scratch_budget(&self) -> &Arc<Mutex<ComputeScratchBudget>> {
        &self.scratch_budget
    }

    /// Whether the device has been marked lost. Once set it never clears.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Mark the device lost. All subsequent submissions on any queue of
    /// this device short-circuit to `DeviceLost`.
    pub fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("device marked lost");
        }
    }

    /// Current shader-upload sequence number.
    pub fn shader_upload_seq(&self) -> u64 {
        self.shader_upload_seq.load(Ordering::Acquire)
    }

    /// Record that another shader-binary upload has been issued.
    /// Called by the (external) upload path.
    pub fn bump_shader_upload_seq(&self) -> u64 {
        self.shader_upload_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Semaphore signaled by the shader-upload path.
    pub fn shader_upload_sem(&self) -> SyncId {
        self.shader_upload_sem
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("winsys", &self.ws.name())
            .field("caps", &self.caps)
            .field("lost", &self.is_lost())
            .finish()
    }
}

static_assertions::assert_impl_all!(Device: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::winsys::dummy::DummyWinsys;

    #[test]
    fn lost_flag_is_sticky() {
        let ws: Arc<dyn Winsys> = Arc::new(DummyWinsys::new());
        let device = Device::new(ws, DeviceCaps::default(), DeviceOptions::default());
        assert!(!device.is_lost());
        device.mark_lost();
        device.mark_lost();
        assert!(device.is_lost());
    }

    #[test]
    fn upload_seq_is_monotonic() {
        let ws: Arc<dyn Winsys> = Arc::new(DummyWinsys::new());
        let device = Device::new(ws, DeviceCaps::default(), DeviceOptions::default());
        assert_eq!(device.shader_upload_seq(), 0);
        assert_eq!(device.bump_shader_upload_seq(), 1);
        assert_eq!(device.bump_shader_upload_seq(), 2);
        assert_eq!(device.shader_upload_seq(), 2);
    }
}
