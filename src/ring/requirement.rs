//! Ring and scratch requirement sizing.
//!
//! Pure sizing logic: given the resource-usage hints of every command
//! buffer in a submission, compute the maximal ring/scratch requirement.
//! Sizing always starts from the queue's current requirement, which is
//! what makes the pool grow-only across a whole submission sequence.

use crate::device::Device;
use crate::winsys::EngineType;

/// Per-submission ring and scratch requirement.
///
/// Numeric fields only ever grow for a given queue; boolean flags are
/// sticky and never revert to `false` once set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingRequirement {
    pub scratch_bytes_per_wave: u32,
    pub scratch_wave_count: u32,
    pub compute_scratch_bytes_per_wave: u32,
    pub compute_scratch_wave_count: u32,
    pub esgs_ring_bytes: u32,
    pub gsvs_ring_bytes: u32,
    pub attribute_ring_bytes: u32,
    pub needs_tess_rings: bool,
    pub needs_task_rings: bool,
    pub needs_mesh_scratch: bool,
    pub needs_gds: bool,
    pub needs_gds_oa: bool,
    pub needs_sample_positions: bool,
}

impl RingRequirement {
    /// Field-wise maximum for numeric fields, OR for flags.
    pub fn merge_max(&mut self, other: &RingRequirement) {
        self.scratch_bytes_per_wave = self.scratch_bytes_per_wave.max(other.scratch_bytes_per_wave);
        self.scratch_wave_count = self.scratch_wave_count.max(other.scratch_wave_count);
        self.compute_scratch_bytes_per_wave = self
            .compute_scratch_bytes_per_wave
            .max(other.compute_scratch_bytes_per_wave);
        self.compute_scratch_wave_count = self
            .compute_scratch_wave_count
            .max(other.compute_scratch_wave_count);
        self.esgs_ring_bytes = self.esgs_ring_bytes.max(other.esgs_ring_bytes);
        self.gsvs_ring_bytes = self.gsvs_ring_bytes.max(other.gsvs_ring_bytes);
        self.attribute_ring_bytes = self.attribute_ring_bytes.max(other.attribute_ring_bytes);
        self.needs_tess_rings |= other.needs_tess_rings;
        self.needs_task_rings |= other.needs_task_rings;
        self.needs_mesh_scratch |= other.needs_mesh_scratch;
        self.needs_gds |= other.needs_gds;
        self.needs_gds_oa |= other.needs_gds_oa;
        self.needs_sample_positions |= other.needs_sample_positions;
    }

    /// Whether satisfying `self` requires more than `old` provides: any
    /// numeric field grew or any flag newly turned on.
    pub fn grows_beyond(&self, old: &RingRequirement) -> bool {
        self.scratch_bytes_per_wave > old.scratch_bytes_per_wave
            || self.scratch_wave_count > old.scratch_wave_count
            || self.compute_scratch_bytes_per_wave > old.compute_scratch_bytes_per_wave
            || self.compute_scratch_wave_count > old.compute_scratch_wave_count
            || self.esgs_ring_bytes > old.esgs_ring_bytes
            || self.gsvs_ring_bytes > old.gsvs_ring_bytes
            || self.attribute_ring_bytes > old.attribute_ring_bytes
            || (self.needs_tess_rings && !old.needs_tess_rings)
            || (self.needs_task_rings && !old.needs_task_rings)
            || (self.needs_mesh_scratch && !old.needs_mesh_scratch)
            || (self.needs_gds && !old.needs_gds)
            || (self.needs_gds_oa && !old.needs_gds_oa)
            || (self.needs_sample_positions && !old.needs_sample_positions)
    }

    /// Graphics scratch size in bytes.
    pub fn scratch_bytes(&self) -> u64 {
        self.scratch_bytes_per_wave as u64 * self.scratch_wave_count as u64
    }

    /// Compute scratch size in bytes.
    pub fn compute_scratch_bytes(&self) -> u64 {
        self.compute_scratch_bytes_per_wave as u64 * self.compute_scratch_wave_count as u64
    }
}

/// Process-wide worst-case compute-scratch requirement, shared by every
/// queue of a device behind an `Arc<Mutex<_>>`.
///
/// Written whenever a larger indirect-dispatch requirement is discovered
/// elsewhere in the driver; read by sizing when indirect compute
/// pipelines are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeScratchBudget {
    pub bytes_per_wave: u32,
    pub wave_count: u32,
}

impl ComputeScratchBudget {
    /// Raise the tracked worst case. Never lowers either field.
    pub fn raise(&mut self, bytes_per_wave: u32, wave_count: u32) {
        self.bytes_per_wave = self.bytes_per_wave.max(bytes_per_wave);
        self.wave_count = self.wave_count.max(wave_count);
    }
}

fn clamp_waves(bytes_per_wave: u32, wave_count: u32, max_waves: u32) -> u32 {
    if bytes_per_wave == 0 {
        // No spill space requested: a non-zero wave count would program
        // scratch waves against a null base.
        return 0;
    }
    // bytes_per_wave * wave_count must stay representable.
    wave_count.min(max_waves).min(u32::MAX / bytes_per_wave)
}

/// Compute the requirement for one submission.
///
/// Starts from `current` (never from zero), takes the field-wise maximum
/// over `hints`, then applies the device-level adjustments: the shared
/// indirect-compute scratch budget, the fixed attribute-ring size on
/// generations that have one, and the wave-count clamps.
///
/// Pure given its inputs; safe to call with no hints, in which case only
/// the device-level adjustments apply to `current`.
pub fn compute_requirement<'a, I>(
    current: RingRequirement,
    hints: I,
    device: &Device,
    queue_kind: EngineType,
) -> RingRequirement
where
    I: IntoIterator<Item = &'a RingRequirement>,
{
    let mut req = current;
    for hint in hints {
        req.merge_max(hint);
    }

    if device.options().indirect_compute_pipelines {
        // Indirectly-bound pipelines can dispatch anything uploaded so
        // far; both fields use the device-tracked worst case.
        let budget = *device.scratch_budget().lock();
        req.compute_scratch_bytes_per_wave =
            req.compute_scratch_bytes_per_wave.max(budget.bytes_per_wave);
        req.compute_scratch_wave_count = req.compute_scratch_wave_count.max(budget.wave_count);
    }

    let generation = device.caps().generation;
    if generation.has_attribute_ring() && queue_kind == EngineType::Graphics {
        req.attribute_ring_bytes = generation.attribute_ring_bytes();
    }

    let max_waves = device.caps().max_scratch_waves;
    req.scratch_wave_count = clamp_waves(
        req.scratch_bytes_per_wave,
        req.scratch_wave_count,
        max_waves,
    );
    req.compute_scratch_wave_count = clamp_waves(
        req.compute_scratch_bytes_per_wave,
        req.compute_scratch_wave_count,
        max_waves,
    );

    req
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{DeviceCaps, DeviceOptions};
    use crate::hw::HwGeneration;
    use crate::winsys::dummy::DummyWinsys;
    use crate::winsys::Winsys;

    fn device(caps: DeviceCaps, options: DeviceOptions) -> Arc<Device> {
        let ws: Arc<dyn Winsys> = Arc::new(DummyWinsys::new());
        Device::new(ws, caps, options)
    }

    #[test]
    fn no_hints_returns_current() {
        let dev = device(DeviceCaps::default(), DeviceOptions::default());
        let current = RingRequirement {
            esgs_ring_bytes: 4096,
            needs_tess_rings: true,
            ..Default::default()
        };
        let req = compute_requirement(current, [], &dev, EngineType::Graphics);
        assert_eq!(req, current);
    }

    #[test]
    fn merge_takes_max_and_sticky_flags() {
        let dev = device(DeviceCaps::default(), DeviceOptions::default());
        let current = RingRequirement {
            esgs_ring_bytes: 8192,
            needs_gds: true,
            ..Default::default()
        };
        let hint = RingRequirement {
            esgs_ring_bytes: 4096,
            gsvs_ring_bytes: 2048,
            needs_tess_rings: true,
            ..Default::default()
        };
        let req = compute_requirement(current, [&hint], &dev, EngineType::Graphics);
        assert_eq!(req.esgs_ring_bytes, 8192);
        assert_eq!(req.gsvs_ring_bytes, 2048);
        assert!(req.needs_gds);
        assert!(req.needs_tess_rings);
    }

    #[test]
    fn zero_bytes_per_wave_forces_zero_waves() {
        let dev = device(DeviceCaps::default(), DeviceOptions::default());
        let hint = RingRequirement {
            scratch_wave_count: 128,
            ..Default::default()
        };
        let req = compute_requirement(
            RingRequirement::default(),
            [&hint],
            &dev,
            EngineType::Graphics,
        );
        assert_eq!(req.scratch_wave_count, 0);
    }

    #[test]
    fn wave_count_clamped_against_overflow() {
        let dev = device(DeviceCaps::default(), DeviceOptions::default());
        let hint = RingRequirement {
            scratch_bytes_per_wave: u32::MAX / 2,
            scratch_wave_count: 100,
            ..Default::default()
        };
        let req = compute_requirement(
            RingRequirement::default(),
            [&hint],
            &dev,
            EngineType::Graphics,
        );
        assert!(req.scratch_bytes() <= u32::MAX as u64);
        assert_eq!(req.scratch_wave_count, 2);
    }

    #[test]
    fn indirect_compute_raises_to_budget() {
        let dev = device(
            DeviceCaps::default(),
            DeviceOptions {
                indirect_compute_pipelines: true,
                ..Default::default()
            },
        );
        dev.scratch_budget().lock().raise(2048, 512);
        let req = compute_requirement(
            RingRequirement::default(),
            [],
            &dev,
            EngineType::Compute,
        );
        assert_eq!(req.compute_scratch_bytes_per_wave, 2048);
        assert_eq!(req.compute_scratch_wave_count, 512);
    }

    #[test]
    fn attribute_ring_forced_on_graphics_only() {
        let caps = DeviceCaps {
            generation: HwGeneration::Gfx11,
            ..Default::default()
        };
        let dev = device(caps, DeviceOptions::default());
        let gfx = compute_requirement(
            RingRequirement::default(),
            [],
            &dev,
            EngineType::Graphics,
        );
        assert_eq!(
            gfx.attribute_ring_bytes,
            HwGeneration::Gfx11.attribute_ring_bytes()
        );
        let cmp = compute_requirement(
            RingRequirement::default(),
            [],
            &dev,
            EngineType::Compute,
        );
        assert_eq!(cmp.attribute_ring_bytes, 0);
    }

    #[test]
    fn grows_beyond_detects_new_flag_only() {
        let old = RingRequirement {
            esgs_ring_bytes: 4096,
            ..Default::default()
        };
        let same = old;
        assert!(!same.grows_beyond(&old));
        let mut flagged = old;
        flagged.needs_task_rings = true;
        assert!(flagged.grows_beyond(&old));
    }
}
