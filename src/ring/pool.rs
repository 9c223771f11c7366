//! Per-queue ring resource pool.
//!
//! Owns every auxiliary GPU buffer a hardware queue needs (scratch, shader
//! interconnect rings, GDS allocations), the packed descriptor buffer and
//! the three cached preamble sequences. The pool grows monotonically and
//! never shrinks within a queue's lifetime.
//!
//! The central correctness property lives in [`RingPool::ensure`]: a
//! two-phase "build new, commit, free old" update. New resources accumulate
//! in locals that free themselves on drop, so every early-return error path
//! rolls back automatically and the queue is never observed half-updated.

use crate::device::Device;
use crate::error::SubmitResult;
use crate::ring::preamble::{self, PoolView, PreambleSet, DESC_BUFFER_SIZE};
use crate::ring::requirement::RingRequirement;
use crate::winsys::{
    BufferDesc, BufferDomain, BufferFlags, BufferId, BufferRef, EngineType, RingBuffer,
};

/// Fixed tessellation-factor + offchip ring size.
pub const TESS_RING_SIZE: u64 = 64 * 1024;
/// Fixed task-shader draw/payload ring size.
pub const TASK_RING_SIZE: u64 = 256 * 1024;
/// Fixed mesh-shader scratch size.
pub const MESH_SCRATCH_SIZE: u64 = 1 << 20;
/// GDS allocation for cross-wave counters.
pub const GDS_SIZE: u64 = 256;
/// GDS ordered-append allocation.
pub const GDS_OA_SIZE: u64 = 4;

/// Ring resource pool, owned by exactly one logical hardware queue.
pub struct RingPool {
    kind: EngineType,
    ring_info: RingRequirement,
    // Preambles and the descriptor buffer are declared before the ring
    // buffers: drop order must destroy the sequences that reference the
    // rings before the rings themselves.
    preambles: Option<PreambleSet>,
    descriptor: Option<RingBuffer>,
    scratch: Option<RingBuffer>,
    compute_scratch: Option<RingBuffer>,
    esgs: Option<RingBuffer>,
    gsvs: Option<RingBuffer>,
    tess: Option<RingBuffer>,
    /// Owned task ring; present only on a gang leader's pool.
    task: Option<RingBuffer>,
    /// Non-owning view of a leader's task ring; present only on a gang
    /// follower's pool. Must be cleared before the follower is torn down.
    shared_task: Option<BufferRef>,
    mesh_scratch: Option<RingBuffer>,
    attribute: Option<RingBuffer>,
    gds: Option<RingBuffer>,
    gds_oa: Option<RingBuffer>,
}

/// New resources staged by `ensure` before the commit point. Dropping this
/// struct on an error path returns every staged buffer to the winsys.
struct Staged {
    scratch: Option<RingBuffer>,
    compute_scratch: Option<RingBuffer>,
    esgs: Option<RingBuffer>,
    gsvs: Option<RingBuffer>,
    tess: Option<RingBuffer>,
    task: Option<RingBuffer>,
    mesh_scratch: Option<RingBuffer>,
    attribute: Option<RingBuffer>,
    gds: Option<RingBuffer>,
    gds_oa: Option<RingBuffer>,
}

fn pick(staged: &Option<RingBuffer>, current: &Option<RingBuffer>) -> Option<BufferRef> {
    staged
        .as_ref()
        .or(current.as_ref())
        .map(RingBuffer::as_ref)
}

fn commit(slot: &mut Option<RingBuffer>, staged: Option<RingBuffer>) {
    if let Some(new) = staged {
        // Assignment frees the displaced old buffer immediately.
        *slot = Some(new);
    }
}

impl RingPool {
    /// Create an empty pool for a queue of the given kind.
    pub fn new(kind: EngineType) -> Self {
        Self {
            kind,
            ring_info: RingRequirement::default(),
            preambles: None,
            descriptor: None,
            scratch: None,
            compute_scratch: None,
            esgs: None,
            gsvs: None,
            tess: None,
            task: None,
            shared_task: None,
            mesh_scratch: None,
            attribute: None,
            gds: None,
            gds_oa: None,
        }
    }

    pub fn kind(&self) -> EngineType {
        self.kind
    }

    /// The requirement this pool currently satisfies.
    pub fn current(&self) -> &RingRequirement {
        &self.ring_info
    }

    pub fn preambles(&self) -> Option<&PreambleSet> {
        self.preambles.as_ref()
    }

    pub fn scratch(&self) -> Option<BufferRef> {
        self.scratch.as_ref().map(RingBuffer::as_ref)
    }

    pub fn compute_scratch(&self) -> Option<BufferRef> {
        self.compute_scratch.as_ref().map(RingBuffer::as_ref)
    }

    pub fn esgs(&self) -> Option<BufferRef> {
        self.esgs.as_ref().map(RingBuffer::as_ref)
    }

    pub fn gsvs(&self) -> Option<BufferRef> {
        self.gsvs.as_ref().map(RingBuffer::as_ref)
    }

    pub fn tess(&self) -> Option<BufferRef> {
        self.tess.as_ref().map(RingBuffer::as_ref)
    }

    /// The task ring visible to this pool: owned on a leader, borrowed
    /// from the leader on a follower.
    pub fn task(&self) -> Option<BufferRef> {
        self.task
            .as_ref()
            .map(RingBuffer::as_ref)
            .or(self.shared_task)
    }

    pub fn mesh_scratch(&self) -> Option<BufferRef> {
        self.mesh_scratch.as_ref().map(RingBuffer::as_ref)
    }

    pub fn attribute(&self) -> Option<BufferRef> {
        self.attribute.as_ref().map(RingBuffer::as_ref)
    }

    pub fn gds(&self) -> Option<BufferRef> {
        self.gds.as_ref().map(RingBuffer::as_ref)
    }

    pub fn gds_oa(&self) -> Option<BufferRef> {
        self.gds_oa.as_ref().map(RingBuffer::as_ref)
    }

    pub fn descriptor(&self) -> Option<BufferRef> {
        self.descriptor.as_ref().map(RingBuffer::as_ref)
    }

    /// Adopt a non-owning view of a leader pool's task ring. Only valid on
    /// a follower pool, which never owns a task ring of its own.
    pub fn set_shared_task(&mut self, task: BufferRef) {
        debug_assert!(self.task.is_none());
        self.shared_task = Some(task);
    }

    /// Drop the borrowed task-ring view. Called before follower teardown
    /// so the follower can never outlive-reference the leader's buffer.
    pub fn clear_shared_task(&mut self) {
        self.shared_task = None;
    }

    /// Ids of every live ring buffer, for submit-time residency lists.
    pub fn ring_buffer_ids(&self) -> Vec<BufferId> {
        [
            self.scratch.as_ref(),
            self.compute_scratch.as_ref(),
            self.esgs.as_ref(),
            self.gsvs.as_ref(),
            self.tess.as_ref(),
            self.task.as_ref(),
            self.mesh_scratch.as_ref(),
            self.attribute.as_ref(),
            self.gds.as_ref(),
            self.gds_oa.as_ref(),
            self.descriptor.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(RingBuffer::id)
        .chain(self.shared_task.map(|t| t.id))
        .collect()
    }

    /// Grow the pool to satisfy `req`.
    ///
    /// Returns `Ok(false)` without touching the winsys when the current
    /// state already satisfies the requirement. Otherwise allocates a new
    /// buffer for every resource kind that grew, rebuilds the descriptor
    /// buffer and the three preambles against the new buffers, and only
    /// then commits: old sequences and displaced buffers are freed after
    /// everything new exists. Any failure leaves `self` untouched.
    pub fn ensure(&mut self, device: &Device, req: &RingRequirement) -> SubmitResult<bool> {
        // The first ensure always builds, even against an empty
        // requirement: the queue needs preambles and a descriptor buffer
        // before anything can be submitted.
        if self.preambles.is_some() && !req.grows_beyond(&self.ring_info) {
            return Ok(false);
        }
        log::debug!(
            "{:?} ring pool grows: {:?} -> {:?}",
            self.kind,
            self.ring_info,
            req
        );

        let staged = self.stage_buffers(device, req)?;

        // Fresh descriptor buffer, pointing at the post-commit ring set.
        let descriptor = RingBuffer::new(
            device.winsys(),
            &BufferDesc {
                size: DESC_BUFFER_SIZE,
                alignment: device.caps().ring_alignment,
                domain: BufferDomain::Gtt,
                flags: BufferFlags::CPU_ACCESS
                    | BufferFlags::ZEROED
                    | BufferFlags::ADDRESS_32BIT
                    | BufferFlags::NO_INTERPROCESS_SHARING,
                label: "ring descriptors",
            },
        )?;

        let view = PoolView {
            req,
            kind: self.kind,
            scratch: pick(&staged.scratch, &self.scratch),
            compute_scratch: pick(&staged.compute_scratch, &self.compute_scratch),
            esgs: pick(&staged.esgs, &self.esgs),
            gsvs: pick(&staged.gsvs, &self.gsvs),
            tess: pick(&staged.tess, &self.tess),
            task: pick(&staged.task, &self.task).or(self.shared_task),
            mesh_scratch: pick(&staged.mesh_scratch, &self.mesh_scratch),
            attribute: pick(&staged.attribute, &self.attribute),
            descriptor: descriptor.as_ref(),
        };
        descriptor.write(0, &preamble::build_descriptor_contents(&view))?;
        let preambles = preamble::build(device, &view)?;

        // Commit point: nothing below can fail. Old sequences and the old
        // descriptor buffer go first, then each displaced ring buffer.
        self.preambles = Some(preambles);
        self.descriptor = Some(descriptor);
        self.ring_info = *req;
        commit(&mut self.scratch, staged.scratch);
        commit(&mut self.compute_scratch, staged.compute_scratch);
        commit(&mut self.esgs, staged.esgs);
        commit(&mut self.gsvs, staged.gsvs);
        commit(&mut self.tess, staged.tess);
        commit(&mut self.task, staged.task);
        commit(&mut self.mesh_scratch, staged.mesh_scratch);
        commit(&mut self.attribute, staged.attribute);
        commit(&mut self.gds, staged.gds);
        commit(&mut self.gds_oa, staged.gds_oa);
        Ok(true)
    }

    /// Allocate a new buffer for every resource kind whose requirement
    /// grew past the current allocation.
    fn stage_buffers(&self, device: &Device, req: &RingRequirement) -> SubmitResult<Staged> {
        let vram = BufferFlags::DISCARDABLE | BufferFlags::NO_INTERPROCESS_SHARING;
        Ok(Staged {
            scratch: self.grow(device, &self.scratch, req.scratch_bytes(), "scratch", vram)?,
            compute_scratch: self.grow(
                device,
                &self.compute_scratch,
                req.compute_scratch_bytes(),
                "compute scratch",
                vram,
            )?,
            esgs: self.grow(device, &self.esgs, req.esgs_ring_bytes as u64, "esgs ring", vram)?,
            gsvs: self.grow(device, &self.gsvs, req.gsvs_ring_bytes as u64, "gsvs ring", vram)?,
            tess: self.grow(
                device,
                &self.tess,
                if req.needs_tess_rings { TESS_RING_SIZE } else { 0 },
                "tess rings",
                vram,
            )?,
            // A follower never allocates a task ring; it borrows the
            // leader's through `shared_task`.
            task: if self.shared_task.is_none() {
                self.grow(
                    device,
                    &self.task,
                    if req.needs_task_rings { TASK_RING_SIZE } else { 0 },
                    "task rings",
                    vram | BufferFlags::ZEROED,
                )?
            } else {
                None
            },
            mesh_scratch: self.grow(
                device,
                &self.mesh_scratch,
                if req.needs_mesh_scratch { MESH_SCRATCH_SIZE } else { 0 },
                "mesh scratch",
                vram,
            )?,
            attribute: self.grow(
                device,
                &self.attribute,
                req.attribute_ring_bytes as u64,
                "attribute ring",
                vram,
            )?,
            gds: self.grow_in(
                device,
                &self.gds,
                if req.needs_gds { GDS_SIZE } else { 0 },
                "gds",
                BufferDomain::Gds,
                BufferFlags::NO_INTERPROCESS_SHARING,
            )?,
            gds_oa: self.grow_in(
                device,
                &self.gds_oa,
                if req.needs_gds_oa { GDS_OA_SIZE } else { 0 },
                "gds oa",
                BufferDomain::GdsOa,
                BufferFlags::NO_INTERPROCESS_SHARING,
            )?,
        })
    }

    fn grow(
        &self,
        device: &Device,
        current: &Option<RingBuffer>,
        needed: u64,
        label: &'static str,
        flags: BufferFlags,
    ) -> SubmitResult<Option<RingBuffer>> {
        self.grow_in(device, current, needed, label, BufferDomain::Vram, flags)
    }

    fn grow_in(
        &self,
        device: &Device,
        current: &Option<RingBuffer>,
        needed: u64,
        label: &'static str,
        domain: BufferDomain,
        flags: BufferFlags,
    ) -> SubmitResult<Option<RingBuffer>> {
        let have = current.as_ref().map_or(0, RingBuffer::size);
        if needed == 0 || needed <= have {
            return Ok(None);
        }
        // GPU buffers are immutable-size: always a fresh allocation, never
        // a resize in place. The old buffer stays live until commit.
        RingBuffer::new(
            device.winsys(),
            &BufferDesc {
                size: needed,
                alignment: device.caps().ring_alignment,
                domain,
                flags,
                label,
            },
        )
        .map(Some)
    }
}

impl std::fmt::Debug for RingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPool")
            .field("kind", &self.kind)
            .field("ring_info", &self.ring_info)
            .field("live_buffers", &self.ring_buffer_ids().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{DeviceCaps, DeviceOptions};
    use crate::winsys::dummy::DummyWinsys;
    use crate::winsys::Winsys;

    fn device_on(ws: &Arc<DummyWinsys>) -> Arc<Device> {
        let dyn_ws: Arc<dyn Winsys> = ws.clone();
        Device::new(dyn_ws, DeviceCaps::default(), DeviceOptions::default())
    }

    fn esgs_req(bytes: u32) -> RingRequirement {
        RingRequirement {
            esgs_ring_bytes: bytes,
            ..Default::default()
        }
    }

    #[test]
    fn noop_ensure_makes_zero_winsys_calls() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);

        assert!(pool.ensure(&device, &esgs_req(4096)).unwrap());
        let allocs = ws.total_alloc_count();
        assert!(!pool.ensure(&device, &esgs_req(4096)).unwrap());
        assert!(!pool.ensure(&device, &RingRequirement::default()).unwrap());
        assert_eq!(ws.total_alloc_count(), allocs);
    }

    #[test]
    fn failed_allocation_leaves_pool_untouched() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);
        pool.ensure(&device, &esgs_req(4096)).unwrap();

        let before_info = *pool.current();
        let before_esgs = pool.esgs();
        let before_live = ws.live_buffer_count();
        let before_streams = ws.live_stream_count();

        let mut bigger = esgs_req(8192);
        bigger.needs_tess_rings = true;
        // Two allocations will be attempted (esgs, tess); fail the second.
        ws.fail_next_allocs(2);
        assert_eq!(
            pool.ensure(&device, &bigger),
            Err(crate::error::SubmitError::OutOfDeviceMemory)
        );

        assert_eq!(*pool.current(), before_info);
        assert_eq!(pool.esgs(), before_esgs);
        assert!(pool.tess().is_none());
        assert_eq!(ws.live_buffer_count(), before_live);
        assert_eq!(ws.live_stream_count(), before_streams);
    }

    #[test]
    fn failed_preamble_build_leaves_pool_untouched() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);
        pool.ensure(&device, &esgs_req(4096)).unwrap();

        let before_info = *pool.current();
        let before_esgs = pool.esgs();
        let before_preamble = pool.preambles().unwrap().resume.id();
        let before_live = ws.live_buffer_count();
        let before_streams = ws.live_stream_count();

        // The grown ring and the fresh descriptor allocate fine; the first
        // preamble sequence does not.
        ws.fail_next_cs_creates(1);
        assert_eq!(
            pool.ensure(&device, &esgs_req(8192)),
            Err(crate::error::SubmitError::OutOfHostMemory)
        );

        assert_eq!(*pool.current(), before_info);
        assert_eq!(pool.esgs(), before_esgs);
        assert_eq!(pool.preambles().unwrap().resume.id(), before_preamble);
        assert_eq!(ws.live_buffer_count(), before_live);
        assert_eq!(ws.live_stream_count(), before_streams);

        // The pool is still usable for a retry.
        pool.ensure(&device, &esgs_req(8192)).unwrap();
        assert_eq!(pool.esgs().unwrap().size, 8192);
    }

    #[test]
    fn minimal_rebuild_replaces_only_grown_kinds() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);

        let mut req = esgs_req(4096);
        req.gsvs_ring_bytes = 2048;
        pool.ensure(&device, &req).unwrap();
        let gsvs_before = pool.gsvs().unwrap();
        let esgs_before = pool.esgs().unwrap();

        req.esgs_ring_bytes = 8192;
        pool.ensure(&device, &req).unwrap();
        assert_ne!(pool.esgs().unwrap().id, esgs_before.id);
        assert_eq!(pool.gsvs().unwrap(), gsvs_before);
    }

    #[test]
    fn old_buffer_freed_only_after_commit() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);

        pool.ensure(&device, &esgs_req(4096)).unwrap();
        // esgs + descriptor alive.
        assert_eq!(ws.live_buffer_count(), 2);
        assert_eq!(ws.live_stream_count(), 3);

        pool.ensure(&device, &esgs_req(8192)).unwrap();
        // Grown esgs and fresh descriptor; the 4096-byte ring was freed
        // after the new one and the new preambles existed.
        assert_eq!(ws.live_buffer_count(), 2);
        assert_eq!(ws.live_stream_count(), 3);
        assert_eq!(pool.esgs().unwrap().size, 8192);
    }

    #[test]
    fn sticky_flag_allocates_fixed_size_rings() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);

        let mut req = RingRequirement::default();
        req.needs_tess_rings = true;
        req.needs_gds = true;
        req.needs_gds_oa = true;
        assert!(pool.ensure(&device, &req).unwrap());
        assert_eq!(pool.tess().unwrap().size, TESS_RING_SIZE);
        assert_eq!(pool.gds().unwrap().size, GDS_SIZE);
        assert_eq!(pool.gds_oa().unwrap().size, GDS_OA_SIZE);

        // Same flags again: satisfied, no rebuild.
        assert!(!pool.ensure(&device, &req).unwrap());
    }

    #[test]
    fn follower_never_allocates_borrowed_task_ring() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);

        let mut leader = RingPool::new(EngineType::Graphics);
        let mut leader_req = RingRequirement::default();
        leader_req.needs_task_rings = true;
        leader.ensure(&device, &leader_req).unwrap();
        let task = leader.task().unwrap();

        let mut follower = RingPool::new(EngineType::Compute);
        follower.set_shared_task(task);
        let mut follower_req = RingRequirement::default();
        follower_req.needs_task_rings = true;
        follower.ensure(&device, &follower_req).unwrap();

        assert_eq!(follower.task().unwrap(), task);
        // The borrowed ring shows up in residency lists but is not freed
        // by the follower.
        assert!(follower.ring_buffer_ids().contains(&task.id));
        follower.clear_shared_task();
        drop(follower);
        assert_eq!(leader.task().unwrap(), task);
    }

    #[test]
    fn pool_drop_frees_everything() {
        let ws = Arc::new(DummyWinsys::new());
        let device = device_on(&ws);
        let mut pool = RingPool::new(EngineType::Graphics);
        let mut req = esgs_req(4096);
        req.needs_tess_rings = true;
        pool.ensure(&device, &req).unwrap();
        assert!(ws.live_buffer_count() > 0);
        drop(pool);
        assert_eq!(ws.live_buffer_count(), 0);
        assert_eq!(ws.live_stream_count(), 0);
    }
}
