//! Gang submission coordination.
//!
//! A gang submission runs one logical unit of work across the graphics
//! engine (leader) and the async-compute engine (follower). Start and
//! completion ordering is enforced purely through GPU-visible memory: an
//! 8-byte semaphore buffer polled and written by the command processors,
//! with no CPU involvement in steady state.
//!
//! Word 0 gates the start: the follower spins until the leader announces
//! it has started, then rearms the word. Word 1 gates completion: the
//! kernel fence the application observes is tied to the leader, so the
//! leader must spin until the follower's end-of-pipe event lands before
//! it is allowed to retire. Without word 1 the leader could be reported
//! complete while the follower still executes, corrupting shared
//! resources such as the borrowed task ring.

use crate::device::Device;
use crate::error::SubmitResult;
use crate::hw;
use crate::ring::requirement::RingRequirement;
use crate::ring::RingPool;
use crate::winsys::{BufferDesc, BufferDomain, BufferFlags, CmdStream, EngineType, RingBuffer};

/// Cross-engine handshake state for one queue. Built lazily on the first
/// gang submission and reused unchanged for every subsequent one.
#[derive(Debug)]
pub struct GangLink {
    /// 8 bytes: word 0 = "leader started", word 1 = "follower finished".
    sem: RingBuffer,
    leader_pre: CmdStream,
    leader_post: CmdStream,
    follower_pre: CmdStream,
    follower_post: CmdStream,
}

impl GangLink {
    fn new(device: &Device) -> SubmitResult<Self> {
        let ws = device.winsys();
        let sem = RingBuffer::new(
            ws,
            &BufferDesc {
                size: 8,
                alignment: 8,
                domain: BufferDomain::Gtt,
                flags: BufferFlags::ZEROED | BufferFlags::NO_INTERPROCESS_SHARING,
                label: "gang semaphore",
            },
        )?;
        let started_va = sem.va();
        let finished_va = sem.va() + 4;

        let mut words = Vec::new();
        hw::emit_write_mem(&mut words, started_va, 1);
        let leader_pre = CmdStream::new(ws, EngineType::Graphics, &words)?;

        words.clear();
        hw::emit_wait_mem_ge(&mut words, started_va, 1);
        // Rearm for the next gang submission on this queue.
        hw::emit_write_mem(&mut words, started_va, 0);
        let follower_pre = CmdStream::new(ws, EngineType::Compute, &words)?;

        words.clear();
        hw::emit_wait_mem_ge(&mut words, finished_va, 1);
        hw::emit_write_mem(&mut words, finished_va, 0);
        let leader_post = CmdStream::new(ws, EngineType::Graphics, &words)?;

        words.clear();
        hw::emit_release_mem(&mut words, finished_va, 1);
        let follower_post = CmdStream::new(ws, EngineType::Compute, &words)?;

        log::debug!("built gang link, semaphore at {:#x}", sem.va());
        Ok(Self {
            sem,
            leader_pre,
            leader_post,
            follower_pre,
            follower_post,
        })
    }

    pub fn semaphore_va(&self) -> u64 {
        self.sem.va()
    }

    /// Leader sequence: announce the gang has started.
    pub fn leader_pre(&self) -> &CmdStream {
        &self.leader_pre
    }

    /// Leader sequence: spin until the follower has retired, then rearm.
    pub fn leader_post(&self) -> &CmdStream {
        &self.leader_post
    }

    /// Follower sequence: spin until the leader has started, then rearm.
    pub fn follower_pre(&self) -> &CmdStream {
        &self.follower_pre
    }

    /// Follower sequence: end-of-pipe event marking follower completion.
    pub fn follower_post(&self) -> &CmdStream {
        &self.follower_post
    }
}

/// Requirement the follower pool is ensured against, synthesized from the
/// leader's needs. Task shaders execute with the leader's graphics scratch
/// budget rather than a compute-specific one; that is a hardware quirk,
/// not a simplification.
pub fn follower_requirement(leader: &RingRequirement) -> RingRequirement {
    RingRequirement {
        compute_scratch_bytes_per_wave: leader
            .scratch_bytes_per_wave
            .max(leader.compute_scratch_bytes_per_wave),
        compute_scratch_wave_count: leader
            .scratch_wave_count
            .max(leader.compute_scratch_wave_count),
        needs_tess_rings: leader.needs_tess_rings,
        needs_task_rings: leader.needs_task_rings,
        ..Default::default()
    }
}

/// Make `follower` satisfy the leader's synthesized requirement, sharing
/// the leader's task ring by non-owning reference, and build the gang
/// handshake if this queue does not have one yet. Idempotent: an existing
/// `link` is reused without reallocation.
///
/// Returns whether the follower pool was rebuilt; the caller must treat a
/// rebuilt follower like a rebuilt leader when selecting the preamble
/// variant.
pub fn ensure_gang(
    device: &Device,
    leader: &RingPool,
    follower: &mut RingPool,
    link: &mut Option<GangLink>,
) -> SubmitResult<bool> {
    if follower.task().is_none() {
        if let Some(task) = leader.task() {
            follower.set_shared_task(task);
        }
    }
    let req = follower_requirement(leader.current());
    let rebuilt = follower.ensure(device, &req)?;
    if link.is_none() {
        *link = Some(GangLink::new(device)?);
    }
    Ok(rebuilt)
}
