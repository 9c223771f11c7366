//! Per-queue submission driver.
//!
//! One [`Queue`] per logical hardware queue. Each [`Queue::submit`] call
//! sizes ring requirements over the batch, grows the pool if needed,
//! selects the preamble variant, chains the user command buffers, wires up
//! the gang handshake when an async-compute companion is present, and
//! performs the winsys submit.
//!
//! Failure policy: allocation failures out of the pool are recoverable and
//! returned as-is (pool state is untouched). Submit failures are not
//! retried; the CPU cannot tell how far a faulted batch executed, so they
//! escalate to a terminal device-lost.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::Device;
use crate::error::{SubmitError, SubmitResult};
use crate::gang::{self, GangLink};
use crate::ring::requirement::compute_requirement;
use crate::ring::{RingPool, RingRequirement};
use crate::sparse::{self, SparseBindInfo};
use crate::winsys::{CsId, EngineType, SubmitRequest, SyncId};

/// One recorded command buffer, as handed over by the recorder.
#[derive(Debug, Clone)]
pub struct CmdBuf {
    /// Finalized command stream; owned by the recorder.
    pub cs: CsId,
    /// Async-compute companion stream, when the buffer uses task shaders
    /// or other gang work.
    pub follower_cs: Option<CsId>,
    /// Resource-usage hints gathered while recording.
    pub rings: RingRequirement,
    /// Recorded for simultaneous use: its end may not be patched into a
    /// jump, so it cannot be chained into a successor.
    pub simultaneous_use: bool,
    /// Highest shader-upload sequence number this buffer references.
    pub upload_seq: u64,
}

/// One submission batch.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub cmd_bufs: Vec<CmdBuf>,
    pub waits: Vec<SyncId>,
    pub signals: Vec<SyncId>,
    pub sparse_binds: Vec<SparseBindInfo>,
}

impl Submission {
    fn is_sparse_bind_only(&self) -> bool {
        self.cmd_bufs.is_empty() && self.waits.is_empty() && self.signals.is_empty()
    }
}

/// Preamble variant selected for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleKind {
    FullFlush,
    Initial,
    Resume,
}

/// A logical hardware queue.
pub struct Queue {
    device: Arc<Device>,
    kind: EngineType,
    pool: RingPool,
    /// Ring pool of the async-compute companion queue; created on the
    /// first gang submission.
    follower_pool: Option<RingPool>,
    gang: Option<GangLink>,
    /// Shader-upload sequence number this queue last synchronized with.
    uploads_seen: u64,
    /// The pool was rebuilt and no submission has run against it yet.
    pending_rebuild: bool,
}

impl Queue {
    pub fn new(device: &Arc<Device>, kind: EngineType) -> Self {
        Self {
            device: Arc::clone(device),
            kind,
            pool: RingPool::new(kind),
            follower_pool: None,
            gang: None,
            uploads_seen: 0,
            pending_rebuild: false,
        }
    }

    pub fn kind(&self) -> EngineType {
        self.kind
    }

    pub fn pool(&self) -> &RingPool {
        &self.pool
    }

    pub fn follower_pool(&self) -> Option<&RingPool> {
        self.follower_pool.as_ref()
    }

    pub fn gang(&self) -> Option<&GangLink> {
        self.gang.as_ref()
    }

    /// Submit one batch.
    ///
    /// Sparse binds are applied first; a batch with only binds never
    /// touches the ring pools. A batch with semaphores but no command
    /// buffers submits an empty job that just carries the wait/signal
    /// lists.
    pub fn submit(&mut self, submission: &Submission) -> SubmitResult<()> {
        if self.device.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        for info in &submission.sparse_binds {
            sparse::bind_sparse(&self.device, info)?;
        }
        if submission.is_sparse_bind_only() {
            return Ok(());
        }

        if submission.cmd_bufs.is_empty() {
            // Semaphore-only: chain dependencies with no GPU work.
            let request = SubmitRequest {
                waits: submission.waits.clone(),
                signals: submission.signals.clone(),
                ..Default::default()
            };
            self.submit_request(&request)?;
            return Ok(());
        }

        let req = compute_requirement(
            *self.pool.current(),
            submission.cmd_bufs.iter().map(|cb| &cb.rings),
            &self.device,
            self.kind,
        );
        if self.pool.ensure(&self.device, &req)? {
            self.pending_rebuild = true;
        }

        let uses_gang = submission.cmd_bufs.iter().any(|cb| cb.follower_cs.is_some());
        if uses_gang {
            let follower = self
                .follower_pool
                .get_or_insert_with(|| RingPool::new(EngineType::Compute));
            // A rebuilt follower pool must not start from a resume
            // preamble any more than a rebuilt leader pool may.
            if gang::ensure_gang(&self.device, &self.pool, follower, &mut self.gang)? {
                self.pending_rebuild = true;
            }
        }

        let referenced_upload = submission
            .cmd_bufs
            .iter()
            .map(|cb| cb.upload_seq)
            .max()
            .unwrap_or(0);
        let pending_upload = referenced_upload > self.uploads_seen;
        let needs_wait = !submission.waits.is_empty() || pending_upload;

        let mut waits = submission.waits.clone();
        if pending_upload {
            // Synthetic wait on the device-wide upload semaphore so the
            // referenced binaries are resident before any wave launches.
            waits.push(self.device.shader_upload_sem());
        }

        let preamble_kind = if needs_wait {
            PreambleKind::FullFlush
        } else if self.pending_rebuild {
            PreambleKind::Initial
        } else {
            PreambleKind::Resume
        };
        log::debug!(
            "{:?} queue submit: {} cmdbufs, {:?} preamble, gang={}",
            self.kind,
            submission.cmd_bufs.len(),
            preamble_kind,
            uses_gang
        );

        if self.device.options().fault_detection {
            self.submit_fault_checked(submission, &waits, preamble_kind)?;
        } else {
            let request = self.build_request(
                &submission.cmd_bufs,
                &waits,
                &submission.signals,
                preamble_kind,
            );
            self.submit_request(&request)?;
        }

        self.pending_rebuild = false;
        self.uploads_seen = self.uploads_seen.max(referenced_upload);
        Ok(())
    }

    /// Build one submit request covering `cmd_bufs`.
    ///
    /// Sequential command buffers not recorded for simultaneous use are
    /// spliced into one continuous stream by patching the predecessor to
    /// jump into the successor. A gang follower's sub-stream occupies its
    /// own slots and is ordered before the leader's: the kernel requires
    /// the last entry to match the physical engine of the queue.
    fn build_request(
        &self,
        cmd_bufs: &[CmdBuf],
        waits: &[SyncId],
        signals: &[SyncId],
        preamble_kind: PreambleKind,
    ) -> SubmitRequest {
        let ws = self.device.winsys();

        // Chaining is re-derived per submit; drop stale links first.
        for cb in cmd_bufs {
            ws.cs_unchain(cb.cs);
        }

        let mut leader_streams: SmallVec<[CsId; 8]> = SmallVec::new();
        let mut tail: Option<&CmdBuf> = None;
        for cb in cmd_bufs {
            let chained = match tail {
                Some(prev) if !prev.simultaneous_use => ws.cs_chain(prev.cs, cb.cs),
                _ => false,
            };
            if !chained {
                leader_streams.push(cb.cs);
            }
            tail = Some(cb);
        }

        let mut request = SubmitRequest {
            ring_buffers: self.pool.ring_buffer_ids(),
            waits: waits.to_vec(),
            signals: signals.to_vec(),
            ..Default::default()
        };

        let follower_streams: SmallVec<[CsId; 4]> = cmd_bufs
            .iter()
            .filter_map(|cb| cb.follower_cs)
            .collect();
        let gang = (!follower_streams.is_empty())
            .then_some(self.gang.as_ref())
            .flatten();

        if let Some(link) = gang {
            if let Some(follower) = &self.follower_pool {
                request.ring_buffers.extend(follower.ring_buffer_ids());
                if let Some(preambles) = follower.preambles() {
                    request.preambles.push(select(preambles, preamble_kind));
                }
            }
            request.preambles.push(link.follower_pre().id());
            request.streams.extend(follower_streams.iter().copied());
            request.postambles.push(link.follower_post().id());
        }

        if let Some(preambles) = self.pool.preambles() {
            request.preambles.push(select(preambles, preamble_kind));
        }
        if let Some(link) = gang {
            request.preambles.push(link.leader_pre().id());
            request.postambles.push(link.leader_post().id());
        }
        request.streams.extend(leader_streams);
        request
    }

    /// Fault-detection mode: one command buffer per submit, polling the
    /// winsys for a fault after each.
    fn submit_fault_checked(
        &mut self,
        submission: &Submission,
        waits: &[SyncId],
        preamble_kind: PreambleKind,
    ) -> SubmitResult<()> {
        let last = submission.cmd_bufs.len() - 1;
        for (i, cb) in submission.cmd_bufs.iter().enumerate() {
            let kind = if i == 0 { preamble_kind } else { PreambleKind::Resume };
            let one = std::slice::from_ref(cb);
            let request = self.build_request(
                one,
                if i == 0 { waits } else { &[] },
                if i == last { &submission.signals } else { &[] },
                kind,
            );
            self.submit_request(&request)?;
            if let Some(fault) = self.device.winsys().query_fault() {
                log::error!("fault after command buffer {i}: {fault}");
                self.device.mark_lost();
                return Err(SubmitError::DeviceLost);
            }
        }
        Ok(())
    }

    /// Hand a request to the winsys, escalating any failure to a terminal
    /// device-lost with a best-effort fault diagnostic.
    fn submit_request(&self, request: &SubmitRequest) -> SubmitResult<()> {
        match self.device.winsys().submit(self.kind, request) {
            Ok(_fence) => Ok(()),
            Err(err) => {
                // Diagnostic only; must never fail the call.
                match self.device.winsys().query_fault() {
                    Some(fault) => log::error!("submit failed ({err}); {fault}"),
                    None => log::error!("submit failed ({err}); no fault status available"),
                }
                self.device.mark_lost();
                Err(SubmitError::DeviceLost)
            }
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // The follower's task-ring view borrows from the leader pool;
        // clear it before either pool is torn down.
        if let Some(follower) = &mut self.follower_pool {
            follower.clear_shared_task();
        }
    }
}

fn select(preambles: &crate::ring::PreambleSet, kind: PreambleKind) -> CsId {
    match kind {
        PreambleKind::FullFlush => preambles.full_flush.id(),
        PreambleKind::Initial => preambles.initial.id(),
        PreambleKind::Resume => preambles.resume.id(),
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("pool", &self.pool)
            .field("gang", &self.gang.is_some())
            .finish()
    }
}
