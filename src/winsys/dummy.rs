//! In-memory winsys for tests and development.
//!
//! Performs no kernel calls but keeps enough state to be interrogated:
//! live buffer objects, total allocation counts, every recorded submit and
//! virtual bind. Allocation failure and GPU faults can be armed to
//! exercise the rollback and device-lost paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{SubmitError, SubmitResult};

use super::{
    BufferAlloc, BufferDesc, BufferFlags, BufferId, CsId, EngineType, FaultInfo, FenceId,
    ResourceId, SubmitRequest, VirtualBind, Winsys,
};

/// A live dummy buffer object.
#[derive(Debug)]
struct DummyBuffer {
    size: u64,
    label: &'static str,
    /// Backing storage, present only for CPU-visible buffers.
    contents: Option<Vec<u8>>,
}

/// A live dummy command stream.
#[derive(Debug)]
struct DummyCs {
    engine: EngineType,
    words: Vec<u32>,
    chained_to: Option<CsId>,
}

/// One recorded submit ioctl.
#[derive(Debug, Clone)]
pub struct RecordedSubmit {
    pub engine: EngineType,
    pub request: SubmitRequest,
}

#[derive(Default)]
struct DummyState {
    buffers: HashMap<u64, DummyBuffer>,
    streams: HashMap<u64, DummyCs>,
    submits: Vec<RecordedSubmit>,
    binds: Vec<(ResourceId, VirtualBind)>,
    waited_fences: Vec<FenceId>,
    /// Countdown armed by [`DummyWinsys::fail_next_allocs`]; the allocation
    /// that decrements it to zero fails.
    allocs_until_failure: Option<u32>,
    /// Same countdown scheme for `cs_create`.
    cs_creates_until_failure: Option<u32>,
    fault: Option<FaultInfo>,
    fail_submits: bool,
}

/// In-memory [`Winsys`] implementation.
#[derive(Default)]
pub struct DummyWinsys {
    next_id: AtomicU64,
    next_va: AtomicU64,
    total_allocs: AtomicU64,
    state: Mutex<DummyState>,
}

impl DummyWinsys {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            // Keep the dummy address space away from zero so a null va is
            // always a bug.
            next_va: AtomicU64::new(0x10_0000),
            total_allocs: AtomicU64::new(0),
            state: Mutex::new(DummyState::default()),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of buffer objects currently alive.
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of command streams currently alive.
    pub fn live_stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Total `buffer_create` calls ever made, successful or not.
    pub fn total_alloc_count(&self) -> u64 {
        self.total_allocs.load(Ordering::Relaxed)
    }

    /// Recorded submits, oldest first.
    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submits.clone()
    }

    /// Recorded virtual binds, oldest first.
    pub fn binds(&self) -> Vec<(ResourceId, VirtualBind)> {
        self.state.lock().binds.clone()
    }

    /// Fences that have been CPU-waited on.
    pub fn waited_fences(&self) -> Vec<FenceId> {
        self.state.lock().waited_fences.clone()
    }

    /// Arm an allocation failure: the `n`th subsequent `buffer_create`
    /// fails with `OutOfDeviceMemory` (1 = the very next one).
    pub fn fail_next_allocs(&self, n: u32) {
        self.state.lock().allocs_until_failure = Some(n);
    }

    /// Arm a stream-creation failure: the `n`th subsequent `cs_create`
    /// fails with `OutOfHostMemory` (1 = the very next one).
    pub fn fail_next_cs_creates(&self, n: u32) {
        self.state.lock().cs_creates_until_failure = Some(n);
    }

    /// Arm a synthetic GPU fault reported by `query_fault`.
    pub fn arm_fault(&self, fault: FaultInfo) {
        self.state.lock().fault = Some(fault);
    }

    /// Make every subsequent submit fail.
    pub fn fail_submits(&self, fail: bool) {
        self.state.lock().fail_submits = fail;
    }

    /// Words of a live command stream, for content assertions.
    pub fn stream_words(&self, id: CsId) -> Option<Vec<u32>> {
        self.state.lock().streams.get(&id.0).map(|cs| cs.words.clone())
    }

    /// Contents of a live CPU-visible buffer.
    pub fn buffer_contents(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&id.0)
            .and_then(|b| b.contents.clone())
    }

    /// Create a user command stream the way a recorder would, returning a
    /// raw id whose lifetime the caller manages.
    pub fn create_user_stream(&self, engine: EngineType, words: &[u32]) -> CsId {
        let id = CsId(self.fresh_id());
        self.state.lock().streams.insert(
            id.0,
            DummyCs {
                engine,
                words: words.to_vec(),
                chained_to: None,
            },
        );
        id
    }
}

impl Winsys for DummyWinsys {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn buffer_create(&self, desc: &BufferDesc) -> SubmitResult<BufferAlloc> {
        self.total_allocs.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        if let Some(remaining) = state.allocs_until_failure.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                state.allocs_until_failure = None;
                log::debug!("dummy winsys: armed allocation failure for {}", desc.label);
                return Err(SubmitError::OutOfDeviceMemory);
            }
        }

        let id = self.fresh_id();
        let alignment = desc.alignment.max(1);
        let va = {
            let raw = self.next_va.fetch_add(desc.size + alignment, Ordering::Relaxed);
            raw.next_multiple_of(alignment)
        };
        let contents = desc
            .flags
            .contains(BufferFlags::CPU_ACCESS)
            .then(|| vec![0u8; desc.size as usize]);
        state.buffers.insert(
            id,
            DummyBuffer {
                size: desc.size,
                label: desc.label,
                contents,
            },
        );
        log::trace!("dummy winsys: created {} ({} bytes)", desc.label, desc.size);
        Ok(BufferAlloc {
            id: BufferId(id),
            va,
        })
    }

    fn buffer_destroy(&self, id: BufferId) {
        let removed = self.state.lock().buffers.remove(&id.0);
        match removed {
            Some(buffer) => log::trace!("dummy winsys: destroyed {}", buffer.label),
            None => log::error!("dummy winsys: destroy of unknown buffer {:?}", id),
        }
    }

    fn buffer_write(&self, id: BufferId, offset: u64, data: &[u8]) -> SubmitResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&id.0)
            .ok_or_else(|| SubmitError::SubmitFailed(format!("write to unknown buffer {id:?}")))?;
        let contents = buffer.contents.as_mut().ok_or_else(|| {
            SubmitError::SubmitFailed(format!("write to non CPU-visible buffer {id:?}"))
        })?;
        let end = (offset as usize) + data.len();
        if end > contents.len() {
            return Err(SubmitError::SubmitFailed(format!(
                "write past end of buffer {id:?} ({end} > {})",
                contents.len()
            )));
        }
        contents[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn cs_create(&self, engine: EngineType, words: &[u32]) -> SubmitResult<CsId> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.cs_creates_until_failure.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                state.cs_creates_until_failure = None;
                log::debug!("dummy winsys: armed stream-creation failure");
                return Err(SubmitError::OutOfHostMemory);
            }
        }

        let id = CsId(self.fresh_id());
        state.streams.insert(
            id.0,
            DummyCs {
                engine,
                words: words.to_vec(),
                chained_to: None,
            },
        );
        log::trace!(
            "dummy winsys: finalized stream {:?} ({} words, {:?})",
            id,
            words.len(),
            engine
        );
        Ok(id)
    }

    fn cs_destroy(&self, id: CsId) {
        if self.state.lock().streams.remove(&id.0).is_none() {
            log::error!("dummy winsys: destroy of unknown stream {:?}", id);
        }
    }

    fn cs_chain(&self, from: CsId, to: CsId) -> bool {
        let mut state = self.state.lock();
        if !state.streams.contains_key(&to.0) {
            return false;
        }
        match state.streams.get_mut(&from.0) {
            Some(cs) => {
                cs.chained_to = Some(to);
                true
            }
            None => false,
        }
    }

    fn cs_unchain(&self, cs: CsId) {
        if let Some(stream) = self.state.lock().streams.get_mut(&cs.0) {
            stream.chained_to = None;
        }
    }

    fn submit(&self, engine: EngineType, request: &SubmitRequest) -> SubmitResult<FenceId> {
        let mut state = self.state.lock();
        if state.fail_submits {
            return Err(SubmitError::SubmitFailed("dummy submit failure".into()));
        }
        state.submits.push(RecordedSubmit {
            engine,
            request: request.clone(),
        });
        Ok(FenceId(self.fresh_id()))
    }

    fn wait_fence(&self, fence: FenceId) {
        // Dummy submissions retire instantly; just record the wait.
        self.state.lock().waited_fences.push(fence);
    }

    fn bind_virtual(&self, resource: ResourceId, bind: &VirtualBind) -> SubmitResult<()> {
        self.state.lock().binds.push((resource, *bind));
        Ok(())
    }

    fn query_fault(&self) -> Option<FaultInfo> {
        self.state.lock().fault.clone()
    }
}

static_assertions::assert_impl_all!(DummyWinsys: Send, Sync);
