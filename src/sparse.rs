//! Sparse binding: run coalescing and the dedicated sparse queue.
//!
//! Virtual binds arrive as an ordered list of per-page-ish descriptors;
//! each winsys bind call may cross into the kernel, so adjacent
//! descriptors backed by the same memory are merged into maximal
//! contiguous runs first.
//!
//! Sparse-only queues perform their binds on a dedicated thread because
//! their semantics require blocking CPU waits on fences before applying
//! the binds, and those waits must not stall the application thread.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::device::Device;
use crate::error::{SubmitError, SubmitResult};
use crate::winsys::{FenceId, ResourceId, VirtualBind};

/// One sparse-bind batch against a single resource.
#[derive(Debug, Clone)]
pub struct SparseBindInfo {
    pub resource: ResourceId,
    pub binds: Vec<VirtualBind>,
    /// Fences that must signal before the binds may be applied. Only
    /// honored on the dedicated sparse queue.
    pub wait_fences: Vec<FenceId>,
}

fn same_memory(a: &VirtualBind, b: &VirtualBind) -> bool {
    match (&a.memory, &b.memory) {
        (None, None) => true,
        (Some(x), Some(y)) => x.id == y.id,
        _ => false,
    }
}

fn extends(run: &VirtualBind, next: &VirtualBind) -> bool {
    if !same_memory(run, next) {
        return false;
    }
    if next.resource_offset != run.resource_offset + run.size {
        return false;
    }
    // Unbinds have no memory offset to line up.
    run.memory.is_none() || next.memory_offset == run.memory_offset + run.size
}

/// Merge adjacent bind descriptors into maximal contiguous runs.
///
/// A descriptor extends the open run iff it shares the same backing
/// memory identity (including both being unbinds), starts exactly where
/// the run ends in the resource, and (for real binds) starts exactly
/// where the run ends in the backing memory.
pub fn coalesce(binds: &[VirtualBind]) -> Vec<VirtualBind> {
    let mut runs: Vec<VirtualBind> = Vec::new();
    for bind in binds {
        match runs.last_mut() {
            Some(run) if extends(run, bind) => run.size += bind.size,
            _ => runs.push(*bind),
        }
    }
    runs
}

/// Apply a sparse-bind batch directly on the calling thread.
///
/// This is the path for binds piggybacked on an ordinary submission; it
/// ignores `wait_fences`, which only exist for the dedicated queue.
pub fn bind_sparse(device: &Device, info: &SparseBindInfo) -> SubmitResult<()> {
    let runs = coalesce(&info.binds);
    log::trace!(
        "sparse bind on {:?}: {} descriptors in {} runs",
        info.resource,
        info.binds.len(),
        runs.len()
    );
    for run in &runs {
        device.winsys().bind_virtual(info.resource, run)?;
    }
    Ok(())
}

/// A sparse-only queue: binds are applied by a dedicated thread after its
/// CPU fence waits complete. Dropping the queue drains and joins the
/// thread.
pub struct SparseQueue {
    sender: Option<mpsc::Sender<SparseBindInfo>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SparseQueue {
    pub fn new(device: &Arc<Device>) -> SubmitResult<Self> {
        let (sender, receiver) = mpsc::channel::<SparseBindInfo>();
        let device = Arc::clone(device);
        let worker = thread::Builder::new()
            .name("sparse-submit".into())
            .spawn(move || {
                while let Ok(info) = receiver.recv() {
                    for fence in &info.wait_fences {
                        device.winsys().wait_fence(*fence);
                    }
                    if let Err(err) = bind_sparse(&device, &info) {
                        log::error!("sparse bind failed: {err}");
                        device.mark_lost();
                    }
                }
            })
            .map_err(|_| SubmitError::OutOfHostMemory)?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a bind batch. Returns immediately; the worker blocks on the
    /// batch's fences before applying it.
    pub fn enqueue(&self, info: SparseBindInfo) -> SubmitResult<()> {
        match &self.sender {
            Some(sender) => sender
                .send(info)
                .map_err(|_| SubmitError::DeviceLost),
            None => Err(SubmitError::DeviceLost),
        }
    }
}

impl Drop for SparseQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("sparse submission thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::device::{DeviceCaps, DeviceOptions};
    use crate::winsys::dummy::DummyWinsys;
    use crate::winsys::{BufferId, BufferRef, Winsys};

    fn mem(id: u64) -> BufferRef {
        BufferRef {
            id: BufferId(id),
            va: id << 20,
            size: 1 << 20,
        }
    }

    fn bind(off: u64, memory: Option<BufferRef>, moff: u64, size: u64) -> VirtualBind {
        VirtualBind {
            resource_offset: off,
            size,
            memory,
            memory_offset: moff,
        }
    }

    #[test]
    fn contiguous_same_memory_merges_to_one_run() {
        let a = mem(1);
        let runs = coalesce(&[
            bind(0, Some(a), 0, 100),
            bind(100, Some(a), 100, 50),
        ]);
        assert_eq!(runs, vec![bind(0, Some(a), 0, 150)]);
    }

    #[rstest]
    // Gap in the resource range.
    #[case(bind(0, Some(mem(1)), 0, 100), bind(200, Some(mem(1)), 100, 50))]
    // Gap in the backing memory.
    #[case(bind(0, Some(mem(1)), 0, 100), bind(100, Some(mem(1)), 400, 50))]
    // Different memory identity.
    #[case(bind(0, Some(mem(1)), 0, 100), bind(100, Some(mem(2)), 100, 50))]
    // Bind followed by unbind.
    #[case(bind(0, Some(mem(1)), 0, 100), bind(100, None, 0, 50))]
    fn boundaries_are_never_merged(#[case] first: VirtualBind, #[case] second: VirtualBind) {
        let runs = coalesce(&[first, second]);
        assert_eq!(runs, vec![first, second]);
    }

    #[test]
    fn unbind_runs_merge_regardless_of_memory_offset() {
        let runs = coalesce(&[bind(0, None, 0, 64), bind(64, None, 999, 64)]);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].size, 128);
    }

    #[test]
    fn any_split_of_one_run_coalesces_back() {
        let a = mem(7);
        let total = 4096u64;
        for split in [1u64, 64, 1000, 4095] {
            let runs = coalesce(&[
                bind(0, Some(a), 0, split),
                bind(split, Some(a), split, total - split),
            ]);
            assert_eq!(runs, vec![bind(0, Some(a), 0, total)]);
        }
    }

    #[test]
    fn sparse_queue_waits_then_binds() {
        let ws = Arc::new(DummyWinsys::new());
        let dyn_ws: Arc<dyn Winsys> = ws.clone();
        let device = Device::new(dyn_ws, DeviceCaps::default(), DeviceOptions::default());
        let queue = SparseQueue::new(&device).unwrap();

        let a = mem(3);
        queue
            .enqueue(SparseBindInfo {
                resource: ResourceId(9),
                binds: vec![bind(0, Some(a), 0, 100), bind(100, Some(a), 100, 28)],
                wait_fences: vec![FenceId(42)],
            })
            .unwrap();
        drop(queue); // joins the worker

        assert_eq!(ws.waited_fences(), vec![FenceId(42)]);
        let binds = ws.binds();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].0, ResourceId(9));
        assert_eq!(binds[0].1.size, 128);
    }
}
