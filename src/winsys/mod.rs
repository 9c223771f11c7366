//! Winsys abstraction layer.
//!
//! The winsys is the crate's only route to the kernel driver: it creates
//! and destroys GPU buffer objects, turns finalized word streams into
//! opaque command streams, performs the submit ioctl and applies virtual
//! (sparse) binds. Everything above this module is winsys-agnostic.
//!
//! # Available implementations
//!
//! - [`dummy::DummyWinsys`]: in-memory implementation used by every test;
//!   tracks live allocations and records submissions.
//!
//! All handles handed out by a winsys are plain ids; the owning wrappers
//! [`RingBuffer`] and [`CmdStream`] return them to the winsys on drop.

pub mod dummy;

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::SubmitResult;

/// Physical engine a command stream executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    Graphics,
    Compute,
}

/// Memory domain a buffer object is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDomain {
    /// Device-local memory.
    Vram,
    /// System memory mapped into the GPU address space.
    Gtt,
    /// On-chip global data share.
    Gds,
    /// Ordered-append counters attached to the GDS.
    GdsOa,
}

bitflags! {
    /// Allocation flags for buffer objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Mappable from the CPU.
        const CPU_ACCESS = 1 << 0;
        /// Contents are zero-initialized by the kernel.
        const ZEROED = 1 << 1;
        /// May be discarded under memory pressure.
        const DISCARDABLE = 1 << 2;
        /// Must be placed in the low 32 bits of the address space.
        const ADDRESS_32BIT = 1 << 3;
        /// Never shared across processes.
        const NO_INTERPROCESS_SHARING = 1 << 4;
    }
}

/// Raw id of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Raw id of an opaque command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsId(pub u64);

/// Raw id of a wait/signal semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId(pub u64);

/// Raw id of a CPU-waitable submission fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

/// Raw id of a sparse-resident resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// Buffer-object creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
    pub alignment: u64,
    pub domain: BufferDomain,
    pub flags: BufferFlags,
    /// Debug label, surfaced by winsys tracing.
    pub label: &'static str,
}

/// Result of a buffer-object allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAlloc {
    pub id: BufferId,
    /// GPU virtual address of the mapping.
    pub va: u64,
}

/// Non-owning view of a buffer object.
///
/// Carries everything command encoding needs without freeing rights; the
/// one legitimate long-lived use is the task ring shared from a leader
/// pool into its gang-follower pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    pub id: BufferId,
    pub va: u64,
    pub size: u64,
}

/// One virtual-bind range: map (or unmap, when `memory` is `None`) a run
/// of a sparse resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<BufferRef>,
    pub memory_offset: u64,
}

/// A single submit ioctl: command streams plus the preamble/postamble
/// sequences and semaphore lists the kernel attaches to them.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Ring buffers the kernel must have resident for this submission.
    pub ring_buffers: Vec<BufferId>,
    pub preambles: Vec<CsId>,
    pub streams: Vec<CsId>,
    pub postambles: Vec<CsId>,
    pub waits: Vec<SyncId>,
    pub signals: Vec<SyncId>,
}

/// GPU fault status as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    pub va: u64,
    pub engine: EngineType,
    pub description: String,
}

impl std::fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GPU fault at {:#x} on {:?} engine: {}",
            self.va, self.engine, self.description
        )
    }
}

/// Kernel-facing surface consumed by the submission core.
pub trait Winsys: Send + Sync + 'static {
    /// Winsys name, for logging.
    fn name(&self) -> &'static str;

    /// Create a buffer object.
    fn buffer_create(&self, desc: &BufferDesc) -> SubmitResult<BufferAlloc>;

    /// Destroy a buffer object.
    fn buffer_destroy(&self, id: BufferId);

    /// Write into a CPU-visible buffer object.
    fn buffer_write(&self, id: BufferId, offset: u64, data: &[u8]) -> SubmitResult<()>;

    /// Finalize a word stream into an opaque command stream for `engine`.
    fn cs_create(&self, engine: EngineType, words: &[u32]) -> SubmitResult<CsId>;

    /// Destroy a command stream.
    fn cs_destroy(&self, id: CsId);

    /// Patch `from` to jump into `to` instead of returning. Returns `false`
    /// when the stream cannot be mutated (e.g. simultaneous use).
    fn cs_chain(&self, from: CsId, to: CsId) -> bool;

    /// Undo a previous [`Winsys::cs_chain`] on `cs`. No-op when unchained.
    fn cs_unchain(&self, cs: CsId);

    /// Submit to the hardware queue backing `engine`.
    fn submit(&self, engine: EngineType, request: &SubmitRequest) -> SubmitResult<FenceId>;

    /// Block the calling thread until `fence` signals.
    fn wait_fence(&self, fence: FenceId);

    /// Apply one virtual-bind range to a sparse resource.
    fn bind_virtual(&self, resource: ResourceId, bind: &VirtualBind) -> SubmitResult<()>;

    /// Best-effort GPU fault status. `None` means no fault is pending.
    fn query_fault(&self) -> Option<FaultInfo>;
}

/// Owning handle to a winsys buffer object.
///
/// Freed on drop, which is what makes the pool's two-phase commit
/// rollback-safe: pending allocations that go out of scope on an error
/// path return themselves to the winsys.
pub struct RingBuffer {
    ws: Arc<dyn Winsys>,
    id: BufferId,
    va: u64,
    size: u64,
}

impl RingBuffer {
    /// Allocate a buffer object and take ownership of it.
    pub fn new(ws: &Arc<dyn Winsys>, desc: &BufferDesc) -> SubmitResult<Self> {
        let alloc = ws.buffer_create(desc)?;
        log::trace!(
            "allocated {} ({} bytes, {:?}, va {:#x})",
            desc.label,
            desc.size,
            desc.domain,
            alloc.va
        );
        Ok(Self {
            ws: Arc::clone(ws),
            id: alloc.id,
            va: alloc.va,
            size: desc.size,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Non-owning view of this buffer.
    pub fn as_ref(&self) -> BufferRef {
        BufferRef {
            id: self.id,
            va: self.va,
            size: self.size,
        }
    }

    /// Write into the buffer (requires `CPU_ACCESS`).
    pub fn write(&self, offset: u64, data: &[u8]) -> SubmitResult<()> {
        self.ws.buffer_write(self.id, offset, data)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.ws.buffer_destroy(self.id);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id)
            .field("va", &format_args!("{:#x}", self.va))
            .field("size", &self.size)
            .finish()
    }
}

/// Owning handle to a finalized command stream. Destroyed on drop.
pub struct CmdStream {
    ws: Arc<dyn Winsys>,
    id: CsId,
    engine: EngineType,
}

impl CmdStream {
    /// Finalize `words` into an opaque command stream.
    pub fn new(ws: &Arc<dyn Winsys>, engine: EngineType, words: &[u32]) -> SubmitResult<Self> {
        let id = ws.cs_create(engine, words)?;
        Ok(Self {
            ws: Arc::clone(ws),
            id,
            engine,
        })
    }

    pub fn id(&self) -> CsId {
        self.id
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }
}

impl Drop for CmdStream {
    fn drop(&mut self) {
        self.ws.cs_destroy(self.id);
    }
}

impl std::fmt::Debug for CmdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdStream")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .finish()
    }
}
