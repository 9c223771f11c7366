//! Preamble command-sequence generation.
//!
//! A preamble is the short command sequence executed ahead of the user's
//! command buffers to point hardware state at the queue's current ring
//! resources. Three variants are built for every pool state; choosing
//! between them is entirely the submission driver's job, because picking
//! the wrong one is a silent correctness bug (stale ring pointers or a
//! missing barrier), not a performance issue.
//!
//! - `full_flush`: cache invalidate + wait for prior shader work, then the
//!   body. Used for the first submission after a rebuild that also waits,
//!   and for any submission with explicit cross-queue waits.
//! - `initial`: cache invalidate, no completion wait, then the body.
//! - `resume`: body only; assumes the previous submission on the same
//!   queue left hardware state valid.

use bytemuck::{Pod, Zeroable};

use crate::device::Device;
use crate::error::SubmitResult;
use crate::hw::{
    self, ShaderStage, INV_ICACHE, INV_L2, INV_SCACHE, INV_VCACHE, REG_ATTRIBUTE_RING,
    REG_COMPUTE_SCRATCH, REG_COMPUTE_SCRATCH_CTL, REG_ESGS_RING_SIZE, REG_GFX_SCRATCH,
    REG_GFX_SCRATCH_CTL, REG_GSVS_RING_SIZE, REG_SAMPLE_POSITIONS, REG_TF_MEM_BASE,
    REG_TF_RING_SIZE,
};
use crate::ring::requirement::RingRequirement;
use crate::winsys::{BufferRef, CmdStream, EngineType};

/// Everything the builder needs to know about a satisfied pool: the
/// requirement plus a non-owning view of each present ring.
#[derive(Debug, Clone, Copy)]
pub struct PoolView<'a> {
    pub req: &'a RingRequirement,
    pub kind: EngineType,
    pub scratch: Option<BufferRef>,
    pub compute_scratch: Option<BufferRef>,
    pub esgs: Option<BufferRef>,
    pub gsvs: Option<BufferRef>,
    pub tess: Option<BufferRef>,
    pub task: Option<BufferRef>,
    pub mesh_scratch: Option<BufferRef>,
    pub attribute: Option<BufferRef>,
    pub descriptor: BufferRef,
}

/// The three preamble variants for one pool state.
#[derive(Debug)]
pub struct PreambleSet {
    pub full_flush: CmdStream,
    pub initial: CmdStream,
    pub resume: CmdStream,
}

/// Packed hardware descriptor for one ring, as consumed by shaders from
/// the descriptor buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RingDescriptor {
    pub base_lo: u32,
    /// Base address high bits in [15:0], element stride in [29:16].
    pub base_hi_stride: u32,
    pub num_records: u32,
    pub flags: u32,
}

impl RingDescriptor {
    fn for_ring(buf: BufferRef, stride: u32, flags: u32) -> Self {
        Self {
            base_lo: buf.va as u32,
            base_hi_stride: ((buf.va >> 32) as u32 & 0xffff) | (stride << 16),
            num_records: if stride == 0 {
                buf.size as u32
            } else {
                (buf.size / stride as u64) as u32
            },
            flags,
        }
    }
}

/// Descriptor-buffer slot assignment. Absent rings leave zeroed slots.
pub const DESC_SLOT_ESGS: usize = 0;
pub const DESC_SLOT_GSVS: usize = 1;
pub const DESC_SLOT_TESS_FACTOR: usize = 2;
pub const DESC_SLOT_TASK: usize = 3;
pub const DESC_SLOT_MESH_SCRATCH: usize = 4;
pub const DESC_SLOT_ATTRIBUTE: usize = 5;
pub const DESC_SLOT_COUNT: usize = 6;

/// Size of the packed descriptor buffer.
pub const DESC_BUFFER_SIZE: u64 =
    (DESC_SLOT_COUNT * std::mem::size_of::<RingDescriptor>()) as u64;

/// Build the packed descriptor-buffer contents for a pool view.
pub fn build_descriptor_contents(view: &PoolView<'_>) -> Vec<u8> {
    let mut slots = [RingDescriptor::default(); DESC_SLOT_COUNT];
    if let Some(esgs) = view.esgs {
        slots[DESC_SLOT_ESGS] = RingDescriptor::for_ring(esgs, 0, 0);
    }
    if let Some(gsvs) = view.gsvs {
        slots[DESC_SLOT_GSVS] = RingDescriptor::for_ring(gsvs, 16, 0);
    }
    if let Some(tess) = view.tess {
        slots[DESC_SLOT_TESS_FACTOR] = RingDescriptor::for_ring(tess, 4, 0);
    }
    if let Some(task) = view.task {
        slots[DESC_SLOT_TASK] = RingDescriptor::for_ring(task, 16, 0);
    }
    if let Some(mesh) = view.mesh_scratch {
        slots[DESC_SLOT_MESH_SCRATCH] = RingDescriptor::for_ring(mesh, 0, 0);
    }
    if let Some(attr) = view.attribute {
        slots[DESC_SLOT_ATTRIBUTE] = RingDescriptor::for_ring(attr, 16, 1);
    }
    bytemuck::cast_slice(&slots).to_vec()
}

// Fixed graphics pipeline initialization, emitted once per preamble on
// graphics queues unless the caller supplied a precomputed blob.
fn emit_graphics_init(out: &mut Vec<u32>) {
    // Context defaults: primitive reset, clip setup, late-alloc limits.
    hw::emit_set_reg(out, 0x100, 0);
    hw::emit_set_reg(out, 0x104, 0xffff_ffff);
    hw::emit_set_reg(out, 0x108, 0x1f);
}

fn emit_sample_positions(out: &mut Vec<u32>) {
    // Standard 4x pattern packed two positions per dword.
    hw::emit_set_reg(out, REG_SAMPLE_POSITIONS, 0x8ae8_2ae2);
    hw::emit_set_reg(out, REG_SAMPLE_POSITIONS + 1, 0xe228_e8a2);
}

/// Emit the common preamble body: graphics init, ring-size registers for
/// present rings, the descriptor-buffer pointer broadcast and scratch
/// configuration.
fn emit_body(device: &Device, view: &PoolView<'_>, out: &mut Vec<u32>) {
    if view.kind == EngineType::Graphics {
        match &device.options().graphics_init {
            Some(blob) => out.extend_from_slice(blob),
            None => emit_graphics_init(out),
        }
        if view.req.needs_sample_positions {
            emit_sample_positions(out);
        }
    }

    // Ring-size registers are only written for rings that exist. Writing a
    // size register with a null base is undefined on some generations, so
    // skipping absent rings is a correctness requirement.
    if let Some(esgs) = view.esgs {
        hw::emit_set_reg(out, REG_ESGS_RING_SIZE, (esgs.size >> 8) as u32);
    }
    if let Some(gsvs) = view.gsvs {
        hw::emit_set_reg(out, REG_GSVS_RING_SIZE, (gsvs.size >> 8) as u32);
    }
    if let Some(tess) = view.tess {
        hw::emit_set_reg(out, REG_TF_RING_SIZE, (tess.size >> 8) as u32);
        hw::emit_set_reg64(out, REG_TF_MEM_BASE, tess.va >> 8);
    }
    if let Some(attr) = view.attribute {
        hw::emit_set_reg64(out, REG_ATTRIBUTE_RING, attr.va >> 16);
    }

    // Broadcast the descriptor-buffer pointer to every stage's user-data
    // registers. The register set is generation-dependent; on compute
    // queues only the compute slot applies.
    for slot in hw::user_data_slots(device.caps().generation) {
        if view.kind == EngineType::Compute && slot.stage != ShaderStage::Compute {
            continue;
        }
        hw::emit_set_reg64(out, slot.reg, view.descriptor.va);
    }

    if let Some(scratch) = view.scratch {
        hw::emit_set_reg64(out, REG_GFX_SCRATCH, scratch.va >> 8);
        hw::emit_set_reg(
            out,
            REG_GFX_SCRATCH_CTL,
            scratch_control(
                view.req.scratch_bytes_per_wave,
                view.req.scratch_wave_count,
            ),
        );
    }
    if let Some(scratch) = view.compute_scratch {
        hw::emit_set_reg64(out, REG_COMPUTE_SCRATCH, scratch.va >> 8);
        hw::emit_set_reg(
            out,
            REG_COMPUTE_SCRATCH_CTL,
            scratch_control(
                view.req.compute_scratch_bytes_per_wave,
                view.req.compute_scratch_wave_count,
            ),
        );
    }
}

// Wave count in [31:12], per-wave size in 256-byte granules in [11:0].
// Both fields saturate at their encodable maximum so an out-of-range
// requirement never programs less scratch than the field can express.
fn scratch_control(bytes_per_wave: u32, wave_count: u32) -> u32 {
    let granules = (bytes_per_wave >> 8).min(0xfff);
    let waves = wave_count.min(0xf_ffff);
    (waves << 12) | granules
}

/// Build all three preamble variants for the given pool view.
pub fn build(device: &Device, view: &PoolView<'_>) -> SubmitResult<PreambleSet> {
    let mut body = Vec::new();
    emit_body(device, view, &mut body);

    let mut initial = Vec::new();
    hw::emit_cache_invalidate(&mut initial, INV_ICACHE | INV_SCACHE | INV_VCACHE | INV_L2);
    initial.extend_from_slice(&body);

    let mut full_flush = Vec::new();
    hw::emit_cache_invalidate(
        &mut full_flush,
        INV_ICACHE | INV_SCACHE | INV_VCACHE | INV_L2,
    );
    hw::emit_wait_idle(&mut full_flush);
    full_flush.extend_from_slice(&body);

    let ws = device.winsys();
    Ok(PreambleSet {
        full_flush: CmdStream::new(ws, view.kind, &full_flush)?,
        initial: CmdStream::new(ws, view.kind, &initial)?,
        resume: CmdStream::new(ws, view.kind, &body)?,
    })
}
