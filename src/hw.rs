//! Hardware-generation register layout and command-word encoding.
//!
//! Preambles and gang handshakes are plain `u32` word streams. This module
//! owns the packet framing and the per-generation register tables; callers
//! never hand-assemble words themselves.
//!
//! The set of user-data registers that receive the ring-descriptor pointer
//! differs across generation tiers, so the tables here are selected once at
//! device-init time and treated as data, not as branching logic.

/// Hardware generation tier.
///
/// Closed set: the register layout tables below are indexed by tier and the
/// tier of a device never changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwGeneration {
    Gfx8,
    Gfx9,
    Gfx10,
    Gfx11,
}

impl HwGeneration {
    /// Whether this generation routes vertex attributes through a dedicated
    /// attribute ring instead of the parameter cache.
    pub fn has_attribute_ring(self) -> bool {
        self >= HwGeneration::Gfx11
    }

    /// Total attribute-ring size for the whole device, fixed per generation.
    pub fn attribute_ring_bytes(self) -> u32 {
        if self.has_attribute_ring() {
            // 16 clusters * 64 KiB
            16 * 64 * 1024
        } else {
            0
        }
    }
}

/// Shader stages whose user-data registers receive the ring-descriptor
/// buffer pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
}

/// One user-data register slot: the stage it belongs to and the register
/// offset the descriptor pointer is written to.
#[derive(Debug, Clone, Copy)]
pub struct UserDataSlot {
    pub stage: ShaderStage,
    pub reg: u16,
}

const fn slot(stage: ShaderStage, reg: u16) -> UserDataSlot {
    UserDataSlot { stage, reg }
}

// Merged-stage layouts: Gfx9 folds tess-ctrl into the geometry block,
// Gfx10+ adds task/mesh slots on the compute block.
static USER_DATA_GFX8: &[UserDataSlot] = &[
    slot(ShaderStage::Vertex, 0x240),
    slot(ShaderStage::TessCtrl, 0x248),
    slot(ShaderStage::TessEval, 0x250),
    slot(ShaderStage::Geometry, 0x258),
    slot(ShaderStage::Fragment, 0x260),
    slot(ShaderStage::Compute, 0x268),
];
static USER_DATA_GFX9: &[UserDataSlot] = &[
    slot(ShaderStage::Vertex, 0x240),
    slot(ShaderStage::TessEval, 0x250),
    slot(ShaderStage::Geometry, 0x258),
    slot(ShaderStage::Fragment, 0x260),
    slot(ShaderStage::Compute, 0x268),
];
static USER_DATA_GFX10: &[UserDataSlot] = &[
    slot(ShaderStage::Vertex, 0x2c0),
    slot(ShaderStage::Geometry, 0x2d0),
    slot(ShaderStage::Fragment, 0x2e0),
    slot(ShaderStage::Compute, 0x2e8),
];
static USER_DATA_GFX11: &[UserDataSlot] = &[
    slot(ShaderStage::Geometry, 0x2d0),
    slot(ShaderStage::Fragment, 0x2e0),
    slot(ShaderStage::Compute, 0x2e8),
    slot(ShaderStage::Task, 0x2f0),
    slot(ShaderStage::Mesh, 0x2f8),
];

/// User-data register slots for the given generation tier.
pub fn user_data_slots(generation: HwGeneration) -> &'static [UserDataSlot] {
    match generation {
        HwGeneration::Gfx8 => USER_DATA_GFX8,
        HwGeneration::Gfx9 => USER_DATA_GFX9,
        HwGeneration::Gfx10 => USER_DATA_GFX10,
        HwGeneration::Gfx11 => USER_DATA_GFX11,
    }
}

// Fixed register offsets shared by all tiers.
pub const REG_ESGS_RING_SIZE: u16 = 0x08c;
pub const REG_GSVS_RING_SIZE: u16 = 0x090;
pub const REG_TF_RING_SIZE: u16 = 0x094;
pub const REG_TF_MEM_BASE: u16 = 0x098;
pub const REG_ATTRIBUTE_RING: u16 = 0x09c;
pub const REG_GFX_SCRATCH: u16 = 0x0a0;
pub const REG_COMPUTE_SCRATCH: u16 = 0x0a4;
pub const REG_GFX_SCRATCH_CTL: u16 = 0x0a8;
pub const REG_COMPUTE_SCRATCH_CTL: u16 = 0x0ac;
pub const REG_SAMPLE_POSITIONS: u16 = 0x0b0;

// Packet opcodes.
const OP_SET_REG: u32 = 0x69;
const OP_WRITE_DATA: u32 = 0x37;
const OP_WAIT_REG_MEM: u32 = 0x3c;
const OP_RELEASE_MEM: u32 = 0x49;
const OP_ACQUIRE_MEM: u32 = 0x58;
const OP_EVENT_WRITE: u32 = 0x46;

/// Cache domains touched by a preamble invalidate.
pub const INV_ICACHE: u32 = 1 << 0;
pub const INV_SCACHE: u32 = 1 << 1;
pub const INV_VCACHE: u32 = 1 << 2;
pub const INV_L2: u32 = 1 << 3;

const fn pkt3(op: u32, count: u32) -> u32 {
    0xc000_0000 | (op << 8) | (count & 0x3fff)
}

/// Write a single register.
pub fn emit_set_reg(out: &mut Vec<u32>, reg: u16, value: u32) {
    out.push(pkt3(OP_SET_REG, 1));
    out.push(reg as u32);
    out.push(value);
}

/// Write a register pair (64-bit address split lo/hi).
pub fn emit_set_reg64(out: &mut Vec<u32>, reg: u16, value: u64) {
    out.push(pkt3(OP_SET_REG, 2));
    out.push(reg as u32);
    out.push(value as u32);
    out.push((value >> 32) as u32);
}

/// Invalidate the named cache domains.
pub fn emit_cache_invalidate(out: &mut Vec<u32>, domains: u32) {
    out.push(pkt3(OP_ACQUIRE_MEM, 1));
    out.push(domains);
}

/// Wait for all previously issued shader work to retire.
pub fn emit_wait_idle(out: &mut Vec<u32>) {
    out.push(pkt3(OP_EVENT_WRITE, 1));
    // CS_PARTIAL_FLUSH | PS_PARTIAL_FLUSH semantics folded into one event.
    out.push(0x4);
}

/// GPU-side spin: stall the engine until `*va >= reference`.
pub fn emit_wait_mem_ge(out: &mut Vec<u32>, va: u64, reference: u32) {
    out.push(pkt3(OP_WAIT_REG_MEM, 4));
    // function = GE, space = memory
    out.push(0x13);
    out.push(va as u32);
    out.push((va >> 32) as u32);
    out.push(reference);
}

/// Immediate memory write from the command processor.
pub fn emit_write_mem(out: &mut Vec<u32>, va: u64, value: u32) {
    out.push(pkt3(OP_WRITE_DATA, 3));
    out.push(va as u32);
    out.push((va >> 32) as u32);
    out.push(value);
}

/// End-of-pipe event that writes `value` to `va` once every preceding wave
/// on the engine has retired.
pub fn emit_release_mem(out: &mut Vec<u32>, va: u64, value: u32) {
    out.push(pkt3(OP_RELEASE_MEM, 4));
    // BOTTOM_OF_PIPE_TS, no interrupt
    out.push(0x28);
    out.push(va as u32);
    out.push((va >> 32) as u32);
    out.push(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_ring_only_on_gfx11() {
        assert!(!HwGeneration::Gfx8.has_attribute_ring());
        assert!(!HwGeneration::Gfx10.has_attribute_ring());
        assert!(HwGeneration::Gfx11.has_attribute_ring());
        assert_eq!(HwGeneration::Gfx10.attribute_ring_bytes(), 0);
        assert_ne!(HwGeneration::Gfx11.attribute_ring_bytes(), 0);
    }

    #[test]
    fn user_data_tables_differ_per_tier() {
        let tiers = [
            HwGeneration::Gfx8,
            HwGeneration::Gfx9,
            HwGeneration::Gfx10,
            HwGeneration::Gfx11,
        ];
        for t in tiers {
            assert!(!user_data_slots(t).is_empty());
        }
        assert_ne!(
            user_data_slots(HwGeneration::Gfx8).len(),
            user_data_slots(HwGeneration::Gfx9).len()
        );
        assert_ne!(
            user_data_slots(HwGeneration::Gfx10).len(),
            user_data_slots(HwGeneration::Gfx11).len()
        );
    }

    #[test]
    fn packet_framing_round_trips_counts() {
        let mut words = Vec::new();
        emit_set_reg(&mut words, REG_ESGS_RING_SIZE, 4096 >> 8);
        assert_eq!(words.len(), 3);
        emit_wait_mem_ge(&mut words, 0x1000, 1);
        assert_eq!(words.len(), 8);
        emit_write_mem(&mut words, 0x1000, 0);
        assert_eq!(words.len(), 12);
        emit_release_mem(&mut words, 0x1004, 1);
        assert_eq!(words.len(), 17);
    }
}
