//! Common utilities for submission integration tests.

use std::sync::Arc;

use gpu_submit::winsys::dummy::DummyWinsys;
use gpu_submit::winsys::{EngineType, Winsys};
use gpu_submit::{CmdBuf, Device, DeviceCaps, DeviceOptions, RingRequirement};

/// A device on a dummy winsys, with the winsys kept interrogable.
pub struct TestContext {
    pub ws: Arc<DummyWinsys>,
    pub device: Arc<Device>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_options(DeviceOptions::default())
    }

    pub fn with_options(options: DeviceOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let ws = Arc::new(DummyWinsys::new());
        let dyn_ws: Arc<dyn Winsys> = ws.clone();
        let device = Device::new(dyn_ws, DeviceCaps::default(), options);
        Self { ws, device }
    }

    /// A recorded command buffer with the given ring hints.
    pub fn cmd_buf(&self, rings: RingRequirement) -> CmdBuf {
        CmdBuf {
            cs: self.ws.create_user_stream(EngineType::Graphics, &[0x1111]),
            follower_cs: None,
            rings,
            simultaneous_use: false,
            upload_seq: 0,
        }
    }

    /// A gang command buffer: a leader stream plus a compute companion.
    pub fn gang_cmd_buf(&self, rings: RingRequirement) -> CmdBuf {
        CmdBuf {
            follower_cs: Some(self.ws.create_user_stream(EngineType::Compute, &[0x2222])),
            ..self.cmd_buf(rings)
        }
    }
}

/// Requirement asking only for an ESGS ring of `bytes`.
pub fn esgs(bytes: u32) -> RingRequirement {
    RingRequirement {
        esgs_ring_bytes: bytes,
        ..Default::default()
    }
}
