//! Tunable constants for the engine, collected the way the base crate
//! collects its own retention/export knobs into constructor and builder
//! parameters (`TransactionTracker::new(Duration)`,
//! `NFSTcpListener::with_export_name`).

use std::time::Duration;

/// The first transaction code available for stream ids. Values below this
/// are reserved control codes.
pub const DEFAULT_FIRST_CALL_ID: u32 = 1024;

/// Default maximum payload carried in a single parcel before the writer
/// switches to the fragmenting slow path.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default size of the per-connection outbound credit window.
pub const DEFAULT_FLOW_CONTROL_WINDOW_SIZE: u64 = 128 * 1024;

/// Default inbound byte threshold that triggers an ACK.
pub const DEFAULT_FLOW_CONTROL_ACK_BYTES: u64 = 16 * 1024;

/// Default bound on how long `RpcCall` will wait for flow-control credit
/// before failing.
pub const DEFAULT_CREDIT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default ceiling on allocated stream ids. `u32::MAX` in practice never
/// binds; it exists so a connection can be configured with a tight ceiling
/// for testing exhaustion behavior.
pub const DEFAULT_MAX_CALL_ID: u32 = u32::MAX;

/// Bundles every tunable knob this engine exposes. Constructed via
/// [`Default`] and adjusted with the `with_*` builder methods, mirroring the
/// base crate's post-construction builder style.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub first_call_id: u32,
    pub max_call_id: u32,
    pub block_size: usize,
    pub flow_control_window_size: u64,
    pub flow_control_ack_bytes: u64,
    pub credit_wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            first_call_id: DEFAULT_FIRST_CALL_ID,
            max_call_id: DEFAULT_MAX_CALL_ID,
            block_size: DEFAULT_BLOCK_SIZE,
            flow_control_window_size: DEFAULT_FLOW_CONTROL_WINDOW_SIZE,
            flow_control_ack_bytes: DEFAULT_FLOW_CONTROL_ACK_BYTES,
            credit_wait_timeout: DEFAULT_CREDIT_WAIT_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_flow_control_window_size(mut self, window: u64) -> Self {
        self.flow_control_window_size = window;
        self
    }

    pub fn with_flow_control_ack_bytes(mut self, ack_bytes: u64) -> Self {
        self.flow_control_ack_bytes = ack_bytes;
        self
    }

    pub fn with_credit_wait_timeout(mut self, timeout: Duration) -> Self {
        self.credit_wait_timeout = timeout;
        self
    }

    pub fn with_first_call_id(mut self, first_call_id: u32) -> Self {
        self.first_call_id = first_call_id;
        self
    }

    pub fn with_max_call_id(mut self, max_call_id: u32) -> Self {
        self.max_call_id = max_call_id;
        self
    }
}
