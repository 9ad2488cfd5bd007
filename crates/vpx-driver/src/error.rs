//! Error types for VPX driver operations

use thiserror::Error;

/// Result type alias for VPX operations
pub type Result<T> = std::result::Result<T, VpxError>;

/// Errors that can occur during VPX operations
#[derive(Debug, Error)]
pub enum VpxError {
    /// Device-memory or debug-memory allocation failed
    #[error("Out of device memory: {what}")]
    OutOfMemory {
        /// What was being allocated
        what: String,
    },

    /// A bounded wait exceeded its timeout
    #[error("Timed out after {duration_ms}ms waiting for {what} (checkpoint {checkpoint:#x})")]
    TimedOut {
        /// What was being waited for
        what: &'static str,
        /// Timeout duration in milliseconds
        duration_ms: u64,
        /// Boot checkpoint register value at expiry (0 when not applicable)
        checkpoint: u32,
    },

    /// A wait was interrupted; the caller should retry
    #[error("Wait interrupted, retry")]
    Again,

    /// Firmware sent an abort message
    #[error("Firmware aborted: {reason}")]
    FirmwareAborted {
        /// Diagnostic string decoded from the abort payload
        reason: String,
    },

    /// The co-processor watchdog expired
    #[error("Watchdog timeout")]
    WatchdogTimeout,

    /// A host-transport (bus) error was flagged
    #[error("Host transport error (ports {ports:#x})")]
    TransportError {
        /// Per-port error bits from the status sub-field, shifted down
        ports: u32,
    },

    /// Firmware reported a failed fast reset
    #[error("Firmware fast reset failed")]
    FastResetFailure,

    /// Wire-protocol violation from the firmware side
    #[error("Mailbox protocol violation: {source}")]
    Protocol {
        /// Underlying wire-format error
        #[from]
        source: vpx_chip::msg::WireError,
    },

    /// Operation attempted in a state that does not permit it
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error talking to the device node
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl VpxError {
    /// Create an out-of-memory error
    pub fn out_of_memory(what: impl Into<String>) -> Self {
        Self::OutOfMemory { what: what.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }
}
