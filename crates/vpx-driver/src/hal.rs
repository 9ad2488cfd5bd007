//! Collaborator seams between the control core and its host platform.
//!
//! The core never touches hardware directly: register access, device
//! memory, interrupt binding and fault reporting all go through the traits
//! here. [`crate::uio`] implements them against a Linux UIO device;
//! [`crate::sim`] implements them against host memory for tests and CI.

use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;

/// 32-bit register access on the control window.
///
/// Implementations are volatile all the way down; the core assumes every
/// read observes hardware state and every write has side effects.
pub trait RegisterIo: Send + Sync + Debug {
    /// Read the register at `offset` (see `vpx_chip::regs`).
    fn read32(&self, offset: usize) -> u32;

    /// Write the register at `offset`.
    fn write32(&self, offset: usize, value: u32);
}

/// One mapped device-visible buffer.
///
/// Dropping the buffer unmaps it. The pointer stays valid for the buffer's
/// lifetime and the IOVA is what the co-processor's DMA sees.
pub trait DmaBuf: Send + Sync + Debug {
    /// Device-visible address of the buffer.
    fn iova(&self) -> u64;

    /// Host mapping of the buffer.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Length in bytes.
    fn len(&self) -> usize;

    /// Whether the buffer is zero-length (never true for mapped buffers).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IOMMU translation context a mapping is established in. Transactions
/// tagged with the matching stream ID resolve through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmContext {
    /// Code/data context (stream ID slot 0).
    Ctx0,
    /// Debug context (stream ID slot 1; same as Ctx0 on single-context
    /// parts).
    Ctx1,
}

/// Device-memory map/unmap collaborator.
pub trait DeviceMemory: Send + Sync + Debug {
    /// Map `len` bytes of device-visible memory in `ctx`, zero-filled.
    ///
    /// # Errors
    ///
    /// [`crate::VpxError::OutOfMemory`] when the mapping cannot be
    /// established.
    fn alloc(&self, ctx: VmContext, len: usize) -> Result<Box<dyn DmaBuf>>;
}

/// Interrupt lines of the device, as the binding facility numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// The aggregate line carrying watchdog, transport-error and mailbox
    /// conditions.
    Aggregate,
    /// A per-command-queue line.
    Queue(u8),
}

/// Handler invoked on the interrupt-service path. Must not block on locks
/// shared with thread context and must not allocate.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt-line binding facility.
pub trait InterruptController: Send + Sync + Debug {
    /// Bind `handler` to `line`. The handler runs in interrupt-service
    /// context until [`InterruptController::unbind`].
    ///
    /// # Errors
    ///
    /// [`crate::VpxError::InvalidState`] if the line is already bound.
    fn bind(&self, line: IrqLine, handler: IrqHandler) -> Result<()>;

    /// Release the binding for `line`. Idempotent.
    fn unbind(&self, line: IrqLine);

    /// Mask every line of this device at the controller. Must be callable
    /// concurrently with a running handler without acquiring any lock a
    /// handler can hold: the fatal path calls this from both interrupt and
    /// thread context.
    fn mask_all(&self);
}

/// Asynchronous device faults, reported where no synchronous caller
/// exists to return an error to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    /// Watchdog expiry seen on the aggregate line.
    Watchdog,
    /// Host-transport error; per-port bits from the status sub-field.
    Transport(u32),
    /// Firmware abort with its diagnostic string.
    FirmwareAbort(String),
    /// Firmware-internal fast reset failed.
    FastResetFailure,
    /// Boot wait expired; carries the boot checkpoint register value.
    BootTimeout(u32),
    /// Protocol or invariant violation — always terminal.
    Internal(String),
}

/// Fault-reporting collaborator.
pub trait FaultSink: Send + Sync + Debug {
    /// Record a fault. Called from interrupt or thread context.
    fn report(&self, fault: DeviceFault);
}

/// Default sink: structured log only.
#[derive(Debug, Default)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, fault: DeviceFault) {
        tracing::error!(?fault, "device fault");
    }
}
