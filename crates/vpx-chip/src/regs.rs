//! Control register map for the VPX500.
//!
//! All offsets are into the host-visible control window. The VPX500 is a
//! platform device; the window is one contiguous 4 KiB page of 32-bit
//! registers. Offsets here are the compatibility surface between this
//! driver and the firmware — the bit layouts of the interrupt status
//! register, the hardware semaphore slots and the mailbox registers are
//! bit-exact and must not drift.

// ── Reset and clocking ───────────────────────────────────────────────────────

/// Reset control. Writing [`reset::RELEASE`] lets the processor run;
/// writing [`reset::ASSERT`] forces it back into reset.
pub const RESET_CTRL: usize = 0x0000;

/// Reset control values.
pub mod reset {
    /// Hold the processor in reset.
    pub const ASSERT: u32 = 0;
    /// Release the processor from reset.
    pub const RELEASE: u32 = 1;
}

// ── Segment windows ──────────────────────────────────────────────────────────
// The co-processor's own MMU maps two windows of its virtual address space
// onto IOVA ranges the host configures before releasing reset. Each window
// is a [start, end) register pair holding IOVA values.

/// User (code/data) segment window start.
pub const SEG_USER_START: usize = 0x0010;
/// User (code/data) segment window end (exclusive).
pub const SEG_USER_END: usize = 0x0014;
/// Debug segment window start.
pub const SEG_DEBUG_START: usize = 0x0018;
/// Debug segment window end (exclusive).
pub const SEG_DEBUG_END: usize = 0x001C;

// ── Security / firewall ──────────────────────────────────────────────────────

/// Firewall configuration for the user segment.
pub const SEC_USER_CFG: usize = 0x0020;
/// Firewall configuration for the debug segment.
pub const SEC_DEBUG_CFG: usize = 0x0024;

/// Firewall register bit definitions.
pub mod firewall {
    /// Reads permitted from the segment.
    pub const READ_EN: u32 = 1 << 0;
    /// Writes permitted to the segment.
    pub const WRITE_EN: u32 = 1 << 1;
    /// Instruction fetch permitted from the segment.
    pub const EXEC_EN: u32 = 1 << 2;
    /// Lock bit — once set the register is immutable until full reset.
    /// Masked out of every write on non-silicon targets so test tooling
    /// can reprogram the firewall between cases.
    pub const LOCK: u32 = 1 << 31;

    /// Production pattern for the user segment: read/write/execute, locked.
    pub const USER_PATTERN: u32 = READ_EN | WRITE_EN | EXEC_EN | LOCK;
    /// Production pattern for the debug segment: read/write, locked.
    pub const DEBUG_PATTERN: u32 = READ_EN | WRITE_EN | LOCK;
}

// ── Stream-ID routing ────────────────────────────────────────────────────────
// Memory transactions are tagged with a stream ID so the system IOMMU
// applies the right translation context. First-generation parts run all
// firmware traffic through one VM context; later parts split code/data and
// debug traffic across two.

/// Stream ID for the combined context (single-context parts).
pub const STREAM_ID_ALL: usize = 0x0030;
/// Stream ID for VM context 0 (code/data) on split-context parts.
pub const STREAM_ID_CTX0: usize = 0x0034;
/// Stream ID for VM context 1 (debug) on split-context parts.
pub const STREAM_ID_CTX1: usize = 0x0038;

/// Value programmed into an unused stream-ID routing register.
pub const STREAM_ID_INVALID: u32 = 0x7F;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Aggregate interrupt status. Three independent sub-fields; clearing is
/// write-one-to-clear and must only write back the bits read as 1 in the
/// sub-field being serviced.
pub const IRQ_STATUS: usize = 0x0040;
/// Local interrupt-controller line enables (same bit layout as status).
pub const IRQ_ENABLE: usize = 0x0044;

/// Sub-fields of [`IRQ_STATUS`] / [`IRQ_ENABLE`].
pub mod irq {
    /// Watchdog expiry (single bit).
    pub const WDT: u32 = 1 << 0;
    /// Host-transport (bus) error bits, one per initiator port.
    pub const XPORT_MASK: u32 = 0xF << 4;
    /// Shift of the transport-error sub-field.
    pub const XPORT_SHIFT: u32 = 4;
    /// Mailbox message pending (single bit).
    pub const MBOX: u32 = 1 << 8;

    /// Lines the boot sequencer enables: watchdog, the mailbox line and
    /// every bus-error line.
    pub const BOOT_LINES: u32 = WDT | XPORT_MASK | MBOX;
}

/// Per-queue interrupt status registers, one per logical command queue,
/// at a fixed stride. Only bit 0 (data available) is defined.
pub const QUEUE_IRQ_STATUS_BASE: usize = 0x0080;
/// Stride between per-queue status registers.
pub const QUEUE_IRQ_STATUS_STRIDE: usize = 0x4;
/// Number of logical command queues.
pub const QUEUE_COUNT: usize = 8;

/// Per-queue status bits.
pub mod queue {
    /// Data available in the queue.
    pub const DATA_AVAIL: u32 = 1 << 0;
}

// ── Error reporting ──────────────────────────────────────────────────────────
// Mission and latent error reporting must be disabled before a forced
// reset; the reset transient otherwise raises error interrupts that no
// handler can service.

/// Mission (functional) error reporting enable.
pub const ERR_MISSION_EN: usize = 0x0050;
/// Latent (built-in self test) error reporting enable.
pub const ERR_LATENT_EN: usize = 0x0054;

// ── Boot diagnostics ─────────────────────────────────────────────────────────

/// Boot checkpoint. Firmware stores a progress code here as it executes
/// its startup path; read after a boot timeout to localise the hang.
pub const BOOT_CHECKPOINT: usize = 0x0058;

// ── Hardware semaphores ──────────────────────────────────────────────────────
// Four general-purpose 32-bit semaphore slots survive reset release and are
// the first thing firmware reads. Slots 0–3 have fixed, agreed meanings.

/// Base of the hardware semaphore slot array.
pub const SEMA_BASE: usize = 0x0100;
/// Stride between semaphore slots.
pub const SEMA_STRIDE: usize = 0x4;

/// Byte offset of semaphore slot `n`.
#[must_use]
pub const fn sema(n: usize) -> usize {
    SEMA_BASE + n * SEMA_STRIDE
}

/// Fixed semaphore slot assignments.
pub mod sema_slot {
    /// Boot-parameter bit flags (see [`super::bootparam`]).
    pub const BOOT_PARAMS: usize = 0;
    /// Read-only syncpoint region base, as an offset from the syncpoint
    /// VA origin, or [`super::SYNCPT_NONE`].
    pub const SYNCPT_RO_OFFSET: usize = 1;
    /// Read-write syncpoint region base offset, or [`super::SYNCPT_NONE`].
    pub const SYNCPT_RW_OFFSET: usize = 2;
    /// Read-write syncpoint region size in bytes.
    pub const SYNCPT_RW_SIZE: usize = 3;
}

/// Sentinel written to the syncpoint offset slots when no syncpoint
/// region is configured.
pub const SYNCPT_NONE: u32 = 0xFFFF_FFFF;

/// Boot-parameter flag bits (semaphore slot 0). All other bits reserved,
/// written as zero.
pub mod bootparam {
    /// Disable clock gating while firmware runs.
    pub const DISABLE_CLOCK_GATING: u32 = 1 << 20;
    /// Enable firmware test mode.
    pub const TEST_MODE: u32 = 1 << 18;
    /// Select the alternate pixel-packing format for capture surfaces.
    pub const ALT_PIXEL_PACKING: u32 = 1 << 17;
}

// ── Mailboxes ────────────────────────────────────────────────────────────────
// Sixteen 32-bit mailboxes. Mailboxes 1–4 carry host→firmware boot words;
// the final mailbox is the firmware→host message channel: it holds the
// message header, and message payload words stage in mailboxes 0..14 so a
// maximum-length message fits the array. The channel's side-band bits
// ("full", interrupt) live in MBOX_MSG_CTRL.

/// Base of the mailbox register array.
pub const MBOX_BASE: usize = 0x0200;
/// Stride between mailbox registers.
pub const MBOX_STRIDE: usize = 0x4;
/// Number of mailbox registers.
pub const MBOX_COUNT: usize = 16;

/// Byte offset of mailbox `n`.
#[must_use]
pub const fn mbox(n: usize) -> usize {
    MBOX_BASE + n * MBOX_STRIDE
}

/// Fixed host→firmware mailbox assignments, consumed by firmware to finish
/// its own segment-register programming when it owns those registers.
pub mod mbox_slot {
    /// User segment base IOVA, low 32 bits.
    pub const USER_SEG_LO: usize = 1;
    /// User segment base IOVA, high 32 bits.
    pub const USER_SEG_HI: usize = 2;
    /// Priv2 segment base IOVA, low 32 bits.
    pub const PRIV2_SEG_LO: usize = 3;
    /// Priv2 segment base IOVA, high 32 bits.
    pub const PRIV2_SEG_HI: usize = 4;
    /// Firmware→host message channel (the final mailbox).
    pub const MSG: usize = 15;
}

/// Side-band control/status register of the message mailbox. Shares the
/// write-one-to-clear discipline of [`IRQ_STATUS`]: clearing the interrupt
/// bit must preserve the FULL flag, which firmware expects the host to
/// clear explicitly once it has drained the payload.
pub const MBOX_MSG_CTRL: usize = 0x0240;

/// Bits of [`MBOX_MSG_CTRL`].
pub mod mbox_ctrl {
    /// Message interrupt pending.
    pub const IRQ: u32 = 1 << 0;
    /// Mailbox full — firmware will not post another message until clear.
    pub const FULL: u32 = 1 << 1;
}

/// Size of the control window in bytes.
pub const CONTROL_WINDOW_SIZE: usize = 0x1000;
