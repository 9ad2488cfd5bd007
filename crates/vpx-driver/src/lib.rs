//! Userspace control core for the VPX500 vision co-processor.
//!
//! The VPX500 is a secondary accelerator the host brings up by hand:
//! program its segment windows and stream-ID routing, leave boot
//! parameters in hardware semaphores and mailboxes, release it from
//! reset, then talk to its firmware over a mailbox/interrupt channel.
//! This crate is that control core plus the device-memory pool the
//! runtime allocates its fixed-size scratch buffers from.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ boot_firmware ┌─────────────┐  messages  ┌───────────┐
//! │ boot::*    │──────────────▶│  VPX500 fw  │───────────▶│ mbox::*   │
//! │ (rollback  │   registers,  │             │  mailbox + │ (ISR path)│
//! │  stack)    │   semaphores  │             │  interrupt │           │
//! └────────────┘               └─────────────┘            └─────┬─────┘
//!        ▲                                                      │
//!        │ boot-done post            decoded by vpx_chip::msg   ▼
//!        └──────────────────────────────────────────── handler::dispatch
//! ```
//!
//! The pool ([`BufferPool`]) is independent of boot and messaging; it
//! needs only the [`hal::DeviceMemory`] collaborator.
//!
//! # Backends
//!
//! ```text
//! Hardware:   uio::UioDevice + uio::UioIrq   (Linux UIO platform device)
//! Development / CI: sim::SimDevice           (host memory, no hardware)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod boot;
pub mod context;
pub mod debuglog;
mod error;
pub mod hal;
mod handler;
pub mod mbox;
pub mod pool;
pub mod sim;
mod slots;
pub mod sync;
pub mod uio;

pub use boot::{boot_firmware, force_reset, FirmwareImage, LoadedFirmware, BOOT_TIMEOUT};
pub use context::{
    ChipGeneration, DeviceConfig, DeviceContext, FirmwareSource, Platform, StreamIds, SyncptRegion,
};
pub use error::{Result, VpxError};
pub use hal::{
    DeviceFault, DeviceMemory, DmaBuf, FaultSink, InterruptController, LogFaultSink, VmContext,
};
pub use mbox::MailboxRouter;
pub use pool::{BufferPool, PoolConfig, PoolElement, PoolStats};
pub use slots::{BitmapSlots, SlotAllocator};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        boot_firmware, BufferPool, DeviceConfig, DeviceContext, FirmwareImage, LoadedFirmware,
        MailboxRouter, PoolConfig, Result, StreamIds, VpxError,
    };
}
