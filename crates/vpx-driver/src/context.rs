//! Device context: configuration, collaborator handles, and the fatal path.
//!
//! One [`DeviceContext`] is constructed per attached device and passed by
//! reference to every operation — there is no process-wide singleton. The
//! boot-completion semaphore is reinitialized per boot attempt; the
//! context itself lives until device detach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vpx_chip::regs;

use crate::debuglog::DebugRegion;
use crate::hal::{DeviceFault, DeviceMemory, FaultSink, InterruptController, RegisterIo};
use crate::sync::{BoundedWait, CondvarSemaphore};

/// Where the driver is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Production silicon.
    Silicon,
    /// Pre-silicon simulation or emulation. Firewall LOCK bits are masked
    /// out of every write here so test tooling can reprogram them.
    Simulation,
}

/// Where the firmware binary comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareSource {
    /// Host file, copied into device-visible memory at boot.
    HostFile,
    /// Secure carveout placed before the host driver starts.
    SecureCarveout,
}

/// Silicon generation, as far as this core cares: whether firmware
/// traffic is split across two IOMMU VM contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGeneration {
    /// Single VM context for all firmware traffic.
    Gen1,
    /// Code/data and debug traffic in separate VM contexts.
    Gen2,
}

/// Stream-ID assignments per VM context.
#[derive(Debug, Clone, Copy)]
pub struct StreamIds {
    /// Code/data context (the only one on [`ChipGeneration::Gen1`]).
    pub ctx0: u32,
    /// Debug context ([`ChipGeneration::Gen2`] only).
    pub ctx1: u32,
}

/// Syncpoint region the runtime exposes to firmware, if any.
#[derive(Debug, Clone, Copy)]
pub struct SyncptRegion {
    /// IOVA of the read-only syncpoint aperture.
    pub ro_base: u64,
    /// IOVA of the read-write syncpoint aperture.
    pub rw_base: u64,
    /// Size of the read-write aperture in bytes.
    pub rw_size: u32,
}

/// Static configuration for one device instance.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Silicon or simulation target.
    pub platform: Platform,
    /// Firmware origin.
    pub firmware_source: FirmwareSource,
    /// A hypervisor mediates segment-register access. Combined with a
    /// secure-carveout firmware source, the host writes the all-ones
    /// window sentinel and the hypervisor substitutes real values.
    pub hypervisor_mediated: bool,
    /// Silicon generation.
    pub generation: ChipGeneration,
    /// Firmware owns its segment registers and finishes programming them
    /// itself from the base addresses the host leaves in mailboxes 1–4.
    pub fw_programs_segments: bool,
    /// Stream-ID routing table.
    pub stream_ids: StreamIds,
    /// Syncpoint region, absent on headless configurations.
    pub syncpoints: Option<SyncptRegion>,
    /// Boot-parameter flag: firmware test mode.
    pub test_mode: bool,
    /// Boot-parameter flag: alternate pixel-packing format.
    pub alt_pixel_packing: bool,
    /// Boot-parameter flag: keep clocks ungated.
    pub disable_clock_gating: bool,
}

impl DeviceConfig {
    /// Plain silicon configuration with host-loaded firmware.
    #[must_use]
    pub const fn silicon(stream_ids: StreamIds) -> Self {
        Self {
            platform: Platform::Silicon,
            firmware_source: FirmwareSource::HostFile,
            hypervisor_mediated: false,
            generation: ChipGeneration::Gen2,
            fw_programs_segments: false,
            stream_ids,
            syncpoints: None,
            test_mode: false,
            alt_pixel_packing: false,
            disable_clock_gating: false,
        }
    }

    /// Whether the segment windows get the hypervisor passthrough
    /// sentinel instead of computed values.
    #[must_use]
    pub const fn windows_are_mediated(&self) -> bool {
        self.hypervisor_mediated
            && matches!(self.firmware_source, FirmwareSource::SecureCarveout)
    }
}

/// Per-device state shared by the boot sequencer, the mailbox router and
/// the higher-level runtime.
pub struct DeviceContext {
    config: DeviceConfig,
    regs: Arc<dyn RegisterIo>,
    memory: Arc<dyn DeviceMemory>,
    irq: Arc<dyn InterruptController>,
    faults: Arc<dyn FaultSink>,
    boot_sema: Box<dyn BoundedWait>,
    /// Debug region, present while firmware is loaded.
    debug: Mutex<Option<DebugRegion>>,
    /// Sticky: a fatal device error occurred; the runtime refuses new
    /// submissions until recovery completes.
    recovery_needed: AtomicBool,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("config", &self.config)
            .field("recovery_needed", &self.recovery_needed)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Build a context over the platform collaborators.
    pub fn new(
        config: DeviceConfig,
        regs: Arc<dyn RegisterIo>,
        memory: Arc<dyn DeviceMemory>,
        irq: Arc<dyn InterruptController>,
        faults: Arc<dyn FaultSink>,
    ) -> Self {
        Self {
            config,
            regs,
            memory,
            irq,
            faults,
            boot_sema: Box::new(CondvarSemaphore::new()),
            debug: Mutex::new(None),
            recovery_needed: AtomicBool::new(false),
        }
    }

    /// Device configuration.
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Register access collaborator.
    #[must_use]
    pub fn regs(&self) -> &dyn RegisterIo {
        &*self.regs
    }

    /// Device-memory collaborator.
    #[must_use]
    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    /// Interrupt-binding collaborator.
    #[must_use]
    pub fn irq(&self) -> &dyn InterruptController {
        &*self.irq
    }

    /// Fault-reporting collaborator.
    #[must_use]
    pub fn faults(&self) -> &dyn FaultSink {
        &*self.faults
    }

    /// Boot-completion semaphore: posted once per boot attempt by the
    /// message path, consumed by the booting thread.
    #[must_use]
    pub fn boot_sema(&self) -> &dyn BoundedWait {
        &*self.boot_sema
    }

    /// Install the debug region (boot) or remove it (unload/unwind).
    pub(crate) fn swap_debug_region(&self, region: Option<DebugRegion>) -> Option<DebugRegion> {
        let mut slot = self.debug.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, region)
    }

    /// IOVA of the installed debug region, if any.
    pub(crate) fn debug_iova(&self) -> Option<u64> {
        let slot = self.debug.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(DebugRegion::iova)
    }

    /// Drain pending firmware prints, if a debug region is installed.
    /// Returns bytes drained.
    pub fn drain_debug_prints(&self) -> usize {
        let slot = self.debug.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map_or(0, DebugRegion::drain_prints)
    }

    /// Whether a fatal error has parked the device.
    #[must_use]
    pub fn recovery_needed(&self) -> bool {
        self.recovery_needed.load(Ordering::Acquire)
    }

    /// Mark the device as needing recovery.
    pub fn set_recovery_needed(&self) {
        self.recovery_needed.store(true, Ordering::Release);
    }

    /// Clear the recovery flag once the runtime has recovered the device.
    pub fn clear_recovery_needed(&self) {
        self.recovery_needed.store(false, Ordering::Release);
    }

    /// The fatal-abort path. Callable from interrupt context (watchdog,
    /// transport error) and thread context (boot timeout, decode fault);
    /// it may race a running handler, so it only performs register
    /// writes, atomics and the lock-free controller mask — never a lock a
    /// handler can hold.
    pub fn fatal(&self, fault: DeviceFault) {
        self.irq.mask_all();
        self.regs.write32(regs::IRQ_ENABLE, 0);
        self.set_recovery_needed();
        tracing::error!(?fault, "fatal device error, interrupts disabled");
        self.faults.report(fault);
    }
}
