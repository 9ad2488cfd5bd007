//! Firmware boot sequencer.
//!
//! Boot is a linear sequence of hardware side effects: program the segment
//! windows, allocate the debug region, program security and stream-ID
//! routing, leave the boot words in the hardware semaphores and mailboxes,
//! bind the interrupt, release reset, and wait for the firmware's
//! boot-done message. Any failure unwinds every side effect already
//! performed, in strict reverse order: each completed step is pushed onto
//! a stack with a matching inverse, and rollback pops and undoes.
//!
//! Success hands back a [`LoadedFirmware`] guard owning the debug region,
//! the interrupt binding and the staged firmware image; dropping it (or
//! calling [`LoadedFirmware::unload`]) runs the symmetric unload path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use vpx_chip::layout::{
    debug_region_size, page_align, DEBUG_SEG_VA, SEG_WINDOW_PASSTHROUGH, SYNCPT_VA_ORIGIN,
    USER_SEG_MAX, USER_SEG_VA,
};
use vpx_chip::regs::{self, bootparam, firewall, irq, mbox, mbox_slot, reset, sema, sema_slot};

use crate::context::{ChipGeneration, DeviceContext, Platform};
use crate::debuglog::DebugRegion;
use crate::error::{Result, VpxError};
use crate::hal::{DeviceFault, DmaBuf, IrqLine, VmContext};
use crate::mbox::MailboxRouter;

/// Default bound on the boot-completion wait.
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(3);

/// The firmware binary to run.
#[derive(Debug, Clone)]
pub enum FirmwareImage {
    /// Host-loaded binary, copied into device-visible memory at boot and
    /// released at unload.
    HostLoaded {
        /// The binary contents.
        image: Bytes,
    },
    /// Binary pre-placed in a secure carveout; the host never touches it.
    Carveout {
        /// Device-visible base of the carveout.
        base: u64,
        /// Carveout size in bytes.
        len: usize,
    },
}

/// A completed boot step, pushed after its side effect lands. Rollback
/// pops and runs each step's inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    FirmwareStaged,
    WindowsProgrammed,
    DebugAllocated,
    SecurityProgrammed,
    StreamIdsProgrammed,
    BootWordsWritten,
    IrqBound,
    ResetReleased,
}

struct BootAttempt<'a> {
    ctx: &'a DeviceContext,
    fw_mem: Option<Box<dyn DmaBuf>>,
    completed: Vec<Step>,
}

/// Boot the firmware described by `image` on the device behind `ctx`,
/// delivering mailbox interrupts to `router`.
///
/// # Errors
///
/// - [`VpxError::InvalidState`] if the device is parked awaiting recovery
///   or a programmed register fails readback verification;
/// - [`VpxError::OutOfMemory`] if the firmware staging or debug-region
///   mapping fails;
/// - [`VpxError::TimedOut`] (with the boot checkpoint) if firmware never
///   signals boot-done.
///
/// On any failure every side effect already performed has been undone.
pub fn boot_firmware(
    ctx: &Arc<DeviceContext>,
    router: &Arc<MailboxRouter>,
    image: &FirmwareImage,
    timeout: Duration,
) -> Result<LoadedFirmware> {
    if ctx.recovery_needed() {
        return Err(VpxError::invalid_state("device parked, recovery needed"));
    }
    // Reinitialize the completion semaphore for this attempt; a stale post
    // from a torn-down attempt must not satisfy this wait.
    ctx.boot_sema().drain();

    let mut attempt = BootAttempt {
        ctx: &**ctx,
        fw_mem: None,
        completed: Vec::new(),
    };
    match attempt.run(router, image, timeout) {
        Ok(()) => {
            tracing::info!("firmware booted");
            Ok(LoadedFirmware {
                ctx: Arc::clone(ctx),
                router: Arc::clone(router),
                fw_mem: attempt.fw_mem.take(),
                torn_down: false,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "boot failed, unwinding");
            attempt.unwind();
            Err(e)
        }
    }
}

impl BootAttempt<'_> {
    fn run(
        &mut self,
        router: &Arc<MailboxRouter>,
        image: &FirmwareImage,
        timeout: Duration,
    ) -> Result<()> {
        let (fw_iova, fw_len) = self.stage_firmware(image)?;
        self.program_windows(fw_len);
        self.completed.push(Step::WindowsProgrammed);

        let region = DebugRegion::new(&**self.ctx.memory())?;
        self.ctx.swap_debug_region(Some(region));
        self.completed.push(Step::DebugAllocated);

        self.program_security()?;
        self.completed.push(Step::SecurityProgrammed);

        self.program_stream_ids()?;
        self.completed.push(Step::StreamIdsProgrammed);

        self.write_boot_words(fw_iova)?;
        self.completed.push(Step::BootWordsWritten);

        self.bind_irq(router)?;
        self.completed.push(Step::IrqBound);

        self.ctx.regs().write32(regs::RESET_CTRL, reset::RELEASE);
        self.completed.push(Step::ResetReleased);
        tracing::debug!("reset released, awaiting boot-done");

        self.await_boot(timeout)
    }

    /// Copy a host-loaded image into device-visible memory; a carveout
    /// image is already placed.
    fn stage_firmware(&mut self, image: &FirmwareImage) -> Result<(u64, usize)> {
        match image {
            FirmwareImage::HostLoaded { image } => {
                let len = page_align(image.len());
                if len == 0 || len as u64 > USER_SEG_MAX {
                    return Err(VpxError::invalid_state(format!(
                        "firmware image size {} outside the user window",
                        image.len()
                    )));
                }
                let mem = self.ctx.memory().alloc(VmContext::Ctx0, len).map_err(|e| match e {
                    VpxError::OutOfMemory { what } => VpxError::OutOfMemory {
                        what: format!("firmware image ({what})"),
                    },
                    other => other,
                })?;
                // SAFETY: the mapping is at least image.len() bytes (len is
                // the page-aligned image size) and freshly allocated, so the
                // ranges cannot overlap.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        image.as_ptr(),
                        mem.as_ptr().as_ptr(),
                        image.len(),
                    );
                }
                let iova = mem.iova();
                self.fw_mem = Some(mem);
                self.completed.push(Step::FirmwareStaged);
                tracing::debug!(iova, len, "firmware staged");
                Ok((iova, len))
            }
            FirmwareImage::Carveout { base, len } => Ok((*base, *len)),
        }
    }

    /// Program the two segment windows as [start, end) pairs at their
    /// fixed VA bases — or the all-ones sentinel when a mediating
    /// hypervisor owns the registers and will substitute real values.
    fn program_windows(&self, fw_len: usize) {
        let regs_io = self.ctx.regs();
        if self.ctx.config().windows_are_mediated() {
            for reg in [
                regs::SEG_USER_START,
                regs::SEG_USER_END,
                regs::SEG_DEBUG_START,
                regs::SEG_DEBUG_END,
            ] {
                regs_io.write32(reg, SEG_WINDOW_PASSTHROUGH);
            }
            return;
        }
        regs_io.write32(regs::SEG_USER_START, USER_SEG_VA as u32);
        regs_io.write32(regs::SEG_USER_END, (USER_SEG_VA + fw_len as u64) as u32);
        regs_io.write32(regs::SEG_DEBUG_START, DEBUG_SEG_VA as u32);
        regs_io.write32(
            regs::SEG_DEBUG_END,
            (DEBUG_SEG_VA + debug_region_size() as u64) as u32,
        );
    }

    /// Write a register and verify it took. Security and routing
    /// registers sit behind a firewall port that silently drops writes in
    /// some partition configurations; a dropped write must fail the boot,
    /// not surface later as a firmware fault.
    fn write_checked(&self, offset: usize, value: u32) -> Result<()> {
        let regs_io = self.ctx.regs();
        regs_io.write32(offset, value);
        let got = regs_io.read32(offset);
        if got != value {
            return Err(VpxError::invalid_state(format!(
                "register {offset:#x} readback {got:#x}, wrote {value:#x}"
            )));
        }
        Ok(())
    }

    fn program_security(&self) -> Result<()> {
        let mut user = firewall::USER_PATTERN;
        let mut debug = firewall::DEBUG_PATTERN;
        if self.ctx.config().platform == Platform::Simulation {
            // Keep the registers mutable for test tooling.
            user &= !firewall::LOCK;
            debug &= !firewall::LOCK;
        }
        self.write_checked(regs::SEC_USER_CFG, user)?;
        if let Err(e) = self.write_checked(regs::SEC_DEBUG_CFG, debug) {
            // A half-programmed step is not on the rollback stack; clean
            // it here so the unwind sees all-or-nothing steps.
            self.ctx.regs().write32(regs::SEC_USER_CFG, 0);
            return Err(e);
        }
        Ok(())
    }

    fn program_stream_ids(&self) -> Result<()> {
        let ids = self.ctx.config().stream_ids;
        match self.ctx.config().generation {
            ChipGeneration::Gen1 => self.write_checked(regs::STREAM_ID_ALL, ids.ctx0),
            ChipGeneration::Gen2 => {
                self.write_checked(regs::STREAM_ID_CTX0, ids.ctx0)?;
                if let Err(e) = self.write_checked(regs::STREAM_ID_CTX1, ids.ctx1) {
                    self.ctx
                        .regs()
                        .write32(regs::STREAM_ID_CTX0, regs::STREAM_ID_INVALID);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Leave the boot words where firmware looks first: flags and
    /// syncpoint geometry in the hardware semaphores, segment bases in
    /// mailboxes 1–4 when firmware finishes its own segment programming.
    fn write_boot_words(&self, fw_iova: u64) -> Result<()> {
        let cfg = self.ctx.config();
        let regs_io = self.ctx.regs();

        // Compute everything fallible first; the register writes below
        // are then all-or-nothing as far as the rollback stack sees.
        let syncpt_words = match cfg.syncpoints {
            Some(sp) => {
                let ro = sp
                    .ro_base
                    .checked_sub(SYNCPT_VA_ORIGIN)
                    .ok_or_else(|| VpxError::invalid_state("RO syncpoint base below VA origin"))?;
                let rw = sp
                    .rw_base
                    .checked_sub(SYNCPT_VA_ORIGIN)
                    .ok_or_else(|| VpxError::invalid_state("RW syncpoint base below VA origin"))?;
                [ro as u32, rw as u32, sp.rw_size]
            }
            None => [regs::SYNCPT_NONE, regs::SYNCPT_NONE, 0],
        };
        let debug_iova = if cfg.fw_programs_segments {
            Some(
                self.ctx
                    .debug_iova()
                    .ok_or_else(|| VpxError::invalid_state("debug region missing"))?,
            )
        } else {
            None
        };

        let mut params = 0;
        if cfg.disable_clock_gating {
            params |= bootparam::DISABLE_CLOCK_GATING;
        }
        if cfg.test_mode {
            params |= bootparam::TEST_MODE;
        }
        if cfg.alt_pixel_packing {
            params |= bootparam::ALT_PIXEL_PACKING;
        }
        regs_io.write32(sema(sema_slot::BOOT_PARAMS), params);
        regs_io.write32(sema(sema_slot::SYNCPT_RO_OFFSET), syncpt_words[0]);
        regs_io.write32(sema(sema_slot::SYNCPT_RW_OFFSET), syncpt_words[1]);
        regs_io.write32(sema(sema_slot::SYNCPT_RW_SIZE), syncpt_words[2]);

        if let Some(debug_iova) = debug_iova {
            regs_io.write32(mbox(mbox_slot::USER_SEG_LO), fw_iova as u32);
            regs_io.write32(mbox(mbox_slot::USER_SEG_HI), (fw_iova >> 32) as u32);
            regs_io.write32(mbox(mbox_slot::PRIV2_SEG_LO), debug_iova as u32);
            regs_io.write32(mbox(mbox_slot::PRIV2_SEG_HI), (debug_iova >> 32) as u32);
        }
        Ok(())
    }

    /// Bind the mailbox handler, then enable the boot interrupt lines.
    /// Enable comes second so a failed bind leaves nothing to undo.
    fn bind_irq(&self, router: &Arc<MailboxRouter>) -> Result<()> {
        let r = Arc::clone(router);
        self.ctx
            .irq()
            .bind(IrqLine::Aggregate, Arc::new(move || r.handle_aggregate()))?;
        self.ctx.regs().write32(regs::IRQ_ENABLE, irq::BOOT_LINES);
        Ok(())
    }

    fn await_boot(&self, timeout: Duration) -> Result<()> {
        match self.ctx.boot_sema().wait("firmware boot", timeout) {
            Ok(()) => Ok(()),
            Err(VpxError::TimedOut {
                what, duration_ms, ..
            }) => {
                let checkpoint = self.ctx.regs().read32(regs::BOOT_CHECKPOINT);
                self.ctx.faults().report(DeviceFault::BootTimeout(checkpoint));
                Err(VpxError::TimedOut {
                    what,
                    duration_ms,
                    checkpoint,
                })
            }
            Err(other) => Err(other),
        }
    }

    fn unwind(&mut self) {
        while let Some(step) = self.completed.pop() {
            tracing::debug!(?step, "undoing boot step");
            self.undo(step);
        }
    }

    fn undo(&mut self, step: Step) {
        let ctx = self.ctx;
        let regs_io = ctx.regs();
        match step {
            Step::ResetReleased => force_reset(ctx),
            Step::IrqBound => {
                ctx.irq().unbind(IrqLine::Aggregate);
                regs_io.write32(regs::IRQ_ENABLE, 0);
            }
            Step::BootWordsWritten => {
                for slot in [
                    sema_slot::BOOT_PARAMS,
                    sema_slot::SYNCPT_RO_OFFSET,
                    sema_slot::SYNCPT_RW_OFFSET,
                    sema_slot::SYNCPT_RW_SIZE,
                ] {
                    regs_io.write32(sema(slot), 0);
                }
                for slot in [
                    mbox_slot::USER_SEG_LO,
                    mbox_slot::USER_SEG_HI,
                    mbox_slot::PRIV2_SEG_LO,
                    mbox_slot::PRIV2_SEG_HI,
                ] {
                    regs_io.write32(mbox(slot), 0);
                }
            }
            Step::StreamIdsProgrammed => {
                for reg in [
                    regs::STREAM_ID_ALL,
                    regs::STREAM_ID_CTX0,
                    regs::STREAM_ID_CTX1,
                ] {
                    regs_io.write32(reg, regs::STREAM_ID_INVALID);
                }
            }
            Step::SecurityProgrammed => {
                regs_io.write32(regs::SEC_USER_CFG, 0);
                regs_io.write32(regs::SEC_DEBUG_CFG, 0);
            }
            Step::DebugAllocated => {
                drop(ctx.swap_debug_region(None));
            }
            Step::WindowsProgrammed => {
                for reg in [
                    regs::SEG_USER_START,
                    regs::SEG_USER_END,
                    regs::SEG_DEBUG_START,
                    regs::SEG_DEBUG_END,
                ] {
                    regs_io.write32(reg, 0);
                }
            }
            Step::FirmwareStaged => {
                self.fw_mem = None;
            }
        }
    }
}

/// Force the processor back into reset. Error reporting is disabled
/// first: the reset transient otherwise raises mission/latent error
/// interrupts no handler can service.
pub fn force_reset(ctx: &DeviceContext) {
    let regs_io = ctx.regs();
    regs_io.write32(regs::ERR_MISSION_EN, 0);
    regs_io.write32(regs::ERR_LATENT_EN, 0);
    regs_io.write32(regs::RESET_CTRL, reset::ASSERT);
}

/// Running firmware. Owns the debug region, the interrupt binding and the
/// staged firmware image; drop (or [`LoadedFirmware::unload`]) releases
/// them in the fixed unload order.
#[derive(Debug)]
pub struct LoadedFirmware {
    ctx: Arc<DeviceContext>,
    router: Arc<MailboxRouter>,
    fw_mem: Option<Box<dyn DmaBuf>>,
    torn_down: bool,
}

impl LoadedFirmware {
    /// The router receiving this device's mailbox interrupts.
    #[must_use]
    pub fn router(&self) -> &Arc<MailboxRouter> {
        &self.router
    }

    /// Unload the firmware: unbind the interrupt, drain pending debug
    /// prints, force reset, release debug memory, release the firmware
    /// binary memory if host-loaded.
    pub fn unload(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let ctx = &self.ctx;
        ctx.irq().unbind(IrqLine::Aggregate);
        ctx.regs().write32(regs::IRQ_ENABLE, 0);
        ctx.drain_debug_prints();
        force_reset(ctx);
        drop(ctx.swap_debug_region(None));
        self.fw_mem = None;
        tracing::info!("firmware unloaded");
    }
}

impl Drop for LoadedFirmware {
    fn drop(&mut self) {
        self.teardown();
    }
}
