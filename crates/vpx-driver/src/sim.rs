// SPDX-License-Identifier: AGPL-3.0-only

//! Software device.
//!
//! Implements every collaborator seam against host memory so the whole
//! control core — boot sequencing, mailbox messaging, the buffer pool —
//! runs without hardware. Tests drive the firmware side of the contract
//! through the injection helpers: post a message, raise status bits,
//! fail the next mapping, drop writes to a register.
//!
//! Register semantics mirror the silicon where the core depends on them:
//! the interrupt status registers and the mailbox control register are
//! write-one-to-clear, everything else is plain read/write.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vpx_chip::regs::{self, irq, mbox, mbox_ctrl, mbox_slot, CONTROL_WINDOW_SIZE, QUEUE_COUNT};

use crate::error::{Result, VpxError};
use crate::hal::{
    DeviceFault, DeviceMemory, DmaBuf, FaultSink, InterruptController, IrqHandler, IrqLine,
    RegisterIo, VmContext,
};

/// Map/unmap call counters, shared with every buffer the device hands out.
#[derive(Debug, Default)]
struct MemCounters {
    mapped: AtomicUsize,
    unmapped: AtomicUsize,
}

/// One simulated device-visible buffer: page-aligned zeroed host memory
/// with a bump-assigned IOVA.
#[derive(Debug)]
struct SimDmaBuf {
    ptr: NonNull<u8>,
    len: usize,
    iova: u64,
    counters: Arc<MemCounters>,
}

// SAFETY: Send/Sync - the buffer owns its allocation exclusively; reads
// and writes through the pointer are the caller's unsafe code, as with a
// real mapping.
unsafe impl Send for SimDmaBuf {}
// SAFETY: see above.
unsafe impl Sync for SimDmaBuf {}

impl DmaBuf for SimDmaBuf {
    fn iova(&self) -> u64 {
        self.iova
    }

    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SimDmaBuf {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len, 4096)
            .expect("layout was valid at allocation");
        // SAFETY: ptr came from alloc_zeroed with this exact layout in
        // SimDevice::alloc and Drop runs at most once.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        self.counters.unmapped.fetch_add(1, Ordering::SeqCst);
    }
}

/// The software device. One instance stands in for register access,
/// device memory and the interrupt controller at once.
pub struct SimDevice {
    regs: Mutex<Vec<u32>>,
    /// Writes to these offsets are silently dropped (readback then
    /// mismatches, as on a misconfigured firewall port).
    dead_regs: Mutex<HashSet<usize>>,
    counters: Arc<MemCounters>,
    next_iova: AtomicU64,
    fail_next_alloc: AtomicBool,
    fail_next_bind: AtomicBool,
    handlers: Mutex<HashMap<IrqLine, IrqHandler>>,
    masked: AtomicBool,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("mapped", &self.mapped())
            .field("unmapped", &self.unmapped())
            .field("masked", &self.masked)
            .finish_non_exhaustive()
    }
}

impl SimDevice {
    /// A fresh device: registers zeroed, nothing mapped, nothing bound.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(vec![0; CONTROL_WINDOW_SIZE / 4]),
            dead_regs: Mutex::new(HashSet::new()),
            counters: Arc::new(MemCounters::default()),
            next_iova: AtomicU64::new(0x1000_0000),
            fail_next_alloc: AtomicBool::new(false),
            fail_next_bind: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
            masked: AtomicBool::new(false),
        }
    }

    fn is_w1c(offset: usize) -> bool {
        offset == regs::IRQ_STATUS
            || offset == regs::MBOX_MSG_CTRL
            || (regs::QUEUE_IRQ_STATUS_BASE
                ..regs::QUEUE_IRQ_STATUS_BASE + QUEUE_COUNT * regs::QUEUE_IRQ_STATUS_STRIDE)
                .contains(&offset)
    }

    fn word(offset: usize) -> usize {
        assert!(
            offset % 4 == 0 && offset + 4 <= CONTROL_WINDOW_SIZE,
            "register offset {offset:#x} out of bounds"
        );
        offset / 4
    }

    // ── Test / firmware-side injection helpers ───────────────────────────

    /// Raw register value, for assertions.
    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())[Self::word(offset)]
    }

    /// OR bits into a register without write-one-to-clear semantics, as
    /// the hardware would when raising a condition.
    pub fn raise(&self, offset: usize, bits: u32) {
        let mut regs = self.regs.lock().unwrap_or_else(|e| e.into_inner());
        regs[Self::word(offset)] |= bits;
    }

    /// Fail the next [`DeviceMemory::alloc`] call.
    pub fn fail_next_alloc(&self) {
        self.fail_next_alloc.store(true, Ordering::SeqCst);
    }

    /// Fail the next [`InterruptController::bind`] call.
    pub fn fail_next_bind(&self) {
        self.fail_next_bind.store(true, Ordering::SeqCst);
    }

    /// Silently drop all future writes to `offset`.
    pub fn kill_register(&self, offset: usize) {
        self.dead_regs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(offset);
    }

    /// Mappings established so far.
    pub fn mapped(&self) -> usize {
        self.counters.mapped.load(Ordering::SeqCst)
    }

    /// Mappings released so far.
    pub fn unmapped(&self) -> usize {
        self.counters.unmapped.load(Ordering::SeqCst)
    }

    /// Mappings currently live.
    pub fn live_mappings(&self) -> usize {
        self.mapped() - self.unmapped()
    }

    /// Whether the controller-level mask is engaged.
    pub fn irq_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst)
    }

    /// Whether `line` currently has a bound handler.
    pub fn is_bound(&self, line: IrqLine) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&line)
    }

    /// Deliver an interrupt on `line`: invoke the bound handler unless
    /// the controller mask is engaged. The handler runs with no simulator
    /// lock held, as a real controller would deliver it.
    pub fn fire(&self, line: IrqLine) {
        if self.masked.load(Ordering::SeqCst) {
            return;
        }
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&line)
            .map(Arc::clone);
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Stage a firmware→host message in the mailboxes, set the pending
    /// bits and deliver the aggregate interrupt.
    pub fn post_message(&self, words: &[u32]) {
        assert!(!words.is_empty() && words.len() <= regs::MBOX_COUNT);
        {
            let mut regs_v = self.regs.lock().unwrap_or_else(|e| e.into_inner());
            regs_v[Self::word(mbox(mbox_slot::MSG))] = words[0];
            for (i, &word) in words.iter().enumerate().skip(1) {
                regs_v[Self::word(mbox(i - 1))] = word;
            }
            regs_v[Self::word(regs::MBOX_MSG_CTRL)] |= mbox_ctrl::IRQ | mbox_ctrl::FULL;
            regs_v[Self::word(regs::IRQ_STATUS)] |= irq::MBOX;
        }
        self.fire(IrqLine::Aggregate);
    }
}

impl RegisterIo for SimDevice {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())[Self::word(offset)]
    }

    fn write32(&self, offset: usize, value: u32) {
        if self
            .dead_regs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&offset)
        {
            return;
        }
        let mut regs_v = self.regs.lock().unwrap_or_else(|e| e.into_inner());
        let word = Self::word(offset);
        if Self::is_w1c(offset) {
            regs_v[word] &= !value;
        } else {
            regs_v[word] = value;
        }
    }
}

impl DeviceMemory for SimDevice {
    fn alloc(&self, ctx: VmContext, len: usize) -> Result<Box<dyn DmaBuf>> {
        if self.fail_next_alloc.swap(false, Ordering::SeqCst) {
            return Err(VpxError::out_of_memory(format!(
                "{len} bytes in {ctx:?} (injected)"
            )));
        }
        assert!(len > 0, "zero-length device mapping");

        let aligned = len.div_ceil(4096) * 4096;
        let layout = std::alloc::Layout::from_size_align(aligned, 4096)
            .map_err(|e| VpxError::out_of_memory(format!("bad layout: {e}")))?;
        // SAFETY: layout has non-zero size and power-of-two alignment;
        // dealloc with the same layout happens in SimDmaBuf::drop.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(VpxError::out_of_memory(format!("{aligned} bytes")));
        };

        let iova = self.next_iova.fetch_add(aligned as u64, Ordering::SeqCst);
        self.counters.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimDmaBuf {
            ptr,
            len: aligned,
            iova,
            counters: Arc::clone(&self.counters),
        }))
    }
}

impl InterruptController for SimDevice {
    fn bind(&self, line: IrqLine, handler: IrqHandler) -> Result<()> {
        if self.fail_next_bind.swap(false, Ordering::SeqCst) {
            return Err(VpxError::invalid_state("interrupt bind rejected (injected)"));
        }
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&line) {
            return Err(VpxError::invalid_state(format!("{line:?} already bound")));
        }
        handlers.insert(line, handler);
        Ok(())
    }

    fn unbind(&self, line: IrqLine) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&line);
    }

    fn mask_all(&self) {
        // Atomics only: this races a running handler by design and must
        // not take any lock a handler path can hold.
        self.masked.store(true, Ordering::SeqCst);
    }
}

/// Fault sink that records every report, for assertions.
#[derive(Debug, Default)]
pub struct RecordingFaultSink {
    faults: Mutex<Vec<DeviceFault>>,
}

impl RecordingFaultSink {
    /// A fresh, empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn reported(&self) -> Vec<DeviceFault> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl FaultSink for RecordingFaultSink {
    fn report(&self, fault: DeviceFault) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault);
    }
}
