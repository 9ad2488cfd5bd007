//! Mailbox interrupt router.
//!
//! [`MailboxRouter::handle_aggregate`] is the handler bound to the
//! device's aggregate interrupt line. It runs in interrupt-service
//! context: one status read, field-masked clears, no waiting. Watchdog
//! and transport-error conditions escalate to the fatal path immediately;
//! the mailbox-pending condition pulls a length-prefixed message out of
//! the mailbox registers and hands it to the dispatcher.
//!
//! Status clearing is write-one-to-clear and strictly per sub-field: a
//! clear for the watchdog bits must not touch a mailbox bit that arrived
//! between the read and the write.

use std::sync::{Arc, RwLock};

use vpx_chip::msg::{header_len, MAX_WORDS};
use vpx_chip::regs::{self, irq, mbox, mbox_ctrl, mbox_slot, queue, QUEUE_COUNT};

use crate::context::DeviceContext;
use crate::error::{Result, VpxError};
use crate::handler::dispatch;
use crate::hal::DeviceFault;

/// Handler for one per-queue interrupt line; receives the interface id.
pub type QueueHandler = Arc<dyn Fn(u8) + Send + Sync>;

/// Routes the device's interrupt conditions: aggregate line to the
/// message dispatcher or the fatal path, per-queue lines to their bound
/// handlers.
pub struct MailboxRouter {
    ctx: Arc<DeviceContext>,
    /// One slot per logical command queue; `None` is the unbound state.
    queues: [RwLock<Option<QueueHandler>>; QUEUE_COUNT],
}

impl std::fmt::Debug for MailboxRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound: Vec<usize> = (0..QUEUE_COUNT)
            .filter(|&i| {
                self.queues[i]
                    .read()
                    .map(|slot| slot.is_some())
                    .unwrap_or(false)
            })
            .collect();
        f.debug_struct("MailboxRouter")
            .field("bound_queues", &bound)
            .finish_non_exhaustive()
    }
}

impl MailboxRouter {
    /// Create a router for the device behind `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<DeviceContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queues: std::array::from_fn(|_| RwLock::new(None)),
        })
    }

    /// Service the aggregate interrupt line.
    pub fn handle_aggregate(&self) {
        let regs_io = self.ctx.regs();
        let status = regs_io.read32(regs::IRQ_STATUS);

        if status & irq::WDT != 0 {
            regs_io.write32(regs::IRQ_STATUS, status & irq::WDT);
            self.ctx.fatal(DeviceFault::Watchdog);
            return;
        }

        if status & irq::XPORT_MASK != 0 {
            regs_io.write32(regs::IRQ_STATUS, status & irq::XPORT_MASK);
            let ports = (status & irq::XPORT_MASK) >> irq::XPORT_SHIFT;
            self.ctx.fatal(DeviceFault::Transport(ports));
            return;
        }

        if status & irq::MBOX != 0 {
            self.service_message();
            regs_io.write32(regs::IRQ_STATUS, status & irq::MBOX);
        }
    }

    /// Pull one message out of the mailbox registers and dispatch it.
    fn service_message(&self) {
        let regs_io = self.ctx.regs();

        let word0 = regs_io.read32(mbox(mbox_slot::MSG));
        let len = header_len(word0);
        if len == 0 || len > MAX_WORDS {
            self.ctx.fatal(DeviceFault::Internal(format!(
                "mailbox message length {len} outside 1..={MAX_WORDS}"
            )));
            return;
        }

        let mut words = [0u32; MAX_WORDS];
        words[0] = word0;
        for (i, word) in words.iter_mut().enumerate().take(len).skip(1) {
            *word = regs_io.read32(mbox(i - 1));
        }

        dispatch(&self.ctx, &words[..len]);

        // Clear the message interrupt bit without touching FULL, then
        // release FULL so firmware can stage the next message.
        regs_io.write32(regs::MBOX_MSG_CTRL, mbox_ctrl::IRQ);
        regs_io.write32(regs::MBOX_MSG_CTRL, mbox_ctrl::FULL);
    }

    /// Bind a handler to the per-queue line `id`.
    ///
    /// # Errors
    ///
    /// [`VpxError::InvalidState`] for an out-of-range id or a line that
    /// is already bound.
    pub fn bind_queue(&self, id: u8, handler: QueueHandler) -> Result<()> {
        let slot = self
            .queues
            .get(id as usize)
            .ok_or_else(|| VpxError::invalid_state(format!("queue id {id} out of range")))?;
        let mut slot = slot.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(VpxError::invalid_state(format!("queue {id} already bound")));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Release the binding for queue `id`. Idempotent; out-of-range ids
    /// are ignored.
    pub fn release_queue(&self, id: u8) {
        if let Some(slot) = self.queues.get(id as usize) {
            *slot.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    /// Service one per-queue interrupt line: read status, dispatch if
    /// data is available, clear the bit field-masked.
    pub fn handle_queue(&self, id: u8) {
        let Some(slot) = self.queues.get(id as usize) else {
            return;
        };
        let reg = regs::QUEUE_IRQ_STATUS_BASE + id as usize * regs::QUEUE_IRQ_STATUS_STRIDE;
        let regs_io = self.ctx.regs();
        let status = regs_io.read32(reg);
        if status & queue::DATA_AVAIL == 0 {
            return;
        }

        // Clone the handler out of the slot so the lock is not held
        // across the callback.
        let handler = slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone);
        if let Some(handler) = handler {
            handler(id);
        } else {
            tracing::warn!(queue = id, "data-available interrupt on unbound queue");
        }
        regs_io.write32(reg, status & queue::DATA_AVAIL);
    }

    /// The device context this router serves.
    #[must_use]
    pub fn ctx(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }
}
