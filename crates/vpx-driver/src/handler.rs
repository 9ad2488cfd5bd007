//! Message dispatch: side effects for each decoded message kind.
//!
//! Decoding itself is pure (`vpx_chip::msg`) and tested without any
//! interrupt machinery behind it; this module is the thin layer that
//! turns a decoded [`Message`] into driver state changes. It runs on the
//! interrupt-service path, so everything here is inline computation,
//! logging, or a semaphore post.

use vpx_chip::msg::{decode, Message};

use crate::context::DeviceContext;
use crate::hal::DeviceFault;

/// Decode and act on one assembled mailbox message.
pub(crate) fn dispatch(ctx: &DeviceContext, words: &[u32]) {
    match decode(words) {
        Ok(Message::BootDone { start, end }) => {
            tracing::info!(
                fw_init_start = start,
                fw_init_end = end,
                ticks = end.wrapping_sub(start),
                "firmware boot complete"
            );
            ctx.boot_sema().post();
        }
        Ok(Message::Abort(reason)) => {
            // Drain before logging the abort so the diagnostic string is
            // not interleaved with stale trace output.
            ctx.drain_debug_prints();
            tracing::error!(%reason, "firmware abort");
            ctx.fatal(DeviceFault::FirmwareAbort(reason));
        }
        Ok(Message::FlushPrint) => {
            ctx.drain_debug_prints();
        }
        Ok(Message::FastResetFailure) => {
            tracing::error!("firmware fast reset failed");
            ctx.faults().report(DeviceFault::FastResetFailure);
            ctx.set_recovery_needed();
        }
        Err(e) => {
            // The protocol guarantees exactly four types; anything else
            // is an internal-consistency failure, never ignored.
            ctx.fatal(DeviceFault::Internal(e.to_string()));
        }
    }
}
