//! Interrupt routing and message dispatch against the software device:
//! sub-field isolation of the status clears, the four message kinds, and
//! the per-queue handler table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vpx_chip::msg::{encode_abort, encode_bare, encode_boot_done, header, msg_type, ABORT_MAX_LEN};
use vpx_chip::regs::{self, irq, mbox_ctrl, queue};

use vpx_driver::sim::{RecordingFaultSink, SimDevice};
use vpx_driver::{
    DeviceConfig, DeviceContext, DeviceFault, MailboxRouter, Platform, StreamIds,
};

fn setup() -> (Arc<SimDevice>, Arc<RecordingFaultSink>, Arc<MailboxRouter>) {
    let dev = Arc::new(SimDevice::new());
    let faults = Arc::new(RecordingFaultSink::new());
    let config = DeviceConfig {
        platform: Platform::Simulation,
        ..DeviceConfig::silicon(StreamIds { ctx0: 1, ctx1: 2 })
    };
    let ctx = Arc::new(DeviceContext::new(
        config,
        dev.clone(),
        dev.clone(),
        dev.clone(),
        faults.clone(),
    ));
    let router = MailboxRouter::new(ctx);
    (dev, faults, router)
}

// ── Sub-field isolation ──────────────────────────────────────────────────────

#[test]
fn servicing_the_watchdog_preserves_a_concurrent_mailbox_bit() {
    let (dev, faults, router) = setup();
    // A message is staged and, before the host services it, the watchdog
    // also fires: both bits are up in one status read.
    dev.post_message(&encode_bare(msg_type::FLUSH_PRINT)); // no handler bound, bits stay set
    dev.raise(regs::IRQ_STATUS, irq::WDT);

    router.handle_aggregate();

    // The watchdog escalated and its sub-field was cleared; the mailbox
    // bit and the mailbox's own control bits are untouched.
    assert_eq!(faults.reported(), vec![DeviceFault::Watchdog]);
    assert_eq!(dev.reg(regs::IRQ_STATUS), irq::MBOX);
    assert_eq!(
        dev.reg(regs::MBOX_MSG_CTRL),
        mbox_ctrl::IRQ | mbox_ctrl::FULL
    );
    assert!(router.ctx().recovery_needed());
}

#[test]
fn the_mailbox_clear_preserves_a_concurrent_watchdog_bit() {
    let (dev, _faults, router) = setup();
    // The mailbox path's own field-masked clear, with a watchdog bit that
    // arrived between the status read and the write-back.
    dev.raise(regs::IRQ_STATUS, irq::WDT | irq::MBOX);
    router.ctx().regs().write32(regs::IRQ_STATUS, irq::MBOX);
    assert_eq!(dev.reg(regs::IRQ_STATUS), irq::WDT);
}

#[test]
fn transport_errors_escalate_with_their_port_bits() {
    let (dev, faults, router) = setup();
    dev.raise(regs::IRQ_STATUS, 0b0101 << irq::XPORT_SHIFT);

    router.handle_aggregate();

    assert_eq!(faults.reported(), vec![DeviceFault::Transport(0b0101)]);
    assert_eq!(dev.reg(regs::IRQ_STATUS), 0);
    assert!(dev.irq_masked(), "fatal path must mask the device");
}

// ── Message kinds ────────────────────────────────────────────────────────────

#[test]
fn boot_done_posts_the_completion_semaphore() {
    let (dev, faults, router) = setup();
    dev.post_message(&encode_boot_done(7, 11));
    router.handle_aggregate();

    router
        .ctx()
        .boot_sema()
        .wait("boot-done", Duration::from_millis(10))
        .expect("semaphore was not posted");
    assert!(faults.reported().is_empty());
    assert!(!router.ctx().recovery_needed());

    // The message interrupt and FULL flag were both released.
    assert_eq!(dev.reg(regs::MBOX_MSG_CTRL), 0);
    assert_eq!(dev.reg(regs::IRQ_STATUS), 0);
}

#[test]
fn abort_reports_the_decoded_diagnostic_and_parks_the_device() {
    let (dev, faults, router) = setup();
    dev.post_message(&encode_abort("IOMMU fault on tile 3"));
    router.handle_aggregate();

    assert_eq!(
        faults.reported(),
        vec![DeviceFault::FirmwareAbort("IOMMU fault on tile 3".into())]
    );
    assert!(router.ctx().recovery_needed());
    assert!(dev.irq_masked());
}

#[test]
fn abort_strings_truncate_at_the_wire_limit() {
    let (dev, faults, router) = setup();
    let long = "r".repeat(ABORT_MAX_LEN + 5);
    dev.post_message(&encode_abort(&long));
    router.handle_aggregate();

    let reported = faults.reported();
    let [DeviceFault::FirmwareAbort(reason)] = reported.as_slice() else {
        panic!("expected one abort, got {reported:?}");
    };
    assert_eq!(reason.len(), ABORT_MAX_LEN);
}

#[test]
fn flush_print_is_not_a_fault() {
    let (dev, faults, router) = setup();
    dev.post_message(&encode_bare(msg_type::FLUSH_PRINT));
    router.handle_aggregate();

    assert!(faults.reported().is_empty());
    assert!(!router.ctx().recovery_needed());
    assert!(!dev.irq_masked());
}

#[test]
fn fast_reset_failure_parks_without_disabling_interrupts() {
    let (dev, faults, router) = setup();
    dev.post_message(&encode_bare(msg_type::FAST_RESET_FAILURE));
    router.handle_aggregate();

    assert_eq!(faults.reported(), vec![DeviceFault::FastResetFailure]);
    assert!(router.ctx().recovery_needed());
    // Unlike watchdog/abort, the device keeps taking interrupts; the
    // runtime decides when to recover.
    assert!(!dev.irq_masked());
}

#[test]
fn an_unknown_message_type_is_terminal() {
    let (dev, faults, router) = setup();
    dev.post_message(&[header(1, 0x6E, 0, 0)]);
    router.handle_aggregate();

    assert!(matches!(
        faults.reported().as_slice(),
        [DeviceFault::Internal(_)]
    ));
    assert!(dev.irq_masked());
}

#[test]
fn an_oversized_length_field_is_rejected_before_any_register_reads() {
    let (dev, faults, router) = setup();
    dev.post_message(&[header(vpx_chip::msg::MAX_WORDS + 1, msg_type::ABORT, 0, 0)]);
    router.handle_aggregate();

    assert!(matches!(
        faults.reported().as_slice(),
        [DeviceFault::Internal(_)]
    ));
}

// ── Per-queue lines ──────────────────────────────────────────────────────────

#[test]
fn queue_interrupts_reach_their_bound_handler_and_clear_status() {
    let (dev, _faults, router) = setup();
    let hits = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&hits);
    router
        .bind_queue(3, Arc::new(move |id| {
            assert_eq!(id, 3);
            sink.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let status_reg = regs::QUEUE_IRQ_STATUS_BASE + 3 * regs::QUEUE_IRQ_STATUS_STRIDE;
    dev.raise(status_reg, queue::DATA_AVAIL);
    router.handle_queue(3);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(dev.reg(status_reg), 0, "data-available bit not cleared");

    // No data pending: handler is not invoked.
    router.handle_queue(3);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn binding_an_occupied_queue_slot_is_an_error() {
    let (_dev, _faults, router) = setup();
    router.bind_queue(0, Arc::new(|_| {})).unwrap();
    assert!(router.bind_queue(0, Arc::new(|_| {})).is_err());

    router.release_queue(0);
    router.bind_queue(0, Arc::new(|_| {})).unwrap();
}

#[test]
fn out_of_range_queue_ids_are_rejected() {
    let (_dev, _faults, router) = setup();
    assert!(router.bind_queue(32, Arc::new(|_| {})).is_err());
}

#[test]
fn an_unbound_queue_interrupt_is_not_serviced_blindly() {
    let (dev, faults, router) = setup();
    let status_reg = regs::QUEUE_IRQ_STATUS_BASE;
    dev.raise(status_reg, queue::DATA_AVAIL);
    router.handle_queue(0);

    // Logged and cleared, but no fault: an unbound interface is a
    // representable empty state, not a crash.
    assert!(faults.reported().is_empty());
    assert_eq!(dev.reg(status_reg), 0);
}
