//! Boot sequencing against the software device: the happy path, the
//! unload path, and the reverse-order unwind at every injected failure
//! point. The software device's map/unmap counters prove that no mapping
//! survives a failed boot.

use std::sync::Arc;
use std::time::Duration;

use vpx_chip::layout::{DEBUG_SEG_VA, SEG_WINDOW_PASSTHROUGH, SYNCPT_VA_ORIGIN, USER_SEG_VA};
use vpx_chip::msg::encode_boot_done;
use vpx_chip::regs::{
    self, bootparam, firewall, mbox, mbox_slot, reset, sema, sema_slot,
};

use bytes::Bytes;
use vpx_driver::hal::IrqLine;
use vpx_driver::sim::{RecordingFaultSink, SimDevice};
use vpx_driver::{
    boot_firmware, DeviceConfig, DeviceContext, DeviceFault, FirmwareImage, FirmwareSource,
    MailboxRouter, Platform, StreamIds, SyncptRegion, VpxError,
};

const TIMEOUT: Duration = Duration::from_millis(200);

fn config() -> DeviceConfig {
    DeviceConfig {
        platform: Platform::Simulation,
        ..DeviceConfig::silicon(StreamIds { ctx0: 0x21, ctx1: 0x22 })
    }
}

fn setup(config: DeviceConfig) -> (Arc<SimDevice>, Arc<RecordingFaultSink>, Arc<MailboxRouter>) {
    let dev = Arc::new(SimDevice::new());
    let faults = Arc::new(RecordingFaultSink::new());
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

fn image() -> FirmwareImage {
    FirmwareImage::HostLoaded {
        image: Bytes::from_static(&[0x7F, b'V', b'P', b'X', 1, 0, 0, 0]),
    }
}

/// Play the firmware's part: once reset is released, post boot-done.
fn spawn_firmware(dev: &Arc<SimDevice>) -> std::thread::JoinHandle<()> {
    let dev = Arc::clone(dev);
    std::thread::spawn(move || {
        for _ in 0..1000 {
            if dev.reg(regs::RESET_CTRL) == reset::RELEASE {
                dev.post_message(&encode_boot_done(1000, 1750));
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("firmware never released from reset");
    })
}

#[test]
fn boot_programs_the_device_and_unload_releases_everything() {
    let (dev, _faults, router) = setup(config());
    let fw = spawn_firmware(&dev);

    let loaded = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap();
    fw.join().unwrap();

    // Windows at the fixed VA bases.
    assert_eq!(dev.reg(regs::SEG_USER_START), USER_SEG_VA as u32);
    assert_eq!(dev.reg(regs::SEG_DEBUG_START), DEBUG_SEG_VA as u32);
    assert!(dev.reg(regs::SEG_USER_END) > dev.reg(regs::SEG_USER_START));

    // Simulation target: lock bit masked out of the firewall patterns.
    assert_eq!(
        dev.reg(regs::SEC_USER_CFG),
        firewall::USER_PATTERN & !firewall::LOCK
    );

    // Split-context routing on Gen2.
    assert_eq!(dev.reg(regs::STREAM_ID_CTX0), 0x21);
    assert_eq!(dev.reg(regs::STREAM_ID_CTX1), 0x22);

    // No syncpoints configured: sentinel offsets, zero size.
    assert_eq!(dev.reg(sema(sema_slot::SYNCPT_RO_OFFSET)), regs::SYNCPT_NONE);
    assert_eq!(dev.reg(sema(sema_slot::SYNCPT_RW_SIZE)), 0);

    // Firmware image + debug region are the two live mappings.
    assert_eq!(dev.live_mappings(), 2);
    assert!(dev.is_bound(IrqLine::Aggregate));

    loaded.unload();
    assert_eq!(dev.live_mappings(), 0, "unload leaked a mapping");
    assert!(!dev.is_bound(IrqLine::Aggregate));
    assert_eq!(dev.reg(regs::RESET_CTRL), reset::ASSERT);
    assert_eq!(dev.reg(regs::IRQ_ENABLE), 0);
}

#[test]
fn boot_parameter_flags_reach_the_semaphore_slot() {
    let (dev, _faults, router) = setup(DeviceConfig {
        test_mode: true,
        alt_pixel_packing: true,
        ..config()
    });
    let fw = spawn_firmware(&dev);

    let loaded = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap();
    fw.join().unwrap();

    assert_eq!(
        dev.reg(sema(sema_slot::BOOT_PARAMS)),
        bootparam::TEST_MODE | bootparam::ALT_PIXEL_PACKING
    );
    loaded.unload();
}

#[test]
fn syncpoint_offsets_are_origin_relative() {
    let (dev, _faults, router) = setup(DeviceConfig {
        syncpoints: Some(SyncptRegion {
            ro_base: SYNCPT_VA_ORIGIN + 0x1000,
            rw_base: SYNCPT_VA_ORIGIN + 0x9000,
            rw_size: 0x4000,
        }),
        ..config()
    });
    let fw = spawn_firmware(&dev);

    let loaded = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap();
    fw.join().unwrap();

    assert_eq!(dev.reg(sema(sema_slot::SYNCPT_RO_OFFSET)), 0x1000);
    assert_eq!(dev.reg(sema(sema_slot::SYNCPT_RW_OFFSET)), 0x9000);
    assert_eq!(dev.reg(sema(sema_slot::SYNCPT_RW_SIZE)), 0x4000);
    loaded.unload();
}

#[test]
fn mediated_windows_get_the_passthrough_sentinel() {
    let (dev, _faults, router) = setup(DeviceConfig {
        firmware_source: FirmwareSource::SecureCarveout,
        hypervisor_mediated: true,
        ..config()
    });
    let fw = spawn_firmware(&dev);

    let loaded = boot_firmware(
        router.ctx(),
        &router,
        &FirmwareImage::Carveout {
            base: 0x8000_0000,
            len: 0x10_0000,
        },
        TIMEOUT,
    )
    .unwrap();
    fw.join().unwrap();

    for reg in [
        regs::SEG_USER_START,
        regs::SEG_USER_END,
        regs::SEG_DEBUG_START,
        regs::SEG_DEBUG_END,
    ] {
        assert_eq!(dev.reg(reg), SEG_WINDOW_PASSTHROUGH);
    }
    // Carveout firmware is never staged: only the debug region is mapped.
    assert_eq!(dev.live_mappings(), 1);
    loaded.unload();
}

#[test]
fn firmware_owned_segments_get_their_bases_by_mailbox() {
    let (dev, _faults, router) = setup(DeviceConfig {
        fw_programs_segments: true,
        ..config()
    });
    let fw = spawn_firmware(&dev);

    let loaded = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap();
    fw.join().unwrap();

    let user_lo = u64::from(dev.reg(mbox(mbox_slot::USER_SEG_LO)));
    let user_hi = u64::from(dev.reg(mbox(mbox_slot::USER_SEG_HI)));
    let priv2_lo = u64::from(dev.reg(mbox(mbox_slot::PRIV2_SEG_LO)));
    assert_ne!((user_hi << 32) | user_lo, 0);
    assert_ne!(priv2_lo, 0);
    assert_ne!(user_lo, priv2_lo);
    loaded.unload();
}

// ── Unwind completeness ──────────────────────────────────────────────────────

fn assert_fully_unwound(dev: &SimDevice) {
    assert_eq!(dev.live_mappings(), 0, "a mapping leaked through the unwind");
    assert!(!dev.is_bound(IrqLine::Aggregate), "interrupt left bound");
    assert_eq!(dev.reg(regs::IRQ_ENABLE), 0);
    for reg in [
        regs::SEG_USER_START,
        regs::SEG_USER_END,
        regs::SEG_DEBUG_START,
        regs::SEG_DEBUG_END,
    ] {
        assert_eq!(dev.reg(reg), 0, "segment window {reg:#x} left programmed");
    }
}

#[test]
fn failure_at_the_security_step_unwinds_completely() {
    let (dev, _faults, router) = setup(config());
    dev.kill_register(regs::SEC_USER_CFG);

    let err = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap_err();
    assert!(matches!(err, VpxError::InvalidState { .. }));
    assert_fully_unwound(&dev);
}

#[test]
fn failure_at_the_stream_id_step_unwinds_completely() {
    let (dev, _faults, router) = setup(config());
    dev.kill_register(regs::STREAM_ID_CTX1);

    let err = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap_err();
    assert!(matches!(err, VpxError::InvalidState { .. }));
    assert_fully_unwound(&dev);
    // Security registers were rolled back after being programmed.
    assert_eq!(dev.reg(regs::SEC_USER_CFG), 0);
}

#[test]
fn failure_at_the_interrupt_bind_step_unwinds_completely() {
    let (dev, _faults, router) = setup(config());
    dev.fail_next_bind();

    let err = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap_err();
    assert!(matches!(err, VpxError::InvalidState { .. }));
    assert_fully_unwound(&dev);
}

#[test]
fn failure_at_the_debug_alloc_step_unwinds_completely() {
    // Carveout firmware: the debug region is the only mapping the boot
    // attempts, so the one-shot allocation failure lands on it.
    let (dev, _faults, router) = setup(DeviceConfig {
        firmware_source: FirmwareSource::SecureCarveout,
        ..config()
    });
    dev.fail_next_alloc();

    let err = boot_firmware(
        router.ctx(),
        &router,
        &FirmwareImage::Carveout {
            base: 0x8000_0000,
            len: 0x10_0000,
        },
        TIMEOUT,
    )
    .unwrap_err();
    assert!(matches!(err, VpxError::OutOfMemory { .. }));
    assert_fully_unwound(&dev);
}

#[test]
fn failure_staging_the_firmware_image_leaves_no_side_effects() {
    let (dev, _faults, router) = setup(config());
    dev.fail_next_alloc();

    let err = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap_err();
    assert!(matches!(err, VpxError::OutOfMemory { .. }));
    assert_fully_unwound(&dev);
}

#[test]
fn boot_timeout_reports_the_checkpoint_and_unwinds() {
    let (dev, faults, router) = setup(config());
    // Firmware never posts boot-done; it got as far as checkpoint 0x57.
    dev.raise(regs::BOOT_CHECKPOINT, 0x57);

    let err = boot_firmware(router.ctx(), &router, &image(), Duration::from_millis(50))
        .unwrap_err();
    match err {
        VpxError::TimedOut { checkpoint, .. } => assert_eq!(checkpoint, 0x57),
        other => panic!("expected timeout, got {other}"),
    }
    assert!(faults
        .reported()
        .contains(&DeviceFault::BootTimeout(0x57)));
    assert_fully_unwound(&dev);
    // The release-reset step was undone by forcing reset back.
    assert_eq!(dev.reg(regs::RESET_CTRL), reset::ASSERT);
}

#[test]
fn a_parked_device_refuses_to_boot() {
    let (_dev, _faults, router) = setup(config());
    router.ctx().set_recovery_needed();
    let err = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap_err();
    assert!(matches!(err, VpxError::InvalidState { .. }));
}

#[test]
fn a_second_boot_after_a_timeout_succeeds() {
    let (dev, _faults, router) = setup(config());

    let err = boot_firmware(router.ctx(), &router, &image(), Duration::from_millis(50));
    assert!(err.is_err());

    let fw = spawn_firmware(&dev);
    let loaded = boot_firmware(router.ctx(), &router, &image(), TIMEOUT).unwrap();
    fw.join().unwrap();
    assert_eq!(dev.live_mappings(), 2);
    loaded.unload();
    assert_eq!(dev.live_mappings(), 0);
}
