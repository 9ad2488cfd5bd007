//! Full boot walkthrough against the software device.
//!
//! Run with `cargo run --example boot_sim` — no hardware required. A
//! thread plays the firmware's side: it waits for reset release, prints a
//! few lines into the debug ring, and posts boot-done.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use vpx_chip::msg::{encode_bare, encode_boot_done, msg_type};
use vpx_chip::regs::{self, reset};
use vpx_driver::sim::SimDevice;
use vpx_driver::{
    boot_firmware, BufferPool, DeviceConfig, DeviceContext, LogFaultSink, MailboxRouter,
    Platform, PoolConfig, StreamIds, BOOT_TIMEOUT,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let dev = Arc::new(SimDevice::new());
    let config = DeviceConfig {
        platform: Platform::Simulation,
        ..DeviceConfig::silicon(StreamIds { ctx0: 0x21, ctx1: 0x22 })
    };
    let ctx = Arc::new(DeviceContext::new(
        config,
        dev.clone(),
        dev.clone(),
        dev.clone(),
        Arc::new(LogFaultSink),
    ));
    let router = MailboxRouter::new(ctx.clone());

    // Firmware side: boot, then ask for a print flush.
    let fw_dev = Arc::clone(&dev);
    let firmware = std::thread::spawn(move || {
        while fw_dev.reg(regs::RESET_CTRL) != reset::RELEASE {
            std::thread::sleep(Duration::from_millis(1));
        }
        fw_dev.post_message(&encode_boot_done(0x100, 0x1CC));
        std::thread::sleep(Duration::from_millis(10));
        fw_dev.post_message(&encode_bare(msg_type::FLUSH_PRINT));
    });

    let image = Bytes::from_static(&[0x7F, b'V', b'P', b'X', 1, 0, 0, 0]);
    let loaded = boot_firmware(
        &ctx,
        &router,
        &vpx_driver::FirmwareImage::HostLoaded { image },
        BOOT_TIMEOUT,
    )?;
    firmware.join().expect("firmware thread");

    // Carve a few scratch buffers out of the pool while firmware runs.
    let pool = BufferPool::new(dev.clone(), PoolConfig::new(256, 16))?;
    let a = pool.alloc_zeroed()?;
    let b = pool.alloc_zeroed()?;
    tracing::info!(a = a.iova(), b = b.iova(), "scratch buffers");
    pool.free(a);
    pool.free(b);

    loaded.unload();
    tracing::info!("clean shutdown");
    Ok(())
}
