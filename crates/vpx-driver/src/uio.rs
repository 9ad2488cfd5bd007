// SPDX-License-Identifier: AGPL-3.0-only

//! Linux UIO backend.
//!
//! The VPX500 is a platform device; its control window and interrupt are
//! exposed through the UIO framework (`/dev/uioN` + sysfs). This module
//! provides the hardware implementations of the collaborator seams:
//! register access over an mmap of map0, and an interrupt service thread
//! that blocks on the UIO fd and drives a bound handler.
//!
//! rustix covers everything UIO needs (mmap, read, write); no raw ioctls.
//!
//! Device-visible memory is not allocated here: the platform's carveout
//! allocator owns it and plugs in behind [`crate::hal::DeviceMemory`].

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use vpx_chip::regs::CONTROL_WINDOW_SIZE;

use crate::error::{Result, VpxError};
use crate::hal::{InterruptController, IrqHandler, IrqLine, RegisterIo};

/// Name the kernel-side platform driver registers its UIO node under.
pub const UIO_DEVICE_NAME: &str = "vpx500";

/// Mapped register window for MMIO access.
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; mmap'd memory
// is process-wide, moving the owner between threads changes nothing.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - all access is volatile 32-bit loads/stores of device
// registers; the hardware serializes concurrent accessors.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of `file` at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the mmap fails.
    pub fn map(file: &File, size: usize) -> Result<Self> {
        // SAFETY: mmap necessary for MMIO - maps the UIO region into the
        // process. Invariants: (1) file is an open UIO node; (2) size
        // comes from the node's own map0/size attribute; (3) ptr valid
        // for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file,
                0,
            )
            .map_err(|e| VpxError::Io {
                source: std::io::Error::from(e),
            })?
        };

        tracing::debug!("mapped control window at {ptr:p}, size={size:#x}");
        Ok(Self {
            ptr: ptr.cast(),
            size,
        })
    }

    /// Read a 32-bit register.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change
        // the value. ptr valid for size bytes, offset checked, u32 aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// Write a 32-bit register.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    pub fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware
        // side effects. Bounds checked above.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned in map();
        // Drop runs at most once.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("unmapped control window");
    }
}

/// An open UIO device: the control window plus the interrupt fd.
#[derive(Debug)]
pub struct UioDevice {
    path: PathBuf,
    file: File,
    regs: MappedRegion,
}

impl UioDevice {
    /// Scan `/sys/class/uio` for VPX500 nodes and return their `/dev`
    /// paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysfs tree cannot be read. An empty result
    /// means no device is present.
    pub fn discover() -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir("/sys/class/uio") {
            Ok(entries) => entries,
            // No UIO support compiled in — same as no devices.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = std::fs::read_to_string(entry.path().join("name")).unwrap_or_default();
            if name.trim() == UIO_DEVICE_NAME {
                found.push(PathBuf::from("/dev").join(entry.file_name()));
            }
        }
        tracing::info!("found {} VPX UIO node(s)", found.len());
        Ok(found)
    }

    /// Open a UIO node and map its control window.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be opened, its map size read,
    /// or the window mapped.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let size = Self::map0_size(path).unwrap_or(CONTROL_WINDOW_SIZE);
        let regs = MappedRegion::map(&file, size)?;

        tracing::info!("opened {} ({size:#x} byte window)", path.display());
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            file,
            regs,
        }))
    }

    /// Control window size from the node's sysfs map0 attribute.
    fn map0_size(dev_path: &Path) -> Option<usize> {
        let name = dev_path.file_name()?.to_str()?;
        let attr = format!("/sys/class/uio/{name}/maps/map0/size");
        let text = std::fs::read_to_string(attr).ok()?;
        usize::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegisterIo for UioDevice {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.write32(offset, value);
    }
}

/// Interrupt controller over the UIO event fd.
///
/// UIO exposes one interrupt per node; this controller serves
/// [`IrqLine::Aggregate`]. Per-queue lines arrive as separate UIO nodes
/// and get their own controller each.
#[derive(Debug)]
pub struct UioIrq {
    /// Duplicate of the device fd: reads block for events, 4-byte writes
    /// enable (1) or disable (0) the interrupt.
    file: File,
    masked: Arc<AtomicBool>,
    service: Mutex<Option<ServiceThread>>,
}

#[derive(Debug)]
struct ServiceThread {
    stop: Arc<AtomicBool>,
    // Detached on unbind: the thread is parked in a blocking read and
    // exits on the next event or fd error.
    _thread: JoinHandle<()>,
}

impl UioIrq {
    /// Create a controller over `device`'s interrupt fd.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fd cannot be duplicated.
    pub fn new(device: &UioDevice) -> Result<Self> {
        Ok(Self {
            file: device.file.try_clone()?,
            masked: Arc::new(AtomicBool::new(false)),
            service: Mutex::new(None),
        })
    }

    fn irq_control(&self, enable: bool) {
        let word: u32 = u32::from(enable);
        if let Err(e) = rustix::io::write(&self.file, &word.to_ne_bytes()) {
            tracing::warn!("UIO irq control write failed: {e}");
        }
    }
}

impl InterruptController for UioIrq {
    fn bind(&self, line: IrqLine, handler: IrqHandler) -> Result<()> {
        if line != IrqLine::Aggregate {
            return Err(VpxError::invalid_state(
                "per-queue lines are separate UIO nodes",
            ));
        }
        let mut service = self.service.lock().unwrap_or_else(|e| e.into_inner());
        if service.is_some() {
            return Err(VpxError::invalid_state("aggregate line already bound"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let masked = Arc::clone(&self.masked);
        let fd = self.file.try_clone()?;

        let thread = std::thread::Builder::new()
            .name("vpx-irq".into())
            .spawn(move || {
                let mut count = [0u8; 4];
                loop {
                    // Re-arm at the UIO layer, then block for the next event.
                    if rustix::io::write(&fd, &1u32.to_ne_bytes()).is_err() {
                        break;
                    }
                    if rustix::io::read(&fd, &mut count).is_err() {
                        break;
                    }
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    if masked.load(Ordering::Acquire) {
                        continue;
                    }
                    handler();
                }
                tracing::debug!("irq service thread exiting");
            })?;

        *service = Some(ServiceThread {
            stop,
            _thread: thread,
        });
        Ok(())
    }

    fn unbind(&self, line: IrqLine) {
        if line != IrqLine::Aggregate {
            return;
        }
        if let Some(service) = self
            .service
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            service.stop.store(true, Ordering::Release);
            // The thread observes the flag after its current blocking
            // read; the fd stays valid until then via its own duplicate.
        }
    }

    fn mask_all(&self) {
        // Atomics and a plain fd write: safe to race a running handler.
        self.masked.store(true, Ordering::Release);
        self.irq_control(false);
    }
}
