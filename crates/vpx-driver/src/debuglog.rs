//! Firmware debug surface: region allocation and print-ring drain.
//!
//! The boot sequencer allocates one page-aligned device-visible region
//! holding the trace, log and coverage buffers plus the debug-print ring
//! (layout in `vpx_chip::layout`). Firmware appends print bytes at `head`;
//! the host consumes up to `head` and advances `tail`. Cursors are
//! monotonic byte counts; only their difference, bounded by the ring size,
//! indexes the payload.

use std::ptr::NonNull;

use vpx_chip::layout::{
    debug_region_size, PRINT_RING_DATA, PRINT_RING_HEAD, PRINT_RING_SIZE, PRINT_RING_TAIL,
};

use crate::error::{Result, VpxError};
use crate::hal::{DeviceMemory, DmaBuf, VmContext};

/// The mapped debug-memory region and its print ring.
#[derive(Debug)]
pub struct DebugRegion {
    mem: Box<dyn DmaBuf>,
}

impl DebugRegion {
    /// Allocate and zero-initialize the debug region.
    ///
    /// # Errors
    ///
    /// [`VpxError::OutOfMemory`] when the mapping fails.
    pub fn new(memory: &dyn DeviceMemory) -> Result<Self> {
        let mem = memory
            .alloc(VmContext::Ctx1, debug_region_size())
            .map_err(|e| match e {
                VpxError::OutOfMemory { what } => VpxError::OutOfMemory {
                    what: format!("debug region ({what})"),
                },
                other => other,
            })?;
        Ok(Self { mem })
    }

    /// Device-visible address of the region, programmed into the debug
    /// segment window.
    #[must_use]
    pub fn iova(&self) -> u64 {
        self.mem.iova()
    }

    /// Region size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Always false; the region layout is non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mem.len() == 0
    }

    fn byte_ptr(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.mem.len(), "debug region offset out of bounds");
        // SAFETY: offset checked against the mapping length just above.
        unsafe { self.mem.as_ptr().add(offset) }
    }

    /// Volatile read of a ring cursor. Firmware writes `head` behind the
    /// host's back; an ordinary read could be cached across the loop.
    fn read_cursor(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0, "cursor offset misaligned");
        // SAFETY: offset + 4 lies inside the mapping (layout constants,
        // checked by byte_ptr) and is 4-byte aligned.
        unsafe { std::ptr::read_volatile(self.byte_ptr(offset).as_ptr().cast::<u32>()) }
    }

    fn write_cursor(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0, "cursor offset misaligned");
        // SAFETY: as for read_cursor; the host owns the tail cursor.
        unsafe {
            std::ptr::write_volatile(self.byte_ptr(offset).as_ptr().cast::<u32>(), value);
        }
    }

    /// Drain pending firmware prints into the host log. Returns the byte
    /// count consumed. Complete lines are logged under target `vpx::fw`;
    /// a trailing partial line is logged as-is rather than held back,
    /// because a drain on the abort path is the last chance to see it.
    pub fn drain_prints(&self) -> usize {
        let head = self.read_cursor(PRINT_RING_HEAD);
        let tail = self.read_cursor(PRINT_RING_TAIL);
        let pending = head.wrapping_sub(tail) as usize;
        if pending == 0 {
            return 0;
        }
        if pending > PRINT_RING_SIZE {
            // Firmware outran the host by more than a full ring; drop the
            // overwritten prefix and resynchronize.
            tracing::warn!(pending, "debug print ring overrun, dropping stale bytes");
            self.write_cursor(PRINT_RING_TAIL, head.wrapping_sub(PRINT_RING_SIZE as u32));
            return self.drain_prints();
        }

        let mut bytes = Vec::with_capacity(pending);
        for i in 0..pending {
            let offset = PRINT_RING_DATA + (tail.wrapping_add(i as u32) as usize % PRINT_RING_SIZE);
            // SAFETY: offset stays inside [PRINT_RING_DATA,
            // PRINT_RING_DATA + PRINT_RING_SIZE), inside the mapping.
            bytes.push(unsafe { std::ptr::read_volatile(self.byte_ptr(offset).as_ptr()) });
        }
        self.write_cursor(PRINT_RING_TAIL, head);

        for line in String::from_utf8_lossy(&bytes).split_terminator('\n') {
            if !line.is_empty() {
                tracing::info!(target: "vpx::fw", "{line}");
            }
        }
        pending
    }

    /// Push bytes into the ring as firmware would. Test and simulator
    /// support; hardware firmware writes the ring itself.
    #[doc(hidden)]
    pub fn push_print_bytes(&self, text: &[u8]) {
        let mut head = self.read_cursor(PRINT_RING_HEAD);
        for &b in text {
            let offset = PRINT_RING_DATA + (head as usize % PRINT_RING_SIZE);
            // SAFETY: offset bounded by the ring span as in drain_prints.
            unsafe { std::ptr::write_volatile(self.byte_ptr(offset).as_ptr(), b) };
            head = head.wrapping_add(1);
        }
        self.write_cursor(PRINT_RING_HEAD, head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn region() -> (std::sync::Arc<SimDevice>, DebugRegion) {
        let dev = std::sync::Arc::new(SimDevice::new());
        let region = DebugRegion::new(&*dev).unwrap();
        (dev, region)
    }

    #[test]
    fn drain_of_empty_ring_is_a_no_op() {
        let (_dev, region) = region();
        assert_eq!(region.drain_prints(), 0);
    }

    #[test]
    fn prints_round_trip_through_the_ring() {
        let (_dev, region) = region();
        region.push_print_bytes(b"vision pipe up\nclock 533MHz\n");
        assert_eq!(region.drain_prints(), 28);
        assert_eq!(region.drain_prints(), 0);
    }

    #[test]
    fn ring_wraps_without_losing_sync() {
        let (_dev, region) = region();
        let line = [b'a'; 100];
        // Push far more than one ring's worth in drained slices.
        for _ in 0..(2 * PRINT_RING_SIZE / line.len()) {
            region.push_print_bytes(&line);
            assert_eq!(region.drain_prints(), line.len());
        }
    }

    #[test]
    fn overrun_resynchronizes() {
        let (_dev, region) = region();
        let chunk = vec![b'x'; PRINT_RING_SIZE];
        region.push_print_bytes(&chunk);
        region.push_print_bytes(&chunk); // overruns the un-drained ring
        assert_eq!(region.drain_prints(), PRINT_RING_SIZE);
        assert_eq!(region.drain_prints(), 0);
    }
}
