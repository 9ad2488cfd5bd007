//! Fixed-element device-memory pool.
//!
//! A [`BufferPool`] owns a set of *segments* — device-visible mappings
//! obtained from the [`DeviceMemory`] collaborator — each subdivided into
//! fixed-size elements tracked by a per-segment [`SlotAllocator`]. The
//! pool grows by one segment when every element is in use and shrinks a
//! fully-empty segment only while enough free elements remain elsewhere,
//! so an allocate/free pair sitting on a segment boundary does not map and
//! unmap hardware memory on every iteration.
//!
//! Segments live in an arena indexed by a stable integer; an element
//! handle carries `(segment, slot)` plus its resolved address so the
//! address accessors are plain field reads, safe to call concurrently with
//! any pool operation on a different live handle.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, VpxError};
use crate::hal::{DeviceMemory, DmaBuf, VmContext};
use crate::slots::{BitmapSlots, SlotAllocator};

/// Elements are aligned to the widest primitive the DMA engines address.
const ELEMENT_ALIGN: usize = 8;

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Translation context segments are mapped in.
    pub vm_context: VmContext,
    /// Element size in bytes; rounded up to [`ELEMENT_ALIGN`].
    pub element_size: usize,
    /// Elements added per new segment.
    pub growth_increment: u32,
    /// Free elements the pool must retain before a fully-empty segment is
    /// unmapped. Defaults to `2 * growth_increment`; the factor is policy,
    /// not a correctness requirement.
    pub shrink_reserve: Option<u32>,
}

impl PoolConfig {
    /// Config with the default shrink hysteresis, mapping in the
    /// code/data context.
    #[must_use]
    pub const fn new(element_size: usize, growth_increment: u32) -> Self {
        Self {
            vm_context: VmContext::Ctx0,
            element_size,
            growth_increment,
            shrink_reserve: None,
        }
    }
}

/// A handle to one allocated element. A locator, not a copy: the bytes
/// live in the owning segment's mapping.
///
/// Handles are move-only; passing one back to [`BufferPool::free`]
/// consumes it, so a freed element cannot be addressed again.
#[derive(Debug)]
pub struct PoolElement {
    segment: u32,
    slot: u32,
    iova: u64,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: Send - the element's bytes are owned exclusively by this handle
// until free(); the pointer targets a mapping that outlives the handle
// (caller contract on BufferPool drop).
unsafe impl Send for PoolElement {}

// SAFETY: Sync - &PoolElement only exposes address reads; mutation through
// the pointer requires the caller's own unsafe code.
unsafe impl Sync for PoolElement {}

impl PoolElement {
    /// Device-visible address of this element.
    #[must_use]
    pub const fn iova(&self) -> u64 {
        self.iova
    }

    /// Host mapping of this element.
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Element size in bytes (the pool's rounded element size).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; elements have the pool's fixed non-zero size.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Segment {
    mem: Box<dyn DmaBuf>,
    slots: BitmapSlots,
}

impl Segment {
    fn free(&self) -> u32 {
        SlotAllocator::free(&self.slots)
    }

    fn capacity(&self) -> u32 {
        self.slots.capacity()
    }
}

#[derive(Default)]
struct PoolInner {
    /// Arena of segments; indices are stable for the life of a segment,
    /// `None` marks a destroyed entry awaiting reuse.
    segments: Vec<Option<Segment>>,
    /// Invariant: equals the sum of every live segment's free count.
    free_total: u32,
}

/// Snapshot of pool bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Live segments.
    pub segments: usize,
    /// Pool-wide free elements.
    pub free_total: u32,
    /// Free elements per live segment.
    pub per_segment_free: Vec<u32>,
}

/// Growable, shrinkable pool of fixed-size device-visible elements.
pub struct BufferPool {
    memory: Arc<dyn DeviceMemory>,
    vm_context: VmContext,
    element_size: usize,
    growth_increment: u32,
    shrink_reserve: u32,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("element_size", &self.element_size)
            .field("growth_increment", &self.growth_increment)
            .field("shrink_reserve", &self.shrink_reserve)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Create a pool and map its initial segment.
    ///
    /// # Errors
    ///
    /// [`VpxError::InvalidState`] for a zero element size or growth
    /// increment; [`VpxError::OutOfMemory`] when the initial segment
    /// cannot be mapped (the pool is then dropped, unusable).
    pub fn new(memory: Arc<dyn DeviceMemory>, config: PoolConfig) -> Result<Self> {
        if config.element_size == 0 || config.growth_increment == 0 {
            return Err(VpxError::invalid_state(
                "pool element size and growth increment must be non-zero",
            ));
        }
        let element_size = config.element_size.div_ceil(ELEMENT_ALIGN) * ELEMENT_ALIGN;
        let pool = Self {
            memory,
            vm_context: config.vm_context,
            element_size,
            growth_increment: config.growth_increment,
            shrink_reserve: config
                .shrink_reserve
                .unwrap_or(2 * config.growth_increment),
            inner: Mutex::new(PoolInner::default()),
        };

        {
            let mut inner = pool.lock();
            pool.grow(&mut inner)?;
        }
        tracing::debug!(
            element_size,
            growth = config.growth_increment,
            "buffer pool initialized"
        );
        Ok(pool)
    }

    /// Allocate one element, growing the pool by a segment if every
    /// element is in use.
    ///
    /// # Errors
    ///
    /// [`VpxError::OutOfMemory`] when a new segment is needed and its
    /// mapping fails — the only failure mode; the pool is unchanged.
    pub fn alloc(&self) -> Result<PoolElement> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.free_total == 0 {
            self.grow(inner)?;
        }

        for (idx, entry) in inner.segments.iter_mut().enumerate() {
            let Some(segment) = entry.as_mut() else {
                continue;
            };
            let Some(slot) = segment.slots.reserve() else {
                continue;
            };
            inner.free_total -= 1;

            let offset = slot as usize * self.element_size;
            // SAFETY: slot < capacity and capacity * element_size is the
            // segment mapping length, so the offset stays inside the
            // mapping returned by DeviceMemory::alloc.
            let ptr = unsafe { segment.mem.as_ptr().add(offset) };
            return Ok(PoolElement {
                segment: idx as u32,
                slot,
                iova: segment.mem.iova() + offset as u64,
                ptr,
                len: self.element_size,
            });
        }

        // free_total > 0 guaranteed a reservable slot above.
        Err(VpxError::invalid_state(
            "pool free count disagrees with segment bookkeeping",
        ))
    }

    /// Allocate one element and zero its bytes before returning it.
    ///
    /// # Errors
    ///
    /// Same failure mode as [`BufferPool::alloc`].
    pub fn alloc_zeroed(&self) -> Result<PoolElement> {
        let element = self.alloc()?;
        // SAFETY: the handle's pointer is valid for exactly `len` bytes of
        // its segment mapping and no other live handle aliases them.
        unsafe {
            std::ptr::write_bytes(element.ptr.as_ptr(), 0, element.len);
        }
        Ok(element)
    }

    /// Return an element to its segment. If the segment becomes fully
    /// empty and the pool still holds at least the shrink reserve of free
    /// elements, the segment is unmapped.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not belong to a live segment of this
    /// pool — an ownership violation, terminal by design.
    pub fn free(&self, element: PoolElement) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let idx = element.segment as usize;
        let segment = inner
            .segments
            .get_mut(idx)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("element handle names dead segment {idx}"));

        segment.slots.release(element.slot);
        inner.free_total += 1;

        let empty = segment.free() == segment.capacity();
        let capacity = segment.capacity();
        if empty && inner.free_total >= self.shrink_reserve {
            inner.segments[idx] = None;
            inner.free_total -= capacity;
            tracing::debug!(segment = idx, capacity, "segment unmapped");
        }
    }

    /// Bookkeeping snapshot.
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let per_segment_free: Vec<u32> = inner
            .segments
            .iter()
            .filter_map(|s| s.as_ref().map(Segment::free))
            .collect();
        PoolStats {
            segments: per_segment_free.len(),
            free_total: inner.free_total,
            per_segment_free,
        }
    }

    /// Pool-wide free element count.
    pub fn free_elements(&self) -> u32 {
        self.lock().free_total
    }

    /// Element size after alignment rounding.
    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Map one new segment and link it into the arena.
    fn grow(&self, inner: &mut PoolInner) -> Result<()> {
        let len = self.element_size * self.growth_increment as usize;
        let mem = self.memory.alloc(self.vm_context, len)?;
        let segment = Segment {
            mem,
            slots: BitmapSlots::new(self.growth_increment),
        };

        let idx = match inner.segments.iter().position(Option::is_none) {
            Some(hole) => {
                inner.segments[hole] = Some(segment);
                hole
            }
            None => {
                inner.segments.push(Some(segment));
                inner.segments.len() - 1
            }
        };
        inner.free_total += self.growth_increment;
        tracing::debug!(segment = idx, len, "segment mapped");
        Ok(())
    }
}

// Dropping the pool unmaps every surviving segment. Not safe while any
// element handle is outstanding; that is the caller's contract, mirrored
// from the mapping collaborator's own lifetime rules.
