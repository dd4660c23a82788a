//! Dynamic context attachment (DCA) memory pool.
//!
//! In DCA mode the kernel driver attaches device buffers to queue pairs on
//! demand, out of a pool of memory this process donates. The pool grows and
//! shrinks in fixed units; a status region shared with the kernel tracks
//! which queue pairs currently have buffers attached and which are mid-post
//! and must not be detached.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use hns_uapi::{DCA_BITS_PER_STATUS, DCA_DEFAULT_UNIT_PAGES, DCA_MAX_MEM_SIZE};

use crate::channel::CommandChannel;
use crate::error::{Error, PoolError, Result};
use crate::mmap::{map_dca_status, MappedRegion};

/// DCA pool configuration supplied at context open.
///
/// Every field is optional; an absent field selects the driver default.
/// `unit_size` of zero disables the pool outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcaAttr {
    /// Allocation granularity in bytes, rounded up to the page size.
    /// Default: 16 pages.
    pub unit_size: Option<u32>,
    /// Pool ceiling in bytes, rounded up to a unit multiple.
    /// Default: unbounded.
    pub max_size: Option<u64>,
    /// Floor the pool will not shrink below, rounded up to a unit multiple.
    /// Default: never shrink.
    pub min_size: Option<u64>,
    /// Queue-pair count to ask the kernel to provision attach tracking for.
    pub prime_qps: Option<u32>,
}

fn align_up(v: u64, to: u64) -> u64 {
    // Requests at or above the representable ceiling saturate to the
    // unbounded sentinel.
    v.checked_next_multiple_of(to).unwrap_or(DCA_MAX_MEM_SIZE)
}

/// Resolves requested pool sizes into (unit, max, min) bytes.
///
/// A zero unit disables the pool; max and min are then left at zero since
/// nothing can ever be admitted. Unset or zero max/min select the
/// [`DCA_MAX_MEM_SIZE`] sentinel: no ceiling, and no shrinking, respectively.
fn pool_bounds(attr: &DcaAttr, page_size: usize) -> (u64, u64, u64) {
    let unit = match attr.unit_size {
        // Segment registration carries the size as a u32, so cap the unit
        // at the largest page multiple that still fits.
        Some(u) => align_up(u as u64, page_size as u64)
            .min(u32::MAX as u64 / page_size as u64 * page_size as u64),
        None => page_size as u64 * DCA_DEFAULT_UNIT_PAGES,
    };
    if unit == 0 {
        return (0, 0, 0);
    }

    let max = match attr.max_size {
        None | Some(0) => DCA_MAX_MEM_SIZE,
        Some(m) => align_up(m, unit),
    };
    let min = match attr.min_size {
        None | Some(0) => DCA_MAX_MEM_SIZE,
        Some(m) => align_up(m, unit),
    };
    (unit, max, min)
}

/// Page-aligned zeroed buffer (RAII).
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "alloc_zeroed failed");
        Self { ptr, layout }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// One registered pool segment.
struct DcaMem {
    buf: AlignedBuf,
    /// Kernel handle used to deregister the segment.
    handle: u32,
    /// Key the kernel uses to name this segment in attach traffic; this
    /// provider uses the buffer's base address.
    key: u64,
}

/// The kernel-shared status region, split into two bitmap halves.
///
/// The low half records attach state and is written by the kernel; the high
/// half records posting state and is written by this process. Both sides
/// read the other's half, so every access is atomic and nothing here assumes
/// exclusive ownership of the contents.
struct StatusBitmap {
    region: MappedRegion,
    /// Byte offset of the sync half; an 8-byte multiple so the word
    /// accessors satisfy [`AtomicU64::from_ptr`]'s alignment requirement.
    sync_half: usize,
}

impl StatusBitmap {
    fn attach_word(&self, dcan: u32) -> &AtomicU64 {
        let word = (dcan / 64) as usize;
        unsafe { AtomicU64::from_ptr(self.region.as_ptr().cast::<u64>().add(word)) }
    }

    fn sync_word(&self, dcan: u32) -> &AtomicU64 {
        let word = (dcan / 64) as usize;
        unsafe {
            AtomicU64::from_ptr(
                self.region.as_ptr().add(self.sync_half).cast::<u64>().add(word),
            )
        }
    }
}

fn bit(dcan: u32) -> u64 {
    1u64 << (dcan % 64)
}

/// The per-context DCA memory pool.
///
/// Segment admission and release are serialized by an internal lock; the
/// sizing fields are fixed at init. A pool whose unit size is zero is
/// disabled: growth and shrink short-circuit, and no status region exists
/// unless the kernel negotiated one anyway.
pub struct DcaPool {
    channel: Arc<dyn CommandChannel>,
    segs: Mutex<Vec<DcaMem>>,
    status: Option<StatusBitmap>,
    unit_size: u64,
    max_size: u64,
    min_size: u64,
    max_qps: u32,
    page_size: usize,
}

impl DcaPool {
    /// Builds the pool for a new context.
    ///
    /// Always returns a usable (possibly disabled) pool so context teardown
    /// never needs to special-case it. `attr` is the caller's DCA request,
    /// already gated on the DCA context flag; `max_qps` and `mmap_size` come
    /// from the kernel's context-allocation response.
    ///
    /// A negotiated status region that fails to map is not fatal: the pool
    /// stays active with attach accounting disabled.
    pub fn init(
        channel: Arc<dyn CommandChannel>,
        page_size: usize,
        attr: Option<&DcaAttr>,
        max_qps: u32,
        mmap_size: usize,
    ) -> Result<Self> {
        let mut pool = Self {
            channel,
            segs: Mutex::new(Vec::new()),
            status: None,
            unit_size: 0,
            max_size: 0,
            min_size: 0,
            max_qps: 0,
            page_size,
        };

        let Some(attr) = attr else {
            return Ok(pool);
        };

        let (unit, max, min) = pool_bounds(attr, page_size);
        if unit > 0 && max != DCA_MAX_MEM_SIZE && min != DCA_MAX_MEM_SIZE && max < min {
            return Err(Error::PoolInit(
                "maximum pool size is below minimum pool size",
            ));
        }
        pool.unit_size = unit;
        pool.max_size = max;
        pool.min_size = min;

        if mmap_size > 0 {
            match map_dca_status(&pool.channel.cmd_fd(), page_size, mmap_size) {
                Ok(region) => {
                    // The region size comes straight from the kernel response
                    // and is not trusted to split evenly: round the half
                    // boundary down to word alignment and derive the queue
                    // capacity from the rounded half, so an odd size can
                    // never place a word accessor off alignment.
                    let sync_half = mmap_size / 2 & !7;
                    pool.max_qps = max_qps
                        .min((sync_half * 8 / DCA_BITS_PER_STATUS as usize) as u32);
                    pool.status = Some(StatusBitmap { region, sync_half });
                }
                Err(e) => {
                    warn!(error = %e, "DCA status mapping failed, continuing without attach accounting");
                }
            }
        }

        Ok(pool)
    }

    /// Whether the pool can hold memory at all.
    pub fn is_enabled(&self) -> bool {
        self.unit_size > 0
    }

    /// Allocation granularity in bytes; zero when disabled.
    pub fn unit_size(&self) -> u64 {
        self.unit_size
    }

    /// Pool ceiling in bytes; [`DCA_MAX_MEM_SIZE`] means unbounded.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Shrink floor in bytes; [`DCA_MAX_MEM_SIZE`] means never shrink.
    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    /// Number of segments currently held.
    pub fn mem_count(&self) -> usize {
        self.segs.lock().unwrap().len()
    }

    /// Bytes currently held.
    pub fn total_size(&self) -> u64 {
        self.mem_count() as u64 * self.unit_size
    }

    /// Queue pairs the shared status region can track; zero without one.
    pub fn max_qps(&self) -> u32 {
        self.max_qps
    }

    /// Whether the kernel-shared status region is mapped.
    pub fn has_status_bitmap(&self) -> bool {
        self.status.is_some()
    }

    /// Adds one unit-sized segment to the pool.
    ///
    /// The buffer is allocated and registered with the kernel before taking
    /// the pool lock; admission is then re-checked under the lock, and a
    /// segment that would push the pool past its ceiling is rolled back.
    /// The held total therefore never exceeds the ceiling, even under
    /// concurrent growth.
    pub fn grow(&self) -> std::result::Result<(), PoolError> {
        if !self.is_enabled() {
            return Err(PoolError::Disabled);
        }

        let buf = AlignedBuf::new(self.unit_size as usize, self.page_size);
        let key = buf.as_ptr() as u64;
        let handle = self
            .channel
            .register_dca_mem(key, key, self.unit_size as u32)
            .map_err(PoolError::Register)?;
        let mem = DcaMem { buf, handle, key };

        {
            let mut segs = self.segs.lock().unwrap();
            let total = segs.len() as u64 * self.unit_size;
            if self.max_size != DCA_MAX_MEM_SIZE && total + self.unit_size > self.max_size {
                drop(segs);
                self.release_segment(mem);
                return Err(PoolError::LimitReached);
            }
            segs.push(mem);
        }

        debug!(unit_size = self.unit_size, "grew DCA pool");
        Ok(())
    }

    /// Releases trailing segments until the held total reaches the shrink
    /// floor. Returns the number of segments released.
    ///
    /// Deregistration happens after the pool lock is dropped and is best
    /// effort.
    pub fn shrink(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }

        let mut detached = Vec::new();
        {
            let mut segs = self.segs.lock().unwrap();
            while segs.len() as u64 * self.unit_size > self.min_size {
                match segs.pop() {
                    Some(mem) => detached.push(mem),
                    None => break,
                }
            }
        }

        let released = detached.len();
        for mem in detached {
            self.release_segment(mem);
        }
        if released > 0 {
            debug!(released, "shrank DCA pool");
        }
        released
    }

    /// Marks `dcan` as mid-post so the kernel will not detach its buffers.
    pub fn start_post(&self, dcan: u32) -> std::result::Result<(), PoolError> {
        self.status_for(dcan)?
            .sync_word(dcan)
            .fetch_or(bit(dcan), Ordering::Release);
        Ok(())
    }

    /// Clears the mid-post mark for `dcan`.
    pub fn stop_post(&self, dcan: u32) -> std::result::Result<(), PoolError> {
        self.status_for(dcan)?
            .sync_word(dcan)
            .fetch_and(!bit(dcan), Ordering::Release);
        Ok(())
    }

    /// Whether the kernel currently has buffers attached to `dcan`.
    pub fn is_attached(&self, dcan: u32) -> std::result::Result<bool, PoolError> {
        let word = self.status_for(dcan)?.attach_word(dcan);
        Ok(word.load(Ordering::Acquire) & bit(dcan) != 0)
    }

    fn status_for(&self, dcan: u32) -> std::result::Result<&StatusBitmap, PoolError> {
        if dcan >= self.max_qps {
            return Err(PoolError::BadQueueSlot(dcan));
        }
        self.status.as_ref().ok_or(PoolError::BadQueueSlot(dcan))
    }

    fn release_segment(&self, mem: DcaMem) {
        if let Err(e) = self.channel.deregister_dca_mem(mem.handle) {
            warn!(key = mem.key, error = %e, "DCA segment deregistration failed");
        }
    }
}

impl Drop for DcaPool {
    fn drop(&mut self) {
        // &mut self guarantees no operation is in flight; the lock itself is
        // not needed to drain.
        let segs = match self.segs.get_mut() {
            Ok(segs) => segs,
            Err(poisoned) => poisoned.into_inner(),
        };
        for mem in std::mem::take(segs) {
            if let Err(e) = self.channel.deregister_dca_mem(mem.handle) {
                warn!(key = mem.key, error = %e, "DCA segment deregistration failed");
            }
        }
        // The status region, if any, unmaps when its field drops.
    }
}
