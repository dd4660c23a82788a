//! Kernel ABI for the HiSilicon RoCE engine userspace provider.
//!
//! Everything in this crate is a wire contract shared with the kernel-side
//! driver: mmap-offset encoding, the context-allocation command/response
//! layout, capability bits, and protocol constants. None of these values may
//! change independently of the kernel; treat them as versioned constants.

/// Number of index bits carried in the low byte of a mmap offset.
const MMAP_INDEX_LOW_BITS: u32 = 8;
/// Number of index bits carried above bit 16 of a mmap offset.
const MMAP_INDEX_HIGH_BITS: u32 = 48;

/// Total index bits an offset can carry: low byte plus bits [63:16].
pub const MMAP_INDEX_BITS: u32 = MMAP_INDEX_LOW_BITS + MMAP_INDEX_HIGH_BITS;

/// Mapping command selecting a regular page (doorbell, legacy regions).
pub const MMAP_REGULAR_PAGE: u8 = 0;
/// Mapping command selecting the DCA status page.
pub const MMAP_DCA_PAGE: u8 = 1;

/// Encode a (command, index) pair into an opaque mmap page offset.
///
/// Layout: command occupies bits [15:8]; the index is split across bits
/// [7:0] and [63:16]. The encoding is a bijection for any command and any
/// index below 2^56.
#[inline]
pub const fn encode_mmap_offset(command: u8, index: u64) -> u64 {
    ((command as u64) << MMAP_INDEX_LOW_BITS)
        | (index & 0xff)
        | ((index >> MMAP_INDEX_LOW_BITS) << 16)
}

/// Decode an opaque mmap page offset back into its (command, index) pair.
#[inline]
pub const fn decode_mmap_offset(offset: u64) -> (u8, u64) {
    let command = ((offset >> MMAP_INDEX_LOW_BITS) & 0xff) as u8;
    let index = (offset & 0xff) | ((offset >> 16) << MMAP_INDEX_LOW_BITS);
    (command, index)
}

/// Byte offset passed to `mmap(2)` for the given resource index and command.
///
/// The kernel side multiplies the page offset out the same way; both sides
/// must agree on the page size in use.
#[inline]
pub const fn uar_offset(index: u64, page_size: usize, command: u8) -> i64 {
    (encode_mmap_offset(command, index) * page_size as u64) as i64
}

/// Context-allocation command: ask the kernel to report the maximum
/// queue-pair count available for DCA priming.
pub const ALLOC_UCTX_COMP_DCA_MAX_QPS: u32 = 1 << 0;

/// Negotiated capability bit: the kernel driver runs the DCA memory pool.
pub const CAP_FLAG_DCA_MODE: u32 = 1 << 15;

/// Context-allocation request sent to the kernel driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocUcontextCmd {
    /// Bitmask of `ALLOC_UCTX_COMP_*` fields present in this request.
    pub comp: u32,
    /// Requested DCA prime queue-pair count; valid when
    /// `ALLOC_UCTX_COMP_DCA_MAX_QPS` is set in `comp`.
    pub dca_max_qps: u32,
}

/// Context-allocation response returned by the kernel driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocUcontextResp {
    /// Queue-pair table size (power of two).
    pub qp_tab_size: u32,
    /// Completion-queue-entry size in bytes; 0 means "driver default".
    pub cqe_size: u32,
    /// Shared-receive-queue table size (power of two).
    pub srq_tab_size: u32,
    /// Negotiated `CAP_FLAG_*` bits.
    pub cap_flags: u32,
    /// Maximum queue pairs the kernel will track for DCA.
    pub dca_qps: u32,
    /// Size in bytes of the shared DCA status region; 0 means none.
    pub dca_mmap_size: u32,
}

/// Bit width of the queue-pair table's bucket index.
pub const QP_TABLE_BITS: u32 = 8;
/// Number of buckets in the queue-pair table.
pub const QP_TABLE_SIZE: usize = 1 << QP_TABLE_BITS;

/// Bit width of the shared-receive-queue table's bucket index.
pub const SRQ_TABLE_BITS: u32 = 8;
/// Number of buckets in the shared-receive-queue table.
pub const SRQ_TABLE_SIZE: usize = 1 << SRQ_TABLE_BITS;

/// Default completion-queue-entry size in bytes.
pub const CQE_SIZE: u32 = 32;
/// Largest completion-queue-entry size any supported generation emits.
pub const V3_CQE_SIZE: u32 = 64;

/// Size of the legacy completion-queue tail-pointer region: 64 K completion
/// queues, two bytes of tail pointer each.
pub const CQ_DB_BUF_SIZE: usize = (64 * 1024) * 2;

/// Default DCA allocation unit, in pages, when the caller does not request
/// a unit size.
pub const DCA_DEFAULT_UNIT_PAGES: u64 = 16;

/// Sentinel pool bound: no upper limit / never shrink.
pub const DCA_MAX_MEM_SIZE: u64 = u64::MAX;

/// Status bits each half of the shared DCA region devotes to one queue pair.
pub const DCA_BITS_PER_STATUS: u32 = 1;
