//! Context lifecycle.
//!
//! A [`Context`] is one opened device handle: the negotiated capabilities,
//! the mapped doorbell page (plus the tail-pointer region on the first
//! generation), the DCA pool, and the queue-pair and shared-receive-queue
//! tables. Construction acquires those resources in a fixed order and any
//! failure releases exactly the ones already acquired, in reverse; drop
//! releases them all the same way.

use std::io;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::debug;

use hns_uapi::{
    AllocUcontextCmd, ALLOC_UCTX_COMP_DCA_MAX_QPS, CQE_SIZE, QP_TABLE_BITS, SRQ_TABLE_BITS,
    V3_CQE_SIZE,
};

use crate::channel::{CommandChannel, DeviceAttr};
use crate::dca::{DcaAttr, DcaPool};
use crate::device::{Device, HwVersion};
use crate::error::{Error, Result};
use crate::mmap::{map_legacy, map_primary, MappedRegion};
use crate::table::ResourceTable;
use crate::verbs::{Qp, Srq, VerbsOps};

bitflags! {
    /// Features requested when opening a context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u64 {
        /// Run the context in DCA mode.
        const DCA = 1 << 0;
    }
}

bitflags! {
    /// Capability bits the kernel granted at context open.
    ///
    /// Unknown bits are retained so newer kernels remain usable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapFlags: u32 {
        /// The kernel driver runs the DCA memory pool.
        const DCA_MODE = hns_uapi::CAP_FLAG_DCA_MODE;
    }
}

/// Optional attributes for opening a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAttr {
    pub flags: ContextFlags,
    pub dca: DcaAttr,
}

fn ucontext_cmd(attr: Option<&ContextAttr>) -> AllocUcontextCmd {
    let mut cmd = AllocUcontextCmd::default();
    if let Some(attr) = attr.filter(|a| a.flags.contains(ContextFlags::DCA)) {
        if let Some(prime_qps) = attr.dca.prime_qps {
            cmd.comp |= ALLOC_UCTX_COMP_DCA_MAX_QPS;
            cmd.dca_max_qps = prime_qps;
        }
    }
    cmd
}

/// A zero report selects the default entry size; anything past the largest
/// size the hardware emits is clamped down to it.
fn negotiated_cqe_size(reported: u32) -> u32 {
    if reported == 0 {
        CQE_SIZE
    } else if reported <= V3_CQE_SIZE {
        reported
    } else {
        V3_CQE_SIZE
    }
}

fn invalid_resp(msg: &'static str) -> Error {
    Error::Negotiation(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// One opened device handle.
pub struct Context {
    // Field order is teardown order: device mappings first, then the DCA
    // pool, then plain state.
    uar: MappedRegion,
    cq_tptr: Option<MappedRegion>,
    dca: DcaPool,
    channel: Arc<dyn CommandChannel>,
    ops: &'static dyn VerbsOps,
    qp_table: ResourceTable<Qp>,
    srq_table: ResourceTable<Srq>,
    limits: DeviceAttr,
    hw_version: u32,
    page_size: usize,
    cqe_size: u32,
    cap_flags: CapFlags,
    uar_lock: Mutex<()>,
}

impl Context {
    /// Opens a context on `device` over the given command channel.
    ///
    /// Resources are acquired in negotiation order; on any failure the
    /// already-acquired subset is released in reverse and the error is
    /// returned, never a partial context.
    pub fn open(
        device: &Device,
        channel: Arc<dyn CommandChannel>,
        attr: Option<&ContextAttr>,
    ) -> Result<Self> {
        let page_size = device.page_size();

        let cmd = ucontext_cmd(attr);
        let resp = channel.alloc_ucontext(&cmd).map_err(Error::Negotiation)?;

        let cqe_size = negotiated_cqe_size(resp.cqe_size);
        let cap_flags = CapFlags::from_bits_retain(resp.cap_flags);

        if !resp.qp_tab_size.is_power_of_two() {
            return Err(invalid_resp("queue pair table size is not a power of two"));
        }
        if !resp.srq_tab_size.is_power_of_two() {
            return Err(invalid_resp(
                "shared receive queue table size is not a power of two",
            ));
        }
        let qp_table = ResourceTable::new(resp.qp_tab_size, QP_TABLE_BITS);
        let srq_table = ResourceTable::new(resp.srq_tab_size, SRQ_TABLE_BITS);

        let limits = channel.query_device().map_err(Error::Query)?;
        let hw_version = limits.hw_version;

        // The pool is configured only when the caller asked for DCA and the
        // kernel granted it; an unanswered request leaves the pool disabled.
        let dca_attr = attr
            .filter(|a| a.flags.contains(ContextFlags::DCA))
            .filter(|_| cap_flags.contains(CapFlags::DCA_MODE))
            .map(|a| &a.dca);
        let dca = DcaPool::init(
            channel.clone(),
            page_size,
            dca_attr,
            resp.dca_qps,
            resp.dca_mmap_size as usize,
        )?;

        // A mapping failure from here on drops the pool before returning.
        let uar = map_primary(&channel.cmd_fd(), page_size)?;
        let cq_tptr = if hw_version == HwVersion::V1.id() {
            Some(map_legacy(&channel.cmd_fd(), page_size)?)
        } else {
            None
        };

        debug!(hw_version, cqe_size, "opened context");

        Ok(Self {
            uar,
            cq_tptr,
            dca,
            channel,
            ops: device.ops(),
            qp_table,
            srq_table,
            limits,
            hw_version,
            page_size,
            cqe_size,
            cap_flags,
            uar_lock: Mutex::new(()),
        })
    }

    /// The operation table resolved for this context's hardware generation.
    pub fn ops(&self) -> &'static dyn VerbsOps {
        self.ops
    }

    /// The kernel command plane this context was opened over.
    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    /// Hardware generation identifier the kernel reported.
    pub fn hw_version(&self) -> u32 {
        self.hw_version
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Completion-queue entry size every CQ on this context uses.
    pub fn cqe_size(&self) -> u32 {
        self.cqe_size
    }

    /// Capability bits granted at open, unknown bits included.
    pub fn cap_flags(&self) -> CapFlags {
        self.cap_flags
    }

    /// Device limits recorded at open.
    pub fn limits(&self) -> &DeviceAttr {
        &self.limits
    }

    /// The DCA memory pool. Disabled unless DCA was requested and granted.
    pub fn dca(&self) -> &DcaPool {
        &self.dca
    }

    /// The mapped doorbell page.
    pub fn uar(&self) -> *mut u8 {
        self.uar.as_ptr()
    }

    /// The legacy completion-queue tail-pointer region, present only on the
    /// first hardware generation.
    pub fn cq_tptr(&self) -> Option<*mut u8> {
        self.cq_tptr.as_ref().map(MappedRegion::as_ptr)
    }

    /// Serializes doorbell writes on generations without atomic 64-bit
    /// doorbells.
    pub fn doorbell_lock(&self) -> &Mutex<()> {
        &self.uar_lock
    }

    /// Looks up a live queue pair by number.
    pub fn find_qp(&self, qpn: u32) -> Option<Arc<Qp>> {
        self.qp_table.find(qpn)
    }

    /// Looks up a live shared receive queue by number.
    pub fn find_srq(&self, srqn: u32) -> Option<Arc<Srq>> {
        self.srq_table.find(srqn)
    }

    pub(crate) fn store_qp(&self, qpn: u32, qp: &Arc<Qp>) {
        self.qp_table.store(qpn, qp);
    }

    pub(crate) fn clear_qp(&self, qpn: u32) {
        self.qp_table.clear(qpn);
    }

    pub(crate) fn store_srq(&self, srqn: u32, srq: &Arc<Srq>) {
        self.srq_table.store(srqn, srq);
    }

    pub(crate) fn clear_srq(&self, srqn: u32) {
        self.srq_table.clear(srqn);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(hw_version = self.hw_version, "closing context");
        // Mappings, then the DCA pool, then plain state, by field order.
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("hw_version", &self.hw_version)
            .field("cqe_size", &self.cqe_size)
            .field("cap_flags", &self.cap_flags)
            .field("dca_enabled", &self.dca.is_enabled())
            .finish()
    }
}
