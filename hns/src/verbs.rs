//! Verb operation table.
//!
//! [`VerbsOps`] is the operation surface a context exposes to the host
//! runtime. The trait's default bodies form the generic layer shared by all
//! hardware generations: they validate against queried device limits, issue
//! the kernel command, and keep the context's resource tables current. A
//! generation type overrides whatever its descriptor formats require and
//! inherits the rest.

use std::sync::Arc;

use bitflags::bitflags;

use crate::channel::{DeviceAttr, PortAttr, QpAttr};
use crate::context::Context;
use crate::device::HwVersion;
use crate::error::{Error, Result};

bitflags! {
    /// Memory access flags for region registration and window binds.
    ///
    /// Local read access is always granted; `REMOTE_WRITE` and
    /// `REMOTE_ATOMIC` require `LOCAL_WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1 << 0;
        /// Enable remote write access.
        const REMOTE_WRITE = 1 << 1;
        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
        /// Enable remote atomic operations.
        const REMOTE_ATOMIC = 1 << 3;
        /// Allow memory windows to bind over the region.
        const MW_BIND = 1 << 4;
    }
}

/// Memory window type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MwType {
    /// Type 1: bound/unbound via the bind verb, owned by the PD.
    Type1 = 1,
    /// Type 2: bound via work requests, owned by a QP.
    Type2 = 2,
}

/// Queue-pair creation attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct QpInitAttr {
    pub pdn: u32,
    pub send_cqn: u32,
    pub recv_cqn: u32,
    /// Shared receive queue to draw receives from, if any.
    pub srqn: Option<u32>,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Shared-receive-queue creation attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrqInitAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    /// Watermark for the SRQ limit event; zero disables it.
    pub limit: u32,
}

/// A protection domain.
#[derive(Debug)]
pub struct Pd {
    pdn: u32,
}

impl Pd {
    pub fn pdn(&self) -> u32 {
        self.pdn
    }
}

/// A completion queue.
#[derive(Debug)]
pub struct Cq {
    cqn: u32,
    cqe: u32,
}

impl Cq {
    pub fn cqn(&self) -> u32 {
        self.cqn
    }

    /// Entry count the queue was created with.
    pub fn cqe(&self) -> u32 {
        self.cqe
    }
}

/// A queue pair. Tracked in the context's QP table while alive.
#[derive(Debug)]
pub struct Qp {
    qpn: u32,
    dcan: Option<u32>,
}

impl Qp {
    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    /// DCA status slot for this queue pair, when the context runs in DCA
    /// mode.
    pub fn dcan(&self) -> Option<u32> {
        self.dcan
    }
}

/// A shared receive queue. Tracked in the context's SRQ table while alive.
#[derive(Debug)]
pub struct Srq {
    srqn: u32,
}

impl Srq {
    pub fn srqn(&self) -> u32 {
        self.srqn
    }
}

/// A registered memory region.
#[derive(Debug)]
pub struct Mr {
    lkey: u32,
    rkey: u32,
    addr: u64,
    length: u64,
}

impl Mr {
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

/// A memory window.
#[derive(Debug)]
pub struct Mw {
    rkey: u32,
    mw_type: MwType,
}

impl Mw {
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn mw_type(&self) -> MwType {
        self.mw_type
    }
}

/// A shared-receive-queue domain.
#[derive(Debug)]
pub struct Xrcd {
    xrcdn: u32,
}

impl Xrcd {
    pub fn xrcdn(&self) -> u32 {
        self.xrcdn
    }
}

/// The operation table a context exposes to the host runtime.
///
/// Default bodies are the generic layer; [`hw_version`](VerbsOps::hw_version)
/// is the only entry a generation must provide.
pub trait VerbsOps: Send + Sync {
    /// Generation this implementation drives.
    fn hw_version(&self) -> HwVersion;

    fn query_device(&self, ctx: &Context) -> Result<DeviceAttr> {
        ctx.channel().query_device().map_err(Error::Query)
    }

    fn query_port(&self, ctx: &Context, port: u8) -> Result<PortAttr> {
        ctx.channel().query_port(port).map_err(Error::Query)
    }

    fn alloc_pd(&self, ctx: &Context) -> Result<Pd> {
        let pdn = ctx.channel().alloc_pd()?;
        Ok(Pd { pdn })
    }

    fn dealloc_pd(&self, ctx: &Context, pd: Pd) -> Result<()> {
        ctx.channel().dealloc_pd(pd.pdn)?;
        Ok(())
    }

    fn create_cq(&self, ctx: &Context, cqe: u32) -> Result<Cq> {
        if cqe == 0 || cqe > ctx.limits().max_cqe {
            return Err(Error::Limit("completion queue depth out of range"));
        }
        let cqn = ctx.channel().create_cq(cqe, ctx.cqe_size())?;
        Ok(Cq { cqn, cqe })
    }

    fn destroy_cq(&self, ctx: &Context, cq: Cq) -> Result<()> {
        ctx.channel().destroy_cq(cq.cqn)?;
        Ok(())
    }

    fn create_qp(&self, ctx: &Context, attr: &QpInitAttr) -> Result<Arc<Qp>> {
        let limits = ctx.limits();
        if attr.max_send_wr > limits.max_qp_wr || attr.max_recv_wr > limits.max_qp_wr {
            return Err(Error::Limit("work request depth exceeds device limit"));
        }
        if attr.max_send_sge > limits.max_sge || attr.max_recv_sge > limits.max_sge {
            return Err(Error::Limit("scatter/gather depth exceeds device limit"));
        }
        let resp = ctx.channel().create_qp(attr)?;
        let qp = Arc::new(Qp {
            qpn: resp.qpn,
            dcan: resp.dcan,
        });
        ctx.store_qp(resp.qpn, &qp);
        Ok(qp)
    }

    fn modify_qp(&self, ctx: &Context, qpn: u32, attr: &QpAttr) -> Result<()> {
        ctx.channel().modify_qp(qpn, attr)?;
        Ok(())
    }

    fn query_qp(&self, ctx: &Context, qpn: u32) -> Result<QpAttr> {
        let attr = ctx.channel().query_qp(qpn)?;
        Ok(attr)
    }

    /// Destroys a queue pair. The table slot is cleared first so no lookup
    /// can observe a queue pair the kernel is already tearing down.
    fn destroy_qp(&self, ctx: &Context, qp: &Qp) -> Result<()> {
        ctx.clear_qp(qp.qpn);
        ctx.channel().destroy_qp(qp.qpn)?;
        Ok(())
    }

    fn create_srq(&self, ctx: &Context, attr: &SrqInitAttr) -> Result<Arc<Srq>> {
        let limits = ctx.limits();
        if attr.max_wr == 0 || attr.max_wr > limits.max_srq_wr {
            return Err(Error::Limit("shared receive queue depth out of range"));
        }
        if attr.max_sge > limits.max_srq_sge {
            return Err(Error::Limit("scatter/gather depth exceeds device limit"));
        }
        let srqn = ctx.channel().create_srq(attr)?;
        let srq = Arc::new(Srq { srqn });
        ctx.store_srq(srqn, &srq);
        Ok(srq)
    }

    fn modify_srq(&self, ctx: &Context, srqn: u32, max_wr: u32, limit: u32) -> Result<()> {
        ctx.channel().modify_srq(srqn, max_wr, limit)?;
        Ok(())
    }

    fn query_srq(&self, ctx: &Context, srqn: u32) -> Result<SrqInitAttr> {
        let attr = ctx.channel().query_srq(srqn)?;
        Ok(attr)
    }

    fn destroy_srq(&self, ctx: &Context, srq: &Srq) -> Result<()> {
        ctx.clear_srq(srq.srqn);
        ctx.channel().destroy_srq(srq.srqn)?;
        Ok(())
    }

    fn get_srq_num(&self, srq: &Srq) -> u32 {
        srq.srqn
    }

    fn reg_mr(&self, ctx: &Context, addr: u64, length: u64, access: AccessFlags) -> Result<Mr> {
        if length == 0 {
            return Err(Error::Limit("cannot register an empty region"));
        }
        let resp = ctx.channel().reg_mr(addr, length, access)?;
        Ok(Mr {
            lkey: resp.lkey,
            rkey: resp.rkey,
            addr,
            length,
        })
    }

    fn rereg_mr(
        &self,
        ctx: &Context,
        mr: &mut Mr,
        addr: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<()> {
        if length == 0 {
            return Err(Error::Limit("cannot register an empty region"));
        }
        let resp = ctx.channel().rereg_mr(mr.lkey, addr, length, access)?;
        mr.lkey = resp.lkey;
        mr.rkey = resp.rkey;
        mr.addr = addr;
        mr.length = length;
        Ok(())
    }

    fn dereg_mr(&self, ctx: &Context, mr: Mr) -> Result<()> {
        ctx.channel().dereg_mr(mr.lkey)?;
        Ok(())
    }

    fn alloc_mw(&self, ctx: &Context, mw_type: MwType) -> Result<Mw> {
        let rkey = ctx.channel().alloc_mw(mw_type)?;
        Ok(Mw { rkey, mw_type })
    }

    /// Binds a window over part of a registered region, refreshing its rkey.
    fn bind_mw(
        &self,
        ctx: &Context,
        qpn: u32,
        mw: &mut Mw,
        mr: &Mr,
        addr: u64,
        length: u64,
    ) -> Result<()> {
        if addr < mr.addr || addr.saturating_add(length) > mr.addr.saturating_add(mr.length) {
            return Err(Error::Limit("window range outside the memory region"));
        }
        let rkey = ctx.channel().bind_mw(qpn, mw.rkey, mr.lkey, addr, length)?;
        mw.rkey = rkey;
        Ok(())
    }

    fn dealloc_mw(&self, ctx: &Context, mw: Mw) -> Result<()> {
        ctx.channel().dealloc_mw(mw.rkey)?;
        Ok(())
    }

    fn open_xrcd(&self, ctx: &Context) -> Result<Xrcd> {
        let xrcdn = ctx.channel().open_xrcd()?;
        Ok(Xrcd { xrcdn })
    }

    fn close_xrcd(&self, ctx: &Context, xrcd: Xrcd) -> Result<()> {
        ctx.channel().close_xrcd(xrcd.xrcdn)?;
        Ok(())
    }
}

/// Generic operations for the hip06 generation.
pub struct HwV1;

impl VerbsOps for HwV1 {
    fn hw_version(&self) -> HwVersion {
        HwVersion::V1
    }
}

/// Generic operations for the hip08-and-later generations.
pub struct HwV2;

impl VerbsOps for HwV2 {
    fn hw_version(&self) -> HwVersion {
        HwVersion::V2
    }
}
