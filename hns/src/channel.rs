//! Kernel command plane.
//!
//! Every control-path request the provider makes of the kernel driver goes
//! through [`CommandChannel`]: capability negotiation, attribute queries, the
//! per-verb commands, and DCA segment registration. The host RDMA runtime
//! implements this over its uverbs descriptor; the provider only performs
//! `mmap(2)` directly, against [`CommandChannel::cmd_fd`].

use std::io;
use std::os::fd::BorrowedFd;

use hns_uapi::{AllocUcontextCmd, AllocUcontextResp};

use crate::verbs::{AccessFlags, MwType, QpInitAttr, SrqInitAttr};

/// Device attributes reported by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceAttr {
    /// Hardware generation identifier (see [`crate::device::HwVersion`]).
    pub hw_version: u32,
    /// Maximum outstanding work requests on one queue pair.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
    /// Maximum entries in one completion queue.
    pub max_cqe: u32,
    /// Maximum outstanding work requests on one shared receive queue.
    pub max_srq_wr: u32,
    /// Maximum scatter/gather entries per shared-receive work request.
    pub max_srq_sge: u32,
}

/// Port attributes reported by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortAttr {
    /// Logical port state (down, init, armed, active).
    pub state: u32,
    /// Active MTU in bytes.
    pub active_mtu: u32,
    /// Entries in the port's GID table.
    pub gid_tbl_len: u32,
    /// Local identifier, for link layers that carry one.
    pub lid: u16,
}

/// Kernel response to queue-pair creation.
#[derive(Debug, Clone, Copy)]
pub struct QpCreateResp {
    /// Queue-pair number.
    pub qpn: u32,
    /// DCA slot assigned to this queue pair, when the context runs in DCA
    /// mode.
    pub dcan: Option<u32>,
}

/// Kernel response to memory-region registration.
#[derive(Debug, Clone, Copy)]
pub struct MrResp {
    pub lkey: u32,
    pub rkey: u32,
}

/// Current queue-pair state as reported by a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QpAttr {
    pub state: u32,
    pub cur_state: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

/// The kernel command plane for one opened device.
///
/// All methods are synchronous and may block in the kernel. Implementations
/// must be usable from multiple threads; the provider does not serialize
/// calls.
pub trait CommandChannel: Send + Sync {
    /// The descriptor device mappings are performed against.
    fn cmd_fd(&self) -> BorrowedFd<'_>;

    /// Context allocation and capability negotiation.
    fn alloc_ucontext(&self, cmd: &AllocUcontextCmd) -> io::Result<AllocUcontextResp>;

    fn query_device(&self) -> io::Result<DeviceAttr>;
    fn query_port(&self, port: u8) -> io::Result<PortAttr>;

    /// Allocates a protection domain, returning its number.
    fn alloc_pd(&self) -> io::Result<u32>;
    fn dealloc_pd(&self, pdn: u32) -> io::Result<()>;

    /// Creates a completion queue of `cqe` entries of `cqe_size` bytes,
    /// returning its number.
    fn create_cq(&self, cqe: u32, cqe_size: u32) -> io::Result<u32>;
    fn destroy_cq(&self, cqn: u32) -> io::Result<()>;

    fn create_qp(&self, attr: &QpInitAttr) -> io::Result<QpCreateResp>;
    fn modify_qp(&self, qpn: u32, attr: &QpAttr) -> io::Result<()>;
    fn query_qp(&self, qpn: u32) -> io::Result<QpAttr>;
    fn destroy_qp(&self, qpn: u32) -> io::Result<()>;

    /// Creates a shared receive queue, returning its number.
    fn create_srq(&self, attr: &SrqInitAttr) -> io::Result<u32>;
    fn modify_srq(&self, srqn: u32, max_wr: u32, limit: u32) -> io::Result<()>;
    fn query_srq(&self, srqn: u32) -> io::Result<SrqInitAttr>;
    fn destroy_srq(&self, srqn: u32) -> io::Result<()>;

    fn reg_mr(&self, addr: u64, length: u64, access: AccessFlags) -> io::Result<MrResp>;
    fn rereg_mr(&self, lkey: u32, addr: u64, length: u64, access: AccessFlags)
        -> io::Result<MrResp>;
    fn dereg_mr(&self, lkey: u32) -> io::Result<()>;

    /// Allocates a memory window, returning its rkey.
    fn alloc_mw(&self, mw_type: MwType) -> io::Result<u32>;
    /// Binds a window over a registered region; returns the new rkey.
    fn bind_mw(&self, qpn: u32, rkey: u32, mr_lkey: u32, addr: u64, length: u64)
        -> io::Result<u32>;
    fn dealloc_mw(&self, rkey: u32) -> io::Result<()>;

    /// Opens a shared-receive-queue domain, returning its number.
    fn open_xrcd(&self) -> io::Result<u32>;
    fn close_xrcd(&self, xrcdn: u32) -> io::Result<()>;

    /// Registers one DCA memory segment with the kernel, returning a
    /// deregistration handle. `key` identifies the segment in later
    /// attach/detach traffic; this provider uses the segment's base address.
    fn register_dca_mem(&self, key: u64, addr: u64, size: u32) -> io::Result<u32>;
    fn deregister_dca_mem(&self, handle: u32) -> io::Result<()>;
}
