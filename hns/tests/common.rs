//! Common test utilities for the hns integration tests.
//!
//! [`FakeChannel`] stands in for the kernel command plane: it answers every
//! command from configurable canned responses, records the call sequence,
//! and hands out a memfd as the mapping descriptor so the real `mmap` paths
//! run against ordinary file pages.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;

use hns::channel::{CommandChannel, DeviceAttr, MrResp, PortAttr, QpAttr, QpCreateResp};
use hns::device::{Device, DeviceDesc};
use hns::verbs::{AccessFlags, MwType, QpInitAttr, SrqInitAttr};
use hns::HwVersion;
use hns_uapi::{AllocUcontextCmd, AllocUcontextResp};

pub const PAGE_SIZE: usize = 4096;

/// Covers the doorbell page, the legacy tail-pointer region, and a status
/// page at the DCA-encoded offset (256 pages in).
pub const BACKING_LEN: i64 = 2 * 1024 * 1024;

/// One kernel command as seen by [`FakeChannel`], in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    AllocUcontext,
    QueryDevice,
    QueryPort(u8),
    AllocPd,
    DeallocPd(u32),
    CreateCq { cqe: u32, cqe_size: u32 },
    DestroyCq(u32),
    CreateQp,
    ModifyQp(u32),
    QueryQp(u32),
    DestroyQp(u32),
    CreateSrq,
    ModifySrq(u32),
    QuerySrq(u32),
    DestroySrq(u32),
    RegMr { addr: u64, length: u64 },
    ReregMr(u32),
    DeregMr(u32),
    AllocMw,
    BindMw { qpn: u32 },
    DeallocMw(u32),
    OpenXrcd,
    CloseXrcd(u32),
    RegisterDca { size: u32 },
    DeregisterDca(u32),
}

pub struct FakeChannel {
    fd: OwnedFd,
    /// When set, `cmd_fd` switches to this descriptor once `good_maps`
    /// mappings have been handed the real one.
    bad_fd: Option<OwnedFd>,
    good_maps: u32,
    map_count: AtomicU32,
    /// Returned from context allocation.
    pub resp: AllocUcontextResp,
    /// Returned from the device query.
    pub attrs: DeviceAttr,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU32,
    next_qpn: AtomicU32,
    next_dcan: AtomicU32,
    pub fail_alloc_ucontext: AtomicBool,
    pub fail_query_device: AtomicBool,
    pub fail_register_dca: AtomicBool,
    pub fail_destroy_qp: AtomicBool,
}

impl FakeChannel {
    pub fn new() -> Self {
        let name = std::ffi::CString::new("hns-fake-uverbs").unwrap();
        let fd = memfd_create(&name, MemFdCreateFlag::empty()).unwrap();
        ftruncate(&fd, BACKING_LEN).unwrap();
        Self::with_fd(fd)
    }

    /// A channel whose descriptor rejects shared writable mappings, for
    /// exercising map-failure paths. Commands still succeed.
    pub fn with_unmappable_fd() -> Self {
        let file = File::open("/dev/null").unwrap();
        Self::with_fd(file.into())
    }

    /// A channel whose descriptor maps normally `good_maps` times and then
    /// rejects further mappings, for failing a specific map mid-open.
    pub fn with_fd_failing_after(good_maps: u32) -> Self {
        let mut ch = Self::new();
        ch.bad_fd = Some(File::open("/dev/null").unwrap().into());
        ch.good_maps = good_maps;
        ch
    }

    fn with_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            bad_fd: None,
            good_maps: 0,
            map_count: AtomicU32::new(0),
            resp: AllocUcontextResp {
                qp_tab_size: 1 << 16,
                cqe_size: 64,
                srq_tab_size: 1 << 8,
                cap_flags: 0,
                dca_qps: 0,
                dca_mmap_size: 0,
            },
            attrs: DeviceAttr {
                hw_version: HwVersion::V2.id(),
                max_qp_wr: 32768,
                max_sge: 32,
                max_cqe: 65536,
                max_srq_wr: 32768,
                max_srq_sge: 16,
            },
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            next_qpn: AtomicU32::new(8),
            next_dcan: AtomicU32::new(0),
            fail_alloc_ucontext: AtomicBool::new(false),
            fail_query_device: AtomicBool::new(false),
            fail_register_dca: AtomicBool::new(false),
            fail_destroy_qp: AtomicBool::new(false),
        }
    }

    /// Writes raw bytes into the backing file, for seeding regions the
    /// kernel side would normally populate.
    pub fn write_backing(&self, offset: u64, bytes: &[u8]) {
        use std::os::unix::fs::FileExt;
        let file = File::from(self.fd.try_clone().unwrap());
        file.write_at(bytes, offset).unwrap();
    }

    /// Reads raw bytes back out of the backing file.
    pub fn read_backing(&self, offset: u64, buf: &mut [u8]) {
        use std::os::unix::fs::FileExt;
        let file = File::from(self.fd.try_clone().unwrap());
        file.read_exact_at(buf, offset).unwrap();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl CommandChannel for FakeChannel {
    fn cmd_fd(&self) -> BorrowedFd<'_> {
        let n = self.map_count.fetch_add(1, Ordering::Relaxed);
        match &self.bad_fd {
            Some(bad) if n >= self.good_maps => bad.as_fd(),
            _ => self.fd.as_fd(),
        }
    }

    fn alloc_ucontext(&self, _cmd: &AllocUcontextCmd) -> io::Result<AllocUcontextResp> {
        self.log(Call::AllocUcontext);
        if self.fail_alloc_ucontext.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "context allocation refused",
            ));
        }
        Ok(self.resp)
    }

    fn query_device(&self) -> io::Result<DeviceAttr> {
        self.log(Call::QueryDevice);
        if self.fail_query_device.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "device query refused",
            ));
        }
        Ok(self.attrs)
    }

    fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        self.log(Call::QueryPort(port));
        Ok(PortAttr {
            state: 4,
            active_mtu: 4096,
            gid_tbl_len: 16,
            lid: 0,
        })
    }

    fn alloc_pd(&self) -> io::Result<u32> {
        self.log(Call::AllocPd);
        Ok(self.next_id())
    }

    fn dealloc_pd(&self, pdn: u32) -> io::Result<()> {
        self.log(Call::DeallocPd(pdn));
        Ok(())
    }

    fn create_cq(&self, cqe: u32, cqe_size: u32) -> io::Result<u32> {
        self.log(Call::CreateCq { cqe, cqe_size });
        Ok(self.next_id())
    }

    fn destroy_cq(&self, cqn: u32) -> io::Result<()> {
        self.log(Call::DestroyCq(cqn));
        Ok(())
    }

    fn create_qp(&self, _attr: &QpInitAttr) -> io::Result<QpCreateResp> {
        self.log(Call::CreateQp);
        let qpn = self.next_qpn.fetch_add(1, Ordering::Relaxed);
        let dcan = if self.resp.cap_flags & hns_uapi::CAP_FLAG_DCA_MODE != 0 {
            Some(self.next_dcan.fetch_add(1, Ordering::Relaxed))
        } else {
            None
        };
        Ok(QpCreateResp { qpn, dcan })
    }

    fn modify_qp(&self, qpn: u32, _attr: &QpAttr) -> io::Result<()> {
        self.log(Call::ModifyQp(qpn));
        Ok(())
    }

    fn query_qp(&self, qpn: u32) -> io::Result<QpAttr> {
        self.log(Call::QueryQp(qpn));
        Ok(QpAttr::default())
    }

    fn destroy_qp(&self, qpn: u32) -> io::Result<()> {
        self.log(Call::DestroyQp(qpn));
        if self.fail_destroy_qp.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "queue pair destroy refused",
            ));
        }
        Ok(())
    }

    fn create_srq(&self, _attr: &SrqInitAttr) -> io::Result<u32> {
        self.log(Call::CreateSrq);
        Ok(self.next_id())
    }

    fn modify_srq(&self, srqn: u32, _max_wr: u32, _limit: u32) -> io::Result<()> {
        self.log(Call::ModifySrq(srqn));
        Ok(())
    }

    fn query_srq(&self, srqn: u32) -> io::Result<SrqInitAttr> {
        self.log(Call::QuerySrq(srqn));
        Ok(SrqInitAttr::default())
    }

    fn destroy_srq(&self, srqn: u32) -> io::Result<()> {
        self.log(Call::DestroySrq(srqn));
        Ok(())
    }

    fn reg_mr(&self, addr: u64, length: u64, _access: AccessFlags) -> io::Result<MrResp> {
        self.log(Call::RegMr { addr, length });
        let lkey = self.next_id();
        Ok(MrResp {
            lkey,
            rkey: lkey | 0x8000_0000,
        })
    }

    fn rereg_mr(
        &self,
        lkey: u32,
        _addr: u64,
        _length: u64,
        _access: AccessFlags,
    ) -> io::Result<MrResp> {
        self.log(Call::ReregMr(lkey));
        let lkey = self.next_id();
        Ok(MrResp {
            lkey,
            rkey: lkey | 0x8000_0000,
        })
    }

    fn dereg_mr(&self, lkey: u32) -> io::Result<()> {
        self.log(Call::DeregMr(lkey));
        Ok(())
    }

    fn alloc_mw(&self, _mw_type: MwType) -> io::Result<u32> {
        self.log(Call::AllocMw);
        Ok(self.next_id())
    }

    fn bind_mw(
        &self,
        qpn: u32,
        _rkey: u32,
        _mr_lkey: u32,
        _addr: u64,
        _length: u64,
    ) -> io::Result<u32> {
        self.log(Call::BindMw { qpn });
        Ok(self.next_id())
    }

    fn dealloc_mw(&self, rkey: u32) -> io::Result<()> {
        self.log(Call::DeallocMw(rkey));
        Ok(())
    }

    fn open_xrcd(&self) -> io::Result<u32> {
        self.log(Call::OpenXrcd);
        Ok(self.next_id())
    }

    fn close_xrcd(&self, xrcdn: u32) -> io::Result<()> {
        self.log(Call::CloseXrcd(xrcdn));
        Ok(())
    }

    fn register_dca_mem(&self, _key: u64, _addr: u64, size: u32) -> io::Result<u32> {
        self.log(Call::RegisterDca { size });
        if self.fail_register_dca.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "segment registration refused",
            ));
        }
        Ok(self.next_id())
    }

    fn deregister_dca_mem(&self, handle: u32) -> io::Result<()> {
        self.log(Call::DeregisterDca(handle));
        Ok(())
    }
}

/// A second-generation device with the test page size.
pub fn v2_device() -> Device {
    Device::with_page_size(
        &DeviceDesc::Pci {
            vendor: 0x19E5,
            device: 0xA222,
        },
        PAGE_SIZE,
    )
    .unwrap()
}

/// A first-generation device with the test page size.
pub fn v1_device() -> Device {
    Device::with_page_size(&DeviceDesc::Modalias("acpi:HISI00D1:"), PAGE_SIZE).unwrap()
}
