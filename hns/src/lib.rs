//! # hns - Userspace driver for HiSilicon RoCE engines
//!
//! This crate is the userspace half of the HiSilicon RDMA network adapter
//! driver: it negotiates a per-process context with the kernel driver, maps
//! the doorbell and status pages the hardware exposes, and runs the verbs
//! object lifecycle (protection domains, queues, memory regions) over a
//! command channel.
//!
//! ## Design Philosophy
//!
//! ### Context-Centric Model
//!
//! Everything hangs off a [`Context`]:
//!
//! - **Negotiated state**: capability flags, CQE size, and table geometry
//!   exchanged with the kernel at open.
//! - **Mappings**: the doorbell page, the legacy tail-pointer region on
//!   first-generation hardware, and the DCA status bitmap.
//! - **Resource tables**: queue-pair and shared-receive-queue lookup used to
//!   route completion events back to their owners.
//!
//! A context acquires these in a fixed order and releases them in reverse;
//! a failed open never leaks a mapping or a kernel object.
//!
//! ### Command Channel Seam
//!
//! All kernel communication goes through the [`CommandChannel`] trait. The
//! driver logic above it (validation, table maintenance, pool accounting)
//! is ordinary code that can be exercised against an in-process fake, while
//! a production channel forwards to the kernel's command interface.
//!
//! ### Hardware Generations
//!
//! Devices are matched against a static table of PCI identifiers and
//! modalias patterns ([`match_device`]); the match selects a [`VerbsOps`]
//! operation table for that generation. Generation differences are confined
//! to the operation table and a handful of open-time decisions, so the rest
//! of the crate is generation-agnostic.
//!
//! ### DCA Pool
//!
//! In DCA mode queue pairs borrow WQE buffers from a context-wide pool
//! instead of owning them. [`DcaPool`] grows and shrinks that pool in
//! fixed-size units registered with the kernel, and reads the kernel-shared
//! status bitmap to tell which queue pairs currently hold buffers.
//!
//! ## Module Overview
//!
//! - [`context`]: Context lifecycle and negotiated state
//! - [`device`]: Device matching and hardware generations
//! - [`channel`]: Kernel command plane abstraction
//! - [`dca`]: DCA memory pool and attach-state bitmap
//! - [`verbs`]: Verbs objects and the per-generation operation table
//! - [`error`]: Error taxonomy

pub mod channel;
pub mod context;
pub mod dca;
pub mod device;
pub mod error;
pub mod verbs;

mod mmap;
mod table;

// Re-export context types
pub use context::{CapFlags, Context, ContextAttr, ContextFlags};

// Re-export device matching types
pub use device::{match_device, Device, DeviceDesc, HwVersion};

// Re-export the command plane seam
pub use channel::{CommandChannel, DeviceAttr, PortAttr, QpAttr};

// Re-export DCA pool types
pub use dca::{DcaAttr, DcaPool};

// Re-export verbs objects and the operation table
pub use verbs::{AccessFlags, MwType, QpInitAttr, SrqInitAttr, VerbsOps};
pub use verbs::{Cq, Mr, Mw, Pd, Qp, Srq, Xrcd};

pub use error::{Error, PoolError, Result};
