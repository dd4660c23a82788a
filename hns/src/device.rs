//! Device matching and discovery.
//!
//! A physical adapter is identified either by a PCI vendor/device pair or by
//! a platform (ACPI/OF) modalias string. A static table maps each known
//! identifier to the hardware-operations implementation for that generation.

use nix::unistd::{sysconf, SysconfVar};

use crate::verbs::{HwV1, HwV2, VerbsOps};

const PCI_VENDOR_ID_HUAWEI: u16 = 0x19E5;

/// Hardware generation of a supported adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwVersion {
    /// hip06 engine (platform-attached).
    V1,
    /// hip08 and later PCI engines.
    V2,
}

impl HwVersion {
    /// The generation identifier the kernel reports in device attributes.
    pub const fn id(self) -> u32 {
        match self {
            HwVersion::V1 => u32::from_be_bytes(*b"hi06"),
            HwVersion::V2 => u32::from_be_bytes(*b"hi08"),
        }
    }
}

/// How the host runtime identified a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDesc<'a> {
    /// PCI-attached device.
    Pci { vendor: u16, device: u16 },
    /// Platform device modalias, as read from sysfs.
    Modalias(&'a str),
}

enum MatchEnt {
    Modalias(&'static str, &'static dyn VerbsOps),
    Pci(u16, u16, &'static dyn VerbsOps),
}

static HW_V1: HwV1 = HwV1;
static HW_V2: HwV2 = HwV2;

static HCA_TABLE: &[MatchEnt] = &[
    MatchEnt::Modalias("acpi*:HISI00D1:*", &HW_V1),
    MatchEnt::Modalias("of:N*T*Chisilicon,hns-roce-v1C*", &HW_V1),
    MatchEnt::Modalias("of:N*T*Chisilicon,hns-roce-v1", &HW_V1),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA222, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA223, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA224, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA225, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA226, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA227, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA228, &HW_V2),
    MatchEnt::Pci(PCI_VENDOR_ID_HUAWEI, 0xA22F, &HW_V2),
];

/// Matches a pattern against text, where `*` matches any run of characters.
/// That is the only wildcard the match table needs.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Looks a descriptor up in the static match table.
pub fn match_device(desc: &DeviceDesc<'_>) -> Option<&'static dyn VerbsOps> {
    HCA_TABLE.iter().find_map(|ent| match (ent, desc) {
        (MatchEnt::Modalias(pattern, ops), DeviceDesc::Modalias(alias)) => {
            glob_match(pattern, alias).then_some(*ops)
        }
        (MatchEnt::Pci(vendor, device, ops), DeviceDesc::Pci { vendor: v, device: d }) => {
            (vendor == v && device == d).then_some(*ops)
        }
        _ => None,
    })
}

/// Whether a descriptor names an adapter this provider drives.
pub fn is_supported(desc: &DeviceDesc<'_>) -> bool {
    match_device(desc).is_some()
}

fn system_page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

/// A matched physical device. Immutable after discovery.
pub struct Device {
    ops: &'static dyn VerbsOps,
    page_size: usize,
}

impl Device {
    /// Matches the descriptor against the device table. Returns `None` for
    /// adapters this provider does not drive.
    pub fn new(desc: &DeviceDesc<'_>) -> Option<Self> {
        Self::with_page_size(desc, system_page_size())
    }

    /// Like [`Device::new`] with an explicit page size.
    pub fn with_page_size(desc: &DeviceDesc<'_>, page_size: usize) -> Option<Self> {
        match_device(desc).map(|ops| Self { ops, page_size })
    }

    /// The hardware-operations implementation for this generation.
    pub fn ops(&self) -> &'static dyn VerbsOps {
        self.ops
    }

    /// The generation selected by the match table.
    pub fn hw_version(&self) -> HwVersion {
        self.ops.hw_version()
    }

    /// System page size the device's mappings use.
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("hw_version", &self.hw_version())
            .field("page_size", &self.page_size)
            .finish()
    }
}
