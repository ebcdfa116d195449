use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

const CYPRESS_VID: u16 = 0x04b4;

/// CPU control and status register of the FX2's 8051 core. Writing 1 holds the core in reset,
/// writing 0 releases it.
pub const FX2_CPUCS: u16 = 0xe600;

/// Device families understood by the loader, identified by the IDs their boot ROMs enumerate with.
pub const DEVICE_TYPES: &[DeviceType] = &[
    // EZ-USB FX2(LP) default boot image
    cypress_dev("fx2", 0x8613, Some(FX2_CPUCS)),
    // EZ-USB FX3 default boot image
    cypress_dev("fx3", 0x00f3, None),
];

const fn cypress_dev(name: &'static str, pid: u16, halt_register: Option<u16>) -> DeviceType {
    DeviceType {
        name,
        id: UsbId {
            vid: CYPRESS_VID,
            pid,
        },
        halt_register,
    }
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid USB ID '{0}': expected <vid>:<pid> in hex")]
pub struct ParseUsbIdError(String);

/// Parse the `vvvv:pppp` form printed by [UsbId]'s [Display] impl.
impl FromStr for UsbId {
    type Err = ParseUsbIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseUsbIdError(s.to_owned());
        let (vid, pid) = s.split_once(':').ok_or_else(err)?;
        Ok(UsbId {
            vid: u16::from_str_radix(vid, 16).map_err(|_| err())?,
            pid: u16::from_str_radix(pid, 16).map_err(|_| err())?,
        })
    }
}

/// A known device family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceType {
    pub name: &'static str,
    pub id: UsbId,
    /// Register that halts the CPU while RAM is being loaded, if the family needs it. Written with
    /// 1 before the first record and 0 after the last one.
    pub halt_register: Option<u16>,
}

/// Find the family of a device based on its USB ID. The first matching entry wins.
pub fn identify_device(table: &[DeviceType], id: UsbId) -> Option<&DeviceType> {
    table.iter().find(|t| t.id == id)
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum LookupError {
    #[error("unknown device type '{0}'")]
    Unknown(String),

    #[error("ambiguous device type '{prefix}': matches both {first} and {second}")]
    Ambiguous {
        prefix: String,
        first: &'static str,
        second: &'static str,
    },
}

/// Look up a device type by a prefix of its name. The prefix must select exactly one entry.
pub fn find_by_prefix<'t>(table: &'t [DeviceType], prefix: &str) -> Result<&'t DeviceType, LookupError> {
    let mut candidates = table.iter().filter(|t| t.name.starts_with(prefix));

    let found = candidates
        .next()
        .ok_or_else(|| LookupError::Unknown(prefix.to_owned()))?;
    match candidates.next() {
        None => Ok(found),
        Some(other) => Err(LookupError::Ambiguous {
            prefix: prefix.to_owned(),
            first: found.name,
            second: other.name,
        }),
    }
}
