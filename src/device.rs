use crate::device_ids::{DeviceType, ParseUsbIdError, UsbId, identify_device};
use log::{info, warn};
use rusb::{DeviceHandle, UsbContext};
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// Position of a device on the host: bus number and device address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

impl Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.bus, self.address)
    }
}

/// A device location as given by the user: either `<bus>.<addr>` or `<vid>:<pid>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceLocation {
    BusAddress(BusAddress),
    Id(UsbId),
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum ParseLocationError {
    #[error("invalid device address '{0}': expected <bus>.<addr> or <vid>:<pid>")]
    Invalid(String),

    #[error(transparent)]
    UsbId(#[from] ParseUsbIdError),
}

impl FromStr for DeviceLocation {
    type Err = ParseLocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            return Ok(DeviceLocation::Id(s.parse()?));
        }

        let invalid = || ParseLocationError::Invalid(s.to_owned());
        let (bus, address) = s.split_once('.').ok_or_else(invalid)?;
        Ok(DeviceLocation::BusAddress(BusAddress {
            bus: bus.parse().map_err(|_| invalid())?,
            address: address.parse().map_err(|_| invalid())?,
        }))
    }
}

/// Which device(s) a resolution is allowed to pick.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DeviceSelector<'t> {
    /// Any device whose ID appears in the device type table.
    Any,
    BusAddress(BusAddress),
    Id(UsbId),
    Type(&'t DeviceType),
}

impl<'t> DeviceSelector<'t> {
    /// Combine the user's choices. An explicit location wins over a device type.
    pub fn new(location: Option<DeviceLocation>, device_type: Option<&'t DeviceType>) -> Self {
        match (location, device_type) {
            (Some(DeviceLocation::BusAddress(b)), _) => DeviceSelector::BusAddress(b),
            (Some(DeviceLocation::Id(id)), _) => DeviceSelector::Id(id),
            (None, Some(t)) => DeviceSelector::Type(t),
            (None, None) => DeviceSelector::Any,
        }
    }

    /// Whether `dev` is selected. Only bus/address selection works without reading the device
    /// descriptor; devices whose descriptor can't be read are skipped with a warning.
    pub fn matches(&self, dev: &impl UsbDevice, table: &[DeviceType]) -> bool {
        let location = dev.bus_address();
        if let DeviceSelector::BusAddress(wanted) = self {
            return location == *wanted;
        }

        let id = match dev.usb_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("Unable to access descriptor of device on {location}: {e}");
                return false;
            }
        };

        match self {
            DeviceSelector::Id(wanted) => id == *wanted,
            DeviceSelector::Type(t) => id == t.id,
            _ => identify_device(table, id).is_some(),
        }
    }
}

/// An enumerated but not yet opened device.
pub trait UsbDevice {
    type Handle;

    fn bus_address(&self) -> BusAddress;
    fn usb_id(&self) -> rusb::Result<UsbId>;
    fn open(&self) -> rusb::Result<Self::Handle>;
}

impl<T: UsbContext> UsbDevice for rusb::Device<T> {
    type Handle = DeviceHandle<T>;

    fn bus_address(&self) -> BusAddress {
        BusAddress {
            bus: self.bus_number(),
            address: self.address(),
        }
    }

    fn usb_id(&self) -> rusb::Result<UsbId> {
        let desc = self.device_descriptor()?;
        Ok(UsbId {
            vid: desc.vendor_id(),
            pid: desc.product_id(),
        })
    }

    fn open(&self) -> rusb::Result<Self::Handle> {
        rusb::Device::open(self)
    }
}

/// What we know about a device without opening it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeviceInfo<'t> {
    pub location: BusAddress,
    pub id: Option<UsbId>,
    pub device_type: Option<&'t DeviceType>,
}

impl<'t> DeviceInfo<'t> {
    /// Read `dev`'s ID and look up its family. A failed descriptor read leaves both unset.
    pub fn of(dev: &impl UsbDevice, table: &'t [DeviceType]) -> Self {
        let location = dev.bus_address();
        let id = dev
            .usb_id()
            .map_err(|e| warn!("Unable to access descriptor of device on {location}: {e}"))
            .ok();

        DeviceInfo {
            location,
            id,
            device_type: id.and_then(|id| identify_device(table, id)),
        }
    }
}

impl Display for DeviceInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = self.device_type.map_or("unknown", |t| t.name);
        match self.id {
            Some(id) => write!(f, "{} device {} on bus.addr {}", name, id, self.location),
            None => write!(f, "{} device ????:???? on bus.addr {}", name, self.location),
        }
    }
}

/// An opened device, ready for transfers.
pub struct Session<'t, H> {
    pub handle: H,
    pub info: DeviceInfo<'t>,
}

impl<'t, H> Session<'t, H> {
    pub fn device_type(&self) -> Option<&'t DeviceType> {
        self.info.device_type
    }
}

/// All errors that can happen while finding and opening a device.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("no matching USB device found")]
    NotFound,

    #[error("ambiguous device specifier: both {first} and {second} match")]
    Ambiguous {
        first: BusAddress,
        second: BusAddress,
    },

    #[error("error enumerating USB devices")]
    Enumerate(#[source] rusb::Error),

    #[error("error opening device on bus.addr {location}")]
    Open {
        location: BusAddress,
        source: rusb::Error,
    },

    #[error("error claiming interface {interface}")]
    Claim { interface: u8, source: rusb::Error },

    #[error("error setting alt-setting {alt_setting} on interface {interface}")]
    AltSetting {
        interface: u8,
        alt_setting: u8,
        source: rusb::Error,
    },
}

/// All devices in `devices` that `selector` picks.
pub fn list<'t, D: UsbDevice>(
    devices: impl IntoIterator<Item = D>,
    selector: &DeviceSelector<'t>,
    table: &'t [DeviceType],
) -> Vec<DeviceInfo<'t>> {
    devices
        .into_iter()
        .filter(|d| selector.matches(d, table))
        .map(|d| DeviceInfo::of(&d, table))
        .collect()
}

/// Pick exactly one device from `devices` and open it. More than one match is an error rather
/// than a guess. The chosen device's family is looked up in `table` regardless of how it was
/// selected.
pub fn resolve<'t, D: UsbDevice>(
    devices: impl IntoIterator<Item = D>,
    selector: &DeviceSelector<'t>,
    table: &'t [DeviceType],
) -> Result<Session<'t, D::Handle>, Error> {
    let mut candidates = devices.into_iter().filter(|d| selector.matches(d, table));

    let dev = candidates.next().ok_or(Error::NotFound)?;
    if let Some(other) = candidates.next() {
        return Err(Error::Ambiguous {
            first: dev.bus_address(),
            second: other.bus_address(),
        });
    }

    let info = DeviceInfo::of(&dev, table);
    info!("Using {info}");

    let handle = dev.open().map_err(|source| Error::Open {
        location: info.location,
        source,
    })?;
    Ok(Session { handle, info })
}

/// Enumerate the devices attached to `context` and [resolve] one of them. The device list is
/// released before returning.
pub fn open_device<'t, T: UsbContext>(
    context: &T,
    selector: &DeviceSelector<'t>,
    table: &'t [DeviceType],
) -> Result<Session<'t, DeviceHandle<T>>, Error> {
    let devices = context.devices().map_err(Error::Enumerate)?;
    resolve(devices.iter(), selector, table)
}

/// Interface management on an open device.
pub trait InterfaceHandle {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()>;
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> InterfaceHandle for DeviceHandle<T> {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()> {
        DeviceHandle::set_alternate_setting(self, interface, alt_setting)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }
}

/// A session with one of its interfaces claimed. The interface is released on drop.
pub struct ClaimedInterface<'s, 't, H: InterfaceHandle> {
    session: &'s mut Session<'t, H>,
    interface: u8,
}

impl<'s, 't, H: InterfaceHandle> ClaimedInterface<'s, 't, H> {
    pub fn claim(
        session: &'s mut Session<'t, H>,
        interface: u8,
        alt_setting: Option<u8>,
    ) -> Result<Self, Error> {
        session
            .handle
            .claim_interface(interface)
            .map_err(|source| Error::Claim { interface, source })?;
        let mut claimed = ClaimedInterface { session, interface };

        if let Some(alt_setting) = alt_setting {
            claimed
                .session
                .handle
                .set_alternate_setting(interface, alt_setting)
                .map_err(|source| Error::AltSetting {
                    interface,
                    alt_setting,
                    source,
                })?;
        }

        Ok(claimed)
    }
}

impl<'t, H: InterfaceHandle> Deref for ClaimedInterface<'_, 't, H> {
    type Target = Session<'t, H>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<H: InterfaceHandle> Drop for ClaimedInterface<'_, '_, H> {
    fn drop(&mut self) {
        if let Err(e) = self.session.handle.release_interface(self.interface) {
            warn!("Error releasing interface {}: {e}", self.interface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ids::DEVICE_TYPES;
    use std::cell::Cell;

    const FX2: UsbId = UsbId {
        vid: 0x04b4,
        pid: 0x8613,
    };
    const FX3: UsbId = UsbId {
        vid: 0x04b4,
        pid: 0x00f3,
    };
    const OTHER: UsbId = UsbId {
        vid: 0x1d6b,
        pid: 0x0002,
    };

    struct FakeDevice {
        bus: u8,
        address: u8,
        id: Option<UsbId>,
        descriptor_reads: Cell<usize>,
    }

    fn dev(bus: u8, address: u8, id: UsbId) -> FakeDevice {
        FakeDevice {
            bus,
            address,
            id: Some(id),
            descriptor_reads: Cell::new(0),
        }
    }

    impl UsbDevice for &FakeDevice {
        type Handle = BusAddress;

        fn bus_address(&self) -> BusAddress {
            BusAddress {
                bus: self.bus,
                address: self.address,
            }
        }

        fn usb_id(&self) -> rusb::Result<UsbId> {
            self.descriptor_reads.set(self.descriptor_reads.get() + 1);
            self.id.ok_or(rusb::Error::Access)
        }

        fn open(&self) -> rusb::Result<BusAddress> {
            match self.id {
                Some(id) if id == OTHER => Err(rusb::Error::Access),
                _ => Ok(self.bus_address()),
            }
        }
    }

    fn at(bus: u8, address: u8) -> BusAddress {
        BusAddress { bus, address }
    }

    #[test]
    fn parses_locations() {
        assert_eq!(
            "3.17".parse::<DeviceLocation>().unwrap(),
            DeviceLocation::BusAddress(at(3, 17))
        );
        assert_eq!(
            "04b4:8613".parse::<DeviceLocation>().unwrap(),
            DeviceLocation::Id(FX2)
        );
        assert!("3-17".parse::<DeviceLocation>().is_err());
        assert!("3.300".parse::<DeviceLocation>().is_err());
        assert!("04b4:".parse::<DeviceLocation>().is_err());
    }

    #[test]
    fn selector_precedence() {
        let fx3 = &DEVICE_TYPES[1];
        assert_eq!(
            DeviceSelector::new(Some(DeviceLocation::BusAddress(at(1, 2))), Some(fx3)),
            DeviceSelector::BusAddress(at(1, 2))
        );
        assert_eq!(
            DeviceSelector::new(Some(DeviceLocation::Id(OTHER)), Some(fx3)),
            DeviceSelector::Id(OTHER)
        );
        assert_eq!(DeviceSelector::new(None, Some(fx3)), DeviceSelector::Type(fx3));
        assert_eq!(DeviceSelector::new(None, None), DeviceSelector::Any);
    }

    #[test]
    fn bus_address_selection_still_identifies_family() {
        let devices = [dev(1, 4, OTHER), dev(1, 5, FX2)];
        let session = resolve(
            &devices,
            &DeviceSelector::BusAddress(at(1, 5)),
            DEVICE_TYPES,
        )
        .unwrap();
        assert_eq!(session.handle, at(1, 5));
        assert_eq!(session.device_type().unwrap().name, "fx2");
        // Matching by location doesn't need the descriptor.
        assert_eq!(devices[0].descriptor_reads.get(), 0);
    }

    #[test]
    fn any_selector_uses_whole_table() {
        let devices = [dev(1, 1, OTHER), dev(2, 7, FX3)];
        let session = resolve(&devices, &DeviceSelector::Any, DEVICE_TYPES).unwrap();
        assert_eq!(session.info.location, at(2, 7));
        assert_eq!(session.device_type().unwrap().name, "fx3");
    }

    #[test]
    fn unknown_family_is_not_an_error() {
        let devices = [dev(1, 1, OTHER), dev(1, 2, UsbId { vid: 0xdead, pid: 0xbeef })];
        let session = resolve(
            &devices,
            &DeviceSelector::Id(UsbId { vid: 0xdead, pid: 0xbeef }),
            DEVICE_TYPES,
        )
        .unwrap();
        assert!(session.device_type().is_none());
    }

    #[test]
    fn two_matches_are_ambiguous() {
        let devices = [dev(1, 3, FX2), dev(1, 9, OTHER), dev(2, 3, FX2)];
        match resolve(&devices, &DeviceSelector::Id(FX2), DEVICE_TYPES) {
            Err(Error::Ambiguous { first, second }) => {
                assert_eq!(first, at(1, 3));
                assert_eq!(second, at(2, 3));
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|s| s.info)),
        }
    }

    #[test]
    fn no_match_is_not_found() {
        let devices = [dev(1, 1, OTHER)];
        assert!(matches!(
            resolve(&devices, &DeviceSelector::Type(&DEVICE_TYPES[0]), DEVICE_TYPES),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            resolve(&[] as &[FakeDevice], &DeviceSelector::Any, DEVICE_TYPES),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn unreadable_descriptor_skips_device() {
        let broken = FakeDevice {
            bus: 1,
            address: 1,
            id: None,
            descriptor_reads: Cell::new(0),
        };
        let devices = [broken, dev(1, 2, FX2)];
        let session = resolve(&devices, &DeviceSelector::Any, DEVICE_TYPES).unwrap();
        assert_eq!(session.info.location, at(1, 2));
    }

    #[test]
    fn open_failure_is_reported() {
        let devices = [dev(4, 2, OTHER)];
        match resolve(&devices, &DeviceSelector::Id(OTHER), DEVICE_TYPES) {
            Err(Error::Open { location, source }) => {
                assert_eq!(location, at(4, 2));
                assert_eq!(source, rusb::Error::Access);
            }
            other => panic!("expected open error, got {:?}", other.map(|s| s.info)),
        }
    }

    #[test]
    fn lists_selected_devices() {
        let devices = [dev(1, 1, FX2), dev(1, 2, OTHER), dev(1, 3, FX3)];
        let found = list(&devices, &DeviceSelector::Any, DEVICE_TYPES);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].to_string(), "fx3 device 04b4:00f3 on bus.addr 1.3");
    }

    #[derive(Default)]
    struct FakeInterfaces {
        log: Vec<String>,
        fail_claim: bool,
        fail_alt: bool,
    }

    impl InterfaceHandle for FakeInterfaces {
        fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
            self.log.push(format!("claim {interface}"));
            if self.fail_claim {
                Err(rusb::Error::Busy)
            } else {
                Ok(())
            }
        }

        fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()> {
            self.log.push(format!("alt {interface} {alt_setting}"));
            if self.fail_alt {
                Err(rusb::Error::NotSupported)
            } else {
                Ok(())
            }
        }

        fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
            self.log.push(format!("release {interface}"));
            Ok(())
        }
    }

    fn session(handle: FakeInterfaces) -> Session<'static, FakeInterfaces> {
        Session {
            handle,
            info: DeviceInfo {
                location: at(1, 1),
                id: Some(FX2),
                device_type: None,
            },
        }
    }

    #[test]
    fn interface_released_on_drop() {
        let mut s = session(FakeInterfaces::default());
        {
            let claimed = ClaimedInterface::claim(&mut s, 0, Some(1)).unwrap();
            assert_eq!(claimed.info.location, at(1, 1));
        }
        assert_eq!(s.handle.log, ["claim 0", "alt 0 1", "release 0"]);
    }

    #[test]
    fn interface_released_when_alt_setting_fails() {
        let mut s = session(FakeInterfaces {
            fail_alt: true,
            ..Default::default()
        });
        assert!(matches!(
            ClaimedInterface::claim(&mut s, 2, Some(3)),
            Err(Error::AltSetting {
                interface: 2,
                alt_setting: 3,
                ..
            })
        ));
        assert_eq!(s.handle.log, ["claim 2", "alt 2 3", "release 2"]);
    }

    #[test]
    fn failed_claim_is_not_released() {
        let mut s = session(FakeInterfaces {
            fail_claim: true,
            ..Default::default()
        });
        match ClaimedInterface::claim(&mut s, 1, Some(0)) {
            Err(Error::Claim { interface, source }) => {
                assert_eq!(interface, 1);
                assert_eq!(source, rusb::Error::Busy);
            }
            Err(e) => panic!("expected claim error, got {e}"),
            Ok(_) => panic!("claim unexpectedly succeeded"),
        }
        assert_eq!(s.handle.log, ["claim 1"]);
    }
}
