use crate::device::Session;
use crate::record::MemoryRecord;
use log::{info, trace, warn};
use rusb::{DeviceHandle, UsbContext};
use std::fmt::Display;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

/// Largest payload sent in one control request.
pub const CHUNK_SIZE: usize = 0x1000;

/// Boot-loader vendor request that reads or writes target RAM. The address goes in wValue (low 16
/// bits) and wIndex (high 16 bits).
pub const REQUEST_FIRMWARE_LOAD: u8 = 0xa0;

/// bmRequestType for a vendor request to the device, host to device.
pub const VENDOR_OUT: u8 = 0x40;
/// bmRequestType for a vendor request to the device, device to host.
pub const VENDOR_IN: u8 = 0xc0;

const ENDPOINT_IN: u8 = 0x80;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// A blocking control transfer. Bit 7 of `request_type` selects the direction: if set, `buf` is
/// filled from the device, otherwise its contents are sent. Returns the number of bytes moved.
pub trait ControlTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

impl<T: UsbContext> ControlTransport for DeviceHandle<T> {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        match Direction::of(request_type) {
            Direction::In => self.read_control(request_type, request, value, index, buf, timeout),
            Direction::Out => self.write_control(request_type, request, value, index, buf, timeout),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl Direction {
    pub fn of(request_type: u8) -> Self {
        if request_type & ENDPOINT_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Direction::Out => write!(f, "write"),
            Direction::In => write!(f, "read"),
        }
    }
}

/// Failure while moving one record. Both variants report how many bytes of the record were moved
/// before the failure.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum TransferError {
    #[error("USB error during {direction} of {len} bytes at {address:#010x}")]
    Transport {
        direction: Direction,
        address: u32,
        len: usize,
        transferred: u32,
        source: rusb::Error,
    },

    #[error("short {direction} at {address:#010x}: {actual} of {requested} bytes")]
    Short {
        direction: Direction,
        address: u32,
        requested: usize,
        actual: usize,
        transferred: u32,
    },
}

impl TransferError {
    pub fn transferred(&self) -> u32 {
        match self {
            TransferError::Transport { transferred, .. } => *transferred,
            TransferError::Short { transferred, .. } => *transferred,
        }
    }
}

/// Move `record`'s data to or from the device, [CHUNK_SIZE] bytes per request, starting at its
/// address. On success, returns the record's size.
pub fn transfer_record(
    device: &impl ControlTransport,
    request_type: u8,
    record: &mut MemoryRecord,
    timeout: Duration,
) -> Result<u32, TransferError> {
    let direction = Direction::of(request_type);
    let mut address = record.address;
    let mut transferred = 0u32;

    for chunk in record.data.chunks_mut(CHUNK_SIZE) {
        let len = chunk.len();
        let (value, index) = (address as u16, (address >> 16) as u16);
        trace!(
            "Submitting {request_type:#04x} {REQUEST_FIRMWARE_LOAD:#04x} \
             value {value:#06x} index {index:#06x} length {len:#06x}"
        );

        match device.control_transfer(
            request_type,
            REQUEST_FIRMWARE_LOAD,
            value,
            index,
            chunk,
            timeout,
        ) {
            Err(source) => {
                return Err(TransferError::Transport {
                    direction,
                    address,
                    len,
                    transferred,
                    source,
                });
            }
            Ok(actual) if actual < len => {
                return Err(TransferError::Short {
                    direction,
                    address,
                    requested: len,
                    actual,
                    transferred: transferred + actual as u32,
                });
            }
            Ok(_) => {}
        }

        address = address.wrapping_add(len as u32);
        transferred += len as u32;
    }

    Ok(transferred)
}

/// How [upload] should treat the device.
#[derive(Copy, Clone, Debug)]
pub struct UploadOptions {
    pub timeout: Duration,
    /// Hold the CPU in reset while loading, on families that support it.
    pub halt_cpu: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            timeout: DEFAULT_TIMEOUT,
            halt_cpu: true,
        }
    }
}

/// Result of a completed upload. Halt and resume are best effort, so their outcome is reported
/// here rather than failing the upload. They are [None] when not attempted.
#[derive(Debug, PartialEq)]
pub struct UploadSummary {
    pub records: usize,
    pub bytes: u64,
    pub halt: Option<Result<(), TransferError>>,
    pub resume: Option<Result<(), TransferError>>,
}

/// All errors that can happen during a loader operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("error uploading firmware record {index} ({address:#010x})")]
    Record {
        index: usize,
        address: u32,
        source: TransferError,
    },

    #[error("error checking device boot-loader type")]
    Query(#[source] TransferError),

    #[error("error reading device memory")]
    ReadBack(#[source] TransferError),

    #[error("file I/O error")]
    FileIoError(#[from] std::io::Error),
}

fn write_register(
    device: &impl ControlTransport,
    register: u16,
    value: u8,
    timeout: Duration,
) -> Result<(), TransferError> {
    let mut record = MemoryRecord::new(register as u32, vec![value]);
    transfer_record(device, VENDOR_OUT, &mut record, timeout)
        .map(drop)
        .inspect_err(|e| warn!("Failed to write {value:#04x} to register {register:#06x}: {e}"))
}

/// Write `records` to device RAM in order, stopping at the first failure. If the device's family
/// has a halt register (and `options` allow it), the CPU is halted before the first record and
/// resumed after the last.
pub fn upload<H: ControlTransport>(
    session: &Session<'_, H>,
    records: Vec<MemoryRecord>,
    options: &UploadOptions,
) -> Result<UploadSummary, Error> {
    let device = &session.handle;
    let halt_register = session
        .device_type()
        .and_then(|t| t.halt_register)
        .filter(|_| options.halt_cpu);

    let mut summary = UploadSummary {
        records: 0,
        bytes: 0,
        halt: None,
        resume: None,
    };

    if let Some(register) = halt_register {
        info!("Halting CPU...");
        summary.halt = Some(write_register(device, register, 1, options.timeout));
    }

    for (index, mut record) in records.into_iter().enumerate() {
        let address = record.address;
        trace!("Uploading record {index}: {record}");
        let n = transfer_record(device, VENDOR_OUT, &mut record, options.timeout).map_err(
            |source| Error::Record {
                index,
                address,
                source,
            },
        )?;

        summary.records += 1;
        summary.bytes += n as u64;
    }

    if let Some(register) = halt_register {
        info!("Resuming CPU...");
        summary.resume = Some(write_register(device, register, 0, options.timeout));
    }

    Ok(summary)
}

/// Ask the boot loader which firmware it is running. FX2 reports 0x00; FX3 reports 0x1b after a
/// power-on reset and 0x28 after a soft reset.
pub fn query_loader(device: &impl ControlTransport, timeout: Duration) -> Result<u8, Error> {
    let mut record = MemoryRecord::zeroed(0, 1);
    transfer_record(device, VENDOR_IN, &mut record, timeout).map_err(Error::Query)?;
    Ok(record.data[0])
}

/// Read `size` bytes of device memory at `address` into `file`. Whatever was received before a
/// failure is still written out.
pub fn read_memory(
    device: &impl ControlTransport,
    address: u32,
    size: u32,
    file: &mut impl Write,
    timeout: Duration,
) -> Result<u32, Error> {
    let mut record = MemoryRecord::zeroed(address, size);
    let result = transfer_record(device, VENDOR_IN, &mut record, timeout);

    let received = match &result {
        Ok(n) => *n,
        Err(e) => e.transferred(),
    };
    file.write_all(&record.data[..received as usize])?;

    result.map_err(Error::ReadBack)
}
