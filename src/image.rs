use crate::record::MemoryRecord;
use crate::{cyfw, ihex};
use log::{debug, info};
use std::fmt::Display;
use std::io::{BufRead, Read};
use std::str::FromStr;
use thiserror::Error;

/// Encodings a firmware image can be read from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Intel HEX, data and end-of-file records only.
    #[default]
    Ihex,
    /// Cypress FX3 boot image.
    Cyfw,
    /// Raw memory contents.
    Bin,
}

impl Format {
    pub const ALL: &'static [Format] = &[Format::Ihex, Format::Cyfw, Format::Bin];

    fn name(self) -> &'static str {
        match self {
            Format::Ihex => "ihex",
            Format::Cyfw => "cyfw",
            Format::Bin => "bin",
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
#[error("unknown input format '{0}'; supported: ihex, cyfw, bin")]
pub struct UnknownFormat(String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| UnknownFormat(s.to_owned()))
    }
}

/// Malformed or inconsistent image contents.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("invalid hex digit on line {line}: {found:?}")]
    InvalidHexDigit { line: usize, found: char },

    #[error("record on line {line} claims {size} data bytes, but the line only holds {available}")]
    SizeExceedsLine {
        line: usize,
        size: u8,
        available: usize,
    },

    #[error("unsupported record type {kind:#04x} on line {line}")]
    UnsupportedRecordType { line: usize, kind: u8 },

    #[error("checksum failure on line {line}: expected {expected:#04x}, computed {actual:#04x}")]
    LineChecksum { line: usize, expected: u8, actual: u8 },

    #[error("input ended without an end-of-file record")]
    MissingEndOfFile,

    #[error("input does not begin with magic 'CY'")]
    BadMagic,

    #[error("premature end of input while reading {field}")]
    PrematureEnd { field: &'static str },

    #[error("checksum failure: expected {expected:#010x}, computed {actual:#010x}")]
    ImageChecksum { expected: u32, actual: u32 },

    #[error("image of {len} bytes does not fit a 32-bit address space")]
    TooLarge { len: u64 },
}

impl FormatError {
    /// Whether the input was well-formed but failed its integrity check.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            FormatError::LineChecksum { .. } | FormatError::ImageChecksum { .. }
        )
    }
}

/// All errors (format and I/O) that can happen while reading an image.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid firmware image")]
    FormatError(#[from] FormatError),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// The format problem behind this error, if it wasn't an I/O failure.
    pub fn format_error(&self) -> Option<&FormatError> {
        match self {
            Error::FormatError(e) => Some(e),
            Error::IoError(_) => None,
        }
    }
}

/// Check that `len` bytes placed at `base` fit both the 32-bit record size and the address space.
fn check_raw_extent(base: u32, len: u64) -> Result<u32, FormatError> {
    let size = u32::try_from(len).map_err(|_| FormatError::TooLarge { len })?;
    if base as u64 + size as u64 > u32::MAX as u64 + 1 {
        return Err(FormatError::TooLarge { len });
    }
    Ok(size)
}

/// Read all of `reader` as a single record at `base`.
pub fn parse_raw(reader: &mut impl Read, base: u32) -> Result<Vec<MemoryRecord>, Error> {
    let mut data = vec![];
    reader.read_to_end(&mut data)?;

    let len = check_raw_extent(base, data.len() as u64)?;
    debug!("Read {len} bytes of raw data for address {base:#010x}");
    Ok(vec![MemoryRecord::new(base, data)])
}

/// Decode an image in the given format. `base` is only used by [Format::Bin], which has no
/// addressing of its own.
pub fn parse(
    format: Format,
    reader: &mut impl BufRead,
    base: u32,
) -> Result<Vec<MemoryRecord>, Error> {
    match format {
        Format::Ihex => ihex::parse(reader),
        Format::Cyfw => {
            let image = cyfw::parse(reader)?;
            info!("{}", image.config);
            info!("Image entry point: {:#010x}", image.entry_point);
            Ok(image.records)
        }
        Format::Bin => parse_raw(reader, base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn format_names() {
        for &format in Format::ALL {
            assert_eq!(format.to_string().parse::<Format>().unwrap(), format);
        }
        assert!("srec".parse::<Format>().is_err());
        assert_eq!(Format::default(), Format::Ihex);
    }

    #[test]
    fn raw_image_is_one_record() {
        let records = parse_raw(&mut Cursor::new(b"\x01\x02\x03"), 0).unwrap();
        assert_eq!(records, [MemoryRecord::new(0, vec![1, 2, 3])]);
    }

    #[test]
    fn raw_image_at_base_address() {
        let records = parse(Format::Bin, &mut Cursor::new(b"\xaa"), 0x4000).unwrap();
        assert_eq!(records, [MemoryRecord::new(0x4000, vec![0xaa])]);
    }

    #[test]
    fn empty_raw_image() {
        let records = parse_raw(&mut Cursor::new(b""), 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size(), 0);
    }

    #[test]
    fn raw_image_past_end_of_address_space() {
        let err = parse_raw(&mut Cursor::new(b"\x01\x02"), u32::MAX).unwrap_err();
        assert_eq!(err.format_error(), Some(&FormatError::TooLarge { len: 2 }));
    }

    #[test]
    fn raw_size_must_fit_32_bits() {
        const FULL: u64 = u32::MAX as u64 + 1;
        assert_eq!(check_raw_extent(0, FULL), Err(FormatError::TooLarge { len: FULL }));
        assert_eq!(check_raw_extent(0, FULL - 1), Ok(u32::MAX));
        assert_eq!(check_raw_extent(0x100, FULL - 0x100), Ok(u32::MAX - 0xff));
        assert_eq!(
            check_raw_extent(0x100, FULL - 0xff),
            Err(FormatError::TooLarge { len: FULL - 0xff })
        );
    }

    /// Hands out `good` bytes, then fails.
    struct FailingReader {
        good: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.good == 0 {
                return Err(std::io::Error::other("cable pulled"));
            }
            let n = buf.len().min(self.good);
            buf[..n].fill(0x5a);
            self.good -= n;
            Ok(n)
        }
    }

    #[test]
    fn raw_read_failure_is_fatal() {
        let err = parse_raw(&mut FailingReader { good: 10 }, 0).unwrap_err();
        assert!(matches!(err, Error::IoError(ref e) if e.kind() == std::io::ErrorKind::Other));
        assert_eq!(err.format_error(), None);
    }

    #[test]
    fn classifies_checksum_errors() {
        assert!(FormatError::ImageChecksum { expected: 5, actual: 6 }.is_checksum_mismatch());
        assert!(!FormatError::BadMagic.is_checksum_mismatch());
    }
}
