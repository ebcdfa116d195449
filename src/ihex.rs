use crate::image::{Error, FormatError};
use crate::record::MemoryRecord;
use byteorder::{BE, ByteOrder};
use log::{trace, warn};
use num_enum::TryFromPrimitive;
use std::io::BufRead;

const START_CODE: u8 = b':';
// Start code plus hex pairs for size, address, type and checksum.
const MIN_LINE_LEN: usize = 11;

/// Record types we know how to load. Extended segment/linear address records are not supported,
/// so images are limited to the first 64 KiB.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
}

/// Decodes hex pairs from one line, keeping the running checksum.
struct LineDecoder<'a> {
    line: &'a [u8],
    line_num: usize,
    pos: usize,
    sum: u8,
}

impl LineDecoder<'_> {
    fn nibble(&self, c: u8) -> Result<u8, FormatError> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(FormatError::InvalidHexDigit {
                line: self.line_num,
                found: c as char,
            }),
        }
    }

    fn byte(&mut self) -> Result<u8, FormatError> {
        let hi = self.nibble(self.line[self.pos])?;
        let lo = self.nibble(self.line[self.pos + 1])?;
        self.pos += 2;

        let val = hi << 4 | lo;
        self.sum = self.sum.wrapping_add(val);
        Ok(val)
    }
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Parse Intel HEX from `reader` up to its end-of-file record. Malformed lines that don't look
/// like records at all are skipped with a warning; anything wrong inside a record aborts the
/// parse.
pub fn parse(reader: &mut impl BufRead) -> Result<Vec<MemoryRecord>, Error> {
    let mut records = vec![];
    let mut buf = vec![];
    let mut line_num = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Err(FormatError::MissingEndOfFile.into());
        }
        line_num += 1;

        let line = trim_line_ending(&buf);
        if line.len() < MIN_LINE_LEN {
            warn!("Skipping invalid line {line_num}: too short");
            continue;
        }
        if line[0] != START_CODE {
            warn!("Skipping invalid line {line_num}: no start code");
            continue;
        }
        if let Some(&c) = line[1..9].iter().find(|c| !c.is_ascii_hexdigit()) {
            return Err(FormatError::InvalidHexDigit {
                line: line_num,
                found: c as char,
            }
            .into());
        }

        let mut decoder = LineDecoder {
            line,
            line_num,
            pos: 1,
            sum: 0,
        };

        let size = decoder.byte()?;
        let available = (line.len() - MIN_LINE_LEN) / 2;
        if size as usize > available {
            return Err(FormatError::SizeExceedsLine {
                line: line_num,
                size,
                available,
            }
            .into());
        }

        let address = BE::read_u16(&[decoder.byte()?, decoder.byte()?]);
        let kind = decoder.byte()?;
        let data = (0..size)
            .map(|_| decoder.byte())
            .collect::<Result<Vec<_>, _>>()?;

        let expected = decoder.byte()?;
        if decoder.sum != 0 {
            return Err(FormatError::LineChecksum {
                line: line_num,
                expected,
                actual: expected.wrapping_sub(decoder.sum),
            }
            .into());
        }

        match RecordType::try_from(kind) {
            Ok(RecordType::Data) => {
                trace!("Line {line_num}: {size} bytes at {address:#06x}");
                records.push(MemoryRecord::new(address as u32, data));
            }
            Ok(RecordType::EndOfFile) => return Ok(records),
            Err(e) => {
                return Err(FormatError::UnsupportedRecordType {
                    line: line_num,
                    kind: e.number,
                }
                .into());
            }
        }
    }
}
