use crate::image::{Error, FormatError};
use crate::record::MemoryRecord;
use byteorder::{ByteOrder, LE, ReadBytesExt};
use log::{debug, warn};
use std::fmt::Display;
use std::io::{ErrorKind, Read};

const MAGIC: &[u8; 2] = b"CY";

/// The two configuration bytes following the magic. The boot ROM interprets them; we only report
/// them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CyfwConfig {
    pub i2c_config: u8,
    pub image_type: u8,
}

impl CyfwConfig {
    pub fn is_data_file(&self) -> bool {
        self.i2c_config & 0x01 != 0
    }

    /// EEPROM size in KiB encoded in bits 3:1, if the value is defined.
    pub fn eeprom_kib(&self) -> Option<u32> {
        match (self.i2c_config >> 1) & 0x07 {
            n @ 2..=7 => Some(1 << n),
            _ => None,
        }
    }

    /// Boot interface clock as (I2C, SPI), from bits 5:4.
    pub fn boot_speed(&self) -> (&'static str, &'static str) {
        match (self.i2c_config >> 4) & 0x03 {
            0 => ("100 kHz", "10 MHz"),
            1 => ("400 kHz", "20 MHz"),
            2 => ("1 MHz", "30 MHz"),
            _ => ("3.4 MHz", "40 MHz"),
        }
    }

    pub fn image_type_str(&self) -> &'static str {
        match self.image_type {
            0xb0 => "normal firmware image with checksum",
            0xb1 => "secure image",
            0xb2 => "boot with new VID and PID",
            _ => "unknown image type",
        }
    }
}

impl Display for CyfwConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let (i2c, spi) = self.boot_speed();
        write!(
            f,
            "I2C config {:#04x} ({} file, ",
            self.i2c_config,
            if self.is_data_file() { "data" } else { "executable" },
        )?;
        match self.eeprom_kib() {
            Some(kib) => write!(f, "{kib} KiB EEPROM, ")?,
            None => write!(f, "unknown EEPROM size, ")?,
        }
        write!(
            f,
            "{i2c} I2C / {spi} SPI), image type {:#04x} ({})",
            self.image_type,
            self.image_type_str()
        )
    }
}

/// A decoded boot image.
#[derive(Debug)]
pub struct CyfwImage {
    pub config: CyfwConfig,
    /// Address carried by the terminating section header. Not itself a record.
    pub entry_point: u32,
    pub records: Vec<MemoryRecord>,
}

fn premature(field: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |e| match e.kind() {
        ErrorKind::UnexpectedEof => FormatError::PrematureEnd { field }.into(),
        _ => e.into(),
    }
}

/// Parse a boot image: magic, two config bytes, then `(word count, address)` sections terminated
/// by a zero word count, then a 32-bit sum over every data word.
pub fn parse(reader: &mut impl Read) -> Result<CyfwImage, Error> {
    let mut magic = [0u8; 2];
    match reader.read_exact(&mut magic) {
        Ok(()) if &magic == MAGIC => {}
        Err(e) if e.kind() != ErrorKind::UnexpectedEof => return Err(e.into()),
        _ => return Err(FormatError::BadMagic.into()),
    }

    let config = CyfwConfig {
        i2c_config: reader.read_u8().map_err(premature("I2C config byte"))?,
        image_type: reader.read_u8().map_err(premature("image type byte"))?,
    };

    let mut records = vec![];
    let mut checksum = 0u32;
    let mut offset = 4u64;

    let entry_point = loop {
        let words = reader.read_u32::<LE>().map_err(premature("section length"))?;
        let address = reader.read_u32::<LE>().map_err(premature("section address"))?;
        offset += 8;
        if words == 0 {
            break address;
        }

        if address & 0x03 != 0 {
            warn!("Section address {address:#010x} is not 32-bit aligned");
        }

        let len = match words.checked_mul(4) {
            Some(len) => len,
            None => {
                return Err(FormatError::TooLarge {
                    len: words as u64 * 4,
                }
                .into());
            }
        };

        // Read through take() so a bogus length can't make us allocate before hitting EOF.
        let mut data = vec![];
        reader.take(len as u64).read_to_end(&mut data)?;
        if data.len() < len as usize {
            return Err(FormatError::PrematureEnd {
                field: "section data",
            }
            .into());
        }
        offset += len as u64;

        checksum = data
            .chunks_exact(4)
            .fold(checksum, |sum, word| sum.wrapping_add(LE::read_u32(word)));

        debug!("Section of {len} bytes at {address:#010x}");
        records.push(MemoryRecord::new(address, data));
    };

    let expected = reader.read_u32::<LE>().map_err(premature("checksum"))?;
    offset += 4;
    if expected != checksum {
        return Err(FormatError::ImageChecksum {
            expected,
            actual: checksum,
        }
        .into());
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        warn!("Ignoring trailing data after checksum at input offset {offset}");
    }

    Ok(CyfwImage {
        config,
        entry_point,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Builder(Vec<u8>);

    impl Builder {
        fn new() -> Self {
            Builder(vec![b'C', b'Y', 0x0e, 0xb0])
        }

        fn word(mut self, w: u32) -> Self {
            self.0.extend_from_slice(&w.to_le_bytes());
            self
        }

        fn bytes(mut self, b: &[u8]) -> Self {
            self.0.extend_from_slice(b);
            self
        }

        fn parse(self) -> Result<CyfwImage, Error> {
            parse(&mut Cursor::new(self.0))
        }
    }

    fn format_err(r: Result<CyfwImage, Error>) -> FormatError {
        match r {
            Err(Error::FormatError(e)) => e,
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn single_section() {
        let image = Builder::new()
            .word(1)
            .word(0)
            .word(5)
            .word(0)
            .word(0x40000000)
            .word(5)
            .parse()
            .unwrap();
        assert_eq!(image.records, [MemoryRecord::new(0, 5u32.to_le_bytes().to_vec())]);
        assert_eq!(image.entry_point, 0x40000000);
        assert_eq!(
            image.config,
            CyfwConfig {
                i2c_config: 0x0e,
                image_type: 0xb0,
            }
        );
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let err = format_err(
            Builder::new()
                .word(1)
                .word(0)
                .word(5)
                .word(0)
                .word(0)
                .word(6)
                .parse(),
        );
        assert_eq!(err, FormatError::ImageChecksum { expected: 6, actual: 5 });
        assert!(err.is_checksum_mismatch());
    }

    #[test]
    fn checksum_spans_sections_and_wraps() {
        let image = Builder::new()
            .word(2)
            .word(0x100)
            .word(0xffff_fff0)
            .word(0x10)
            .word(1)
            .word(0x200)
            .word(7)
            .word(0)
            .word(0)
            .word(7)
            .parse()
            .unwrap();
        assert_eq!(image.records.len(), 2);
        assert_eq!(image.records[0].address, 0x100);
        assert_eq!(image.records[0].size(), 8);
        assert_eq!(image.records[1].address, 0x200);
    }

    #[test]
    fn bad_magic() {
        assert_eq!(format_err(parse(&mut Cursor::new(b"CZ\x0e\xb0"))), FormatError::BadMagic);
        assert_eq!(format_err(parse(&mut Cursor::new(b"C"))), FormatError::BadMagic);
    }

    #[test]
    fn truncated_inputs() {
        assert_eq!(
            format_err(parse(&mut Cursor::new(b"CY\x0e"))),
            FormatError::PrematureEnd {
                field: "image type byte",
            }
        );
        assert_eq!(
            format_err(Builder::new().word(1).bytes(&[0, 0]).parse()),
            FormatError::PrematureEnd {
                field: "section address",
            }
        );
        assert_eq!(
            format_err(Builder::new().word(2).word(0).word(1).parse()),
            FormatError::PrematureEnd {
                field: "section data",
            }
        );
        assert_eq!(
            format_err(Builder::new().word(0).word(0).bytes(&[0]).parse()),
            FormatError::PrematureEnd { field: "checksum" }
        );
    }

    #[test]
    fn unaligned_address_and_trailing_data_are_tolerated() {
        let image = Builder::new()
            .word(1)
            .word(0x1002)
            .word(1)
            .word(0)
            .word(0)
            .word(1)
            .bytes(b"junk")
            .parse()
            .unwrap();
        assert_eq!(image.records[0].address, 0x1002);
    }

    #[test]
    fn empty_image() {
        let image = Builder::new().word(0).word(0).word(0).parse().unwrap();
        assert!(image.records.is_empty());
    }

    #[test]
    fn describes_config_bytes() {
        let config = CyfwConfig {
            i2c_config: 0x1e,
            image_type: 0xb0,
        };
        assert_eq!(
            config.to_string(),
            "I2C config 0x1e (executable file, 128 KiB EEPROM, 400 kHz I2C / 20 MHz SPI), \
             image type 0xb0 (normal firmware image with checksum)"
        );
    }
}
