use anyhow::{Context as _, Result};
use clap::{Args, Parser};
use clap_num::maybe_hex;
use fx_loader::device::{self, ClaimedInterface, DeviceLocation, DeviceSelector, Session};
use fx_loader::device_ids::{DEVICE_TYPES, find_by_prefix};
use fx_loader::image::{self, Format};
use fx_loader::protocol::{self, UploadOptions};
use fx_loader::record::{self, MemoryRecord};
use log::{info, warn};
use rusb::{Context, DeviceHandle, UsbContext};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fx-loader", version, about)]
enum Opt {
    /// List connected devices matching the device specification (by default, all known types)
    List {
        #[command(flatten)]
        filter: DeviceFilter,
    },

    /// Query the device for its boot-loader firmware type
    Query {
        #[command(flatten)]
        spec: DeviceSpec,
    },

    /// Load RAM with firmware or arbitrary data
    Load {
        #[command(flatten)]
        spec: DeviceSpec,

        #[command(flatten)]
        input: InputArgs,

        /// Don't hold the CPU in reset while loading
        #[arg(short = 'r', long)]
        no_reset: bool,
    },

    /// Dump RAM contents as raw binary data
    Dump {
        #[command(flatten)]
        spec: DeviceSpec,

        /// Range to read: <addr>:<to> (exclusive) or <addr>+<size>
        #[arg(value_parser = parse_dump_range)]
        range: DumpRange,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and normalize an image without talking to any device
    Inspect {
        #[command(flatten)]
        input: InputArgs,
    },
}

/// Which devices to consider.
#[derive(Args, Debug)]
struct DeviceFilter {
    /// Device location: <bus>.<addr> (see /sys/bus/usb/devices/N-*/devnum) or <vid>:<pid>
    #[arg(short = 'c', long = "device", env = "USB_DEVICE")]
    location: Option<DeviceLocation>,

    /// Device type, by unique prefix (supported: fx2, fx3)
    #[arg(short = 't', long = "type")]
    device_type: Option<String>,
}

impl DeviceFilter {
    fn selector(&self) -> Result<DeviceSelector<'static>> {
        let device_type = self
            .device_type
            .as_deref()
            .map(|prefix| find_by_prefix(DEVICE_TYPES, prefix))
            .transpose()?;
        Ok(DeviceSelector::new(self.location, device_type))
    }
}

/// A single device to open, and how to talk to it.
#[derive(Args, Debug)]
struct DeviceSpec {
    #[command(flatten)]
    filter: DeviceFilter,

    /// Interface to claim for the duration of the operation
    #[arg(short, long)]
    interface: Option<u8>,

    /// Alternate setting to select on the claimed interface
    #[arg(short, long, requires = "interface")]
    alt_setting: Option<u8>,

    /// Timeout for each USB transfer, in milliseconds
    #[arg(long, default_value_t = protocol::DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout: u64,
}

impl DeviceSpec {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Open the selected device, claiming an interface if requested, and run `f` on it. The
    /// interface and device are released however `f` returns.
    fn with_device<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Session<'static, DeviceHandle<Context>>) -> Result<T>,
    {
        let context = Context::new()?;
        let mut session = device::open_device(&context, &self.filter.selector()?, DEVICE_TYPES)?;

        match self.interface {
            Some(interface) => {
                let claimed = ClaimedInterface::claim(&mut session, interface, self.alt_setting)?;
                f(&claimed)
            }
            None => f(&session),
        }
    }
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Image file to read
    file: PathBuf,

    /// Input format (ihex, cyfw, bin)
    #[arg(short, long, default_value_t = Format::default())]
    format: Format,

    /// Load address for raw binary images
    #[arg(short = 'l', long, value_parser = maybe_hex::<u32>)]
    address: Option<u32>,

    /// Sort records by address before merging
    #[arg(short, long)]
    sort: bool,

    /// Don't merge adjacent records
    #[arg(short = 'm', long)]
    no_merge: bool,
}

impl InputArgs {
    fn read(&self) -> Result<Vec<MemoryRecord>> {
        if self.address.is_some() && self.format != Format::Bin {
            warn!("Load address only applies to raw binary images; ignoring it");
        }

        let file = File::open(&self.file)
            .with_context(|| format!("failed to open {}", self.file.display()))?;
        let mut records = image::parse(
            self.format,
            &mut BufReader::new(file),
            self.address.unwrap_or(0),
        )
        .with_context(|| format!("failed to read {} as {}", self.file.display(), self.format))?;

        if self.sort {
            record::sort(&mut records);
        }
        if !self.no_merge {
            records = record::merge_adjacent(records);
        }
        Ok(records)
    }
}

/// A span of device memory to read back.
#[derive(Copy, Clone, Debug, PartialEq)]
struct DumpRange {
    address: u32,
    size: u32,
}

fn parse_dump_range(s: &str) -> Result<DumpRange, String> {
    let (address, size) = if let Some((from, to)) = s.split_once(':') {
        let address = maybe_hex::<u32>(from)?;
        let to = maybe_hex::<u32>(to)?;
        let size = to
            .checked_sub(address)
            .ok_or_else(|| format!("<to> ({to:#x}) must not be below <addr> ({address:#x})"))?;
        (address, size)
    } else if let Some((from, size)) = s.split_once('+') {
        (maybe_hex::<u32>(from)?, maybe_hex::<u32>(size)?)
    } else {
        return Err("expected <addr>:<to> or <addr>+<size>".to_owned());
    };

    if address.checked_add(size).is_none() {
        return Err(format!("range {s} runs past the end of the 32-bit address space"));
    }
    Ok(DumpRange { address, size })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("FX_LOADER_LOG", "info")
            .write_style("FX_LOADER_LOG_STYLE"),
    )
    .init();

    match Opt::parse() {
        Opt::List { filter } => list(&filter)?,
        Opt::Query { spec } => {
            let loader = spec.with_device(|s| Ok(protocol::query_loader(&s.handle, spec.timeout())?))?;
            println!("{loader:#04x}");
        }
        Opt::Load {
            spec,
            input,
            no_reset,
        } => {
            let records = input.read()?;
            let options = UploadOptions {
                timeout: spec.timeout(),
                halt_cpu: !no_reset,
            };

            let summary = spec.with_device(|s| Ok(protocol::upload(s, records, &options)?))?;
            info!(
                "Uploaded {} bytes in {} records",
                summary.bytes, summary.records
            );
        }
        Opt::Dump {
            spec,
            range,
            output,
        } => {
            let mut out: Box<dyn Write> = match &output {
                Some(path) => Box::new(
                    File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?,
                ),
                None => Box::new(std::io::stdout().lock()),
            };

            let read = spec.with_device(|s| {
                Ok(protocol::read_memory(
                    &s.handle,
                    range.address,
                    range.size,
                    &mut out,
                    spec.timeout(),
                )?)
            });
            out.flush()?;
            info!("Read {} bytes from {:#010x}", read?, range.address);
        }
        Opt::Inspect { input } => {
            let records = input.read()?;
            for record in &records {
                println!("{record}");
            }
            let bytes: u64 = records.iter().map(|r| r.size() as u64).sum();
            println!("{} records, {} bytes", records.len(), bytes);
        }
    };

    Ok(())
}

fn list(filter: &DeviceFilter) -> Result<()> {
    let context = Context::new()?;
    let devices = context.devices()?;

    for info in device::list(devices.iter(), &filter.selector()?, DEVICE_TYPES) {
        println!("{info}");
    }
    Ok(())
}
