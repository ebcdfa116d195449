/// Known device families and their USB IDs.
pub mod device_ids;

/// Find a single device by location, ID, or family and open it.
pub mod device;

/// Memory records and their normalization (sorting and merging).
pub mod record;

/// Input formats and the raw binary reader.
pub mod image;

/// Intel HEX reader.
pub mod ihex;

/// Cypress FX3 boot image reader.
pub mod cyfw;

/// Read and write target RAM through the boot loader's vendor request.
pub mod protocol;
