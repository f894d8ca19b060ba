// Storage collaborator interface: partition enumeration, descriptor reads,
// sequential write sessions and the boot-target commit. The firmware crate
// implements this over the ESP-IDF OTA API; tests use an in-memory fake.

use core::fmt;

use crate::image::AppDescriptor;

// Flash layout constants for the diagnostic digests logged at startup.
pub const BOOTLOADER_OFFSET: u32 = 0x0;
pub const BOOTLOADER_LEN: u32 = 0x8000;
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const PARTITION_TABLE_LEN: u32 = 0xC00;

/// Handle to a fixed region of non-volatile storage holding one firmware
/// image. Partitions are a layout fact; only the boot-target assignment
/// ever changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: heapless::String<16>,
    pub address: u32,
    pub size: u32,
}

impl Partition {
    pub fn new(label: &str, address: u32, size: u32) -> Self {
        let mut l = heapless::String::new();
        let _ = l.push_str(&label[..label.len().min(16)]);
        Self { label: l, address, size }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @0x{:08x}", self.label, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    NoUpdatePartition,
    ReadFailed,
    BeginFailed,
    WriteFailed,
    ValidationFailed,
    BootTargetFailed,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FlashError::NoUpdatePartition => "no update partition available",
            FlashError::ReadFailed => "partition read failed",
            FlashError::BeginFailed => "could not open the write session",
            FlashError::WriteFailed => "flash write failed",
            FlashError::ValidationFailed => "written image failed validation",
            FlashError::BootTargetFailed => "could not switch the boot target",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FlashError {}

/// One in-flight sequential write into the update partition. Exactly one
/// session exists per update attempt; it is either committed or aborted
/// before the pipeline returns.
pub trait WriteSession {
    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashError>;

    /// Finalize the image and mark the target partition as the boot target.
    /// This is the atomic commit of the update.
    fn commit(self) -> Result<(), FlashError>;

    /// Discard the partial image; the target partition stays non-bootable.
    fn abort(self);
}

pub trait FirmwareFlash {
    type Session: WriteSession;

    /// Partition configured as the boot target.
    fn boot_partition(&self) -> Result<Partition, FlashError>;

    /// Partition the current firmware is actually executing from.
    fn running_partition(&self) -> Result<Partition, FlashError>;

    /// Inactive partition the next image will be written to. Never the one
    /// currently marked bootable.
    fn next_update_partition(&self) -> Result<Partition, FlashError>;

    /// Factory image partition, if the layout carries one.
    fn factory_partition(&self) -> Result<Option<Partition>, FlashError>;

    /// Descriptor embedded in a partition's image head, if one is readable.
    fn app_descriptor(&self, part: &Partition) -> Result<Option<AppDescriptor>, FlashError>;

    /// Partition that was rolled back after failing to confirm healthy
    /// operation, if the bootloader remembers one.
    fn last_invalid_partition(&self) -> Result<Option<Partition>, FlashError>;

    /// Forget the rolled-back image so its version can no longer match a
    /// future download.
    fn clear_last_invalid(&mut self) -> Result<(), FlashError>;

    /// Content digest of a partition. Diagnostics only.
    fn partition_digest(&self, part: &Partition) -> Result<[u8; 32], FlashError>;

    /// Content digest of a raw flash region. Diagnostics only.
    fn region_digest(&self, address: u32, size: u32) -> Result<[u8; 32], FlashError>;

    fn begin_update(&mut self, target: &Partition) -> Result<Self::Session, FlashError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_label_is_bounded() {
        let part = Partition::new("a-label-that-is-way-too-long", 0x10000, 0x1000);
        assert_eq!(part.label.len(), 16);
        assert_eq!(part.address, 0x10000);
    }

    #[test]
    fn partition_display_includes_address() {
        let part = Partition::new("ota_0", 0x10000, 0x180000);
        assert_eq!(format!("{part}"), "ota_0 @0x00010000");
    }
}
