use crate::{consts::BLOCK_SIZE_U64, CardType};

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

bitfield! {
    /// Card Specific Data, version 1 (SDSC and MMC).
    pub struct CsdV1(u128);
    impl Debug;
    pub u8, version, _: 127, 126;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub read_partial_blocks, _: 79;
    pub write_block_misalignment, _: 78;
    pub read_block_misalignment, _: 77;
    pub dsr_implemented, _: 76;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// Card Specific Data, version 2 (SDHC and SDXC).
    pub struct CsdV2(u128);
    impl Debug;
    pub u8, version, _: 127, 126;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub u32, device_size, _: 69, 48;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

/// Card Specific Data, generic container.
#[derive(Debug)]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

impl Csd {
    /// Decode CSD of a card of type `card_type`.
    ///
    /// MMC CSD structure versions share the version 1 layout.
    pub fn new(csd_data: CsdData, card_type: CardType) -> Self {
        let raw = u128::from_be_bytes(csd_data);

        if card_type != CardType::MMC3 && (raw >> 126) == 1 {
            Csd::V2(CsdV2(raw))
        } else {
            Csd::V1(CsdV1(raw))
        }
    }
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64;
}

impl CapacityProvider for CsdV1 {
    fn card_capacity_blocks(&self) -> u64 {
        let shift = u32::from(self.device_size_multiplier()) + u32::from(self.read_block_length());

        (u64::from(self.device_size()) + 1) << shift.saturating_sub(7)
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * (KiB as u64)
    }
}

impl CapacityProvider for Csd {
    fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}
