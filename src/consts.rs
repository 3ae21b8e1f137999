/// Size of one sector (data block) in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of one sector (data block) in bytes, as `u32`.
pub const BLOCK_SIZE_U32: u32 = BLOCK_SIZE as u32;
/// Size of one sector (data block) in bytes, as `u64`.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Byte clocked out while the host only listens.
pub const FILL_BYTE: u8 = 0xFF;

pub mod commands {
    /// Start bits of every command frame.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag, the command must be prefixed by APP_CMD.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = 0;
    /// SEND_OP_COND - activates the card's initialization process (MMC).
    pub const CMD1: u8 = 1;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = 9;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = 13;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = 17;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = 24;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
    /// SD_SEND_OP_COND - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = ACMD_FLAG + 41;

    /// Strip the ACMD flag off a command.
    pub const fn index(cmd: u8) -> u8 {
        cmd & !ACMD_FLAG
    }
}

pub mod arguments {
    /// SEND_IF_COND argument: 2.7-3.6V window (0b0001) and check pattern 0xAA.
    pub const IF_COND_3V3: u32 = 0x0000_01AA;
    /// Check pattern echoed back in the R7 low byte.
    pub const IF_COND_CHECK_PATTERN: u8 = 0xAA;
    /// Host Capacity Support bit of ACMD41.
    pub const HCS: u32 = 1 << 30;
}

pub mod tokens {
    /// Card is not busy.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
}
