/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
pub trait SdMmcSpiConfig {
    /// Count of `0xFF` bytes clocked with CS deasserted to put the card into SPI mode.
    const INIT_FILL_BYTES: usize;
    /// Max attempts to enter SPI mode (GO_IDLE_STATE without response).
    const ENTER_SPI_MODE_ATTEMPTS: usize;
    /// Max attempts to wait for the card to release the bus before a command.
    const WAIT_AVAILABLE_ATTEMPTS: usize;
    /// Max attempts to read a single response byte.
    const READ_R1_ATTEMPTS: usize;
    /// Max iterations of the ACMD41 / CMD1 initialization loops, 1 ms apart.
    const INIT_ATTEMPTS: usize;
    /// Byte polls made between two 1 ms delays in a millisecond-bounded wait.
    const POLLS_PER_MS: usize;
    /// Budget in ms to wait for the start data token.
    const DATA_TOKEN_TIMEOUT_MS: u32;
    /// Budget in ms to wait for the card to finish programming a written block.
    const WRITE_BUSY_TIMEOUT_MS: u32;
    /// Check CRC-16 of received data blocks.
    const VERIFY_DATA_CRC: bool;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const INIT_FILL_BYTES: usize = 10;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 10;
    const WAIT_AVAILABLE_ATTEMPTS: usize = 256;
    const READ_R1_ATTEMPTS: usize = 10;
    const INIT_ATTEMPTS: usize = 1000;
    const POLLS_PER_MS: usize = 10;
    const DATA_TOKEN_TIMEOUT_MS: u32 = 3;
    const WRITE_BUSY_TIMEOUT_MS: u32 = 250;
    const VERIFY_DATA_CRC: bool = false;
}
