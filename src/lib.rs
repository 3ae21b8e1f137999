//! SD/MMC card driver over SPI written in Embedded Rust, inspired by [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate detects the card type (MMC v3, SD v1, SD v2 byte or block addressed), brings the
//! card to the ready state and reads/writes 512-byte sectors over an SPI bus.
//!
//! Logging goes through the `log` facade by default, or through `defmt` with the `defmt-log`
//! feature.

#![cfg_attr(not(test), no_std)]

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("enable one of the `log` or `defmt-log` features");

mod block;
mod card;
mod command;
mod config;
mod consts;
mod crc;
mod csd;
mod response;
mod session;
mod transport;

#[cfg(test)]
mod test_utils;

pub use crate::{
    config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig},
    consts::BLOCK_SIZE,
    csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2},
    transport::{FixedSpeed, Speed, Transport},
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    consts::BLOCK_SIZE_U32,
    session::{Session, SessionError},
};

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
use log::{error, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{error, info, warn};

use core::cell::{Cell, RefCell, RefMut};
use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

/// [`SdMmcSpi`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// No response when executing this command.
    TimeoutCommand(u8),
    /// No data token when reading from the card.
    TimeoutReadBuffer,
    /// No response when waiting for the card to not be busy.
    TimeoutWaitAvailable,
    /// The card kept the line low after a write.
    TimeoutWriteBusy,
    /// The card did not leave the idle state during initialization.
    TimeoutInitialization(u8),
    /// The card flagged this command as illegal.
    IllegalCommand(u8),
    /// Unexpected R1 of this command.
    ErrorCommand(u8, u8),
    /// SEND_IF_COND echo mismatch, the raw R7 register.
    VoltageMismatch(u32),
    /// Data error token instead of the start token.
    ReadError(u8),
    /// The card rejected a data block with a CRC error.
    DataCrcRejected,
    /// The card rejected a data block with a write error.
    WriteError,
    /// Malformed data response.
    DataResponseFormat(u8),
    /// CRC mismatch (card, host).
    CrcError(u16, u16),
    /// Failed to read the Card Specific Data register.
    RegisterReadError,
    /// Operation needs an initialized card.
    NotInitialized,
    /// The card did not become ready.
    NotReady,
    /// The session is in use.
    Busy,
    /// Buffer length is not a non-zero multiple of the block size.
    InvalidBuffer(usize),
    /// Sector is out of the byte address range.
    AddressOverflow(u32),
}

/// Card type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    Unknown,
    MMC3,
    SD1,
    SD2,
    SDHC,
}

impl CardType {
    /// Sectors are addressed by block index rather than by byte offset.
    pub fn is_block_addressed(self) -> bool {
        self == CardType::SDHC
    }

    /// Protocol address of `sector`, `None` if it does not fit the byte address range.
    pub fn block_address(self, sector: u32) -> Option<u32> {
        if self.is_block_addressed() {
            Some(sector)
        } else {
            sector.checked_mul(BLOCK_SIZE_U32)
        }
    }
}

/// Card state reported by [`SdMmcSpi::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardStatus {
    Ready,
    NotInitialized,
    NoMedium,
}

/// SD Card SPI driver.
///
/// `Spi` - SPI transport.
/// `Cs` - Chip select output switch.
/// `Delay` - millisecond delay.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcSpi<Spi, Cs, Delay, Config = DefaultSdMmcSpiConfig>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    session: RefCell<Session<Spi, Cs, Delay, Config>>,
    status: Cell<Status>,
}

impl<Spi, Cs, Delay, Config> SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    /// Creates a new [`SdMmcSpi<Spi, Cs, Delay, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `delay` - delay provider.
    pub fn new(spi: Spi, cs: Cs, delay: Delay) -> Self {
        SdMmcSpi {
            session: RefCell::new(Session::new(spi, cs, delay)),
            status: Cell::new(StatusFlag::NotInitialized.into()),
        }
    }

    /// Release the SPI, the chip select and the delay.
    pub fn free(self) -> (Spi, Cs, Delay) {
        self.session.into_inner().free()
    }

    /// Exclusive guard over the session.
    fn lock(&self) -> Result<RefMut<'_, Session<Spi, Cs, Delay, Config>>, SessionError<Spi, Cs>> {
        self.session.try_borrow_mut().map_err(|_| Error::Busy)
    }

    /// Validate buffer for read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), SessionError<Spi, Cs>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(Error::InvalidBuffer(buf_len))
        } else {
            Ok(())
        }
    }

    fn init(&self) -> Result<CardType, SessionError<Spi, Cs>> {
        let result = self.lock()?.initialize();

        self.status.set(match result {
            Ok(_) => Status::default(),
            Err(_) => {
                error!("Failed to initialize SD");
                StatusFlag::ErrorOccured | StatusFlag::NotInitialized
            }
        });

        result
    }

    /// Detect the card type and bring the card to the ready state.
    ///
    /// On failure [`SdMmcSpi::get_type`] reports [`CardType::Unknown`].
    pub fn initialize(&self) -> Result<CardType, SessionError<Spi, Cs>> {
        self.init()
    }

    /// Card type resolved by the last initialization.
    pub fn get_type(&self) -> CardType {
        self.session
            .try_borrow()
            .map_or(CardType::Unknown, |session| session.card_type())
    }

    /// Bring the card back from the idle state, [`Error::NotReady`] if it stays idle.
    pub fn wake_up(&self) -> Result<(), SessionError<Spi, Cs>> {
        self.lock()?.wake_up()
    }

    /// Read CSD register.
    pub fn read_csd(&self) -> Result<Csd, SessionError<Spi, Cs>> {
        let csd = self.lock()?.read_csd()?;

        info!("SD capacity: {} blocks", csd.card_capacity_blocks());

        Ok(csd)
    }

    /// Read one sector.
    pub fn read_sector(
        &self,
        sector: u32,
        buf: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), SessionError<Spi, Cs>> {
        self.read_sectors(sector, buf, Config::DATA_TOKEN_TIMEOUT_MS)
    }

    /// Read `buf.len() / BLOCK_SIZE` sectors starting at `sector`.
    ///
    /// `timeout_ms` bounds the wait for the data token of each block.
    pub fn read_sectors(
        &self,
        sector: u32,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        Self::validate_buffer_len(buf.len())?;

        self.lock()?.read_sectors(sector, buf, timeout_ms)
    }

    /// Write one sector.
    pub fn write_sector(
        &self,
        sector: u32,
        buf: &[u8; BLOCK_SIZE],
    ) -> Result<(), SessionError<Spi, Cs>> {
        self.write_sectors(sector, buf, Config::WRITE_BUSY_TIMEOUT_MS)
    }

    /// Write `buf.len() / BLOCK_SIZE` sectors starting at `sector`.
    ///
    /// `timeout_ms` bounds the busy wait after each block.
    pub fn write_sectors(
        &self,
        sector: u32,
        buf: &[u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        Self::validate_buffer_len(buf.len())?;

        self.lock()?.write_sectors(sector, buf, timeout_ms)
    }

    /// Query the card state, the card is re-initialized once if it does not answer.
    pub fn get_status(&self) -> Result<CardStatus, SessionError<Spi, Cs>> {
        let status = self.lock()?.status();

        if status == CardStatus::NoMedium {
            self.status
                .set(StatusFlag::ErrorOccured | StatusFlag::NotInitialized);
        }

        Ok(status)
    }
}

impl<Spi, Cs, Delay, Config> DiskioDevice for SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = SessionError<Spi, Cs>;

    fn status(&self) -> Status {
        self.status.get()
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status.set(StatusFlag::NotInitialized.into());
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.get().contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.init().map(|_| ()).map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let sector = self.disk_sector(buf.len(), lba)?;

        self.read_sectors(sector, buf, Config::DATA_TOKEN_TIMEOUT_MS)
            .map_err(DiskioError::Hardware)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let sector = self.disk_sector(buf.len(), lba)?;

        self.write_sectors(sector, buf, Config::WRITE_BUSY_TIMEOUT_MS)
            .map_err(DiskioError::Hardware)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => self
                .lock()
                .and_then(|mut session| session.cs_scope(|s| s.wait_available_state()))
                .map_err(DiskioError::Hardware),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}

impl<Spi, Cs, Delay, Config> SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Validate a disk request and convert its lba.
    fn disk_sector(
        &self,
        buf_len: usize,
        lba: Lba,
    ) -> Result<u32, DiskioError<SessionError<Spi, Cs>>> {
        if Self::validate_buffer_len(buf_len).is_err() {
            return Err(DiskioError::InvalidArgument);
        }
        if self.status.get().contains(StatusFlag::NotInitialized) {
            return Err(DiskioError::NotInitialized);
        }

        u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)
    }
}
