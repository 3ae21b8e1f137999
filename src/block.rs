use crate::{
    config::SdMmcSpiConfig,
    consts::{commands, tokens, BLOCK_SIZE},
    crc::crc16,
    response::{DataResponse, R1Response},
    session::{Session, SessionError},
    transport::Transport,
    CardType, Error,
};

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
use log::{error, warn};

#[cfg(feature = "defmt-log")]
use defmt::{error, warn};

use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

impl<Spi, Cs, Delay, Config> Session<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    /// Read data block: start token, payload, CRC.
    pub fn read_data(
        &mut self,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        let token = self.wait_for_token_ms(
            timeout_ms,
            |token| token != tokens::AVAILABLE,
            Error::TimeoutReadBuffer,
        )?;

        if token != tokens::DATA_START_BLOCK {
            warn!("SD data error token: 0x{:02x}", token);
            return Err(Error::ReadError(token));
        }

        self.receive_slice(data)?;

        let mut crc = [0; 2];
        self.receive_slice(&mut crc)?;

        if Config::VERIFY_DATA_CRC {
            let card_crc = u16::from_be_bytes(crc);
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Write data block: start token, payload, CRC, then check the data response.
    pub fn write_data(&mut self, data: &[u8]) -> Result<(), SessionError<Spi, Cs>> {
        let [crc_high, crc_low] = crc16(data).to_be_bytes();

        self.send(tokens::DATA_START_BLOCK)?;
        self.send_slice(data)?;
        self.send(crc_high)?;
        self.send(crc_low)?;

        match DataResponse::from(self.receive()? & tokens::DATA_RES_MASK) {
            DataResponse::Accepted => Ok(()),
            DataResponse::CrcRejected => {
                error!("SD rejected data block: CRC error");
                Err(Error::DataCrcRejected)
            }
            DataResponse::WriteRejected => {
                error!("SD rejected data block: write error");
                Err(Error::WriteError)
            }
            DataResponse::Malformed(token) => Err(Error::DataResponseFormat(token)),
        }
    }

    /// Wait until the card stops holding the line low after a write.
    pub fn wait_write_done(&mut self, timeout_ms: u32) -> Result<(), SessionError<Spi, Cs>> {
        self.wait_for_token_ms(timeout_ms, |token| token != 0x00, Error::TimeoutWriteBusy)
            .map(|_| ())
    }

    /// Read single block at protocol `address`.
    pub fn read_block(
        &mut self,
        address: u32,
        block: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        let r1 = self.send_command(commands::CMD17, address)?;
        if r1 != R1Response::READY_STATE {
            return Err(Error::ErrorCommand(commands::CMD17, r1.0));
        }

        self.read_data(block, timeout_ms)?;
        self.skip_byte()
    }

    /// Write single block at protocol `address`.
    pub fn write_block(
        &mut self,
        address: u32,
        block: &[u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        let r1 = self.send_command(commands::CMD24, address)?;
        if r1 != R1Response::READY_STATE {
            return Err(Error::ErrorCommand(commands::CMD24, r1.0));
        }

        self.skip_byte()?;
        self.write_data(block)?;
        self.wait_write_done(timeout_ms)?;
        self.skip_byte()
    }

    /// Resolved card type, I/O is refused before initialization.
    fn validated_type(&self) -> Result<CardType, SessionError<Spi, Cs>> {
        match self.card_type() {
            CardType::Unknown => Err(Error::NotInitialized),
            card_type => Ok(card_type),
        }
    }

    /// Protocol address of the `index`-th sector starting from `first`.
    fn sector_address(&self, first: u32, index: usize) -> Result<u32, SessionError<Spi, Cs>> {
        u32::try_from(index)
            .ok()
            .and_then(|index| first.checked_add(index))
            .and_then(|sector| self.card_type().block_address(sector))
            .ok_or(Error::AddressOverflow(first))
    }

    /// Read consecutive sectors into `buf`, one single-block command per sector.
    pub fn read_sectors(
        &mut self,
        sector: u32,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        self.validated_type()?;

        self.cs_scope(|s| {
            for (index, block) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
                let address = s.sector_address(sector, index)?;
                s.read_block(address, block, timeout_ms)?;
            }

            Ok(())
        })
    }

    /// Write consecutive sectors from `buf`, one single-block command per sector.
    pub fn write_sectors(
        &mut self,
        sector: u32,
        buf: &[u8],
        timeout_ms: u32,
    ) -> Result<(), SessionError<Spi, Cs>> {
        self.validated_type()?;

        self.cs_scope(|s| {
            for (index, block) in buf.chunks(BLOCK_SIZE).enumerate() {
                let address = s.sector_address(sector, index)?;
                s.write_block(address, block, timeout_ms)?;
            }

            Ok(())
        })
    }
}
