use crate::{
    config::SdMmcSpiConfig,
    consts::{arguments, commands},
    csd::{Csd, CsdData},
    response::{Ocr, R1Response, R2_IN_IDLE_STATE},
    session::{Session, SessionError},
    transport::{Speed, Transport},
    CardStatus, CardType, Error,
};

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
use log::{debug, error, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};

use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

impl<Spi, Cs, Delay, Config> Session<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    /// Enter SD to SPI mode.
    fn enter_spi_mode(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        for i in 0..Config::ENTER_SPI_MODE_ATTEMPTS {
            info!("Enter to SPI mode for SD, attempt: {}", i + 1);

            match self.command(commands::CMD0, 0x0000_0000) {
                Ok(r1) if r1.is_idle_or_ready() => return Ok(()),
                Ok(r1) => {
                    warn!("Wrong response from CMD0: 0x{:02x}", r1.0);
                    return Ok(());
                }
                Err(Error::TimeoutCommand(_)) => {}
                Err(err) => return Err(err),
            }

            self.delay_ms(1);
        }

        Err(Error::TimeoutCommand(commands::CMD0))
    }

    /// Verify SD Memory Card interface operating condition.
    ///
    /// Cards before version 2 answer with [`Error::IllegalCommand`].
    fn send_if_cond(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        info!("Verifying SD Memory Card interface operating condition");

        let (_, r7) =
            self.command_with(commands::CMD8, arguments::IF_COND_3V3, Self::wait_r7)?;

        if r7 as u8 != arguments::IF_COND_CHECK_PATTERN {
            error!("SD voltage check echo mismatch: 0x{:08x}", r7);
            return Err(Error::VoltageMismatch(r7));
        }

        Ok(())
    }

    /// Repeat `cmd` until the card leaves the idle state.
    fn wait_ready(&mut self, cmd: u8, arg: u32) -> Result<(), SessionError<Spi, Cs>> {
        for _ in 0..Config::INIT_ATTEMPTS {
            let r1 = self.command(cmd, arg)?;

            if r1 == R1Response::READY_STATE {
                return Ok(());
            }
            if r1.illegal_command() {
                return Err(Error::IllegalCommand(cmd));
            }

            self.delay_ms(1);
        }

        Err(Error::TimeoutInitialization(cmd))
    }

    /// Initialize a version 2 card and read its capacity class.
    fn init_v2(&mut self) -> Result<CardType, SessionError<Spi, Cs>> {
        info!("Sending host capacity support information and activates");

        self.wait_ready(commands::ACMD41, arguments::HCS)?;

        let (r1, ocr) = self.command_with(commands::CMD58, 0x0000_0000, Self::wait_r3)?;
        if r1 != R1Response::READY_STATE {
            return Err(Error::ErrorCommand(commands::CMD58, r1.0));
        }

        let ocr = Ocr(ocr);
        if !ocr.card_power_up_status() {
            warn!("SD power up status is not set in OCR");
            return Err(Error::NotReady);
        }

        Ok(if ocr.card_capacity_status() {
            CardType::SDHC
        } else {
            CardType::SD2
        })
    }

    /// Initialize a card without SEND_IF_COND: SD version 1 or MMC.
    fn init_legacy(&mut self) -> Result<CardType, SessionError<Spi, Cs>> {
        match self.wait_ready(commands::ACMD41, 0x0000_0000) {
            Ok(()) => Ok(CardType::SD1),
            Err(Error::IllegalCommand(_)) => {
                debug!("SD_SEND_OP_COND is not supported, MMC card");
                self.wait_ready(commands::CMD1, 0x0000_0000)?;
                Ok(CardType::MMC3)
            }
            Err(err) => Err(err),
        }
    }

    /// Check card type.
    fn check_type(&mut self) -> Result<CardType, SessionError<Spi, Cs>> {
        info!("Checking SD type");

        self.enter_spi_mode()?;

        match self.send_if_cond() {
            Ok(()) => self.init_v2(),
            Err(Error::IllegalCommand(_)) => self.init_legacy(),
            Err(err) => Err(err),
        }
    }

    /// Detect the card type and bring the card to the ready state.
    ///
    /// The bus runs at [`Speed::Slow`] during negotiation and is switched to
    /// [`Speed::Fast`] only once the type is resolved. On failure the card type
    /// stays [`CardType::Unknown`].
    pub fn initialize(&mut self) -> Result<CardType, SessionError<Spi, Cs>> {
        info!("SD initialize started");

        self.set_card_type(CardType::Unknown);
        self.set_speed(Speed::Slow)?;

        self.unselect()?;
        self.send_fill_bytes(Config::INIT_FILL_BYTES)?;

        let card_type = self.cs_scope(|s| s.check_type())?;

        self.set_speed(Speed::Fast)?;
        self.set_card_type(card_type);

        info!("SD successfully initialized, type: {:?}", card_type);

        Ok(card_type)
    }

    /// Bring an already identified card from idle back to ready.
    pub fn wake_up(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        let (cmd, arg) = match self.card_type() {
            CardType::Unknown => return Err(Error::NotInitialized),
            CardType::MMC3 | CardType::SD1 => (commands::CMD1, 0x0000_0000),
            CardType::SD2 | CardType::SDHC => (commands::ACMD41, arguments::HCS),
        };

        self.set_speed(Speed::Slow)?;

        let result = self.cs_scope(|s| s.wait_ready(cmd, arg));
        let restored = self.set_speed(Speed::Fast);

        match result {
            Ok(()) => restored,
            Err(Error::TimeoutInitialization(_)) => {
                warn!("SD did not leave idle state");
                Err(Error::NotReady)
            }
            Err(err) => Err(err),
        }
    }

    /// Send status, R2 of SEND_STATUS.
    fn send_status(&mut self) -> Result<u16, SessionError<Spi, Cs>> {
        self.cs_scope(|s| s.command_with(commands::CMD13, 0x0000_0000, Self::wait_r2))
    }

    /// Query the card state, re-initializing once if the card does not answer.
    pub fn status(&mut self) -> CardStatus {
        if self.card_type() == CardType::Unknown {
            return CardStatus::NotInitialized;
        }

        let r2 = match self.send_status() {
            Ok(r2) => r2,
            Err(_) => {
                warn!("SD does not answer SEND_STATUS, re-initializing");

                match self.initialize().and_then(|_| self.send_status()) {
                    Ok(r2) => r2,
                    Err(_) => return CardStatus::NoMedium,
                }
            }
        };

        if r2 & R2_IN_IDLE_STATE != 0 {
            CardStatus::NotInitialized
        } else {
            CardStatus::Ready
        }
    }

    /// Read CSD.
    pub fn read_csd(&mut self) -> Result<Csd, SessionError<Spi, Cs>> {
        let card_type = match self.card_type() {
            CardType::Unknown => return Err(Error::NotInitialized),
            card_type => card_type,
        };
        let mut csd_data: CsdData = Default::default();

        self.cs_scope(|s| {
            if s.send_command(commands::CMD9, 0x0000_0000)? != R1Response::READY_STATE {
                return Err(Error::RegisterReadError);
            }

            s.read_data(&mut csd_data, Config::DATA_TOKEN_TIMEOUT_MS)?;
            s.skip_byte()
        })?;

        Ok(Csd::new(csd_data, card_type))
    }
}
