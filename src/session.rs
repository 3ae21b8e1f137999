use crate::{
    command::build_command,
    config::SdMmcSpiConfig,
    consts::{commands, tokens, FILL_BYTE},
    response::R1Response,
    transport::{Speed, Transport},
    CardType, Error,
};

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

use core::marker::PhantomData;
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use switch_hal::OutputSwitch;

/// Error type of a session over `Spi` with chip select `Cs`.
pub type SessionError<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Card session: the bus, the chip select and the resolved card type.
///
/// Exclusive ownership of the session is what serializes byte exchanges with the card.
pub struct Session<Spi, Cs, Delay, Config> {
    spi: Spi,
    cs: Cs,
    delay: Delay,
    card_type: CardType,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Delay, Config> Session<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    pub fn new(spi: Spi, cs: Cs, delay: Delay) -> Self {
        Session {
            spi,
            cs,
            delay,
            card_type: CardType::Unknown,
            config: PhantomData::<Config>,
        }
    }

    /// Release the bus, the chip select and the delay.
    pub fn free(self) -> (Spi, Cs, Delay) {
        (self.spi, self.cs, self.delay)
    }

    /// Card type resolved by the last initialization.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub(crate) fn set_card_type(&mut self, card_type: CardType) {
        self.card_type = card_type;
    }

    /// Activate chip select.
    pub fn select(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        self.cs.on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    pub fn unselect(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        self.cs.off().map_err(Error::SelectError)
    }

    /// CS scope, chip select is released on every exit of `f`.
    pub fn cs_scope<R, F>(&mut self, f: F) -> Result<R, SessionError<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<R, SessionError<Spi, Cs>>,
    {
        self.select()?;
        let result = f(self);
        self.unselect()?;

        result
    }

    /// Set SPI clock rate.
    pub fn set_speed(&mut self, speed: Speed) -> Result<(), SessionError<Spi, Cs>> {
        trace!("SD bus speed: {:?}", speed);
        self.spi.set_speed(speed).map_err(Error::Transport)
    }

    /// Block for `ms` milliseconds.
    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, data: u8) -> Result<u8, SessionError<Spi, Cs>> {
        self.spi
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, SessionError<Spi, Cs>> {
        self.transfer(FILL_BYTE)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, data: u8) -> Result<(), SessionError<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    pub fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), SessionError<Spi, Cs>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    pub fn send_slice(&mut self, data: &[u8]) -> Result<(), SessionError<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Skip byte.
    pub fn skip_byte(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        self.receive().map(|_| ())
    }

    /// Clock out `count` fill bytes.
    pub fn send_fill_bytes(&mut self, count: usize) -> Result<(), SessionError<Spi, Cs>> {
        for _ in 0..count {
            self.send(FILL_BYTE)?;
        }

        Ok(())
    }

    /// Wait for token, at most `attempts` bytes.
    pub fn wait_for_token<F: Fn(u8) -> bool>(
        &mut self,
        attempts: usize,
        token_validator: F,
        error: SessionError<Spi, Cs>,
    ) -> Result<u8, SessionError<Spi, Cs>> {
        for _ in 0..attempts {
            let token = self.receive()?;

            if token_validator(token) {
                return Ok(token);
            }
        }

        Err(error)
    }

    /// Wait for token during about `timeout_ms` milliseconds.
    pub fn wait_for_token_ms<F: Fn(u8) -> bool>(
        &mut self,
        timeout_ms: u32,
        token_validator: F,
        error: SessionError<Spi, Cs>,
    ) -> Result<u8, SessionError<Spi, Cs>> {
        for _ in 0..timeout_ms.max(1) {
            for _ in 0..Config::POLLS_PER_MS {
                let token = self.receive()?;

                if token_validator(token) {
                    return Ok(token);
                }
            }

            self.delay_ms(1);
        }

        Err(error)
    }

    /// Wait available state of card.
    pub fn wait_available_state(&mut self) -> Result<(), SessionError<Spi, Cs>> {
        self.wait_for_token(
            Config::WAIT_AVAILABLE_ATTEMPTS,
            |token| token == tokens::AVAILABLE,
            Error::TimeoutWaitAvailable,
        )
        .map(|_| ())
    }

    /// Send the frame of `cmd`, once the card releases the bus.
    fn write_command(&mut self, cmd: u8, arg: u32) -> Result<(), SessionError<Spi, Cs>> {
        trace!("SD CMD{} arg: 0x{:08x}", commands::index(cmd), arg);

        self.wait_available_state()?;
        self.send_slice(&build_command(cmd, arg))
    }

    /// Send command and wait R1, the card's following bytes are left on the bus.
    pub fn send_command(&mut self, cmd: u8, arg: u32) -> Result<R1Response, SessionError<Spi, Cs>> {
        self.write_command(cmd, arg)?;
        self.wait_r1(cmd)
    }

    /// Send command, read its response with `reader` and clock one fill byte.
    pub fn command_with<R, F>(
        &mut self,
        cmd: u8,
        arg: u32,
        reader: F,
    ) -> Result<R, SessionError<Spi, Cs>>
    where
        F: FnOnce(&mut Self, u8) -> Result<R, SessionError<Spi, Cs>>,
    {
        self.write_command(cmd, arg)?;
        let response = reader(self, cmd)?;
        self.skip_byte()?;

        Ok(response)
    }

    /// Send command with R1 response, APP_CMD is sent first for an ACMD.
    pub fn command(&mut self, cmd: u8, arg: u32) -> Result<R1Response, SessionError<Spi, Cs>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            let r1 = self.command_with(commands::CMD55, 0x0000_0000, Self::wait_r1)?;

            if r1.illegal_command() {
                return Ok(r1);
            }
            if !r1.is_idle_or_ready() {
                return Err(Error::ErrorCommand(commands::CMD55, r1.0));
            }
        }

        self.command_with(cmd, arg, Self::wait_r1)
    }
}
