use crate::{
    config::SdMmcSpiConfig,
    session::{Session, SessionError},
    transport::Transport,
    Error,
};

use bitfield::bitfield;
use embedded_hal::blocking::delay::DelayMs;
use switch_hal::OutputSwitch;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card is initialized and ready.
    pub const READY_STATE: Self = R1Response(0x00);
    /// Card is in idle state and running the initialization process.
    pub const IN_IDLE_STATE: Self = R1Response(0x01);

    /// A response byte always starts with a cleared bit.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// No error bit is raised.
    pub fn is_idle_or_ready(&self) -> bool {
        self.0 & !Self::IN_IDLE_STATE.0 == 0
    }
}

/// Idle state bit of the R1 part in a composed R2 value.
pub const R2_IN_IDLE_STATE: u16 = 1 << 8;

bitfield! {
    /// Operating Conditions Register, payload of R3.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Ocr(u32);
    impl Debug;
    pub card_power_up_status, _: 31;
    pub card_capacity_status, _: 30;
}

/// Data response token sent by the card after a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataResponse {
    /// Data accepted.
    Accepted,
    /// Data rejected due to a CRC error.
    CrcRejected,
    /// Data rejected due to a write error.
    WriteRejected,
    /// Not a data response token.
    Malformed(u8),
}

impl From<u8> for DataResponse {
    fn from(token: u8) -> Self {
        if token & 0x10 != 0 {
            return DataResponse::Malformed(token);
        }

        match token & 0x0F {
            0b0101 => DataResponse::Accepted,
            0b1011 => DataResponse::CrcRejected,
            0b1101 => DataResponse::WriteRejected,
            _ => DataResponse::Malformed(token),
        }
    }
}

impl<Spi, Cs, Delay, Config> Session<Spi, Cs, Delay, Config>
where
    Spi: Transport,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    /// Wait for R1 of command `cmd`.
    pub fn wait_r1(&mut self, cmd: u8) -> Result<R1Response, SessionError<Spi, Cs>> {
        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        Err(Error::TimeoutCommand(cmd))
    }

    /// Wait for R2, composed as `(r1 << 8) | status`.
    pub fn wait_r2(&mut self, cmd: u8) -> Result<u16, SessionError<Spi, Cs>> {
        let r1 = self.wait_r1(cmd)?;

        if r1.illegal_command() {
            return Err(Error::IllegalCommand(cmd));
        }

        Ok((u16::from(r1.0) << 8) | u16::from(self.receive()?))
    }

    /// Wait for R3, R1 followed by the OCR.
    pub fn wait_r3(&mut self, cmd: u8) -> Result<(R1Response, u32), SessionError<Spi, Cs>> {
        let r1 = self.wait_r1(cmd)?;

        if r1.illegal_command() {
            return Err(Error::IllegalCommand(cmd));
        }

        let mut register = [0; 4];
        self.receive_slice(&mut register)?;

        Ok((r1, u32::from_be_bytes(register)))
    }

    /// Wait for R7, same layout as R3 with the echoed interface condition.
    pub fn wait_r7(&mut self, cmd: u8) -> Result<(R1Response, u32), SessionError<Spi, Cs>> {
        self.wait_r3(cmd)
    }
}
