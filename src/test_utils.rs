//! Test doubles: a scripted SPI session and a simulated card.

use crate::{
    command::build_command,
    config::DefaultSdMmcSpiConfig,
    consts::BLOCK_SIZE,
    crc::crc16,
    csd::CsdData,
    session::Session,
    transport::{Speed, Transport},
    SdMmcSpi,
};

use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use embedded_hal_mock::{
    spi::{Mock as SpiMock, Transaction},
    MockError,
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    convert::Infallible,
    rc::Rc,
};
use switch_hal::OutputSwitch;

/// CSD of a 1 GB SDSC card.
pub const SDSC_CSD: CsdData = [
    0x00, 0x26, 0x00, 0x32, 0x5F, 0x59, 0x83, 0xC8, 0xAD, 0xDB, 0xCF, 0xFF, 0xD2, 0x40, 0x40, 0xA5,
];

/// CSD of a 4 GB SDHC card.
pub const SDHC_CSD: CsdData = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x1D, 0x69, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x8B,
];

impl Transport for SpiMock {
    fn set_speed(&mut self, _speed: Speed) -> Result<(), MockError> {
        Ok(())
    }
}

pub type MockSession = Session<SpiMock, SimSelect, SimDelay, DefaultSdMmcSpiConfig>;

/// Session over a scripted SPI bus.
pub fn mock_session(expected: &[Transaction]) -> MockSession {
    let state = Rc::new(RefCell::new(SimState::new()));

    Session::new(
        SpiMock::new(expected),
        SimSelect(state.clone()),
        SimDelay(state),
    )
}

impl MockSession {
    /// Check every scripted transaction was consumed.
    pub fn done(self) {
        let (mut spi, cs, _) = self.free();
        spi.done();
        assert!(cs.is_balanced());
    }
}

pub type SimSession = Session<SimCard, SimSelect, SimDelay, DefaultSdMmcSpiConfig>;
pub type SimDriver = SdMmcSpi<SimCard, SimSelect, SimDelay, DefaultSdMmcSpiConfig>;

fn sim_parts() -> (SimCard, SimSelect, SimDelay) {
    let state = Rc::new(RefCell::new(SimState::new()));

    (
        SimCard(state.clone()),
        SimSelect(state.clone()),
        SimDelay(state),
    )
}

/// Session over a simulated SDHC card.
pub fn sim_session() -> (SimSession, SimCard) {
    let (card, cs, delay) = sim_parts();

    (Session::new(card.clone(), cs, delay), card)
}

/// Driver over a simulated SDHC card.
pub fn sim_driver() -> (SimDriver, SimCard) {
    let (card, cs, delay) = sim_parts();

    (SdMmcSpi::new(card.clone(), cs, delay), card)
}

/// Kind of the simulated card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    Absent,
    Mmc,
    SdV1,
    SdV2 { ccs: bool },
}

/// Simulated bus failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimError;

enum DataPhase {
    Idle,
    AwaitToken { sector: u32 },
    Receiving { sector: u32, data: Vec<u8> },
}

struct SimState {
    kind: SimKind,
    ready_after: usize,
    polls_left: usize,
    idle: bool,
    app_cmd: bool,
    frame: Vec<u8>,
    output: VecDeque<u8>,
    phase: DataPhase,
    sectors: BTreeMap<u32, [u8; BLOCK_SIZE]>,
    commands: Vec<(u8, u32)>,
    speed: Option<Speed>,
    transfers: usize,
    fail_after: Option<usize>,
    stuck_busy: bool,
    power_up_pending: bool,
    busy_bytes: usize,
    if_cond_echo: Option<u8>,
    go_idle_response: Option<u8>,
    data_response: Option<u8>,
    ignore_next: Option<u8>,
    selected: bool,
    asserts: usize,
    deasserts: usize,
    nested_select: bool,
    delayed_ms: u32,
}

impl SimState {
    fn new() -> Self {
        SimState {
            kind: SimKind::SdV2 { ccs: true },
            ready_after: 1,
            polls_left: 1,
            idle: true,
            app_cmd: false,
            frame: Vec::new(),
            output: VecDeque::new(),
            phase: DataPhase::Idle,
            sectors: BTreeMap::new(),
            commands: Vec::new(),
            speed: None,
            transfers: 0,
            fail_after: None,
            stuck_busy: false,
            power_up_pending: false,
            busy_bytes: 3,
            if_cond_echo: None,
            go_idle_response: None,
            data_response: None,
            ignore_next: None,
            selected: false,
            asserts: 0,
            deasserts: 0,
            nested_select: false,
            delayed_ms: 0,
        }
    }

    fn clock(&mut self, input: u8) -> u8 {
        if self.stuck_busy {
            return 0x00;
        }

        match &mut self.phase {
            DataPhase::AwaitToken { sector } if input == 0xFE => {
                self.phase = DataPhase::Receiving {
                    sector: *sector,
                    data: Vec::with_capacity(BLOCK_SIZE + 2),
                };
                0xFF
            }
            DataPhase::Receiving { sector, data } => {
                data.push(input);
                if data.len() == BLOCK_SIZE + 2 {
                    let mut block = [0; BLOCK_SIZE];
                    block.copy_from_slice(&data[..BLOCK_SIZE]);
                    let sector = *sector;

                    self.phase = DataPhase::Idle;
                    let response = self.data_response.unwrap_or(0xE5);
                    if response & 0x1F == 0x05 {
                        self.sectors.insert(sector, block);
                    }
                    self.output.push_back(response);
                    self.output.extend(core::iter::repeat(0x00).take(self.busy_bytes));
                }
                0xFF
            }
            _ if !self.frame.is_empty() || (input & 0xC0) == 0x40 => {
                self.frame.push(input);
                self.output.clear();
                if self.frame.len() == 6 {
                    let frame = core::mem::take(&mut self.frame);
                    self.execute(&frame);
                }
                0xFF
            }
            _ => self.output.pop_front().unwrap_or(0xFF),
        }
    }

    fn init_poll(&mut self) -> u8 {
        if self.polls_left == 0 {
            self.idle = false;
            0x00
        } else {
            self.polls_left -= 1;
            0x01
        }
    }

    fn sector_index(&self, arg: u32) -> Option<u32> {
        match self.kind {
            SimKind::SdV2 { ccs: true } => Some(arg),
            _ if arg % BLOCK_SIZE as u32 == 0 => Some(arg / BLOCK_SIZE as u32),
            _ => None,
        }
    }

    fn data_block(data: &[u8]) -> Vec<u8> {
        let mut block = vec![0x00, 0xFF, 0xFE];
        block.extend_from_slice(data);
        block.extend_from_slice(&crc16(data).to_be_bytes());
        block
    }

    fn execute(&mut self, frame: &[u8]) {
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);

        assert_eq!(&build_command(cmd, arg)[..], frame, "bad command frame");
        self.commands.push((cmd, arg));

        if self.kind == SimKind::Absent {
            return;
        }
        if self.ignore_next == Some(cmd) {
            self.ignore_next = None;
            return;
        }

        let app_cmd = core::mem::replace(&mut self.app_cmd, false);
        let r1 = u8::from(self.idle);

        let response = match cmd {
            0 => {
                self.idle = true;
                self.polls_left = self.ready_after;
                self.phase = DataPhase::Idle;
                vec![self.go_idle_response.unwrap_or(0x01)]
            }
            8 => match self.kind {
                SimKind::SdV2 { .. } => vec![
                    r1,
                    0x00,
                    0x00,
                    ((arg >> 8) & 0x0F) as u8,
                    self.if_cond_echo.unwrap_or(arg as u8),
                ],
                _ => vec![r1 | 0x04],
            },
            55 => {
                self.app_cmd = true;
                vec![r1]
            }
            41 if app_cmd && self.kind != SimKind::Mmc => vec![self.init_poll()],
            1 => vec![self.init_poll()],
            58 => {
                let ccs = matches!(self.kind, SimKind::SdV2 { ccs: true });
                let mut ocr: u32 = 0x00FF_8000 | if ccs { 1 << 30 } else { 0 };
                if !self.power_up_pending {
                    ocr |= 1 << 31;
                }
                let mut response = vec![r1];
                response.extend_from_slice(&ocr.to_be_bytes());
                response
            }
            13 => vec![r1, 0x00],
            9 if !self.idle => match self.kind {
                SimKind::SdV2 { ccs: true } => Self::data_block(&SDHC_CSD),
                _ => Self::data_block(&SDSC_CSD),
            },
            17 if !self.idle => match self.sector_index(arg) {
                Some(sector) => {
                    let data = self.sectors.get(&sector).copied().unwrap_or([0; BLOCK_SIZE]);
                    Self::data_block(&data)
                }
                None => vec![0x20],
            },
            24 if !self.idle => match self.sector_index(arg) {
                Some(sector) => {
                    self.phase = DataPhase::AwaitToken { sector };
                    vec![0x00]
                }
                None => vec![0x20],
            },
            9 | 17 | 24 => vec![r1],
            _ => vec![r1 | 0x04],
        };

        self.output.clear();
        self.output.push_back(0xFF);
        self.output.extend(response);
    }
}

/// Simulated card on the SPI bus, a shared handle.
#[derive(Clone)]
pub struct SimCard(Rc<RefCell<SimState>>);

impl Transfer<u8> for SimCard {
    type Error = SimError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimError> {
        let mut state = self.0.borrow_mut();

        for word in words.iter_mut() {
            if state.fail_after.map_or(false, |limit| state.transfers >= limit) {
                return Err(SimError);
            }

            state.transfers += 1;
            *word = state.clock(*word);
        }

        Ok(words)
    }
}

impl Transport for SimCard {
    fn set_speed(&mut self, speed: Speed) -> Result<(), SimError> {
        self.0.borrow_mut().speed = Some(speed);
        Ok(())
    }
}

impl SimCard {
    pub fn insert(&self, kind: SimKind) {
        let mut state = self.0.borrow_mut();
        state.kind = kind;
        state.idle = true;
        state.polls_left = state.ready_after;
    }

    pub fn remove(&self) {
        self.0.borrow_mut().kind = SimKind::Absent;
    }

    /// Return the card to the idle state.
    pub fn sleep(&self) {
        let mut state = self.0.borrow_mut();
        state.idle = true;
        state.polls_left = state.ready_after;
    }

    /// Count of initialization polls answered with the idle state.
    pub fn set_ready_after(&self, polls: usize) {
        let mut state = self.0.borrow_mut();
        state.ready_after = polls;
        state.polls_left = polls;
    }

    pub fn set_if_cond_echo(&self, echo: u8) {
        self.0.borrow_mut().if_cond_echo = Some(echo);
    }

    pub fn set_go_idle_response(&self, r1: u8) {
        self.0.borrow_mut().go_idle_response = Some(r1);
    }

    pub fn set_data_response(&self, token: u8) {
        self.0.borrow_mut().data_response = Some(token);
    }

    /// Report an unfinished power up in the OCR.
    pub fn set_power_up_pending(&self, pending: bool) {
        self.0.borrow_mut().power_up_pending = pending;
    }

    pub fn set_stuck_busy(&self, busy: bool) {
        self.0.borrow_mut().stuck_busy = busy;
    }

    /// Do not answer the next `cmd`.
    pub fn ignore_next(&self, cmd: u8) {
        self.0.borrow_mut().ignore_next = Some(cmd);
    }

    /// Fail every transfer after `count` more bytes.
    pub fn fail_after(&self, count: usize) {
        let mut state = self.0.borrow_mut();
        state.fail_after = Some(state.transfers + count);
    }

    pub fn speed(&self) -> Option<Speed> {
        self.0.borrow().speed
    }

    pub fn transfers(&self) -> usize {
        self.0.borrow().transfers
    }

    pub fn delayed_ms(&self) -> u32 {
        self.0.borrow().delayed_ms
    }

    pub fn command_count(&self, cmd: u8) -> usize {
        self.0
            .borrow()
            .commands
            .iter()
            .filter(|(index, _)| *index == cmd & 0x3F)
            .count()
    }

    pub fn saw_command(&self, cmd: u8) -> bool {
        self.command_count(cmd) > 0
    }

    pub fn last_argument(&self, cmd: u8) -> Option<u32> {
        self.0
            .borrow()
            .commands
            .iter()
            .rev()
            .find(|(index, _)| *index == cmd & 0x3F)
            .map(|(_, arg)| *arg)
    }

    pub fn sector(&self, sector: u32) -> Option<[u8; BLOCK_SIZE]> {
        self.0.borrow().sectors.get(&sector).copied()
    }

    pub fn cs_balanced(&self) -> bool {
        SimSelect(self.0.clone()).is_balanced()
    }
}

/// Chip select of the simulated card.
pub struct SimSelect(Rc<RefCell<SimState>>);

impl OutputSwitch for SimSelect {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        state.nested_select |= state.selected;
        state.selected = true;
        state.asserts += 1;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        if state.selected {
            state.selected = false;
            state.deasserts += 1;
        }
        Ok(())
    }
}

impl SimSelect {
    pub fn asserts(&self) -> usize {
        self.0.borrow().asserts
    }

    /// Every assert was matched by a deassert, without nesting.
    pub fn is_balanced(&self) -> bool {
        let state = self.0.borrow();
        !state.selected && !state.nested_select && state.asserts == state.deasserts
    }
}

/// Delay recording the elapsed milliseconds.
pub struct SimDelay(Rc<RefCell<SimState>>);

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().delayed_ms += ms;
    }
}
