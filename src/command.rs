use crate::{consts::commands, crc::crc7};

/// Length of a command frame on the wire.
pub const COMMAND_FRAME_LEN: usize = 6;

/// Command frame: start bits with index, big-endian argument, CRC-7 with stop bit.
pub type CommandFrame = [u8; COMMAND_FRAME_LEN];

/// Build the frame of command `cmd` (index, ACMD flag is ignored) with argument `arg`.
pub fn build_command(cmd: u8, arg: u32) -> CommandFrame {
    let [a3, a2, a1, a0] = arg.to_be_bytes();
    let mut frame = [commands::CMD_BASE | (commands::index(cmd) & 0x3F), a3, a2, a1, a0, 0];
    let crc_index = frame.len() - 1;

    frame[crc_index] = (crc7(&frame[..crc_index]) << 1) | 0x01;

    frame
}
