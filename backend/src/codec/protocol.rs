//! GT06 wire-level constants: opcodes, markers, and the CRC used to
//! validate every frame.

use crc::{Crc, CRC_16_IBM_SDLC};

/// CRC-ITU (aka CRC-16/X-25, aka CRC-16/IBM-SDLC): poly 0x1021 reflected,
/// init 0xFFFF, refin/refout, xorout 0xFFFF. GT06 devices compute this over
/// `length || protocol || payload || serial`.
pub const GT06_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

pub const START_SHORT: [u8; 2] = [0x78, 0x78];
pub const START_LONG: [u8; 2] = [0x79, 0x79];
pub const STOP: [u8; 2] = [0x0D, 0x0A];

/// Minimum frame length: 2 start + 1 length + (1 protocol + 2 serial + 2 crc) + 2 stop.
pub const MIN_SHORT_FRAME: usize = 2 + 1 + 5 + 2;

/// Opcode for a GT06 terminal login.
pub const OP_LOGIN: u8 = 0x01;
/// Location (GPS + LBS), no status tail.
pub const OP_GPS_LBS: u8 = 0x12;
/// Heartbeat / pure status information.
pub const OP_STATUS_INFO: u8 = 0x13;
/// GPS + LBS + full status tail.
pub const OP_GPS_LBS_STATUS: u8 = 0x16;
/// GPS + LBS, "data" variant (extended location report).
pub const OP_GPS_LBS_DATA: u8 = 0x22;
/// Information-transmission / string packet (e.g. text command echo).
pub const OP_STRING_INFO: u8 = 0x21;
/// Alarm data: GPS + LBS + status tail + explicit alarm type/code.
pub const OP_ALARM_DATA: u8 = 0x26;
/// GPS + LBS with one trailing status byte (no voltage/gsm fields).
pub const OP_GPS_LBS_STATUS_A0: u8 = 0xA0;
/// Server-originated command / device-originated command reply (§4.5,
/// §4.9). Not part of the inbound telemetry opcode table in §4.1 — the
/// codec decodes an inbound frame on this opcode as `Protocol::Other` like
/// any other unrecognized opcode, and the session handler alone gives it
/// meaning by correlating its serial against a pending downlink reply.
pub const OP_COMMAND: u8 = 0x80;

/// Compute the CRC-ITU checksum over the given bytes.
pub fn crc16(data: &[u8]) -> u16 {
    GT06_CRC.checksum(data)
}
