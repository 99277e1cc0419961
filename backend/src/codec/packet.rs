//! Decoded GT06 packet types — the output of [`super::FrameCodec::add_bytes`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag identifying which opcode produced a [`DecodedPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Login,
    GpsLbs,
    GpsLbsStatus,
    GpsLbsData,
    GpsLbsStatusA0,
    StatusInfo,
    AlarmData,
    Heartbeat,
    StringInfo,
    /// Reserved/unrecognized opcode; raw bytes are preserved, never persisted.
    Other(u8),
}

impl Protocol {
    /// The raw wire opcode this tag was decoded from (for building replies).
    pub fn opcode(self) -> u8 {
        use super::protocol::*;
        match self {
            Protocol::Login => OP_LOGIN,
            Protocol::GpsLbs => OP_GPS_LBS,
            Protocol::GpsLbsStatus => OP_GPS_LBS_STATUS,
            Protocol::GpsLbsData => OP_GPS_LBS_DATA,
            Protocol::GpsLbsStatusA0 => OP_GPS_LBS_STATUS_A0,
            Protocol::StatusInfo => OP_STATUS_INFO,
            Protocol::AlarmData => OP_ALARM_DATA,
            Protocol::Heartbeat => OP_STATUS_INFO,
            Protocol::StringInfo => OP_STRING_INFO,
            Protocol::Other(op) => op,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnitionState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageInfo {
    pub level: u8,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GsmSignalInfo {
    pub level: u8,
    pub status: &'static str,
}

/// Decoded `0x13` status/heartbeat bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusFields {
    pub ignition: IgnitionState,
    pub charger: bool,
    pub gps_tracking: bool,
    pub oil_electricity: bool,
    pub device_status: u8,
    pub voltage: VoltageInfo,
    pub gsm_signal: GsmSignalInfo,
}

/// Decoded cell-tower (LBS) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbsFields {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
}

/// Decoded GPS block (timestamp, fix, coordinates, speed/course).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFields {
    pub gps_time: DateTime<Utc>,
    pub satellites: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: u8,
    pub course: u16,
    pub real_time: bool,
    pub positioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmFields {
    pub active: bool,
    pub alarm_type: u8,
    pub alarm_code: u8,
}

/// The fully decoded form of one inbound GT06 frame.
///
/// Every field beyond `protocol`, `serial`, `raw`, and `needs_response`
/// is optional, per the wire layout that opcode carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedPacket {
    pub protocol: Protocol,
    pub serial: u16,
    pub raw: Vec<u8>,
    pub needs_response: bool,

    pub terminal_id: Option<String>,
    pub gps: Option<GpsFields>,
    pub lbs: Option<LbsFields>,
    pub status: Option<StatusFields>,
    pub alarm: Option<AlarmFields>,
}

impl DecodedPacket {
    pub fn has_coordinates(&self) -> bool {
        self.gps.is_some()
    }
}
