//! Per-opcode payload decoding.
//!
//! Bit-position note: the east/west and north/south hemisphere bits live in
//! the same 16-bit word as the course. Course itself is a 10-bit quantity
//! occupying bits 0-9, so the hemisphere flags sit immediately above it at
//! bits 10 (EW) and 11 (NS) — the positions a real terminal capture
//! confirms. Clear means east / north; set means west / south.

use chrono::{TimeZone, Utc};

use super::error::CodecError;
use super::packet::{
    AlarmFields, GpsFields, GsmSignalInfo, IgnitionState, LbsFields, StatusFields, VoltageInfo,
};
use super::protocol::*;

const GPS_BLOCK_LEN: usize = 26; // 6 ts + 1 sat + 4 lat + 4 lng + 1 speed + 2 course + (2+1+2+3) lbs
const STATUS_TAIL_LEN: usize = 5; // 1 status + 1 voltage + 1 gsm + 2 reserved

fn bcd_digit(byte: u8) -> Result<(u8, u8), ()> {
    let hi = byte >> 4;
    let lo = byte & 0x0F;
    if hi > 9 || lo > 9 {
        return Err(());
    }
    Ok((hi, lo))
}

/// Decode an 8-byte BCD terminal ID into its (up to 16) decimal digits.
pub fn decode_terminal_id(payload: &[u8], opcode: u8) -> Result<String, CodecError> {
    if payload.len() < 8 {
        return Err(CodecError::Decode {
            opcode,
            reason: format!("login payload too short: {} bytes", payload.len()),
        });
    }
    let mut s = String::with_capacity(16);
    for &b in &payload[..8] {
        let (hi, lo) = bcd_digit(b).map_err(|_| CodecError::Decode {
            opcode,
            reason: "non-BCD byte in terminal id".into(),
        })?;
        s.push((b'0' + hi) as char);
        s.push((b'0' + lo) as char);
    }
    Ok(s)
}

fn decode_bcd_timestamp(b: &[u8], opcode: u8) -> Result<chrono::DateTime<Utc>, CodecError> {
    let mut digits = [0u8; 6];
    for i in 0..6 {
        let (hi, lo) = bcd_digit(b[i]).map_err(|_| CodecError::Decode {
            opcode,
            reason: "non-BCD byte in gps timestamp".into(),
        })?;
        digits[i] = hi * 10 + lo;
    }
    let year = 2000 + digits[0] as i32;
    let (month, day, hour, minute, second) = (
        digits[1] as u32,
        digits[2] as u32,
        digits[3] as u32,
        digits[4] as u32,
        digits[5] as u32,
    );
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| CodecError::Decode {
            opcode,
            reason: format!(
                "invalid gps timestamp {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ),
        })
}

/// Shared GPS+LBS block parser for the `0x12`/`0x16`/`0x22`/`0x26`/`0xA0` family.
///
/// Returns the decoded fields plus the LBS block, and the number of bytes
/// consumed (always [`GPS_BLOCK_LEN`] on success).
fn decode_gps_block(
    payload: &[u8],
    opcode: u8,
) -> Result<(GpsFields, LbsFields), CodecError> {
    if payload.len() < GPS_BLOCK_LEN {
        return Err(CodecError::Decode {
            opcode,
            reason: format!(
                "gps+lbs block too short: need {GPS_BLOCK_LEN}, have {}",
                payload.len()
            ),
        });
    }

    let gps_time = decode_bcd_timestamp(&payload[0..6], opcode)?;
    let sat_byte = payload[6];
    let satellites = sat_byte & 0x0F;

    let lat_raw = u32::from_be_bytes([payload[7], payload[8], payload[9], payload[10]]);
    let lng_raw = u32::from_be_bytes([payload[11], payload[12], payload[13], payload[14]]);
    let speed = payload[15];
    let course_status = u16::from_be_bytes([payload[16], payload[17]]);

    let mut latitude = lat_raw as f64 / 1_800_000.0;
    let mut longitude = lng_raw as f64 / 1_800_000.0;

    // Bit 10 = east/west, bit 11 = north/south; clear means east / north.
    // See the module-level note on this choice.
    if course_status & 0x0400 != 0 {
        longitude = -longitude;
    }
    if course_status & 0x0800 != 0 {
        latitude = -latitude;
    }
    let positioned = course_status & 0x1000 != 0;
    let real_time = course_status & 0x2000 != 0;
    let course = course_status & 0x03FF;

    let mcc = u16::from_be_bytes([payload[18], payload[19]]);
    let mnc = payload[20];
    let lac = u16::from_be_bytes([payload[21], payload[22]]);
    let cell_id = u32::from_be_bytes([0, payload[23], payload[24], payload[25]]);

    Ok((
        GpsFields {
            gps_time,
            satellites,
            latitude,
            longitude,
            speed,
            course,
            real_time,
            positioned,
        },
        LbsFields {
            mcc,
            mnc,
            lac,
            cell_id,
        },
    ))
}

fn decode_status_byte(b: u8) -> (IgnitionState, bool, bool, bool, u8) {
    let ignition = if b & 0x02 != 0 {
        IgnitionState::On
    } else {
        IgnitionState::Off
    };
    let charger = b & 0x04 != 0;
    let gps_tracking = b & 0x40 != 0;
    let oil_electricity = b & 0x80 != 0;
    (ignition, charger, gps_tracking, oil_electricity, b)
}

fn voltage_status(level: u8) -> &'static str {
    match level {
        0 => "no_power",
        1..=2 => "low",
        3..=4 => "medium",
        _ => "high",
    }
}

fn gsm_status(level: u8) -> &'static str {
    match level {
        0 => "no_signal",
        1 => "weak",
        2..=3 => "good",
        _ => "strong",
    }
}

fn decode_status_tail(tail: &[u8]) -> StatusFields {
    let (ignition, charger, gps_tracking, oil_electricity, device_status) =
        decode_status_byte(tail[0]);
    let voltage_level = tail[1];
    let gsm_level = tail[2];
    StatusFields {
        ignition,
        charger,
        gps_tracking,
        oil_electricity,
        device_status,
        voltage: VoltageInfo {
            level: voltage_level,
            status: voltage_status(voltage_level),
        },
        gsm_signal: GsmSignalInfo {
            level: gsm_level,
            status: gsm_status(gsm_level),
        },
    }
}

pub struct GpsLbsDecode {
    pub gps: GpsFields,
    pub lbs: LbsFields,
}

pub fn decode_gps_lbs(payload: &[u8]) -> Result<GpsLbsDecode, CodecError> {
    let (gps, lbs) = decode_gps_block(payload, OP_GPS_LBS)?;
    Ok(GpsLbsDecode { gps, lbs })
}

pub fn decode_gps_lbs_data(payload: &[u8]) -> Result<GpsLbsDecode, CodecError> {
    let (gps, lbs) = decode_gps_block(payload, OP_GPS_LBS_DATA)?;
    Ok(GpsLbsDecode { gps, lbs })
}

pub struct GpsLbsStatusA0Decode {
    pub gps: GpsFields,
    pub lbs: LbsFields,
    pub status_byte: u8,
}

pub fn decode_gps_lbs_status_a0(payload: &[u8]) -> Result<GpsLbsStatusA0Decode, CodecError> {
    let (gps, lbs) = decode_gps_block(payload, OP_GPS_LBS_STATUS_A0)?;
    if payload.len() < GPS_BLOCK_LEN + 1 {
        return Err(CodecError::Decode {
            opcode: OP_GPS_LBS_STATUS_A0,
            reason: "missing trailing status byte".into(),
        });
    }
    Ok(GpsLbsStatusA0Decode {
        gps,
        lbs,
        status_byte: payload[GPS_BLOCK_LEN],
    })
}

pub struct GpsLbsStatusDecode {
    pub gps: GpsFields,
    pub lbs: LbsFields,
    pub status: StatusFields,
}

pub fn decode_gps_lbs_status(payload: &[u8]) -> Result<GpsLbsStatusDecode, CodecError> {
    let (gps, lbs) = decode_gps_block(payload, OP_GPS_LBS_STATUS)?;
    let tail_start = GPS_BLOCK_LEN;
    if payload.len() < tail_start + STATUS_TAIL_LEN {
        return Err(CodecError::Decode {
            opcode: OP_GPS_LBS_STATUS,
            reason: "missing status tail".into(),
        });
    }
    let status = decode_status_tail(&payload[tail_start..tail_start + STATUS_TAIL_LEN]);
    Ok(GpsLbsStatusDecode { gps, lbs, status })
}

pub struct AlarmDecode {
    pub gps: GpsFields,
    pub lbs: LbsFields,
    pub status: StatusFields,
    pub alarm: AlarmFields,
}

pub fn decode_alarm(payload: &[u8]) -> Result<AlarmDecode, CodecError> {
    let (gps, lbs) = decode_gps_block(payload, OP_ALARM_DATA)?;
    let tail_start = GPS_BLOCK_LEN;
    if payload.len() < tail_start + STATUS_TAIL_LEN + 2 {
        return Err(CodecError::Decode {
            opcode: OP_ALARM_DATA,
            reason: "missing status tail or alarm type/code".into(),
        });
    }
    let status = decode_status_tail(&payload[tail_start..tail_start + STATUS_TAIL_LEN]);
    let alarm_type = payload[tail_start + STATUS_TAIL_LEN];
    let alarm_code = payload[tail_start + STATUS_TAIL_LEN + 1];
    Ok(AlarmDecode {
        gps,
        lbs,
        status,
        alarm: AlarmFields {
            active: true,
            alarm_type,
            alarm_code,
        },
    })
}

pub fn decode_status_info(payload: &[u8]) -> Result<StatusFields, CodecError> {
    if payload.len() < STATUS_TAIL_LEN {
        return Err(CodecError::Decode {
            opcode: OP_STATUS_INFO,
            reason: format!(
                "status payload too short: need {STATUS_TAIL_LEN}, have {}",
                payload.len()
            ),
        });
    }
    Ok(decode_status_tail(&payload[..STATUS_TAIL_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bcd(n: u8) -> u8 {
        ((n / 10) << 4) | (n % 10)
    }

    fn sample_gps_block(lat_deg: f64, lng_deg: f64, ew_west: bool, ns_south: bool) -> Vec<u8> {
        let mut b = Vec::with_capacity(GPS_BLOCK_LEN);
        b.extend_from_slice(&[bcd(24), bcd(1), bcd(15), bcd(10), bcd(30), bcd(0)]); // 2024-01-15 10:30:00
        b.push(0x07); // gps info len nibble unused here, 7 satellites
        let lat_raw = (lat_deg.abs() * 1_800_000.0).round() as u32;
        let lng_raw = (lng_deg.abs() * 1_800_000.0).round() as u32;
        b.extend_from_slice(&lat_raw.to_be_bytes());
        b.extend_from_slice(&lng_raw.to_be_bytes());
        b.push(25); // speed km/h
        let mut course_status: u16 = 90; // course degrees
        course_status |= 0x1000; // positioned
        if ew_west {
            course_status |= 0x0400;
        }
        if ns_south {
            course_status |= 0x0800;
        }
        b.extend_from_slice(&course_status.to_be_bytes());
        b.extend_from_slice(&[0x02, 0x58]); // mcc 600
        b.push(1); // mnc
        b.extend_from_slice(&[0x00, 0x2A]); // lac 42
        b.extend_from_slice(&[0x00, 0x00, 0x99]); // cell id 153
        b
    }

    #[test]
    fn decodes_positive_hemisphere_coordinates() {
        let payload = sample_gps_block(27.7172, 85.3240, false, false);
        let d = decode_gps_lbs(&payload).unwrap();
        assert!((d.gps.latitude - 27.7172).abs() < 1e-4);
        assert!((d.gps.longitude - 85.3240).abs() < 1e-4);
        assert!(d.gps.positioned);
        assert_eq!(d.gps.satellites, 7);
        assert_eq!(d.lbs.mcc, 600);
        assert_eq!(d.lbs.lac, 42);
        assert_eq!(d.lbs.cell_id, 153);
    }

    #[test]
    fn decodes_southern_western_hemisphere_as_negative() {
        let payload = sample_gps_block(27.7172, 85.3240, true, true);
        let d = decode_gps_lbs(&payload).unwrap();
        assert!(d.gps.latitude < 0.0);
        assert!(d.gps.longitude < 0.0);
    }

    #[test]
    fn terminal_id_round_trips_through_bcd() {
        let payload = [0x03, 0x51, 0x09, 0x13, 0x34, 0x80, 0x24, 0x39];
        let id = decode_terminal_id(&payload, OP_LOGIN).unwrap();
        assert_eq!(id, "0351091334802439");
    }

    #[test]
    fn rejects_short_login_payload() {
        let err = decode_terminal_id(&[0x01, 0x02], OP_LOGIN).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn status_tail_decodes_ignition_and_levels() {
        let tail = [0b0000_0010u8, 4, 3, 0x00, 0x00];
        let status = decode_status_info(&tail).unwrap();
        assert_eq!(status.ignition, IgnitionState::On);
        assert_eq!(status.voltage.level, 4);
        assert_eq!(status.voltage.status, "medium");
        assert_eq!(status.gsm_signal.level, 3);
    }

    #[test]
    fn alarm_decode_sets_active_and_carries_type_code() {
        let mut payload = sample_gps_block(27.0, 85.0, false, false);
        payload.extend_from_slice(&[0b0000_0010, 4, 3, 0x00, 0x00]); // status tail
        payload.extend_from_slice(&[0x01, 0x02]); // alarm type, alarm code
        let d = decode_alarm(&payload).unwrap();
        assert!(d.alarm.active);
        assert_eq!(d.alarm.alarm_type, 0x01);
        assert_eq!(d.alarm.alarm_code, 0x02);
    }
}
