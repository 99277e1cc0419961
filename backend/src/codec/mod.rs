//! The GT06 frame codec: turns a byte stream into [`DecodedPacket`]s and
//! builds the acknowledgement frames the device expects back.
//!
//! One [`FrameCodec`] is owned exclusively by a single session: its byte
//! accumulator is session-private state with no cross-connection sharing
//! and no re-entrancy requirement.

mod decode;
mod error;
mod packet;
mod protocol;

pub use error::CodecError;
pub use packet::{
    AlarmFields, DecodedPacket, GpsFields, GsmSignalInfo, IgnitionState, LbsFields, Protocol,
    StatusFields, VoltageInfo,
};
pub use protocol::{crc16, OP_ALARM_DATA, OP_COMMAND, OP_LOGIN, STOP};

use protocol::{
    MIN_SHORT_FRAME, OP_GPS_LBS, OP_GPS_LBS_DATA, OP_GPS_LBS_STATUS, OP_GPS_LBS_STATUS_A0,
    OP_STATUS_INFO, OP_STRING_INFO, START_LONG, START_SHORT,
};

/// Result of one [`FrameCodec::add_bytes`] call: zero or more decoded
/// packets, plus zero or more non-fatal codec errors encountered while
/// resyncing or rejecting malformed/corrupt frames.
#[derive(Debug, Default)]
pub struct AddBytesOutcome {
    pub packets: Vec<DecodedPacket>,
    pub errors: Vec<CodecError>,
}

/// Session-private byte accumulator and packet decoder.
#[derive(Debug, Default)]
pub struct FrameCodec {
    accumulator: Vec<u8>,
}

enum StartMarker {
    Short,
    Long,
}

fn find_start(buf: &[u8]) -> Option<(usize, StartMarker)> {
    let mut i = 0;
    while i + 2 <= buf.len() {
        if buf[i..i + 2] == START_SHORT {
            return Some((i, StartMarker::Short));
        }
        if buf[i..i + 2] == START_LONG {
            return Some((i, StartMarker::Long));
        }
        i += 1;
    }
    None
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read bytes and extract every complete frame now
    /// available. Partial trailing bytes are kept for the next call.
    pub fn add_bytes(&mut self, chunk: &[u8]) -> AddBytesOutcome {
        self.accumulator.extend_from_slice(chunk);
        let mut out = AddBytesOutcome::default();

        loop {
            let Some((start_idx, marker)) = find_start(&self.accumulator) else {
                // No marker at all (or only a lone trailing 0x78/0x79): keep at
                // most the last byte, in case it's the first half of a marker
                // that completes on the next call.
                if self.accumulator.len() > 1 {
                    let keep_from = self.accumulator.len() - 1;
                    self.accumulator.drain(0..keep_from);
                }
                break;
            };

            if start_idx > 0 {
                // Resync: silently discard garbage preceding the marker.
                self.accumulator.drain(0..start_idx);
            }

            let len_bytes = match marker {
                StartMarker::Short => 1,
                StartMarker::Long => 2,
            };
            let header_len = 2 + len_bytes;
            if self.accumulator.len() < header_len {
                break; // need more data to even read the length field
            }

            let payload_and_tail_len = match marker {
                StartMarker::Short => self.accumulator[2] as usize,
                StartMarker::Long => {
                    u16::from_be_bytes([self.accumulator[2], self.accumulator[3]]) as usize
                }
            };
            let total_len = 2 + len_bytes + payload_and_tail_len + 2;

            if self.accumulator.len() < total_len {
                break; // frame incomplete, wait for more bytes
            }
            if payload_and_tail_len < 5 {
                // protocol(1) + serial(2) + crc(2) is the minimum; anything
                // shorter can't be a real frame — drop the marker byte and
                // resync rather than looping forever on garbage.
                out.errors.push(CodecError::Framing);
                self.accumulator.drain(0..1);
                continue;
            }

            let frame = &self.accumulator[..total_len];
            if frame[total_len - 2..total_len] != STOP {
                out.errors.push(CodecError::Framing);
                self.accumulator.drain(0..1);
                continue;
            }

            let crc_region_end = total_len - 4; // exclude crc(2) + stop(2)
            let computed = crc16(&frame[2..crc_region_end]);
            let received = u16::from_be_bytes([frame[crc_region_end], frame[crc_region_end + 1]]);
            if computed != received {
                out.errors.push(CodecError::Crc);
                self.accumulator.drain(0..total_len);
                continue;
            }

            let protocol_idx = header_len;
            let opcode = frame[protocol_idx];
            let payload_start = protocol_idx + 1;
            let payload_len = payload_and_tail_len - 5;
            let payload = &frame[payload_start..payload_start + payload_len];
            let serial_idx = payload_start + payload_len;
            let serial = u16::from_be_bytes([frame[serial_idx], frame[serial_idx + 1]]);
            let raw = frame.to_vec();

            match decode_opcode(opcode, serial, payload, raw) {
                Ok(packet) => out.packets.push(packet),
                Err(e) => out.errors.push(e),
            }

            self.accumulator.drain(0..total_len);
        }

        out
    }

    /// Build a short-form frame carrying `payload` for `serial`/`opcode`.
    /// The plain acknowledgement (`build_response`) is the empty-payload
    /// case; the downlink controller (§4.5) uses this directly to wrap a
    /// command string.
    pub fn build_frame(serial: u16, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let length = (1 + payload.len() + 2 + 2) as u8; // protocol + payload + serial + crc
        let mut body = Vec::with_capacity(1 + payload.len() + 2);
        body.push(length);
        body.push(opcode);
        body.extend_from_slice(payload);
        body.extend_from_slice(&serial.to_be_bytes());
        let crc = crc16(&body);

        let mut frame = Vec::with_capacity(MIN_SHORT_FRAME + payload.len());
        frame.extend_from_slice(&START_SHORT);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&STOP);
        frame
    }

    /// Build the short-form acknowledgement frame for `serial`/`opcode`.
    pub fn build_response(serial: u16, opcode: u8) -> Vec<u8> {
        Self::build_frame(serial, opcode, &[])
    }

    /// Parse a previously-built response frame back into `(serial, opcode)`,
    /// used by downlink command correlation and by the codec's own tests.
    pub fn parse_response(frame: &[u8]) -> Option<(u16, u8)> {
        if frame.len() != MIN_SHORT_FRAME || frame[0..2] != START_SHORT {
            return None;
        }
        let length = frame[2] as usize;
        if length != 5 {
            return None;
        }
        if frame[frame.len() - 2..] != STOP {
            return None;
        }
        let crc_region = &frame[2..frame.len() - 4];
        let computed = crc16(crc_region);
        let received = u16::from_be_bytes([frame[frame.len() - 4], frame[frame.len() - 3]]);
        if computed != received {
            return None;
        }
        let opcode = frame[3];
        let serial = u16::from_be_bytes([frame[4], frame[5]]);
        Some((serial, opcode))
    }

    /// Parse any complete short-form frame (arbitrary payload length) into
    /// `(serial, opcode, payload)`. Used to pull the ASCII result payload
    /// back out of a `DecodedPacket::raw` for downlink correlation (§4.5),
    /// where `parse_response` can't help because the reply carries a body.
    pub fn parse_frame(frame: &[u8]) -> Option<(u16, u8, Vec<u8>)> {
        if frame.len() < MIN_SHORT_FRAME || frame[0..2] != START_SHORT {
            return None;
        }
        let length = frame[2] as usize;
        let total_len = 2 + 1 + length + 2;
        if frame.len() != total_len || length < 5 {
            return None;
        }
        if frame[frame.len() - 2..] != STOP {
            return None;
        }
        let crc_region = &frame[2..frame.len() - 4];
        let computed = crc16(crc_region);
        let received = u16::from_be_bytes([frame[frame.len() - 4], frame[frame.len() - 3]]);
        if computed != received {
            return None;
        }
        let opcode = frame[3];
        let payload_len = length - 5;
        let payload = frame[4..4 + payload_len].to_vec();
        let serial_idx = 4 + payload_len;
        let serial = u16::from_be_bytes([frame[serial_idx], frame[serial_idx + 1]]);
        Some((serial, opcode, payload))
    }
}

fn decode_opcode(
    opcode: u8,
    serial: u16,
    payload: &[u8],
    raw: Vec<u8>,
) -> Result<DecodedPacket, CodecError> {
    let base = |protocol: Protocol, needs_response: bool| DecodedPacket {
        protocol,
        serial,
        raw: raw.clone(),
        needs_response,
        terminal_id: None,
        gps: None,
        lbs: None,
        status: None,
        alarm: None,
    };

    match opcode {
        OP_LOGIN => {
            let terminal_id = decode::decode_terminal_id(payload, opcode)?;
            Ok(DecodedPacket {
                terminal_id: Some(terminal_id),
                ..base(Protocol::Login, true)
            })
        }
        OP_STATUS_INFO => {
            let status = decode::decode_status_info(payload)?;
            Ok(DecodedPacket {
                status: Some(status),
                ..base(Protocol::StatusInfo, true)
            })
        }
        OP_GPS_LBS => {
            let d = decode::decode_gps_lbs(payload)?;
            Ok(DecodedPacket {
                gps: Some(d.gps),
                lbs: Some(d.lbs),
                ..base(Protocol::GpsLbs, true)
            })
        }
        OP_GPS_LBS_DATA => {
            let d = decode::decode_gps_lbs_data(payload)?;
            Ok(DecodedPacket {
                gps: Some(d.gps),
                lbs: Some(d.lbs),
                ..base(Protocol::GpsLbsData, true)
            })
        }
        OP_GPS_LBS_STATUS_A0 => {
            let d = decode::decode_gps_lbs_status_a0(payload)?;
            let status = decode::decode_status_info(&[d.status_byte, 0, 0, 0, 0]).ok();
            Ok(DecodedPacket {
                gps: Some(d.gps),
                lbs: Some(d.lbs),
                status,
                ..base(Protocol::GpsLbsStatusA0, true)
            })
        }
        OP_GPS_LBS_STATUS => {
            let d = decode::decode_gps_lbs_status(payload)?;
            Ok(DecodedPacket {
                gps: Some(d.gps),
                lbs: Some(d.lbs),
                status: Some(d.status),
                ..base(Protocol::GpsLbsStatus, true)
            })
        }
        OP_ALARM_DATA => {
            let d = decode::decode_alarm(payload)?;
            Ok(DecodedPacket {
                gps: Some(d.gps),
                lbs: Some(d.lbs),
                status: Some(d.status),
                alarm: Some(d.alarm),
                ..base(Protocol::AlarmData, true)
            })
        }
        OP_STRING_INFO => Ok(base(Protocol::StringInfo, true)),
        other => Ok(base(Protocol::Other(other), false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bcd(n: u8) -> u8 {
        ((n / 10) << 4) | (n % 10)
    }

    fn build_frame(opcode: u8, payload: &[u8], serial: u16) -> Vec<u8> {
        let length = (1 + payload.len() + 2 + 2) as u8;
        let mut body = Vec::new();
        body.push(length);
        body.push(opcode);
        body.extend_from_slice(payload);
        body.extend_from_slice(&serial.to_be_bytes());
        let crc = crc16(&body);

        let mut frame = Vec::new();
        frame.extend_from_slice(&START_SHORT);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&STOP);
        frame
    }

    fn login_frame(serial: u16) -> Vec<u8> {
        let payload = [0x03, 0x51, 0x09, 0x13, 0x34, 0x80, 0x24, 0x39];
        build_frame(OP_LOGIN, &payload, serial)
    }

    #[test]
    fn decodes_a_complete_login_frame_in_one_call() {
        let mut codec = FrameCodec::new();
        let frame = login_frame(1);
        let outcome = codec.add_bytes(&frame);
        assert_eq!(outcome.packets.len(), 1);
        assert!(outcome.errors.is_empty());
        let p = &outcome.packets[0];
        assert_eq!(p.protocol, Protocol::Login);
        assert_eq!(p.serial, 1);
        assert_eq!(p.terminal_id.as_deref(), Some("0351091334802439"));
        assert!(p.needs_response);
    }

    #[test]
    fn response_frame_round_trips() {
        let frame = FrameCodec::build_response(42, OP_LOGIN);
        let (serial, opcode) = FrameCodec::parse_response(&frame).unwrap();
        assert_eq!(serial, 42);
        assert_eq!(opcode, OP_LOGIN);
        // CRC in the built frame must itself verify.
        let crc_region = &frame[2..frame.len() - 4];
        let received = u16::from_be_bytes([frame[frame.len() - 4], frame[frame.len() - 3]]);
        assert_eq!(crc16(crc_region), received);
    }

    #[test]
    fn idempotent_under_arbitrary_split() {
        let mut whole = Vec::new();
        whole.extend_from_slice(&login_frame(1));
        whole.extend_from_slice(&login_frame(2));

        let mut one_shot = FrameCodec::new();
        let all_at_once = one_shot.add_bytes(&whole).packets;

        for split in [1usize, 5, 17, 19, whole.len() - 1] {
            let mut codec = FrameCodec::new();
            let (a, b) = whole.split_at(split.min(whole.len()));
            let mut got = codec.add_bytes(a).packets;
            got.extend(codec.add_bytes(b).packets);
            assert_eq!(got.len(), all_at_once.len(), "split at {split}");
            for (g, expected) in got.iter().zip(all_at_once.iter()) {
                assert_eq!(g.serial, expected.serial);
                assert_eq!(g.terminal_id, expected.terminal_id);
            }
        }
    }

    #[test]
    fn crc_corruption_is_dropped_and_does_not_wedge_the_stream() {
        let mut bad = login_frame(1);
        // Flip a payload byte so the CRC no longer matches.
        bad[5] ^= 0xFF;
        let good = login_frame(2);

        let mut stream = Vec::new();
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&good);

        let mut codec = FrameCodec::new();
        let outcome = codec.add_bytes(&stream);
        assert_eq!(outcome.packets.len(), 1);
        assert_eq!(outcome.packets[0].serial, 2);
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e, CodecError::Crc)));
    }

    #[test]
    fn garbage_prefix_is_discarded_before_resync() {
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&login_frame(7));
        let mut codec = FrameCodec::new();
        let outcome = codec.add_bytes(&stream);
        assert_eq!(outcome.packets.len(), 1);
        assert_eq!(outcome.packets[0].serial, 7);
    }

    #[test]
    fn unknown_opcode_is_tagged_other_and_not_acked() {
        let frame = build_frame(0x99, &[0x01, 0x02], 3);
        let mut codec = FrameCodec::new();
        let outcome = codec.add_bytes(&frame);
        assert_eq!(outcome.packets.len(), 1);
        assert_eq!(outcome.packets[0].protocol, Protocol::Other(0x99));
        assert!(!outcome.packets[0].needs_response);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let frame = login_frame(9);
        let mut codec = FrameCodec::new();
        let (head, tail) = frame.split_at(frame.len() - 3);
        let outcome = codec.add_bytes(head);
        assert!(outcome.packets.is_empty());
        let outcome = codec.add_bytes(tail);
        assert_eq!(outcome.packets.len(), 1);
    }

    #[test]
    fn gps_lbs_status_decodes_full_status_tail() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[bcd(24), bcd(1), bcd(15), bcd(10), bcd(30), bcd(0)]);
        payload.push(0x07);
        payload.extend_from_slice(&((27.7172f64 * 1_800_000.0) as u32).to_be_bytes());
        payload.extend_from_slice(&((85.3240f64 * 1_800_000.0) as u32).to_be_bytes());
        payload.push(25);
        payload.extend_from_slice(&(0x1000u16 | 90).to_be_bytes());
        payload.extend_from_slice(&[0x02, 0x58]);
        payload.push(1);
        payload.extend_from_slice(&[0x00, 0x2A]);
        payload.extend_from_slice(&[0x00, 0x00, 0x99]);
        payload.extend_from_slice(&[0b0000_0010, 4, 3, 0, 0]);

        let frame = build_frame(OP_GPS_LBS_STATUS, &payload, 11);
        let mut codec = FrameCodec::new();
        let outcome = codec.add_bytes(&frame);
        assert_eq!(outcome.packets.len(), 1);
        let p = &outcome.packets[0];
        assert_eq!(p.protocol, Protocol::GpsLbsStatus);
        assert!(p.gps.is_some());
        assert!(p.status.is_some());
        assert_eq!(p.status.unwrap().ignition, IgnitionState::On);
    }
}
