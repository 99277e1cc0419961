//! Downlink controller (§4.5): builds a server-originated command frame,
//! writes it to a registered device's socket, and correlates the reply by
//! serial with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::codec::{FrameCodec, OP_COMMAND};
use crate::metrics::Metrics;
use crate::registry::{next_command_serial, ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CutOil,
    RestoreOil,
    GetLocation,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::CutOil => "CUT_OIL",
            Command::RestoreOil => "RESTORE_OIL",
            Command::GetLocation => "GET_LOCATION",
        }
    }
}

impl std::str::FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUT_OIL" => Ok(Command::CutOil),
            "RESTORE_OIL" => Ok(Command::RestoreOil),
            "GET_LOCATION" => Ok(Command::GetLocation),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownlinkReply {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error("device not connected")]
    NotConnected,
    #[error("downlink command timed out waiting for a reply")]
    Timeout,
    #[error("socket write failed: {0}")]
    Io(String),
}

pub struct DownlinkController {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl DownlinkController {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<Metrics>, timeout: Duration) -> Self {
        Self { registry, metrics, timeout }
    }

    pub async fn send(&self, imei: &str, command: Command) -> Result<DownlinkReply, DownlinkError> {
        let write = self.registry.get(imei).ok_or(DownlinkError::NotConnected)?;
        let pending = self
            .registry
            .get_pending_replies(imei)
            .ok_or(DownlinkError::NotConnected)?;

        let serial = next_command_serial();
        let frame = FrameCodec::build_frame(serial, OP_COMMAND, command.as_str().as_bytes());

        let (tx, rx) = oneshot::channel();
        pending.insert(serial, tx);

        {
            let mut guard = write.lock().await;
            if let Err(e) = guard.write_all(&frame).await {
                pending.remove(&serial);
                return Err(DownlinkError::Io(e.to_string()));
            }
        }
        self.metrics.downlink_sent();
        info!(imei, command = command.as_str(), serial, "downlink command sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(raw)) => Ok(parse_reply(&raw)),
            Ok(Err(_)) => {
                // Sender dropped (session torn down) without replying.
                self.metrics.downlink_timeout();
                Err(DownlinkError::Io("session closed before reply".into()))
            }
            Err(_) => {
                pending.remove(&serial);
                self.metrics.downlink_timeout();
                warn!(imei, command = command.as_str(), serial, "downlink command timed out");
                Err(DownlinkError::Timeout)
            }
        }
    }
}

fn parse_reply(raw: &[u8]) -> DownlinkReply {
    let Some((_, _, payload)) = FrameCodec::parse_frame(raw) else {
        return DownlinkReply { success: false, message: "malformed reply frame".into() };
    };
    let text = String::from_utf8_lossy(&payload);
    match text.split_once(':') {
        Some(("OK", rest)) => DownlinkReply { success: true, message: rest.to_string() },
        Some(("ERR", rest)) => DownlinkReply { success: false, message: rest.to_string() },
        _ => DownlinkReply { success: !payload.is_empty() && payload[0] != 0, message: text.into_owned() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_str() {
        for c in [Command::CutOil, Command::RestoreOil, Command::GetLocation] {
            let parsed: Command = c.as_str().parse().unwrap();
            assert_eq!(parsed, c);
        }
    }

    #[test]
    fn unknown_command_string_fails_to_parse() {
        assert!("DO_A_BARREL_ROLL".parse::<Command>().is_err());
    }

    #[test]
    fn parse_reply_reads_ok_prefixed_payload() {
        let frame = FrameCodec::build_frame(7, OP_COMMAND, b"OK:cut");
        let reply = parse_reply(&frame);
        assert!(reply.success);
        assert_eq!(reply.message, "cut");
    }

    #[test]
    fn parse_reply_reads_err_prefixed_payload() {
        let frame = FrameCodec::build_frame(7, OP_COMMAND, b"ERR:busy");
        let reply = parse_reply(&frame);
        assert!(!reply.success);
        assert_eq!(reply.message, "busy");
    }
}
