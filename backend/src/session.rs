//! Per-connection session handler (§4.2): owns one accepted TCP socket and
//! drives the login -> data -> teardown state machine described there.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec::{FrameCodec, Protocol};
use crate::config::Settings;
use crate::contracts::Contracts;
use crate::error::IngestError;
use crate::metrics::Metrics;
use crate::pipeline::IngestPipeline;
use crate::registry::{next_session_id, ConnectionRegistry, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingLogin,
    Authorized,
    Closing,
}

/// Drives one accepted socket end to end. Returns once the session has
/// torn itself down (read error, EOF, idle timeout, or failed login).
#[tracing::instrument(skip(stream, registry, contracts, pipeline, settings, metrics), fields(%remote_addr, imei = tracing::field::Empty))]
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    contracts: Contracts,
    pipeline: Arc<IngestPipeline>,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
) {
    metrics.session_opened();
    let session_id = next_session_id();
    let (mut read_half, write_half) = tokio::io::split(stream);
    let write = Arc::new(Mutex::new(write_half));
    let pending_replies = Arc::new(DashMap::new());

    let mut state = SessionState::AwaitingLogin;
    let mut codec = FrameCodec::new();
    let mut imei: Option<String> = None;
    let mut buf = vec![0u8; 4096];

    loop {
        if state == SessionState::Closing {
            break;
        }

        let n = match tokio::time::timeout(settings.read_timeout, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => {
                info!("connection closed by peer");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                let err = IngestError::Io(e);
                warn!(error = %err, "read error, tearing down session");
                break;
            }
            Err(_) => {
                info!("idle timeout, tearing down session");
                break;
            }
        };

        let outcome = codec.add_bytes(&buf[..n]);
        for err in &outcome.errors {
            match err {
                crate::codec::CodecError::Framing => metrics.frame_framing_error(),
                crate::codec::CodecError::Crc => metrics.frame_crc_error(),
                crate::codec::CodecError::Decode { .. } => metrics.frame_decode_error(),
            }
            warn!(error = %err, "codec error, frame dropped");
        }

        for packet in outcome.packets {
            metrics.frame_decoded();

            match state {
                SessionState::AwaitingLogin => {
                    if packet.protocol != Protocol::Login {
                        // Decoded but not dispatched; no IMEI bound yet (§4.2).
                        continue;
                    }
                    let Some(terminal_id) = packet.terminal_id.as_deref() else {
                        continue;
                    };
                    let candidate = &terminal_id[..terminal_id.len().min(15)];
                    if !contracts.registry.is_registered(candidate).await {
                        metrics.login_rejected();
                        let err = IngestError::Unauthorized;
                        info!(imei = candidate, error = %err, "login rejected, unregistered terminal");
                        state = SessionState::Closing;
                        break;
                    }

                    metrics.login_accepted();
                    tracing::Span::current().record("imei", &candidate);
                    imei = Some(candidate.to_string());

                    let handle = SessionHandle {
                        session_id,
                        remote_addr,
                        connected_since: contracts.clock.now(),
                        write: write.clone(),
                        pending_replies: pending_replies.clone(),
                    };
                    registry.register(candidate.to_string(), handle);

                    let reply = FrameCodec::build_response(packet.serial, packet.protocol.opcode());
                    if let Err(e) = write_reply(&write, &reply).await {
                        let err = IngestError::Io(e);
                        warn!(error = %err, "failed to write login reply");
                        state = SessionState::Closing;
                        break;
                    }
                    state = SessionState::Authorized;
                    info!(imei = candidate, "session authorized");
                }
                SessionState::Authorized => {
                    let current_imei = imei.as_deref().expect("authorized without imei");

                    if let Some(tx) = pending_replies.remove(&packet.serial).map(|(_, tx)| tx) {
                        let _ = tx.send(packet.raw.clone());
                    } else {
                        pipeline.process(current_imei, &packet).await;
                    }

                    if packet.needs_response {
                        let reply = FrameCodec::build_response(packet.serial, packet.protocol.opcode());
                        if let Err(e) = write_reply(&write, &reply).await {
                            let err = IngestError::Io(e);
                            warn!(error = %err, "failed to write reply");
                            state = SessionState::Closing;
                            break;
                        }
                    }
                }
                SessionState::Closing => break,
            }
        }
    }

    if let Some(imei) = imei {
        registry.unregister(&imei, session_id);
    }
    metrics.session_closed();
}

async fn write_reply(write: &Arc<Mutex<tokio::io::WriteHalf<TcpStream>>>, frame: &[u8]) -> std::io::Result<()> {
    let mut guard = write.lock().await;
    guard.write_all(frame).await
}
