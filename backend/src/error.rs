//! Top-level error taxonomy. The codec's [`CodecError`](crate::codec::CodecError)
//! is frame-local and never escapes a session by itself — the session
//! handler widens it into an [`IngestError`] only where §7 calls for
//! propagation (teardown, timeout, contract failure).

use thiserror::Error;

use crate::codec::CodecError;
use crate::contracts::ContractError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),

    #[error("login for unregistered terminal, closing session")]
    Unauthorized,

    #[error("gps record rejected: {reason}")]
    Reject { reason: RejectReason },

    #[error("socket io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("downlink command timed out waiting for a reply")]
    Timeout,

    #[error("external collaborator error: {0}")]
    External(#[from] ContractError),
}

/// Why a GPS or status record was dropped by the ingest pipeline (§4.3).
/// Never surfaced to the device; logged and counted only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingCoordinates,
    OutOfRegion,
    NoSatelliteFix,
    UnpositionedLowSatellites,
    DuplicateWithinRadius,
    ErraticJump,
    StatusUnchanged,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::MissingCoordinates => "missing coordinates",
            RejectReason::OutOfRegion => "outside configured geo-fence",
            RejectReason::NoSatelliteFix => "no satellite fix",
            RejectReason::UnpositionedLowSatellites => "unpositioned with too few satellites",
            RejectReason::DuplicateWithinRadius => "duplicate within dedup radius",
            RejectReason::ErraticJump => "erratic jump beyond threshold",
            RejectReason::StatusUnchanged => "status unchanged within debounce window",
        };
        f.write_str(s)
    }
}
