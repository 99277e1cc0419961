use thiserror::Error;

/// Errors the codec can report for a single frame. These never kill a
/// session — the caller logs them, counts them, and keeps reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("byte stream out of sync, resyncing at next start marker")]
    Framing,
    #[error("frame failed CRC-ITU validation")]
    Crc,
    #[error("frame parsed but payload malformed for opcode 0x{opcode:02X}: {reason}")]
    Decode { opcode: u8, reason: String },
}
