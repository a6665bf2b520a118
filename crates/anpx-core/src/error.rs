use thiserror::Error;

/// Errors produced by the ANPX protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported version: {0:#04x}")]
    BadVersion(u8),

    #[error("unknown message type: {0:#04x}")]
    BadMessageType(u8),

    #[error("header CRC mismatch")]
    HeaderCrcMismatch,

    #[error("body CRC mismatch")]
    BodyCrcMismatch,

    #[error("truncated frame: {0}")]
    TruncatedFrame(String),

    #[error("bad TLV: {0}")]
    BadTlv(String),

    #[error("duplicate chunk index {0}")]
    DuplicateChunkIndex(u32),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("reassembly buffer expired")]
    ReassemblyTimeout,

    #[error("bad metadata JSON: {0}")]
    BadMeta(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether this error indicates a corrupted stream.
    ///
    /// Fatal errors require the containing tunnel to be closed; the rest
    /// fail only the request the offending frame belonged to.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMagic(_)
                | ProtocolError::BadVersion(_)
                | ProtocolError::BadMessageType(_)
                | ProtocolError::HeaderCrcMismatch
                | ProtocolError::BodyCrcMismatch
                | ProtocolError::TruncatedFrame(_)
        )
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
