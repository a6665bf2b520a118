//! anpx-core: the ANPX framing protocol.
//!
//! Provides the wire-frame model (24-byte header + TLV body), CRC-32
//! discipline, an encoder with transparent chunking, a decoder with chunk
//! reassembly, and the HTTP metadata types carried in JSON TLVs.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod frame;
pub mod http;

// Re-export commonly used items at crate root.
pub use chunk::ChunkAssembler;
pub use codec::{Decoder, Encoder, DEFAULT_CHUNK_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    salvage_request_id, Frame, FrameBuilder, FrameHeader, MessageType, TlvField, TlvTag,
};
pub use http::{strip_hop_by_hop, HttpMeta, RespMeta};
