//! ANPX wire-frame model.
//!
//! Wire format: `[24-byte header][TLV body]`
//!
//! Header layout (all integers big-endian):
//! - bytes 0..4   magic `"ANPX"`
//! - byte  4      version (0x01)
//! - byte  5      message type
//! - byte  6      flags (bit 0 = chunked)
//! - byte  7      reserved (0x00)
//! - bytes 8..12  total length (header + body)
//! - bytes 12..16 CRC-32 of header bytes 0..12
//! - bytes 16..20 CRC-32 of the body
//! - bytes 20..24 zero padding
//!
//! The body is a sequence of TLV triples: 1-byte tag, 4-byte big-endian
//! length, value bytes. Unknown tags are skipped by length without error.

use crate::error::{ProtocolError, ProtocolResult};
use crate::http::{HttpMeta, RespMeta};

pub const MAGIC: [u8; 4] = *b"ANPX";
pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 24;
pub const FLAG_CHUNKED: u8 = 0x01;

/// Per-TLV overhead: tag byte plus 4-byte length.
pub const TLV_OVERHEAD: usize = 5;

/// ANPX message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0x01 => Ok(MessageType::Request),
            0x02 => Ok(MessageType::Response),
            0xFF => Ok(MessageType::Error),
            other => Err(ProtocolError::BadMessageType(other)),
        }
    }
}

/// Recognized TLV tags. Unknown tags survive decoding as raw fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvTag {
    RequestId = 0x01,
    HttpMeta = 0x02,
    HttpBody = 0x03,
    RespMeta = 0x04,
    ChunkIndex = 0x0A,
    ChunkTotal = 0x0B,
    FinalChunk = 0x0C,
}

/// A single tag-length-value field. The tag is kept raw so unrecognized
/// tags pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvField {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl TlvField {
    pub fn new(tag: TlvTag, value: Vec<u8>) -> Self {
        Self {
            tag: tag as u8,
            value,
        }
    }

    /// Serialized size including the tag/length prefix.
    pub fn wire_len(&self) -> usize {
        TLV_OVERHEAD + self.value.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.value);
    }
}

/// Parse a TLV body into fields. Unknown tags are retained verbatim.
pub fn parse_tlv_body(body: &[u8]) -> ProtocolResult<Vec<TlvField>> {
    let mut fields = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        if body.len() - offset < TLV_OVERHEAD {
            return Err(ProtocolError::BadTlv(format!(
                "truncated TLV header at offset {offset}"
            )));
        }
        let tag = body[offset];
        let len = u32::from_be_bytes([
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
            body[offset + 4],
        ]) as usize;
        offset += TLV_OVERHEAD;

        if body.len() - offset < len {
            return Err(ProtocolError::BadTlv(format!(
                "TLV value overruns body: tag {tag:#04x}, len {len}"
            )));
        }
        fields.push(TlvField {
            tag,
            value: body[offset..offset + len].to_vec(),
        });
        offset += len;
    }

    Ok(fields)
}

/// Best-effort request-id extraction from a frame that failed full
/// decoding. Chunk-level errors leave the TLV structure intact, so the id
/// is normally recoverable and the failure can be scoped to one request.
pub fn salvage_request_id(data: &[u8]) -> Option<String> {
    let header = FrameHeader::decode(data).ok()?;
    let total = (header.total_length as usize).min(data.len());
    let body = data.get(HEADER_SIZE..total)?;
    let fields = parse_tlv_body(body).ok()?;
    fields
        .iter()
        .find(|f| f.tag == TlvTag::RequestId as u8)
        .and_then(|f| std::str::from_utf8(&f.value).ok())
        .map(str::to_string)
}

/// ANPX fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub flags: u8,
    pub total_length: u32,
    pub header_crc: u32,
    pub body_crc: u32,
}

impl FrameHeader {
    pub fn is_chunked(&self) -> bool {
        self.flags & FLAG_CHUNKED != 0
    }

    /// Encode to 24 bytes, recomputing the header CRC over bytes 0..12.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5] = self.message_type as u8;
        buf[6] = self.flags;
        buf[7] = 0; // reserved
        buf[8..12].copy_from_slice(&self.total_length.to_be_bytes());
        let header_crc = crc32fast::hash(&buf[..12]);
        buf[12..16].copy_from_slice(&header_crc.to_be_bytes());
        buf[16..20].copy_from_slice(&self.body_crc.to_be_bytes());
        buf
    }

    /// Decode and validate 24 header bytes (magic, version, header CRC).
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedFrame(format!(
                "{} bytes, need {HEADER_SIZE} for header",
                data.len()
            )));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        if data[4] != VERSION {
            return Err(ProtocolError::BadVersion(data[4]));
        }

        let header_crc = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        if crc32fast::hash(&data[..12]) != header_crc {
            return Err(ProtocolError::HeaderCrcMismatch);
        }

        let message_type = MessageType::from_u8(data[5])?;
        let total_length = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let body_crc = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

        Ok(Self {
            message_type,
            flags: data[6],
            total_length,
            header_crc,
            body_crc,
        })
    }
}

/// A complete ANPX frame: immutable once built.
///
/// All mutation (adding fields, sizing, CRC computation) happens in
/// [`FrameBuilder`]; by the time a `Frame` exists its header lengths and
/// checksums are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    fields: Vec<TlvField>,
}

impl Frame {
    pub(crate) fn from_parts(header: FrameHeader, fields: Vec<TlvField>) -> Self {
        Self { header, fields }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn is_chunked(&self) -> bool {
        self.header.is_chunked()
    }

    pub fn fields(&self) -> &[TlvField] {
        &self.fields
    }

    fn field(&self, tag: TlvTag) -> Option<&TlvField> {
        self.fields.iter().find(|f| f.tag == tag as u8)
    }

    fn field_str(&self, tag: TlvTag) -> ProtocolResult<Option<&str>> {
        match self.field(tag) {
            None => Ok(None),
            Some(f) => std::str::from_utf8(&f.value)
                .map(Some)
                .map_err(|_| ProtocolError::BadTlv(format!("tag {:#04x} is not UTF-8", tag as u8))),
        }
    }

    fn field_u32(&self, tag: TlvTag) -> ProtocolResult<Option<u32>> {
        match self.field(tag) {
            None => Ok(None),
            Some(f) => {
                let bytes: [u8; 4] = f.value.as_slice().try_into().map_err(|_| {
                    ProtocolError::BadTlv(format!(
                        "tag {:#04x} expects 4 bytes, got {}",
                        tag as u8,
                        f.value.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
        }
    }

    pub fn request_id(&self) -> ProtocolResult<Option<&str>> {
        self.field_str(TlvTag::RequestId)
    }

    pub fn http_meta(&self) -> ProtocolResult<Option<HttpMeta>> {
        match self.field_str(TlvTag::HttpMeta)? {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
        }
    }

    pub fn resp_meta(&self) -> ProtocolResult<Option<RespMeta>> {
        match self.field_str(TlvTag::RespMeta)? {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
        }
    }

    pub fn http_body(&self) -> Option<&[u8]> {
        self.field(TlvTag::HttpBody).map(|f| f.value.as_slice())
    }

    pub fn chunk_index(&self) -> ProtocolResult<Option<u32>> {
        self.field_u32(TlvTag::ChunkIndex)
    }

    pub fn chunk_total(&self) -> ProtocolResult<Option<u32>> {
        self.field_u32(TlvTag::ChunkTotal)
    }

    pub fn is_final_chunk(&self) -> bool {
        self.field(TlvTag::FinalChunk)
            .map(|f| f.value.as_slice() == [0x01])
            .unwrap_or(false)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.total_length as usize);
        out.extend_from_slice(&self.header.encode());
        for field in &self.fields {
            field.encode_into(&mut out);
        }
        out
    }
}

/// Builder that assembles TLV fields, then freezes into a [`Frame`] with
/// `total_length` and both CRCs filled in.
#[derive(Debug)]
pub struct FrameBuilder {
    message_type: MessageType,
    chunked: bool,
    fields: Vec<TlvField>,
}

impl FrameBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            chunked: false,
            fields: Vec::new(),
        }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn str_field(mut self, tag: TlvTag, value: &str) -> Self {
        self.fields
            .push(TlvField::new(tag, value.as_bytes().to_vec()));
        self
    }

    pub fn bytes_field(mut self, tag: TlvTag, value: Vec<u8>) -> Self {
        self.fields.push(TlvField::new(tag, value));
        self
    }

    /// Add a field under a raw tag byte (reserved or experimental tags).
    pub fn bytes_field_raw(mut self, tag: u8, value: Vec<u8>) -> Self {
        self.fields.push(TlvField { tag, value });
        self
    }

    pub fn u32_field(mut self, tag: TlvTag, value: u32) -> Self {
        self.fields
            .push(TlvField::new(tag, value.to_be_bytes().to_vec()));
        self
    }

    fn body_len(&self) -> usize {
        self.fields.iter().map(TlvField::wire_len).sum()
    }

    fn finish_inner(self, body_crc: Option<u32>) -> Frame {
        let total_length = (HEADER_SIZE + self.body_len()) as u32;
        let body_crc = body_crc.unwrap_or_else(|| {
            let mut buf = Vec::with_capacity(self.body_len());
            for field in &self.fields {
                field.encode_into(&mut buf);
            }
            crc32fast::hash(&buf)
        });

        let mut header = FrameHeader {
            message_type: self.message_type,
            flags: if self.chunked { FLAG_CHUNKED } else { 0 },
            total_length,
            header_crc: 0,
            body_crc,
        };
        // Freeze the header CRC now so decode(encode(f)) sees stable bytes.
        let encoded = header.encode();
        header.header_crc = u32::from_be_bytes([encoded[12], encoded[13], encoded[14], encoded[15]]);

        Frame::from_parts(header, self.fields)
    }

    /// Freeze into a frame, computing the body CRC over this frame's own
    /// TLV body (non-chunked frames).
    pub fn finish(self) -> Frame {
        self.finish_inner(None)
    }

    /// Freeze into a frame carrying an externally computed body CRC.
    ///
    /// Chunk frames all carry the CRC of the complete logical body rather
    /// than of their own slice.
    pub fn finish_with_body_crc(self, body_crc: u32) -> Frame {
        self.finish_inner(Some(body_crc))
    }
}
