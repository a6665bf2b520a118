//! ANPX message encoder and decoder.
//!
//! The encoder turns one logical HTTP request/response into one or more
//! wire frames; chunking is invisible to callers. The decoder is the
//! mirror image and owns the reassembly state for its connection.

use crate::chunk::ChunkAssembler;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{
    parse_tlv_body, Frame, FrameBuilder, FrameHeader, MessageType, TlvTag, HEADER_SIZE,
    TLV_OVERHEAD,
};
use crate::http::{HttpMeta, RespMeta};
use std::time::Duration;

/// Default maximum frame size before the body is split into chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Encoder with a fixed chunk-size policy.
#[derive(Debug, Clone)]
pub struct Encoder {
    chunk_size: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Encoder {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Encode an HTTP request into one frame, or a chunk sequence when the
    /// single frame would exceed the chunk size.
    pub fn encode_request(
        &self,
        request_id: &str,
        meta: &HttpMeta,
        body: &[u8],
    ) -> ProtocolResult<Vec<Frame>> {
        let meta_json = serde_json::to_string(meta)?;
        self.encode_message(MessageType::Request, request_id, &meta_json, body)
    }

    /// Encode an HTTP response; same chunking discipline as requests.
    pub fn encode_response(
        &self,
        request_id: &str,
        meta: &RespMeta,
        body: &[u8],
    ) -> ProtocolResult<Vec<Frame>> {
        let meta_json = serde_json::to_string(meta)?;
        self.encode_message(MessageType::Response, request_id, &meta_json, body)
    }

    /// Encode an error frame carrying a UTF-8 diagnostic in the body TLV.
    pub fn encode_error(&self, request_id: Option<&str>, message: &str) -> Frame {
        let mut builder = FrameBuilder::new(MessageType::Error);
        if let Some(request_id) = request_id {
            builder = builder.str_field(TlvTag::RequestId, request_id);
        }
        builder
            .bytes_field(TlvTag::HttpBody, message.as_bytes().to_vec())
            .finish()
    }

    fn encode_message(
        &self,
        message_type: MessageType,
        request_id: &str,
        meta_json: &str,
        body: &[u8],
    ) -> ProtocolResult<Vec<Frame>> {
        let meta_tag = match message_type {
            MessageType::Response => TlvTag::RespMeta,
            _ => TlvTag::HttpMeta,
        };

        let single_size = HEADER_SIZE
            + TLV_OVERHEAD
            + request_id.len()
            + TLV_OVERHEAD
            + meta_json.len()
            + if body.is_empty() {
                0
            } else {
                TLV_OVERHEAD + body.len()
            };

        if body.is_empty() || single_size <= self.chunk_size {
            let mut builder = FrameBuilder::new(message_type)
                .str_field(TlvTag::RequestId, request_id)
                .str_field(meta_tag, meta_json);
            if !body.is_empty() {
                builder = builder.bytes_field(TlvTag::HttpBody, body.to_vec());
            }
            return Ok(vec![builder.finish()]);
        }

        // Chunked: the body splits into ceil(len / chunk_size) slices, each
        // frame repeating the CRC of the complete logical body. Meta and the
        // final-chunk marker ride only on the last frame.
        let total = body.len().div_ceil(self.chunk_size) as u32;
        let body_crc = crc32fast::hash(body);
        let mut frames = Vec::with_capacity(total as usize);

        for (index, slice) in body.chunks(self.chunk_size).enumerate() {
            let index = index as u32;
            let mut builder = FrameBuilder::new(message_type)
                .chunked()
                .str_field(TlvTag::RequestId, request_id)
                .u32_field(TlvTag::ChunkIndex, index)
                .u32_field(TlvTag::ChunkTotal, total)
                .bytes_field(TlvTag::HttpBody, slice.to_vec());
            if index == total - 1 {
                builder = builder
                    .str_field(meta_tag, meta_json)
                    .bytes_field(TlvTag::FinalChunk, vec![0x01]);
            }
            frames.push(builder.finish_with_body_crc(body_crc));
        }

        Ok(frames)
    }
}

/// Decoder holding the per-connection reassembly state.
#[derive(Debug, Default)]
pub struct Decoder {
    assembler: ChunkAssembler,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one wire frame.
    ///
    /// Returns the logical frame, or `None` when the frame was a chunk of a
    /// still-incomplete sequence. Fatal errors (see
    /// [`ProtocolError::is_fatal`]) mean the stream is corrupt and the
    /// connection must be torn down.
    pub fn decode(&mut self, data: &[u8]) -> ProtocolResult<Option<Frame>> {
        let header = FrameHeader::decode(data)?;

        if data.len() != header.total_length as usize {
            return Err(ProtocolError::TruncatedFrame(format!(
                "{} bytes, header claims {}",
                data.len(),
                header.total_length
            )));
        }

        let body = &data[HEADER_SIZE..];
        if !header.is_chunked() && crc32fast::hash(body) != header.body_crc {
            return Err(ProtocolError::BodyCrcMismatch);
        }

        let fields = parse_tlv_body(body)?;
        let frame = Frame::from_parts(header, fields);

        if !frame.is_chunked() {
            return Ok(Some(frame));
        }

        let request_id = frame
            .request_id()?
            .ok_or_else(|| ProtocolError::BadTlv("chunked frame missing request_id".into()))?
            .to_string();
        self.assembler.add_chunk(&request_id, &frame)
    }

    /// Drop reassembly buffers idle longer than `ttl`; returns the request
    /// ids whose buffers were discarded.
    pub fn sweep(&mut self, ttl: Duration) -> Vec<String> {
        self.assembler.sweep(ttl)
    }

    /// Number of chunk sequences still being reassembled.
    pub fn pending_reassemblies(&self) -> usize {
        self.assembler.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request_meta() -> HttpMeta {
        HttpMeta {
            method: "POST".into(),
            path: "/upload".into(),
            headers: BTreeMap::from([("content-type".into(), "application/octet-stream".into())]),
            query: BTreeMap::new(),
        }
    }

    fn decode_all(frames: &[Frame]) -> Option<Frame> {
        let mut decoder = Decoder::new();
        let mut result = None;
        for frame in frames {
            if let Some(done) = decoder.decode(&frame.encode()).unwrap() {
                assert!(result.is_none(), "more than one logical frame");
                result = Some(done);
            }
        }
        result
    }

    fn assert_round_trip(body: &[u8], chunk_size: usize) {
        let encoder = Encoder::new(chunk_size);
        let frames = encoder
            .encode_request("11111111-2222-3333-4444-555555555555", &request_meta(), body)
            .unwrap();
        let logical = decode_all(&frames).expect("complete message");

        assert_eq!(
            logical.request_id().unwrap(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(logical.http_meta().unwrap().unwrap(), request_meta());
        assert_eq!(logical.http_body().unwrap_or_default(), body);
    }

    #[test]
    fn round_trip_across_chunk_sizes() {
        let body: Vec<u8> = (0u32..2000).map(|i| (i % 251) as u8).collect();
        for chunk_size in [1, 7, 64, 251, 1024, 2000, 65536] {
            assert_round_trip(&body, chunk_size);
        }
    }

    #[test]
    fn empty_body_is_single_frame() {
        let encoder = Encoder::new(64);
        let frames = encoder.encode_request("r", &request_meta(), b"").unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_chunked());
        assert_round_trip(b"", 64);
    }

    #[test]
    fn body_equal_to_chunk_size() {
        let body = vec![0xABu8; 256];
        let encoder = Encoder::new(256);
        let frames = encoder.encode_request("r", &request_meta(), &body).unwrap();
        // The TLV overhead pushes a full-chunk-size body over the limit.
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_chunked());
        assert_round_trip(&body, 256);
    }

    #[test]
    fn body_one_over_chunk_size() {
        let body = vec![0xCDu8; 257];
        let encoder = Encoder::new(256);
        let frames = encoder.encode_request("r", &request_meta(), &body).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].chunk_index().unwrap(), Some(0));
        assert_eq!(frames[1].chunk_index().unwrap(), Some(1));
        assert_eq!(frames[0].chunk_total().unwrap(), Some(2));
        assert!(frames[1].is_final_chunk());
        assert_round_trip(&body, 256);
    }

    #[test]
    fn two_hundred_kib_body_makes_four_chunks() {
        let body = vec![0x42u8; 200 * 1024];
        let encoder = Encoder::new(64 * 1024);
        let frames = encoder.encode_request("r", &request_meta(), &body).unwrap();
        assert_eq!(frames.len(), 4);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.chunk_index().unwrap(), Some(i as u32));
            assert_eq!(frame.chunk_total().unwrap(), Some(4));
        }
        assert!(frames[3].is_final_chunk());
        assert_round_trip(&body, 64 * 1024);
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 1 {
            return vec![vec![0]];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for pos in 0..n {
                let mut perm: Vec<usize> = rest.iter().map(|&x| x + 1).collect();
                perm.insert(pos, 0);
                out.push(perm);
            }
        }
        out
    }

    #[test]
    fn chunk_arrival_order_is_irrelevant() {
        let body: Vec<u8> = (0u16..700).map(|i| (i % 256) as u8).collect();
        let encoder = Encoder::new(256);
        let frames = encoder.encode_request("r", &request_meta(), &body).unwrap();
        assert_eq!(frames.len(), 3);

        for perm in permutations(frames.len()) {
            let ordered: Vec<Frame> = perm.iter().map(|&i| frames[i].clone()).collect();
            let logical = decode_all(&ordered).expect("complete in any order");
            assert_eq!(logical.http_body().unwrap(), body.as_slice());
            assert_eq!(logical.http_meta().unwrap().unwrap(), request_meta());
        }
    }

    #[test]
    fn response_round_trip() {
        let meta = RespMeta {
            status: 200,
            reason: "OK".into(),
            headers: BTreeMap::from([("content-type".into(), "application/json".into())]),
        };
        let frames = Encoder::default()
            .encode_response("r", &meta, br#"{"ok":true}"#)
            .unwrap();
        assert_eq!(frames.len(), 1);
        let logical = decode_all(&frames).unwrap();
        assert_eq!(logical.message_type(), MessageType::Response);
        assert_eq!(logical.resp_meta().unwrap().unwrap(), meta);
        assert_eq!(logical.http_body().unwrap(), br#"{"ok":true}"#);
    }

    #[test]
    fn body_bit_flips_are_detected() {
        let frames = Encoder::default()
            .encode_request("r", &request_meta(), b"payload bytes")
            .unwrap();
        let bytes = frames[0].encode();

        for byte in HEADER_SIZE..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[byte] ^= 0x10;
            let mut decoder = Decoder::new();
            let err = decoder.decode(&corrupted).unwrap_err();
            assert!(
                matches!(err, ProtocolError::BodyCrcMismatch),
                "byte {byte}: {err}"
            );
        }
    }

    #[test]
    fn header_bit_flips_are_detected() {
        let frames = Encoder::default()
            .encode_request("r", &request_meta(), b"payload")
            .unwrap();
        let bytes = frames[0].encode();

        for byte in 5..12 {
            let mut corrupted = bytes.clone();
            corrupted[byte] ^= 0x01;
            let mut decoder = Decoder::new();
            let err = decoder.decode(&corrupted).unwrap_err();
            assert!(matches!(err, ProtocolError::HeaderCrcMismatch));
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn truncated_frame_rejected() {
        let frames = Encoder::default()
            .encode_request("r", &request_meta(), b"payload")
            .unwrap();
        let bytes = frames[0].encode();
        let mut decoder = Decoder::new();
        let err = decoder.decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame(_)));
    }

    #[test]
    fn unknown_tlv_tags_are_skipped() {
        // Hand-build a frame interleaving unknown tags with known ones.
        let meta_json = serde_json::to_string(&request_meta()).unwrap();
        let frame = FrameBuilder::new(MessageType::Request)
            .bytes_field_raw(0x55, b"ignore me".to_vec())
            .str_field(TlvTag::RequestId, "r")
            .bytes_field_raw(0xF3, vec![1, 2, 3])
            .str_field(TlvTag::HttpMeta, &meta_json)
            .bytes_field(TlvTag::HttpBody, b"data".to_vec())
            .finish();

        let mut decoder = Decoder::new();
        let logical = decoder.decode(&frame.encode()).unwrap().unwrap();
        assert_eq!(logical.request_id().unwrap(), Some("r"));
        assert_eq!(logical.http_body().unwrap(), b"data");
    }

    #[test]
    fn error_frame_carries_request_id_and_message() {
        let frame = Encoder::default().encode_error(Some("r-9"), "queue full");
        let mut decoder = Decoder::new();
        let logical = decoder.decode(&frame.encode()).unwrap().unwrap();
        assert_eq!(logical.message_type(), MessageType::Error);
        assert_eq!(logical.request_id().unwrap(), Some("r-9"));
        assert_eq!(logical.http_body().unwrap(), b"queue full");
    }

    #[test]
    fn reassembly_sweep_reports_expired_request() {
        let body = vec![0u8; 600];
        let encoder = Encoder::new(256);
        let frames = encoder.encode_request("slow", &request_meta(), &body).unwrap();

        let mut decoder = Decoder::new();
        decoder.decode(&frames[0].encode()).unwrap();
        assert_eq!(decoder.pending_reassemblies(), 1);
        assert_eq!(decoder.sweep(Duration::ZERO), vec!["slow".to_string()]);
        assert_eq!(decoder.pending_reassemblies(), 0);
    }
}
