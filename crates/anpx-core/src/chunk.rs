//! Chunk reassembly for ANPX messages.
//!
//! Chunks of one logical message share a request id and are ordered by the
//! `chunk_index` TLV; arrival order is unconstrained. A sequence completes
//! when `chunk_total` frames have been seen or a `final_chunk` marker has
//! arrived and every preceding index is present.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, FrameBuilder, MessageType, TlvTag};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// In-progress reassembly state for one request id.
#[derive(Debug)]
struct Buffer {
    message_type: MessageType,
    slices: BTreeMap<u32, Vec<u8>>,
    meta_json: Option<String>,
    total: Option<u32>,
    final_index: Option<u32>,
    body_crc: u32,
    last_update: Instant,
}

impl Buffer {
    /// Index of the last chunk, once known from either signal.
    fn end_index(&self) -> Option<u32> {
        self.total
            .map(|t| t.saturating_sub(1))
            .or(self.final_index)
    }

    fn is_complete(&self) -> bool {
        match self.end_index() {
            Some(end) => self.slices.len() as u64 == u64::from(end) + 1,
            None => false,
        }
    }
}

/// Assembles chunked frames into complete logical messages.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffers: HashMap<String, Buffer>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one chunk. Returns the assembled logical frame when the
    /// sequence completes, `None` while chunks are still outstanding.
    ///
    /// On any error the buffer for that request id is discarded; the caller
    /// is expected to fail the associated request.
    pub fn add_chunk(&mut self, request_id: &str, chunk: &Frame) -> ProtocolResult<Option<Frame>> {
        match self.merge(request_id, chunk) {
            Ok(true) => match self.buffers.remove(request_id) {
                Some(buffer) => Ok(Some(assemble(request_id, buffer)?)),
                None => Ok(None),
            },
            Ok(false) => Ok(None),
            Err(e) => {
                self.buffers.remove(request_id);
                Err(e)
            }
        }
    }

    fn merge(&mut self, request_id: &str, chunk: &Frame) -> ProtocolResult<bool> {
        let index = chunk
            .chunk_index()?
            .ok_or_else(|| ProtocolError::BadTlv("chunked frame missing chunk_index".into()))?;

        let buffer = self
            .buffers
            .entry(request_id.to_string())
            .or_insert_with(|| Buffer {
                message_type: chunk.message_type(),
                slices: BTreeMap::new(),
                meta_json: None,
                total: None,
                final_index: None,
                body_crc: chunk.header().body_crc,
                last_update: Instant::now(),
            });
        buffer.last_update = Instant::now();

        if let Some(total) = chunk.chunk_total()? {
            buffer.total = Some(total);
        }
        if chunk.is_final_chunk() {
            buffer.final_index = Some(index);
        }

        if let Some(end) = buffer.end_index() {
            if index > end {
                return Err(ProtocolError::ChunkIndexOutOfRange {
                    index,
                    total: end + 1,
                });
            }
            if let Some(&highest) = buffer.slices.keys().next_back() {
                if highest > end {
                    return Err(ProtocolError::ChunkIndexOutOfRange {
                        index: highest,
                        total: end + 1,
                    });
                }
            }
        }

        if buffer.slices.contains_key(&index) {
            return Err(ProtocolError::DuplicateChunkIndex(index));
        }

        // Meta travels on exactly one chunk of the sequence.
        let meta_tag = match buffer.message_type {
            MessageType::Response => TlvTag::RespMeta,
            _ => TlvTag::HttpMeta,
        };
        if let Some(field) = chunk.fields().iter().find(|f| f.tag == meta_tag as u8) {
            let json = std::str::from_utf8(&field.value)
                .map_err(|_| ProtocolError::BadTlv("meta TLV is not UTF-8".into()))?;
            buffer.meta_json = Some(json.to_string());
        }

        let slice = chunk.http_body().unwrap_or_default().to_vec();
        buffer.slices.insert(index, slice);

        Ok(buffer.is_complete())
    }

    /// Drop buffers idle longer than `ttl`, returning their request ids so
    /// the caller can fail any request that depended on them.
    pub fn sweep(&mut self, ttl: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.buffers.retain(|request_id, buffer| {
            if buffer.last_update.elapsed() > ttl {
                expired.push(request_id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Number of in-progress reassemblies.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

/// Concatenate slices in index order, verify the logical-body CRC, and
/// produce the equivalent non-chunked frame.
fn assemble(request_id: &str, buffer: Buffer) -> ProtocolResult<Frame> {
    let mut body = Vec::new();
    for slice in buffer.slices.values() {
        body.extend_from_slice(slice);
    }

    if crc32fast::hash(&body) != buffer.body_crc {
        return Err(ProtocolError::BodyCrcMismatch);
    }

    let meta_json = buffer
        .meta_json
        .ok_or_else(|| ProtocolError::BadTlv("chunk sequence carried no metadata".into()))?;
    let meta_tag = match buffer.message_type {
        MessageType::Response => TlvTag::RespMeta,
        _ => TlvTag::HttpMeta,
    };

    let mut builder = FrameBuilder::new(buffer.message_type)
        .str_field(TlvTag::RequestId, request_id)
        .str_field(meta_tag, &meta_json);
    if !body.is_empty() {
        builder = builder.bytes_field(TlvTag::HttpBody, body);
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn chunk(
        request_id: &str,
        index: u32,
        total: Option<u32>,
        final_chunk: bool,
        slice: &[u8],
        body_crc: u32,
        with_meta: bool,
    ) -> Frame {
        let mut b = FrameBuilder::new(MessageType::Request)
            .chunked()
            .str_field(TlvTag::RequestId, request_id)
            .u32_field(TlvTag::ChunkIndex, index);
        if let Some(total) = total {
            b = b.u32_field(TlvTag::ChunkTotal, total);
        }
        if with_meta {
            b = b.str_field(
                TlvTag::HttpMeta,
                r#"{"method":"POST","path":"/up","headers":{},"query":{}}"#,
            );
        }
        if !slice.is_empty() {
            b = b.bytes_field(TlvTag::HttpBody, slice.to_vec());
        }
        if final_chunk {
            b = b.bytes_field(TlvTag::FinalChunk, vec![0x01]);
        }
        b.finish_with_body_crc(body_crc)
    }

    #[test]
    fn in_order_assembly() {
        let body = b"abcdef".to_vec();
        let crc = crc32fast::hash(&body);
        let mut asm = ChunkAssembler::new();

        assert!(asm
            .add_chunk("r", &chunk("r", 0, Some(2), false, b"abc", crc, false))
            .unwrap()
            .is_none());
        let done = asm
            .add_chunk("r", &chunk("r", 1, Some(2), true, b"def", crc, true))
            .unwrap()
            .expect("complete");
        assert_eq!(done.http_body().unwrap(), body.as_slice());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn out_of_order_assembly() {
        let body = b"abcdef".to_vec();
        let crc = crc32fast::hash(&body);
        let mut asm = ChunkAssembler::new();

        assert!(asm
            .add_chunk("r", &chunk("r", 1, Some(2), true, b"def", crc, true))
            .unwrap()
            .is_none());
        let done = asm
            .add_chunk("r", &chunk("r", 0, Some(2), false, b"abc", crc, false))
            .unwrap()
            .expect("complete");
        assert_eq!(done.http_body().unwrap(), body.as_slice());
    }

    #[test]
    fn final_marker_without_total() {
        let body = b"xyz".to_vec();
        let crc = crc32fast::hash(&body);
        let mut asm = ChunkAssembler::new();

        assert!(asm
            .add_chunk("r", &chunk("r", 0, None, false, b"xy", crc, false))
            .unwrap()
            .is_none());
        let done = asm
            .add_chunk("r", &chunk("r", 1, None, true, b"z", crc, true))
            .unwrap()
            .expect("complete");
        assert_eq!(done.http_body().unwrap(), body.as_slice());
    }

    #[test]
    fn duplicate_index_discards_buffer() {
        let crc = crc32fast::hash(b"ab");
        let mut asm = ChunkAssembler::new();
        asm.add_chunk("r", &chunk("r", 0, Some(2), false, b"a", crc, false))
            .unwrap();
        let err = asm
            .add_chunk("r", &chunk("r", 0, Some(2), false, b"a", crc, false))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateChunkIndex(0)));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn index_out_of_range() {
        let crc = crc32fast::hash(b"ab");
        let mut asm = ChunkAssembler::new();
        let err = asm
            .add_chunk("r", &chunk("r", 5, Some(2), false, b"a", crc, false))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ChunkIndexOutOfRange { index: 5, .. }
        ));
    }

    #[test]
    fn corrupt_logical_body_detected() {
        let body = b"abcdef".to_vec();
        let crc = crc32fast::hash(&body);
        let mut asm = ChunkAssembler::new();
        asm.add_chunk("r", &chunk("r", 0, Some(2), false, b"abc", crc, false))
            .unwrap();
        let err = asm
            .add_chunk("r", &chunk("r", 1, Some(2), true, b"dXf", crc, true))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BodyCrcMismatch));
    }

    #[test]
    fn sweep_expires_idle_buffers() {
        let crc = crc32fast::hash(b"ab");
        let mut asm = ChunkAssembler::new();
        asm.add_chunk("r", &chunk("r", 0, Some(2), false, b"a", crc, false))
            .unwrap();
        assert_eq!(asm.sweep(Duration::from_secs(300)), Vec::<String>::new());
        assert_eq!(asm.sweep(Duration::ZERO), vec!["r".to_string()]);
        assert_eq!(asm.pending(), 0);
    }
}
