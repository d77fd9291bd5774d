//! Chunk-port framing: a JSON header line terminated by `\n`, then the raw payload.
//!
//! Compact JSON never contains a raw newline, so the delimiter cannot occur inside
//! a header. The receiver also accepts the single-message variant in which the
//! header carries the payload as base64 in `data` and nothing follows.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::integrity;

/// Ends the header.
pub const HEADER_DELIMITER: u8 = b'\n';
/// Largest payload a single chunk frame may declare.
pub const MAX_CHUNK_LEN: u64 = 16 * 1024 * 1024; // 16 MiB
/// Largest header accepted; sized for the base64 variant of a maximal chunk.
pub const MAX_HEADER_LEN: usize = 24 * 1024 * 1024;

/// Self-describing chunk metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Payload length in bytes.
    pub chunk_size: u64,
    /// Send time, Unix milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ChunkHeader {
    /// Header for a streamed payload, stamped now and carrying the payload digest.
    pub fn for_payload(file_name: &str, chunk_index: u32, total_chunks: u32, payload: &[u8]) -> Self {
        Self {
            file_name: file_name.to_string(),
            chunk_index,
            total_chunks,
            chunk_size: payload.len() as u64,
            timestamp: Utc::now().timestamp_millis(),
            sha256: Some(integrity::hash_chunk_hex(payload)),
            data: None,
        }
    }
}

/// A fully received chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

/// Error encoding or decoding a chunk frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("header exceeds {} bytes without delimiter", MAX_HEADER_LEN)]
    HeaderTooLong,
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(u64),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload length {got} does not match declared {declared}")]
    LengthMismatch { declared: u64, got: u64 },
    #[error("payload digest mismatch for chunk {index} of {file_name}")]
    DigestMismatch { file_name: String, index: u32 },
    #[error("connection closed before header delimiter")]
    MissingDelimiter,
    #[error("connection closed after {got} of {declared} payload bytes")]
    Truncated { declared: u64, got: u64 },
}

/// Encode a streamed frame: header line plus raw payload bytes.
pub fn encode_chunk_frame(
    file_name: &str,
    chunk_index: u32,
    total_chunks: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() as u64 > MAX_CHUNK_LEN {
        return Err(FrameError::TooLarge(payload.len() as u64));
    }
    let header = ChunkHeader::for_payload(file_name, chunk_index, total_chunks, payload);
    let mut out = serde_json::to_vec(&header)?;
    out.push(HEADER_DELIMITER);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode the single-message variant: payload base64-encoded inside the header.
pub fn encode_inline_chunk_frame(
    file_name: &str,
    chunk_index: u32,
    total_chunks: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() as u64 > MAX_CHUNK_LEN {
        return Err(FrameError::TooLarge(payload.len() as u64));
    }
    let mut header = ChunkHeader::for_payload(file_name, chunk_index, total_chunks, payload);
    header.data = Some(BASE64.encode(payload));
    let mut out = serde_json::to_vec(&header)?;
    out.push(HEADER_DELIMITER);
    Ok(out)
}

enum DecodeState {
    AwaitingHeader,
    AwaitingPayload(ChunkHeader),
    Done,
}

/// Incremental decoder for one chunk connection: `AwaitingHeader -> AwaitingPayload -> Done`.
/// Feed it whatever each read returned.
pub struct ChunkFrameDecoder {
    state: DecodeState,
    buf: Vec<u8>,
    // Prefix of `buf` already known to hold no header delimiter.
    scanned: usize,
}

impl Default for ChunkFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkFrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecodeState::Done)
    }

    /// Append bytes. Returns the frame once the declared payload is complete; bytes after
    /// that are ignored.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<ChunkFrame>, FrameError> {
        if self.is_done() {
            return Ok(None);
        }
        self.buf.extend_from_slice(bytes);
        if let DecodeState::AwaitingHeader = self.state {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == HEADER_DELIMITER);
            let Some(pos) = found.map(|offset| self.scanned + offset) else {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_HEADER_LEN {
                    return Err(FrameError::HeaderTooLong);
                }
                return Ok(None);
            };
            self.scanned = 0;
            let mut header: ChunkHeader = serde_json::from_slice(&self.buf[..pos])?;
            self.buf.drain(..=pos);
            if header.chunk_size > MAX_CHUNK_LEN {
                return Err(FrameError::TooLarge(header.chunk_size));
            }
            if let Some(data) = header.data.take() {
                let payload = BASE64.decode(data.as_bytes())?;
                self.state = DecodeState::Done;
                self.buf = Vec::new();
                return finish_frame(header, payload).map(Some);
            }
            self.state = DecodeState::AwaitingPayload(header);
        }
        let declared = match &self.state {
            DecodeState::AwaitingPayload(h) => h.chunk_size as usize,
            _ => return Ok(None),
        };
        if self.buf.len() < declared {
            return Ok(None);
        }
        let DecodeState::AwaitingPayload(header) =
            std::mem::replace(&mut self.state, DecodeState::Done)
        else {
            return Ok(None);
        };
        let mut payload = std::mem::take(&mut self.buf);
        payload.truncate(declared);
        finish_frame(header, payload).map(Some)
    }

    /// The error describing a connection that ended before the frame completed.
    pub fn eof_error(&self) -> FrameError {
        match &self.state {
            DecodeState::AwaitingPayload(h) => FrameError::Truncated {
                declared: h.chunk_size,
                got: self.buf.len() as u64,
            },
            _ => FrameError::MissingDelimiter,
        }
    }
}

fn finish_frame(header: ChunkHeader, payload: Vec<u8>) -> Result<ChunkFrame, FrameError> {
    if payload.len() as u64 != header.chunk_size {
        return Err(FrameError::LengthMismatch {
            declared: header.chunk_size,
            got: payload.len() as u64,
        });
    }
    if let Some(expected) = &header.sha256 {
        if !integrity::verify_chunk_hex(&payload, expected) {
            return Err(FrameError::DigestMismatch {
                file_name: header.file_name,
                index: header.chunk_index,
            });
        }
    }
    Ok(ChunkFrame { header, payload })
}

/// Whole-file acknowledgement outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Received,
    Failed,
}

/// Sent once per completed whole-file reception, on the ack port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAck {
    pub file_name: String,
    pub status: AckStatus,
    pub timestamp: i64,
}

impl FileAck {
    pub fn new(file_name: &str, status: AckStatus) -> Self {
        Self {
            file_name: file_name.to_string(),
            status,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Encode an ack as one JSON line.
pub fn encode_ack(ack: &FileAck) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(ack)?;
    out.push(HEADER_DELIMITER);
    Ok(out)
}

/// Decode an ack line (trailing delimiter and whitespace ignored).
pub fn decode_ack(bytes: &[u8]) -> Result<FileAck, serde_json::Error> {
    serde_json::from_slice(bytes.trim_ascii())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_frame_decodes_from_single_push() {
        let frame = encode_chunk_frame("notes.txt", 2, 5, b"hello world").unwrap();
        let mut dec = ChunkFrameDecoder::new();
        let out = dec.push(&frame).unwrap().unwrap();
        assert!(dec.is_done());
        assert_eq!(out.header.file_name, "notes.txt");
        assert_eq!(out.header.chunk_index, 2);
        assert_eq!(out.header.total_chunks, 5);
        assert_eq!(out.header.chunk_size, 11);
        assert_eq!(out.payload, b"hello world");
    }

    #[test]
    fn partial_reads_byte_by_byte() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let frame = encode_chunk_frame("a\nb|c.bin", 0, 1, &payload).unwrap();
        // Only one raw newline: the delimiter.
        let header_end = frame.iter().position(|&b| b == HEADER_DELIMITER).unwrap();
        assert!(!frame[..header_end].contains(&HEADER_DELIMITER));

        let mut dec = ChunkFrameDecoder::new();
        let mut got = None;
        for b in &frame {
            if let Some(f) = dec.push(std::slice::from_ref(b)).unwrap() {
                got = Some(f);
            }
        }
        let f = got.unwrap();
        assert_eq!(f.header.file_name, "a\nb|c.bin");
        assert_eq!(f.payload, payload);
    }

    #[test]
    fn header_split_across_reads_is_scanned_once() {
        let frame = encode_chunk_frame("slow.txt", 0, 1, b"payload").unwrap();
        let header_end = frame.iter().position(|&b| b == HEADER_DELIMITER).unwrap();
        let mut dec = ChunkFrameDecoder::new();
        for piece in frame[..header_end].chunks(3) {
            assert!(dec.push(piece).unwrap().is_none());
            assert_eq!(dec.scanned, dec.buf.len());
        }
        let f = dec.push(&frame[header_end..]).unwrap().unwrap();
        assert_eq!(f.header.file_name, "slow.txt");
        assert_eq!(f.payload, b"payload");
    }

    #[test]
    fn inline_variant_decodes() {
        let frame = encode_inline_chunk_frame("x", 0, 1, &[0, 10, 13, 255]).unwrap();
        assert_eq!(frame.last(), Some(&HEADER_DELIMITER));
        let mut dec = ChunkFrameDecoder::new();
        let f = dec.push(&frame).unwrap().unwrap();
        assert_eq!(f.payload, vec![0, 10, 13, 255]);
        assert!(f.header.data.is_none());
    }

    #[test]
    fn missing_chunk_index_is_malformed() {
        let line = br#"{"file_name":"x","total_chunks":1,"chunk_size":1,"timestamp":0}"#;
        let mut bytes = line.to_vec();
        bytes.push(HEADER_DELIMITER);
        bytes.push(b'z');
        let err = ChunkFrameDecoder::new().push(&bytes).unwrap_err();
        match err {
            FrameError::MalformedHeader(e) => assert!(e.to_string().contains("chunk_index")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn digest_mismatch_rejected() {
        let mut frame = encode_chunk_frame("x", 0, 1, b"abcd").unwrap();
        let last = frame.len() - 1;
        frame[last] = b'X';
        assert!(matches!(
            ChunkFrameDecoder::new().push(&frame),
            Err(FrameError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn inline_length_mismatch_rejected() {
        let header = ChunkHeader {
            file_name: "x".into(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_size: 10,
            timestamp: 0,
            sha256: None,
            data: Some(BASE64.encode(b"abc")),
        };
        let mut bytes = serde_json::to_vec(&header).unwrap();
        bytes.push(HEADER_DELIMITER);
        assert!(matches!(
            ChunkFrameDecoder::new().push(&bytes),
            Err(FrameError::LengthMismatch { declared: 10, got: 3 })
        ));
    }

    #[test]
    fn oversize_declared_payload_rejected() {
        let header = ChunkHeader {
            file_name: "x".into(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_size: MAX_CHUNK_LEN + 1,
            timestamp: 0,
            sha256: None,
            data: None,
        };
        let mut bytes = serde_json::to_vec(&header).unwrap();
        bytes.push(HEADER_DELIMITER);
        assert!(matches!(
            ChunkFrameDecoder::new().push(&bytes),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn eof_errors_reflect_state() {
        let frame = encode_chunk_frame("x", 0, 1, b"0123456789").unwrap();
        let mut dec = ChunkFrameDecoder::new();
        dec.push(&frame[..5]).unwrap();
        assert!(matches!(dec.eof_error(), FrameError::MissingDelimiter));
        dec.push(&frame[5..frame.len() - 4]).unwrap();
        assert!(matches!(
            dec.eof_error(),
            FrameError::Truncated { declared: 10, got: 6 }
        ));
    }

    #[test]
    fn ack_line() {
        let ack = FileAck::new("lecture.pdf", AckStatus::Received);
        let bytes = encode_ack(&ack).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains(r#""status":"received""#));
        assert_eq!(decode_ack(&bytes).unwrap(), ack);
        assert!(decode_ack(b"{\"file_name\":\"x\"}").is_err());
    }
}
