#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Length prefix size in bytes (u32, big endian).
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

fn read_len_prefix(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < FRAME_HEADER_LEN {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(Some(len))
}

/// Decode a single frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = read_len_prefix(src, max_frame_size)? else {
		return Err(FramingError::InsufficientData {
			need: FRAME_HEADER_LEN,
			have: src.len(),
		});
	};

	let need = FRAME_HEADER_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[FRAME_HEADER_LEN..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer, consuming it on success.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = read_len_prefix(buf, max_frame_size)? else {
		return Ok(None);
	};

	let need = FRAME_HEADER_LEN + len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	frame.advance(FRAME_HEADER_LEN);
	let msg = M::decode(frame.freeze())?;
	Ok(Some(msg))
}

/// Incremental decoder for a byte stream carrying consecutive frames.
///
/// Bytes are pushed as they arrive from the transport; complete frames are
/// popped in order. A frame larger than the limit poisons the stream: the
/// caller is expected to close the connection.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	pub fn push(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Pop the next complete frame, if any.
	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		try_decode_frame_from_buffer(&mut self.buf, self.max_frame_size)
	}

	/// Bytes buffered but not yet decoded.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn decode_reports_missing_header() {
		let err = decode_frame::<TestMsg>(&[0, 0], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, FRAME_HEADER_LEN);
				assert_eq!(have, 2);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decoder_yields_back_to_back_frames_in_order() {
		let a = TestMsg { s: "a".into(), n: 1 };
		let b = TestMsg { s: "b".into(), n: 2 };

		let mut bytes = encode_frame_default(&a).expect("encode a");
		bytes.extend(encode_frame_default(&b).expect("encode b"));

		let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		decoder.push(&bytes);

		assert_eq!(decoder.next_frame::<TestMsg>().expect("ok"), Some(a));
		assert_eq!(decoder.next_frame::<TestMsg>().expect("ok"), Some(b));
		assert_eq!(decoder.next_frame::<TestMsg>().expect("ok"), None);
		assert_eq!(decoder.buffered(), 0);
	}

	#[test]
	fn decoder_rejects_oversized_prefix_before_payload_arrives() {
		let mut decoder = FrameDecoder::new(16);
		decoder.push(&1024u32.to_be_bytes());

		match decoder.next_frame::<TestMsg>().unwrap_err() {
			FramingError::FrameTooLarge { len, max } => {
				assert_eq!(len, 1024);
				assert_eq!(max, 16);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_too_large() {
		let msg = TestMsg {
			s: "a".repeat(10_000),
			n: 1,
		};

		let err = encode_frame(&msg, 32).unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
