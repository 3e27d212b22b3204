// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Length-prefixed JSON frames shared by the server back-channel and the
//! domain registration transport.
//!
//! ```text
//! ┌───────────────┬──────────────────────────┐
//! │ 4 bytes (BE)  │  JSON payload            │
//! │ payload len   │                          │
//! └───────────────┴──────────────────────────┘
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest accepted frame. A full domain model travels in one frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registration::DomainRequest;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_through_codec() {
        let mut codec = frame_codec();
        let mut buffer = BytesMut::new();
        codec.encode(encode_frame(&DomainRequest::Ping).unwrap(), &mut buffer).unwrap();
        assert_eq!(&buffer[..4], &[0, 0, 0, 15]);

        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        let decoded: DomainRequest = decode_frame(&frame).unwrap();
        assert_eq!(decoded, DomainRequest::Ping);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = frame_codec();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        assert!(codec.decode(&mut buffer).is_err());
    }
}
