//! Message codec for IPC framing

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{ClientMessage, ServerMessage};

/// Maximum frame size (1 MB). Output is chunked at the PTY read-buffer
/// size, so real frames stay far below this.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Codec for ClientMessage (encoding) and ServerMessage (decoding)
/// Used by the client side
#[derive(Debug, Default)]
pub struct ClientCodec;

impl ClientCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ClientCodec {
    type Item = ServerMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<ClientMessage> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

/// Codec for ServerMessage (encoding) and ClientMessage (decoding)
/// Used by the server side
#[derive(Debug, Default)]
pub struct ServerCodec;

impl ServerCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ServerCodec {
    type Item = ClientMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<ServerMessage> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

/// Decode a length-prefixed frame
fn decode_frame<T: serde::de::DeserializeOwned>(
    src: &mut BytesMut,
) -> Result<Option<T>, CodecError> {
    // Need at least 4 bytes for the length prefix
    if src.len() < 4 {
        return Ok(None);
    }

    // Peek at length without consuming
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    // Check if we have the full frame
    if src.len() < 4 + len {
        src.reserve(4 + len - src.len());
        return Ok(None);
    }

    src.advance(4);
    let data = src.split_to(len);

    let msg: T = bincode::deserialize(&data)?;
    Ok(Some(msg))
}

/// Encode a length-prefixed frame
fn encode_frame<T: serde::Serialize>(item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let data = bincode::serialize(item)?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    dst.reserve(4 + data.len());
    dst.put_u32(data.len() as u32);
    dst.put_slice(&data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;
    use crate::types::{ResizeSource, SpawnOptions, TerminalInfo, TerminalState};
    use crate::PROTOCOL_VERSION;
    use uuid::Uuid;

    fn sample_info() -> TerminalInfo {
        TerminalInfo {
            id: Uuid::new_v4(),
            name: "build".to_string(),
            kind: crate::types::ProcessKind::Shell,
            backing: crate::types::BackingMode::Multiplexed,
            cwd: "/home/user/project".to_string(),
            mux_session: Some("tether-session".to_string()),
            created_at: 1234567890,
            last_activity_at: 1234567999,
            state: TerminalState::Attached,
        }
    }

    #[test]
    fn test_client_message_roundtrip() {
        let mut codec = ClientCodec::new();
        let mut server_codec = ServerCodec::new();

        let msg = ClientMessage::Connect {
            client_id: Uuid::new_v4(),
            protocol_version: PROTOCOL_VERSION,
        };

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = server_codec.decode(&mut buf).unwrap().unwrap();

        // Compare via debug string since ClientMessage doesn't impl PartialEq
        assert_eq!(format!("{:?}", msg), format!("{:?}", decoded));
    }

    #[test]
    fn test_server_message_roundtrip() {
        let mut codec = ServerCodec::new();
        let mut client_codec = ClientCodec::new();

        let msg = ServerMessage::OwnershipGranted {
            terminal: sample_info(),
        };

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = client_codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = ClientCodec::new();
        let mut server_codec = ServerCodec::new();

        let msg = ClientMessage::Ping;

        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        // Split buffer to simulate partial read
        let mut partial = buf.split_to(2);

        assert!(server_codec.decode(&mut partial).unwrap().is_none());

        // Add rest of frame
        partial.unsplit(buf);

        assert!(server_codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_frame_too_large_on_decode() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();

        let huge_size: u32 = (MAX_FRAME_SIZE + 1) as u32;
        buf.put_u32(huge_size);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_all_client_message_variants() {
        let mut codec = ClientCodec::new();
        let mut server_codec = ServerCodec::new();

        let id = Uuid::new_v4();
        let messages = vec![
            ClientMessage::Connect {
                client_id: Uuid::new_v4(),
                protocol_version: PROTOCOL_VERSION,
            },
            ClientMessage::ListTerminals,
            ClientMessage::Spawn {
                options: SpawnOptions::shell(80, 24),
            },
            ClientMessage::Input {
                terminal_id: id,
                data: vec![0x1b, 0x5b, 0x41], // Up arrow
            },
            ClientMessage::RequestResize {
                terminal_id: id,
                cols: 120,
                rows: 40,
                source: ResizeSource::Viewport,
            },
            ClientMessage::RequestOwnership { terminal_id: id },
            ClientMessage::ReleaseOwnership { terminal_id: id },
            ClientMessage::Reconnect {
                known_ids: vec![id, Uuid::new_v4()],
            },
            ClientMessage::Detach { terminal_id: id },
            ClientMessage::Kill { terminal_id: id },
            ClientMessage::CapturePane {
                terminal_id: id,
                lines: 200,
            },
            ClientMessage::Ping,
        ];

        for msg in messages {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = server_codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(format!("{:?}", msg), format!("{:?}", decoded));
        }
    }

    #[test]
    fn test_all_server_message_variants() {
        let mut codec = ServerCodec::new();
        let mut client_codec = ClientCodec::new();

        let id = Uuid::new_v4();
        let messages = vec![
            ServerMessage::Connected {
                server_version: "0.3.0".to_string(),
                protocol_version: PROTOCOL_VERSION,
            },
            ServerMessage::TerminalList {
                terminals: vec![sample_info()],
            },
            ServerMessage::TerminalCreated {
                terminal: sample_info(),
            },
            ServerMessage::OwnershipGranted {
                terminal: sample_info(),
            },
            ServerMessage::OwnershipReleased { terminal_id: id },
            ServerMessage::Output {
                terminal_id: id,
                data: b"hello\r\n".to_vec(),
            },
            ServerMessage::TerminalDetached { terminal_id: id },
            ServerMessage::TerminalClosed {
                terminal_id: id,
                exit_code: Some(0),
            },
            ServerMessage::CaptureResult {
                terminal_id: id,
                data: b"scrollback".to_vec(),
            },
            ServerMessage::Error {
                code: ErrorCode::InvalidWorkingDirectory,
                message: "not a directory".to_string(),
            },
            ServerMessage::Pong,
        ];

        for msg in messages {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = client_codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut codec = ClientCodec::new();
        let mut server_codec = ServerCodec::new();

        let msg1 = ClientMessage::Ping;
        let msg2 = ClientMessage::ListTerminals;

        let mut buf = BytesMut::new();
        codec.encode(msg1.clone(), &mut buf).unwrap();
        codec.encode(msg2.clone(), &mut buf).unwrap();

        let decoded1 = server_codec.decode(&mut buf).unwrap().unwrap();
        let decoded2 = server_codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(format!("{:?}", msg1), format!("{:?}", decoded1));
        assert_eq!(format!("{:?}", msg2), format!("{:?}", decoded2));

        // Buffer should be empty now
        assert!(server_codec.decode(&mut buf).unwrap().is_none());
    }
}
