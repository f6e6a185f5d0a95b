//! Length-prefixed blocking framing for the sandbox channels.
//!
//! Each frame is a little-endian `u32` byte count followed by that many
//! bytes of encoded protobuf. Both the control channel and the
//! function-binding channel use this framing in both directions.

use std::io::{self, Read, Write};

use prost::Message;

/// Upper bound on a single frame. Frames announcing more than this are
/// treated as a corrupted stream rather than honored with an allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame.
pub fn send_frame(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", bytes.len()),
        ));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    writer.flush()
}

/// Read one frame. An EOF before the length prefix surfaces as
/// [`io::ErrorKind::UnexpectedEof`], which callers treat as peer death.
pub fn recv_frame(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Encode a message and write it as one frame.
pub fn send_message(writer: &mut impl Write, message: &impl Message) -> io::Result<()> {
    send_frame(writer, &message.encode_to_vec())
}

/// Read one frame and decode it as `M`.
pub fn recv_message<M: Message + Default>(reader: &mut impl Read) -> io::Result<M> {
    let frame = recv_frame(reader)?;
    M::decode(frame.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::proto::WorkerRunReply;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"hello").unwrap();
        send_frame(&mut buf, b"").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(recv_frame(&mut cursor).unwrap(), b"hello");
        assert_eq!(recv_frame(&mut cursor).unwrap(), b"");
    }

    #[test]
    fn message_round_trips() {
        let reply = WorkerRunReply {
            status: 0,
            message: String::new(),
            response: "\"ok\"".to_string(),
            engine_elapsed_ns: 1234,
        };
        let mut buf = Vec::new();
        send_message(&mut buf, &reply).unwrap();
        let decoded: WorkerRunReply = recv_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let err = recv_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_reports_eof() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(b"only4");
        let err = recv_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
