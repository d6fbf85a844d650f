//! Framing for the control channel (handshake, commands) and the file header.
//! Decoders take a partial buffer and report `NeedMore` until a whole frame is present.

use crate::protocol::{
    clamp_device_name, Command, CMD_CHAT, CMD_VIBRATE, FILE_NAME_LEN_SIZE, FILE_SIZE_SIZE,
    HANDSHAKE_MAGIC, MAX_CHAT_LEN, MAX_FILE_NAME_LEN,
};

const MAGIC_SIZE: usize = HANDSHAKE_MAGIC.len();
const CHAT_LEN_SIZE: usize = 2;

/// Encode the handshake frame: magic, one length byte, device name (clamped to 255 bytes).
pub fn encode_handshake(device_name: &str) -> Vec<u8> {
    let name = clamp_device_name(device_name).as_bytes();
    let mut out = Vec::with_capacity(MAGIC_SIZE + 1 + name.len());
    out.extend_from_slice(&HANDSHAKE_MAGIC);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    out
}

/// Decode the peer's handshake from the front of `bytes`. Returns the peer name and bytes consumed.
/// The magic is checked as soon as it is available, before the rest of the frame arrives.
pub fn decode_handshake(bytes: &[u8]) -> Result<(String, usize), HandshakeError> {
    let magic_len = bytes.len().min(MAGIC_SIZE);
    if bytes[..magic_len] != HANDSHAKE_MAGIC[..magic_len] {
        return Err(HandshakeError::BadMagic);
    }
    if bytes.len() < MAGIC_SIZE + 1 {
        return Err(HandshakeError::NeedMore);
    }
    let name_len = bytes[MAGIC_SIZE] as usize;
    let end = MAGIC_SIZE + 1 + name_len;
    if bytes.len() < end {
        return Err(HandshakeError::NeedMore);
    }
    let name = String::from_utf8_lossy(&bytes[MAGIC_SIZE + 1..end]).into_owned();
    Ok((name, end))
}

/// Error decoding the handshake frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("handshake failed, wrong header format")]
    BadMagic,
}

/// Encode one command frame. Chat: opcode, u16 BE length, UTF-8 bytes. Vibrate: opcode only.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, CommandEncodeError> {
    match cmd {
        Command::Chat(text) => {
            let body = text.as_bytes();
            if body.len() > MAX_CHAT_LEN {
                return Err(CommandEncodeError::TooLarge(body.len()));
            }
            let mut out = Vec::with_capacity(1 + CHAT_LEN_SIZE + body.len());
            out.push(CMD_CHAT);
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
            Ok(out)
        }
        Command::Vibrate => Ok(vec![CMD_VIBRATE]),
    }
}

/// Error encoding a command frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandEncodeError {
    #[error("chat message too long: {0} bytes")]
    TooLarge(usize),
}

/// One inbound control frame. Unknown opcodes are surfaced so the caller can log and skip them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Command(Command),
    Unknown(u8),
}

/// Decode one command frame from the front of `bytes`. Returns the frame and bytes consumed.
pub fn decode_command(bytes: &[u8]) -> Result<(InboundFrame, usize), CommandDecodeError> {
    let Some(&opcode) = bytes.first() else {
        return Err(CommandDecodeError::NeedMore);
    };
    match opcode {
        CMD_CHAT => {
            if bytes.len() < 1 + CHAT_LEN_SIZE {
                return Err(CommandDecodeError::NeedMore);
            }
            let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
            if len > MAX_CHAT_LEN {
                return Err(CommandDecodeError::TooLarge(len));
            }
            let end = 1 + CHAT_LEN_SIZE + len;
            if bytes.len() < end {
                return Err(CommandDecodeError::NeedMore);
            }
            let text = String::from_utf8_lossy(&bytes[1 + CHAT_LEN_SIZE..end]).into_owned();
            Ok((InboundFrame::Command(Command::Chat(text)), end))
        }
        CMD_VIBRATE => Ok((InboundFrame::Command(Command::Vibrate), 1)),
        other => Ok((InboundFrame::Unknown(other), 1)),
    }
}

/// Error decoding a command frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("chat frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Encode the file header sent ahead of the raw body on the data channel.
pub fn encode_file_header(name: &str, size: u64) -> Result<Vec<u8>, FileHeaderError> {
    let name = name.as_bytes();
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(FileHeaderError::NameTooLong(name.len()));
    }
    let mut out = Vec::with_capacity(FILE_NAME_LEN_SIZE + name.len() + FILE_SIZE_SIZE);
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&size.to_be_bytes());
    Ok(out)
}

/// Read the big-endian name length that opens a file header.
pub fn decode_file_name_len(bytes: [u8; FILE_NAME_LEN_SIZE]) -> Result<usize, FileHeaderError> {
    let len = u32::from_be_bytes(bytes) as usize;
    if len > MAX_FILE_NAME_LEN {
        return Err(FileHeaderError::NameTooLong(len));
    }
    Ok(len)
}

/// Read the big-endian file size that closes a file header.
pub fn decode_file_size(bytes: [u8; FILE_SIZE_SIZE]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// Error in the file header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FileHeaderError {
    #[error("file name too long: {0} bytes")]
    NameTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn handshake_roundtrip() {
        let frame = encode_handshake("Pixel 7");
        assert_eq!(&frame[..3], &HANDSHAKE_MAGIC);
        assert_eq!(frame[3], 7);
        let (name, n) = decode_handshake(&frame).unwrap();
        assert_eq!(name, "Pixel 7");
        assert_eq!(n, frame.len());
    }

    #[test]
    fn handshake_partial_need_more() {
        let frame = encode_handshake("laptop");
        for cut in 0..frame.len() {
            assert_eq!(
                decode_handshake(&frame[..cut]),
                Err(HandshakeError::NeedMore),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn handshake_bad_magic_detected_early() {
        assert_eq!(decode_handshake(&[0x11, 0x00]), Err(HandshakeError::BadMagic));
        assert_eq!(
            decode_handshake(&[0x11, 0x45, 0x15, 0, 0]),
            Err(HandshakeError::BadMagic)
        );
    }

    #[test]
    fn handshake_empty_and_long_names() {
        let (name, _) = decode_handshake(&encode_handshake("")).unwrap();
        assert_eq!(name, "");

        let long = "x".repeat(300);
        let frame = encode_handshake(&long);
        assert_eq!(frame[3], 255);
        let (name, n) = decode_handshake(&frame).unwrap();
        assert_eq!(name.len(), 255);
        assert_eq!(n, 3 + 1 + 255);
    }

    #[test]
    fn chat_frame_layout() {
        let frame = encode_command(&Command::Chat("hi".into())).unwrap();
        assert_eq!(frame, vec![CMD_CHAT, 0, 2, b'h', b'i']);
        assert_eq!(encode_command(&Command::Vibrate).unwrap(), vec![CMD_VIBRATE]);
    }

    #[test]
    fn chat_encode_limit() {
        assert!(encode_command(&Command::Chat("a".repeat(MAX_CHAT_LEN))).is_ok());
        assert_eq!(
            encode_command(&Command::Chat("a".repeat(MAX_CHAT_LEN + 1))),
            Err(CommandEncodeError::TooLarge(MAX_CHAT_LEN + 1))
        );
    }

    #[test]
    fn command_stream_with_unknown_opcode() {
        let mut buf = Vec::new();
        buf.extend(encode_command(&Command::Chat("first".into())).unwrap());
        buf.push(0x7f);
        buf.extend(encode_command(&Command::Vibrate).unwrap());

        let (f1, n1) = decode_command(&buf).unwrap();
        assert_eq!(f1, InboundFrame::Command(Command::Chat("first".into())));
        let (f2, n2) = decode_command(&buf[n1..]).unwrap();
        assert_eq!(f2, InboundFrame::Unknown(0x7f));
        let (f3, n3) = decode_command(&buf[n1 + n2..]).unwrap();
        assert_eq!(f3, InboundFrame::Command(Command::Vibrate));
        assert_eq!(n1 + n2 + n3, buf.len());
    }

    #[test]
    fn chat_partial_need_more() {
        let frame = encode_command(&Command::Chat("hello".into())).unwrap();
        for cut in 0..frame.len() {
            assert_eq!(decode_command(&frame[..cut]), Err(CommandDecodeError::NeedMore));
        }
    }

    #[test]
    fn inbound_oversized_chat_rejected() {
        let len = (MAX_CHAT_LEN + 1) as u16;
        let mut frame = vec![CMD_CHAT];
        frame.extend_from_slice(&len.to_be_bytes());
        assert_eq!(
            decode_command(&frame),
            Err(CommandDecodeError::TooLarge(MAX_CHAT_LEN + 1))
        );
    }

    #[test]
    fn random_chat_bodies_decode() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let len = rng.gen_range(0..=MAX_CHAT_LEN);
            let text: String = (0..len)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect();
            let frame = encode_command(&Command::Chat(text.clone())).unwrap();
            let (decoded, n) = decode_command(&frame).unwrap();
            assert_eq!(decoded, InboundFrame::Command(Command::Chat(text)));
            assert_eq!(n, frame.len());
        }
    }

    #[test]
    fn file_header_layout() {
        let header = encode_file_header("a.txt", 258).unwrap();
        assert_eq!(&header[..4], &[0, 0, 0, 5]);
        assert_eq!(&header[4..9], b"a.txt");
        assert_eq!(&header[9..], &258u64.to_be_bytes());
        assert_eq!(decode_file_name_len([0, 0, 0, 5]), Ok(5));
        assert_eq!(decode_file_size(258u64.to_be_bytes()), 258);
    }

    #[test]
    fn file_header_name_limit() {
        let name = "n".repeat(MAX_FILE_NAME_LEN + 1);
        assert_eq!(
            encode_file_header(&name, 1),
            Err(FileHeaderError::NameTooLong(MAX_FILE_NAME_LEN + 1))
        );
        assert!(decode_file_name_len(u32::MAX.to_be_bytes()).is_err());
    }
}
