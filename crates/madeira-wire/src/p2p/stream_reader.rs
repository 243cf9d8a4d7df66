// SPDX-License-Identifier: MIT

//! A reader that turns the inbound byte stream into protocol messages.
//! We can't just deserialize from the socket directly: we don't know how
//! many bytes a message takes before seeing its header, and a message
//! that fails its checksum must be *dropped*, not kill the connection.
//! So we read the fixed 24-byte header first, validate it, read exactly
//! the advertised payload, and only then decode.
//!
//! Recoverable problems (bad magic, bad command, oversized length, bad
//! checksum, undecodable body) are reported through the channel and the
//! loop keeps going; the peer turns each one into a misbehavior mark and
//! the ban ladder does the rest. Socket errors end the loop.

use bitcoin::consensus::deserialize;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::Magic;
use madeira_common::constants::MAX_MESSAGE;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;

use super::peer::PeerError;

/// Wire frame header: magic, NUL-padded command, payload length,
/// payload checksum.
const HEADER_SIZE: usize = 24;

pub struct StreamReader<Source: AsyncRead + Unpin + Send> {
    /// Where we read bytes from, usually the read half of a TcpStream
    source: Source,
    /// Magic bits, we expect this at the beginning of all messages
    magic: Magic,
    /// Where parsed messages (and recoverable errors) go
    sender: UnboundedSender<Result<NetworkMessage, PeerError>>,
}

impl<Source: AsyncRead + Unpin + Send> StreamReader<Source> {
    pub fn new(
        source: Source,
        magic: Magic,
        sender: UnboundedSender<Result<NetworkMessage, PeerError>>,
    ) -> Self {
        StreamReader {
            source,
            magic,
            sender,
        }
    }

    /// Read messages until the socket errors out or the peer hangs up on
    /// the channel side.
    pub async fn read_loop(mut self) {
        loop {
            let mut header = [0_u8; HEADER_SIZE];

            if let Err(err) = self.source.read_exact(&mut header).await {
                let _ = self.sender.send(Err(PeerError::Read(err)));
                return;
            }

            let length = match parse_header(self.magic, &header) {
                Ok(length) => length,
                Err(err) => {
                    // Skip this header and try to pick the stream back up
                    // at the next frame boundary.
                    if self.sender.send(Err(err)).is_err() {
                        return;
                    }
                    continue;
                }
            };

            let mut frame = vec![0_u8; HEADER_SIZE + length];
            frame[..HEADER_SIZE].copy_from_slice(&header);

            if let Err(err) = self.source.read_exact(&mut frame[HEADER_SIZE..]).await {
                let _ = self.sender.send(Err(PeerError::Read(err)));
                return;
            }

            if self.sender.send(decode_frame(&frame)).is_err() {
                return;
            }
        }
    }
}

/// Validate a frame header and return the payload length.
pub(crate) fn parse_header(magic: Magic, header: &[u8; HEADER_SIZE]) -> Result<usize, PeerError> {
    if Magic::from_bytes([header[0], header[1], header[2], header[3]]) != magic {
        return Err(PeerError::MagicBitsMismatch);
    }

    let command = &header[4..16];
    let end = command.iter().position(|&b| b == 0);

    // The command must be NUL-terminated within its 12 bytes, printable
    // ASCII up to the terminator and NUL-padded after it.
    let Some(end) = end else {
        return Err(PeerError::InvalidCommand);
    };

    if command[..end].iter().any(|&b| !(32..=126).contains(&b)) {
        return Err(PeerError::InvalidCommand);
    }

    if command[end..].iter().any(|&b| b != 0) {
        return Err(PeerError::InvalidCommand);
    }

    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;

    if length > MAX_MESSAGE {
        return Err(PeerError::MessageTooBig);
    }

    Ok(length)
}

/// Verify the payload checksum and decode the message body. Unknown
/// commands decode to [NetworkMessage::Unknown].
pub(crate) fn decode_frame(frame: &[u8]) -> Result<NetworkMessage, PeerError> {
    let payload = &frame[HEADER_SIZE..];
    let checksum = sha256d::Hash::hash(payload);

    if checksum.as_byte_array()[..4] != frame[20..24] {
        return Err(PeerError::InvalidChecksum);
    }

    deserialize::<RawNetworkMessage>(frame)
        .map(RawNetworkMessage::into_payload)
        .map_err(PeerError::Parse)
}

#[cfg(test)]
mod test {
    use bitcoin::consensus::serialize;
    use bitcoin::p2p::message::NetworkMessage;
    use bitcoin::p2p::message::RawNetworkMessage;
    use bitcoin::p2p::Magic;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::unbounded_channel;

    use super::decode_frame;
    use super::parse_header;
    use super::StreamReader;
    use crate::p2p::peer::PeerError;

    fn frame(msg: NetworkMessage) -> Vec<u8> {
        serialize(&RawNetworkMessage::new(Magic::BITCOIN, msg))
    }

    #[test]
    fn test_roundtrip() {
        for msg in [
            NetworkMessage::Verack,
            NetworkMessage::Ping(0xdead_beef),
            NetworkMessage::Pong(42),
            NetworkMessage::GetAddr,
            NetworkMessage::SendHeaders,
            NetworkMessage::MemPool,
            NetworkMessage::FeeFilter(1000),
            NetworkMessage::Inv(Vec::new()),
            NetworkMessage::Headers(Vec::new()),
        ] {
            let bytes = frame(msg.clone());
            let header: [u8; 24] = bytes[..24].try_into().unwrap();

            let length = parse_header(Magic::BITCOIN, &header).unwrap();
            assert_eq!(length, bytes.len() - 24);
            assert_eq!(decode_frame(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_bad_magic() {
        let bytes = frame(NetworkMessage::Verack);
        let header: [u8; 24] = bytes[..24].try_into().unwrap();

        assert!(matches!(
            parse_header(Magic::TESTNET, &header),
            Err(PeerError::MagicBitsMismatch)
        ));
    }

    #[test]
    fn test_bad_command() {
        let bytes = frame(NetworkMessage::Verack);

        // No NUL terminator at all
        let mut header: [u8; 24] = bytes[..24].try_into().unwrap();
        header[4..16].copy_from_slice(b"aaaaaaaaaaaa");
        assert!(matches!(
            parse_header(Magic::BITCOIN, &header),
            Err(PeerError::InvalidCommand)
        ));

        // Non-printable byte inside the command
        let mut header: [u8; 24] = bytes[..24].try_into().unwrap();
        header[5] = 0x01;
        assert!(matches!(
            parse_header(Magic::BITCOIN, &header),
            Err(PeerError::InvalidCommand)
        ));

        // Garbage after the terminator
        let mut header: [u8; 24] = bytes[..24].try_into().unwrap();
        header[15] = b'x';
        assert!(matches!(
            parse_header(Magic::BITCOIN, &header),
            Err(PeerError::InvalidCommand)
        ));
    }

    #[test]
    fn test_oversized_length() {
        let bytes = frame(NetworkMessage::Verack);
        let mut header: [u8; 24] = bytes[..24].try_into().unwrap();
        header[16..20].copy_from_slice(&(33 * 1024 * 1024_u32).to_le_bytes());

        assert!(matches!(
            parse_header(Magic::BITCOIN, &header),
            Err(PeerError::MessageTooBig)
        ));
    }

    #[test]
    fn test_bad_checksum() {
        let mut bytes = frame(NetworkMessage::Ping(7));
        bytes[20] ^= 0x01;

        assert!(matches!(
            decode_frame(&bytes),
            Err(PeerError::InvalidChecksum)
        ));
    }

    #[test]
    fn test_unknown_command_is_a_message() {
        let msg = NetworkMessage::Unknown {
            command: "spork".to_string().try_into().unwrap(),
            payload: vec![1, 2, 3],
        };
        let bytes = frame(msg.clone());

        assert_eq!(decode_frame(&bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_read_loop_recovers_from_bad_checksum() {
        let (mut writer, reader) = tokio::io::duplex(1 << 16);
        let (tx, mut rx) = unbounded_channel();

        tokio::spawn(StreamReader::new(reader, Magic::BITCOIN, tx).read_loop());

        let mut corrupt = frame(NetworkMessage::Ping(1));
        corrupt[20] ^= 0xff;
        writer.write_all(&corrupt).await.unwrap();
        writer.write_all(&frame(NetworkMessage::Ping(2))).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(PeerError::InvalidChecksum)
        ));
        assert_eq!(rx.recv().await.unwrap().unwrap(), NetworkMessage::Ping(2));
    }
}
