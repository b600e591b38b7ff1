//! Network Module
//!
//! Serves a [`MemoryStore`](crate::store::MemoryStore) over TCP and
//! provides the matching remote backend.

mod client;
mod protocol;
mod server;

pub use client::{RemoteBackend, SessionOptions};
pub use protocol::{FrameHeader, Message, MAX_FRAME_SIZE};
pub use server::CoordinationServer;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Check if a read error just means the peer hung up
pub(crate) fn is_disconnect(error: &Error) -> bool {
    matches!(
        error,
        Error::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &Message::Ping).await.unwrap();
        write_message(&mut a, &Message::Close).await.unwrap();

        assert!(matches!(read_message(&mut b).await.unwrap(), Message::Ping));
        assert!(matches!(read_message(&mut b).await.unwrap(), Message::Close));
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        use tokio::io::AsyncWriteExt;

        let body = Message::Pong.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_message(&mut b).await.unwrap_err();
        assert!(is_disconnect(&err));
    }
}
