//! Length-prefixed message framing for the rendezvous protocol.
//!
//! Message format:
//! ```text
//! ┌─────────────────┬───────────────────────────┐
//! │ Length (4 bytes)│ JSON-RPC Message (N bytes) │
//! │  big-endian u32 │                           │
//! └─────────────────┴───────────────────────────┘
//! ```

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one message. A room's member list stays far below it.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

fn check_len(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(0) => bail!("Empty message"),
        Ok(n) if n <= MAX_MESSAGE_SIZE => Ok(n),
        _ => bail!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
    }
}

/// Read one length-prefixed JSON message.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader
        .read_u32()
        .await
        .context("reading message length")?;
    let len = check_len(len as usize)?;

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .with_context(|| format!("reading {}-byte message body", len))?;

    serde_json::from_slice(&body).context("decoding message body")
}

/// Write one length-prefixed JSON message and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).context("encoding message body")?;
    let len = check_len(body.len())?;

    // Prefix and body go out in one write.
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await.context("writing message")?;
    writer.flush().await.context("flushing message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    struct TestMessage {
        room: String,
        seq: u32,
    }

    #[tokio::test]
    async fn test_message_format() {
        let msg = TestMessage {
            room: "U/ABCD".to_string(),
            seq: 123,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);

        let json_str = std::str::from_utf8(&buf[4..]).unwrap();
        assert!(json_str.contains("\"room\":\"U/ABCD\""));
        assert!(json_str.contains("\"seq\":123"));

        let decoded: TestMessage = read_message(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_empty() {
        let mut oversized = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        oversized.extend_from_slice(b"{}");
        let result: Result<TestMessage> = read_message(&mut Cursor::new(oversized)).await;
        assert!(result.unwrap_err().to_string().contains("too large"));

        let empty = 0u32.to_be_bytes().to_vec();
        let result: Result<TestMessage> = read_message(&mut Cursor::new(empty)).await;
        assert!(result.unwrap_err().to_string().contains("Empty"));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &TestMessage {
                room: "x".into(),
                seq: 1,
            },
        )
        .await
        .unwrap();
        buf.truncate(buf.len() - 2);
        let result: Result<TestMessage> = read_message(&mut Cursor::new(buf)).await;
        assert!(result.is_err());
    }
}
