// src/protocol/frame.rs

//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. A clean EOF before the first length byte is a graceful close and
//! yields `Ok(None)`; EOF anywhere else is a connection loss.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{DistError, Result};

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read one message, or `None` if the peer closed the stream cleanly.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside a frame header",
            )
            .into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DistError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

/// Write one message and flush it.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(DistError::Protocol(format!(
            "refusing to send a {} byte frame (limit {MAX_FRAME_LEN})",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| DistError::Protocol("frame length does not fit in u32".to_string()))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::duplex;

    #[tokio::test]
    async fn messages_arrive_whole_and_in_order() {
        let (mut a, mut b) = duplex(64);
        let writer = tokio::spawn(async move {
            write_message(&mut a, &json!({"op": "ncores"})).await.unwrap();
            write_message(&mut a, &json!({"op": "ok", "n": [1, 2, 3]})).await.unwrap();
        });

        let first: Value = read_message(&mut b).await.unwrap().unwrap();
        let second: Value = read_message(&mut b).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first, json!({"op": "ncores"}));
        assert_eq!(second["n"], json!([1, 2, 3]));
        // Writer dropped on a frame boundary: graceful close.
        assert!(read_message::<Value, _>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"op\"").await.unwrap();
        drop(a);

        let err = read_message::<Value, _>(&mut b).await.unwrap_err();
        assert!(err.is_connection_loss(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_message::<Value, _>(&mut b).await.unwrap_err();
        assert!(matches!(err, DistError::Protocol(_)));
    }
}
