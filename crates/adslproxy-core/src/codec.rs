//! Length-prefixed CBOR framing for the tunnel session.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{TunnelError, TunnelResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, defending the decoder against a corrupt
/// or hostile length prefix. Stream data is chunked well below this.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::Codec(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Read one complete frame from `reader` and decode it.
///
/// An EOF before the first length byte surfaces as `UnexpectedEof`; the
/// caller treats it as the session ending.
pub async fn read_frame<R, T>(reader: &mut R) -> TunnelResult<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(TunnelError::Codec(format!("frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}

/// Encode `value` and write the complete frame to `writer`.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Frame;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn round_trip_single() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let frame = frame_encode(&msg).unwrap();
        let decoded: TestMsg = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn async_round_trip_multiple() {
        let msgs = vec![
            Frame::Request {
                id: 1,
                kind: "keepalive".into(),
                payload: vec![],
            },
            Frame::Reply { id: 1, ok: true },
            Frame::StreamData {
                id: 7,
                data: b"hello".to_vec(),
            },
        ];

        let (mut a, mut b) = tokio::io::duplex(4096);
        for m in &msgs {
            write_frame(&mut a, m).await.unwrap();
        }

        for expected in &msgs {
            let got: Frame = read_frame(&mut b).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn split_reads_reassemble() {
        let msg = TestMsg {
            name: "test".into(),
            value: 99,
        };
        let frame = frame_encode(&msg).unwrap();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let write = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // Feed the frame one byte at a time; read_exact must reassemble.
            for byte in frame {
                a.write_all(&[byte]).await.unwrap();
                a.flush().await.unwrap();
            }
        });

        let decoded: TestMsg = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, msg);
        write.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();

        let err = read_frame::<_, TestMsg>(&mut b).await.unwrap_err();
        assert!(matches!(err, TunnelError::Codec(_)));
    }
}
