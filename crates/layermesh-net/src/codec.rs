// Wire format: [u32 big-endian length][bincode payload]
//
// Requests and responses share the framing. The length prefix is checked
// against the configured maximum before any payload is read.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

// ── Payload ──────────────────────────────────────────────────────────────────

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    let (msg, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))?;
    Ok(msg)
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Read one frame. A clean EOF before the length prefix yields
/// [`NetError::Closed`].
pub async fn read_frame<R>(io: &mut R, max_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(NetError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(NetError::FrameTooLarge { len, max: max_bytes });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W>(io: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| NetError::FrameTooLarge {
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(io: &mut R, max_bytes: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let buf = read_frame(io, max_bytes).await?;
    decode(&buf)
}

pub async fn write_message<W, T>(io: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    write_frame(io, &buf).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use layermesh_types::protocol::{ExecuteForwardRequest, PingRequest};
    use layermesh_types::{Request, TensorData};

    #[tokio::test]
    async fn request_survives_framing() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let req = Request::ExecuteForward(ExecuteForwardRequest {
            session_id: "sess-001".into(),
            token_index: 7,
            input_activations: TensorData::from_f32(vec![2, 4], &[0.25; 8]),
            stage_ids: vec![],
        });

        write_message(&mut a, &req).await.unwrap();
        let got: Request = read_message(&mut b, 1 << 20).await.unwrap();

        match got {
            Request::ExecuteForward(fwd) => {
                assert_eq!(fwd.token_index, 7);
                assert_eq!(fwd.input_activations.shape, vec![2, 4]);
                assert_eq!(fwd.input_activations.num_bytes, 32);
                fwd.input_activations.validate().unwrap();
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, &[0u8; 64]).await.unwrap();
        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { len: 64, max: 16 }));
    }

    #[tokio::test]
    async fn eof_reads_as_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b, 1024).await, Err(NetError::Closed)));
    }

    #[test]
    fn garbage_does_not_decode() {
        let ping = encode(&Request::Ping(PingRequest { message: "hi".into() })).unwrap();
        assert!(decode::<Request>(&ping[..1]).is_err());
    }
}
