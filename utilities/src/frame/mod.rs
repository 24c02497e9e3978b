use crate::result::Result;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as a corrupted stream.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

// a frame is a little endian u32 length followed by one encoded protobuf message
pub async fn write_frame<M: Message>(
    stream: &mut (impl AsyncWrite + Unpin),
    message: &M,
) -> Result<()> {
    let body = message.encode_to_vec();
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(format!("Frame of {} bytes exceeds the frame limit", body.len()).into());
    }
    let mut buf = Vec::with_capacity(body.len() + 4);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the next frame, `None` when the peer closed the stream between frames.
pub async fn read_frame<M: Message + Default>(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<Option<M>> {
    let frame_size = match stream.read_u32_le().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if frame_size > MAX_FRAME_SIZE {
        return Err(format!("Invalid frame size {frame_size}").into());
    }
    let mut body = vec![0u8; frame_size as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(M::decode(body.as_slice())?))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Probe {
        #[prost(uint64, tag = "1")]
        epoch: u64,
        #[prost(string, tag = "2")]
        source: String,
    }

    #[tokio::test]
    async fn frame_reader_test() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = Probe {
            epoch: 7,
            source: "mds.1".to_string(),
        };
        let second = Probe {
            epoch: 8,
            source: "mds.2".to_string(),
        };
        write_frame(&mut client, &first).await.unwrap();
        write_frame(&mut client, &second).await.unwrap();
        drop(client);
        let got: Probe = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got, first);
        let got: Probe = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got.epoch, 8);
        let eof: Option<Probe> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let result: Result<Option<Probe>> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
