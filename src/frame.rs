//! Control message framing.
//!
//! Every control message travels as an 8-byte big-endian body length followed
//! by the UTF-8 JSON body. Payload bytes are never framed.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};

pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Upper bound on a control message body. Protects against a peer announcing
/// an absurd length and making us allocate it.
pub const MAX_FRAME_BODY: u64 = 1024 * 1024;

/// Serializes `message` into a complete frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a frame body that has already been read off the stream.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(body)
        .map_err(|e| TransferError::Framing(format!("frame body is not UTF-8: {e}")))?;
    serde_json::from_str(text)
        .map_err(|e| TransferError::Framing(format!("malformed frame body: {e}")))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(TransferError::connection)?;
    writer.flush().await.map_err(TransferError::connection)?;
    Ok(())
}

/// Reads exactly one frame. A close before the declared byte count arrives is
/// a framing error, however many partial reads it took to get there.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_exact(reader, &mut prefix, "length prefix").await?;

    let len = u64::from_be_bytes(prefix);
    if len > MAX_FRAME_BODY {
        return Err(TransferError::Framing(format!(
            "frame body of {len} bytes exceeds the {MAX_FRAME_BODY} byte limit"
        )));
    }

    let mut body = vec![0u8; len as usize];
    read_exact(reader, &mut body, "frame body").await?;
    decode_body(&body)
}

async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransferError::Framing(
            format!("connection closed while reading {what} ({} bytes expected)", buf.len()),
        )),
        Err(e) => Err(TransferError::connection(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Header;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = encode(&Header::new("a.txt", 1)).unwrap();
        let body = br#"{"filename":"a.txt","filesize":1}"#;
        assert_eq!(&frame[..8], &(body.len() as u64).to_be_bytes());
        assert_eq!(&frame[8..], body);
    }

    #[tokio::test]
    async fn reads_frame_split_across_many_writes() {
        let frame = encode(&Header::new("report.txt", 10)).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(4);

        let writer = tokio::spawn(async move {
            for byte in frame {
                tx.write_all(&[byte]).await.unwrap();
            }
        });

        let header: Header = read_frame(&mut rx).await.unwrap();
        writer.await.unwrap();
        assert_eq!(header, Header::new("report.txt", 10));
    }

    #[tokio::test]
    async fn truncated_body_is_a_framing_error() {
        let frame = encode(&Header::new("report.txt", 10)).unwrap();
        let mut short = &frame[..frame.len() - 3];
        let err = read_frame::<_, Header>(&mut short).await.unwrap_err();
        assert!(matches!(err, TransferError::Framing(_)), "{err:?}");
    }

    #[tokio::test]
    async fn truncated_prefix_is_a_framing_error() {
        let mut short: &[u8] = &[0, 0, 0];
        let err = read_frame::<_, Header>(&mut short).await.unwrap_err();
        assert!(matches!(err, TransferError::Framing(_)));
    }

    #[tokio::test]
    async fn malformed_json_is_a_framing_error() {
        let mut raw = 5u64.to_be_bytes().to_vec();
        raw.extend_from_slice(b"{nope");
        let err = read_frame::<_, Header>(&mut raw.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransferError::Framing(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocating() {
        let raw = (MAX_FRAME_BODY + 1).to_be_bytes();
        let err = read_frame::<_, Header>(&mut raw.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransferError::Framing(_)));
    }

    #[tokio::test]
    async fn write_frame_matches_encode() {
        let mut out = Vec::new();
        write_frame(&mut out, &Header::new("b.bin", 7)).await.unwrap();
        assert_eq!(out, encode(&Header::new("b.bin", 7)).unwrap());
    }
}
