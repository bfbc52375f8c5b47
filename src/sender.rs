//! Sending side of the transfer protocol. Single attempt, no retries.

use std::{path::Path, time::Duration};

use log::{debug, info};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{
    error::{Result, TransferError},
    frame,
    models::{Acceptance, Completion, Header},
    IO_CHUNK_SIZE,
};

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub connect_timeout: Duration,
    pub io_chunk_size: usize,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            io_chunk_size: IO_CHUNK_SIZE,
        }
    }
}

impl From<&crate::Config> for SendOptions {
    fn from(config: &crate::Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            io_chunk_size: config.io_chunk_size,
        }
    }
}

pub async fn connect<A: ToSocketAddrs>(addr: A, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TransferError::connection(e)),
        Err(_) => return Err(TransferError::ConnectTimeout),
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable Nagle on the connection: {e}");
    }
    Ok(stream)
}

/// Sends the header and waits for the receiver's verdict. A rejection comes
/// back as [`TransferError::Rejected`] carrying the receiver's reason.
pub async fn handshake<S>(stream: &mut S, header: &Header) -> Result<Acceptance>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frame::write_frame(stream, header).await?;
    let acceptance: Acceptance = frame::read_frame(stream).await?;
    if !acceptance.is_ok() {
        return Err(TransferError::Rejected(acceptance.message));
    }
    debug!("receiver will save '{}' as '{}'", header.filename, acceptance.save_as);
    Ok(acceptance)
}

/// Connects and runs the handshake, leaving the stream ready for payload.
pub async fn open<A: ToSocketAddrs>(
    addr: A,
    header: &Header,
    connect_timeout: Duration,
) -> Result<(TcpStream, Acceptance)> {
    let mut stream = connect(addr, connect_timeout).await?;
    let acceptance = handshake(&mut stream, header).await?;
    Ok((stream, acceptance))
}

/// Copies exactly `filesize` bytes from `source` onto `stream`.
pub async fn stream_payload<S, R>(
    stream: &mut S,
    source: &mut R,
    filesize: u64,
    io_chunk_size: usize,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; io_chunk_size.max(1)];
    let mut sent: u64 = 0;
    while sent < filesize {
        let want = (filesize - sent).min(buf.len() as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {sent} of {filesize} bytes"),
            )));
        }
        stream
            .write_all(&buf[..n])
            .await
            .map_err(TransferError::connection)?;
        sent += n as u64;
    }
    stream.flush().await.map_err(TransferError::connection)?;
    Ok(sent)
}

pub async fn await_completion<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Completion> {
    frame::read_frame(stream).await
}

/// Full send of `filesize` bytes read from `source`. The receiver's
/// completion is returned as-is; check [`Completion::is_done`].
pub async fn send_reader<A, R>(
    addr: A,
    filename: &str,
    filesize: u64,
    source: &mut R,
    opts: SendOptions,
) -> Result<Completion>
where
    A: ToSocketAddrs,
    R: AsyncRead + Unpin,
{
    let header = Header::new(filename, filesize);
    let (mut stream, acceptance) = open(addr, &header, opts.connect_timeout).await?;
    info!(
        "sending '{filename}' ({filesize} bytes), receiver saves as '{}'",
        acceptance.save_as
    );

    stream_payload(&mut stream, source, filesize, opts.io_chunk_size).await?;
    let completion = await_completion(&mut stream).await?;
    info!("{:?}: {}", completion.status, completion.message);
    Ok(completion)
}

pub async fn send_file<A: ToSocketAddrs>(
    addr: A,
    path: &Path,
    opts: SendOptions,
) -> Result<Completion> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Validation(format!("{path:?} has no file name")))?;
    let mut file = tokio::fs::File::open(path).await?;
    let filesize = file.metadata().await?.len();
    send_reader(addr, &filename, filesize, &mut file, opts).await
}
