//! Client for the HTTP relay: pushes a local file through `/begin`,
//! sequential `/chunk` calls and `/end`, the way a browser uploader would.

use std::path::Path;

use log::{debug, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;

use crate::{
    error::{Result, TransferError},
    models::{BeginResponse, ChunkAck, Completion, MessageResponse, RelayStatus},
};

/// Default size of each `/chunk` body.
pub const DEFAULT_UPLOAD_CHUNK: usize = 1024 * 1024;

#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    client: Client,
    chunk_size: usize,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            chunk_size: DEFAULT_UPLOAD_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    pub async fn begin(
        &self,
        host: &str,
        port: u16,
        filename: &str,
        filesize: u64,
    ) -> Result<BeginResponse> {
        let response = self
            .client
            .post(self.url("begin"))
            .query(&[
                ("host", host.to_string()),
                ("port", port.to_string()),
                ("filename", filename.to_string()),
                ("filesize", filesize.to_string()),
            ])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn chunk(&self, session_id: &str, bytes: Vec<u8>) -> Result<ChunkAck> {
        let response = self
            .client
            .post(self.url("chunk"))
            .query(&[("id", session_id)])
            .body(bytes)
            .send()
            .await?;
        decode(response).await
    }

    /// Returns the receiver's completion whether it reports `DONE` or `ERROR`.
    pub async fn end(&self, session_id: &str) -> Result<Completion> {
        let response = self
            .client
            .post(self.url("end"))
            .query(&[("id", session_id)])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) if value.get("saved_as").is_some() => Ok(serde_json::from_value(value)?),
            _ => Err(relay_error(status.as_u16(), &body)),
        }
    }

    pub async fn cancel(&self, session_id: &str) -> Result<MessageResponse> {
        let response = self
            .client
            .post(self.url("cancel"))
            .query(&[("id", session_id)])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        let response = self.client.get(self.url("status")).send().await?;
        decode(response).await
    }

    /// Uploads `path` to the receiver at `host:port` through the relay.
    /// Anything failing after `/begin` triggers a best-effort `/cancel`.
    pub async fn push_file(&self, host: &str, port: u16, path: &Path) -> Result<Completion> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::Validation(format!("{path:?} has no file name")))?;
        let mut file = tokio::fs::File::open(path).await?;
        let filesize = file.metadata().await?.len();

        let begun = self.begin(host, port, &filename, filesize).await?;
        info!(
            "relay session {} opened, receiver saves as '{}'",
            begun.session_id, begun.save_as
        );

        match self.upload(&begun.session_id, &mut file, filesize).await {
            Ok(completion) => Ok(completion),
            Err(e) => {
                warn!("upload through relay failed: {e}");
                if let Err(cancel_err) = self.cancel(&begun.session_id).await {
                    debug!("cancel after failure also failed: {cancel_err}");
                }
                Err(e)
            }
        }
    }

    async fn upload(
        &self,
        session_id: &str,
        file: &mut tokio::fs::File,
        filesize: u64,
    ) -> Result<Completion> {
        let mut sent: u64 = 0;
        while sent < filesize {
            let want = (filesize - sent).min(self.chunk_size as u64);
            let mut piece = Vec::with_capacity(want as usize);
            (&mut *file).take(want).read_to_end(&mut piece).await?;
            if piece.is_empty() {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file ended after {sent} of {filesize} bytes"),
                )));
            }

            let ack = self.chunk(session_id, piece).await?;
            sent = ack.received;
            debug!("relay acknowledged {sent}/{filesize} bytes");
        }

        self.end(session_id).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        Ok(serde_json::from_slice(&body)?)
    } else {
        Err(relay_error(status.as_u16(), &body))
    }
}

fn relay_error(status: u16, body: &[u8]) -> TransferError {
    let message = serde_json::from_slice::<MessageResponse>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    TransferError::Relay { status, message }
}
