//! TCP receiver: one task per connection, each running
//! header -> validation -> acceptance -> payload -> completion.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};

use crate::{
    error::{Result, TransferError},
    frame,
    models::{Acceptance, Completion, Header},
    naming, progress_due, send_event, Config, EventTx, TransferEvent,
};

/// How a connection that got past the header ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Rejected(String),
    Completed(Completion),
}

#[derive(Clone)]
pub struct Receiver {
    config: Arc<Config>,
    events: Option<EventTx>,
}

impl Receiver {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: EventTx) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.receiver_addr).await?)
    }

    /// Accepts until `stop_rx` fires (or its sender is dropped), then waits
    /// for the in-flight connections to finish.
    pub async fn serve(&self, listener: TcpListener, mut stop_rx: mpsc::Receiver<()>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.receive_dir).await?;
        info!(
            "receiver listening on {} saving into {:?}",
            listener.local_addr()?,
            self.config.receive_dir
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("stopping receiver, draining {} connection(s)", connections.len());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let receiver = self.clone();
                        connections.spawn(async move { receiver.handle_connection(stream, peer).await });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {e}");
                    }
                }
            }
        }

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("connection task failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle for {peer}: {e}");
        }
        info!("connected from {peer}");

        match self.receive(&mut stream, peer).await {
            Ok(ReceiveOutcome::Rejected(reason)) => {
                info!("rejected transfer from {peer}: {reason}");
            }
            Ok(ReceiveOutcome::Completed(done)) => {
                info!(
                    "done: {} bytes from {peer} saved as '{}'",
                    done.bytes_received, done.saved_as
                );
            }
            Err(e) => {
                warn!("transfer from {peer} failed: {e}");
                send_event(
                    self.events.as_ref(),
                    TransferEvent::ReceiveFailed {
                        peer,
                        error: e.to_string(),
                    },
                );
            }
        }

        debug!("disconnected {peer}");
    }

    /// Runs the receive side of the protocol over any duplex byte stream.
    pub async fn receive<S>(&self, stream: &mut S, peer: SocketAddr) -> Result<ReceiveOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // a bad header ends the connection without a reply
        let header: Header = frame::read_frame(stream).await?;

        let filesize = match self.validate(&header) {
            Ok(size) => size,
            Err(e) => {
                let reason = match e {
                    TransferError::Validation(reason) => reason,
                    other => other.to_string(),
                };
                frame::write_frame(stream, &Acceptance::error(reason.clone())).await?;
                send_event(
                    self.events.as_ref(),
                    TransferEvent::Rejected {
                        peer,
                        filename: header.filename,
                        reason: reason.clone(),
                    },
                );
                return Ok(ReceiveOutcome::Rejected(reason));
            }
        };

        send_event(
            self.events.as_ref(),
            TransferEvent::Incoming {
                peer,
                filename: header.filename.clone(),
                filesize,
            },
        );

        let dir = &self.config.receive_dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            error!("could not create receive directory {dir:?}: {e}");
            frame::write_frame(stream, &Acceptance::error("Could not prepare receive directory."))
                .await?;
            return Err(e.into());
        }

        let (mut file, path, renamed) = match naming::create_unique(dir, &header.filename).await {
            Ok(created) => created,
            Err(e) => {
                error!("could not create file for '{}': {e}", header.filename);
                frame::write_frame(stream, &Acceptance::error("Could not create destination file."))
                    .await?;
                return Err(e.into());
            }
        };
        let save_as = naming::display_name(&path);
        frame::write_frame(stream, &Acceptance::ok(save_as.clone())).await?;

        info!(
            "receiving '{}' ({filesize} bytes) from {peer} -> {path:?}",
            header.filename
        );

        let mut buf = vec![0u8; self.config.io_chunk_size.max(1)];
        let mut received: u64 = 0;
        while received < filesize {
            let want = (filesize - received).min(buf.len() as u64) as usize;
            let n = match stream.read(&mut buf[..want]).await {
                Ok(0) => {
                    let _ = file.flush().await;
                    return Err(TransferError::Connection(format!(
                        "connection closed after {received} of {filesize} bytes"
                    )));
                }
                Ok(n) => n,
                Err(e) => {
                    let _ = file.flush().await;
                    return Err(TransferError::connection(e));
                }
            };

            if let Err(e) = file.write_all(&buf[..n]).await {
                return Err(self.disk_failure(stream, &save_as, received, e).await);
            }

            let before = received;
            received += n as u64;
            if progress_due(before, received, filesize) {
                debug!("progress: {received}/{filesize} bytes for '{save_as}'");
                send_event(
                    self.events.as_ref(),
                    TransferEvent::Receiving {
                        peer,
                        save_as: save_as.clone(),
                        received,
                        total: filesize,
                    },
                );
            }
        }

        if let Err(e) = file.flush().await {
            return Err(self.disk_failure(stream, &save_as, received, e).await);
        }
        drop(file);

        let completion = Completion::done(save_as.clone(), received, renamed);
        frame::write_frame(stream, &completion).await?;

        send_event(
            self.events.as_ref(),
            TransferEvent::Received {
                peer,
                saved_as: save_as,
                bytes: received,
                renamed,
                sha256: digest(path).await,
            },
        );

        Ok(ReceiveOutcome::Completed(completion))
    }

    /// Checks a header against the configured limits; returns the size.
    pub fn validate(&self, header: &Header) -> Result<u64> {
        let filesize = header
            .declared_size()
            .map_err(|reason| TransferError::Validation(reason.into()))?;

        if filesize > self.config.max_file_size {
            return Err(TransferError::Validation(format!(
                "File too large. Limit is {} bytes.",
                self.config.max_file_size
            )));
        }

        if !is_bare_filename(&header.filename) {
            return Err(TransferError::Validation("Invalid filename.".into()));
        }

        if !self.config.extension_allowed(&header.filename) {
            return Err(TransferError::Validation(format!(
                "Extension of '{}' not allowed.",
                header.filename
            )));
        }

        Ok(filesize)
    }

    // reports a local write failure to the peer; the partial file stays
    async fn disk_failure<S>(
        &self,
        stream: &mut S,
        save_as: &str,
        received: u64,
        e: std::io::Error,
    ) -> TransferError
    where
        S: AsyncWrite + Unpin,
    {
        error!("could not write '{save_as}': {e}");
        let reply = Completion::error(save_as, received, format!("Could not write file: {e}"));
        if let Err(send_err) = frame::write_frame(stream, &reply).await {
            debug!("could not report write failure to peer: {send_err}");
        }
        e.into()
    }
}

/// A bare basename: no separators, no NUL, not `.`/`..`, not empty.
pub fn is_bare_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

async fn digest(path: PathBuf) -> Option<String> {
    match tokio::task::spawn_blocking(move || sha256::try_digest(path.as_path())).await {
        Ok(Ok(hash)) => Some(hash),
        Ok(Err(e)) => {
            warn!("could not hash received file: {e}");
            None
        }
        Err(e) => {
            warn!("hashing task failed: {e}");
            None
        }
    }
}
