//! HTTP-to-TCP session relay.
//!
//! Each in-flight transfer owns one TCP connection to a receiver, parked in
//! the session table behind an unguessable id. Callers push the payload in
//! bounded pieces with [`SessionManager::chunk`] and collect the receiver's
//! completion with [`SessionManager::end`].
//!
//! The table lock only covers lookup/insert/remove. Forwarding happens under
//! the session's own lock, so different sessions forward concurrently while
//! chunks for one session are written in order.
//!
//! A `chunk` or `end` whose future is dropped halfway (the HTTP client went
//! away) leaves the byte stream in an unknown state, so the session is
//! failed and discarded rather than kept around.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{watch, Mutex},
};
use uuid::Uuid;

use crate::{
    error::{Result, TransferError},
    models::{BeginResponse, ChunkAck, Completion, Header, ReplyStatus},
    progress_due, send_event, sender, EventTx, TransferEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    Streaming,
    /// Every byte forwarded, waiting on the receiver's completion.
    Ending,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    forwarded: u64,
    status: SessionStatus,
}

pub struct TransferSession {
    pub session_id: String,
    pub destination: SocketAddr,
    pub declared_size: u64,
    pub resolved_name: String,
    // set once the session leaves the table; wakes a chunk or end blocked on the socket
    closed: watch::Sender<bool>,
    progress: watch::Sender<Progress>,
    stream: Mutex<Option<TcpStream>>,
}

impl TransferSession {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn forwarded(&self) -> u64 {
        self.progress.borrow().forwarded
    }

    fn set_status(&self, status: SessionStatus) {
        self.progress.send_modify(|p| p.status = status);
    }

    /// Resolves once the session has been closed by someone else.
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    // marks the session closed and releases the socket unless a caller holds it
    fn close(&self, outcome: SessionStatus) {
        self.closed.send_replace(true);
        self.set_status(outcome);
        if let Ok(mut stream) = self.stream.try_lock() {
            *stream = None;
        }
    }
}

/// Point-in-time view of one open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub save_as: String,
    pub destination: SocketAddr,
    pub forwarded: u64,
    pub total: u64,
    pub status: SessionStatus,
}

pub type Sessions = Arc<Mutex<HashMap<String, Arc<TransferSession>>>>;

#[derive(Clone)]
pub struct SessionManager {
    sessions: Sessions,
    connect_timeout: Duration,
    events: Option<EventTx>,
}

impl SessionManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: EventTx) -> Self {
        self.events = Some(tx);
        self
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Summaries of all open sessions, ordered by id. Never waits on a
    /// session that is busy forwarding.
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|session| {
                let progress = *session.progress.borrow();
                SessionSummary {
                    session_id: session.session_id.clone(),
                    save_as: session.resolved_name.clone(),
                    destination: session.destination,
                    forwarded: progress.forwarded,
                    total: session.declared_size,
                    status: progress.status,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Connects to the receiver and performs the header/acceptance exchange.
    /// A session exists only if the receiver accepted.
    pub async fn begin(
        &self,
        host: &str,
        port: u16,
        filename: &str,
        filesize: u64,
    ) -> Result<BeginResponse> {
        if host.trim().is_empty() || port == 0 {
            return Err(TransferError::Validation("Invalid host or port".into()));
        }

        let header = Header::new(filename, filesize);
        let (stream, acceptance) =
            sender::open((host, port), &header, self.connect_timeout).await?;
        let destination = stream.peer_addr()?;

        let session_id = Uuid::new_v4().simple().to_string();
        let session = Arc::new(TransferSession {
            session_id: session_id.clone(),
            destination,
            declared_size: filesize,
            resolved_name: acceptance.save_as.clone(),
            closed: watch::Sender::new(false),
            progress: watch::Sender::new(Progress {
                forwarded: 0,
                status: SessionStatus::Created,
            }),
            stream: Mutex::new(Some(stream)),
        });

        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), session);

        info!(
            "session {session_id}: '{filename}' ({filesize} bytes) -> {destination} as '{}'",
            acceptance.save_as
        );
        send_event(
            self.events.as_ref(),
            TransferEvent::SessionOpened {
                session_id: session_id.clone(),
                save_as: acceptance.save_as.clone(),
                total: filesize,
            },
        );

        Ok(BeginResponse {
            status: ReplyStatus::Ok,
            session_id,
            save_as: acceptance.save_as,
        })
    }

    /// Forwards `bytes` verbatim. Refuses anything that would overshoot the
    /// declared size; a socket failure closes and discards the session.
    pub async fn chunk(&self, session_id: &str, bytes: &[u8]) -> Result<ChunkAck> {
        let session = self.lookup(session_id).await?;
        // declared before the stream lock so it is dropped after it
        let mut in_flight = InFlight::new(self, &session);
        let mut slot = session.stream.lock().await;

        if session.is_closed() {
            return Err(TransferError::UnknownSession(session_id.to_string()));
        }
        let Some(stream) = slot.as_mut() else {
            return Err(TransferError::UnknownSession(session_id.to_string()));
        };

        let forwarded = session.forwarded();
        let remaining = session.declared_size - forwarded;
        let len = bytes.len() as u64;
        if len > remaining {
            return Err(TransferError::Conservation(format!(
                "chunk of {len} bytes exceeds the {remaining} bytes remaining \
                 ({forwarded} of {} forwarded)",
                session.declared_size
            )));
        }

        in_flight.arm();
        let written = tokio::select! {
            r = async {
                stream.write_all(bytes).await?;
                stream.flush().await
            } => r.map_err(TransferError::connection),
            _ = session.wait_closed() => {
                Err(TransferError::Connection("session canceled while forwarding".into()))
            }
        };
        in_flight.disarm();

        if let Err(e) = written {
            *slot = None;
            drop(slot);
            if !session.is_closed() {
                warn!("session {session_id}: forwarding failed, discarding: {e}");
                self.discard(session_id, SessionStatus::Failed).await;
            }
            return Err(e);
        }

        let received = forwarded + len;
        session.progress.send_modify(|p| {
            p.forwarded = received;
            p.status = SessionStatus::Streaming;
        });
        let remaining = session.declared_size - received;

        if progress_due(forwarded, received, session.declared_size) {
            debug!(
                "session {session_id}: forwarding {received}/{} bytes",
                session.declared_size
            );
            send_event(
                self.events.as_ref(),
                TransferEvent::Forwarded {
                    session_id: session_id.to_string(),
                    forwarded: received,
                    total: session.declared_size,
                },
            );
        }

        Ok(ChunkAck {
            status: ReplyStatus::Ok,
            received,
            remaining,
        })
    }

    /// Waits for the receiver's completion once every declared byte has been
    /// forwarded. Ending early is refused and leaves the session open. The
    /// session stays in the table while waiting, so `cancel` can cut it short.
    pub async fn end(&self, session_id: &str) -> Result<Completion> {
        let session = self.lookup(session_id).await?;
        let mut in_flight = InFlight::new(self, &session);
        let mut slot = session.stream.lock().await;

        if session.is_closed() {
            return Err(TransferError::UnknownSession(session_id.to_string()));
        }
        let forwarded = session.forwarded();
        if forwarded != session.declared_size {
            return Err(TransferError::Conservation(format!(
                "end requested after {forwarded} of {} declared bytes",
                session.declared_size
            )));
        }
        let Some(mut stream) = slot.take() else {
            return Err(TransferError::UnknownSession(session_id.to_string()));
        };
        session.set_status(SessionStatus::Ending);

        in_flight.arm();
        let result = tokio::select! {
            r = sender::await_completion(&mut stream) => r,
            _ = session.wait_closed() => {
                Err(TransferError::Connection("session canceled while waiting for completion".into()))
            }
        };
        in_flight.disarm();
        drop(stream);
        drop(slot);

        // whoever closed the session already removed it and reported it
        if self.sessions.lock().await.remove(session_id).is_some() {
            let outcome = match &result {
                Ok(completion) if completion.is_done() => SessionStatus::Completed,
                _ => SessionStatus::Failed,
            };
            session.close(outcome);

            match &result {
                Ok(c) => info!(
                    "session {session_id}: {:?} '{}' ({} bytes): {}",
                    c.status, c.saved_as, c.bytes_received, c.message
                ),
                Err(e) => warn!("session {session_id}: no completion from receiver: {e}"),
            }
            send_event(
                self.events.as_ref(),
                TransferEvent::SessionClosed {
                    session_id: session_id.to_string(),
                    outcome,
                },
            );
        }

        result
    }

    /// Closes and forgets the session. Unknown or already closed ids are
    /// fine; returns whether there was anything to cancel.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let canceled = self.discard(session_id, SessionStatus::Canceled).await;
        if canceled {
            info!("session {session_id}: canceled");
        } else {
            debug!("cancel for unknown session {session_id}");
        }
        canceled
    }

    /// Cancels every open session, used on shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        if !ids.is_empty() {
            info!("canceling {} open session(s)", ids.len());
        }
        for id in ids {
            self.cancel(&id).await;
        }
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<TransferSession>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| TransferError::UnknownSession(session_id.to_string()))
    }

    // removes the session and releases its socket
    async fn discard(&self, session_id: &str, outcome: SessionStatus) -> bool {
        let Some(session) = self.sessions.lock().await.remove(session_id) else {
            return false;
        };
        // a chunk or end holding the stream sees the flag and lets go itself
        session.close(outcome);
        self.closed_event(session_id, outcome);
        true
    }

    fn closed_event(&self, session_id: &str, outcome: SessionStatus) {
        send_event(
            self.events.as_ref(),
            TransferEvent::SessionClosed {
                session_id: session_id.to_string(),
                outcome,
            },
        );
    }
}

/// Fails the session if dropped while armed, i.e. when the future driving a
/// socket operation is abandoned before the operation finished.
struct InFlight<'a> {
    manager: &'a SessionManager,
    session: &'a TransferSession,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(manager: &'a SessionManager, session: &'a TransferSession) -> Self {
        Self {
            manager,
            session,
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let session_id = self.session.session_id.clone();
        warn!("session {session_id}: request dropped mid-operation, discarding");
        self.session.close(SessionStatus::Failed);

        let sessions = self.manager.sessions.clone();
        match sessions.try_lock() {
            Ok(mut table) => {
                table.remove(&session_id);
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let id = session_id.clone();
                    let sessions = self.manager.sessions.clone();
                    handle.spawn(async move {
                        sessions.lock().await.remove(&id);
                    });
                }
                Err(e) => warn!("session {session_id}: left in table, no runtime: {e}"),
            },
        }
        self.manager.closed_event(&session_id, SessionStatus::Failed);
    }
}
