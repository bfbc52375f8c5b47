pub mod config;
pub mod error;
pub mod frame;
pub mod http_server;
pub mod models;
pub mod naming;
pub mod receiver;
pub mod relay;
pub mod relay_client;
pub mod sender;

use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;

pub use config::Config;
pub use error::{Result, TransferError};
pub use receiver::Receiver;
pub use relay::{SessionManager, SessionStatus};

pub const DEFAULT_RECEIVER_PORT: u16 = 5001;
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Size of each bounded socket/file read and write.
pub const IO_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Progress is reported each time a transfer crosses a multiple of this.
pub const PROGRESS_STEP: u64 = 1024 * 1024;

/// Output events for whatever UI sits on top of the receiver or relay.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Incoming {
        peer: SocketAddr,
        filename: String,
        filesize: u64,
    },
    Rejected {
        peer: SocketAddr,
        filename: String,
        reason: String,
    },
    Receiving {
        peer: SocketAddr,
        save_as: String,
        received: u64,
        total: u64,
    },
    Received {
        peer: SocketAddr,
        saved_as: String,
        bytes: u64,
        renamed: bool,
        sha256: Option<String>,
    },
    ReceiveFailed {
        peer: SocketAddr,
        error: String,
    },
    SessionOpened {
        session_id: String,
        save_as: String,
        total: u64,
    },
    Forwarded {
        session_id: String,
        forwarded: u64,
        total: u64,
    },
    SessionClosed {
        session_id: String,
        outcome: SessionStatus,
    },
}

pub type EventTx = UnboundedSender<TransferEvent>;

pub(crate) fn send_event(tx: Option<&EventTx>, event: TransferEvent) {
    if let Some(tx) = tx {
        if let Err(e) = tx.send(event) {
            log::debug!("no listener for transfer event {:?}", e.0);
        }
    }
}

/// True when moving from `before` to `after` bytes passes a progress step, or
/// the transfer just finished.
pub(crate) fn progress_due(before: u64, after: u64, total: u64) -> bool {
    after == total || before / PROGRESS_STEP != after / PROGRESS_STEP
}
