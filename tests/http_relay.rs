mod common;

use std::time::Duration;

use common::{patterned, RunningReceiver};
use filebridge::{
    frame,
    http_server::RelayServer,
    models::{Acceptance, CompletionStatus, Header, ReplyStatus},
    relay_client::RelayClient,
    Config, SessionManager, SessionStatus, TransferError,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

struct RunningRelay {
    client: RelayClient,
    base_url: String,
    stop: mpsc::Sender<()>,
    task: JoinHandle<filebridge::Result<()>>,
}

impl RunningRelay {
    async fn start(max_chunk_body: usize) -> Self {
        let config = Config {
            max_chunk_body,
            ..Default::default()
        };
        let server = RelayServer::new(SessionManager::new(Duration::from_secs(2)), &config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { server.start_http_server(listener, stop_rx).await });

        Self {
            client: RelayClient::new(base_url.clone()),
            base_url,
            stop,
            task,
        }
    }

    async fn shutdown(self) {
        self.stop.send(()).await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn relay_status(err: TransferError) -> (u16, String) {
    match err {
        TransferError::Relay { status, message } => (status, message),
        other => panic!("expected a relay error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_file_through_relay() {
    let receiver = RunningReceiver::start().await;
    let relay = RunningRelay::start(64 * 1024).await;

    let src = tempfile::tempdir().unwrap();
    let path = src.path().join("photo.raw");
    let payload = patterned(200_000);
    std::fs::write(&path, &payload).unwrap();

    let client = relay.client.clone().with_chunk_size(30_000);
    let completion = client
        .push_file("127.0.0.1", receiver.addr.port(), &path)
        .await
        .unwrap();

    assert_eq!(completion.status, CompletionStatus::Done);
    assert_eq!(completion.bytes_received, payload.len() as u64);
    assert_eq!(receiver.read("photo.raw"), payload);
    assert_eq!(relay.client.status().await.unwrap().active_sessions, 0);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overshooting_chunk_is_bad_request_and_session_survives() {
    let receiver = RunningReceiver::start().await;
    let relay = RunningRelay::start(1024).await;
    let client = &relay.client;

    let begun = client
        .begin("127.0.0.1", receiver.addr.port(), "report.txt", 10)
        .await
        .unwrap();
    assert_eq!(begun.status, ReplyStatus::Ok);
    assert_eq!(begun.session_id.len(), 32);

    client.chunk(&begun.session_id, b"Hello,".to_vec()).await.unwrap();
    let (status, _) = relay_status(
        client
            .chunk(&begun.session_id, b"World!".to_vec())
            .await
            .unwrap_err(),
    );
    assert_eq!(status, 400);

    // early end is refused too
    let (status, _) = relay_status(client.end(&begun.session_id).await.unwrap_err());
    assert_eq!(status, 400);

    let ack = client.chunk(&begun.session_id, b"Worl".to_vec()).await.unwrap();
    assert_eq!((ack.received, ack.remaining), (10, 0));

    let completion = client.end(&begun.session_id).await.unwrap();
    assert!(completion.is_done());
    assert_eq!(receiver.read("report.txt"), b"Hello,Worl");

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_lists_open_sessions_and_cancel_is_idempotent() {
    let receiver = RunningReceiver::start().await;
    let relay = RunningRelay::start(1024).await;
    let client = &relay.client;

    let begun = client
        .begin("127.0.0.1", receiver.addr.port(), "held.bin", 4)
        .await
        .unwrap();
    client.chunk(&begun.session_id, b"ab".to_vec()).await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.active_sessions, 1);
    let summary = &status.sessions[0];
    assert_eq!(summary.session_id, begun.session_id);
    assert_eq!(summary.save_as, "held.bin");
    assert_eq!((summary.forwarded, summary.total), (2, 4));
    assert_eq!(summary.status, SessionStatus::Streaming);

    let first = client.cancel(&begun.session_id).await.unwrap();
    assert_eq!(first.status, ReplyStatus::Ok);
    assert_eq!(first.message, "Canceled");
    let second = client.cancel(&begun.session_id).await.unwrap();
    assert_eq!(second.status, ReplyStatus::Ok);
    assert_eq!(second.message, "No session");

    assert_eq!(client.status().await.unwrap().active_sessions, 0);
    let (status, message) = relay_status(client.chunk(&begun.session_id, b"cd".to_vec()).await.unwrap_err());
    assert_eq!(status, 404);
    assert_eq!(message, "Invalid session");

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn begin_validation_and_receiver_rejection() {
    let receiver = RunningReceiver::start().await;
    let relay = RunningRelay::start(1024).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/begin", relay.base_url))
        .query(&[("host", "127.0.0.1"), ("port", "not-a-port"), ("filename", "a"), ("filesize", "1")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ERROR");
    assert_eq!(body["message"], "Invalid port");

    let (status, message) = relay_status(
        relay
            .client
            .begin("127.0.0.1", receiver.addr.port(), "../escape", 1)
            .await
            .unwrap_err(),
    );
    assert_eq!(status, 400);
    assert_eq!(message, "Invalid filename.");
    assert_eq!(relay.client.status().await.unwrap().active_sessions, 0);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_receiver_is_bad_gateway() {
    // grab a free port and release it so nothing listens there
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let relay = RunningRelay::start(1024).await;

    let (status, _) = relay_status(
        relay
            .client
            .begin("127.0.0.1", port, "x.txt", 1)
            .await
            .unwrap_err(),
    );
    assert_eq!(status, 502);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunk_body_over_limit_is_refused() {
    let receiver = RunningReceiver::start().await;
    let relay = RunningRelay::start(16).await;
    let client = &relay.client;

    let begun = client
        .begin("127.0.0.1", receiver.addr.port(), "big.bin", 100)
        .await
        .unwrap();
    let (status, _) = relay_status(client.chunk(&begun.session_id, vec![0u8; 64]).await.unwrap_err());
    assert_eq!(status, 413);

    let ack = client.chunk(&begun.session_id, vec![1u8; 16]).await.unwrap();
    assert_eq!(ack.received, 16);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_session_id_is_bad_request() {
    let relay = RunningRelay::start(1024).await;
    let response = reqwest::Client::new()
        .post(format!("{}/end", relay.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_releases_end_waiting_on_silent_receiver() {
    // accepts the header, swallows the payload and never sends a completion
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let receiver = tokio::spawn(async move {
        let (mut stream, _) = silent.accept().await.unwrap();
        let header: Header = frame::read_frame(&mut stream).await.unwrap();
        frame::write_frame(&mut stream, &Acceptance::ok(header.filename))
            .await
            .unwrap();
        let mut sink = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut sink).await;
        sink
    });

    let relay = RunningRelay::start(1024).await;
    let begun = relay
        .client
        .begin("127.0.0.1", port, "stuck.txt", 3)
        .await
        .unwrap();
    relay
        .client
        .chunk(&begun.session_id, b"abc".to_vec())
        .await
        .unwrap();

    let pending = {
        let client = relay.client.clone();
        let id = begun.session_id.clone();
        tokio::spawn(async move { client.end(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    tokio::time::timeout(Duration::from_secs(5), relay.shutdown())
        .await
        .expect("relay shutdown stalled behind /end");

    let (status, _) = relay_status(pending.await.unwrap().unwrap_err());
    assert_eq!(status, 502);
    assert_eq!(receiver.await.unwrap(), b"abc");
}
