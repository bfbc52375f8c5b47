#![allow(dead_code)]

use std::net::SocketAddr;

use filebridge::{Config, EventTx, Receiver};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

pub struct RunningReceiver {
    pub addr: SocketAddr,
    pub dir: TempDir,
    stop: mpsc::Sender<()>,
    task: JoinHandle<filebridge::Result<()>>,
}

impl RunningReceiver {
    pub async fn start() -> Self {
        Self::start_with(|_| {}, None).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Config), events: Option<EventTx>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            receive_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        tweak(&mut config);

        let mut receiver = Receiver::new(config);
        if let Some(tx) = events {
            receiver = receiver.with_events(tx);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { receiver.serve(listener, stop_rx).await });

        Self {
            addr,
            dir,
            stop,
            task,
        }
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(name)).unwrap()
    }

    pub fn file_count(&self) -> usize {
        std::fs::read_dir(self.dir.path()).unwrap().count()
    }

    /// Stops accepting, waits for in-flight connections, keeps the directory.
    pub async fn stop(self) -> TempDir {
        self.stop.send(()).await.unwrap();
        self.task.await.unwrap().unwrap();
        self.dir
    }
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
