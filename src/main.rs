use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::mpsc;

use filebridge::{
    http_server::RelayServer,
    models::Completion,
    relay_client::{RelayClient, DEFAULT_UPLOAD_CHUNK},
    sender::{self, SendOptions},
    Config, Receiver, SessionManager,
};

#[derive(Debug, Parser)]
#[command(name = "filebridge", about = "TCP file transfer with an HTTP session relay")]
struct Cli {
    /// Config file (defaults to filebridge.toml in the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the TCP receiver
    Receive {
        /// Listen address (host:port)
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Directory to store received files in
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run the HTTP relay
    Relay {
        /// Listen address (host:port)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Send a file straight to a receiver over TCP
    Send {
        host: String,
        port: u16,
        file: PathBuf,
    },
    /// Send a file to a receiver through an HTTP relay
    Push {
        /// Relay base URL, e.g. http://127.0.0.1:8000
        relay: String,
        host: String,
        port: u16,
        file: PathBuf,
        /// Bytes per /chunk request
        #[arg(long, default_value_t = DEFAULT_UPLOAD_CHUNK)]
        chunk_size: usize,
    },
    /// Run the receiver and the relay side by side
    Demo,
}

#[tokio::main]
async fn main() -> filebridge::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new()?,
    };

    match cli.command {
        Command::Receive { bind, dir } => {
            if let Some(bind) = bind {
                config.receiver_addr = bind;
            }
            if let Some(dir) = dir {
                config.receive_dir = dir;
            }
            run_receiver(config, stop_on_ctrl_c()).await
        }
        Command::Relay { bind } => {
            if let Some(bind) = bind {
                config.http_addr = bind;
            }
            run_relay(config, stop_on_ctrl_c()).await
        }
        Command::Send { host, port, file } => {
            let completion =
                sender::send_file((host.as_str(), port), &file, SendOptions::from(&config)).await?;
            report(&completion);
            Ok(())
        }
        Command::Push {
            relay,
            host,
            port,
            file,
            chunk_size,
        } => {
            let client = RelayClient::new(relay).with_chunk_size(chunk_size);
            let completion = client.push_file(&host, port, &file).await?;
            report(&completion);
            Ok(())
        }
        Command::Demo => {
            let (receiver_stop, receiver_rx) = mpsc::channel(1);
            let (relay_stop, relay_rx) = mpsc::channel(1);
            tokio::spawn(async move {
                wait_for_ctrl_c().await;
                let _ = receiver_stop.send(()).await;
                let _ = relay_stop.send(()).await;
            });

            info!(
                "demo: relay on http://{} forwarding to receivers such as 127.0.0.1:{}",
                config.http_addr,
                config.receiver_addr.port()
            );
            let (received, relayed) = tokio::join!(
                run_receiver(config.clone(), receiver_rx),
                run_relay(config, relay_rx)
            );
            received.and(relayed)
        }
    }
}

async fn run_receiver(config: Config, stop_rx: mpsc::Receiver<()>) -> filebridge::Result<()> {
    let receiver = Receiver::new(config);
    let listener = receiver.bind().await?;
    receiver.serve(listener, stop_rx).await
}

async fn run_relay(config: Config, stop_rx: mpsc::Receiver<()>) -> filebridge::Result<()> {
    let relay = SessionManager::new(config.connect_timeout());
    let server = RelayServer::new(relay, &config);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    server.start_http_server(listener, stop_rx).await
}

fn stop_on_ctrl_c() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        let _ = tx.send(()).await;
    });
    rx
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // without a signal handler we keep running until killed
        error!("could not listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

fn report(completion: &Completion) {
    if completion.is_done() {
        info!(
            "saved as '{}' ({} bytes{})",
            completion.saved_as,
            completion.bytes_received,
            if completion.renamed { ", renamed" } else { "" }
        );
    } else {
        error!("transfer failed: {}", completion.message);
        std::process::exit(1);
    }
}
