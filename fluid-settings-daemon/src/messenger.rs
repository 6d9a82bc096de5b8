//! The permanent communicator-bus connection.
//!
//! The messenger owns the TCP socket to the communicator, registers the
//! daemon as `fluid_settings`, forwards every inbound message to the
//! server actor and writes whatever the server queues. It reconnects
//! forever with a fixed pause; messages queued while disconnected are
//! dropped with a log line, since the gossip timer and the next change
//! regenerate everything that matters.

use crate::server::ServerEvent;
use fluid_settings_model::{commands, Address, Message};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

const MAX_LINE_LENGTH: usize = 1024 * 1024;
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 1024;

/// Spawn the messenger task. Returns the queue the server writes to.
pub fn spawn(
    bus_address: String,
    server_name: String,
    event_tx: mpsc::Sender<ServerEvent>,
) -> mpsc::Sender<Message> {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    tokio::spawn(run(bus_address, server_name, event_tx, rx));
    tx
}

async fn run(
    bus_address: String,
    server_name: String,
    event_tx: mpsc::Sender<ServerEvent>,
    mut rx: mpsc::Receiver<Message>,
) {
    loop {
        match TcpStream::connect(&bus_address).await {
            Ok(stream) => {
                info!("connected to the communicator at {bus_address}");
                if !drive(stream, &server_name, &event_tx, &mut rx).await {
                    return;
                }
                warn!("lost the communicator connection");
            }
            Err(e) => {
                debug!("cannot reach the communicator at {bus_address}: {e}");
            }
        }
        if !pause_draining(&mut rx).await {
            return;
        }
    }
}

/// Serve one established connection. Returns false when the daemon is
/// shutting down (the server dropped its end).
async fn drive(
    stream: TcpStream,
    server_name: &str,
    event_tx: &mpsc::Sender<ServerEvent>,
    rx: &mut mpsc::Receiver<Message>,
) -> bool {
    let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let mut register = Message::new(commands::REGISTER);
    register.from = Some(Address::new(server_name, "fluid_settings"));
    register.set_param("service", "fluid_settings");
    register.set_param("version", "1");
    if conn.send(register.to_line()).await.is_err() {
        return true;
    }

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(msg) => {
                    if let Err(e) = conn.send(msg.to_line()).await {
                        warn!("cannot write to the communicator: {e}");
                        return true;
                    }
                }
                None => return false,
            },
            line = conn.next() => match line {
                Some(Ok(line)) => match Message::from_line(&line) {
                    Ok(msg) => {
                        if event_tx.send(ServerEvent::Bus(msg)).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => warn!("unparseable message from the communicator: {e}"),
                },
                Some(Err(e)) => {
                    warn!("communicator read error: {e}");
                    return true;
                }
                None => return true,
            },
        }
    }
}

/// Wait out the reconnect pause, dropping whatever the server queues in
/// the meantime. Returns false when the server is gone.
async fn pause_draining(rx: &mut mpsc::Receiver<Message>) -> bool {
    let pause = tokio::time::sleep(RECONNECT_PAUSE);
    tokio::pin!(pause);
    loop {
        tokio::select! {
            _ = &mut pause => return true,
            msg = rx.recv() => match msg {
                Some(msg) => debug!("communicator is down; {} dropped", msg.command),
                None => return false,
            },
        }
    }
}
