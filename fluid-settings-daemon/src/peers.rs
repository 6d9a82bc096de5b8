//! Peer replication links.
//!
//! Other fluid-settings daemons connect to our listener (inbound links)
//! or we connect to theirs (outbound links); which side dials is decided
//! by the gossip tie-break in [`precedes`]. Both kinds forward
//! `VALUE_CHANGED` messages to the server and write whatever broadcasts
//! the server queues on their per-link channel.
//!
//! An outbound link reconnects with a fixed pause and counts consecutive
//! failures; after [`ERROR_LIMIT`] in a row the link retires and a later
//! gossip may re-establish it. Inbound links die with their socket and
//! are never redialed from this side.

use crate::server::{PeerId, PeerKind, ServerEvent};
use fluid_settings_model::Message;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Consecutive failures after which an outbound link retires.
pub const ERROR_LIMIT: u32 = 10;

const MAX_LINE_LENGTH: usize = 1024 * 1024;
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const LINK_QUEUE: usize = 64;
const BACKLOG_LIMIT: usize = 256;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Total order on listener addresses for the gossip tie-break: the
/// daemon whose address precedes the other's initiates the connection.
/// IPv4 addresses compare as their IPv6-mapped form so mixed notations
/// of the same endpoint order consistently.
pub fn precedes(a: &SocketAddr, b: &SocketAddr) -> bool {
    fn key(addr: &SocketAddr) -> (u128, u16) {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
            IpAddr::V6(v6) => u128::from(v6),
        };
        (ip, addr.port())
    }
    key(a) < key(b)
}

/// Bind the peer listener and start accepting inbound links.
/// Returns the bound address (useful when the port was 0).
pub async fn spawn_listener(
    addr: SocketAddr,
    event_tx: mpsc::Sender<ServerEvent>,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("listening for fluid-settings peers on {bound}");
    tokio::spawn(accept_loop(listener, event_tx));
    Ok(bound)
}

async fn accept_loop(listener: TcpListener, event_tx: mpsc::Sender<ServerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let id = next_peer_id();
                tokio::spawn(run_inbound(id, stream, remote, event_tx.clone()));
            }
            Err(e) => {
                warn!("peer accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_inbound(
    id: PeerId,
    stream: TcpStream,
    remote: SocketAddr,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    let (tx, mut rx) = mpsc::channel(LINK_QUEUE);
    if event_tx
        .send(ServerEvent::PeerConnected {
            id,
            kind: PeerKind::Inbound,
            remote,
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(msg) => {
                    if conn.send(msg.to_line()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            line = conn.next() => match line {
                Some(Ok(line)) => match Message::from_line(&line) {
                    Ok(msg) => {
                        if event_tx.send(ServerEvent::PeerMessage { id, msg }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("unparseable message from peer {remote}: {e}"),
                },
                Some(Err(e)) => {
                    warn!("read error on the link with {remote}: {e}");
                    break;
                }
                None => break,
            },
        }
    }
    let _ = event_tx.send(ServerEvent::PeerGone { id }).await;
}

/// Dial another daemon's listener and keep the link alive.
pub fn spawn_outbound(target: SocketAddr, event_tx: mpsc::Sender<ServerEvent>) {
    let id = next_peer_id();
    tokio::spawn(run_outbound(id, target, event_tx));
}

async fn run_outbound(id: PeerId, target: SocketAddr, event_tx: mpsc::Sender<ServerEvent>) {
    let (tx, mut rx) = mpsc::channel(LINK_QUEUE);
    if event_tx
        .send(ServerEvent::PeerConnected {
            id,
            kind: PeerKind::Outbound,
            remote: target,
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut errors: u32 = 0;
    let mut backlog: VecDeque<Message> = VecDeque::new();
    'link: while errors < ERROR_LIMIT {
        let stream = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                errors += 1;
                debug!("cannot reach peer {target} ({errors}/{ERROR_LIMIT}): {e}");
                if errors >= ERROR_LIMIT {
                    break;
                }
                if !pause_buffering(&mut rx, &mut backlog).await {
                    return;
                }
                continue;
            }
        };
        // a successful connection resets the failure count
        errors = 0;
        info!("outbound replication link {id} with {target} established");
        let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        while let Some(msg) = backlog.pop_front() {
            if conn.send(msg.to_line()).await.is_err() {
                errors += 1;
                continue 'link;
            }
        }

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => {
                        if conn.send(msg.to_line()).await.is_err() {
                            errors += 1;
                            continue 'link;
                        }
                    }
                    None => break 'link,
                },
                line = conn.next() => match line {
                    Some(Ok(line)) => match Message::from_line(&line) {
                        Ok(msg) => {
                            if event_tx.send(ServerEvent::PeerMessage { id, msg }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("unparseable message from peer {target}: {e}"),
                    },
                    Some(Err(e)) => {
                        warn!("read error on the link with {target}: {e}");
                        errors += 1;
                        continue 'link;
                    }
                    None => {
                        errors += 1;
                        continue 'link;
                    }
                },
            }
        }
    }

    if errors >= ERROR_LIMIT {
        warn!("giving up on peer {target} after {ERROR_LIMIT} consecutive errors");
    }
    let _ = event_tx.send(ServerEvent::PeerGone { id }).await;
}

/// Wait out the reconnect pause, buffering queued broadcasts so they
/// reach the peer once the link is back. Returns false when the server
/// is gone.
async fn pause_buffering(rx: &mut mpsc::Receiver<Message>, backlog: &mut VecDeque<Message>) -> bool {
    let pause = tokio::time::sleep(RECONNECT_PAUSE);
    tokio::pin!(pause);
    loop {
        tokio::select! {
            _ = &mut pause => return true,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if backlog.len() >= BACKLOG_LIMIT {
                        backlog.pop_front();
                    }
                    backlog.push_back(msg);
                }
                None => return false,
            },
        }
    }
}
