//! The daemon's central actor.
//!
//! One task owns the settings store, the subscription registry and the
//! peer table. The messenger, the peer listener, every replication link
//! and the shutdown handler all feed it [`ServerEvent`]s over a single
//! channel, which serializes every access to the shared state. Two timers
//! live directly in the loop: the gossip interval rearms itself, the save
//! timer arms at most once per burst of changes and disarms after firing.

use crate::config::DaemonConfig;
use fluid_settings::{persist, SettingsStore, SubscriptionRegistry};
use fluid_settings_model::{commands, Address, Message};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub type PeerId = u64;

/// Which side initiated a replication link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Inbound,
    Outbound,
}

/// Where a store mutation came from, for broadcast loop avoidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Peer,
}

#[derive(Debug)]
pub(crate) struct PeerLink {
    pub kind: PeerKind,
    pub remote: SocketAddr,
    pub tx: mpsc::Sender<Message>,
}

/// Everything that can happen to the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A message from the communicator bus.
    Bus(Message),
    /// A replication link came up.
    PeerConnected {
        id: PeerId,
        kind: PeerKind,
        remote: SocketAddr,
        tx: mpsc::Sender<Message>,
    },
    /// A message arrived on a replication link.
    PeerMessage { id: PeerId, msg: Message },
    /// A replication link is gone for good.
    PeerGone { id: PeerId },
    /// Stop the daemon; `restart` asks the supervisor to bring it back.
    Shutdown { restart: bool },
}

pub struct Server {
    pub(crate) config: DaemonConfig,
    pub(crate) store: SettingsStore,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) peers: HashMap<PeerId, PeerLink>,
    pub(crate) outbound_targets: HashSet<SocketAddr>,
    pub(crate) bus_tx: mpsc::Sender<Message>,
    pub(crate) event_tx: mpsc::Sender<ServerEvent>,
    event_rx: mpsc::Receiver<ServerEvent>,
    pub(crate) listener_address: SocketAddr,
    save_due: Option<Instant>,
    pub(crate) exit_code: Option<i32>,
}

impl Server {
    pub fn new(
        config: DaemonConfig,
        store: SettingsStore,
        listener_address: SocketAddr,
        bus_tx: mpsc::Sender<Message>,
        event_tx: mpsc::Sender<ServerEvent>,
        event_rx: mpsc::Receiver<ServerEvent>,
    ) -> Self {
        Self {
            config,
            store,
            registry: SubscriptionRegistry::new(),
            peers: HashMap::new(),
            outbound_targets: HashSet::new(),
            bus_tx,
            event_tx,
            event_rx,
            listener_address,
            save_due: None,
            exit_code: None,
        }
    }

    /// Run until told to stop. Returns the process exit code.
    pub async fn run(mut self) -> i32 {
        let gossip_period = Duration::from_secs(self.config.gossip_timeout);
        let mut gossip =
            tokio::time::interval_at(Instant::now() + gossip_period, gossip_period);

        loop {
            if let Some(code) = self.exit_code {
                self.finish().await;
                return code;
            }

            let save_due = self.save_due;
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.finish().await;
                        return 0;
                    }
                },
                _ = gossip.tick() => self.send_gossip().await,
                _ = maybe_sleep_until(save_due) => {
                    self.save_due = None;
                    self.save_settings();
                }
            }
        }
    }

    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Bus(msg) => self.dispatch_bus(msg).await,
            ServerEvent::PeerConnected {
                id,
                kind,
                remote,
                tx,
            } => {
                info!("{kind:?} replication link {id} with {remote}");
                self.peers.insert(id, PeerLink { kind, remote, tx });
            }
            ServerEvent::PeerMessage { id, msg } => self.dispatch_peer(id, msg).await,
            ServerEvent::PeerGone { id } => {
                if let Some(link) = self.peers.remove(&id) {
                    info!("replication link {id} with {} closed", link.remote);
                    if link.kind == PeerKind::Outbound {
                        self.outbound_targets.remove(&link.remote);
                    }
                }
            }
            ServerEvent::Shutdown { restart } => {
                self.exit_code = Some(if restart { 1 } else { 0 });
            }
        }
    }

    /// React to a successful store mutation of `name`: notify every
    /// subscriber, replicate to peers unless the change came from one,
    /// and arm the save timer.
    pub(crate) async fn value_changed(&mut self, name: &str, origin: ChangeOrigin) {
        let effective = self.store.effective_value(name);
        for subscriber in self.registry.subscribers(name) {
            let mut update = Message::new(commands::VALUE_UPDATED);
            update.from = Some(self.my_address());
            update.to = Some(Address::new(&subscriber.server, &subscriber.service));
            update.set_param("name", name);
            match &effective {
                Some(value) => update.set_param("value", value),
                None => update.set_param("reason", "value undefined"),
            }
            self.bus_send(update).await;
        }

        if origin != ChangeOrigin::Peer {
            let push = Message::new(commands::VALUE_CHANGED)
                .with_param("name", name)
                .with_param("values", self.store.serialize(name));
            for link in self.peers.values() {
                if link.tx.try_send(push.clone()).is_err() {
                    warn!(
                        "replication link with {} is not draining; change to {name} dropped",
                        link.remote
                    );
                }
            }
        }

        self.arm_save_timer();
    }

    /// Arm the save timer unless a save is already due (coalescing).
    fn arm_save_timer(&mut self) {
        if self.save_due.is_none() {
            self.save_due =
                Some(Instant::now() + Duration::from_secs(self.config.save_timeout));
        }
    }

    pub(crate) fn save_settings(&mut self) {
        let path = self.config.settings.clone();
        if let Err(e) = persist::save(&self.store, Path::new(&path)) {
            // the in-memory state stays authoritative
            error!("cannot save settings to {path}: {e}");
        } else {
            debug!("settings saved to {path}");
        }
    }

    /// Announce our listener endpoint to the other fluid-settings
    /// daemons.
    pub(crate) async fn send_gossip(&mut self) {
        let mut gossip = Message::new(commands::GOSSIP);
        gossip.from = Some(self.my_address());
        gossip.to = Some(Address::service("fluid_settings"));
        gossip.set_param("my_ip", self.listener_address.to_string());
        self.bus_send(gossip).await;
    }

    pub(crate) fn my_address(&self) -> Address {
        Address::new(&self.config.server_name, "fluid_settings")
    }

    pub(crate) async fn bus_send(&mut self, msg: Message) {
        if self.bus_tx.send(msg).await.is_err() {
            warn!("the messenger is gone; message dropped");
        }
    }

    async fn finish(&mut self) {
        if self.save_due.is_some() {
            self.save_due = None;
            self.save_settings();
        }
        let mut unregister = Message::new(commands::UNREGISTER);
        unregister.from = Some(self.my_address());
        unregister.set_param("service", "fluid_settings");
        self.bus_send(unregister).await;
    }
}

async fn maybe_sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
