//! Validation and reply logic for the control vocabulary.
//!
//! Every handler validates its parameters, canonicalizes any name read
//! off the wire, and emits exactly one reply (LISTEN additionally sends
//! the per-name replay and a final `READY`). Unrecognized commands get
//! an `UNKNOWN` reply so a confused sender can tell.

use crate::peers;
use crate::server::{ChangeOrigin, PeerId, Server};
use fluid_settings::{GetResult, ResetResult, SetResult};
use fluid_settings_model::{commands, name, priority, Message, Priority, PriorityQuery, Timestamp};
use tracing::{debug, info, warn};

fn is_true(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1") | Some("on") | Some("yes"))
}

impl Server {
    /// Dispatch a message that arrived over the communicator bus.
    pub async fn dispatch_bus(&mut self, msg: Message) {
        match msg.command.as_str() {
            commands::GET => self.msg_get(&msg).await,
            commands::PUT => self.msg_put(&msg).await,
            commands::DELETE => self.msg_delete(&msg).await,
            commands::LIST => self.msg_list(&msg).await,
            commands::LISTEN => self.msg_listen(&msg).await,
            commands::FORGET => self.msg_forget(&msg).await,
            commands::GOSSIP => self.msg_gossip(&msg, true).await,
            commands::CONNECTED => self.msg_gossip(&msg, false).await,
            commands::READY => {
                // the bus accepted our registration; announce ourselves
                self.send_gossip().await;
            }
            commands::STATUS => self.msg_status(&msg),
            commands::STOP | commands::QUITTING => {
                info!("stop requested over the bus");
                self.exit_code = Some(0);
            }
            commands::RESTART => {
                info!("restart requested over the bus");
                self.exit_code = Some(1);
            }
            commands::UNKNOWN => {
                debug!("the bus did not recognize {:?}", msg.param("command"));
            }
            other => {
                warn!("unrecognized command {other}");
                let reply = self
                    .reply(&msg, commands::UNKNOWN)
                    .with_param("command", other.to_string());
                self.bus_send(reply).await;
            }
        }
    }

    /// Dispatch a message that arrived on a replication link.
    pub async fn dispatch_peer(&mut self, id: PeerId, msg: Message) {
        match msg.command.as_str() {
            commands::VALUE_CHANGED => self.remote_value_changed(&msg).await,
            other => warn!("unexpected {other} from replication link {id}"),
        }
    }

    async fn msg_get(&mut self, msg: &Message) {
        let Some(setting) = msg.param("name") else {
            return self
                .invalid(msg, commands::GET, "parameter \"name\" missing in message")
                .await;
        };
        let setting = name::canonicalize(setting);

        let exclusive = [
            msg.has_param("priority"),
            msg.has_param("all"),
            msg.has_param("default_value"),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if exclusive > 1 {
            return self
                .invalid(
                    msg,
                    commands::GET,
                    "parameters \"priority\", \"all\" and \"default_value\" are mutually exclusive",
                )
                .await;
        }

        let result = if is_true(msg.param("default_value")) {
            self.store.get_default(&setting)
        } else if is_true(msg.param("all")) {
            self.store.get(&setting, PriorityQuery::Highest, true)
        } else if let Some(priority) = msg.param("priority") {
            match Priority::parse(priority) {
                Ok(priority) => self.store.get(&setting, PriorityQuery::At(priority), false),
                Err(_) => {
                    return self
                        .invalid(
                            msg,
                            commands::GET,
                            "parameter \"priority\" must be an integer in 0 .. 99",
                        )
                        .await;
                }
            }
        } else {
            self.store.get(&setting, PriorityQuery::Highest, false)
        };

        let reply = match result {
            GetResult::Value(value) => self
                .reply(msg, commands::VALUE)
                .with_param("name", &setting)
                .with_param("value", value),
            GetResult::AllValues(values) => self
                .reply(msg, commands::ALL_VALUES)
                .with_param("name", &setting)
                .with_param("values", values),
            GetResult::Default(value) => self
                .reply(msg, commands::DEFAULT_VALUE)
                .with_param("name", &setting)
                .with_param("value", value),
            GetResult::NotSet => self
                .reply(msg, commands::NOT_SET)
                .with_param("name", &setting)
                .with_param("error", format!("no value set for \"{setting}\"")),
            GetResult::PriorityNotFound => self
                .reply(msg, commands::NOT_SET)
                .with_param("name", &setting)
                .with_param(
                    "error",
                    format!(
                        "no value at priority {} for \"{setting}\"",
                        msg.param("priority").unwrap_or_default()
                    ),
                ),
            GetResult::Unknown => self
                .reply(msg, commands::NOT_SET)
                .with_param("name", &setting)
                .with_param("error", format!("no setting named \"{setting}\"")),
        };
        self.bus_send(reply).await;
    }

    async fn msg_put(&mut self, msg: &Message) {
        let (Some(setting), Some(value)) = (msg.param("name"), msg.param("value")) else {
            return self
                .invalid(
                    msg,
                    commands::PUT,
                    "parameter \"name\" or \"value\" missing in message",
                )
                .await;
        };
        let setting = name::canonicalize(setting);
        let value = value.to_string();

        let priority = match msg.param("priority") {
            Some(priority) => match Priority::parse(priority) {
                Ok(priority) => priority,
                Err(_) => {
                    return self
                        .invalid(
                            msg,
                            commands::PUT,
                            "parameter \"priority\" is out of range (0 .. 99)",
                        )
                        .await;
                }
            },
            None => priority::ADMINISTRATOR,
        };
        let timestamp = match msg.param("timestamp") {
            Some(stamp) => match Timestamp::parse(stamp) {
                Ok(stamp) => stamp,
                Err(_) => {
                    return self
                        .invalid(
                            msg,
                            commands::PUT,
                            "parameter \"timestamp\" must be a nanosecond count",
                        )
                        .await;
                }
            },
            None => Timestamp::now(),
        };

        let result = self.store.set(&setting, &value, priority, timestamp);
        match result {
            SetResult::Unknown => {
                self.invalid(
                    msg,
                    commands::PUT,
                    &format!("no setting named \"{setting}\""),
                )
                .await;
            }
            SetResult::Error => {
                self.invalid(
                    msg,
                    commands::PUT,
                    &format!("setting \"{setting}\" to value \"{value}\" failed"),
                )
                .await;
            }
            result => {
                let reply = self
                    .reply(msg, commands::UPDATED)
                    .with_param("name", &setting)
                    .with_param("reason", result.reason());
                self.bus_send(reply).await;
                if result.mutated() {
                    self.value_changed(&setting, ChangeOrigin::Local).await;
                }
            }
        }
    }

    async fn msg_delete(&mut self, msg: &Message) {
        let Some(setting) = msg.param("name") else {
            return self
                .invalid(msg, commands::DELETE, "parameter \"name\" missing in message")
                .await;
        };
        let setting = name::canonicalize(setting);

        let priority = match msg.param("priority") {
            Some(priority) => match Priority::parse(priority) {
                Ok(priority) => priority,
                Err(_) => {
                    return self
                        .invalid(
                            msg,
                            commands::DELETE,
                            "parameter \"priority\" is out of range (0 .. 99)",
                        )
                        .await;
                }
            },
            None => priority::ADMINISTRATOR,
        };

        match self.store.reset(&setting, priority) {
            ResetResult::Removed => {
                let reply = self
                    .reply(msg, commands::DELETED)
                    .with_param("name", &setting);
                self.bus_send(reply).await;
                self.value_changed(&setting, ChangeOrigin::Local).await;
            }
            ResetResult::Nothing | ResetResult::Unknown => {
                // still a success so the sender has nothing special to do
                let reply = self
                    .reply(msg, commands::DELETED)
                    .with_param("name", &setting)
                    .with_param("message", "nothing was deleted");
                self.bus_send(reply).await;
            }
        }
    }

    async fn msg_list(&mut self, msg: &Message) {
        let reply = self
            .reply(msg, commands::OPTIONS)
            .with_param("options", self.store.list_of_names());
        self.bus_send(reply).await;
    }

    async fn msg_listen(&mut self, msg: &Message) {
        let Some(subscriber) = self.envelope_subscriber(msg) else {
            return self
                .invalid(
                    msg,
                    commands::LISTEN,
                    "message envelope is missing the sender's server or service",
                )
                .await;
        };
        let Some(names) = msg.param("names") else {
            return self
                .invalid(msg, commands::LISTEN, "parameter \"names\" missing in message")
                .await;
        };
        let names = name::split_names(names);
        if names.is_empty() {
            return self
                .invalid(msg, commands::LISTEN, "parameter \"names\" is empty")
                .await;
        }

        let already = self.registry.listen(&subscriber, &names);
        let mut reply = self.reply(msg, commands::REGISTERED);
        if already {
            reply.set_param("message", "already registered");
        }
        self.bus_send(reply).await;

        // replay the current value of every requested name
        let mut errcnt = 0u32;
        for setting in &names {
            let mut update = self
                .reply(msg, commands::VALUE_UPDATED)
                .with_param("name", setting)
                .with_param("message", "current value");
            if !self.store.schema().contains(setting) {
                errcnt += 1;
                update.set_param("reason", "value undefined");
            } else {
                match self.store.effective_value(setting) {
                    Some(value) => update.set_param("value", value),
                    None => update.set_param("reason", "value undefined"),
                }
            }
            self.bus_send(update).await;
        }

        let mut ready = self.reply(msg, commands::FLUID_READY);
        if errcnt > 0 {
            ready.set_param("errcnt", errcnt.to_string());
        }
        self.bus_send(ready).await;
    }

    async fn msg_forget(&mut self, msg: &Message) {
        let Some(subscriber) = self.envelope_subscriber(msg) else {
            return self
                .invalid(
                    msg,
                    commands::FORGET,
                    "message envelope is missing the sender's server or service",
                )
                .await;
        };
        let Some(names) = msg.param("names") else {
            return self
                .invalid(msg, commands::FORGET, "parameter \"names\" missing in message")
                .await;
        };
        let names = name::split_names(names);
        if names.is_empty() {
            return self
                .invalid(msg, commands::FORGET, "parameter \"names\" is empty")
                .await;
        }

        let mut reply = self.reply(msg, commands::FORGET);
        if self.registry.forget(&subscriber, &names) {
            reply.set_param("message", "not listening");
        }
        self.bus_send(reply).await;
    }

    /// Handle `GOSSIP` (reply with `CONNECTED`) and `CONNECTED` (no
    /// reply). Whichever side has the lesser listener address initiates
    /// the TCP link, so exactly one link comes up per daemon pair.
    async fn msg_gossip(&mut self, msg: &Message, from_gossip: bool) {
        let command = if from_gossip {
            commands::GOSSIP
        } else {
            commands::CONNECTED
        };
        let Some(their_ip) = msg.param("my_ip") else {
            return self
                .invalid(msg, command, "parameter \"my_ip\" missing in message")
                .await;
        };
        let Ok(theirs) = their_ip.parse::<std::net::SocketAddr>() else {
            return self
                .invalid(msg, command, "parameter \"my_ip\" is not a valid address")
                .await;
        };

        let ours = self.listener_address;
        let note = if peers::precedes(&ours, &theirs) {
            if self.outbound_targets.insert(theirs) {
                peers::spawn_outbound(theirs, self.event_tx.clone());
            }
            "we sent you a connection request"
        } else {
            "you connect to us"
        };

        if from_gossip {
            let reply = self
                .reply(msg, commands::CONNECTED)
                .with_param("my_ip", ours.to_string())
                .with_param("message", note);
            self.bus_send(reply).await;
        }
    }

    fn msg_status(&mut self, msg: &Message) {
        let (Some(service), Some(status)) = (msg.param("service"), msg.param("status")) else {
            return;
        };
        if status != "up" {
            let removed = self
                .registry
                .forget_service(msg.param("server"), service);
            if removed > 0 {
                info!("dropped {removed} subscriptions of the gone service {service}");
            }
        }
    }

    /// Merge a peer's serialized value set. Malformed records are logged
    /// and skipped; the resulting notifications never broadcast back to
    /// the peers.
    pub(crate) async fn remote_value_changed(&mut self, msg: &Message) {
        let (Some(setting), Some(values)) = (msg.param("name"), msg.param("values")) else {
            warn!("VALUE_CHANGED message is missing its \"name\" or \"values\" parameter");
            return;
        };
        let setting = name::canonicalize(setting);
        if setting.is_empty() {
            warn!("VALUE_CHANGED message has an empty \"name\"");
            return;
        }
        let values = values.to_string();

        let applied = self.store.unserialize(&setting, &values);
        if applied > 0 {
            self.value_changed(&setting, ChangeOrigin::Peer).await;
        }
    }

    fn envelope_subscriber(&self, msg: &Message) -> Option<fluid_settings::Subscriber> {
        let from = msg.from.as_ref()?;
        if from.server.is_empty() || from.service.is_empty() {
            return None;
        }
        Some(fluid_settings::Subscriber::new(&from.server, &from.service))
    }

    fn reply(&self, msg: &Message, command: &str) -> Message {
        let mut reply = Message::reply_to(msg, command);
        reply.from = Some(self.my_address());
        reply
    }

    async fn invalid(&mut self, msg: &Message, command: &str, message: &str) {
        warn!("rejecting {command}: {message}");
        let mut reply = self.reply(msg, commands::INVALID);
        reply.set_param("command", command);
        reply.set_param("message", message);
        // carry the name through so clients can cancel their timer
        if let Some(setting) = msg.param("name") {
            reply.set_param("name", name::canonicalize(setting));
        }
        self.bus_send(reply).await;
    }
}
