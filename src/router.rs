//! Dispatch of inbound control messages.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::{debug, error, info, warn};

use crate::{
    error::CorralError,
    message::{HANDSHAKE_TOPIC, Message},
    registry::{Connection, ConnectionId, ConnectionRegistry},
};

/// Everything a topic handler gets to see.
pub struct HandlerContext<'a> {
    pub router: &'a MessageRouter,
    pub connection: &'a Arc<dyn Connection>,
    pub message: &'a Message,
}

/// Handles messages addressed to the supervisor under one topic.
pub trait TopicHandler: Send + Sync {
    fn topic(&self) -> &str;

    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<(), CorralError>;
}

/// Binds the sending connection to the name in `from`.
pub struct HandshakeHandler;

impl TopicHandler for HandshakeHandler {
    fn topic(&self) -> &str {
        HANDSHAKE_TOPIC
    }

    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<(), CorralError> {
        let name = ctx.message.from.trim();
        if name.is_empty() {
            return Err(CorralError::Protocol(
                "handshake without a sender name".into(),
            ));
        }
        ctx.router
            .registry()
            .handshake(name, Arc::clone(ctx.connection))?;
        info!("Handshake from '{name}' ({})", ctx.connection.peer());
        Ok(())
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A supervisor handler processed it.
    Handled,
    /// Addressed to the supervisor under a topic nobody handles; dropped.
    UnhandledTopic,
    /// The handler returned an error; logged and dropped.
    HandlerFailed,
    /// Delivered to the destination node.
    Forwarded,
    /// Destination unknown or disconnected. `replied` tells whether the
    /// error reply reached the sender.
    Rejected { replied: bool },
    /// Destination was connected but the write failed.
    SendFailed,
}

/// Routes messages to supervisor handlers or to other nodes.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn TopicHandler>>>,
}

impl MessageRouter {
    /// Creates a router with the handshake handler installed.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let router = Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
        };
        router.register_handler(Arc::new(HandshakeHandler));
        router
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Installs `handler` for its topic, returning the handler it replaced.
    pub fn register_handler(
        &self,
        handler: Arc<dyn TopicHandler>,
    ) -> Option<Arc<dyn TopicHandler>> {
        let topic = handler.topic().to_string();
        debug!("Registering handler for topic '{topic}'");
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic, handler)
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(topic)
    }

    /// Entry point for every message read from `connection`.
    pub fn dispatch(&self, connection: &Arc<dyn Connection>, message: &Message) -> RouteOutcome {
        if message.is_for_master() {
            self.handle_local(connection, message)
        } else {
            self.route(message)
        }
    }

    /// Forwards `message` to its destination node, or answers the sender
    /// with an error when the destination cannot be reached.
    pub fn route(&self, message: &Message) -> RouteOutcome {
        let destination = self.registry.get(&message.to);
        match destination {
            Some(node) if node.connected() => match node.send(message) {
                Ok(()) => {
                    debug!(
                        "Forwarded '{}' from '{}' to '{}'",
                        message.topic, message.from, message.to
                    );
                    RouteOutcome::Forwarded
                }
                Err(err) => {
                    warn!(
                        "Failed to forward '{}' from '{}' to '{}': {err}",
                        message.topic, message.from, message.to
                    );
                    RouteOutcome::SendFailed
                }
            },
            _ => {
                warn!(
                    "Dropping '{}' from '{}': unknown node {}",
                    message.topic, message.from, message.to
                );
                RouteOutcome::Rejected {
                    replied: self.reply_unknown_node(message),
                }
            }
        }
    }

    /// Marks whatever node was bound to `id` as disconnected.
    pub fn connection_closed(&self, id: ConnectionId) {
        match self.registry.disconnect_by_connection(id) {
            Ok(Some(name)) => debug!("Connection {id} for '{name}' closed"),
            Ok(None) => debug!("Connection {id} closed before handshake"),
            Err(err) => error!("Failed to record close of connection {id}: {err}"),
        }
    }

    fn handle_local(&self, connection: &Arc<dyn Connection>, message: &Message) -> RouteOutcome {
        // Clone the handler out so the table lock is not held while it runs.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&message.topic)
            .cloned();

        let Some(handler) = handler else {
            warn!(
                "No handler for topic '{}' (from '{}')",
                message.topic, message.from
            );
            return RouteOutcome::UnhandledTopic;
        };

        let ctx = HandlerContext {
            router: self,
            connection,
            message,
        };
        match handler.handle(&ctx) {
            Ok(()) => RouteOutcome::Handled,
            Err(err) => {
                error!(
                    "Handler for topic '{}' failed on message from '{}': {err}",
                    message.topic, message.from
                );
                RouteOutcome::HandlerFailed
            }
        }
    }

    fn reply_unknown_node(&self, original: &Message) -> bool {
        let Some(sender) = self.registry.get(&original.from) else {
            return false;
        };
        if !sender.connected() {
            return false;
        }
        match sender.send(&Message::unknown_node(original)) {
            Ok(()) => true,
            Err(err) => {
                debug!("Could not deliver error reply to '{}': {err}", original.from);
                false
            }
        }
    }
}
