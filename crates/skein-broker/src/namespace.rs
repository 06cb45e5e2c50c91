//! Namespace registry
//!
//! A namespace is a routing scope identified by a path beginning with `/`.
//! It owns an event handler table, an ordered middleware chain, a room
//! index, and the membership set of attached sockets. Namespaces are
//! created explicitly before the broker accepts connections; the root
//! namespace `/` always exists.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use skein_protocol::{AckReply, Frame};
use tracing::warn;

use crate::error::BrokerError;
use crate::rooms::RoomIndex;
use crate::socket::{Socket, SocketId};

/// Handler invoked for a dispatched event. Receives the sender socket,
/// the decoded payload, and a one-shot responder when the sender asked
/// for an acknowledgement.
pub type EventHandler = Arc<dyn Fn(Arc<Socket>, Value, Option<AckReply>) + Send + Sync>;

/// Middleware entry. May mutate the socket's user data; returning an
/// error rejects the event before its handler runs.
pub type Middleware = Arc<dyn Fn(&Socket, &str, &Value) -> Result<(), Reject> + Send + Sync>;

/// Middleware rejection, surfaced to the sender as an ERROR frame naming
/// the offending event
#[derive(Debug, Clone)]
pub struct Reject {
    /// Stable error code, e.g. `auth_failed`
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl Reject {
    /// Build a rejection with a stable code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Log and refuse application emits under runtime-owned event names.
/// Returns `true` when the event must be refused.
pub(crate) fn refuse_reserved(event: &str) -> bool {
    if skein_protocol::frame::RESERVED_EVENTS.contains(&event) {
        warn!(%event, "refusing emit under a reserved event name");
        return true;
    }
    false
}

/// A routing scope with its own handlers, middleware, rooms, and members
pub struct Namespace {
    path: String,
    handlers: RwLock<HashMap<String, EventHandler>>,
    middleware: RwLock<Vec<Middleware>>,
    rooms: RoomIndex,
    members: DashMap<SocketId, Arc<Socket>>,
}

impl Namespace {
    fn new(path: String) -> Arc<Self> {
        Arc::new(Self {
            path,
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            rooms: RoomIndex::new(),
            members: DashMap::new(),
        })
    }

    /// Namespace path, always starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a handler for `event`. Re-registering replaces the
    /// previous handler. Lifecycle names (`connected`, `disconnected`,
    /// `error`) are registered the same way; they are invoked by the
    /// runtime rather than by wire frames.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Socket>, Value, Option<AckReply>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.into(), Arc::new(handler));
    }

    /// Append a middleware to the chain. Middleware run in registration
    /// order before every handler dispatch; the first rejection stops the
    /// chain.
    pub fn use_middleware<F>(&self, middleware: F)
    where
        F: Fn(&Socket, &str, &Value) -> Result<(), Reject> + Send + Sync + 'static,
    {
        self.middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(middleware));
    }

    /// Emit an event to every socket in the namespace, sender included
    pub fn emit(&self, event: &str, data: Value) {
        if refuse_reserved(event) {
            return;
        }
        let frame = Frame::event(&self.path, event, data);
        for entry in self.members.iter() {
            entry.value().send(frame.clone());
        }
    }

    /// Emit to every socket in `room` (sender included, if a member)
    pub fn to(&self, room: impl Into<String>) -> RoomEmitter<'_> {
        RoomEmitter {
            namespace: self,
            room: room.into(),
            exclude: None,
        }
    }

    /// Number of attached sockets
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn rooms(&self) -> &RoomIndex {
        &self.rooms
    }

    pub(crate) fn attach(&self, socket: Arc<Socket>) {
        self.members.insert(socket.id().clone(), socket);
    }

    pub(crate) fn detach(&self, id: &SocketId) {
        self.members.remove(id);
    }

    pub(crate) fn socket(&self, id: &SocketId) -> Option<Arc<Socket>> {
        self.members.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn handler(&self, event: &str) -> Option<EventHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned()
    }

    /// Run the middleware chain for one inbound event
    pub(crate) fn run_middleware(
        &self,
        socket: &Socket,
        event: &str,
        data: &Value,
    ) -> Result<(), Reject> {
        let chain: Vec<Middleware> = self
            .middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for middleware in chain {
            middleware(socket, event, data)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("members", &self.members.len())
            .field("rooms", &self.rooms.room_count())
            .finish_non_exhaustive()
    }
}

/// Fan-out target scoped to one room, optionally excluding the sender
pub struct RoomEmitter<'a> {
    namespace: &'a Namespace,
    room: String,
    exclude: Option<SocketId>,
}

impl RoomEmitter<'_> {
    pub(crate) fn scoped(
        namespace: &Namespace,
        room: String,
        exclude: Option<SocketId>,
    ) -> RoomEmitter<'_> {
        RoomEmitter {
            namespace,
            room,
            exclude,
        }
    }

    /// Emit to the room membership snapshot. A missing or empty room is a
    /// logged no-op, never an error.
    pub fn emit(&self, event: &str, data: Value) {
        if refuse_reserved(event) {
            return;
        }
        let members = self.namespace.rooms.members(&self.room);
        if members.is_empty() {
            warn!(
                namespace = %self.namespace.path,
                room = %self.room,
                %event,
                "broadcast to empty room"
            );
            return;
        }
        let frame = Frame::event(&self.namespace.path, event, data);
        for id in members {
            if self.exclude.as_ref() == Some(&id) {
                continue;
            }
            if let Some(socket) = self.namespace.socket(&id) {
                socket.send(frame.clone());
            }
        }
    }
}

/// All namespaces of a broker, keyed by path
#[derive(Debug)]
pub struct NamespaceRegistry {
    root: Arc<Namespace>,
    namespaces: DashMap<String, Arc<Namespace>>,
}

impl NamespaceRegistry {
    /// Create a registry with the root namespace `/`
    pub fn new() -> Self {
        let root = Namespace::new("/".to_string());
        let namespaces = DashMap::new();
        namespaces.insert("/".to_string(), Arc::clone(&root));
        Self { root, namespaces }
    }

    /// Create a namespace, or return the existing one for `path`
    pub fn create(&self, path: &str) -> Result<Arc<Namespace>, BrokerError> {
        if !path.starts_with('/') {
            return Err(BrokerError::InvalidNamespace(path.to_string()));
        }
        let namespace = self
            .namespaces
            .entry(path.to_string())
            .or_insert_with(|| Namespace::new(path.to_string()));
        Ok(Arc::clone(namespace.value()))
    }

    /// Look up a namespace by path
    pub fn get(&self, path: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The root namespace, whose handler table doubles as the
    /// server-level fallback in the dispatch order
    pub fn root(&self) -> Arc<Namespace> {
        Arc::clone(&self.root)
    }

    /// Number of registered namespaces
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Always at least the root namespace
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
