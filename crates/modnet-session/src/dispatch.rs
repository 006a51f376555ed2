//! Module dispatcher
//!
//! Routes decoded payloads to the handler registered under their module id.
//! Handlers and session events are invoked from one dispatch task per role,
//! so application state only ever mutates on a single logical thread.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::warn;

use modnet_core::packet::PeerId;
use modnet_core::ModuleId;

use crate::error::SessionError;
use crate::event::SessionEvent;

/// Handler invoked with (sender peer id, payload).
pub type ModuleHandler = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;

/// Registry of module handlers owned by a role.
pub struct ModuleRegistry {
    handlers: DashMap<ModuleId, ModuleHandler>,
}

impl ModuleRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        id: ModuleId,
        handler: ModuleHandler,
    ) -> Result<ModuleHandle, SessionError> {
        use dashmap::mapref::entry::Entry;
        match self.handlers.entry(id) {
            Entry::Occupied(_) => Err(SessionError::ModuleAlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(ModuleHandle {
                    id,
                    registry: Arc::downgrade(self),
                })
            }
        }
    }

    pub fn is_registered(&self, id: ModuleId) -> bool {
        self.handlers.contains_key(&id)
    }

    fn remove(&self, id: ModuleId) {
        self.handlers.remove(&id);
    }

    /// Route one payload. Unmatched ids are dropped, not fatal.
    pub(crate) fn dispatch(&self, module: ModuleId, sender: PeerId, payload: Bytes) {
        // Clone the handler out of the shard before invoking it, so a
        // handler may itself register or unregister modules.
        let handler = self.handlers.get(&module).map(|e| e.value().clone());
        match handler {
            Some(handler) => handler(sender, payload),
            None => warn!("dropping payload for unregistered module {}", module),
        }
    }
}

/// Registration handle. Unregisters its module when dropped, so a module
/// cannot receive callbacks past its own lifetime.
pub struct ModuleHandle {
    id: ModuleId,
    registry: Weak<ModuleRegistry>,
}

impl ModuleHandle {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Explicitly unregister (dropping the handle does the same).
    pub fn unregister(self) {}
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Everything marshaled onto the dispatch task.
pub(crate) enum AppEvent {
    Data {
        module: ModuleId,
        sender: PeerId,
        payload: Bytes,
    },
    Session(SessionEvent),
}

/// The role's dispatch loop: module payloads to handlers, lifecycle events
/// to the application's event channel.
pub(crate) async fn run_dispatch(
    mut rx: mpsc::Receiver<AppEvent>,
    registry: Arc<ModuleRegistry>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            AppEvent::Data {
                module,
                sender,
                payload,
            } => registry.dispatch(module, sender, payload),
            AppEvent::Session(event) => {
                // The application may have dropped its receiver; that only
                // means nobody is listening.
                let _ = events.send(event).await;
            }
        }
    }
}
