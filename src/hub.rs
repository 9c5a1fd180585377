use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::ServerMsg;

/// A notification addressed to one user, delivered to all their sockets.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub user_id: Uuid,
    pub msg: ServerMsg,
    /// Close the recipient's sockets after delivering `msg`.
    pub close: bool,
}

/// Process-wide fan-out for user notifications plus presence tracking.
pub struct Hub {
    tx: broadcast::Sender<UserEvent>,
    /// user_id -> open socket count
    presence: DashMap<Uuid, usize>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            presence: DashMap::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, user_id: Uuid, msg: ServerMsg) {
        let _ = self.tx.send(UserEvent {
            user_id,
            msg,
            close: false,
        });
    }

    /// Deliver a final `Reset` and drop every socket the user has open.
    pub fn kick(&self, user_id: Uuid, message: impl Into<String>) {
        let _ = self.tx.send(UserEvent {
            user_id,
            msg: ServerMsg::Reset {
                message: message.into(),
            },
            close: true,
        });
    }

    /// Returns true when this is the user's first open socket.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut count = self.presence.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the user has no sockets left.
    pub fn disconnect(&self, user_id: Uuid) -> bool {
        let gone = match self.presence.get_mut(&user_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => true,
        };
        if gone {
            self.presence.remove_if(&user_id, |_, count| *count == 0);
        }
        gone
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.presence.contains_key(&user_id)
    }

    pub fn online_count(&self) -> usize {
        self.presence.len()
    }
}
