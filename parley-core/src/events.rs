//! Event dispatch: one handler per event kind, invoked synchronously inside `tick`.

use std::collections::HashMap;

use crate::friends::FriendId;
use crate::identity::PublicKey;
use crate::protocol::{Direction, FileControl, UserStatus};

/// Inbound events delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Unsolicited request from a key not in the friend table. Accept with `add_friend_no_request`.
    FriendRequest {
        public_key: PublicKey,
        message: Vec<u8>,
    },
    FriendMessage {
        friend: FriendId,
        message_id: u32,
        message: Vec<u8>,
    },
    FriendAction {
        friend: FriendId,
        message_id: u32,
        action: Vec<u8>,
    },
    NameChange {
        friend: FriendId,
        name: Vec<u8>,
    },
    StatusMessage {
        friend: FriendId,
        status: Vec<u8>,
    },
    UserStatus {
        friend: FriendId,
        status: UserStatus,
    },
    TypingChange {
        friend: FriendId,
        is_typing: bool,
    },
    /// The peer read the message or action with this id.
    ReadReceipt {
        friend: FriendId,
        message_id: u32,
    },
    ConnectionStatus {
        friend: FriendId,
        online: bool,
    },
    FileSendRequest {
        friend: FriendId,
        slot: u8,
        size: u64,
        file_name: Vec<u8>,
    },
    /// Control received for one of our slots; `direction` is the slot's local direction.
    FileControl {
        friend: FriendId,
        direction: Direction,
        slot: u8,
        control: FileControl,
        data: Vec<u8>,
    },
    FileData {
        friend: FriendId,
        slot: u8,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EventKind {
    FriendRequest,
    FriendMessage,
    FriendAction,
    NameChange,
    StatusMessage,
    UserStatus,
    TypingChange,
    ReadReceipt,
    ConnectionStatus,
    FileSendRequest,
    FileControl,
    FileData,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::FriendRequest,
        EventKind::FriendMessage,
        EventKind::FriendAction,
        EventKind::NameChange,
        EventKind::StatusMessage,
        EventKind::UserStatus,
        EventKind::TypingChange,
        EventKind::ReadReceipt,
        EventKind::ConnectionStatus,
        EventKind::FileSendRequest,
        EventKind::FileControl,
        EventKind::FileData,
    ];
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FriendRequest { .. } => EventKind::FriendRequest,
            Event::FriendMessage { .. } => EventKind::FriendMessage,
            Event::FriendAction { .. } => EventKind::FriendAction,
            Event::NameChange { .. } => EventKind::NameChange,
            Event::StatusMessage { .. } => EventKind::StatusMessage,
            Event::UserStatus { .. } => EventKind::UserStatus,
            Event::TypingChange { .. } => EventKind::TypingChange,
            Event::ReadReceipt { .. } => EventKind::ReadReceipt,
            Event::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            Event::FileSendRequest { .. } => EventKind::FileSendRequest,
            Event::FileControl { .. } => EventKind::FileControl,
            Event::FileData { .. } => EventKind::FileData,
        }
    }
}

/// Event handler. Returning `Err` aborts the current tick.
pub type Handler = Box<dyn FnMut(&Event) -> anyhow::Result<()> + Send>;

/// Handler table. Registering for a kind replaces the previous handler; there is no fan-out.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: EventKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    pub fn clear(&mut self, kind: EventKind) {
        self.handlers.remove(&kind);
    }

    #[cfg(test)]
    fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Call the handler for the event's kind, if any.
    pub fn dispatch(&mut self, event: &Event) -> anyhow::Result<()> {
        match self.handlers.get_mut(&event.kind()) {
            Some(handler) => handler(event),
            None => {
                tracing::trace!(kind = ?event.kind(), "no handler registered");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn typing(friend: u32) -> Event {
        Event::TypingChange {
            friend: FriendId(friend),
            is_typing: true,
        }
    }

    #[test]
    fn new_handler_replaces_old() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let first = seen.clone();
        dispatcher.set(
            EventKind::TypingChange,
            Box::new(move |_| {
                first.lock().unwrap().push("first");
                Ok(())
            }),
        );
        let second = seen.clone();
        dispatcher.set(
            EventKind::TypingChange,
            Box::new(move |_| {
                second.lock().unwrap().push("second");
                Ok(())
            }),
        );
        dispatcher.dispatch(&typing(0)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn unhandled_kind_is_ignored() {
        let mut dispatcher = Dispatcher::new();
        assert!(!dispatcher.has_handler(EventKind::TypingChange));
        dispatcher.dispatch(&typing(1)).unwrap();
    }

    #[test]
    fn handler_error_propagates() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.set(
            EventKind::TypingChange,
            Box::new(|_| Err(anyhow::anyhow!("boom"))),
        );
        assert!(dispatcher.dispatch(&typing(2)).is_err());
        dispatcher.clear(EventKind::TypingChange);
        assert!(dispatcher.dispatch(&typing(2)).is_ok());
    }
}
