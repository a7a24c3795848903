//! Friend table: dense friend ids mapped to friend records, unique by public key.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::identity::{Nospam, PublicKey};
use crate::protocol::{truncate, UserStatus, MAX_NAME_LENGTH, MAX_STATUS_MESSAGE_LENGTH};
use crate::routing::NetworkLocation;
use crate::session::{Connection, ConnectionState};

/// Friend handle. Dense: the lowest free id is handed out first, so deleted ids are reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FriendId(pub u32);

impl fmt::Display for FriendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Friend request we sent and keep resending until the friend comes online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub nospam: Nospam,
    pub message: Vec<u8>,
    pub(crate) last_sent_tick: Option<u64>,
}

impl PendingRequest {
    pub fn new(nospam: Nospam, message: Vec<u8>) -> Self {
        Self {
            nospam,
            message,
            last_sent_tick: None,
        }
    }
}

/// One friend record.
pub struct Friend {
    public_key: PublicKey,
    name: Vec<u8>,
    status_message: Vec<u8>,
    user_status: UserStatus,
    is_typing: bool,
    last_seen: Option<DateTime<Utc>>,
    /// Whether we send read receipts to this friend.
    pub(crate) sends_receipts: bool,
    pub(crate) pending_request: Option<PendingRequest>,
    next_message_id: u32,
    pub(crate) connection: Connection,
}

impl Friend {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            name: Vec::new(),
            status_message: Vec::new(),
            user_status: UserStatus::None,
            is_typing: false,
            last_seen: None,
            sends_receipts: true,
            pending_request: None,
            next_message_id: 1,
            connection: Connection::new(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Store a name, truncated to 128 bytes. Returns the stored length.
    pub fn set_name(&mut self, name: &[u8]) -> usize {
        self.name = truncate(name, MAX_NAME_LENGTH).to_vec();
        self.name.len()
    }

    pub fn status_message(&self) -> &[u8] {
        &self.status_message
    }

    /// Store a status message, truncated to 1007 bytes. Returns the stored length.
    pub fn set_status_message(&mut self, status: &[u8]) -> usize {
        self.status_message = truncate(status, MAX_STATUS_MESSAGE_LENGTH).to_vec();
        self.status_message.len()
    }

    pub fn user_status(&self) -> UserStatus {
        self.user_status
    }

    pub fn set_user_status(&mut self, status: UserStatus) {
        self.user_status = status;
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    pub fn set_typing(&mut self, is_typing: bool) {
        self.is_typing = is_typing;
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn touch_last_seen(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    pub(crate) fn set_last_seen(&mut self, last_seen: Option<DateTime<Utc>>) {
        self.last_seen = last_seen;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_online(&self) -> bool {
        self.connection.state() == ConnectionState::Online
    }

    pub fn location(&self) -> Option<NetworkLocation> {
        self.connection.location()
    }

    pub fn pending_request(&self) -> Option<&PendingRequest> {
        self.pending_request.as_ref()
    }

    pub fn sends_receipts(&self) -> bool {
        self.sends_receipts
    }

    /// Next outbound message id. Monotonic; skips 0 on wrap.
    pub(crate) fn next_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Continue numbering after a caller-chosen id.
    pub(crate) fn observe_message_id(&mut self, id: u32) {
        if id >= self.next_message_id {
            self.next_message_id = id.wrapping_add(1).max(1);
        }
    }
}

/// Dense id -> record table with a public key index.
#[derive(Default)]
pub struct FriendTable {
    slots: Vec<Option<Friend>>,
    by_key: HashMap<PublicKey, FriendId>,
}

impl FriendTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the lowest free id. Fails `AlreadyFriends` if the key is present.
    pub fn insert(&mut self, friend: Friend) -> Result<FriendId> {
        if self.by_key.contains_key(friend.public_key()) {
            return Err(EngineError::AlreadyFriends);
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        let id = FriendId(index as u32);
        self.place(id, friend);
        Ok(id)
    }

    /// Insert at a specific id (used by restore). Fails if the id or key is taken.
    pub fn insert_at(&mut self, id: FriendId, friend: Friend) -> Result<()> {
        if self.by_key.contains_key(friend.public_key()) {
            return Err(EngineError::AlreadyFriends);
        }
        if self.get(id).is_some() {
            return Err(EngineError::InvalidState);
        }
        self.place(id, friend);
        Ok(())
    }

    fn place(&mut self, id: FriendId, friend: Friend) {
        let index = id.0 as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.by_key.insert(*friend.public_key(), id);
        self.slots[index] = Some(friend);
    }

    /// Remove a record; the id becomes reusable.
    pub fn remove(&mut self, id: FriendId) -> Option<Friend> {
        let friend = self.slots.get_mut(id.0 as usize)?.take()?;
        self.by_key.remove(friend.public_key());
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Some(friend)
    }

    pub fn get(&self, id: FriendId) -> Option<&Friend> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: FriendId) -> Option<&mut Friend> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn id_for_key(&self, key: &PublicKey) -> Option<FriendId> {
        self.by_key.get(key).copied()
    }

    pub fn contains(&self, id: FriendId) -> bool {
        self.get(id).is_some()
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<FriendId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FriendId, &Friend)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (FriendId(i as u32), f)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (FriendId, &mut Friend)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, f)| f.as_mut().map(|f| (FriendId(i as u32), f)))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.iter().filter(|(_, f)| f.is_online()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn friend() -> Friend {
        Friend::new(*Keypair::generate().public_key())
    }

    #[test]
    fn ids_are_dense_and_reused_lowest_first() {
        let mut table = FriendTable::new();
        let a = table.insert(friend()).unwrap();
        let b = table.insert(friend()).unwrap();
        let c = table.insert(friend()).unwrap();
        assert_eq!((a, b, c), (FriendId(0), FriendId(1), FriendId(2)));

        table.remove(c).unwrap();
        table.remove(a).unwrap();
        assert_eq!(table.insert(friend()).unwrap(), FriendId(0));
        assert_eq!(table.insert(friend()).unwrap(), FriendId(2));
        assert_eq!(table.insert(friend()).unwrap(), FriendId(3));
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut table = FriendTable::new();
        let key = *Keypair::generate().public_key();
        table.insert(Friend::new(key)).unwrap();
        assert!(matches!(
            table.insert(Friend::new(key)),
            Err(EngineError::AlreadyFriends)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn key_index_follows_removal() {
        let mut table = FriendTable::new();
        let key = *Keypair::generate().public_key();
        let id = table.insert(Friend::new(key)).unwrap();
        assert_eq!(table.id_for_key(&key), Some(id));
        table.remove(id).unwrap();
        assert_eq!(table.id_for_key(&key), None);
        assert!(!table.contains(id));
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn insert_at_keeps_requested_id() {
        let mut table = FriendTable::new();
        table.insert_at(FriendId(3), friend()).unwrap();
        assert_eq!(table.ids(), vec![FriendId(3)]);
        assert_eq!(table.insert(friend()).unwrap(), FriendId(0));
        assert!(table.insert_at(FriendId(3), friend()).is_err());
    }

    #[test]
    fn name_and_status_truncate() {
        let mut f = friend();
        assert_eq!(f.set_name(&[b'n'; 200]), MAX_NAME_LENGTH);
        assert_eq!(f.name().len(), MAX_NAME_LENGTH);
        assert_eq!(f.set_status_message(&[b's'; 2000]), MAX_STATUS_MESSAGE_LENGTH);
        assert_eq!(f.set_status_message(b"short"), 5);
    }

    #[test]
    fn message_ids_skip_zero() {
        let mut f = friend();
        assert_eq!(f.next_message_id(), 1);
        f.observe_message_id(u32::MAX);
        assert_eq!(f.next_message_id(), 1);
        assert_eq!(f.next_message_id(), 2);
    }
}
