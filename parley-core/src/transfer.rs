//! File transfer slots: per friend, per direction, up to 256 concurrent transfers each way.
//!
//! Pure state. The engine seals and sends the packets these transitions imply.

use std::collections::{BTreeMap, HashMap};

use crate::error::{EngineError, Result};
use crate::friends::FriendId;
use crate::protocol::{Direction, FileControl, MAX_FILE_DATA_SIZE};

/// Number of slots per friend and direction (slot numbers are one byte).
pub const MAX_SLOTS: usize = 256;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TransferStatus {
    /// Offered, waiting for the receiver to accept.
    Requested,
    /// Receiver accepted; no data seen yet.
    Accepted,
    Paused,
    /// Data is flowing.
    Active,
    Finished,
    Cancelled,
}

/// One transfer slot.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub slot: u8,
    pub direction: Direction,
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
    pub file_name: Vec<u8>,
    /// Chunks sent but not yet acknowledged (sending slots only).
    pub outstanding: u32,
}

impl Transfer {
    fn new(slot: u8, direction: Direction, size: u64, file_name: Vec<u8>) -> Self {
        Self {
            slot,
            direction,
            size,
            transferred: 0,
            status: TransferStatus::Requested,
            file_name,
            outstanding: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.transferred)
    }
}

/// What `prepare_data` decided for an outbound chunk.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataOutcome {
    /// Send the chunk as FileData.
    Send,
    /// Empty chunk: the slot is finished and freed; tell the peer.
    Finished,
}

#[derive(Default)]
struct FriendTransfers {
    sending: BTreeMap<u8, Transfer>,
    receiving: BTreeMap<u8, Transfer>,
    /// Chunks received this tick, per receiving slot.
    unacked: BTreeMap<u8, u16>,
}

impl FriendTransfers {
    fn slots(&self, direction: Direction) -> &BTreeMap<u8, Transfer> {
        match direction {
            Direction::Sending => &self.sending,
            Direction::Receiving => &self.receiving,
        }
    }

    fn slots_mut(&mut self, direction: Direction) -> &mut BTreeMap<u8, Transfer> {
        match direction {
            Direction::Sending => &mut self.sending,
            Direction::Receiving => &mut self.receiving,
        }
    }

    fn is_empty(&self) -> bool {
        self.sending.is_empty() && self.receiving.is_empty() && self.unacked.is_empty()
    }
}

/// All transfers, keyed by friend.
#[derive(Default)]
pub struct TransferManager {
    friends: HashMap<FriendId, FriendTransfers>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, friend: FriendId, direction: Direction, slot: u8) -> Option<&Transfer> {
        self.friends.get(&friend)?.slots(direction).get(&slot)
    }

    fn get_mut(&mut self, friend: FriendId, direction: Direction, slot: u8) -> Result<&mut Transfer> {
        self.friends
            .get_mut(&friend)
            .and_then(|t| t.slots_mut(direction).get_mut(&slot))
            .ok_or(EngineError::UnknownTransfer)
    }

    fn remove(&mut self, friend: FriendId, direction: Direction, slot: u8) -> Option<Transfer> {
        let transfers = self.friends.get_mut(&friend)?;
        let removed = transfers.slots_mut(direction).remove(&slot);
        if direction == Direction::Receiving {
            transfers.unacked.remove(&slot);
        }
        if transfers.is_empty() {
            self.friends.remove(&friend);
        }
        removed
    }

    /// Allocate the lowest free outbound slot in `Requested`.
    pub fn open_outbound(&mut self, friend: FriendId, size: u64, file_name: Vec<u8>) -> Result<u8> {
        let transfers = self.friends.entry(friend).or_default();
        let slot = (0..MAX_SLOTS)
            .map(|s| s as u8)
            .find(|s| !transfers.sending.contains_key(s))
            .ok_or(EngineError::TooManySlots)?;
        transfers
            .sending
            .insert(slot, Transfer::new(slot, Direction::Sending, size, file_name));
        Ok(slot)
    }

    /// Record a peer's offer. Returns false for a slot that is already occupied.
    pub fn on_send_request(
        &mut self,
        friend: FriendId,
        slot: u8,
        size: u64,
        file_name: Vec<u8>,
    ) -> bool {
        let transfers = self.friends.entry(friend).or_default();
        if transfers.receiving.contains_key(&slot) {
            return false;
        }
        transfers
            .receiving
            .insert(slot, Transfer::new(slot, Direction::Receiving, size, file_name));
        true
    }

    /// Apply a control issued by the local user. Returns the resulting status;
    /// `Finished` and `Cancelled` mean the slot was freed.
    pub fn local_control(
        &mut self,
        friend: FriendId,
        direction: Direction,
        slot: u8,
        control: FileControl,
    ) -> Result<TransferStatus> {
        let transfer = self.get_mut(friend, direction, slot)?;
        use TransferStatus::*;
        let next = match (direction, control, transfer.status) {
            (_, FileControl::Kill, _) => Cancelled,
            (Direction::Receiving, FileControl::Accept, Requested | Paused) => Accepted,
            (Direction::Sending, FileControl::Accept, Paused) => Active,
            (_, FileControl::Pause, Accepted | Active) => Paused,
            (Direction::Sending, FileControl::Finished, Active) => Finished,
            _ => return Err(EngineError::InvalidState),
        };
        self.apply(friend, direction, slot, next);
        Ok(next)
    }

    /// Apply a control received from the peer. `direction` is the slot's direction as the
    /// peer sees it. Returns the local direction and resulting status.
    pub fn remote_control(
        &mut self,
        friend: FriendId,
        direction: Direction,
        slot: u8,
        control: FileControl,
    ) -> Result<(Direction, TransferStatus)> {
        let local = direction.flip();
        let transfer = self.get_mut(friend, local, slot)?;
        use TransferStatus::*;
        let next = match (local, control, transfer.status) {
            (_, FileControl::Kill, _) => Cancelled,
            (Direction::Sending, FileControl::Accept, Requested | Paused) => Active,
            (Direction::Receiving, FileControl::Accept, Paused) => Active,
            (_, FileControl::Pause, Accepted | Active) => Paused,
            (Direction::Receiving, FileControl::Finished, Accepted | Active | Paused) => Finished,
            _ => return Err(EngineError::InvalidState),
        };
        self.apply(friend, local, slot, next);
        Ok((local, next))
    }

    fn apply(&mut self, friend: FriendId, direction: Direction, slot: u8, next: TransferStatus) {
        match next {
            TransferStatus::Finished | TransferStatus::Cancelled => {
                self.remove(friend, direction, slot);
            }
            _ => {
                if let Ok(transfer) = self.get_mut(friend, direction, slot) {
                    transfer.status = next;
                }
            }
        }
    }

    /// Check and account for an outbound chunk before it is sent.
    pub fn prepare_data(
        &mut self,
        friend: FriendId,
        slot: u8,
        len: usize,
        max_outstanding: u32,
    ) -> Result<DataOutcome> {
        let transfer = self.get_mut(friend, Direction::Sending, slot)?;
        if transfer.status != TransferStatus::Active {
            return Err(EngineError::InvalidState);
        }
        if len == 0 {
            self.remove(friend, Direction::Sending, slot);
            return Ok(DataOutcome::Finished);
        }
        if len > MAX_FILE_DATA_SIZE {
            return Err(EngineError::TooLong {
                max: MAX_FILE_DATA_SIZE,
            });
        }
        if transfer.outstanding >= max_outstanding {
            return Err(EngineError::WouldBlock);
        }
        transfer.outstanding += 1;
        transfer.transferred = transfer.transferred.saturating_add(len as u64);
        Ok(DataOutcome::Send)
    }

    /// Account for an inbound chunk. The first chunk after acceptance activates the slot.
    pub fn on_data(&mut self, friend: FriendId, slot: u8, len: usize) -> Result<()> {
        let transfer = self.get_mut(friend, Direction::Receiving, slot)?;
        match transfer.status {
            TransferStatus::Accepted | TransferStatus::Active => {
                transfer.status = TransferStatus::Active;
                transfer.transferred = transfer.transferred.saturating_add(len as u64);
            }
            _ => return Err(EngineError::InvalidState),
        }
        if let Some(transfers) = self.friends.get_mut(&friend) {
            let count = transfers.unacked.entry(slot).or_insert(0);
            *count = count.saturating_add(1);
        }
        Ok(())
    }

    /// Peer acknowledged `count` chunks on one of our sending slots.
    pub fn on_ack(&mut self, friend: FriendId, slot: u8, count: u16) -> Result<()> {
        let transfer = self.get_mut(friend, Direction::Sending, slot)?;
        transfer.outstanding = transfer.outstanding.saturating_sub(u32::from(count));
        Ok(())
    }

    /// Drain the per-slot chunk counts to acknowledge this tick.
    pub fn take_acks(&mut self) -> Vec<(FriendId, u8, u16)> {
        let mut acks = Vec::new();
        for (friend, transfers) in self.friends.iter_mut() {
            for (slot, count) in std::mem::take(&mut transfers.unacked) {
                acks.push((*friend, slot, count));
            }
        }
        acks.sort_unstable();
        acks
    }

    /// Drop every transfer with a friend. Returns the freed (direction, slot) pairs.
    pub fn cancel_friend(&mut self, friend: FriendId) -> Vec<(Direction, u8)> {
        let Some(transfers) = self.friends.remove(&friend) else {
            return Vec::new();
        };
        transfers
            .sending
            .into_keys()
            .map(|s| (Direction::Sending, s))
            .chain(transfers.receiving.into_keys().map(|s| (Direction::Receiving, s)))
            .collect()
    }

    pub fn remaining(&self, friend: FriendId, direction: Direction, slot: u8) -> Result<u64> {
        self.get(friend, direction, slot)
            .map(Transfer::remaining)
            .ok_or(EngineError::UnknownTransfer)
    }
}
