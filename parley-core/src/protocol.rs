//! Parley wire protocol: packet kinds, limits and version.

use crate::identity::{Nospam, PublicKey};

/// Current protocol version. Carried in handshakes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum stored/transmitted display name length in bytes.
pub const MAX_NAME_LENGTH: usize = 128;
/// Maximum stored/transmitted status message length in bytes.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 1007;
/// Maximum message or action body length in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1368;
/// Maximum friend request message length in bytes.
pub const MAX_FRIEND_REQUEST_LENGTH: usize = 1016;
/// Maximum file name length in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;
/// Maximum payload of a single file data chunk.
pub const MAX_FILE_DATA_SIZE: usize = 1024;

/// Online presence advertised to friends.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UserStatus {
    #[default]
    None,
    Away,
    Busy,
}

impl UserStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            UserStatus::None => 0,
            UserStatus::Away => 1,
            UserStatus::Busy => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(UserStatus::None),
            1 => Some(UserStatus::Away),
            2 => Some(UserStatus::Busy),
            _ => None,
        }
    }
}

/// File control codes exchanged for a transfer slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FileControl {
    /// Receiver accepts the offer, or either side resumes a paused transfer.
    Accept,
    Pause,
    /// Cancel the transfer and free the slot.
    Kill,
    /// Sender has delivered every byte.
    Finished,
}

impl FileControl {
    pub fn to_byte(self) -> u8 {
        match self {
            FileControl::Accept => 0,
            FileControl::Pause => 1,
            FileControl::Kill => 2,
            FileControl::Finished => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FileControl::Accept),
            1 => Some(FileControl::Pause),
            2 => Some(FileControl::Kill),
            3 => Some(FileControl::Finished),
            _ => None,
        }
    }
}

/// Direction of a transfer slot, seen from the local engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    Sending,
    Receiving,
}

impl Direction {
    /// The same slot as the peer sees it.
    pub fn flip(self) -> Self {
        match self {
            Direction::Sending => Direction::Receiving,
            Direction::Receiving => Direction::Sending,
        }
    }
}

/// All inner packet kinds. Encoding is explicit tag + fields + u16 length prefixes (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Unsolicited request to become friends. Sent under the static key.
    FriendRequest { nospam: Nospam, message: Vec<u8> },
    /// Key exchange: our current ephemeral key and the last peer ephemeral we saw (zeros if none).
    Handshake {
        protocol_version: u8,
        ephemeral: PublicKey,
        echo: PublicKey,
    },
    /// Liveness keepalive.
    Ping,
    Message { id: u32, body: Vec<u8> },
    Action { id: u32, body: Vec<u8> },
    /// Read receipt for a message or action id.
    Receipt { id: u32 },
    Name { name: Vec<u8> },
    StatusMessage { status: Vec<u8> },
    UserStatus { status: UserStatus },
    Typing { is_typing: bool },
    FileSendRequest {
        slot: u8,
        size: u64,
        file_name: Vec<u8>,
    },
    /// `direction` is the slot's direction as the packet's sender sees it.
    FileControl {
        direction: Direction,
        slot: u8,
        control: FileControl,
        data: Vec<u8>,
    },
    FileData { slot: u8, data: Vec<u8> },
    /// Receiver acknowledges `count` chunks on a slot.
    FileAck { slot: u8, count: u16 },
}

impl Packet {
    /// Short name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::FriendRequest { .. } => "friend-request",
            Packet::Handshake { .. } => "handshake",
            Packet::Ping => "ping",
            Packet::Message { .. } => "message",
            Packet::Action { .. } => "action",
            Packet::Receipt { .. } => "receipt",
            Packet::Name { .. } => "name",
            Packet::StatusMessage { .. } => "status-message",
            Packet::UserStatus { .. } => "user-status",
            Packet::Typing { .. } => "typing",
            Packet::FileSendRequest { .. } => "file-send-request",
            Packet::FileControl { .. } => "file-control",
            Packet::FileData { .. } => "file-data",
            Packet::FileAck { .. } => "file-ack",
        }
    }
}

/// Truncate to at most `max` bytes. Stored length is the returned slice's length.
pub fn truncate(bytes: &[u8], max: usize) -> &[u8] {
    &bytes[..bytes.len().min(max)]
}
