//! Save blob: `"PRLY"` magic, u16 BE format version, then the bincode-encoded state.
//!
//! Decoding is strict (fixed-width integers, no trailing bytes, bounded size) and the decoded
//! state is validated before the engine swaps it in.

use std::collections::HashSet;
use std::net::SocketAddr;

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Keypair, PublicKey};
use crate::protocol::UserStatus;

pub const MAGIC: &[u8; 4] = b"PRLY";
pub const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 6;
/// Highest friend id accepted from a blob.
pub const MAX_FRIEND_ID: u32 = u16::MAX as u32;
/// Upper bound on an encoded state; larger blobs are rejected before allocation.
const MAX_STATE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    pub secret_key: [u8; 32],
    /// Stored alongside the secret so a damaged keypair section is detected.
    pub public_key: PublicKey,
    pub nospam: u32,
    pub name: Vec<u8>,
    pub status_message: Vec<u8>,
    pub user_status: UserStatus,
    pub friends: Vec<SavedFriend>,
    pub routing_hints: Vec<RoutingHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedFriend {
    pub id: u32,
    pub public_key: PublicKey,
    pub name: Vec<u8>,
    pub status_message: Vec<u8>,
    pub user_status: UserStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub sends_receipts: bool,
    pub pending_request: Option<SavedRequest>,
    pub location: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRequest {
    pub nospam: u32,
    pub message: Vec<u8>,
}

/// Known location of a node, fed back to the router on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHint {
    pub public_key: PublicKey,
    pub location: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("blob too short")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("decode failed: {0}")]
    Decode(#[from] bincode::Error),
    #[error("public key does not match secret key")]
    KeyMismatch,
    #[error("friend id {0} out of range")]
    IdOutOfRange(u32),
    #[error("duplicate friend id {0}")]
    DuplicateId(u32),
    #[error("duplicate friend key {0}")]
    DuplicateKey(PublicKey),
    #[error("own key in friend list")]
    OwnKey,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_STATE_SIZE)
        .reject_trailing_bytes()
}

pub fn encode(state: &SaveState) -> Result<Vec<u8>, PersistError> {
    let body = options().serialize(state)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Exact size `encode` will produce.
pub fn encoded_size(state: &SaveState) -> Result<usize, PersistError> {
    Ok(HEADER_SIZE + options().serialized_size(state)? as usize)
}

/// Decode and validate a blob.
pub fn decode(bytes: &[u8]) -> Result<SaveState, PersistError> {
    if bytes.len() < HEADER_SIZE {
        return Err(PersistError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let state: SaveState = options().deserialize(&bytes[HEADER_SIZE..])?;
    validate(&state)?;
    Ok(state)
}

fn validate(state: &SaveState) -> Result<(), PersistError> {
    let keypair = Keypair::from_secret_bytes(state.secret_key);
    if *keypair.public_key() != state.public_key {
        return Err(PersistError::KeyMismatch);
    }
    let mut ids = HashSet::new();
    let mut keys = HashSet::new();
    for friend in &state.friends {
        if friend.public_key == state.public_key {
            return Err(PersistError::OwnKey);
        }
        if friend.id > MAX_FRIEND_ID {
            return Err(PersistError::IdOutOfRange(friend.id));
        }
        if !ids.insert(friend.id) {
            return Err(PersistError::DuplicateId(friend.id));
        }
        if !keys.insert(friend.public_key) {
            return Err(PersistError::DuplicateKey(friend.public_key));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn friend(id: u32) -> SavedFriend {
        SavedFriend {
            id,
            public_key: *Keypair::generate().public_key(),
            name: b"friend".to_vec(),
            status_message: Vec::new(),
            user_status: UserStatus::Away,
            last_seen: Some(Utc::now()),
            sends_receipts: true,
            pending_request: Some(SavedRequest {
                nospam: 7,
                message: b"hi".to_vec(),
            }),
            location: Some("127.0.0.1:33445".parse().unwrap()),
        }
    }

    fn state() -> SaveState {
        let keypair = Keypair::generate();
        SaveState {
            secret_key: keypair.secret_bytes(),
            public_key: *keypair.public_key(),
            nospam: 0xDEADBEEF,
            name: b"me".to_vec(),
            status_message: b"here".to_vec(),
            user_status: UserStatus::Busy,
            friends: vec![friend(0), friend(2)],
            routing_hints: vec![RoutingHint {
                public_key: *Keypair::generate().public_key(),
                location: "10.0.0.1:33445".parse().unwrap(),
            }],
        }
    }

    #[test]
    fn encode_decode() {
        let s = state();
        let blob = encode(&s).unwrap();
        assert_eq!(&blob[..4], MAGIC);
        assert_eq!(encoded_size(&s).unwrap(), blob.len());
        assert_eq!(decode(&blob).unwrap(), s);
    }

    #[test]
    fn header_errors() {
        let blob = encode(&state()).unwrap();
        assert!(matches!(decode(&blob[..3]), Err(PersistError::Truncated)));
        let mut bad = blob.clone();
        bad[0] = b'X';
        assert!(matches!(decode(&bad), Err(PersistError::BadMagic)));
        let mut bad = blob.clone();
        bad[5] = 9;
        assert!(matches!(
            decode(&bad),
            Err(PersistError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_and_trailing_rejected() {
        let blob = encode(&state()).unwrap();
        assert!(matches!(
            decode(&blob[..blob.len() - 1]),
            Err(PersistError::Decode(_))
        ));
        let mut long = blob.clone();
        long.push(0);
        assert!(matches!(decode(&long), Err(PersistError::Decode(_))));
    }

    #[test]
    fn inconsistent_tables_rejected() {
        let mut s = state();
        s.friends[1].id = 0;
        assert!(matches!(
            decode(&encode(&s).unwrap()),
            Err(PersistError::DuplicateId(0))
        ));

        let mut s = state();
        s.friends[1].public_key = s.friends[0].public_key;
        assert!(matches!(
            decode(&encode(&s).unwrap()),
            Err(PersistError::DuplicateKey(_))
        ));

        let mut s = state();
        s.friends[0].public_key = s.public_key;
        assert!(matches!(
            decode(&encode(&s).unwrap()),
            Err(PersistError::OwnKey)
        ));

        let mut s = state();
        s.friends[0].id = u32::MAX;
        assert!(matches!(
            decode(&encode(&s).unwrap()),
            Err(PersistError::IdOutOfRange(_))
        ));

        let mut s = state();
        s.public_key = *Keypair::generate().public_key();
        assert!(matches!(
            decode(&encode(&s).unwrap()),
            Err(PersistError::KeyMismatch)
        ));
    }
}
