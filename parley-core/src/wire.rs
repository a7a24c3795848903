//! Wire codec: tagged packets with explicit u16 length prefixes, and the outer envelope.
//!
//! Packet layout: `tag (1) ‖ fixed fields ‖ len (u16 BE) ‖ payload`. Integers are big-endian.
//! Payloads are raw bytes, never NUL-terminated. Names and status messages are truncated to
//! their maximum on both encode and decode; every other payload over its limit is rejected.
//!
//! Envelope layout: `class (1) ‖ sender public key (32) ‖ nonce (u64 BE) ‖ ciphertext`.

use bytes::{Buf, BufMut, BytesMut};

use crate::identity::{Nospam, PublicKey, PUBLIC_KEY_SIZE};
use crate::protocol::{
    self, Direction, FileControl, Packet, UserStatus, MAX_FILENAME_LENGTH, MAX_FILE_DATA_SIZE,
    MAX_FRIEND_REQUEST_LENGTH, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH, MAX_STATUS_MESSAGE_LENGTH,
};

const TAG_FRIEND_REQUEST: u8 = 0x01;
const TAG_HANDSHAKE: u8 = 0x02;
const TAG_PING: u8 = 0x10;
const TAG_MESSAGE: u8 = 0x11;
const TAG_ACTION: u8 = 0x12;
const TAG_RECEIPT: u8 = 0x13;
const TAG_NAME: u8 = 0x14;
const TAG_STATUS_MESSAGE: u8 = 0x15;
const TAG_USER_STATUS: u8 = 0x16;
const TAG_TYPING: u8 = 0x17;
const TAG_FILE_SEND_REQUEST: u8 = 0x20;
const TAG_FILE_CONTROL: u8 = 0x21;
const TAG_FILE_DATA: u8 = 0x22;
const TAG_FILE_ACK: u8 = 0x23;

/// Envelope header: class + sender key + nonce.
pub const ENVELOPE_HEADER_SIZE: usize = 1 + PUBLIC_KEY_SIZE + 8;
/// Poly1305 tag appended by the AEAD.
const AEAD_TAG_SIZE: usize = 16;

/// Encode a packet into its wire form.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let mut out = BytesMut::with_capacity(64);
    match packet {
        Packet::FriendRequest { nospam, message } => {
            out.put_u8(TAG_FRIEND_REQUEST);
            out.put_slice(&nospam.to_bytes());
            put_payload(&mut out, "friend request", message, MAX_FRIEND_REQUEST_LENGTH)?;
        }
        Packet::Handshake {
            protocol_version,
            ephemeral,
            echo,
        } => {
            out.put_u8(TAG_HANDSHAKE);
            out.put_u8(*protocol_version);
            out.put_slice(ephemeral.as_bytes());
            out.put_slice(echo.as_bytes());
        }
        Packet::Ping => out.put_u8(TAG_PING),
        Packet::Message { id, body } => {
            out.put_u8(TAG_MESSAGE);
            out.put_u32(*id);
            put_payload(&mut out, "message", body, MAX_MESSAGE_LENGTH)?;
        }
        Packet::Action { id, body } => {
            out.put_u8(TAG_ACTION);
            out.put_u32(*id);
            put_payload(&mut out, "action", body, MAX_MESSAGE_LENGTH)?;
        }
        Packet::Receipt { id } => {
            out.put_u8(TAG_RECEIPT);
            out.put_u32(*id);
        }
        Packet::Name { name } => {
            out.put_u8(TAG_NAME);
            put_truncated(&mut out, name, MAX_NAME_LENGTH);
        }
        Packet::StatusMessage { status } => {
            out.put_u8(TAG_STATUS_MESSAGE);
            put_truncated(&mut out, status, MAX_STATUS_MESSAGE_LENGTH);
        }
        Packet::UserStatus { status } => {
            out.put_u8(TAG_USER_STATUS);
            out.put_u8(status.to_byte());
        }
        Packet::Typing { is_typing } => {
            out.put_u8(TAG_TYPING);
            out.put_u8(u8::from(*is_typing));
        }
        Packet::FileSendRequest {
            slot,
            size,
            file_name,
        } => {
            out.put_u8(TAG_FILE_SEND_REQUEST);
            out.put_u8(*slot);
            out.put_u64(*size);
            put_payload(&mut out, "file name", file_name, MAX_FILENAME_LENGTH)?;
        }
        Packet::FileControl {
            direction,
            slot,
            control,
            data,
        } => {
            out.put_u8(TAG_FILE_CONTROL);
            out.put_u8(match direction {
                Direction::Sending => 0,
                Direction::Receiving => 1,
            });
            out.put_u8(*slot);
            out.put_u8(control.to_byte());
            put_payload(&mut out, "file control data", data, MAX_FILE_DATA_SIZE)?;
        }
        Packet::FileData { slot, data } => {
            out.put_u8(TAG_FILE_DATA);
            out.put_u8(*slot);
            put_payload(&mut out, "file data", data, MAX_FILE_DATA_SIZE)?;
        }
        Packet::FileAck { slot, count } => {
            out.put_u8(TAG_FILE_ACK);
            out.put_u8(*slot);
            out.put_u16(*count);
        }
    }
    Ok(out.to_vec())
}

fn put_payload(
    out: &mut BytesMut,
    field: &'static str,
    payload: &[u8],
    max: usize,
) -> Result<(), EncodeError> {
    if payload.len() > max {
        return Err(EncodeError::TooLong {
            field,
            len: payload.len(),
            max,
        });
    }
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    Ok(())
}

fn put_truncated(out: &mut BytesMut, payload: &[u8], max: usize) {
    let kept = protocol::truncate(payload, max);
    out.put_u16(kept.len() as u16);
    out.put_slice(kept);
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} too long: {len} bytes (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// Decode exactly one packet; the whole slice must be consumed.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let mut buf = bytes;
    need(&buf, 1)?;
    let tag = buf.get_u8();
    let packet = match tag {
        TAG_FRIEND_REQUEST => {
            need(&buf, 4)?;
            let nospam = Nospam(buf.get_u32());
            let message = get_payload(&mut buf, "friend request", MAX_FRIEND_REQUEST_LENGTH)?;
            Packet::FriendRequest { nospam, message }
        }
        TAG_HANDSHAKE => {
            need(&buf, 1 + 2 * PUBLIC_KEY_SIZE)?;
            let protocol_version = buf.get_u8();
            let ephemeral = get_key(&mut buf);
            let echo = get_key(&mut buf);
            Packet::Handshake {
                protocol_version,
                ephemeral,
                echo,
            }
        }
        TAG_PING => Packet::Ping,
        TAG_MESSAGE | TAG_ACTION => {
            need(&buf, 4)?;
            let id = buf.get_u32();
            let body = get_payload(&mut buf, "message", MAX_MESSAGE_LENGTH)?;
            if tag == TAG_MESSAGE {
                Packet::Message { id, body }
            } else {
                Packet::Action { id, body }
            }
        }
        TAG_RECEIPT => {
            need(&buf, 4)?;
            Packet::Receipt { id: buf.get_u32() }
        }
        TAG_NAME => Packet::Name {
            name: get_truncated(&mut buf, MAX_NAME_LENGTH)?,
        },
        TAG_STATUS_MESSAGE => Packet::StatusMessage {
            status: get_truncated(&mut buf, MAX_STATUS_MESSAGE_LENGTH)?,
        },
        TAG_USER_STATUS => {
            need(&buf, 1)?;
            let status = UserStatus::from_byte(buf.get_u8())
                .ok_or(DecodeError::InvalidField("user status"))?;
            Packet::UserStatus { status }
        }
        TAG_TYPING => {
            need(&buf, 1)?;
            let is_typing = match buf.get_u8() {
                0 => false,
                1 => true,
                _ => return Err(DecodeError::InvalidField("typing flag")),
            };
            Packet::Typing { is_typing }
        }
        TAG_FILE_SEND_REQUEST => {
            need(&buf, 1 + 8)?;
            let slot = buf.get_u8();
            let size = buf.get_u64();
            let file_name = get_payload(&mut buf, "file name", MAX_FILENAME_LENGTH)?;
            Packet::FileSendRequest {
                slot,
                size,
                file_name,
            }
        }
        TAG_FILE_CONTROL => {
            need(&buf, 3)?;
            let direction = match buf.get_u8() {
                0 => Direction::Sending,
                1 => Direction::Receiving,
                _ => return Err(DecodeError::InvalidField("file direction")),
            };
            let slot = buf.get_u8();
            let control = FileControl::from_byte(buf.get_u8())
                .ok_or(DecodeError::InvalidField("file control"))?;
            let data = get_payload(&mut buf, "file control data", MAX_FILE_DATA_SIZE)?;
            Packet::FileControl {
                direction,
                slot,
                control,
                data,
            }
        }
        TAG_FILE_DATA => {
            need(&buf, 1)?;
            let slot = buf.get_u8();
            let data = get_payload(&mut buf, "file data", MAX_FILE_DATA_SIZE)?;
            Packet::FileData { slot, data }
        }
        TAG_FILE_ACK => {
            need(&buf, 3)?;
            Packet::FileAck {
                slot: buf.get_u8(),
                count: buf.get_u16(),
            }
        }
        other => return Err(DecodeError::UnknownTag(other)),
    };
    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }
    Ok(packet)
}

fn need(buf: &&[u8], n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated {
            needed: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_key(buf: &mut &[u8]) -> PublicKey {
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    buf.copy_to_slice(&mut key);
    PublicKey::from_bytes(key)
}

fn get_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let payload = buf[..len].to_vec();
    buf.advance(len);
    Ok(payload)
}

fn get_payload(buf: &mut &[u8], field: &'static str, max: usize) -> Result<Vec<u8>, DecodeError> {
    let payload = get_len_prefixed(buf)?;
    if payload.len() > max {
        return Err(DecodeError::TooLong {
            field,
            len: payload.len(),
            max,
        });
    }
    Ok(payload)
}

fn get_truncated(buf: &mut &[u8], max: usize) -> Result<Vec<u8>, DecodeError> {
    let mut payload = get_len_prefixed(buf)?;
    payload.truncate(max);
    Ok(payload)
}

/// Error decoding a packet or envelope. The engine drops the packet and keeps the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid {0}")]
    InvalidField(&'static str),
    #[error("{field} too long: {len} bytes (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Outer envelope class: selects which key opens the ciphertext.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnvelopeClass {
    /// Friend request, under the static key.
    Request,
    /// Handshake, under the static key.
    Handshake,
    /// Session traffic, under the ephemeral session key.
    Data,
}

impl EnvelopeClass {
    fn to_byte(self) -> u8 {
        match self {
            EnvelopeClass::Request => 1,
            EnvelopeClass::Handshake => 2,
            EnvelopeClass::Data => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(EnvelopeClass::Request),
            2 => Some(EnvelopeClass::Handshake),
            3 => Some(EnvelopeClass::Data),
            _ => None,
        }
    }
}

/// Routed datagram: who sent it, under which key class and nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub class: EnvelopeClass,
    pub sender: PublicKey,
    pub nonce: u64,
    pub ciphertext: Vec<u8>,
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + envelope.ciphertext.len());
    out.put_u8(envelope.class.to_byte());
    out.put_slice(envelope.sender.as_bytes());
    out.put_u64(envelope.nonce);
    out.put_slice(&envelope.ciphertext);
    out.to_vec()
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut buf = bytes;
    need(&buf, ENVELOPE_HEADER_SIZE + AEAD_TAG_SIZE)?;
    let class =
        EnvelopeClass::from_byte(buf.get_u8()).ok_or(DecodeError::InvalidField("envelope class"))?;
    let sender = get_key(&mut buf);
    let nonce = buf.get_u64();
    Ok(Envelope {
        class,
        sender,
        nonce,
        ciphertext: buf.to_vec(),
    })
}

/// Sender key of a datagram without decrypting it. Routers use this to learn locations.
pub fn peek_sender(bytes: &[u8]) -> Option<PublicKey> {
    decode_envelope(bytes).ok().map(|e| e.sender)
}
