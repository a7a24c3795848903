//! Per-friend connection state machine and packet sealing.
//!
//! `Offline -> Handshaking -> Online`, and back to `Offline` on timeout or deletion.
//! Friend requests and handshakes travel under a key derived from the long-term static DH, so
//! only the two key owners can produce or read them. Each handshake carries a fresh ephemeral
//! key plus an echo of the last peer ephemeral seen; session keys come from the ephemeral DH.
//! A handshake whose echo does not match our current ephemeral gets answered, which makes
//! simultaneous or repeated handshakes converge without ping-pong. Data nonces pass a sliding
//! replay window before decryption.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::{
    decrypt_wire, derive_session_key, encrypt_wire, Keypair, PublicKey, WireCryptoError,
    SESSION_KEY_LABEL, STATIC_KEY_LABEL,
};
use crate::protocol::{Packet, PROTOCOL_VERSION};
use crate::routing::NetworkLocation;
use crate::wire::{self, DecodeError, EncodeError, Envelope, EnvelopeClass};

/// Connection state of a friend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Offline,
    Handshaking,
    Online,
}

struct SessionKeys {
    tx: [u8; 32],
    rx: [u8; 32],
}

/// What the engine must do after a handshake was accepted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct HandshakeOutcome {
    /// Peer has not seen our current ephemeral: send ours.
    pub reply: bool,
    /// Friend just transitioned to online.
    pub became_online: bool,
    /// Already online and switched to a new peer ephemeral; the peer lost its session state.
    pub rekeyed: bool,
    /// New peer ephemeral not yet tied to our current one; the session is unchanged.
    pub unconfirmed: bool,
}

/// Number of nonces below the highest seen that are still accepted once.
const REPLAY_WINDOW: u64 = 64;

/// Sliding window over received data nonces: the highest seen plus a bitmap of the 64 below it.
#[derive(Debug, Default, Clone, Copy)]
struct ReplayWindow {
    /// Highest accepted nonce plus one; zero before any traffic.
    next: u64,
    /// Bit `i` set means nonce `next - 1 - i` was accepted.
    seen: u64,
}

impl ReplayWindow {
    fn fresh(&self, nonce: u64) -> bool {
        if nonce >= self.next {
            return true;
        }
        let age = self.next - 1 - nonce;
        age < REPLAY_WINDOW && self.seen & (1 << age) == 0
    }

    fn accept(&mut self, nonce: u64) {
        if nonce >= self.next {
            let shift = (nonce - self.next).saturating_add(1);
            self.seen = if shift >= REPLAY_WINDOW {
                0
            } else {
                self.seen << shift
            };
            self.seen |= 1;
            self.next = nonce.saturating_add(1);
        } else {
            self.seen |= 1 << (self.next - 1 - nonce);
        }
    }
}

pub(crate) struct Connection {
    state: ConnectionState,
    location: Option<NetworkLocation>,
    ephemeral: Option<Keypair>,
    peer_ephemeral: Option<PublicKey>,
    /// Peer ephemerals replaced while online with our current ephemeral.
    retired_peer_ephemerals: Vec<PublicKey>,
    keys: Option<SessionKeys>,
    send_nonce: u64,
    replay: ReplayWindow,
    /// Tick of the last handshake sent (drives retry cadence while offline or handshaking).
    last_handshake_tick: Option<u64>,
    handshake_started_tick: u64,
    last_recv_tick: u64,
    last_sent_tick: u64,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Offline,
            location: None,
            ephemeral: None,
            peer_ephemeral: None,
            retired_peer_ephemerals: Vec::new(),
            keys: None,
            send_nonce: 0,
            replay: ReplayWindow::default(),
            last_handshake_tick: None,
            handshake_started_tick: 0,
            last_recv_tick: 0,
            last_sent_tick: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn location(&self) -> Option<NetworkLocation> {
        self.location
    }

    pub fn set_location(&mut self, location: NetworkLocation) {
        self.location = Some(location);
    }

    /// Whether a handshake (first attempt or resend) should go out this tick.
    pub fn handshake_due(&self, tick: u64, retry_ticks: u64) -> bool {
        match self.state {
            ConnectionState::Online => false,
            _ => self
                .last_handshake_tick
                .map_or(true, |t| tick.saturating_sub(t) >= retry_ticks),
        }
    }

    /// Start a fresh handshake from offline: new ephemeral, forget any old peer ephemeral.
    pub fn begin_handshake(&mut self, tick: u64) {
        self.ephemeral = Some(Keypair::generate());
        self.peer_ephemeral = None;
        self.retired_peer_ephemerals.clear();
        self.keys = None;
        self.replay = ReplayWindow::default();
        self.state = ConnectionState::Handshaking;
        self.handshake_started_tick = tick;
    }

    pub fn handshake_expired(&self, tick: u64, timeout_ticks: u64) -> bool {
        self.state == ConnectionState::Handshaking
            && tick.saturating_sub(self.handshake_started_tick) > timeout_ticks
    }

    /// Handshake carrying our current ephemeral, if we have one.
    pub fn handshake_packet(&self) -> Option<Packet> {
        let ours = self.ephemeral.as_ref()?;
        Some(Packet::Handshake {
            protocol_version: PROTOCOL_VERSION,
            ephemeral: *ours.public_key(),
            echo: self
                .peer_ephemeral
                .unwrap_or_else(|| PublicKey::from_bytes([0u8; 32])),
        })
    }

    /// Start the retry clock, whether or not the handshake could be sent.
    pub fn mark_handshake_attempt(&mut self, tick: u64) {
        self.last_handshake_tick = Some(tick);
        self.last_sent_tick = tick;
    }

    /// Apply an authenticated handshake from the friend.
    ///
    /// While online, a new peer ephemeral is only adopted once it echoes our current ephemeral.
    /// Ours is fresh for this session, so a late or replayed handshake from an earlier session
    /// can never carry it; such a handshake only earns a reply. Peer ephemerals already
    /// replaced during this session are ignored outright.
    pub fn on_handshake(
        &mut self,
        our_key: &PublicKey,
        their_key: &PublicKey,
        their_ephemeral: PublicKey,
        echo: PublicKey,
        tick: u64,
    ) -> HandshakeOutcome {
        let online = self.state == ConnectionState::Online;
        let ours = self.ephemeral.as_ref().map(|k| *k.public_key());
        let settled = HandshakeOutcome {
            reply: false,
            became_online: false,
            rekeyed: false,
            unconfirmed: false,
        };

        if online {
            if self.peer_ephemeral == Some(their_ephemeral) {
                return HandshakeOutcome {
                    reply: ours != Some(echo),
                    ..settled
                };
            }
            if self.retired_peer_ephemerals.contains(&their_ephemeral) {
                return settled;
            }
            if ours != Some(echo) {
                return HandshakeOutcome {
                    reply: true,
                    unconfirmed: true,
                    ..settled
                };
            }
        }

        let ephemeral = self.ephemeral.take().unwrap_or_else(Keypair::generate);
        let ours = *ephemeral.public_key();
        let shared = ephemeral.shared_secret(&their_ephemeral);
        self.ephemeral = Some(ephemeral);
        if let Some(previous) = self.peer_ephemeral.replace(their_ephemeral) {
            if online {
                self.retired_peer_ephemerals.push(previous);
            }
        }
        self.keys = Some(SessionKeys {
            tx: derive_session_key(SESSION_KEY_LABEL, &shared, our_key, their_key),
            rx: derive_session_key(SESSION_KEY_LABEL, &shared, their_key, our_key),
        });
        // Fresh key pair, so counters and the replay window start over.
        self.send_nonce = 0;
        self.replay = ReplayWindow::default();
        self.last_recv_tick = tick;
        self.state = ConnectionState::Online;

        HandshakeOutcome {
            reply: echo != ours,
            became_online: !online,
            rekeyed: online,
            unconfirmed: false,
        }
    }

    pub fn go_offline(&mut self) {
        self.state = ConnectionState::Offline;
        self.ephemeral = None;
        self.peer_ephemeral = None;
        self.retired_peer_ephemerals.clear();
        self.keys = None;
        self.send_nonce = 0;
        self.replay = ReplayWindow::default();
    }

    pub fn liveness_expired(&self, tick: u64, timeout_ticks: u64) -> bool {
        self.state == ConnectionState::Online
            && tick.saturating_sub(self.last_recv_tick) > timeout_ticks
    }

    pub fn ping_due(&self, tick: u64, interval_ticks: u64) -> bool {
        self.state == ConnectionState::Online
            && tick.saturating_sub(self.last_sent_tick) >= interval_ticks
    }

    /// Encrypt a packet under the session key. Requires `Online`.
    pub fn seal(
        &mut self,
        our_key: &PublicKey,
        packet: &Packet,
        tick: u64,
    ) -> Result<Vec<u8>, SessionError> {
        let keys = match (&self.state, &self.keys) {
            (ConnectionState::Online, Some(keys)) => keys,
            _ => return Err(SessionError::NotOnline),
        };
        let plaintext = wire::encode_packet(packet)?;
        let nonce = self.send_nonce;
        let ciphertext = encrypt_wire(&keys.tx, nonce, &plaintext)?;
        self.send_nonce = self.send_nonce.wrapping_add(1);
        self.last_sent_tick = tick;
        Ok(wire::encode_envelope(&Envelope {
            class: EnvelopeClass::Data,
            sender: *our_key,
            nonce,
            ciphertext,
        }))
    }

    /// Decrypt and decode session traffic. Only online friends have session keys.
    pub fn open(&mut self, envelope: &Envelope, tick: u64) -> Result<Packet, SessionError> {
        let keys = match (&self.state, &self.keys) {
            (ConnectionState::Online, Some(keys)) => keys,
            _ => return Err(SessionError::NotOnline),
        };
        if !self.replay.fresh(envelope.nonce) {
            return Err(SessionError::Replayed);
        }
        let plaintext = decrypt_wire(&keys.rx, envelope.nonce, &envelope.ciphertext)?;
        self.replay.accept(envelope.nonce);
        // Authentic traffic proves liveness even if the payload turns out malformed.
        self.last_recv_tick = tick;
        Ok(wire::decode_packet(&plaintext)?)
    }
}

/// Encrypt a request or handshake under the static key shared with `peer`.
pub(crate) fn seal_static(
    identity: &Keypair,
    peer: &PublicKey,
    class: EnvelopeClass,
    packet: &Packet,
) -> Result<Vec<u8>, SessionError> {
    let plaintext = wire::encode_packet(packet)?;
    let shared = identity.shared_secret(peer);
    let key = derive_session_key(STATIC_KEY_LABEL, &shared, identity.public_key(), peer);
    let nonce = OsRng.next_u64();
    let ciphertext = encrypt_wire(&key, nonce, &plaintext)?;
    Ok(wire::encode_envelope(&Envelope {
        class,
        sender: *identity.public_key(),
        nonce,
        ciphertext,
    }))
}

/// Decrypt a request or handshake from `envelope.sender`.
pub(crate) fn open_static(identity: &Keypair, envelope: &Envelope) -> Result<Packet, SessionError> {
    let shared = identity.shared_secret(&envelope.sender);
    let key = derive_session_key(
        STATIC_KEY_LABEL,
        &shared,
        &envelope.sender,
        identity.public_key(),
    );
    let plaintext = decrypt_wire(&key, envelope.nonce, &envelope.ciphertext)?;
    Ok(wire::decode_packet(&plaintext)?)
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session with this friend")]
    NotOnline,
    #[error("nonce already received")]
    Replayed,
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Crypto(#[from] WireCryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_parts(packet: Packet) -> (PublicKey, PublicKey) {
        match packet {
            Packet::Handshake {
                ephemeral, echo, ..
            } => (ephemeral, echo),
            other => panic!("expected Handshake, got {:?}", other),
        }
    }

    /// Drive two connections to online with A initiating.
    fn connect(a: &mut Connection, b: &mut Connection, a_key: &PublicKey, b_key: &PublicKey) {
        a.begin_handshake(1);
        let (a_eph, a_echo) = handshake_parts(a.handshake_packet().unwrap());
        let out_b = b.on_handshake(b_key, a_key, a_eph, a_echo, 1);
        assert_eq!(
            out_b,
            HandshakeOutcome {
                reply: true,
                became_online: true,
                rekeyed: false,
                unconfirmed: false,
            }
        );
        let (b_eph, b_echo) = handshake_parts(b.handshake_packet().unwrap());
        let out_a = a.on_handshake(a_key, b_key, b_eph, b_echo, 2);
        assert_eq!(
            out_a,
            HandshakeOutcome {
                reply: false,
                became_online: true,
                rekeyed: false,
                unconfirmed: false,
            }
        );
    }

    #[test]
    fn handshake_then_traffic() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (mut a, mut b) = (Connection::new(), Connection::new());
        connect(&mut a, &mut b, a_id.public_key(), b_id.public_key());

        let sealed = a
            .seal(a_id.public_key(), &Packet::Receipt { id: 9 }, 3)
            .unwrap();
        let envelope = wire::decode_envelope(&sealed).unwrap();
        assert_eq!(envelope.nonce, 0);
        assert_eq!(b.open(&envelope, 3).unwrap(), Packet::Receipt { id: 9 });

        let reply = b.seal(b_id.public_key(), &Packet::Ping, 4).unwrap();
        let envelope = wire::decode_envelope(&reply).unwrap();
        assert_eq!(a.open(&envelope, 4).unwrap(), Packet::Ping);
    }

    #[test]
    fn simultaneous_handshakes_converge() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (a_key, b_key) = (a_id.public_key(), b_id.public_key());
        let (mut a, mut b) = (Connection::new(), Connection::new());
        a.begin_handshake(1);
        b.begin_handshake(1);
        let (a_eph, a_echo) = handshake_parts(a.handshake_packet().unwrap());
        let (b_eph, b_echo) = handshake_parts(b.handshake_packet().unwrap());
        assert!(a.on_handshake(a_key, b_key, b_eph, b_echo, 2).reply);
        assert!(b.on_handshake(b_key, a_key, a_eph, a_echo, 2).reply);
        let (a_eph2, a_echo2) = handshake_parts(a.handshake_packet().unwrap());
        let (b_eph2, b_echo2) = handshake_parts(b.handshake_packet().unwrap());
        assert!(!a.on_handshake(a_key, b_key, b_eph2, b_echo2, 3).reply);
        assert!(!b.on_handshake(b_key, a_key, a_eph2, a_echo2, 3).reply);

        let sealed = a.seal(a_key, &Packet::Ping, 4).unwrap();
        let envelope = wire::decode_envelope(&sealed).unwrap();
        assert_eq!(b.open(&envelope, 4).unwrap(), Packet::Ping);
    }

    #[test]
    fn stale_handshake_does_not_reset_session() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (mut a, mut b) = (Connection::new(), Connection::new());
        connect(&mut a, &mut b, a_id.public_key(), b_id.public_key());
        // A's first handshake arrives again at B.
        let (a_eph, _) = handshake_parts(a.handshake_packet().unwrap());
        let zero = PublicKey::from_bytes([0u8; 32]);
        let out = b.on_handshake(b_id.public_key(), a_id.public_key(), a_eph, zero, 5);
        assert!(out.reply);
        assert!(!out.became_online);

        let sealed = a.seal(a_id.public_key(), &Packet::Ping, 6).unwrap();
        let envelope = wire::decode_envelope(&sealed).unwrap();
        assert_eq!(b.open(&envelope, 6).unwrap(), Packet::Ping);
    }

    fn ping(from: &mut Connection, key: &PublicKey, tick: u64) -> Envelope {
        let sealed = from.seal(key, &Packet::Ping, tick).unwrap();
        wire::decode_envelope(&sealed).unwrap()
    }

    #[test]
    fn handshake_from_earlier_session_is_answered_not_adopted() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (a_key, b_key) = (a_id.public_key(), b_id.public_key());

        // A handshake A sent in a session that has since ended.
        let mut old = Connection::new();
        old.begin_handshake(0);
        let (old_eph, old_echo) = handshake_parts(old.handshake_packet().unwrap());

        let (mut a, mut b) = (Connection::new(), Connection::new());
        connect(&mut a, &mut b, a_key, b_key);
        let out = b.on_handshake(b_key, a_key, old_eph, old_echo, 5);
        assert!(out.reply && out.unconfirmed);
        assert!(!out.rekeyed && !out.became_online);

        // B's answer settles at A without another round.
        let (b_eph, b_echo) = handshake_parts(b.handshake_packet().unwrap());
        let out = a.on_handshake(a_key, b_key, b_eph, b_echo, 6);
        assert!(!out.reply && !out.rekeyed);

        let envelope = ping(&mut a, a_key, 7);
        assert_eq!(b.open(&envelope, 7).unwrap(), Packet::Ping);
        let envelope = ping(&mut b, b_key, 7);
        assert_eq!(a.open(&envelope, 7).unwrap(), Packet::Ping);
    }

    #[test]
    fn restarted_peer_rekeys_once_it_echoes_our_ephemeral() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (a_key, b_key) = (a_id.public_key(), b_id.public_key());
        let (mut a, mut b) = (Connection::new(), Connection::new());
        connect(&mut a, &mut b, a_key, b_key);
        let (first_eph, _) = handshake_parts(a.handshake_packet().unwrap());

        let mut restarted = Connection::new();
        restarted.begin_handshake(10);
        let (eph, echo) = handshake_parts(restarted.handshake_packet().unwrap());
        let out = b.on_handshake(b_key, a_key, eph, echo, 10);
        assert!(out.unconfirmed && !out.rekeyed);

        let (b_eph, b_echo) = handshake_parts(b.handshake_packet().unwrap());
        let out = restarted.on_handshake(a_key, b_key, b_eph, b_echo, 11);
        assert!(out.became_online && out.reply);

        let (eph, echo) = handshake_parts(restarted.handshake_packet().unwrap());
        let out = b.on_handshake(b_key, a_key, eph, echo, 12);
        assert!(out.rekeyed && !out.reply && !out.became_online);

        let envelope = ping(&mut restarted, a_key, 13);
        assert_eq!(envelope.nonce, 0);
        assert_eq!(b.open(&envelope, 13).unwrap(), Packet::Ping);
        let envelope = ping(&mut b, b_key, 13);
        assert_eq!(restarted.open(&envelope, 13).unwrap(), Packet::Ping);

        // The superseded session cannot be brought back, even echoing B's ephemeral.
        let out = b.on_handshake(b_key, a_key, first_eph, b_eph, 14);
        assert!(!out.reply && !out.rekeyed && !out.unconfirmed);
        let envelope = ping(&mut restarted, a_key, 15);
        assert_eq!(b.open(&envelope, 15).unwrap(), Packet::Ping);
    }

    #[test]
    fn replayed_data_is_rejected() {
        let a_id = Keypair::generate();
        let b_id = Keypair::generate();
        let (a_key, b_key) = (a_id.public_key(), b_id.public_key());
        let (mut a, mut b) = (Connection::new(), Connection::new());
        connect(&mut a, &mut b, a_key, b_key);

        let first = ping(&mut a, a_key, 3);
        let second = ping(&mut a, a_key, 3);
        // Out of order inside the window is fine, but each nonce opens once.
        assert_eq!(b.open(&second, 3).unwrap(), Packet::Ping);
        assert_eq!(b.open(&first, 3).unwrap(), Packet::Ping);
        assert!(matches!(b.open(&first, 4), Err(SessionError::Replayed)));
        assert!(matches!(b.open(&second, 4), Err(SessionError::Replayed)));

        // Anything older than the window is gone for good.
        let last = (0..=REPLAY_WINDOW)
            .map(|_| ping(&mut a, a_key, 5))
            .last()
            .unwrap();
        assert_eq!(b.open(&last, 5).unwrap(), Packet::Ping);
        let mut straggler = second;
        straggler.nonce = 2;
        assert!(matches!(b.open(&straggler, 5), Err(SessionError::Replayed)));
    }

    #[test]
    fn replay_window_slides() {
        let mut window = ReplayWindow::default();
        assert!(window.fresh(0));
        window.accept(0);
        assert!(!window.fresh(0));
        window.accept(100);
        assert!(window.fresh(40));
        assert!(!window.fresh(36));
        window.accept(40);
        assert!(!window.fresh(40));
        assert!(window.fresh(41));
        assert!(window.fresh(u64::MAX));
    }

    #[test]
    fn seal_requires_online() {
        let id = Keypair::generate();
        let mut c = Connection::new();
        assert!(matches!(
            c.seal(id.public_key(), &Packet::Ping, 0),
            Err(SessionError::NotOnline)
        ));
        c.begin_handshake(0);
        assert_eq!(c.state(), ConnectionState::Handshaking);
        assert!(matches!(
            c.seal(id.public_key(), &Packet::Ping, 0),
            Err(SessionError::NotOnline)
        ));
    }

    #[test]
    fn static_envelope_only_opens_for_recipient() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let eve = Keypair::generate();
        let packet = Packet::Ping;
        let sealed = seal_static(&a, b.public_key(), EnvelopeClass::Handshake, &packet).unwrap();
        let envelope = wire::decode_envelope(&sealed).unwrap();
        assert_eq!(envelope.sender, *a.public_key());
        assert_eq!(open_static(&b, &envelope).unwrap(), packet);
        assert!(matches!(
            open_static(&eve, &envelope),
            Err(SessionError::Crypto(_))
        ));
    }

    #[test]
    fn timers() {
        let mut c = Connection::new();
        assert!(c.handshake_due(0, 10));
        c.begin_handshake(0);
        c.mark_handshake_attempt(0);
        assert!(!c.handshake_due(5, 10));
        assert!(c.handshake_due(10, 10));
        assert!(!c.handshake_expired(20, 20));
        assert!(c.handshake_expired(21, 20));
        c.go_offline();
        assert_eq!(c.state(), ConnectionState::Offline);
        assert!(c.handshake_packet().is_none());
    }
}
