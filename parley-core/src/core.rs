//! Host-driven API: `ParleyCore` owns identity, friends, sessions and transfers.
//! The host calls `tick()` on a steady cadence; all I/O goes through the `Router`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{Dispatcher, Event, EventKind};
use crate::friends::{Friend, FriendId, FriendTable, PendingRequest};
use crate::identity::{Address, Identity, Keypair, Nospam, PublicKey};
use crate::persistence::{self, RoutingHint, SaveState, SavedFriend, SavedRequest};
use crate::protocol::{
    truncate, Direction, FileControl, Packet, UserStatus, MAX_FILENAME_LENGTH,
    MAX_FILE_DATA_SIZE, MAX_FRIEND_REQUEST_LENGTH, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH,
    MAX_STATUS_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::routing::{NetworkLocation, Router};
use crate::session::{self, ConnectionState, SessionError};
use crate::transfer::{DataOutcome, TransferManager, TransferStatus};
use crate::wire::{self, Envelope, EnvelopeClass};

/// Our own profile, pushed to each friend when they come online.
#[derive(Default)]
struct Profile {
    name: Vec<u8>,
    status_message: Vec<u8>,
    user_status: UserStatus,
}

#[derive(Clone, Copy)]
enum ChatKind {
    Message,
    Action,
}

/// Everything `kill()` tears down.
struct EngineState {
    identity: Identity,
    profile: Profile,
    friends: FriendTable,
    transfers: TransferManager,
    routing_hints: BTreeMap<PublicKey, NetworkLocation>,
    tick_count: u64,
}

/// Main coordinator. Not internally synchronized: multi-threaded hosts wrap it in one mutex.
pub struct ParleyCore<R: Router> {
    router: R,
    config: EngineConfig,
    dispatcher: Dispatcher,
    state: Option<EngineState>,
}

impl<R: Router> ParleyCore<R> {
    /// Fresh engine with a new random identity.
    pub fn new(router: R, config: EngineConfig) -> Self {
        Self::with_identity(router, config, Identity::generate())
    }

    pub fn with_identity(router: R, config: EngineConfig, identity: Identity) -> Self {
        info!(public_key = %identity.public_key(), "engine initialized");
        Self {
            router,
            config,
            dispatcher: Dispatcher::new(),
            state: Some(EngineState::new(identity)),
        }
    }

    /// Engine restored from a save blob.
    pub fn from_save(mut router: R, config: EngineConfig, blob: &[u8]) -> Result<Self> {
        let state = load_state(&mut router, blob)?;
        Ok(Self {
            router,
            config,
            dispatcher: Dispatcher::new(),
            state: Some(state),
        })
    }

    fn state(&self) -> Result<&EngineState> {
        self.state.as_ref().ok_or(EngineError::EngineNotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut EngineState> {
        self.state.as_mut().ok_or(EngineError::EngineNotInitialized)
    }

    fn parts(&mut self) -> Result<(&mut EngineState, &mut R)> {
        let state = self
            .state
            .as_mut()
            .ok_or(EngineError::EngineNotInitialized)?;
        Ok((state, &mut self.router))
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// False after `kill()`.
    pub fn is_alive(&self) -> bool {
        self.state.is_some()
    }

    // --- identity ---

    pub fn address(&self) -> Result<Address> {
        Ok(self.state()?.identity.address())
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        Ok(*self.state()?.identity.public_key())
    }

    pub fn nospam(&self) -> Result<Nospam> {
        Ok(self.state()?.identity.nospam())
    }

    /// Rotate the nospam. Requests addressed to the old address are dropped from now on.
    pub fn set_nospam(&mut self, nospam: Nospam) -> Result<()> {
        self.state_mut()?.identity.set_nospam(nospam);
        info!(nospam = nospam.0, "nospam changed");
        Ok(())
    }

    // --- friend table ---

    /// Add a friend by 38-byte address and queue a friend request carrying `message`.
    pub fn add_friend(&mut self, address: &[u8], message: &[u8]) -> Result<FriendId> {
        let retry_ticks = self.config.request_retry_ticks;
        let (state, router) = self.parts()?;
        let address = Address::from_bytes(address).map_err(|e| {
            debug!(error = %e, "rejecting friend address");
            EngineError::InvalidAddress
        })?;
        if address.public_key() == state.identity.public_key() {
            return Err(EngineError::OwnKey);
        }
        if message.is_empty() {
            return Err(EngineError::NoMessage);
        }
        if message.len() > MAX_FRIEND_REQUEST_LENGTH {
            return Err(EngineError::TooLong {
                max: MAX_FRIEND_REQUEST_LENGTH,
            });
        }
        let mut friend = Friend::new(*address.public_key());
        friend.pending_request = Some(PendingRequest::new(address.nospam(), message.to_vec()));
        let id = state.friends.insert(friend)?;
        info!(friend = %id, peer = %address.public_key(), "friend added, request queued");

        let tick = state.tick_count;
        if let Some(friend) = state.friends.get_mut(id) {
            send_request(router, state.identity.keypair(), friend, tick, retry_ticks);
        }
        Ok(id)
    }

    /// Add a friend without sending a request (accepting an inbound request).
    pub fn add_friend_no_request(&mut self, public_key: &PublicKey) -> Result<FriendId> {
        let state = self.state_mut()?;
        if public_key == state.identity.public_key() {
            return Err(EngineError::OwnKey);
        }
        let id = state.friends.insert(Friend::new(*public_key))?;
        info!(friend = %id, peer = %public_key, "friend added");
        Ok(id)
    }

    /// Remove a friend. Its transfers are dropped silently and the id becomes reusable.
    pub fn delete_friend(&mut self, friend: FriendId) -> Result<()> {
        let state = self.state_mut()?;
        state
            .friends
            .remove(friend)
            .ok_or(EngineError::UnknownFriend)?;
        let cancelled = state.transfers.cancel_friend(friend);
        info!(friend = %friend, cancelled = cancelled.len(), "friend deleted");
        Ok(())
    }

    pub fn friend_id_for_key(&self, public_key: &PublicKey) -> Result<FriendId> {
        self.state()?
            .friends
            .id_for_key(public_key)
            .ok_or(EngineError::UnknownKey)
    }

    pub fn key_for_friend_id(&self, friend: FriendId) -> Result<PublicKey> {
        Ok(*self.state()?.friend(friend)?.public_key())
    }

    pub fn friend_exists(&self, friend: FriendId) -> Result<bool> {
        Ok(self.state()?.friends.contains(friend))
    }

    pub fn friend_count(&self) -> Result<usize> {
        Ok(self.state()?.friends.len())
    }

    pub fn online_friend_count(&self) -> Result<usize> {
        Ok(self.state()?.friends.online_count())
    }

    /// Live friend ids, ascending.
    pub fn friend_list(&self) -> Result<Vec<FriendId>> {
        Ok(self.state()?.friends.ids())
    }

    pub fn friend_name(&self, friend: FriendId) -> Result<Vec<u8>> {
        Ok(self.state()?.friend(friend)?.name().to_vec())
    }

    pub fn friend_name_size(&self, friend: FriendId) -> Result<usize> {
        Ok(self.state()?.friend(friend)?.name().len())
    }

    pub fn friend_status_message(&self, friend: FriendId) -> Result<Vec<u8>> {
        Ok(self.state()?.friend(friend)?.status_message().to_vec())
    }

    pub fn friend_status_message_size(&self, friend: FriendId) -> Result<usize> {
        Ok(self.state()?.friend(friend)?.status_message().len())
    }

    pub fn friend_user_status(&self, friend: FriendId) -> Result<UserStatus> {
        Ok(self.state()?.friend(friend)?.user_status())
    }

    pub fn friend_is_typing(&self, friend: FriendId) -> Result<bool> {
        Ok(self.state()?.friend(friend)?.is_typing())
    }

    /// When the friend was last online, if ever.
    pub fn friend_last_seen(&self, friend: FriendId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state()?.friend(friend)?.last_seen())
    }

    pub fn friend_connection_state(&self, friend: FriendId) -> Result<ConnectionState> {
        Ok(self.state()?.friend(friend)?.connection_state())
    }

    /// Whether inbound messages from this friend are acknowledged with read receipts.
    pub fn set_sends_receipts(&mut self, friend: FriendId, enabled: bool) -> Result<()> {
        self.state_mut()?.friend_mut(friend)?.sends_receipts = enabled;
        Ok(())
    }

    // --- own profile ---

    /// Set our name (truncated to 128 bytes) and push it to online friends. Returns the stored length.
    pub fn set_name(&mut self, name: &[u8]) -> Result<usize> {
        let (state, router) = self.parts()?;
        state.profile.name = truncate(name, MAX_NAME_LENGTH).to_vec();
        let packet = Packet::Name {
            name: state.profile.name.clone(),
        };
        state.broadcast(router, &packet);
        Ok(state.profile.name.len())
    }

    pub fn self_name(&self) -> Result<Vec<u8>> {
        Ok(self.state()?.profile.name.clone())
    }

    pub fn self_name_size(&self) -> Result<usize> {
        Ok(self.state()?.profile.name.len())
    }

    /// Set our status message (truncated to 1007 bytes). Returns the stored length.
    pub fn set_status_message(&mut self, status: &[u8]) -> Result<usize> {
        let (state, router) = self.parts()?;
        state.profile.status_message = truncate(status, MAX_STATUS_MESSAGE_LENGTH).to_vec();
        let packet = Packet::StatusMessage {
            status: state.profile.status_message.clone(),
        };
        state.broadcast(router, &packet);
        Ok(state.profile.status_message.len())
    }

    pub fn self_status_message(&self) -> Result<Vec<u8>> {
        Ok(self.state()?.profile.status_message.clone())
    }

    pub fn self_status_message_size(&self) -> Result<usize> {
        Ok(self.state()?.profile.status_message.len())
    }

    pub fn set_user_status(&mut self, status: UserStatus) -> Result<()> {
        let (state, router) = self.parts()?;
        state.profile.user_status = status;
        state.broadcast(router, &Packet::UserStatus { status });
        Ok(())
    }

    pub fn self_user_status(&self) -> Result<UserStatus> {
        Ok(self.state()?.profile.user_status)
    }

    // --- messaging ---

    /// Send a chat message. Returns its id; the peer's read receipt carries the same id.
    pub fn send_message(&mut self, friend: FriendId, message: &[u8]) -> Result<u32> {
        self.send_chat(friend, 0, message, ChatKind::Message)
    }

    /// Send a chat message with a caller-chosen id (0 picks the next automatic id).
    pub fn send_message_with_id(
        &mut self,
        friend: FriendId,
        message_id: u32,
        message: &[u8],
    ) -> Result<u32> {
        self.send_chat(friend, message_id, message, ChatKind::Message)
    }

    pub fn send_action(&mut self, friend: FriendId, action: &[u8]) -> Result<u32> {
        self.send_chat(friend, 0, action, ChatKind::Action)
    }

    pub fn send_action_with_id(
        &mut self,
        friend: FriendId,
        message_id: u32,
        action: &[u8],
    ) -> Result<u32> {
        self.send_chat(friend, message_id, action, ChatKind::Action)
    }

    fn send_chat(
        &mut self,
        friend: FriendId,
        message_id: u32,
        body: &[u8],
        kind: ChatKind,
    ) -> Result<u32> {
        let (state, router) = self.parts()?;
        let tick = state.tick_count;
        let our_key = *state.identity.public_key();
        let record = state.friend_mut(friend)?;
        if body.is_empty() {
            return Err(EngineError::NoMessage);
        }
        if body.len() > MAX_MESSAGE_LENGTH {
            return Err(EngineError::TooLong {
                max: MAX_MESSAGE_LENGTH,
            });
        }
        if !record.is_online() {
            return Err(EngineError::FriendOffline);
        }
        let id = if message_id == 0 {
            record.next_message_id()
        } else {
            record.observe_message_id(message_id);
            message_id
        };
        let body = body.to_vec();
        let packet = match kind {
            ChatKind::Message => Packet::Message { id, body },
            ChatKind::Action => Packet::Action { id, body },
        };
        send_session(router, &our_key, record, &packet, tick)?;
        Ok(id)
    }

    pub fn set_user_is_typing(&mut self, friend: FriendId, is_typing: bool) -> Result<()> {
        let (state, router) = self.parts()?;
        let tick = state.tick_count;
        let our_key = *state.identity.public_key();
        let record = state.friend_mut(friend)?;
        send_session(router, &our_key, record, &Packet::Typing { is_typing }, tick)
    }

    // --- file transfer ---

    /// Offer a file. Returns the sending slot; the peer sees a FileSendRequest.
    pub fn new_file_sender(&mut self, friend: FriendId, size: u64, file_name: &[u8]) -> Result<u8> {
        let (state, router) = self.parts()?;
        let tick = state.tick_count;
        let our_key = *state.identity.public_key();
        let record = state.friends.get_mut(friend).ok_or(EngineError::UnknownFriend)?;
        if !record.is_online() {
            return Err(EngineError::FriendOffline);
        }
        if file_name.len() > MAX_FILENAME_LENGTH {
            return Err(EngineError::TooLong {
                max: MAX_FILENAME_LENGTH,
            });
        }
        let slot = state
            .transfers
            .open_outbound(friend, size, file_name.to_vec())?;
        let packet = Packet::FileSendRequest {
            slot,
            size,
            file_name: file_name.to_vec(),
        };
        send_session(router, &our_key, record, &packet, tick)?;
        debug!(friend = %friend, slot, size, "file offered");
        Ok(slot)
    }

    /// Apply a control to one of our slots and tell the peer.
    pub fn file_control(
        &mut self,
        friend: FriendId,
        direction: Direction,
        slot: u8,
        control: FileControl,
        data: &[u8],
    ) -> Result<()> {
        let (state, router) = self.parts()?;
        let tick = state.tick_count;
        let our_key = *state.identity.public_key();
        let record = state.friends.get_mut(friend).ok_or(EngineError::UnknownFriend)?;
        if !record.is_online() {
            return Err(EngineError::FriendOffline);
        }
        let status = state
            .transfers
            .local_control(friend, direction, slot, control)?;
        debug!(friend = %friend, slot, ?direction, ?control, ?status, "file control");
        let packet = Packet::FileControl {
            direction,
            slot,
            control,
            data: data.to_vec(),
        };
        send_session(router, &our_key, record, &packet, tick)
    }

    /// Send one chunk on an active sending slot. An empty chunk finishes the transfer.
    /// Returns `WouldBlock` while too many chunks are unacknowledged.
    pub fn send_file_data(&mut self, friend: FriendId, slot: u8, data: &[u8]) -> Result<()> {
        let max_outstanding = self.config.max_outstanding_chunks;
        let (state, router) = self.parts()?;
        let tick = state.tick_count;
        let our_key = *state.identity.public_key();
        let record = state.friends.get_mut(friend).ok_or(EngineError::UnknownFriend)?;
        if !record.is_online() {
            return Err(EngineError::FriendOffline);
        }
        let packet = match state
            .transfers
            .prepare_data(friend, slot, data.len(), max_outstanding)?
        {
            DataOutcome::Send => Packet::FileData {
                slot,
                data: data.to_vec(),
            },
            DataOutcome::Finished => {
                debug!(friend = %friend, slot, "file sent");
                Packet::FileControl {
                    direction: Direction::Sending,
                    slot,
                    control: FileControl::Finished,
                    data: Vec::new(),
                }
            }
        };
        send_session(router, &our_key, record, &packet, tick)
    }

    /// Largest chunk `send_file_data` accepts.
    pub fn file_data_size(&self) -> Result<usize> {
        self.state()?;
        Ok(MAX_FILE_DATA_SIZE)
    }

    /// Bytes not yet sent or received on a slot.
    pub fn file_data_remaining(
        &self,
        friend: FriendId,
        slot: u8,
        direction: Direction,
    ) -> Result<u64> {
        let state = self.state()?;
        state.friend(friend)?;
        state.transfers.remaining(friend, direction, slot)
    }

    pub fn file_status(
        &self,
        friend: FriendId,
        slot: u8,
        direction: Direction,
    ) -> Result<TransferStatus> {
        let state = self.state()?;
        state.friend(friend)?;
        state
            .transfers
            .get(friend, direction, slot)
            .map(|t| t.status)
            .ok_or(EngineError::UnknownTransfer)
    }

    // --- events ---

    /// Register the handler for one event kind, replacing any previous one.
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> Result<()>
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.state()?;
        self.dispatcher.set(kind, Box::new(handler));
        Ok(())
    }

    pub fn clear_handler(&mut self, kind: EventKind) -> Result<()> {
        self.state()?;
        self.dispatcher.clear(kind);
        Ok(())
    }

    // --- lifecycle ---

    /// One iteration: drain the router, run timers, flush acks, dispatch events.
    /// A failing handler aborts the tick with `HandlerFault`.
    pub fn tick(&mut self) -> Result<()> {
        let Self {
            router,
            config,
            dispatcher,
            state,
        } = self;
        let state = state.as_mut().ok_or(EngineError::EngineNotInitialized)?;
        state.tick_count += 1;

        for (from, bytes) in router.poll_inbound() {
            let mut events = Vec::new();
            state.handle_datagram(router, from, &bytes, &mut events);
            dispatch(dispatcher, &events)?;
        }

        let mut events = Vec::new();
        state.maintain(router, config, &mut events);
        state.flush_acks(router);
        dispatch(dispatcher, &events)
    }

    /// Seed the router with a known node; the hint is persisted.
    pub fn bootstrap(&mut self, location: NetworkLocation, public_key: PublicKey) -> Result<()> {
        let (state, router) = self.parts()?;
        router.add_node(public_key, location);
        state.routing_hints.insert(public_key, location);
        info!(%location, peer = %public_key, "bootstrap node added");
        Ok(())
    }

    pub fn is_connected(&self) -> Result<bool> {
        self.state()?;
        Ok(self.router.is_connected())
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        persistence::encode(&self.state()?.snapshot())
            .map_err(|e| EngineError::CorruptState(e.to_string()))
    }

    pub fn save_size(&self) -> Result<usize> {
        persistence::encoded_size(&self.state()?.snapshot())
            .map_err(|e| EngineError::CorruptState(e.to_string()))
    }

    /// Replace identity, profile and friends with a saved state. Nothing changes unless the
    /// whole blob decodes and validates. Sessions and transfers start over.
    pub fn restore(&mut self, blob: &[u8]) -> Result<()> {
        let (_, router) = self.parts()?;
        let restored = load_state(router, blob)?;
        self.state = Some(restored);
        Ok(())
    }

    /// Tear the engine down. Every later call fails with `EngineNotInitialized`.
    pub fn kill(&mut self) {
        if self.state.take().is_some() {
            info!("engine killed");
        }
    }
}

/// Decode and validate a save blob, then register its routing hints.
fn load_state<R: Router>(router: &mut R, blob: &[u8]) -> Result<EngineState> {
    let saved = persistence::decode(blob).map_err(|e| {
        warn!(error = %e, "rejecting save blob");
        EngineError::CorruptState(e.to_string())
    })?;
    let restored = EngineState::from_saved(saved)?;
    for (public_key, location) in &restored.routing_hints {
        router.add_node(*public_key, *location);
    }
    info!(
        public_key = %restored.identity.public_key(),
        friends = restored.friends.len(),
        "state restored"
    );
    Ok(restored)
}

/// Drop every transfer with `id` and report each slot as killed.
fn kill_transfers(transfers: &mut TransferManager, id: FriendId, events: &mut Vec<Event>) {
    for (direction, slot) in transfers.cancel_friend(id) {
        events.push(Event::FileControl {
            friend: id,
            direction,
            slot,
            control: FileControl::Kill,
            data: Vec::new(),
        });
    }
}

/// Typing state does not outlive a session.
fn clear_typing(friend: &mut Friend, id: FriendId, events: &mut Vec<Event>) {
    if friend.is_typing() {
        friend.set_typing(false);
        events.push(Event::TypingChange {
            friend: id,
            is_typing: false,
        });
    }
}

fn dispatch(dispatcher: &mut Dispatcher, events: &[Event]) -> Result<()> {
    for event in events {
        dispatcher.dispatch(event).map_err(|e| {
            warn!(kind = ?event.kind(), error = %e, "event handler failed");
            EngineError::HandlerFault(e)
        })?;
    }
    Ok(())
}

/// Seal under the static key and hand to the router. Delivery is best effort.
fn send_static<R: Router>(
    router: &mut R,
    keypair: &Keypair,
    to: NetworkLocation,
    peer: &PublicKey,
    class: EnvelopeClass,
    packet: &Packet,
) {
    let bytes = match session::seal_static(keypair, peer, class, packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(peer = %peer, kind = packet.kind_name(), error = %e, "seal failed");
            return;
        }
    };
    if let Err(e) = router.send_packet(to, &bytes) {
        warn!(peer = %peer, kind = packet.kind_name(), error = %e, "send failed");
    }
}

/// Seal under the friend's session key and send. `FriendOffline` without a session.
fn send_session<R: Router>(
    router: &mut R,
    our_key: &PublicKey,
    friend: &mut Friend,
    packet: &Packet,
    tick: u64,
) -> Result<()> {
    let bytes = friend.connection.seal(our_key, packet, tick)?;
    let location = friend.location().ok_or(EngineError::FriendOffline)?;
    if let Err(e) = router.send_packet(location, &bytes) {
        warn!(peer = %friend.public_key(), kind = packet.kind_name(), error = %e, "send failed");
    }
    Ok(())
}

fn send_handshake<R: Router>(router: &mut R, keypair: &Keypair, friend: &mut Friend, tick: u64) {
    if let (Some(packet), Some(location)) = (friend.connection.handshake_packet(), friend.location())
    {
        send_static(
            router,
            keypair,
            location,
            friend.public_key(),
            EnvelopeClass::Handshake,
            &packet,
        );
    }
    friend.connection.mark_handshake_attempt(tick);
}

/// Send the pending friend request if one is due.
fn send_request<R: Router>(
    router: &mut R,
    keypair: &Keypair,
    friend: &mut Friend,
    tick: u64,
    retry_ticks: u64,
) {
    let packet = match &friend.pending_request {
        Some(r) if r.last_sent_tick.map_or(true, |t| tick.saturating_sub(t) >= retry_ticks) => {
            Packet::FriendRequest {
                nospam: r.nospam,
                message: r.message.clone(),
            }
        }
        _ => return,
    };
    if let Ok(location) = router.resolve(friend.public_key()) {
        friend.connection.set_location(location);
    }
    match friend.location() {
        Some(location) => {
            send_static(
                router,
                keypair,
                location,
                friend.public_key(),
                EnvelopeClass::Request,
                &packet,
            );
            debug!(peer = %friend.public_key(), "friend request sent");
        }
        None => debug!(peer = %friend.public_key(), "friend request pending, peer not found"),
    }
    if let Some(request) = friend.pending_request.as_mut() {
        request.last_sent_tick = Some(tick);
    }
}

fn send_profile<R: Router>(
    router: &mut R,
    our_key: &PublicKey,
    profile: &Profile,
    friend: &mut Friend,
    tick: u64,
) {
    let packets = [
        Packet::Name {
            name: profile.name.clone(),
        },
        Packet::StatusMessage {
            status: profile.status_message.clone(),
        },
        Packet::UserStatus {
            status: profile.user_status,
        },
    ];
    for packet in &packets {
        if let Err(e) = send_session(router, our_key, friend, packet, tick) {
            debug!(peer = %friend.public_key(), error = %e, "profile not sent");
        }
    }
}

impl EngineState {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            profile: Profile::default(),
            friends: FriendTable::new(),
            transfers: TransferManager::new(),
            routing_hints: BTreeMap::new(),
            tick_count: 0,
        }
    }

    fn friend(&self, id: FriendId) -> Result<&Friend> {
        self.friends.get(id).ok_or(EngineError::UnknownFriend)
    }

    fn friend_mut(&mut self, id: FriendId) -> Result<&mut Friend> {
        self.friends.get_mut(id).ok_or(EngineError::UnknownFriend)
    }

    fn broadcast<R: Router>(&mut self, router: &mut R, packet: &Packet) {
        let tick = self.tick_count;
        let our_key = *self.identity.public_key();
        for (id, friend) in self.friends.iter_mut().filter(|(_, f)| f.is_online()) {
            if let Err(e) = send_session(router, &our_key, friend, packet, tick) {
                debug!(friend = %id, error = %e, "broadcast skipped");
            }
        }
    }

    fn handle_datagram<R: Router>(
        &mut self,
        router: &mut R,
        from: NetworkLocation,
        bytes: &[u8],
        events: &mut Vec<Event>,
    ) {
        let envelope = match wire::decode_envelope(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        if envelope.sender == *self.identity.public_key() {
            debug!(%from, "dropping datagram claiming our own key");
            return;
        }
        match envelope.class {
            EnvelopeClass::Request => self.handle_request(router, from, &envelope, events),
            EnvelopeClass::Handshake => self.handle_handshake(router, from, &envelope, events),
            EnvelopeClass::Data => self.handle_data(router, &envelope, events),
        }
    }

    fn handle_request<R: Router>(
        &mut self,
        router: &mut R,
        from: NetworkLocation,
        envelope: &Envelope,
        events: &mut Vec<Event>,
    ) {
        let peer = envelope.sender;
        let packet = match session::open_static(self.identity.keypair(), envelope) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%peer, error = %e, "dropping friend request");
                return;
            }
        };
        let (nospam, message) = match packet {
            Packet::FriendRequest { nospam, message } => (nospam, message),
            other => {
                debug!(%peer, kind = other.kind_name(), "request envelope without a request");
                return;
            }
        };
        if nospam != self.identity.nospam() {
            debug!(%peer, "friend request for a stale nospam");
            return;
        }
        if self.friends.id_for_key(&peer).is_some() {
            debug!(%peer, "friend request from existing friend ignored");
            return;
        }
        router.add_node(peer, from);
        info!(%peer, "friend request received");
        events.push(Event::FriendRequest {
            public_key: peer,
            message,
        });
    }

    fn handle_handshake<R: Router>(
        &mut self,
        router: &mut R,
        from: NetworkLocation,
        envelope: &Envelope,
        events: &mut Vec<Event>,
    ) {
        let peer = envelope.sender;
        let Some(id) = self.friends.id_for_key(&peer) else {
            debug!(%peer, "handshake from non-friend");
            return;
        };
        let packet = match session::open_static(self.identity.keypair(), envelope) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(friend = %id, error = %e, "dropping handshake");
                return;
            }
        };
        let (protocol_version, ephemeral, echo) = match packet {
            Packet::Handshake {
                protocol_version,
                ephemeral,
                echo,
            } => (protocol_version, ephemeral, echo),
            other => {
                debug!(friend = %id, kind = other.kind_name(), "handshake envelope without a handshake");
                return;
            }
        };
        if protocol_version != PROTOCOL_VERSION {
            debug!(friend = %id, protocol_version, "unsupported protocol version");
            return;
        }

        let tick = self.tick_count;
        let our_key = *self.identity.public_key();
        let Some(friend) = self.friends.get_mut(id) else {
            return;
        };
        let previous = friend.connection.location();
        friend.connection.set_location(from);
        let outcome = friend
            .connection
            .on_handshake(&our_key, &peer, ephemeral, echo, tick);
        if outcome.reply {
            send_handshake(router, self.identity.keypair(), friend, tick);
        }
        if outcome.unconfirmed {
            // Answer at the new address but keep routing the live session where it was.
            if let Some(location) = previous {
                friend.connection.set_location(location);
            }
            debug!(friend = %id, %from, "unconfirmed handshake answered, session kept");
        }
        if outcome.became_online {
            info!(friend = %id, %from, "friend online");
            friend.pending_request = None;
            friend.touch_last_seen();
            events.push(Event::ConnectionStatus {
                friend: id,
                online: true,
            });
        }
        if outcome.rekeyed {
            info!(friend = %id, %from, "friend restarted its session");
            friend.touch_last_seen();
            clear_typing(friend, id, events);
        }
        // The peer may have missed our earlier profile along with our handshake.
        if (outcome.reply && !outcome.unconfirmed) || outcome.became_online || outcome.rekeyed {
            send_profile(router, &our_key, &self.profile, friend, tick);
        }
        if outcome.rekeyed {
            kill_transfers(&mut self.transfers, id, events);
        }
    }

    fn handle_data<R: Router>(&mut self, router: &mut R, envelope: &Envelope, events: &mut Vec<Event>) {
        let Some(id) = self.friends.id_for_key(&envelope.sender) else {
            debug!(peer = %envelope.sender, "data from non-friend");
            return;
        };
        let tick = self.tick_count;
        let Some(friend) = self.friends.get_mut(id) else {
            return;
        };
        let packet = match friend.connection.open(envelope, tick) {
            Ok(packet) => packet,
            Err(SessionError::Decode(e)) => {
                warn!(friend = %id, error = %e, "malformed packet dropped");
                return;
            }
            Err(SessionError::Replayed) => {
                debug!(friend = %id, nonce = envelope.nonce, "replayed data packet dropped");
                return;
            }
            Err(e) => {
                debug!(friend = %id, error = %e, "dropping data packet");
                return;
            }
        };
        self.handle_packet(router, id, packet, events);
    }

    fn handle_packet<R: Router>(
        &mut self,
        router: &mut R,
        id: FriendId,
        packet: Packet,
        events: &mut Vec<Event>,
    ) {
        let tick = self.tick_count;
        let our_key = *self.identity.public_key();
        let Some(friend) = self.friends.get_mut(id) else {
            return;
        };
        match packet {
            Packet::Ping => {}
            Packet::Message { id: message_id, body } => {
                if friend.sends_receipts {
                    let receipt = Packet::Receipt { id: message_id };
                    if let Err(e) = send_session(router, &our_key, friend, &receipt, tick) {
                        debug!(friend = %id, error = %e, "receipt not sent");
                    }
                }
                events.push(Event::FriendMessage {
                    friend: id,
                    message_id,
                    message: body,
                });
            }
            Packet::Action { id: message_id, body } => {
                if friend.sends_receipts {
                    let receipt = Packet::Receipt { id: message_id };
                    if let Err(e) = send_session(router, &our_key, friend, &receipt, tick) {
                        debug!(friend = %id, error = %e, "receipt not sent");
                    }
                }
                events.push(Event::FriendAction {
                    friend: id,
                    message_id,
                    action: body,
                });
            }
            Packet::Receipt { id: message_id } => events.push(Event::ReadReceipt {
                friend: id,
                message_id,
            }),
            Packet::Name { name } => {
                if friend.name() != name.as_slice() {
                    friend.set_name(&name);
                    events.push(Event::NameChange {
                        friend: id,
                        name: friend.name().to_vec(),
                    });
                }
            }
            Packet::StatusMessage { status } => {
                if friend.status_message() != status.as_slice() {
                    friend.set_status_message(&status);
                    events.push(Event::StatusMessage {
                        friend: id,
                        status: friend.status_message().to_vec(),
                    });
                }
            }
            Packet::UserStatus { status } => {
                if friend.user_status() != status {
                    friend.set_user_status(status);
                    events.push(Event::UserStatus { friend: id, status });
                }
            }
            Packet::Typing { is_typing } => {
                if friend.is_typing() != is_typing {
                    friend.set_typing(is_typing);
                    events.push(Event::TypingChange {
                        friend: id,
                        is_typing,
                    });
                }
            }
            Packet::FileSendRequest {
                slot,
                size,
                file_name,
            } => {
                if self
                    .transfers
                    .on_send_request(id, slot, size, file_name.clone())
                {
                    events.push(Event::FileSendRequest {
                        friend: id,
                        slot,
                        size,
                        file_name,
                    });
                } else {
                    debug!(friend = %id, slot, "duplicate file offer dropped");
                }
            }
            Packet::FileControl {
                direction,
                slot,
                control,
                data,
            } => match self.transfers.remote_control(id, direction, slot, control) {
                Ok((local, status)) => {
                    debug!(friend = %id, slot, ?control, ?status, "peer file control");
                    events.push(Event::FileControl {
                        friend: id,
                        direction: local,
                        slot,
                        control,
                        data,
                    });
                }
                Err(e) => debug!(friend = %id, slot, ?control, error = %e, "file control dropped"),
            },
            Packet::FileData { slot, data } => match self.transfers.on_data(id, slot, data.len()) {
                Ok(()) => events.push(Event::FileData {
                    friend: id,
                    slot,
                    data,
                }),
                Err(e) => debug!(friend = %id, slot, error = %e, "file data dropped"),
            },
            Packet::FileAck { slot, count } => {
                if let Err(e) = self.transfers.on_ack(id, slot, count) {
                    debug!(friend = %id, slot, error = %e, "file ack dropped");
                }
            }
            other @ (Packet::FriendRequest { .. } | Packet::Handshake { .. }) => {
                debug!(friend = %id, kind = other.kind_name(), "unexpected packet in session");
            }
        }
    }

    /// Per-friend timers: request resends, handshake cadence and timeouts, keepalives, liveness.
    fn maintain<R: Router>(&mut self, router: &mut R, config: &EngineConfig, events: &mut Vec<Event>) {
        let tick = self.tick_count;
        let our_key = *self.identity.public_key();
        let keypair = self.identity.keypair();
        for (id, friend) in self.friends.iter_mut() {
            let state = friend.connection_state();
            if state != ConnectionState::Online {
                send_request(router, keypair, friend, tick, config.request_retry_ticks);
            }
            match state {
                ConnectionState::Offline => {
                    if !friend
                        .connection
                        .handshake_due(tick, config.handshake_retry_ticks)
                    {
                        continue;
                    }
                    match router.resolve(friend.public_key()) {
                        Ok(location) => friend.connection.set_location(location),
                        Err(e) => debug!(friend = %id, error = %e, "resolve failed, trying last location"),
                    }
                    if friend.location().is_some() {
                        friend.connection.begin_handshake(tick);
                        debug!(friend = %id, "handshake started");
                        send_handshake(router, keypair, friend, tick);
                    } else {
                        friend.connection.mark_handshake_attempt(tick);
                    }
                }
                ConnectionState::Handshaking => {
                    if friend
                        .connection
                        .handshake_expired(tick, config.handshake_timeout_ticks)
                    {
                        debug!(friend = %id, "handshake timed out");
                        friend.connection.go_offline();
                    } else if friend
                        .connection
                        .handshake_due(tick, config.handshake_retry_ticks)
                    {
                        send_handshake(router, keypair, friend, tick);
                    }
                }
                ConnectionState::Online => {
                    if friend
                        .connection
                        .liveness_expired(tick, config.connection_timeout_ticks)
                    {
                        info!(friend = %id, "friend timed out");
                        friend.connection.go_offline();
                        friend.touch_last_seen();
                        events.push(Event::ConnectionStatus {
                            friend: id,
                            online: false,
                        });
                        clear_typing(friend, id, events);
                        kill_transfers(&mut self.transfers, id, events);
                    } else if friend.connection.ping_due(tick, config.ping_interval_ticks) {
                        if let Err(e) = send_session(router, &our_key, friend, &Packet::Ping, tick) {
                            debug!(friend = %id, error = %e, "ping not sent");
                        }
                    }
                }
            }
        }
    }

    /// One aggregated FileAck per receiving slot that saw data this tick.
    fn flush_acks<R: Router>(&mut self, router: &mut R) {
        let tick = self.tick_count;
        let our_key = *self.identity.public_key();
        for (id, slot, count) in self.transfers.take_acks() {
            let Some(friend) = self.friends.get_mut(id) else {
                continue;
            };
            if let Err(e) = send_session(router, &our_key, friend, &Packet::FileAck { slot, count }, tick) {
                debug!(friend = %id, slot, error = %e, "ack not sent");
            }
        }
    }

    fn snapshot(&self) -> SaveState {
        let keypair = self.identity.keypair();
        SaveState {
            secret_key: keypair.secret_bytes(),
            public_key: *keypair.public_key(),
            nospam: self.identity.nospam().0,
            name: self.profile.name.clone(),
            status_message: self.profile.status_message.clone(),
            user_status: self.profile.user_status,
            friends: self
                .friends
                .iter()
                .map(|(id, f)| SavedFriend {
                    id: id.0,
                    public_key: *f.public_key(),
                    name: f.name().to_vec(),
                    status_message: f.status_message().to_vec(),
                    user_status: f.user_status(),
                    last_seen: f.last_seen(),
                    sends_receipts: f.sends_receipts(),
                    pending_request: f.pending_request().map(|r| SavedRequest {
                        nospam: r.nospam.0,
                        message: r.message.clone(),
                    }),
                    location: f.location(),
                })
                .collect(),
            routing_hints: self
                .routing_hints
                .iter()
                .map(|(public_key, location)| RoutingHint {
                    public_key: *public_key,
                    location: *location,
                })
                .collect(),
        }
    }

    fn from_saved(saved: SaveState) -> Result<Self> {
        let keypair = Keypair::from_secret_bytes(saved.secret_key);
        let mut state = Self::new(Identity::from_parts(keypair, Nospam(saved.nospam)));
        state.profile = Profile {
            name: truncate(&saved.name, MAX_NAME_LENGTH).to_vec(),
            status_message: truncate(&saved.status_message, MAX_STATUS_MESSAGE_LENGTH).to_vec(),
            user_status: saved.user_status,
        };
        for saved_friend in saved.friends {
            let mut friend = Friend::new(saved_friend.public_key);
            friend.set_name(&saved_friend.name);
            friend.set_status_message(&saved_friend.status_message);
            friend.set_user_status(saved_friend.user_status);
            friend.set_last_seen(saved_friend.last_seen);
            friend.sends_receipts = saved_friend.sends_receipts;
            friend.pending_request = saved_friend
                .pending_request
                .map(|r| PendingRequest::new(Nospam(r.nospam), r.message));
            if let Some(location) = saved_friend.location {
                friend.connection.set_location(location);
            }
            state
                .friends
                .insert_at(FriendId(saved_friend.id), friend)
                .map_err(|e| EngineError::CorruptState(e.to_string()))?;
        }
        state.routing_hints = saved
            .routing_hints
            .into_iter()
            .map(|h| (h.public_key, h.location))
            .collect();
        Ok(state)
    }
}
