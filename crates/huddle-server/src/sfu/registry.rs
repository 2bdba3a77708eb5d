//! Room Membership Registry
//!
//! Authoritative record of who is in which room and which relay objects each
//! peer owns. The registry is plain data: the coordinator wraps it in a
//! mutex and never holds that lock across a relay call.
//!
//! Relay objects are created in two steps. A slot is reserved under the lock
//! (so concurrent duplicates are refused), the relay call runs unlocked, and
//! the result is committed only if the reservation is still in place.
//! Reservations carry a token that is unique for the registry's lifetime, so
//! a result can never land in a session other than the one that asked for it.

use super::browser::{self, BrowserError, SharedBrowserSession};
use huddle_protocol::{
    MediaKind, MemberInfo, ProducerInfo, ProducerSource, SharedBrowserInfo, TransportDirection,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("not a member of this room")]
    NotInRoom,

    #[error("no active voice session")]
    NoSession,

    #[error("already in this room")]
    AlreadyInRoom,

    #[error("{0} transport already exists")]
    TransportExists(TransportDirection),

    #[error("{0} transport was closed; rejoin the room to renegotiate")]
    TransportClosed(TransportDirection),

    #[error("unknown transport")]
    UnknownTransport,

    #[error("transport has the wrong direction for this request")]
    WrongDirection,

    #[error("source {0} is already being produced")]
    SourceActive(ProducerSource),

    #[error("source {tag} must carry {expected}")]
    KindMismatch {
        tag: ProducerSource,
        expected: MediaKind,
    },

    #[error("unknown producer")]
    UnknownProducer,

    #[error("cannot consume your own producer")]
    OwnProducer,

    #[error("already consuming this producer")]
    AlreadyConsuming,

    #[error("producer belongs to another room")]
    ForeignProducer,

    #[error("only the shared browser owner may produce browser media")]
    BrowserNotOwner,

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub id: Uuid,
    pub owner: Uuid,
    pub room_id: Uuid,
    pub source: ProducerSource,
    pub kind: MediaKind,
    pub transport_id: Uuid,
    pub mime_type: String,
    seq: u64,
}

impl ProducerRecord {
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.id,
            user_id: self.owner,
            source: self.source,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub id: Uuid,
    pub owner: Uuid,
    pub producer_id: Uuid,
    pub transport_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportSlot {
    Empty,
    Pending(u64),
    Ready(Uuid),
    /// Closed by the relay; a session never gets a replacement
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending(u64),
    Active(Uuid),
}

impl Slot {
    fn active(self) -> Option<Uuid> {
        match self {
            Slot::Active(id) => Some(id),
            Slot::Pending(_) => None,
        }
    }
}

/// A peer's membership in a room and the relay objects it owns
#[derive(Debug)]
pub struct PeerSession {
    member: MemberInfo,
    connection_id: Uuid,
    room_id: Uuid,
    send: TransportSlot,
    recv: TransportSlot,
    producers: HashMap<ProducerSource, Slot>,
    /// Keyed by the consumed producer's id
    consumers: HashMap<Uuid, Slot>,
}

impl PeerSession {
    fn new(member: MemberInfo, connection_id: Uuid, room_id: Uuid) -> Self {
        Self {
            member,
            connection_id,
            room_id,
            send: TransportSlot::Empty,
            recv: TransportSlot::Empty,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn member(&self) -> &MemberInfo {
        &self.member
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Id of the producer currently active for `source`
    pub fn producer(&self, source: ProducerSource) -> Option<Uuid> {
        self.producers.get(&source).and_then(|slot| slot.active())
    }

    fn transport(&self, direction: TransportDirection) -> TransportSlot {
        match direction {
            TransportDirection::Send => self.send,
            TransportDirection::Recv => self.recv,
        }
    }

    fn transport_mut(&mut self, direction: TransportDirection) -> &mut TransportSlot {
        match direction {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        }
    }

    /// Direction of a ready transport owned by this session
    fn direction_of(&self, transport_id: Uuid) -> Option<TransportDirection> {
        if self.send == TransportSlot::Ready(transport_id) {
            Some(TransportDirection::Send)
        } else if self.recv == TransportSlot::Ready(transport_id) {
            Some(TransportDirection::Recv)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    /// Join order
    members: Vec<Uuid>,
    browser: Option<SharedBrowserSession>,
}

/// What a new member needs to know, and who must hear about it
#[derive(Debug)]
pub struct JoinSnapshot {
    pub existing: Vec<MemberInfo>,
    /// Connections of the members that were already present
    pub recipients: Vec<Uuid>,
    pub shared_browser: Option<SharedBrowserInfo>,
}

/// Relay objects to close for a departed peer, consumers first
#[derive(Debug, Default)]
pub struct Teardown {
    pub consumers: Vec<Uuid>,
    pub producers: Vec<ProducerRecord>,
    pub transports: Vec<Uuid>,
}

#[derive(Debug)]
pub struct Departure {
    pub room_id: Uuid,
    pub member: MemberInfo,
    pub connection_id: Uuid,
    /// Connections of the members still in the room
    pub remaining: Vec<Uuid>,
    pub teardown: Teardown,
    /// The shared browser this peer owned, now ended
    pub browser: Option<SharedBrowserSession>,
    pub room_empty: bool,
}

/// A producer removed from the registry
#[derive(Debug)]
pub struct ProducerClosure {
    pub record: ProducerRecord,
    /// Consumers of the producer, removed with it
    pub consumers: Vec<Uuid>,
    /// Connections of the other members of the producer's room
    pub recipients: Vec<Uuid>,
}

/// A transport closed by the relay and everything it took with it
#[derive(Debug)]
pub struct TransportClosure {
    pub owner: Uuid,
    pub room_id: Uuid,
    pub direction: TransportDirection,
    pub producers: Vec<ProducerClosure>,
    pub consumers: Vec<Uuid>,
}

#[derive(Debug)]
pub struct BrowserStop {
    pub info: SharedBrowserInfo,
    /// Every member of the room, owner included
    pub recipients: Vec<Uuid>,
    /// The owner's browser producers
    pub producers: Vec<ProducerClosure>,
}

#[derive(Debug, Clone)]
pub struct ProducerReservation {
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub transport_id: Uuid,
    pub source: ProducerSource,
    pub kind: MediaKind,
    token: u64,
}

#[derive(Debug, Clone)]
pub struct ConsumerReservation {
    pub user_id: Uuid,
    pub transport_id: Uuid,
    pub producer: ProducerRecord,
    token: u64,
}

/// Per-room figures for operational visibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: Uuid,
    pub members: usize,
    pub producers: usize,
    pub shared_browser: Option<SharedBrowserInfo>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<Uuid, Room>,
    /// User id -> session; a user is in at most one room
    sessions: HashMap<Uuid, PeerSession>,
    producers: HashMap<Uuid, ProducerRecord>,
    consumers: HashMap<Uuid, ConsumerRecord>,
    /// Ready transport id -> owning user
    transports: HashMap<Uuid, Uuid>,
    /// Empty rooms awaiting router teardown
    vacancies: HashMap<Uuid, u64>,
    next_token: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn connections(&self, room_id: Uuid, except: Option<Uuid>) -> Vec<Uuid> {
        let Some(room) = self.rooms.get(&room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.sessions.get(id))
            .map(|session| session.connection_id)
            .collect()
    }

    fn session_in_room(&self, user_id: Uuid, room_id: Uuid) -> Result<&PeerSession, RegistryError> {
        match self.sessions.get(&user_id) {
            Some(session) if session.room_id == room_id => Ok(session),
            _ => Err(RegistryError::NotInRoom),
        }
    }

    pub fn session(&self, user_id: Uuid) -> Option<&PeerSession> {
        self.sessions.get(&user_id)
    }

    pub fn producer(&self, producer_id: Uuid) -> Option<&ProducerRecord> {
        self.producers.get(&producer_id)
    }

    pub fn members(&self, room_id: Uuid) -> Vec<Uuid> {
        self.rooms
            .get(&room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    pub fn join(
        &mut self,
        room_id: Uuid,
        member: MemberInfo,
        connection_id: Uuid,
    ) -> Result<JoinSnapshot, RegistryError> {
        if self.sessions.contains_key(&member.user_id) {
            return Err(RegistryError::AlreadyInRoom);
        }

        self.vacancies.remove(&room_id);
        let room = self.rooms.entry(room_id).or_default();

        let existing: Vec<&PeerSession> = room
            .members
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .collect();
        let snapshot = JoinSnapshot {
            existing: existing.iter().map(|s| s.member.clone()).collect(),
            recipients: existing.iter().map(|s| s.connection_id).collect(),
            shared_browser: room.browser.as_ref().map(|b| b.info(room_id)),
        };

        room.members.push(member.user_id);
        self.sessions.insert(
            member.user_id,
            PeerSession::new(member, connection_id, room_id),
        );

        Ok(snapshot)
    }

    /// Remove the peer and everything it owns. `None` if it had no session.
    pub fn leave(&mut self, user_id: Uuid) -> Option<Departure> {
        let session = self.sessions.remove(&user_id)?;
        let room_id = session.room_id;
        let mut teardown = Teardown::default();

        for slot in session.consumers.values() {
            if let Some(consumer_id) = slot.active() {
                self.consumers.remove(&consumer_id);
                teardown.consumers.push(consumer_id);
            }
        }

        let mut own: Vec<(Uuid, u64)> = session
            .producers
            .values()
            .filter_map(|slot| slot.active())
            .filter_map(|id| self.producers.get(&id).map(|r| (id, r.seq)))
            .collect();
        own.sort_by_key(|(_, seq)| *seq);
        for (producer_id, _) in own {
            if let Some((record, consumers)) = self.detach_producer(producer_id) {
                teardown.consumers.extend(consumers);
                teardown.producers.push(record);
            }
        }

        for slot in [session.send, session.recv] {
            if let TransportSlot::Ready(transport_id) = slot {
                self.transports.remove(&transport_id);
                teardown.transports.push(transport_id);
            }
        }

        let mut browser = None;
        let mut room_empty = true;
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.members.retain(|id| *id != user_id);
            if room.browser.as_ref().is_some_and(|b| b.owner_id == user_id) {
                browser = room.browser.take();
            }
            room_empty = room.members.is_empty();
        }
        let remaining = self.connections(room_id, None);
        if room_empty {
            self.rooms.remove(&room_id);
        }

        Some(Departure {
            room_id,
            member: session.member,
            connection_id: session.connection_id,
            remaining,
            teardown,
            browser,
            room_empty,
        })
    }

    /// Drop a producer from the index and from every consumer's bookkeeping
    fn detach_producer(&mut self, producer_id: Uuid) -> Option<(ProducerRecord, Vec<Uuid>)> {
        let record = self.producers.remove(&producer_id)?;
        let mut consumers = Vec::new();

        let members = self.members(record.room_id);
        for member in members {
            let Some(session) = self.sessions.get_mut(&member) else {
                continue;
            };
            if let Some(slot) = session.consumers.remove(&producer_id) {
                if let Some(consumer_id) = slot.active() {
                    self.consumers.remove(&consumer_id);
                    consumers.push(consumer_id);
                }
            }
        }

        Some((record, consumers))
    }

    pub fn remove_producer(&mut self, producer_id: Uuid) -> Option<ProducerClosure> {
        let (record, consumers) = self.detach_producer(producer_id)?;

        if let Some(session) = self.sessions.get_mut(&record.owner) {
            if session.producers.get(&record.source) == Some(&Slot::Active(producer_id)) {
                session.producers.remove(&record.source);
            }
        }

        let recipients = self.connections(record.room_id, Some(record.owner));
        Some(ProducerClosure {
            record,
            consumers,
            recipients,
        })
    }

    /// Reconcile a transport the relay closed on its own
    pub fn remove_transport(&mut self, transport_id: Uuid) -> Option<TransportClosure> {
        let owner = self.transports.remove(&transport_id)?;
        let session = self.sessions.get_mut(&owner)?;
        let direction = session.direction_of(transport_id)?;
        *session.transport_mut(direction) = TransportSlot::Closed;

        let room_id = session.room_id;
        let mut closure = TransportClosure {
            owner,
            room_id,
            direction,
            producers: Vec::new(),
            consumers: Vec::new(),
        };

        match direction {
            TransportDirection::Send => {
                let producer_ids: Vec<Uuid> = session
                    .producers
                    .values()
                    .filter_map(|slot| slot.active())
                    .collect();
                for producer_id in producer_ids {
                    if let Some(producer) = self.remove_producer(producer_id) {
                        closure.producers.push(producer);
                    }
                }
            }
            TransportDirection::Recv => {
                let consumer_ids: Vec<Uuid> = session
                    .consumers
                    .drain()
                    .filter_map(|(_, slot)| slot.active())
                    .collect();
                for consumer_id in consumer_ids {
                    self.consumers.remove(&consumer_id);
                    closure.consumers.push(consumer_id);
                }
            }
        }

        Some(closure)
    }

    pub fn remove_consumer(&mut self, consumer_id: Uuid) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(&consumer_id)?;
        if let Some(session) = self.sessions.get_mut(&record.owner) {
            if session.consumers.get(&record.producer_id) == Some(&Slot::Active(consumer_id)) {
                session.consumers.remove(&record.producer_id);
            }
        }
        Some(record)
    }

    /// Direction of a ready transport, if `user_id` owns it
    pub fn transport_direction(
        &self,
        user_id: Uuid,
        transport_id: Uuid,
    ) -> Result<TransportDirection, RegistryError> {
        if self.transports.get(&transport_id) != Some(&user_id) {
            return Err(RegistryError::UnknownTransport);
        }
        self.sessions
            .get(&user_id)
            .and_then(|session| session.direction_of(transport_id))
            .ok_or(RegistryError::UnknownTransport)
    }

    pub fn reserve_transport(
        &mut self,
        user_id: Uuid,
        room_id: Uuid,
        direction: TransportDirection,
    ) -> Result<u64, RegistryError> {
        let token = self.token();
        self.session_in_room(user_id, room_id)?;
        let Some(session) = self.sessions.get_mut(&user_id) else {
            return Err(RegistryError::NotInRoom);
        };

        match session.transport(direction) {
            TransportSlot::Empty => {
                *session.transport_mut(direction) = TransportSlot::Pending(token);
                Ok(token)
            }
            TransportSlot::Closed => Err(RegistryError::TransportClosed(direction)),
            TransportSlot::Pending(_) | TransportSlot::Ready(_) => {
                Err(RegistryError::TransportExists(direction))
            }
        }
    }

    /// Fill a reserved transport slot. `false` if the reservation is gone.
    pub fn commit_transport(
        &mut self,
        user_id: Uuid,
        direction: TransportDirection,
        token: u64,
        transport_id: Uuid,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(&user_id) else {
            return false;
        };
        let slot = session.transport_mut(direction);
        if *slot != TransportSlot::Pending(token) {
            return false;
        }
        *slot = TransportSlot::Ready(transport_id);
        self.transports.insert(transport_id, user_id);
        true
    }

    pub fn abort_transport(&mut self, user_id: Uuid, direction: TransportDirection, token: u64) {
        if let Some(session) = self.sessions.get_mut(&user_id) {
            let slot = session.transport_mut(direction);
            if *slot == TransportSlot::Pending(token) {
                *slot = TransportSlot::Empty;
            }
        }
    }

    pub fn reserve_producer(
        &mut self,
        user_id: Uuid,
        transport_id: Uuid,
        source: ProducerSource,
        kind: MediaKind,
    ) -> Result<ProducerReservation, RegistryError> {
        let token = self.token();
        let session = self.sessions.get(&user_id).ok_or(RegistryError::NoSession)?;
        let room_id = session.room_id;

        match session.direction_of(transport_id) {
            Some(TransportDirection::Send) => {}
            Some(TransportDirection::Recv) => return Err(RegistryError::WrongDirection),
            None => return Err(RegistryError::UnknownTransport),
        }
        if kind != source.kind() {
            return Err(RegistryError::KindMismatch {
                tag: source,
                expected: source.kind(),
            });
        }
        if source.is_browser() && self.browser_owner(room_id) != Some(user_id) {
            return Err(RegistryError::BrowserNotOwner);
        }
        if session.producers.contains_key(&source) {
            return Err(RegistryError::SourceActive(source));
        }

        if let Some(session) = self.sessions.get_mut(&user_id) {
            session.producers.insert(source, Slot::Pending(token));
        }

        Ok(ProducerReservation {
            user_id,
            room_id,
            transport_id,
            source,
            kind,
            token,
        })
    }

    /// Record a produced track. Returns the record and the connections to
    /// announce it to, or `None` if the reservation no longer holds.
    pub fn commit_producer(
        &mut self,
        reservation: &ProducerReservation,
        producer_id: Uuid,
        mime_type: String,
    ) -> Option<(ProducerRecord, Vec<Uuid>)> {
        let browser_owner = self.browser_owner(reservation.room_id);
        let seq = self.token();
        let session = self.sessions.get_mut(&reservation.user_id)?;

        if session.room_id != reservation.room_id
            || session.producers.get(&reservation.source) != Some(&Slot::Pending(reservation.token))
            || session.direction_of(reservation.transport_id) != Some(TransportDirection::Send)
        {
            return None;
        }
        if reservation.source.is_browser() && browser_owner != Some(reservation.user_id) {
            session.producers.remove(&reservation.source);
            return None;
        }

        session
            .producers
            .insert(reservation.source, Slot::Active(producer_id));
        let record = ProducerRecord {
            id: producer_id,
            owner: reservation.user_id,
            room_id: reservation.room_id,
            source: reservation.source,
            kind: reservation.kind,
            transport_id: reservation.transport_id,
            mime_type,
            seq,
        };
        self.producers.insert(producer_id, record.clone());

        let recipients = self.connections(reservation.room_id, Some(reservation.user_id));
        Some((record, recipients))
    }

    pub fn abort_producer(&mut self, reservation: &ProducerReservation) {
        if let Some(session) = self.sessions.get_mut(&reservation.user_id) {
            if session.producers.get(&reservation.source) == Some(&Slot::Pending(reservation.token))
            {
                session.producers.remove(&reservation.source);
            }
        }
    }

    /// Producers of the other members of `room_id`, in creation order
    pub fn producers_in_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
    ) -> Result<Vec<ProducerInfo>, RegistryError> {
        self.session_in_room(user_id, room_id)?;

        let mut records: Vec<&ProducerRecord> = self
            .producers
            .values()
            .filter(|r| r.room_id == room_id && r.owner != user_id)
            .collect();
        records.sort_by_key(|r| r.seq);

        Ok(records.into_iter().map(ProducerRecord::info).collect())
    }

    pub fn reserve_consumer(
        &mut self,
        user_id: Uuid,
        transport_id: Uuid,
        producer_id: Uuid,
    ) -> Result<ConsumerReservation, RegistryError> {
        let token = self.token();
        let session = self.sessions.get(&user_id).ok_or(RegistryError::NoSession)?;

        match session.direction_of(transport_id) {
            Some(TransportDirection::Recv) => {}
            Some(TransportDirection::Send) => return Err(RegistryError::WrongDirection),
            None => return Err(RegistryError::UnknownTransport),
        }

        let producer = self
            .producers
            .get(&producer_id)
            .ok_or(RegistryError::UnknownProducer)?;
        if producer.owner == user_id {
            return Err(RegistryError::OwnProducer);
        }
        if producer.room_id != session.room_id {
            return Err(RegistryError::ForeignProducer);
        }
        if session.consumers.contains_key(&producer_id) {
            return Err(RegistryError::AlreadyConsuming);
        }
        let producer = producer.clone();

        if let Some(session) = self.sessions.get_mut(&user_id) {
            session.consumers.insert(producer_id, Slot::Pending(token));
        }

        Ok(ConsumerReservation {
            user_id,
            transport_id,
            producer,
            token,
        })
    }

    /// Record a consumer. `false` if the reservation or the producer is gone.
    pub fn commit_consumer(&mut self, reservation: &ConsumerReservation, consumer_id: Uuid) -> bool {
        let producer_id = reservation.producer.id;
        if !self.producers.contains_key(&producer_id) {
            return false;
        }
        let Some(session) = self.sessions.get_mut(&reservation.user_id) else {
            return false;
        };
        if session.consumers.get(&producer_id) != Some(&Slot::Pending(reservation.token))
            || session.direction_of(reservation.transport_id) != Some(TransportDirection::Recv)
        {
            return false;
        }

        session.consumers.insert(producer_id, Slot::Active(consumer_id));
        self.consumers.insert(
            consumer_id,
            ConsumerRecord {
                id: consumer_id,
                owner: reservation.user_id,
                producer_id,
                transport_id: reservation.transport_id,
            },
        );
        true
    }

    pub fn abort_consumer(&mut self, reservation: &ConsumerReservation) {
        if let Some(session) = self.sessions.get_mut(&reservation.user_id) {
            let producer_id = reservation.producer.id;
            if session.consumers.get(&producer_id) == Some(&Slot::Pending(reservation.token)) {
                session.consumers.remove(&producer_id);
            }
        }
    }

    /// Start a shared browser; returns it and every member's connection
    pub fn start_browser(
        &mut self,
        user_id: Uuid,
        room_id: Uuid,
        url: String,
    ) -> Result<(SharedBrowserInfo, Vec<Uuid>), RegistryError> {
        self.session_in_room(user_id, room_id)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(RegistryError::NotInRoom)?;

        let info = browser::start(&mut room.browser, user_id, url)?.info(room_id);
        Ok((info, self.connections(room_id, None)))
    }

    /// Stop the room's shared browser on behalf of its owner, closing the
    /// owner's browser producers with it
    pub fn stop_browser(&mut self, user_id: Uuid, room_id: Uuid) -> Result<BrowserStop, RegistryError> {
        let session = self.session_in_room(user_id, room_id)?;
        let browser_producers: Vec<Uuid> = session
            .producers
            .iter()
            .filter(|(source, _)| source.is_browser())
            .filter_map(|(_, slot)| slot.active())
            .collect();

        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(RegistryError::NotInRoom)?;
        let stopped = browser::stop(&mut room.browser, user_id)?;

        let producers = browser_producers
            .into_iter()
            .filter_map(|id| self.remove_producer(id))
            .collect();

        Ok(BrowserStop {
            info: stopped.info(room_id),
            recipients: self.connections(room_id, None),
            producers,
        })
    }

    pub fn browser_owner(&self, room_id: Uuid) -> Option<Uuid> {
        self.rooms
            .get(&room_id)
            .and_then(|room| room.browser.as_ref())
            .map(|b| b.owner_id)
    }

    /// Connection of the shared browser's owner, if a session is active
    pub fn browser_owner_connection(&self, room_id: Uuid) -> Option<Uuid> {
        let owner = self.browser_owner(room_id)?;
        self.sessions.get(&owner).map(|s| s.connection_id)
    }

    /// Note that a room became empty; the token identifies this vacancy
    pub fn mark_vacant(&mut self, room_id: Uuid) -> u64 {
        let token = self.token();
        self.vacancies.insert(room_id, token);
        token
    }

    /// Consume the vacancy if the room has stayed empty since `token`
    pub fn claim_vacancy(&mut self, room_id: Uuid, token: u64) -> bool {
        if self.vacancies.get(&room_id) != Some(&token) || self.rooms.contains_key(&room_id) {
            return false;
        }
        self.vacancies.remove(&room_id);
        true
    }

    pub fn stats(&self) -> Vec<RoomStats> {
        let mut stats: Vec<RoomStats> = self
            .rooms
            .iter()
            .map(|(room_id, room)| RoomStats {
                room_id: *room_id,
                members: room.members.len(),
                producers: self
                    .producers
                    .values()
                    .filter(|r| r.room_id == *room_id)
                    .count(),
                shared_browser: room.browser.as_ref().map(|b| b.info(*room_id)),
            })
            .collect();
        stats.sort_by_key(|s| s.room_id);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberInfo {
        MemberInfo {
            user_id: Uuid::new_v4(),
            display_name: name.to_string(),
            avatar_url: None,
        }
    }

    /// Join and give the peer ready send and recv transports
    fn seat(registry: &mut RoomRegistry, room_id: Uuid, name: &str) -> (Uuid, Uuid, Uuid) {
        let member = member(name);
        let user_id = member.user_id;
        registry.join(room_id, member, Uuid::new_v4()).unwrap();

        let send = Uuid::new_v4();
        let token = registry
            .reserve_transport(user_id, room_id, TransportDirection::Send)
            .unwrap();
        assert!(registry.commit_transport(user_id, TransportDirection::Send, token, send));

        let recv = Uuid::new_v4();
        let token = registry
            .reserve_transport(user_id, room_id, TransportDirection::Recv)
            .unwrap();
        assert!(registry.commit_transport(user_id, TransportDirection::Recv, token, recv));

        (user_id, send, recv)
    }

    fn produce(
        registry: &mut RoomRegistry,
        user_id: Uuid,
        transport_id: Uuid,
        source: ProducerSource,
    ) -> Uuid {
        let reservation = registry
            .reserve_producer(user_id, transport_id, source, source.kind())
            .unwrap();
        let producer_id = Uuid::new_v4();
        registry
            .commit_producer(&reservation, producer_id, "audio/opus".to_string())
            .unwrap();
        producer_id
    }

    #[test]
    fn test_join_returns_existing_members_in_join_order() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();

        let a = member("alice");
        let a_conn = Uuid::new_v4();
        let snapshot = registry.join(room_id, a.clone(), a_conn).unwrap();
        assert!(snapshot.existing.is_empty());
        assert!(snapshot.recipients.is_empty());

        let b = member("bob");
        let snapshot = registry.join(room_id, b.clone(), Uuid::new_v4()).unwrap();
        assert_eq!(snapshot.existing, vec![a.clone()]);
        assert_eq!(snapshot.recipients, vec![a_conn]);

        assert_eq!(
            registry.join(Uuid::new_v4(), a, Uuid::new_v4()).unwrap_err(),
            RegistryError::AlreadyInRoom
        );
    }

    #[test]
    fn test_duplicate_source_is_refused_while_pending() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (user_id, send, _) = seat(&mut registry, room_id, "alice");

        let first = registry
            .reserve_producer(user_id, send, ProducerSource::Mic, MediaKind::Audio)
            .unwrap();
        assert_eq!(
            registry
                .reserve_producer(user_id, send, ProducerSource::Mic, MediaKind::Audio)
                .unwrap_err(),
            RegistryError::SourceActive(ProducerSource::Mic)
        );

        registry.abort_producer(&first);
        assert!(registry
            .reserve_producer(user_id, send, ProducerSource::Mic, MediaKind::Audio)
            .is_ok());
    }

    #[test]
    fn test_produce_checks_kind_direction_and_browser_ownership() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (user_id, send, recv) = seat(&mut registry, room_id, "alice");

        assert_eq!(
            registry
                .reserve_producer(user_id, recv, ProducerSource::Mic, MediaKind::Audio)
                .unwrap_err(),
            RegistryError::WrongDirection
        );
        assert!(matches!(
            registry.reserve_producer(user_id, send, ProducerSource::Webcam, MediaKind::Audio),
            Err(RegistryError::KindMismatch { .. })
        ));
        assert_eq!(
            registry
                .reserve_producer(user_id, send, ProducerSource::Browser, MediaKind::Video)
                .unwrap_err(),
            RegistryError::BrowserNotOwner
        );

        registry
            .start_browser(user_id, room_id, "https://example.com".to_string())
            .unwrap();
        assert!(registry
            .reserve_producer(user_id, send, ProducerSource::Browser, MediaKind::Video)
            .is_ok());
    }

    #[test]
    fn test_transport_is_created_once_per_direction() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let member = member("alice");
        let user_id = member.user_id;
        registry.join(room_id, member, Uuid::new_v4()).unwrap();

        let token = registry
            .reserve_transport(user_id, room_id, TransportDirection::Send)
            .unwrap();
        assert_eq!(
            registry
                .reserve_transport(user_id, room_id, TransportDirection::Send)
                .unwrap_err(),
            RegistryError::TransportExists(TransportDirection::Send)
        );
        assert_eq!(
            registry
                .reserve_transport(user_id, Uuid::new_v4(), TransportDirection::Recv)
                .unwrap_err(),
            RegistryError::NotInRoom
        );

        let transport_id = Uuid::new_v4();
        assert!(registry.commit_transport(user_id, TransportDirection::Send, token, transport_id));
        assert_eq!(
            registry.transport_direction(user_id, transport_id).unwrap(),
            TransportDirection::Send
        );
    }

    #[test]
    fn test_commit_after_rejoin_is_refused() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let member = member("alice");
        let user_id = member.user_id;
        registry.join(room_id, member.clone(), Uuid::new_v4()).unwrap();

        let stale = registry
            .reserve_transport(user_id, room_id, TransportDirection::Send)
            .unwrap();
        registry.leave(user_id).unwrap();
        registry.join(room_id, member, Uuid::new_v4()).unwrap();
        let fresh = registry
            .reserve_transport(user_id, room_id, TransportDirection::Send)
            .unwrap();

        assert!(!registry.commit_transport(user_id, TransportDirection::Send, stale, Uuid::new_v4()));
        assert!(registry.commit_transport(user_id, TransportDirection::Send, fresh, Uuid::new_v4()));
    }

    #[test]
    fn test_leave_tears_down_producers_and_remote_consumers() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (a, a_send, _) = seat(&mut registry, room_id, "alice");
        let (b, _, b_recv) = seat(&mut registry, room_id, "bob");
        let b_conn = registry.session(b).unwrap().connection_id();

        let mic = produce(&mut registry, a, a_send, ProducerSource::Mic);
        let reservation = registry.reserve_consumer(b, b_recv, mic).unwrap();
        let consumer_id = Uuid::new_v4();
        assert!(registry.commit_consumer(&reservation, consumer_id));

        let departure = registry.leave(a).unwrap();
        assert_eq!(departure.remaining, vec![b_conn]);
        assert_eq!(departure.teardown.consumers, vec![consumer_id]);
        assert_eq!(departure.teardown.producers.len(), 1);
        assert_eq!(departure.teardown.producers[0].id, mic);
        assert_eq!(departure.teardown.transports.len(), 2);
        assert!(!departure.room_empty);

        assert!(registry.producer(mic).is_none());
        assert!(registry.remove_consumer(consumer_id).is_none());
        assert!(registry.leave(a).is_none());
    }

    #[test]
    fn test_consume_rules() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (a, a_send, a_recv) = seat(&mut registry, room_id, "alice");
        let (b, _, b_recv) = seat(&mut registry, room_id, "bob");
        let (c, c_send, _) = seat(&mut registry, Uuid::new_v4(), "carol");

        let mic = produce(&mut registry, a, a_send, ProducerSource::Mic);
        let elsewhere = produce(&mut registry, c, c_send, ProducerSource::Mic);

        assert_eq!(
            registry.reserve_consumer(a, a_recv, mic).unwrap_err(),
            RegistryError::OwnProducer
        );
        assert_eq!(
            registry.reserve_consumer(b, b_recv, elsewhere).unwrap_err(),
            RegistryError::ForeignProducer
        );
        assert_eq!(
            registry.reserve_consumer(b, b_recv, Uuid::new_v4()).unwrap_err(),
            RegistryError::UnknownProducer
        );

        let reservation = registry.reserve_consumer(b, b_recv, mic).unwrap();
        assert_eq!(
            registry.reserve_consumer(b, b_recv, mic).unwrap_err(),
            RegistryError::AlreadyConsuming
        );

        // Producer closes while the consume is in flight
        registry.remove_producer(mic).unwrap();
        assert!(!registry.commit_consumer(&reservation, Uuid::new_v4()));
    }

    #[test]
    fn test_send_transport_loss_closes_each_producer_once() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (a, a_send, _) = seat(&mut registry, room_id, "alice");
        let (b, _, _) = seat(&mut registry, room_id, "bob");
        let b_conn = registry.session(b).unwrap().connection_id();

        let mic = produce(&mut registry, a, a_send, ProducerSource::Mic);
        let screen = produce(&mut registry, a, a_send, ProducerSource::Screen);

        let closure = registry.remove_transport(a_send).unwrap();
        assert_eq!(closure.direction, TransportDirection::Send);
        let mut closed: Vec<Uuid> = closure.producers.iter().map(|p| p.record.id).collect();
        closed.sort();
        let mut expected = vec![mic, screen];
        expected.sort();
        assert_eq!(closed, expected);
        assert!(closure.producers.iter().all(|p| p.recipients == vec![b_conn]));

        assert!(registry.remove_transport(a_send).is_none());
        assert!(registry.remove_producer(mic).is_none());
        assert_eq!(
            registry
                .reserve_transport(a, room_id, TransportDirection::Send)
                .unwrap_err(),
            RegistryError::TransportClosed(TransportDirection::Send)
        );
    }

    #[test]
    fn test_browser_owner_leaving_ends_session() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let (a, _, _) = seat(&mut registry, room_id, "alice");
        let (b, _, _) = seat(&mut registry, room_id, "bob");

        registry
            .start_browser(a, room_id, "https://example.com".to_string())
            .unwrap();
        assert_eq!(
            registry
                .start_browser(b, room_id, "https://example.org".to_string())
                .unwrap_err(),
            RegistryError::Browser(BrowserError::AlreadyActive)
        );

        let departure = registry.leave(a).unwrap();
        assert_eq!(departure.browser.unwrap().url, "https://example.com");
        assert_eq!(registry.browser_owner(room_id), None);
    }

    #[test]
    fn test_vacancy_is_cancelled_by_rejoin() {
        let mut registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let member = member("alice");
        let user_id = member.user_id;

        registry.join(room_id, member.clone(), Uuid::new_v4()).unwrap();
        assert!(registry.leave(user_id).unwrap().room_empty);
        let token = registry.mark_vacant(room_id);

        registry.join(room_id, member, Uuid::new_v4()).unwrap();
        assert!(!registry.claim_vacancy(room_id, token));

        registry.leave(user_id).unwrap();
        let token = registry.mark_vacant(room_id);
        assert!(registry.claim_vacancy(room_id, token));
        assert!(!registry.claim_vacancy(room_id, token));
    }
}
