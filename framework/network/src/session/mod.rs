/*! netBiDiB sessions: pairing, logon arbitration and the writer queue.

The embedding owns the sockets; this layer owns everything between the
bytes and the router. Received chunks go through [`SessionSet::ingest`],
replies and announcements come out of the single-writer [`TxQueue`],
and state changes surface as [`SessionEvent`]s.
*/

use byteorder::{ByteOrder, LittleEndian};
use heapless::{Deque, String, Vec};

use bidib_core::addr::AddressStack;
use bidib_core::time::{Duration, Instant};
use bidib_core::uid::Uid;
use bidib_defs::{LinkData, MsgType, BIDIB_VERSION, MAX_STRING_SIZE, PROTOCOL_SIGNATURE};
use managed::ManagedSlice;

use crate::config::{SESSION_EVENT_QUEUE, SESSION_RX_BUFFER, SESSION_TX_QUEUE};
use crate::wire::Message;

/// How this station introduces itself on link and announcement level.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: Uid,
    pub product: String<MAX_STRING_SIZE>,
    pub user: String<MAX_STRING_SIZE>,
}

/// Persisted mutual approvals, keyed by unique id.
pub trait TrustStore {
    fn is_trusted(&self, uid: &Uid) -> bool;

    fn add(&mut self, uid: &Uid, product: &str, user: &str);

    fn remove(&mut self, uid: &Uid);
}

/// Pairing progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingState {
    /// No unique id seen yet.
    #[default]
    Null,
    Unpaired,
    /// We approved; the peer's confirmation is outstanding.
    MyRequest,
    Paired,
    /// Paired and holding exclusive control.
    Control,
}

/// A handle to a session in a [`SessionSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionHandle(usize);

impl core::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What the session layer reports to the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An unpaired peer asks for pairing; the operator decides via
    /// [`SessionSet::approve_pairing`].
    PairingPrompt { session: SessionHandle, uid: Uid },
    /// This session took exclusive control.
    ControlGained { session: SessionHandle },
    /// Nobody controls; the local controller resumes.
    ControlLost,
    /// A downstream message from the control session, for the router.
    Message { session: SessionHandle, msg: Message },
    /// The layer gave up on the session; the embedding must close the
    /// socket. The record is already gone.
    Closed { session: SessionHandle },
}

/// One TCP client.
#[derive(Debug)]
pub struct Session {
    pub uid: Option<Uid>,
    pub product: String<MAX_STRING_SIZE>,
    pub user: String<MAX_STRING_SIZE>,
    pub p_version: [u8; 2],
    pub trusted: bool,
    pub login_pending: bool,
    pub pairing: PairingState,
    got_signature: bool,
    rx: Vec<u8, SESSION_RX_BUFFER>,
}

impl Session {
    fn new() -> Session {
        Session {
            uid: None,
            product: String::new(),
            user: String::new(),
            p_version: BIDIB_VERSION,
            trusted: false,
            login_pending: false,
            pairing: PairingState::Null,
            got_signature: false,
            rx: Vec::new(),
        }
    }

    /// Octets waiting in the receive buffer.
    pub fn rx_fill(&self) -> usize {
        self.rx.len()
    }
}

/// An item of a [`SessionSet`].
#[derive(Default)]
pub struct SessionStorage {
    inner: Option<Session>,
}

impl SessionStorage {
    pub const EMPTY: SessionStorage = SessionStorage { inner: None };
}

/// All live sessions plus the control designation.
pub struct SessionSet<'a> {
    slots: ManagedSlice<'a, SessionStorage>,
    control: Option<SessionHandle>,
    events: Deque<SessionEvent, SESSION_EVENT_QUEUE>,
}

impl<'a> SessionSet<'a> {
    pub fn new<S>(slots: S) -> SessionSet<'a>
    where
        S: Into<ManagedSlice<'a, SessionStorage>>,
    {
        SessionSet {
            slots: slots.into(),
            control: None,
            events: Deque::new(),
        }
    }

    /// The session currently in control, if any.
    pub fn control(&self) -> Option<SessionHandle> {
        self.control
    }

    pub fn get(&self, h: SessionHandle) -> Option<&Session> {
        self.slots.get(h.0).and_then(|s| s.inner.as_ref())
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Register a fresh connection and greet it with the protocol
    /// signature. Fails when the session table is full.
    pub fn accept(&mut self, txq: &mut TxQueue) -> Option<SessionHandle> {
        let mut found = None;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.inner.is_none() {
                slot.inner = Some(Session::new());
                found = Some(SessionHandle(index));
                break;
            }
        }
        let h = match (found, &mut self.slots) {
            (Some(h), _) => h,
            #[cfg(feature = "alloc")]
            (None, ManagedSlice::Owned(slots)) => {
                slots.push(SessionStorage {
                    inner: Some(Session::new()),
                });
                SessionHandle(slots.len() - 1)
            }
            (None, _) => return None,
        };
        net_debug!("session {}: accepted", h);
        txq.push(h, &signature_msg());
        Some(h)
    }

    /// A chunk of stream data arrived for `h`.
    pub fn ingest(
        &mut self,
        h: SessionHandle,
        data: &[u8],
        txq: &mut TxQueue,
        trust: &mut dyn TrustStore,
        identity: &Identity,
    ) {
        {
            let session = match self.session_mut(h) {
                Some(s) => s,
                None => return,
            };
            if session.rx.extend_from_slice(data).is_err() {
                net_debug!("session {}: receive buffer overflow", h);
                self.drop_session(h);
                return;
            }
        }

        loop {
            let msg = {
                let session = match self.session_mut(h) {
                    Some(s) => s,
                    None => return,
                };
                let buf = &session.rx;
                let Some(&len) = buf.first() else { return };
                let total = len as usize + 1;
                if buf.len() < total {
                    return;
                }
                match Message::parse(&buf[..total]) {
                    Ok((msg, consumed)) => {
                        let rest: Vec<u8, SESSION_RX_BUFFER> =
                            Vec::from_slice(&buf[consumed..]).unwrap_or_default();
                        session.rx = rest;
                        msg
                    }
                    Err(_) => {
                        net_debug!("session {}: framing error", h);
                        self.drop_session(h);
                        return;
                    }
                }
            };
            self.process(h, &msg, txq, trust, identity);
        }
    }

    /// The operator answered a pairing prompt.
    pub fn approve_pairing(
        &mut self,
        h: SessionHandle,
        approved: bool,
        txq: &mut TxQueue,
        identity: &Identity,
    ) {
        let Some(session) = self.session_mut(h) else { return };
        if session.pairing != PairingState::Unpaired {
            return;
        }
        let peer = session.uid.unwrap_or_default();
        if approved {
            session.pairing = PairingState::MyRequest;
            txq.push(h, &link_status(LinkData::StatusPaired, identity.uid, peer));
        } else {
            txq.push(h, &link_status(LinkData::StatusUnpaired, identity.uid, peer));
        }
    }

    /// The embedding observed the socket closing. Idempotent.
    pub fn close(&mut self, h: SessionHandle) {
        if self.get(h).is_none() {
            return;
        }
        self.revoke_control(h);
        if let Some(slot) = self.slots.get_mut(h.0) {
            slot.inner = None;
        }
        net_debug!("session {}: closed", h);
    }

    /// Give up on a session from the inside; the embedding learns via
    /// [`SessionEvent::Closed`].
    fn drop_session(&mut self, h: SessionHandle) {
        self.close(h);
        self.push_event(SessionEvent::Closed { session: h });
    }

    fn revoke_control(&mut self, h: SessionHandle) {
        if self.control == Some(h) {
            self.control = None;
            if let Some(session) = self.session_mut(h) {
                session.pairing = PairingState::Paired;
            }
            self.push_event(SessionEvent::ControlLost);
        }
    }

    fn session_mut(&mut self, h: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(h.0).and_then(|s| s.inner.as_mut())
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.push_back(event).is_err() {
            net_debug!("session event queue full");
        }
    }

    fn process(
        &mut self,
        h: SessionHandle,
        msg: &Message,
        txq: &mut TxQueue,
        trust: &mut dyn TrustStore,
        identity: &Identity,
    ) {
        let Some(session) = self.session_mut(h) else { return };

        if !session.got_signature {
            if msg.msg_type() == Some(MsgType::LocalProtocolSignature)
                && msg.payload().starts_with(PROTOCOL_SIGNATURE)
            {
                session.got_signature = true;
                for m in descriptor_sequence(identity) {
                    txq.push(h, &m);
                }
            } else {
                net_debug!("session {}: no protocol signature", h);
                self.drop_session(h);
            }
            return;
        }

        match msg.msg_type() {
            Some(MsgType::LocalProtocolSignature) => {}
            Some(MsgType::LocalLink) => self.process_link(h, msg, txq, trust, identity),
            Some(MsgType::LocalLogon) => self.process_logon(h, msg, txq, identity),
            Some(MsgType::LocalLogoff) | Some(MsgType::LocalLogonRejected) => {
                // applying logoff to a non-control session changes nothing
                self.revoke_control(h);
            }
            Some(MsgType::LocalPing) => {
                txq.push(h, &Message::new(AddressStack::SELF, MsgType::LocalPong, &[]));
            }
            Some(MsgType::LocalPong) => {}
            _ => {
                if self.control == Some(h) {
                    self.push_event(SessionEvent::Message {
                        session: h,
                        msg: msg.clone(),
                    });
                } else {
                    net_trace!("session {}: message without control, dropped", h);
                }
            }
        }
    }

    fn process_link(
        &mut self,
        h: SessionHandle,
        msg: &Message,
        txq: &mut TxQueue,
        trust: &mut dyn TrustStore,
        identity: &Identity,
    ) {
        let payload = msg.payload();
        let Some(&sub) = payload.first() else { return };
        let Ok(sub) = LinkData::try_from(sub) else {
            net_trace!("session {}: unknown link data {:#04x}", h, sub);
            return;
        };

        match sub {
            LinkData::DescriptorUid if payload.len() >= 8 => {
                let uid = Uid::from_bytes(&payload[1..8]);
                self.merge_same_uid(h, uid);
                let Some(session) = self.session_mut(h) else { return };
                session.uid = Some(uid);
                if session.pairing == PairingState::Null {
                    if trust.is_trusted(&uid) {
                        session.trusted = true;
                        session.pairing = PairingState::MyRequest;
                        txq.push(h, &link_status(LinkData::StatusPaired, identity.uid, uid));
                    } else {
                        session.pairing = PairingState::Unpaired;
                        txq.push(h, &link_status(LinkData::StatusUnpaired, identity.uid, uid));
                    }
                }
            }
            LinkData::DescriptorProdString => {
                let Some(session) = self.session_mut(h) else { return };
                session.product = take_string(&payload[1..]);
            }
            LinkData::DescriptorUserString => {
                let Some(session) = self.session_mut(h) else { return };
                session.user = take_string(&payload[1..]);
            }
            LinkData::DescriptorPVersion if payload.len() >= 3 => {
                let Some(session) = self.session_mut(h) else { return };
                session.p_version = [payload[1], payload[2]];
            }
            LinkData::PairingRequest => {
                let Some(session) = self.session_mut(h) else { return };
                let peer = session.uid.unwrap_or_default();
                match session.pairing {
                    PairingState::Unpaired => {
                        txq.push(h, &link_status(LinkData::PairingRequest, identity.uid, peer));
                        self.push_event(SessionEvent::PairingPrompt { session: h, uid: peer });
                    }
                    PairingState::MyRequest | PairingState::Paired | PairingState::Control => {
                        txq.push(h, &link_status(LinkData::StatusPaired, identity.uid, peer));
                    }
                    PairingState::Null => {}
                }
            }
            LinkData::StatusPaired => {
                let control_free = self.control.is_none();
                let Some(session) = self.session_mut(h) else { return };
                if session.pairing == PairingState::MyRequest {
                    session.pairing = PairingState::Paired;
                    session.trusted = true;
                    let uid = session.uid.unwrap_or_default();
                    let product = session.product.clone();
                    let user = session.user.clone();
                    trust.add(&uid, &product, &user);
                    if control_free {
                        session.login_pending = true;
                    } else {
                        txq.push(h, &Message::new(AddressStack::SELF, MsgType::LocalLogoff, &[]));
                    }
                }
            }
            LinkData::StatusUnpaired => {
                self.revoke_control(h);
                let Some(session) = self.session_mut(h) else { return };
                session.pairing = PairingState::Unpaired;
                session.trusted = false;
                session.login_pending = false;
                if let Some(uid) = session.uid {
                    trust.remove(&uid);
                }
            }
            LinkData::NodeAvailable | LinkData::NodeUnavailable => {}
            _ => {}
        }
    }

    fn process_logon(
        &mut self,
        h: SessionHandle,
        _msg: &Message,
        txq: &mut TxQueue,
        identity: &Identity,
    ) {
        let control_free = self.control.is_none();
        let Some(session) = self.session_mut(h) else { return };
        if session.pairing == PairingState::Control {
            // the ack got lost; repeat it
            txq.push(h, &logon_ack(identity.uid));
            return;
        }
        if session.pairing == PairingState::Paired && control_free {
            session.pairing = PairingState::Control;
            session.login_pending = false;
            self.control = Some(h);
            txq.push(h, &logon_ack(identity.uid));
            self.push_event(SessionEvent::ControlGained { session: h });
            net_debug!("session {}: took control", h);
            return;
        }
        txq.push(
            h,
            &Message::new(
                AddressStack::SELF,
                MsgType::LocalLogonRejected,
                identity.uid.as_bytes(),
            ),
        );
    }

    /// A descriptor names a unique id some other record already holds:
    /// the new socket takes that session over.
    fn merge_same_uid(&mut self, h: SessionHandle, uid: Uid) {
        let other = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != h.0)
            .find(|(_, s)| s.inner.as_ref().is_some_and(|s| s.uid == Some(uid)))
            .map(|(i, _)| SessionHandle(i));
        let Some(old) = other else { return };

        let Some(old_s) = self.get(old) else { return };
        let (pairing, trusted, login_pending) = (old_s.pairing, old_s.trusted, old_s.login_pending);
        if let Some(session) = self.session_mut(h) {
            session.pairing = pairing;
            session.trusted = trusted;
            session.login_pending = login_pending;
        }
        if self.control == Some(old) {
            self.control = Some(h);
        }
        if let Some(slot) = self.slots.get_mut(old.0) {
            slot.inner = None;
        }
        net_debug!("session {}: takes over {}", h, old);
        self.push_event(SessionEvent::Closed { session: old });
    }
}

fn take_string(data: &[u8]) -> String<MAX_STRING_SIZE> {
    let mut s = String::new();
    for &b in data.iter().take(MAX_STRING_SIZE) {
        if !b.is_ascii() || b == 0 {
            break;
        }
        let _ = s.push(b as char);
    }
    s
}

fn signature_msg() -> Message {
    Message::new(
        AddressStack::SELF,
        MsgType::LocalProtocolSignature,
        PROTOCOL_SIGNATURE,
    )
}

fn logon_ack(own: Uid) -> Message {
    let mut payload = [0u8; 8];
    payload[1..].copy_from_slice(own.as_bytes());
    Message::new(AddressStack::SELF, MsgType::LocalLogonAck, &payload)
}

fn link_status(status: LinkData, own: Uid, peer: Uid) -> Message {
    let mut payload = [0u8; 15];
    payload[0] = status.into();
    payload[1..8].copy_from_slice(own.as_bytes());
    payload[8..15].copy_from_slice(peer.as_bytes());
    Message::new(AddressStack::SELF, MsgType::LocalLink, &payload)
}

fn descriptor_sequence(identity: &Identity) -> [Message; 4] {
    let mut uid = [0u8; 8];
    uid[0] = LinkData::DescriptorUid.into();
    uid[1..].copy_from_slice(identity.uid.as_bytes());

    let mut prod: Vec<u8, { MAX_STRING_SIZE + 1 }> = Vec::new();
    let _ = prod.push(LinkData::DescriptorProdString.into());
    let _ = prod.extend_from_slice(identity.product.as_bytes());

    let mut user: Vec<u8, { MAX_STRING_SIZE + 1 }> = Vec::new();
    let _ = user.push(LinkData::DescriptorUserString.into());
    let _ = user.extend_from_slice(identity.user.as_bytes());

    let version = [
        LinkData::DescriptorPVersion.into(),
        BIDIB_VERSION[0],
        BIDIB_VERSION[1],
    ];

    [
        Message::new(AddressStack::SELF, MsgType::LocalLink, &uid),
        Message::new(AddressStack::SELF, MsgType::LocalLink, &prod),
        Message::new(AddressStack::SELF, MsgType::LocalLink, &user),
        Message::new(AddressStack::SELF, MsgType::LocalLink, &version),
    ]
}

/// Largest single writer batch.
pub const TX_BATCH: usize = 1024;

#[derive(Debug)]
struct TxEntry {
    session: SessionHandle,
    bytes: Vec<u8, 256>,
}

/// The single-writer transmit queue.
///
/// Entries for the same destination coalesce into one batch at pop
/// time; a partial socket write aborts the batch, the messages are
/// gone.
#[derive(Debug, Default)]
pub struct TxQueue {
    entries: Deque<TxEntry, SESSION_TX_QUEUE>,
}

impl TxQueue {
    pub fn new() -> TxQueue {
        TxQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue one message for `session`.
    pub fn push(&mut self, session: SessionHandle, msg: &Message) -> bool {
        let mut bytes = Vec::new();
        bytes.resize_default(msg.wire_len()).ok();
        match msg.emit(&mut bytes) {
            Ok(n) => {
                bytes.truncate(n);
                if self.entries.push_back(TxEntry { session, bytes }).is_err() {
                    net_debug!("session {}: tx queue full", session);
                    return false;
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Queue a message list as one entry.
    pub fn push_list(&mut self, session: SessionHandle, msgs: &[Message]) -> bool {
        msgs.iter().all(|m| self.push(session, m))
    }

    /// Drop everything queued for a closed session.
    pub fn purge(&mut self, session: SessionHandle) {
        let mut keep: Deque<TxEntry, SESSION_TX_QUEUE> = Deque::new();
        while let Some(e) = self.entries.pop_front() {
            if e.session != session {
                let _ = keep.push_back(e);
            }
        }
        self.entries = keep;
    }

    /// Pop the next batch: the front entry plus every directly
    /// following entry for the same session that still fits `buf`.
    pub fn next_batch(&mut self, buf: &mut [u8]) -> Option<(SessionHandle, usize)> {
        let first = self.entries.pop_front()?;
        let session = first.session;
        let mut used = first.bytes.len().min(buf.len());
        buf[..used].copy_from_slice(&first.bytes[..used]);
        while let Some(next) = self.entries.front() {
            if next.session != session || used + next.bytes.len() > buf.len() {
                break;
            }
            let Some(next) = self.entries.pop_front() else { break };
            buf[used..used + next.bytes.len()].copy_from_slice(&next.bytes);
            used += next.bytes.len();
        }
        Some((session, used))
    }
}

const ANNOUNCE_PERIOD: Duration = Duration::from_secs(5);

/// Builds the periodic UDP announcement datagram.
pub struct Announcer {
    next: Instant,
    port: u16,
}

impl Announcer {
    pub fn new(port: u16) -> Announcer {
        Announcer {
            next: Instant::ZERO,
            port,
        }
    }

    /// Ask for an immediate announcement, e.g. after `LocalDiscover`.
    pub fn trigger(&mut self) {
        self.next = Instant::ZERO;
    }

    /// The next datagram once the period lapsed.
    pub fn poll(&mut self, now: Instant, identity: &Identity) -> Option<Vec<u8, 64>> {
        if now < self.next {
            return None;
        }
        self.next = now + ANNOUNCE_PERIOD;

        let mut uid = [0u8; 8];
        uid[0] = LinkData::DescriptorUid.into();
        uid[1..].copy_from_slice(identity.uid.as_bytes());
        let version = [
            LinkData::DescriptorPVersion.into(),
            BIDIB_VERSION[0],
            BIDIB_VERSION[1],
        ];
        let mut announce = [0u8; 2];
        LittleEndian::write_u16(&mut announce, self.port);

        let msgs = [
            signature_msg(),
            Message::new(AddressStack::SELF, MsgType::LocalLink, &uid),
            Message::new(AddressStack::SELF, MsgType::LocalLink, &version),
            Message::new(AddressStack::SELF, MsgType::LocalAnnounce, &announce),
        ];
        let mut out = Vec::new();
        out.resize_default(64).ok();
        let mut used = 0;
        for m in &msgs {
            used += m.emit(&mut out[used..]).ok()?;
        }
        out.truncate(used);
        Some(out)
    }

    pub fn poll_delay(&self, now: Instant) -> Duration {
        if self.next > now {
            self.next - now
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PEER: Uid = Uid::new(0x00, 0x00, 0x0D, 0xFB, [9, 9, 9]);
    const OWN: Uid = Uid::new(0x91, 0x00, 0x0D, 0xD0, [1, 2, 3]);

    struct MapTrust {
        trusted: std::collections::BTreeSet<[u8; 7]>,
    }

    impl MapTrust {
        fn new() -> MapTrust {
            MapTrust {
                trusted: std::collections::BTreeSet::new(),
            }
        }
    }

    impl TrustStore for MapTrust {
        fn is_trusted(&self, uid: &Uid) -> bool {
            let mut key = [0u8; 7];
            key.copy_from_slice(uid.as_bytes());
            self.trusted.contains(&key)
        }

        fn add(&mut self, uid: &Uid, _product: &str, _user: &str) {
            let mut key = [0u8; 7];
            key.copy_from_slice(uid.as_bytes());
            self.trusted.insert(key);
        }

        fn remove(&mut self, uid: &Uid) {
            let mut key = [0u8; 7];
            key.copy_from_slice(uid.as_bytes());
            self.trusted.remove(&key);
        }
    }

    fn identity() -> Identity {
        Identity {
            uid: OWN,
            product: String::try_from("mc2").unwrap(),
            user: String::try_from("layout").unwrap(),
        }
    }

    fn encode(msgs: &[Message]) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        for m in msgs {
            let mut buf = [0u8; 160];
            let n = m.emit(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn sent_to(txq: &mut TxQueue, h: SessionHandle) -> std::vec::Vec<Message> {
        let mut buf = [0u8; TX_BATCH];
        let mut out = std::vec::Vec::new();
        while let Some((dest, n)) = txq.next_batch(&mut buf) {
            assert_eq!(dest, h);
            let mut at = 0;
            while at < n {
                let (msg, used) = Message::parse(&buf[at..n]).unwrap();
                out.push(msg);
                at += used;
            }
        }
        out
    }

    fn signature() -> Message {
        Message::new(AddressStack::SELF, MsgType::LocalProtocolSignature, b"BiDiB")
    }

    fn descriptor_uid(uid: Uid) -> Message {
        let mut payload = [0u8; 8];
        payload[0] = LinkData::DescriptorUid.into();
        payload[1..].copy_from_slice(uid.as_bytes());
        Message::new(AddressStack::SELF, MsgType::LocalLink, &payload)
    }

    fn logon(uid: Uid) -> Message {
        Message::new(AddressStack::SELF, MsgType::LocalLogon, uid.as_bytes())
    }

    fn link_reply_kinds(msgs: &[Message]) -> std::vec::Vec<LinkData> {
        msgs.iter()
            .filter(|m| m.msg_type() == Some(MsgType::LocalLink))
            .filter_map(|m| LinkData::try_from(m.payload()[0]).ok())
            .collect()
    }

    #[test]
    fn pairing_flow_to_exclusive_control() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        // greeting goes out on accept
        let greeting = sent_to(&mut txq, h);
        assert_eq!(greeting[0].msg_type(), Some(MsgType::LocalProtocolSignature));

        // signature + unknown uid -> unpaired
        sessions.ingest(
            h,
            &encode(&[signature(), descriptor_uid(PEER)]),
            &mut txq,
            &mut trust,
            &identity,
        );
        let replies = sent_to(&mut txq, h);
        assert!(link_reply_kinds(&replies).contains(&LinkData::StatusUnpaired));
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::Unpaired);

        // peer requests pairing; the operator approves
        let req = link_status(LinkData::PairingRequest, PEER, OWN);
        sessions.ingest(h, &encode(&[req]), &mut txq, &mut trust, &identity);
        assert!(matches!(
            sessions.poll_event(),
            Some(SessionEvent::PairingPrompt { uid, .. }) if uid == PEER
        ));
        let replies = sent_to(&mut txq, h);
        assert!(link_reply_kinds(&replies).contains(&LinkData::PairingRequest));

        sessions.approve_pairing(h, true, &mut txq, &identity);
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::MyRequest);
        let replies = sent_to(&mut txq, h);
        assert!(link_reply_kinds(&replies).contains(&LinkData::StatusPaired));

        // peer confirms; trust persists, logon is pending
        let confirm = link_status(LinkData::StatusPaired, PEER, OWN);
        sessions.ingest(h, &encode(&[confirm]), &mut txq, &mut trust, &identity);
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::Paired);
        assert!(trust.is_trusted(&PEER));
        assert!(sessions.get(h).unwrap().login_pending);

        // logon takes control
        sessions.ingest(h, &encode(&[logon(PEER)]), &mut txq, &mut trust, &identity);
        assert_eq!(sessions.control(), Some(h));
        assert!(matches!(
            sessions.poll_event(),
            Some(SessionEvent::ControlGained { session }) if session == h
        ));
        let replies = sent_to(&mut txq, h);
        let ack = replies
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::LocalLogonAck))
            .unwrap();
        assert_eq!(ack.payload()[0], 0);
        assert_eq!(&ack.payload()[1..], OWN.as_bytes());
    }

    #[test]
    fn trusted_peer_skips_the_prompt() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        trust.add(&PEER, "", "");
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        sessions.ingest(
            h,
            &encode(&[signature(), descriptor_uid(PEER)]),
            &mut txq,
            &mut trust,
            &identity,
        );
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::MyRequest);
        let replies = sent_to(&mut txq, h);
        assert!(link_reply_kinds(&replies).contains(&LinkData::StatusPaired));
    }

    #[test]
    fn second_logon_is_rejected() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        trust.add(&PEER, "", "");
        let other_uid = Uid::new(0x00, 0x00, 0x0D, 0xFB, [7, 7, 7]);
        trust.add(&other_uid, "", "");
        let identity = identity();

        let a = sessions.accept(&mut txq).unwrap();
        let b = sessions.accept(&mut txq).unwrap();
        for (h, uid) in [(a, PEER), (b, other_uid)] {
            sessions.ingest(
                h,
                &encode(&[
                    signature(),
                    descriptor_uid(uid),
                    link_status(LinkData::StatusPaired, uid, OWN),
                ]),
                &mut txq,
                &mut trust,
                &identity,
            );
        }
        sessions.ingest(a, &encode(&[logon(PEER)]), &mut txq, &mut trust, &identity);
        assert_eq!(sessions.control(), Some(a));
        sent_to(&mut txq, a);

        sessions.ingest(b, &encode(&[logon(other_uid)]), &mut txq, &mut trust, &identity);
        // control is unchanged, the second logon bounced
        assert_eq!(sessions.control(), Some(a));
        let replies = sent_to(&mut txq, b);
        assert!(replies
            .iter()
            .any(|m| m.msg_type() == Some(MsgType::LocalLogonRejected)));
    }

    #[test]
    fn logoff_is_idempotent() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        trust.add(&PEER, "", "");
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        sessions.ingest(
            h,
            &encode(&[
                signature(),
                descriptor_uid(PEER),
                link_status(LinkData::StatusPaired, PEER, OWN),
                logon(PEER),
            ]),
            &mut txq,
            &mut trust,
            &identity,
        );
        assert_eq!(sessions.control(), Some(h));
        while sessions.poll_event().is_some() {}

        let logoff = Message::new(AddressStack::SELF, MsgType::LocalLogoff, &[]);
        sessions.ingest(h, &encode(&[logoff.clone()]), &mut txq, &mut trust, &identity);
        assert_eq!(sessions.control(), None);
        assert_eq!(sessions.poll_event(), Some(SessionEvent::ControlLost));

        // a second logoff has no further effect
        sessions.ingest(h, &encode(&[logoff]), &mut txq, &mut trust, &identity);
        assert_eq!(sessions.control(), None);
        assert_eq!(sessions.poll_event(), None);
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::Paired);
    }

    #[test]
    fn missing_signature_closes_the_session() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        sessions.ingest(h, &encode(&[descriptor_uid(PEER)]), &mut txq, &mut trust, &identity);
        assert_eq!(
            sessions.poll_event(),
            Some(SessionEvent::Closed { session: h })
        );
        assert!(sessions.get(h).is_none());
    }

    #[test]
    fn messages_from_the_control_session_route() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        trust.add(&PEER, "", "");
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        let get_magic = Message::new(AddressStack::SELF, MsgType::SysGetMagic, &[]);
        // before control, normal messages fall on the floor
        sessions.ingest(
            h,
            &encode(&[signature(), descriptor_uid(PEER), get_magic.clone()]),
            &mut txq,
            &mut trust,
            &identity,
        );
        while let Some(ev) = sessions.poll_event() {
            assert!(!matches!(ev, SessionEvent::Message { .. }));
        }

        sessions.ingest(
            h,
            &encode(&[link_status(LinkData::StatusPaired, PEER, OWN), logon(PEER)]),
            &mut txq,
            &mut trust,
            &identity,
        );
        sessions.ingest(h, &encode(&[get_magic.clone()]), &mut txq, &mut trust, &identity);
        let mut routed = false;
        while let Some(ev) = sessions.poll_event() {
            if let SessionEvent::Message { session, msg } = ev {
                assert_eq!(session, h);
                assert_eq!(msg, get_magic);
                routed = true;
            }
        }
        assert!(routed);
    }

    #[test]
    fn split_chunks_reassemble() {
        let mut slots: [SessionStorage; 4] = core::array::from_fn(|_| SessionStorage::EMPTY);
        let mut sessions = SessionSet::new(&mut slots[..]);
        let mut txq = TxQueue::new();
        let mut trust = MapTrust::new();
        let identity = identity();

        let h = sessions.accept(&mut txq).unwrap();
        let bytes = encode(&[signature(), descriptor_uid(PEER)]);
        let (a, b) = bytes.split_at(3);
        sessions.ingest(h, a, &mut txq, &mut trust, &identity);
        assert!(sessions.get(h).unwrap().rx_fill() > 0);
        sessions.ingest(h, b, &mut txq, &mut trust, &identity);
        assert_eq!(sessions.get(h).unwrap().pairing, PairingState::Unpaired);
        assert_eq!(sessions.get(h).unwrap().rx_fill(), 0);
    }

    #[test]
    fn tx_batches_coalesce_per_destination() {
        let mut txq = TxQueue::new();
        let a = SessionHandle(0);
        let b = SessionHandle(1);
        let ping = Message::new(AddressStack::SELF, MsgType::LocalPing, &[]);
        txq.push(a, &ping);
        txq.push(a, &ping);
        txq.push(b, &ping);
        txq.push(a, &ping);

        let mut buf = [0u8; TX_BATCH];
        let (dest, n) = txq.next_batch(&mut buf).unwrap();
        assert_eq!(dest, a);
        assert_eq!(n, 2 * ping.wire_len());
        let (dest, _) = txq.next_batch(&mut buf).unwrap();
        assert_eq!(dest, b);
        let (dest, _) = txq.next_batch(&mut buf).unwrap();
        assert_eq!(dest, a);
        assert!(txq.next_batch(&mut buf).is_none());
    }

    #[test]
    fn announcer_keeps_its_period() {
        let identity = identity();
        let mut announcer = Announcer::new(62875);
        let t0 = Instant::ZERO;
        let datagram = announcer.poll(t0, &identity).unwrap();
        // starts with the framed protocol signature
        assert_eq!(datagram[0] as usize, 3 + PROTOCOL_SIGNATURE.len());
        assert_eq!(&datagram[4..9], PROTOCOL_SIGNATURE);
        // the port rides in the announce message
        let msgs = crate::wire::unpack_all(&datagram).unwrap();
        let announce = msgs
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::LocalAnnounce))
            .unwrap();
        assert_eq!(announce.payload(), &[0x9B, 0xF5]);

        assert!(announcer.poll(t0 + Duration::from_secs(4), &identity).is_none());
        assert!(announcer.poll(t0 + Duration::from_secs(5), &identity).is_some());
        announcer.trigger();
        assert!(announcer.poll(t0 + Duration::from_secs(6), &identity).is_some());
    }
}
