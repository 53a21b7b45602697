use heapless::{Deque, Vec};

use super::{
    SubBusError, Token, HIGH_WATER, LOGON_WINDOW_OCTETS, T_BYTE, T_FIRST_BYTE, T_LIVENESS,
    T_LOGON, T_RESET_QUIET, T_SETTLE, T_SLOT_GAP, T_TX_GAP,
};
use crate::config::{SUBBUS_EVENT_QUEUE, SUBBUS_TX_QUEUE};
use crate::phy::{Device, SerialError, Word9};
use crate::wire::subbus::{declared_total, pack, verify_frame, Packed, MAX_FRAME};
use crate::wire::{unpack_all, Message};
use bidib_core::time::{Duration, Instant};
use bidib_core::uid::Uid;
use bidib_defs::{MsgType, SUBBUS_MAX_NODES};

/// A node registered on the sub-bus.
#[derive(Debug, Clone, Copy)]
pub struct BusNode {
    pub addr: u8,
    pub uid: Uid,
    deadline: Instant,
}

/// What the link hands up to the tree and the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A node passed the logon window and holds a fresh address.
    /// Reported once the table settled.
    NodeAdded { addr: u8, uid: Uid },
    /// A node missed its liveness deadline.
    NodeLost { addr: u8 },
    /// A message received in a peer slot.
    Rx { addr: u8, msg: Message },
    /// A link fault attributable to one slot.
    Error { addr: u8, kind: SubBusError },
    /// The own transmit slot collided; the queue is untouched.
    TxFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitTx,
    TxPacket { pos: usize, len: usize, count: usize },
    TxError,
    RxPacket { addr: u8, expect: usize },
    Logon,
    Fault,
}

/// The bus master: one per sub-bus, owning the phy device's schedule.
///
/// Everything is driven from [`poll`]: received words advance the
/// reception state machine, lapsed deadlines fire the token windows,
/// and an idle bus starts the next slot of the round.
///
/// [`poll`]: #method.poll
pub struct Master {
    state: State,
    deadline: Instant,
    idle_until: Instant,
    quiet_until: Option<Instant>,
    nodes: Vec<BusNode, { SUBBUS_MAX_NODES as usize }>,
    version: u8,
    round_pos: usize,
    bonus: Option<u8>,
    tx: Deque<Message, SUBBUS_TX_QUEUE>,
    resetting: bool,
    txbuf: [u8; MAX_FRAME],
    rxbuf: Vec<u8, MAX_FRAME>,
    events: Deque<LinkEvent, SUBBUS_EVENT_QUEUE>,
    settle: Option<Instant>,
    pending: Vec<(u8, Uid), { SUBBUS_MAX_NODES as usize }>,
    token_echo: Option<Word9>,
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Master {
    pub fn new() -> Master {
        Master {
            state: State::Idle,
            deadline: Instant::ZERO,
            idle_until: Instant::ZERO,
            quiet_until: None,
            nodes: Vec::new(),
            version: 0,
            round_pos: 0,
            bonus: None,
            tx: Deque::new(),
            resetting: false,
            txbuf: [0; MAX_FRAME],
            rxbuf: Vec::new(),
            events: Deque::new(),
            settle: None,
            pending: Vec::new(),
            token_echo: None,
        }
    }

    /// The registered nodes, ordered by address.
    pub fn nodes(&self) -> &[BusNode] {
        &self.nodes
    }

    /// Current node-table version; wraps 255 to 1.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Queue a message for the next own transmit slot.
    pub fn enqueue(&mut self, msg: Message) -> Result<(), Message> {
        self.tx.push_back(msg)
    }

    pub fn tx_free(&self) -> usize {
        SUBBUS_TX_QUEUE - self.tx.len()
    }

    pub fn tx_is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Flush the queue and send `msg` with priority; once it is out,
    /// the node table clears and the bus pauses for one second.
    pub fn reset(&mut self, msg: Message) {
        self.tx.clear();
        // the queue was empty a line ago
        let _ = self.tx.push_back(msg);
        self.resetting = true;
    }

    /// Take the next pending link event.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// How long the caller may sleep before the next deadline.
    pub fn poll_delay(&self, now: Instant) -> Option<Duration> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Instant| match next {
            Some(cur) if cur <= t => {}
            _ => next = Some(t),
        };
        if self.state != State::Idle {
            consider(self.deadline);
        } else {
            consider(self.idle_until);
        }
        if let Some(q) = self.quiet_until {
            consider(q);
        }
        if let Some(s) = self.settle {
            consider(s);
        }
        for node in self.nodes.iter() {
            consider(node.deadline);
        }
        next.map(|t| if t > now { t - now } else { Duration::ZERO })
    }

    /// Drive the bus: consume received words, fire lapsed windows,
    /// start the next slot. Returns whether anything happened.
    pub fn poll<D: Device>(&mut self, now: Instant, dev: &mut D) -> bool {
        let mut did_something = false;

        did_something |= self.expire_liveness(now);
        did_something |= self.flush_settled(now);

        loop {
            let mut progress = false;

            loop {
                match dev.read() {
                    Ok(word) => {
                        self.consume(now, word, dev);
                        progress = true;
                    }
                    Err(nb::Error::WouldBlock) => break,
                    Err(nb::Error::Other(err)) => {
                        self.usart_error(now, err);
                        progress = true;
                    }
                }
            }

            if self.state != State::Idle && now >= self.deadline {
                self.on_timeout(now, dev);
                progress = true;
            }

            if self.state == State::Idle && now >= self.idle_until && self.quiet_ok(now) {
                progress |= self.start_slot(now, dev);
            }

            if !progress {
                break;
            }
            did_something = true;
        }

        did_something
    }

    fn quiet_ok(&mut self, now: Instant) -> bool {
        match self.quiet_until {
            Some(q) if now < q => false,
            Some(_) => {
                self.quiet_until = None;
                true
            }
            None => true,
        }
    }

    fn expire_liveness(&mut self, now: Instant) -> bool {
        let mut any = false;
        while let Some(i) = self.nodes.iter().position(|n| now >= n.deadline) {
            let node = self.nodes.remove(i);
            self.pending.retain(|(a, _)| *a != node.addr);
            self.push_event(LinkEvent::NodeLost { addr: node.addr });
            net_debug!("subbus: node {} lost", node.addr);
            any = true;
        }
        any
    }

    fn flush_settled(&mut self, now: Instant) -> bool {
        match self.settle {
            Some(t) if now >= t => {
                self.settle = None;
                let pending = core::mem::take(&mut self.pending);
                for (addr, uid) in pending {
                    self.push_event(LinkEvent::NodeAdded { addr, uid });
                }
                true
            }
            _ => false,
        }
    }

    fn push_event(&mut self, event: LinkEvent) {
        if self.events.push_back(event).is_err() {
            net_debug!("subbus: event queue full, event dropped");
        }
    }

    fn refresh_liveness(&mut self, addr: u8, now: Instant) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.addr == addr) {
            node.deadline = now + T_LIVENESS;
        }
    }

    fn send_token<D: Device>(&mut self, token: Token, dev: &mut D) -> bool {
        let word = token.word();
        match dev.write(word) {
            Ok(()) => {
                self.token_echo = Some(word);
                true
            }
            Err(_) => false,
        }
    }

    /// Pick and open the next slot of the round:
    /// `POLL(0)`, one `POLL(n)` per node, then `LOGON`.
    fn start_slot<D: Device>(&mut self, now: Instant, dev: &mut D) -> bool {
        if let Some(addr) = self.bonus.take() {
            if self.nodes.iter().any(|n| n.addr == addr) {
                return self.open_peer_slot(addr, now, dev);
            }
        }

        let round_len = 1 + self.nodes.len() + 1;
        for _ in 0..round_len {
            let pos = self.round_pos;
            self.round_pos = (self.round_pos + 1) % round_len;
            match pos {
                0 => {
                    if self.tx.is_empty() {
                        continue;
                    }
                    if self.send_token(Token::Poll(0), dev) {
                        self.state = State::WaitTx;
                        self.deadline = now + T_TX_GAP;
                        return true;
                    }
                    return false;
                }
                p if p <= self.nodes.len() => {
                    if self.events.len() + 4 > SUBBUS_EVENT_QUEUE {
                        // hold the nodes off while the upstream path
                        // is congested
                        if self.send_token(Token::Busy, dev) {
                            self.to_idle(now);
                            return true;
                        }
                        return false;
                    }
                    let addr = self.nodes[p - 1].addr;
                    return self.open_peer_slot(addr, now, dev);
                }
                _ => {
                    if self.nodes.len() as u8 >= SUBBUS_MAX_NODES {
                        continue;
                    }
                    if self.send_token(Token::Logon, dev) {
                        self.rxbuf.clear();
                        self.state = State::Logon;
                        self.deadline = now + T_LOGON;
                        return true;
                    }
                    return false;
                }
            }
        }
        false
    }

    fn open_peer_slot<D: Device>(&mut self, addr: u8, now: Instant, dev: &mut D) -> bool {
        if !self.send_token(Token::Poll(addr), dev) {
            return false;
        }
        self.rxbuf.clear();
        self.state = State::RxPacket { addr, expect: 0 };
        self.deadline = now + T_FIRST_BYTE;
        true
    }

    fn consume<D: Device>(&mut self, now: Instant, word: Word9, dev: &mut D) {
        if let Some(expected) = self.token_echo.take() {
            if word == expected {
                return;
            }
        }

        match self.state {
            State::TxPacket { pos, len, count } => {
                if !word.is_command() && word.byte() == self.txbuf[pos] {
                    let pos = pos + 1;
                    if pos == len {
                        self.tx_complete(now, count);
                    } else if dev.write(Word9::data(self.txbuf[pos])).is_ok() {
                        self.state = State::TxPacket { pos, len, count };
                        self.deadline = now + T_BYTE;
                    } else {
                        self.tx_collision(now);
                    }
                } else {
                    self.tx_collision(now);
                }
            }
            State::RxPacket { addr, expect } => {
                if word.is_command() {
                    return;
                }
                if self.rxbuf.push(word.byte()).is_err() {
                    self.finish_rx_error(addr, SubBusError::Packet, now);
                    return;
                }
                let expect = if self.rxbuf.len() == 1 {
                    let total = declared_total(word.byte());
                    if total == 1 {
                        // single-octet status: the node is alive
                        self.refresh_liveness(addr, now);
                        self.to_idle(now);
                        return;
                    }
                    if total > MAX_FRAME {
                        self.finish_rx_error(addr, SubBusError::Packet, now);
                        return;
                    }
                    total
                } else {
                    expect
                };
                if self.rxbuf.len() == expect {
                    self.finish_rx(addr, now);
                } else {
                    self.state = State::RxPacket { addr, expect };
                    self.deadline = now + T_BYTE;
                }
            }
            State::Logon => {
                if !word.is_command() && self.rxbuf.len() < LOGON_WINDOW_OCTETS {
                    let _ = self.rxbuf.push(word.byte());
                }
            }
            // stray words outside an open window are dropped
            State::Idle | State::WaitTx | State::TxError | State::Fault => {}
        }
    }

    fn usart_error(&mut self, now: Instant, err: SerialError) {
        match self.state {
            // collisions are the expected case inside the window
            State::Logon => {}
            State::TxPacket { .. } => {
                net_debug!("subbus: tx error {}", err);
                self.tx_collision(now);
            }
            State::Idle => {}
            _ => {
                net_debug!("subbus: usart error {}", err);
                self.rxbuf.clear();
                self.state = State::Fault;
                self.deadline = now + T_BYTE;
            }
        }
    }

    fn on_timeout<D: Device>(&mut self, now: Instant, dev: &mut D) {
        match self.state {
            State::WaitTx => match pack(&self.tx, &mut self.txbuf) {
                Packed::Frame { len, count } => {
                    if dev.write(Word9::data(self.txbuf[0])).is_ok() {
                        self.state = State::TxPacket {
                            pos: 0,
                            len,
                            count,
                        };
                        self.deadline = now + T_BYTE;
                    } else {
                        self.tx_collision(now);
                    }
                }
                Packed::Oversize => {
                    self.tx.pop_front();
                    self.push_event(LinkEvent::Error {
                        addr: 0,
                        kind: SubBusError::Packet,
                    });
                    self.to_idle(now);
                }
                Packed::Empty => self.to_idle(now),
            },
            State::TxPacket { .. } => self.tx_collision(now),
            State::TxError | State::Fault => self.to_idle(now),
            State::RxPacket { addr, .. } => {
                if self.rxbuf.is_empty() {
                    // silence; the liveness deadline does the bookkeeping
                    self.to_idle(now);
                } else {
                    self.finish_rx_error(addr, SubBusError::Time, now);
                }
            }
            State::Logon => self.finish_logon(now),
            State::Idle => {}
        }
    }

    fn tx_complete(&mut self, now: Instant, count: usize) {
        for _ in 0..count {
            self.tx.pop_front();
        }
        net_trace!("subbus: tx slot done, {} messages", count);
        if self.resetting && self.tx.is_empty() {
            self.resetting = false;
            while let Some(node) = self.nodes.pop() {
                self.push_event(LinkEvent::NodeLost { addr: node.addr });
            }
            self.pending.clear();
            self.settle = None;
            self.quiet_until = Some(now + T_RESET_QUIET);
            net_debug!("subbus: reset sent, bus quiet");
        }
        self.to_idle(now);
    }

    fn tx_collision(&mut self, now: Instant) {
        self.push_event(LinkEvent::TxFailed);
        self.state = State::TxError;
        self.deadline = now + T_BYTE;
    }

    fn finish_rx(&mut self, addr: u8, now: Instant) {
        match verify_frame(&self.rxbuf) {
            Ok(inner) => {
                let high_water = inner.len() > HIGH_WATER;
                match unpack_all(inner) {
                    Ok(list) => {
                        self.refresh_liveness(addr, now);
                        for msg in list {
                            self.push_event(LinkEvent::Rx { addr, msg });
                        }
                        if high_water {
                            self.bonus = Some(addr);
                        }
                    }
                    Err(_) => self.push_event(LinkEvent::Error {
                        addr,
                        kind: SubBusError::Packet,
                    }),
                }
            }
            Err(_) => self.push_event(LinkEvent::Error {
                addr,
                kind: SubBusError::Crc,
            }),
        }
        self.to_idle(now);
    }

    fn finish_rx_error(&mut self, addr: u8, kind: SubBusError, now: Instant) {
        self.push_event(LinkEvent::Error { addr, kind });
        self.to_idle(now);
    }

    /// Evaluate the logon window: exactly one clean packet admits the
    /// node, anything else leaves the colliders to their random
    /// backoff.
    fn finish_logon(&mut self, now: Instant) {
        let outcome = (|| {
            let &first = self.rxbuf.first()?;
            if declared_total(first) != self.rxbuf.len() {
                return None;
            }
            let inner = verify_frame(&self.rxbuf).ok()?;
            let list = unpack_all(inner).ok()?;
            if list.len() != 1 {
                return None;
            }
            let msg = &list[0];
            if msg.msg_type() != Some(MsgType::LocalLogon) || msg.payload().len() != 7 {
                return None;
            }
            Some(Uid::from_bytes(msg.payload()))
        })();

        match outcome {
            Some(uid) => self.admit(uid, now),
            None if self.rxbuf.is_empty() => net_trace!("subbus: logon window empty"),
            None => net_debug!("subbus: logon collision, nodes back off"),
        }
        self.to_idle(now);
    }

    fn admit(&mut self, uid: Uid, now: Instant) {
        if let Some(node) = self.nodes.iter().find(|n| n.uid == uid) {
            // ack got lost, the node retried; same address again
            let addr = node.addr;
            self.queue_logon_ack(addr, uid);
            return;
        }

        let addr = match self.lowest_free_addr() {
            Some(addr) => addr,
            None => {
                net_debug!("subbus: logon ignored, address space exhausted");
                return;
            }
        };
        let at = self
            .nodes
            .iter()
            .position(|n| n.addr > addr)
            .unwrap_or(self.nodes.len());
        let _ = self.nodes.insert(
            at,
            BusNode {
                addr,
                uid,
                deadline: now + T_LIVENESS,
            },
        );
        self.version = if self.version == 255 { 1 } else { self.version + 1 };
        self.queue_logon_ack(addr, uid);
        let _ = self.pending.push((addr, uid));
        self.settle = Some(now + T_SETTLE);
        net_debug!("subbus: node {} admitted, table version {}", addr, self.version);
    }

    fn lowest_free_addr(&self) -> Option<u8> {
        (1..=SUBBUS_MAX_NODES).find(|a| !self.nodes.iter().any(|n| n.addr == *a))
    }

    fn queue_logon_ack(&mut self, addr: u8, uid: Uid) {
        let mut payload = [0u8; 8];
        payload[0] = addr;
        payload[1..].copy_from_slice(uid.as_bytes());
        let ack = Message::new(
            bidib_core::addr::AddressStack::SELF,
            MsgType::LocalLogonAck,
            &payload,
        );
        if self.tx.push_front(ack).is_err() {
            net_debug!("subbus: tx queue full, logon ack dropped");
        }
    }

    fn to_idle(&mut self, now: Instant) {
        self.state = State::Idle;
        self.idle_until = now + T_SLOT_GAP;
    }
}
