#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! The assembled command station.

One [`Station`] owns the node tree, the sub-bus master, the netBiDiB
sessions and the services, and glues them to the configuration store.
The five long-lived activities of the firmware map onto five poll
entry points:

- [`poll_subbus`]: the bus driver,
- [`poll_controller`]: commissioning, while locally controlled,
- [`poll_sessions`]: session events, server handlers, table reports,
- [`poll_announce`]: the UDP announcement,
- [`next_tx_batch`]: the single socket writer.

The embedding owns sockets, UART and clock and calls in with `now`.

[`poll_subbus`]: Station::poll_subbus
[`poll_controller`]: Station::poll_controller
[`poll_sessions`]: Station::poll_sessions
[`poll_announce`]: Station::poll_announce
[`next_tx_batch`]: Station::next_tx_batch
*/

use heapless::Deque;

use bidib_core::clock::ModelTime;
use bidib_core::cs::Backend;
use bidib_core::time::Instant;
use bidib_core::uid::Uid;
use bidib_defs::{ClassBits, MsgType, MAX_STRING_SIZE};
use bidib_network::config::SUBBUS_TX_QUEUE;
use bidib_network::iface::{ConfigSink, Egress, Router, TableChange, TableReporter};
use bidib_network::node::{Node, NodeId, NodeSet, NodeStorage, Private};
use bidib_network::phy::Device;
use bidib_network::session::{
    Announcer, Identity, SessionEvent, SessionHandle, SessionSet, SessionStorage, TrustStore,
    TxQueue,
};
use bidib_network::subbus::{LinkEvent, Master};
use bidib_network::wire::{unpack_all, Message};
use bidib_persistence::station_config::StationConfig;
use bidib_svc_controller::{apply_handlers, Controller, ControllerEvent, CHILD_HANDLERS, SNIFF_HANDLERS};
use bidib_svc_server::{root_features, Server, ROOT_HANDLERS};
use bidib_svc_vbridge as vbridge;

pub use bidib_svc_vbridge::VirtBus;

/// Things the surrounding firmware must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// An unpaired peer asks for pairing; answer with
    /// [`Station::approve_pairing`].
    PairingPrompt { session: SessionHandle, uid: Uid },
    /// External control was taken or released.
    ExternalControl(bool),
    /// The layer dropped the session; close its socket.
    SessionClosed { session: SessionHandle },
}

struct TrustView<'a>(&'a mut StationConfig);

impl TrustStore for TrustView<'_> {
    fn is_trusted(&self, uid: &Uid) -> bool {
        self.0.is_trusted(uid)
    }

    fn add(&mut self, uid: &Uid, product: &str, user: &str) {
        self.0.trust_add(uid, product, user);
    }

    fn remove(&mut self, uid: &Uid) {
        self.0.trust_remove(uid);
    }
}

struct ConfigBridge<'a> {
    config: &'a mut StationConfig,
    root_uid: Uid,
}

impl ConfigSink for ConfigBridge<'_> {
    fn feature_changed(&mut self, uid: &Uid, feature: u8, value: u8) {
        self.config.vnode_set_feature(uid, feature, value);
    }

    fn user_changed(&mut self, uid: &Uid, user: &str) {
        if uid.matches_short(&self.root_uid) {
            self.config.set_user(user);
        } else {
            self.config.vnode_set_user(uid, user);
        }
    }
}

macro_rules! with_router {
    ($self:ident, $backend:ident, $now:expr, |$r:ident| $body:block) => {{
        let mut sink = ConfigBridge {
            config: &mut $self.config,
            root_uid: $self.uid,
        };
        let mut $r = Router {
            nodes: &mut $self.nodes,
            backend: &mut *$backend,
            egress: &mut $self.egress,
            config: &mut sink,
            now: $now,
            root: $self.root,
        };
        $body
    }};
}

/// The whole protocol stack of one command station.
pub struct Station<'n, 's> {
    nodes: NodeSet<'n>,
    root: NodeId,
    egress: Egress,
    master: Master,
    controller: Controller,
    server: Server,
    sessions: SessionSet<'s>,
    txq: TxQueue,
    announcer: Announcer,
    reporter: TableReporter,
    config: StationConfig,
    uid: Uid,
    product: heapless::String<MAX_STRING_SIZE>,
    external: bool,
    stalled: bool,
    notices: Deque<Notice, 8>,
}

impl<'n, 's> Station<'n, 's> {
    pub fn new<N, S>(
        node_slots: N,
        session_slots: S,
        config: StationConfig,
        uid: Uid,
        product: &str,
        sw_version: [u8; 3],
    ) -> Station<'n, 's>
    where
        N: Into<managed::ManagedSlice<'n, NodeStorage>>,
        S: Into<managed::ManagedSlice<'s, SessionStorage>>,
    {
        let mut nodes = NodeSet::new(node_slots);
        let mut root_node = Node::new(0, uid);
        root_node.handlers = &ROOT_HANDLERS;
        root_node.features = root_features();
        root_node.sw_version = sw_version;
        root_node.product = truncated(product);
        root_node.user = truncated(&config.user);
        if let Some(stored) = config.vnode(&uid) {
            for &(feature, value) in stored.features.iter() {
                root_node.features.set(feature, value);
            }
        }
        let root = nodes.add(root_node);

        Station {
            nodes,
            root,
            egress: Egress::new(),
            master: Master::new(),
            controller: Controller::new(),
            server: Server::new(),
            sessions: SessionSet::new(session_slots),
            txq: TxQueue::new(),
            announcer: Announcer::new(config.port),
            reporter: TableReporter::new(),
            config,
            uid,
            product: truncated(product),
            external: false,
            stalled: false,
            notices: Deque::new(),
        }
    }

    pub fn nodes(&self) -> &NodeSet<'n> {
        &self.nodes
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut StationConfig {
        &mut self.config
    }

    /// Whether a remote session holds control.
    pub fn external_control(&self) -> bool {
        self.external
    }

    pub fn poll_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    fn notify(&mut self, notice: Notice) {
        let _ = self.notices.push_back(notice);
    }

    fn identity(&self) -> Identity {
        Identity {
            uid: self.uid,
            product: self.product.clone(),
            user: truncated(&self.config.user),
        }
    }

    /// Instantiate (or resize) a virtual feedback fleet and apply its
    /// persisted names and features.
    pub fn setup_vbridge(
        &mut self,
        now: Instant,
        backend: &mut dyn Backend,
        bus: VirtBus,
        modules: u16,
        per_module: u16,
        base: u16,
    ) {
        let hub = with_router!(self, backend, now, |r| {
            vbridge::resize(&mut r, bus, modules, per_module, base)
        });
        if let Some(hub) = hub {
            let mut ids: heapless::Vec<NodeId, 64> = heapless::Vec::new();
            let _ = ids.push(hub);
            for child in self.nodes.children(hub) {
                let _ = ids.push(child);
            }
            for id in ids {
                let uid = self.nodes.get(id).uid;
                let Some(stored) = self.config.vnode(&uid) else { continue };
                let user = stored.user.clone();
                let features: heapless::Vec<(u8, u8), 8> = stored.features.clone();
                let node = self.nodes.get_mut(id);
                node.user = user;
                for (feature, value) in features {
                    node.features.set(feature, value);
                }
            }
        }
        self.ship_upstream();
    }

    /// Drive the sub-bus: queued egress goes to the master, the master
    /// polls the wire, link events update tree, controller and remote.
    pub fn poll_subbus<D: Device>(
        &mut self,
        now: Instant,
        dev: &mut D,
        backend: &mut dyn Backend,
    ) {
        self.drain_to_subbus();
        self.master.poll(now, dev);
        while let Some(event) = self.master.poll_event() {
            match event {
                LinkEvent::NodeAdded { addr, uid } => self.node_added(addr, uid),
                LinkEvent::NodeLost { addr } => self.node_lost(addr),
                LinkEvent::Rx { addr, msg } => {
                    if self.external {
                        with_router!(self, backend, now, |r| {
                            if let Some(child) = r.nodes.child_by_addr(r.root, addr) {
                                r.ingest_upstream(child, &msg);
                            }
                        });
                    } else {
                        let _ = self.controller.push(ControllerEvent::Rx { addr, msg });
                    }
                }
                LinkEvent::Error { addr, kind } => {
                    with_router!(self, backend, now, |r| {
                        let root = r.root;
                        r.reply(root, MsgType::SysError, &[kind.code().into()]);
                    });
                    let _ = self.controller.push(ControllerEvent::BusError { addr, kind });
                }
                LinkEvent::TxFailed => {}
            }
        }
        self.drain_to_subbus();
        self.ship_upstream();
    }

    /// Run the commissioning machine. Idle under external control.
    pub fn poll_controller(&mut self, now: Instant, backend: &mut dyn Backend) {
        if self.external {
            return;
        }
        with_router!(self, backend, now, |r| {
            self.controller.poll(&mut r);
        });
        self.drain_to_subbus();
        self.ship_upstream();
    }

    /// Session events, server-side handlers and table reporting.
    pub fn poll_sessions(&mut self, now: Instant, backend: &mut dyn Backend) {
        while let Some(event) = self.sessions.poll_event() {
            match event {
                SessionEvent::PairingPrompt { session, uid } => {
                    self.notify(Notice::PairingPrompt { session, uid });
                }
                SessionEvent::ControlGained { session: _ } => {
                    self.external = true;
                    self.nodes.get_mut(self.root).reset_seq();
                    apply_handlers(&mut self.nodes, self.root, true);
                    self.reporter.cancel();
                    self.notify(Notice::ExternalControl(true));
                }
                SessionEvent::ControlLost => {
                    self.external = false;
                    apply_handlers(&mut self.nodes, self.root, false);
                    self.reporter.cancel();
                    self.notify(Notice::ExternalControl(false));
                }
                SessionEvent::Message { session: _, msg } => {
                    self.route_down(now, backend, &msg);
                }
                SessionEvent::Closed { session } => {
                    self.txq.purge(session);
                    self.notify(Notice::SessionClosed { session });
                }
            }
        }

        with_router!(self, backend, now, |r| {
            self.server.poll(&mut r);
            self.reporter.poll(&mut r);
        });
        self.drain_to_subbus();
        self.ship_upstream();
    }

    /// The periodic announcement datagram, when due.
    pub fn poll_announce(&mut self, now: Instant) -> Option<heapless::Vec<u8, 64>> {
        let identity = self.identity();
        self.announcer.poll(now, &identity)
    }

    /// Something arrived on the announcement port.
    pub fn udp_received(&mut self, datagram: &[u8]) {
        if let Ok(msgs) = unpack_all(datagram) {
            if msgs
                .iter()
                .any(|m| m.msg_type() == Some(MsgType::LocalDiscover))
            {
                self.announcer.trigger();
            }
        }
    }

    // --- session plumbing ---------------------------------------------

    pub fn session_accept(&mut self) -> Option<SessionHandle> {
        self.sessions.accept(&mut self.txq)
    }

    pub fn session_ingest(&mut self, session: SessionHandle, data: &[u8]) {
        let identity = self.identity();
        self.sessions.ingest(
            session,
            data,
            &mut self.txq,
            &mut TrustView(&mut self.config),
            &identity,
        );
    }

    /// The peer's socket closed.
    pub fn session_closed(&mut self, session: SessionHandle) {
        self.sessions.close(session);
        self.txq.purge(session);
    }

    pub fn approve_pairing(&mut self, session: SessionHandle, approved: bool) {
        let identity = self.identity();
        self.sessions
            .approve_pairing(session, approved, &mut self.txq, &identity);
    }

    /// The next coalesced write batch for one session socket.
    pub fn next_tx_batch(&mut self, buf: &mut [u8]) -> Option<(SessionHandle, usize)> {
        self.txq.next_batch(buf)
    }

    // --- local inputs -------------------------------------------------

    /// A bit of the global feedback space flipped.
    pub fn feedback_changed(
        &mut self,
        now: Instant,
        backend: &mut dyn Backend,
        index: u16,
        occupied: bool,
    ) {
        with_router!(self, backend, now, |r| {
            vbridge::feedback_changed(&mut r, index, occupied);
        });
        self.ship_upstream();
    }

    /// Distribute the accelerated model time to every node.
    pub fn broadcast_clock(&mut self, now: Instant, backend: &mut dyn Backend, time: ModelTime) {
        let msg = Message::new(
            bidib_core::addr::AddressStack::SELF,
            MsgType::SysClock,
            &time.to_bytes(),
        );
        with_router!(self, backend, now, |r| {
            let root = r.root;
            r.downlink(root, &msg);
        });
        self.drain_to_subbus();
        self.ship_upstream();
    }

    // --- internals ----------------------------------------------------

    fn route_down(&mut self, now: Instant, backend: &mut dyn Backend, msg: &Message) {
        if msg.addr.is_self() && msg.msg_type() == Some(MsgType::NodeChangedAck) {
            let version = self.nodes.get(self.root).table_version;
            let acked = msg.payload().first().copied().unwrap_or(0);
            self.reporter.ack(acked, version);
            return;
        }
        with_router!(self, backend, now, |r| {
            let root = r.root;
            r.downlink(root, msg);
        });
    }

    fn node_added(&mut self, addr: u8, uid: Uid) {
        let mut node = Node::new(addr, uid);
        node.handlers = if self.external {
            &SNIFF_HANDLERS
        } else {
            &CHILD_HANDLERS
        };
        if uid.class().contains(ClassBits::OCCUPANCY) {
            let base = self
                .config
                .fb_base(&uid)
                .unwrap_or_else(|| self.alloc_fb_base());
            self.config.set_fb_base(&uid, base);
            node.private = Some(Private::FeedbackBase(base));
        }
        if self.nodes.add_child(self.root, node).is_ok() {
            self.nodes.get_mut(self.root).bump_table_version();
            if self.external {
                self.reporter.push(TableChange::New { addr, uid });
            } else {
                let _ = self.controller.push(ControllerEvent::NodeAdded { addr });
            }
        }
    }

    fn node_lost(&mut self, addr: u8) {
        let Some(child) = self.nodes.child_by_addr(self.root, addr) else {
            return;
        };
        self.nodes.remove(child);
        self.nodes.get_mut(self.root).bump_table_version();
        if self.external {
            self.reporter.push(TableChange::Lost { addr });
        } else {
            let _ = self.controller.push(ControllerEvent::NodeLost { addr });
        }
    }

    /// Pick a fresh window in the global feedback space, past every
    /// known mapping.
    fn alloc_fb_base(&self) -> u16 {
        let mut next = 0u16;
        for &(_, base) in self.config.fb_map() {
            next = next.max(base.saturating_add(16));
        }
        for id in self.nodes.iter() {
            let node = self.nodes.get(id);
            let end = match (&node.private, node.vfeedback()) {
                (_, Some(vfb)) => vfb.base.saturating_add(vfb.count() as u16),
                (Some(Private::FeedbackBase(base)), _) => base.saturating_add(16),
                _ => 0,
            };
            next = next.max(end);
        }
        next.div_ceil(16) * 16
    }

    /// Move root egress into the master, turning a reset broadcast
    /// into the priority-reset flow.
    fn drain_to_subbus(&mut self) {
        while let Some(msg) = self.egress.to_subbus.pop_front() {
            if msg.msg_type() == Some(MsgType::SysReset) {
                self.master.reset(msg);
                continue;
            }
            if let Err(msg) = self.master.enqueue(msg) {
                let _ = self.egress.to_subbus.push_front(msg);
                if !self.stalled {
                    self.stalled = true;
                    let _ = self
                        .egress
                        .upstream
                        .push_back(Message::new(
                            bidib_core::addr::AddressStack::SELF,
                            MsgType::Stall,
                            &[1],
                        ));
                }
                break;
            }
        }
        if self.stalled
            && self.egress.to_subbus.is_empty()
            && self.master.tx_free() >= SUBBUS_TX_QUEUE / 2
        {
            self.stalled = false;
            let _ = self.egress.upstream.push_back(Message::new(
                bidib_core::addr::AddressStack::SELF,
                MsgType::Stall,
                &[0],
            ));
        }
    }

    /// Upstream messages go to the controlling session; without one
    /// the local controller consumed them in its handlers already.
    fn ship_upstream(&mut self) {
        while let Some(mut msg) = self.egress.upstream.pop_front() {
            let Some(control) = self.sessions.control() else {
                continue;
            };
            if !msg.is_local() && !msg.is_broadcast() {
                msg.num = self.nodes.get_mut(self.root).next_tx_num();
            }
            self.txq.push(control, &msg);
        }
    }
}

fn truncated(text: &str) -> heapless::String<MAX_STRING_SIZE> {
    let mut out = heapless::String::new();
    for c in text.chars().take(MAX_STRING_SIZE) {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use bidib_core::cs::{
        AccessoryTime, BackendEvent, TrackMode,
    };
    use bidib_core::dcc::DriveCommand;
    use bidib_core::time::Duration;
    use bidib_defs::{LinkData, PomOp, ProgOp, PROTOCOL_SIGNATURE};
    use bidib_network::node::Commissioning;
    use bidib_network::phy::{Loopback, Word9};
    use bidib_network::subbus::Token;
    use bidib_network::wire::subbus::{emit_frame, MAX_FRAME};
    use bidib_core::addr::AddressStack;

    #[derive(Default)]
    struct TestBackend {
        mode: TrackMode,
        bits: std::collections::BTreeMap<u16, bool>,
    }

    impl bidib_core::cs::SignalControl for TestBackend {
        fn track_mode(&self) -> TrackMode {
            self.mode
        }
        fn set_track_mode(&mut self, mode: TrackMode) -> TrackMode {
            self.mode = mode;
            self.mode
        }
        fn has_signal(&self) -> bool {
            true
        }
    }
    impl bidib_core::cs::LocoControl for TestBackend {
        fn drive(&mut self, _cmd: &DriveCommand) -> bool {
            true
        }
        fn loco_count(&self) -> usize {
            0
        }
        fn loco_state(&self, _index: usize) -> Option<DriveCommand> {
            None
        }
        fn loco_state_by_addr(&self, _addr: u16) -> Option<DriveCommand> {
            None
        }
    }
    impl bidib_core::cs::AccessoryControl for TestBackend {
        fn switch(&mut self, _addr: u16, _aspect: u8, _time: Option<AccessoryTime>) -> bool {
            true
        }
    }
    impl bidib_core::cs::ProgTrack for TestBackend {
        fn pom(&mut self, _addr: u16, _op: PomOp, _cv: u32, _data: u8) -> bool {
            true
        }
        fn prog(&mut self, _op: ProgOp, _cv: u16, _data: u8) -> bool {
            true
        }
    }
    impl bidib_core::cs::FeedbackSpace for TestBackend {
        fn set(&mut self, index: u16, occupied: bool) {
            self.bits.insert(index, occupied);
        }
        fn get(&self, index: u16) -> bool {
            self.bits.get(&index).copied().unwrap_or(false)
        }
    }
    impl bidib_core::cs::BoosterMonitor for TestBackend {
        fn current_ma(&self) -> u32 {
            500
        }
        fn voltage_dv(&self) -> u16 {
            160
        }
        fn temperature_c(&self) -> u8 {
            28
        }
    }
    impl Backend for TestBackend {
        fn poll_event(&mut self) -> Option<BackendEvent> {
            None
        }
    }

    const OWN: Uid = Uid::new(0x9D, 0x00, 0x0D, 0xD0, [1, 2, 3]);
    const PEER: Uid = Uid::new(0x00, 0x00, 0x0D, 0xFB, [9, 9, 9]);
    const NODE: Uid = Uid::new(0x41, 0x00, 0x0D, 0xA0, [0x11, 0x22, 0x33]);

    fn node_storage() -> [NodeStorage; 16] {
        core::array::from_fn(|_| NodeStorage::EMPTY)
    }

    fn session_storage() -> [SessionStorage; 4] {
        core::array::from_fn(|_| SessionStorage::EMPTY)
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

    fn batches(station: &mut Station<'_, '_>) -> std::vec::Vec<Message> {
        let mut buf = [0u8; 1024];
        let mut out = std::vec::Vec::new();
        while let Some((_, n)) = station.next_tx_batch(&mut buf) {
            let mut at = 0;
            while at < n {
                let (msg, used) = Message::parse(&buf[at..n]).unwrap();
                out.push(msg);
                at += used;
            }
        }
        out
    }

    fn take_control(station: &mut Station<'_, '_>, backend: &mut TestBackend) -> SessionHandle {
        station.config_mut().trust_add(&PEER, "Wizard", "desk");
        let h = station.session_accept().unwrap();
        let mut link_uid = std::vec::Vec::from([u8::from(LinkData::DescriptorUid)]);
        link_uid.extend_from_slice(PEER.as_bytes());
        let mut confirm = std::vec::Vec::from([u8::from(LinkData::StatusPaired)]);
        confirm.extend_from_slice(PEER.as_bytes());
        confirm.extend_from_slice(OWN.as_bytes());
        let stream = encode(&[
            Message::new(AddressStack::SELF, MsgType::LocalProtocolSignature, PROTOCOL_SIGNATURE),
            Message::new(AddressStack::SELF, MsgType::LocalLink, &link_uid),
            Message::new(AddressStack::SELF, MsgType::LocalLink, &confirm),
            Message::new(AddressStack::SELF, MsgType::LocalLogon, PEER.as_bytes()),
        ]);
        station.session_ingest(h, &stream);
        station.poll_sessions(Instant::ZERO, backend);
        h
    }

    fn station<'n, 's>(
        nodes: &'n mut [NodeStorage; 16],
        sessions: &'s mut [SessionStorage; 4],
    ) -> Station<'n, 's> {
        Station::new(
            &mut nodes[..],
            &mut sessions[..],
            StationConfig::new(),
            OWN,
            "mc2",
            [2, 1, 0],
        )
    }

    #[test]
    fn pairing_to_external_control_and_back() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);

        let h = take_control(&mut s, &mut backend);
        assert!(s.external_control());
        let mut saw_control = false;
        while let Some(n) = s.poll_notice() {
            if n == Notice::ExternalControl(true) {
                saw_control = true;
            }
        }
        assert!(saw_control);
        let sent = batches(&mut s);
        let ack = sent
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::LocalLogonAck))
            .unwrap();
        assert_eq!(ack.payload()[0], 0);
        assert_eq!(&ack.payload()[1..], OWN.as_bytes());

        // logoff hands the layout back to the local controller
        let logoff = encode(&[Message::new(AddressStack::SELF, MsgType::LocalLogoff, &[])]);
        s.session_ingest(h, &logoff);
        s.poll_sessions(Instant::ZERO, &mut backend);
        assert!(!s.external_control());
    }

    #[test]
    fn control_session_drives_the_root() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        backend.mode = TrackMode::Go;
        let mut s = station(&mut nodes, &mut sessions);
        let h = take_control(&mut s, &mut backend);
        batches(&mut s);

        let drive = Message::new(
            AddressStack::SELF,
            MsgType::CsDrive,
            &[0x03, 0x00, 0x04, 0x09, 0x80, 0x10, 0, 0, 0],
        );
        s.session_ingest(h, &encode(&[drive]));
        s.poll_sessions(Instant::ZERO, &mut backend);
        let sent = batches(&mut s);
        let ack = sent
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::CsDriveAck))
            .unwrap();
        assert_eq!(ack.payload(), &[0x03, 0x00, 0x01]);
        // upstream sequence numbering starts over after logon
        assert_eq!(ack.num, 1);
    }

    #[test]
    fn reset_from_the_remote_quiets_the_bus() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);
        let h = take_control(&mut s, &mut backend);
        batches(&mut s);

        let reset = Message::new(AddressStack::SELF, MsgType::SysReset, &[]);
        s.session_ingest(h, &encode(&[reset]));
        s.poll_sessions(Instant::ZERO, &mut backend);

        // the master transmits the reset and then holds the bus
        let mut dev = Loopback::new();
        let mut now = Instant::ZERO;
        for _ in 0..60 {
            s.poll_subbus(now, &mut dev, &mut backend);
            now += Duration::from_micros(200);
        }
        assert!(s.master.tx_is_empty());
        dev.take_tx();
        s.poll_subbus(now + Duration::from_millis(500), &mut dev, &mut backend);
        assert!(dev.take_tx().is_empty());
        s.poll_subbus(now + Duration::from_millis(1100), &mut dev, &mut backend);
        assert!(!dev.take_tx().is_empty());
    }

    #[test]
    fn admission_flows_into_commissioning() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);
        let mut dev = Loopback::new();

        // wait for the logon window, then answer as a fresh node
        let mut now = Instant::ZERO;
        loop {
            s.poll_subbus(now, &mut dev, &mut backend);
            let tx = dev.take_tx();
            if tx
                .iter()
                .any(|w| w.is_command() && Token::parse(w.byte()) == Some(Token::Logon))
            {
                break;
            }
            now += Duration::from_micros(200);
        }
        let logon = Message::new(AddressStack::SELF, MsgType::LocalLogon, NODE.as_bytes());
        let mut inner = [0u8; MAX_FRAME];
        let n = logon.emit(&mut inner).unwrap();
        let mut framed = [0u8; MAX_FRAME];
        let total = emit_frame(&inner[..n], &mut framed).unwrap();
        for &b in &framed[..total] {
            dev.inject(Word9::data(b));
        }
        now += Duration::from_micros(200);
        s.poll_subbus(now, &mut dev, &mut backend);

        // the node answers its polls while the table settles; then it
        // enters the tree and the controller opens the ladder
        let target = now + Duration::from_millis(600);
        while now < target {
            s.poll_subbus(now, &mut dev, &mut backend);
            if dev
                .take_tx()
                .iter()
                .any(|w| w.is_command() && Token::parse(w.byte()) == Some(Token::Poll(1)))
            {
                dev.inject(Word9::data(1));
            }
            now += Duration::from_micros(200);
        }
        s.poll_subbus(now, &mut dev, &mut backend);
        s.poll_controller(now, &mut backend);

        let child = s.nodes().child_by_addr(s.root(), 1).expect("admitted node");
        assert_eq!(s.nodes().get(child).uid, NODE);
        assert_eq!(s.nodes().get(child).state, Commissioning::GetMagic);
        assert_eq!(s.nodes().get(s.root()).table_version, 1);
        // the disable and the magic request sit in the master's queue
        assert!(!s.master.tx_is_empty());
    }

    #[test]
    fn occupancy_node_gets_a_feedback_window() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);

        let occ_uid = Uid::new(
            ClassBits::OCCUPANCY.bits(),
            0,
            0x0D,
            0xA1,
            [1, 1, 1],
        );
        s.node_added(1, occ_uid);
        let child = s.nodes().child_by_addr(s.root(), 1).unwrap();
        let base = match s.nodes().get(child).private {
            Some(Private::FeedbackBase(base)) => base,
            _ => panic!("no feedback window"),
        };
        assert_eq!(s.config().fb_base(&occ_uid), Some(base));

        // a second module lands behind the first
        let occ2 = Uid::new(ClassBits::OCCUPANCY.bits(), 0, 0x0D, 0xA1, [1, 1, 2]);
        s.node_added(2, occ2);
        let second = s.config().fb_base(&occ2).unwrap();
        assert!(second >= base + 16);
    }

    #[test]
    fn virtual_fleet_reports_to_the_remote() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);
        let _h = take_control(&mut s, &mut backend);
        batches(&mut s);

        s.setup_vbridge(Instant::ZERO, &mut backend, VirtBus::S88, 2, 16, 0);
        let sent = batches(&mut s);
        let news: std::vec::Vec<&Message> = sent
            .iter()
            .filter(|m| m.msg_type() == Some(MsgType::NodeNew))
            .collect();
        assert_eq!(news.len(), 2);

        // a feedback flip reaches the remote as an occupancy report
        s.feedback_changed(Instant::ZERO, &mut backend, 5, true);
        let sent = batches(&mut s);
        let occ = sent
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::BmOcc))
            .unwrap();
        assert_eq!(occ.payload(), &[5]);
        assert_eq!(occ.addr, AddressStack::from_hops(&[64, 1]));
    }

    #[test]
    fn clock_broadcast_reaches_the_bus_queue() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut backend = TestBackend::default();
        let mut s = station(&mut nodes, &mut sessions);
        // a physical child makes the sub-bus part of the fan-out
        s.node_added(1, NODE);

        let t = ModelTime {
            minute: 30,
            hour: 12,
            weekday: bidib_core::clock::Weekday::Monday,
            factor: 4,
        };
        s.broadcast_clock(Instant::ZERO, &mut backend, t);
        assert!(!s.master.tx_is_empty());
    }

    #[test]
    fn discover_requests_an_extra_announcement() {
        let mut nodes = node_storage();
        let mut sessions = session_storage();
        let mut s = station(&mut nodes, &mut sessions);

        let first = s.poll_announce(Instant::ZERO).unwrap();
        assert!(first.starts_with(&[(3 + PROTOCOL_SIGNATURE.len()) as u8]));
        assert!(s.poll_announce(Instant::from_secs(2)).is_none());

        let discover = encode(&[Message::new(AddressStack::SELF, MsgType::LocalDiscover, &[])]);
        s.udp_received(&discover);
        assert!(s.poll_announce(Instant::from_secs(2)).is_some());
    }
}
