#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Virtual occupancy nodes.

Local feedback sources (s88 chains, mCAN and LocoNet detectors) appear
to a BiDiB controller as ordinary occupancy nodes below a synthetic
hub, one hub per source type. Each feedback node projects a window of
the global feedback space and speaks the acknowledged-occupancy
protocol.
*/

use heapless::Vec;

use bidib_core::feature::{Feature, FeatureTable};
use bidib_core::uid::Uid;
use bidib_defs::{ClassBits, FeatureId, MsgType, MAX_FB_PER_TYPE, MAX_STRING_SIZE};
use bidib_network::iface::Router;
use bidib_network::node::{
    Handler, HandlerTable, Node, NodeFlags, NodeId, Private, VFeedback,
};
use bidib_network::wire::Message;
use bidib_svc_server as server;

/// Manufacturer octet of all synthesised nodes.
pub const VIRT_VID: u8 = 0x0D;

/// Feedback source types backed by a virtual bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VirtBus {
    S88,
    MCan,
    LNet,
}

impl VirtBus {
    pub const fn product(self) -> u8 {
        match self {
            VirtBus::S88 => 0xE1,
            VirtBus::MCan => 0xE2,
            VirtBus::LNet => 0xE3,
        }
    }

    const fn serial(self) -> u8 {
        match self {
            VirtBus::S88 => 1,
            VirtBus::MCan => 2,
            VirtBus::LNet => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            VirtBus::S88 => "vS88",
            VirtBus::MCan => "vMCAN",
            VirtBus::LNet => "vLNET",
        }
    }
}

/// The hub identity of one source type; the serial is fixed per type.
pub fn hub_uid(bus: VirtBus) -> Uid {
    Uid::new(
        ClassBits::BRIDGE.bits(),
        0,
        VIRT_VID,
        bus.product(),
        [0, 0, bus.serial()],
    )
}

/// The identity of the `index`-th feedback node of a source type.
pub fn fb_uid(bus: VirtBus, index: u16) -> Uid {
    Uid::new(
        ClassBits::OCCUPANCY.bits(),
        0,
        VIRT_VID,
        bus.product(),
        [bus.serial(), (index >> 8) as u8, index as u8],
    )
}

static HUB_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[
        (MsgType::SysGetMagic, server::sys_get_magic as Handler),
        (MsgType::SysGetPVersion, server::sys_get_p_version as Handler),
        (MsgType::SysGetUniqueId, server::sys_get_unique_id as Handler),
        (MsgType::SysGetSwVersion, server::sys_get_sw_version as Handler),
        (MsgType::SysPing, server::sys_ping as Handler),
        (MsgType::SysIdentify, server::sys_identify as Handler),
        (MsgType::SysEnable, server::sys_enable as Handler),
        (MsgType::SysDisable, server::sys_disable as Handler),
        (MsgType::SysGetError, server::sys_get_error as Handler),
        (MsgType::NodeTabGetAll, server::nodetab_getall as Handler),
        (MsgType::NodeTabGetNext, server::nodetab_getnext as Handler),
        (MsgType::FeatureGetAll, server::feature_getall as Handler),
        (MsgType::FeatureGetNext, server::feature_getnext as Handler),
        (MsgType::FeatureGet, server::feature_get as Handler),
        (MsgType::FeatureSet, server::feature_set as Handler),
        (MsgType::StringGet, server::string_get as Handler),
        (MsgType::StringSet, server::string_set as Handler),
    ],
    upstream: &[],
};

static FB_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[
        (MsgType::SysGetMagic, server::sys_get_magic as Handler),
        (MsgType::SysGetPVersion, server::sys_get_p_version as Handler),
        (MsgType::SysGetUniqueId, server::sys_get_unique_id as Handler),
        (MsgType::SysGetSwVersion, server::sys_get_sw_version as Handler),
        (MsgType::SysPing, server::sys_ping as Handler),
        (MsgType::SysIdentify, server::sys_identify as Handler),
        (MsgType::SysEnable, server::sys_enable as Handler),
        (MsgType::SysDisable, server::sys_disable as Handler),
        (MsgType::SysGetError, server::sys_get_error as Handler),
        // a leaf synthesises its singleton table in one go
        (MsgType::NodeTabGetAll, fb_nodetab_getall as Handler),
        (MsgType::NodeTabGetNext, fb_nodetab_getnext as Handler),
        (MsgType::FeatureGetAll, server::feature_getall as Handler),
        (MsgType::FeatureGetNext, server::feature_getnext as Handler),
        (MsgType::FeatureGet, server::feature_get as Handler),
        (MsgType::FeatureSet, server::feature_set as Handler),
        (MsgType::StringGet, server::string_get as Handler),
        (MsgType::StringSet, server::string_set as Handler),
        (MsgType::BmGetRange, bm_get_range as Handler),
        (MsgType::BmMirrorOcc, bm_mirror_occ as Handler),
        (MsgType::BmMirrorFree, bm_mirror_free as Handler),
        (MsgType::BmMirrorMultiple, bm_mirror_multiple as Handler),
        (MsgType::BmGetConfidence, bm_get_confidence as Handler),
    ],
    upstream: &[],
};

fn fb_features(count: u8) -> FeatureTable {
    let mut t = FeatureTable::new();
    t.insert(Feature::new(FeatureId::BmSize.into(), count));
    t.insert(Feature::new(FeatureId::BmOn.into(), 1));
    t.insert(Feature::new(FeatureId::BmSecackAvailable.into(), 1));
    t.insert(Feature::settable(FeatureId::BmSecackOn.into(), 1, to_bool));
    t
}

fn to_bool(_id: u8, requested: u8) -> u8 {
    (requested != 0) as u8
}

fn set_string(text: &str) -> heapless::String<MAX_STRING_SIZE> {
    heapless::String::try_from(text).unwrap_or_default()
}

/// Find or create the hub for a source type below the root.
pub fn ensure_hub(r: &mut Router<'_, '_>, bus: VirtBus) -> Option<NodeId> {
    let uid = hub_uid(bus);
    if let Some(id) = r.nodes.find_by_uid(r.root, &uid) {
        return Some(id);
    }
    let addr = r.nodes.lowest_free_addr(r.root, 64, 255);
    if addr == 0 {
        return None;
    }
    let mut node = Node::new(addr, uid);
    node.flags |= NodeFlags::VIRTUAL;
    node.handlers = &HUB_HANDLERS;
    node.product = set_string(bus.name());
    let root = r.root;
    r.nodes.add_child(root, node).ok()
}

/// Grow or shrink a hub's feedback fleet to `modules` children of
/// `per_module` detectors each, starting at `base` in the global
/// feedback space. Changes announce as `NodeNew`/`NodeLost` under the
/// hub's table version.
pub fn resize(
    r: &mut Router<'_, '_>,
    bus: VirtBus,
    modules: u16,
    per_module: u16,
    base: u16,
) -> Option<NodeId> {
    let hub = ensure_hub(r, bus)?;
    let modules = modules.min(MAX_FB_PER_TYPE);

    // drop surplus children from the tail
    loop {
        let count = r.nodes.child_count(hub) as u16;
        if count <= modules {
            break;
        }
        let last = r.nodes.children(hub).last()?;
        let addr = r.nodes.get(last).local_addr;
        r.nodes.remove(last);
        let version = r.nodes.get_mut(hub).bump_table_version();
        r.reply(hub, MsgType::NodeLost, &[version, addr]);
    }

    // grow with fresh modules at the end
    while (r.nodes.child_count(hub) as u16) < modules {
        let index = r.nodes.child_count(hub) as u16;
        let addr = r.nodes.lowest_free_addr(hub, 1, 255);
        if addr == 0 {
            break;
        }
        let uid = fb_uid(bus, index);
        let mut node = Node::new(addr, uid);
        node.flags |= NodeFlags::VIRTUAL;
        node.handlers = &FB_HANDLERS;
        node.product = set_string(bus.name());
        let vfb = VFeedback::new(base + index * per_module, per_module);
        node.features = fb_features(vfb.count());
        node.private = Some(Private::VFeedback(vfb));
        r.nodes.add_child(hub, node).ok()?;
        let version = r.nodes.get_mut(hub).bump_table_version();
        let mut payload = [0u8; 9];
        payload[0] = version;
        payload[1] = addr;
        payload[2..].copy_from_slice(uid.as_bytes());
        r.reply(hub, MsgType::NodeNew, &payload);
    }
    Some(hub)
}

/// A detector of the global feedback space changed; update the owning
/// virtual node and report the transition upstream.
pub fn feedback_changed(r: &mut Router<'_, '_>, index: u16, occupied: bool) {
    let mut hit: Option<(NodeId, u8)> = None;
    for id in r.nodes.iter() {
        if let Some(vfb) = r.nodes.get(id).vfeedback() {
            let span = vfb.base..vfb.base + vfb.count() as u16;
            if span.contains(&index) {
                hit = Some((id, (index - vfb.base) as u8));
                break;
            }
        }
    }
    let Some((id, detector)) = hit else { return };
    let changed = r
        .nodes
        .get_mut(id)
        .vfeedback_mut()
        .is_some_and(|v| v.set(detector, occupied));
    if changed {
        let opcode = if occupied { MsgType::BmOcc } else { MsgType::BmFree };
        r.reply(id, opcode, &[detector]);
    }
}

fn fb_nodetab_getall(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.nodes.get_mut(id).tab_cursor = Some(0);
    r.reply(id, MsgType::NodeTabCount, &[1]);
}

fn fb_nodetab_getnext(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let node = r.nodes.get_mut(id);
    match node.tab_cursor.take() {
        Some(0) => {
            let mut payload = [0u8; 9];
            payload[0] = node.table_version;
            payload[2..].copy_from_slice(node.uid.as_bytes());
            r.reply(id, MsgType::NodeTab, &payload);
        }
        _ => r.reply(id, MsgType::NodeNa, &[255]),
    }
}

fn bm_get_range(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    let (begin, end) = match payload {
        [begin, end, ..] => (*begin, *end),
        _ => (0, 255),
    };
    let Some(vfb) = r.nodes.get(id).vfeedback() else { return };
    let mut bits = [0u8; 16];
    let (begin, size, octets) = vfb.pack_range(begin, end, &mut bits);
    let mut reply: Vec<u8, 18> = Vec::new();
    let _ = reply.push(begin);
    let _ = reply.push(size);
    let _ = reply.extend_from_slice(&bits[..octets]);
    r.reply(id, MsgType::BmMultiple, &reply);
}

fn bm_get_confidence(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    // void, freeze, nosignal all clear: the report is valid
    r.reply(id, MsgType::BmConfidence, &[0, 0, 0]);
}

/// The host mirrors an occupied report; replay the detector state if
/// it does not match, otherwise the report is acknowledged.
fn bm_mirror_occ(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    mirror_single(r, id, msg, true);
}

fn bm_mirror_free(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    mirror_single(r, id, msg, false);
}

fn mirror_single(r: &mut Router<'_, '_>, id: NodeId, msg: &Message, claimed: bool) {
    let Some(&detector) = msg.payload().first() else { return };
    let Some(vfb) = r.nodes.get(id).vfeedback() else { return };
    let actual = vfb.get(detector);
    if actual != claimed {
        let opcode = if actual { MsgType::BmOcc } else { MsgType::BmFree };
        r.reply(id, opcode, &[detector]);
    }
}

fn bm_mirror_multiple(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let (begin, size) = (payload[0], payload[1]);
    let Some(vfb) = r.nodes.get(id).vfeedback() else { return };
    let mut disagree = false;
    for i in 0..size.min(128 - begin.min(128)) {
        let detector = begin + i;
        let octet = payload.get(2 + (i as usize) / 8).copied().unwrap_or(0);
        let claimed = octet & (1 << (i % 8)) != 0;
        if vfb.get(detector) != claimed {
            disagree = true;
            break;
        }
    }
    if disagree {
        let mut bits = [0u8; 16];
        let (begin, size, octets) = vfb.pack_range(begin, begin.saturating_add(size), &mut bits);
        let mut reply: Vec<u8, 18> = Vec::new();
        let _ = reply.push(begin);
        let _ = reply.push(size);
        let _ = reply.extend_from_slice(&bits[..octets]);
        r.reply(id, MsgType::BmMultiple, &reply);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bidib_core::addr::AddressStack;
    use bidib_core::cs::{
        AccessoryTime, Backend, BackendEvent, TrackMode,
    };
    use bidib_core::dcc::DriveCommand;
    use bidib_core::time::Instant;
    use bidib_defs::{PomOp, ProgOp};
    use bidib_network::iface::{Egress, NullConfig};
    use bidib_network::node::{NodeSet, NodeStorage};

    struct NullBackend;

    impl bidib_core::cs::SignalControl for NullBackend {
        fn track_mode(&self) -> TrackMode {
            TrackMode::Go
        }
        fn set_track_mode(&mut self, mode: TrackMode) -> TrackMode {
            mode
        }
        fn has_signal(&self) -> bool {
            true
        }
    }
    impl bidib_core::cs::LocoControl for NullBackend {
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
    impl bidib_core::cs::AccessoryControl for NullBackend {
        fn switch(&mut self, _addr: u16, _aspect: u8, _time: Option<AccessoryTime>) -> bool {
            true
        }
    }
    impl bidib_core::cs::ProgTrack for NullBackend {
        fn pom(&mut self, _addr: u16, _op: PomOp, _cv: u32, _data: u8) -> bool {
            true
        }
        fn prog(&mut self, _op: ProgOp, _cv: u16, _data: u8) -> bool {
            true
        }
    }
    impl bidib_core::cs::FeedbackSpace for NullBackend {
        fn set(&mut self, _index: u16, _occupied: bool) {}
        fn get(&self, _index: u16) -> bool {
            false
        }
    }
    impl bidib_core::cs::BoosterMonitor for NullBackend {
        fn current_ma(&self) -> u32 {
            0
        }
        fn voltage_dv(&self) -> u16 {
            160
        }
        fn temperature_c(&self) -> u8 {
            25
        }
    }
    impl Backend for NullBackend {
        fn poll_event(&mut self) -> Option<BackendEvent> {
            None
        }
    }

    fn storage<const N: usize>() -> [NodeStorage; N] {
        core::array::from_fn(|_| NodeStorage::EMPTY)
    }

    fn own_uid() -> Uid {
        Uid::new(0x9D, 0x00, 0x0D, 0xD0, [1, 2, 3])
    }

    macro_rules! ctx {
        ($nodes:ident, $backend:ident, $egress:ident, $config:ident, $r:ident) => {
            let mut $r = Router {
                nodes: &mut $nodes,
                backend: &mut $backend,
                egress: &mut $egress,
                config: &mut $config,
                now: Instant::ZERO,
                root: bidib_network::node::NodeId::default(),
            };
            let root = $r.nodes.iter().next().unwrap();
            $r.root = root;
        };
    }

    #[test]
    fn hub_grows_a_fleet_with_node_new() {
        let mut slots = storage::<16>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);

        let hub = resize(&mut r, VirtBus::S88, 3, 16, 48).unwrap();
        assert_eq!(r.nodes.get(hub).local_addr, 64);
        assert!(r.nodes.get(hub).is_virtual());
        assert_eq!(r.nodes.child_count(hub), 3);
        // bases tile the window
        let bases: std::vec::Vec<u16> = r
            .nodes
            .children(hub)
            .map(|c| r.nodes.get(c).vfeedback().unwrap().base)
            .collect();
        assert_eq!(bases, [48, 64, 80]);

        let mut news = 0;
        while let Some(m) = egress.upstream.pop_front() {
            if m.msg_type() == Some(MsgType::NodeNew) {
                news += 1;
                // stack names the hub below the root
                assert_eq!(m.addr, AddressStack::from_hops(&[64]));
            }
        }
        assert_eq!(news, 3);
    }

    #[test]
    fn shrink_emits_node_lost_and_bumps_version() {
        let mut slots = storage::<16>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);

        let hub = resize(&mut r, VirtBus::S88, 3, 16, 0).unwrap();
        let version_before = r.nodes.get(hub).table_version;
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        let hub = resize(&mut r, VirtBus::S88, 1, 16, 0).unwrap();
        assert_eq!(r.nodes.child_count(hub), 1);
        assert!(r.nodes.get(hub).table_version > version_before);
        let lost: std::vec::Vec<Message> = {
            let mut v = std::vec::Vec::new();
            while let Some(m) = egress.upstream.pop_front() {
                if m.msg_type() == Some(MsgType::NodeLost) {
                    v.push(m);
                }
            }
            v
        };
        assert_eq!(lost.len(), 2);
    }

    #[test]
    fn occupancy_projects_and_reports() {
        let mut slots = storage::<8>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);
        resize(&mut r, VirtBus::S88, 1, 16, 48).unwrap();
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        feedback_changed(&mut r, 53, true);
        let occ = egress.upstream.pop_front().unwrap();
        assert_eq!(occ.msg_type(), Some(MsgType::BmOcc));
        assert_eq!(occ.payload(), &[5]);
        assert_eq!(occ.addr, AddressStack::from_hops(&[64, 1]));

        // the same state twice stays quiet
        ctx!(nodes, backend, egress, config, r);
        feedback_changed(&mut r, 53, true);
        assert!(egress.upstream.is_empty());
        // outside any module nothing happens
        ctx!(nodes, backend, egress, config, r);
        feedback_changed(&mut r, 999, true);
        assert!(egress.upstream.is_empty());
    }

    #[test]
    fn mirrors_ack_or_replay() {
        let mut slots = storage::<8>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);
        resize(&mut r, VirtBus::S88, 1, 16, 0).unwrap();
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        feedback_changed(&mut r, 5, true);
        egress.upstream.clear();

        // a matching mirror is suppressed
        ctx!(nodes, backend, egress, config, r);
        let mirror = Message::new(AddressStack::from_hops(&[64, 1]), MsgType::BmMirrorOcc, &[5]);
        r.downlink(r.root, &mirror);
        assert!(egress.upstream.is_empty());

        // a wrong mirror replays the actual state
        ctx!(nodes, backend, egress, config, r);
        let mirror = Message::new(AddressStack::from_hops(&[64, 1]), MsgType::BmMirrorFree, &[5]);
        r.downlink(r.root, &mirror);
        let replay = egress.upstream.pop_front().unwrap();
        assert_eq!(replay.msg_type(), Some(MsgType::BmOcc));
        assert_eq!(replay.payload(), &[5]);
    }

    #[test]
    fn range_read_returns_packed_bits() {
        let mut slots = storage::<8>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);
        resize(&mut r, VirtBus::S88, 1, 16, 0).unwrap();
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        feedback_changed(&mut r, 3, true);
        feedback_changed(&mut r, 9, true);
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        let get = Message::new(AddressStack::from_hops(&[64, 1]), MsgType::BmGetRange, &[0, 16]);
        r.downlink(r.root, &get);
        let multiple = egress.upstream.pop_front().unwrap();
        assert_eq!(multiple.msg_type(), Some(MsgType::BmMultiple));
        assert_eq!(multiple.payload(), &[0, 16, 0x08, 0x02]);
    }

    #[test]
    fn leaf_node_table_is_a_singleton() {
        let mut slots = storage::<8>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);
        resize(&mut r, VirtBus::S88, 1, 16, 0).unwrap();
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        let stack = AddressStack::from_hops(&[64, 1]);
        r.downlink(r.root, &Message::new(stack, MsgType::NodeTabGetAll, &[]));
        r.downlink(r.root, &Message::new(stack, MsgType::NodeTabGetNext, &[]));
        r.downlink(r.root, &Message::new(stack, MsgType::NodeTabGetNext, &[]));

        let count = egress.upstream.pop_front().unwrap();
        assert_eq!(count.msg_type(), Some(MsgType::NodeTabCount));
        assert_eq!(count.payload(), &[1]);
        let entry = egress.upstream.pop_front().unwrap();
        assert_eq!(entry.msg_type(), Some(MsgType::NodeTab));
        assert_eq!(entry.payload()[1], 0);
        assert_eq!(&entry.payload()[2..], fb_uid(VirtBus::S88, 0).as_bytes());
        let done = egress.upstream.pop_front().unwrap();
        assert_eq!(done.msg_type(), Some(MsgType::NodeNa));
    }

    #[test]
    fn confidence_is_fixed_valid() {
        let mut slots = storage::<8>();
        let mut nodes = NodeSet::new(&mut slots[..]);
        nodes.add(Node::new(0, own_uid()));
        let mut backend = NullBackend;
        let mut egress = Egress::new();
        let mut config = NullConfig;
        ctx!(nodes, backend, egress, config, r);
        resize(&mut r, VirtBus::S88, 1, 16, 0).unwrap();
        egress.upstream.clear();

        ctx!(nodes, backend, egress, config, r);
        let get = Message::new(
            AddressStack::from_hops(&[64, 1]),
            MsgType::BmGetConfidence,
            &[],
        );
        r.downlink(r.root, &get);
        let conf = egress.upstream.pop_front().unwrap();
        assert_eq!(conf.msg_type(), Some(MsgType::BmConfidence));
        assert_eq!(conf.payload(), &[0, 0, 0]);
    }
}
