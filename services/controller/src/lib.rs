#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! The controller side: commissioning attached nodes.

Fresh bus nodes run the enumeration ladder (magic, protocol version,
features, strings, software version, for hubs the node table) before
`SysEnable` releases them into normal operation. Progress lives in the
node records; this service owns only the event queue and the
deadlines.

Under external control the same child nodes switch to the sniffer
tables: upstream answers still refresh the local cache, but nothing is
commissioned and nothing is mirrored.
*/

use heapless::{Deque, Vec};

use bidib_core::feature::FeatureTable;
use bidib_core::time::Duration;
use bidib_core::uid::Uid;
use bidib_defs::{
    ErrorCode, FeatureId, MsgType, BIDIB_BOOT_MAGIC, BIDIB_SYS_MAGIC, MAX_STRING_SIZE,
};
use bidib_network::iface::Router;
use bidib_network::node::{
    Commissioning, Handler, HandlerTable, Node, NodeId, NodeSet, SeqStatus,
};
use bidib_network::subbus::SubBusError;
use bidib_network::wire::Message;

const T_MAGIC: Duration = Duration::from_secs(3);
const T_TABLE: Duration = Duration::from_millis(250);
const T_STEP: Duration = Duration::from_millis(100);

/// Magic attempts per cycle; the third timeout sends a reset and the
/// count starts over.
const MAGIC_RESET_AT: u8 = 3;

/// Unanswered reset cycles before the node counts as unrecoverable.
const MAGIC_RESET_CYCLES: u8 = 2;

/// What the link layer feeds into the controller.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// An upstream message from the sub-bus node at `addr`.
    Rx { addr: u8, msg: Message },
    /// A node passed logon and already sits in the tree.
    NodeAdded { addr: u8 },
    /// A node disappeared; the tree record is already gone.
    NodeLost { addr: u8 },
    /// A link fault attributable to `addr` (0 = the bus itself).
    BusError { addr: u8, kind: SubBusError },
}

/// Upstream handlers of a commissioned sub-bus node.
pub static CHILD_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[],
    upstream: &[
        (MsgType::SysMagic, up_sys_magic as Handler),
        (MsgType::SysPVersion, up_sys_p_version as Handler),
        (MsgType::FeatureCount, up_feature_count as Handler),
        (MsgType::Feature, up_feature as Handler),
        (MsgType::FeatureNa, up_feature_na as Handler),
        (MsgType::String, up_string as Handler),
        (MsgType::SysSwVersion, up_sys_sw_version as Handler),
        (MsgType::NodeTabCount, up_nodetab_count as Handler),
        (MsgType::NodeTab, up_nodetab as Handler),
        (MsgType::NodeNew, up_node_new as Handler),
        (MsgType::NodeLost, up_node_lost as Handler),
        (MsgType::SysError, up_sys_error as Handler),
        (MsgType::BmOcc, up_bm_occ as Handler),
        (MsgType::BmFree, up_bm_free as Handler),
        (MsgType::BmMultiple, up_bm_multiple as Handler),
    ],
};

/// Upstream handlers while a remote controller runs the show: cache
/// updates only, no requests, no mirrors.
pub static SNIFF_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[],
    upstream: &[
        (MsgType::FeatureCount, sn_feature_count as Handler),
        (MsgType::Feature, sn_feature as Handler),
        (MsgType::String, sn_string as Handler),
        (MsgType::NodeTab, sn_nodetab as Handler),
        (MsgType::NodeNew, sn_node_new as Handler),
        (MsgType::NodeLost, sn_node_lost as Handler),
        (MsgType::SysError, up_sys_error as Handler),
        (MsgType::BmOcc, sn_bm_occ as Handler),
        (MsgType::BmFree, sn_bm_free as Handler),
        (MsgType::BmMultiple, sn_bm_multiple as Handler),
    ],
};

/// Swap every physical node below the root between the controller and
/// the sniffer tables.
pub fn apply_handlers(nodes: &mut NodeSet<'_>, root: NodeId, sniff: bool) {
    let table = if sniff { &SNIFF_HANDLERS } else { &CHILD_HANDLERS };
    let mut ids: Vec<NodeId, 128> = Vec::new();
    collect_physical(nodes, root, &mut ids);
    for id in ids {
        nodes.get_mut(id).handlers = table;
    }
}

fn collect_physical(nodes: &NodeSet<'_>, at: NodeId, out: &mut Vec<NodeId, 128>) {
    for child in nodes.children(at) {
        if nodes.get(child).is_virtual() {
            continue;
        }
        let _ = out.push(child);
        collect_physical(nodes, child, out);
    }
}

/// The commissioning service.
#[derive(Default)]
pub struct Controller {
    queue: Deque<ControllerEvent, 32>,
}

impl Controller {
    pub fn new() -> Controller {
        Controller::default()
    }

    /// Hand an event to the controller; false when the queue is full.
    pub fn push(&mut self, event: ControllerEvent) -> bool {
        self.queue.push_back(event).is_ok()
    }

    /// Work the event queue in arrival order, then the deadlines.
    pub fn poll(&mut self, r: &mut Router<'_, '_>) {
        while let Some(event) = self.queue.pop_front() {
            match event {
                ControllerEvent::Rx { addr, msg } => {
                    let Some(child) = r.nodes.child_by_addr(r.root, addr) else {
                        continue;
                    };
                    if r.ingest_upstream(child, &msg) == SeqStatus::Mismatch {
                        requery(r, child);
                    }
                }
                ControllerEvent::NodeAdded { addr } => {
                    if let Some(child) = r.nodes.child_by_addr(r.root, addr) {
                        start_commissioning(r, child);
                    }
                }
                ControllerEvent::NodeLost { .. } => {}
                ControllerEvent::BusError { addr, kind } => {
                    let id = r
                        .nodes
                        .child_by_addr(r.root, addr)
                        .unwrap_or(r.root);
                    r.nodes.get_mut(id).error = kind.code();
                }
            }
        }
        self.check_deadlines(r);
    }

    fn check_deadlines(&mut self, r: &mut Router<'_, '_>) {
        let mut due: Vec<NodeId, 128> = Vec::new();
        for id in r.nodes.iter() {
            let node = r.nodes.get(id);
            if matches!(
                node.state,
                Commissioning::Idle | Commissioning::Failed | Commissioning::BootMode
            ) {
                continue;
            }
            if node.deadline.is_some_and(|d| r.now >= d) {
                let _ = due.push(id);
            }
        }
        for id in due {
            step_timeout(r, id);
        }
    }
}

/// Kick a freshly admitted node through the ladder. The disable goes
/// out with sequence zero so both sides start their counters over.
pub fn start_commissioning(r: &mut Router<'_, '_>, id: NodeId) {
    let node = r.nodes.get_mut(id);
    node.reset_seq();
    node.resets = 0;
    r.send_down_seq(id, MsgType::SysDisable, &[], 0);
    goto(r, id, Commissioning::GetMagic);
}

fn goto(r: &mut Router<'_, '_>, id: NodeId, state: Commissioning) {
    {
        let node = r.nodes.get_mut(id);
        node.state = state;
        node.retries = 0;
    }
    issue(r, id);
}

/// Transmit the request of the node's current step and arm its
/// deadline.
fn issue(r: &mut Router<'_, '_>, id: NodeId) {
    let state = r.nodes.get(id).state;
    let timeout = match state {
        Commissioning::GetMagic => {
            r.send_down(id, MsgType::SysGetMagic, &[]);
            T_MAGIC
        }
        Commissioning::GetPVersion => {
            r.send_down(id, MsgType::SysGetPVersion, &[]);
            T_STEP
        }
        Commissioning::AutoReadFeatures => {
            r.send_down(id, MsgType::FeatureGetAll, &[1]);
            T_STEP
        }
        Commissioning::ReadFeatures => {
            r.send_down(id, MsgType::FeatureGetNext, &[]);
            T_STEP
        }
        Commissioning::GetProdString => {
            r.send_down(id, MsgType::StringGet, &[0, 0]);
            T_STEP
        }
        Commissioning::GetUserName => {
            r.send_down(id, MsgType::StringGet, &[0, 1]);
            T_STEP
        }
        Commissioning::GetSwVersion => {
            r.send_down(id, MsgType::SysGetSwVersion, &[]);
            T_STEP
        }
        Commissioning::ReadNtabCount => {
            r.send_down(id, MsgType::NodeTabGetAll, &[]);
            T_TABLE
        }
        Commissioning::ReadNodeTab => {
            r.send_down(id, MsgType::NodeTabGetNext, &[]);
            T_TABLE
        }
        _ => return,
    };
    r.nodes.get_mut(id).deadline = Some(r.now + timeout);
}

fn step_timeout(r: &mut Router<'_, '_>, id: NodeId) {
    let (state, retries) = {
        let node = r.nodes.get_mut(id);
        node.retries += 1;
        (node.state, node.retries)
    };
    match state {
        Commissioning::GetMagic if retries >= MAGIC_RESET_AT => {
            let node = r.nodes.get_mut(id);
            node.retries = 0;
            if node.resets >= MAGIC_RESET_CYCLES {
                node.state = Commissioning::Failed;
                node.deadline = None;
                return;
            }
            node.resets += 1;
            r.send_down_seq(id, MsgType::SysReset, &[], 0);
            issue(r, id);
        }
        // a node that never streamed gets polled feature by feature
        Commissioning::AutoReadFeatures => {
            r.nodes.get_mut(id).state = Commissioning::ReadFeatures;
            issue(r, id);
        }
        _ => issue(r, id),
    }
}

/// Sequence slipped: read the volatile parts again.
fn requery(r: &mut Router<'_, '_>, id: NodeId) {
    match r.nodes.get(id).state {
        Commissioning::Idle => {
            let state = if r.nodes.get(id).uid.is_bridge() {
                Commissioning::ReadNtabCount
            } else {
                Commissioning::AutoReadFeatures
            };
            goto(r, id, state);
        }
        Commissioning::Failed | Commissioning::BootMode => {}
        _ => issue(r, id),
    }
}

fn after_features(r: &mut Router<'_, '_>, id: NodeId) {
    let has_strings = r
        .nodes
        .get(id)
        .features
        .get(FeatureId::StringSize.into())
        .unwrap_or(0)
        > 0;
    let state = if has_strings {
        Commissioning::GetProdString
    } else {
        Commissioning::GetSwVersion
    };
    goto(r, id, state);
}

/// The ladder is done: release the node.
fn finish(r: &mut Router<'_, '_>, id: NodeId) {
    r.send_down_seq(id, MsgType::SysEnable, &[], 0);
    let node = r.nodes.get_mut(id);
    node.state = Commissioning::Idle;
    node.deadline = None;
    node.retries = 0;
}

// --- commissioning handlers -------------------------------------------

fn up_sys_magic(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    if r.nodes.get(id).state != Commissioning::GetMagic {
        return;
    }
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    match u16::from_le_bytes([payload[0], payload[1]]) {
        BIDIB_SYS_MAGIC => goto(r, id, Commissioning::GetPVersion),
        BIDIB_BOOT_MAGIC => {
            let node = r.nodes.get_mut(id);
            node.state = Commissioning::BootMode;
            node.deadline = None;
        }
        _ => {
            let node = r.nodes.get_mut(id);
            node.state = Commissioning::Failed;
            node.deadline = None;
        }
    }
}

fn up_sys_p_version(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() >= 2 {
        r.nodes.get_mut(id).p_version = [payload[0], payload[1]];
    }
    if r.nodes.get(id).state == Commissioning::GetPVersion {
        goto(r, id, Commissioning::AutoReadFeatures);
    }
}

fn up_feature_count(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let Some(&count) = msg.payload().first() else { return };
    {
        let node = r.nodes.get_mut(id);
        node.features = FeatureTable::new();
        node.feature_cursor = count;
    }
    let state = r.nodes.get(id).state;
    if count == 0 {
        if matches!(
            state,
            Commissioning::AutoReadFeatures | Commissioning::ReadFeatures
        ) {
            after_features(r, id);
        }
        return;
    }
    match state {
        Commissioning::ReadFeatures => issue(r, id),
        Commissioning::AutoReadFeatures => {
            r.nodes.get_mut(id).deadline = Some(r.now + T_STEP);
        }
        _ => {}
    }
}

fn up_feature(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let (complete, state) = {
        let node = r.nodes.get_mut(id);
        node.features.store(payload[0], payload[1]);
        node.deadline = Some(r.now + T_STEP);
        (
            node.features.len() >= node.feature_cursor as usize,
            node.state,
        )
    };
    match state {
        Commissioning::AutoReadFeatures | Commissioning::ReadFeatures if complete => {
            after_features(r, id)
        }
        Commissioning::ReadFeatures => issue(r, id),
        _ => {}
    }
}

fn up_feature_na(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    if matches!(
        r.nodes.get(id).state,
        Commissioning::AutoReadFeatures | Commissioning::ReadFeatures
    ) {
        after_features(r, id);
    }
}

fn up_string(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 3 || payload[0] != 0 {
        return;
    }
    let sid = payload[1];
    let size = (payload[2] as usize).min(MAX_STRING_SIZE);
    let mut text: heapless::String<MAX_STRING_SIZE> = heapless::String::new();
    for &b in payload[3..].iter().take(size) {
        if !b.is_ascii() || b == 0 {
            break;
        }
        let _ = text.push(b as char);
    }
    let state = {
        let node = r.nodes.get_mut(id);
        match sid {
            0 => node.product = text,
            1 => node.user = text,
            _ => {}
        }
        node.state
    };
    match (state, sid) {
        (Commissioning::GetProdString, 0) => goto(r, id, Commissioning::GetUserName),
        (Commissioning::GetUserName, 1) => goto(r, id, Commissioning::GetSwVersion),
        _ => {}
    }
}

fn up_sys_sw_version(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() >= 3 {
        r.nodes.get_mut(id).sw_version = [payload[0], payload[1], payload[2]];
    }
    if r.nodes.get(id).state != Commissioning::GetSwVersion {
        return;
    }
    if r.nodes.get(id).uid.is_bridge() {
        goto(r, id, Commissioning::ReadNtabCount);
    } else {
        finish(r, id);
    }
}

fn up_nodetab_count(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    if r.nodes.get(id).state != Commissioning::ReadNtabCount {
        return;
    }
    let Some(&count) = msg.payload().first() else { return };
    if count == 0 {
        finish(r, id);
        return;
    }
    r.nodes.get_mut(id).tab_cursor = Some(count);
    goto(r, id, Commissioning::ReadNodeTab);
}

fn up_nodetab(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 9 {
        return;
    }
    let (version, addr) = (payload[0], payload[1]);
    let uid = Uid::from_bytes(&payload[2..9]);
    r.nodes.get_mut(id).table_version = version;

    // address zero is the hub itself
    if addr != 0 && r.nodes.child_by_addr(id, addr).is_none() {
        let mut node = Node::new(addr, uid);
        node.handlers = &CHILD_HANDLERS;
        if let Ok(child) = r.nodes.add_child(id, node) {
            start_commissioning(r, child);
        }
    }

    if r.nodes.get(id).state != Commissioning::ReadNodeTab {
        return;
    }
    let remaining = r.nodes.get(id).tab_cursor.unwrap_or(1).saturating_sub(1);
    if remaining == 0 {
        r.nodes.get_mut(id).tab_cursor = None;
        finish(r, id);
    } else {
        r.nodes.get_mut(id).tab_cursor = Some(remaining);
        issue(r, id);
    }
}

fn up_node_new(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 9 {
        return;
    }
    let (version, addr) = (payload[0], payload[1]);
    let uid = Uid::from_bytes(&payload[2..9]);
    r.nodes.get_mut(id).table_version = version;
    r.send_down(id, MsgType::NodeChangedAck, &[version]);
    if r.nodes.child_by_addr(id, addr).is_none() {
        let mut node = Node::new(addr, uid);
        node.handlers = &CHILD_HANDLERS;
        if let Ok(child) = r.nodes.add_child(id, node) {
            start_commissioning(r, child);
        }
    }
}

fn up_node_lost(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let (version, addr) = (payload[0], payload[1]);
    r.nodes.get_mut(id).table_version = version;
    r.send_down(id, MsgType::NodeChangedAck, &[version]);
    if let Some(child) = r.nodes.child_by_addr(id, addr) {
        r.nodes.remove(child);
    }
}

fn up_sys_error(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let code = msg.payload().first().copied().unwrap_or(0);
    r.nodes.get_mut(id).error = ErrorCode::from(code);
}

// --- occupancy projection ---------------------------------------------

fn up_bm_occ(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    project_single(r, id, msg, true);
}

fn up_bm_free(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    project_single(r, id, msg, false);
}

fn project_single(r: &mut Router<'_, '_>, id: NodeId, msg: &Message, occupied: bool) {
    let Some(&detector) = msg.payload().first() else { return };
    let Some(base) = r.nodes.get(id).feedback_base() else { return };
    r.backend.set(base + detector as u16, occupied);
    let mirror = if occupied {
        MsgType::BmMirrorOcc
    } else {
        MsgType::BmMirrorFree
    };
    r.send_down(id, mirror, &[detector]);
}

fn up_bm_multiple(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let Some(base) = r.nodes.get(id).feedback_base() else { return };
    let (start, size) = (payload[0], payload[1]);
    for i in 0..size {
        let octet = payload.get(2 + (i as usize) / 8).copied().unwrap_or(0);
        let occupied = octet & (1 << (i % 8)) != 0;
        r.backend
            .set(base + start as u16 + i as u16, occupied);
    }
    let mut echo: Vec<u8, 32> = Vec::new();
    let _ = echo.extend_from_slice(payload);
    r.send_down(id, MsgType::BmMirrorMultiple, &echo);
}

// --- sniffer ----------------------------------------------------------

fn sn_feature_count(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    if let Some(&count) = msg.payload().first() {
        let node = r.nodes.get_mut(id);
        node.features = FeatureTable::new();
        node.feature_cursor = count;
    }
}

fn sn_feature(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() >= 2 {
        r.nodes.get_mut(id).features.store(payload[0], payload[1]);
    }
}

fn sn_string(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 3 || payload[0] != 0 {
        return;
    }
    let size = (payload[2] as usize).min(MAX_STRING_SIZE);
    let mut text: heapless::String<MAX_STRING_SIZE> = heapless::String::new();
    for &b in payload[3..].iter().take(size) {
        if !b.is_ascii() || b == 0 {
            break;
        }
        let _ = text.push(b as char);
    }
    let node = r.nodes.get_mut(id);
    match payload[1] {
        0 => node.product = text,
        1 => node.user = text,
        _ => {}
    }
}

fn sn_nodetab(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    sn_table_entry(r, id, msg);
}

fn sn_node_new(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    sn_table_entry(r, id, msg);
}

fn sn_table_entry(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 9 {
        return;
    }
    let (version, addr) = (payload[0], payload[1]);
    let uid = Uid::from_bytes(&payload[2..9]);
    r.nodes.get_mut(id).table_version = version;
    if addr != 0 && r.nodes.child_by_addr(id, addr).is_none() {
        let mut node = Node::new(addr, uid);
        node.handlers = &SNIFF_HANDLERS;
        let _ = r.nodes.add_child(id, node);
    }
}

fn sn_node_lost(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    r.nodes.get_mut(id).table_version = payload[0];
    if let Some(child) = r.nodes.child_by_addr(id, payload[1]) {
        r.nodes.remove(child);
    }
}

fn sn_bm_occ(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    sniff_single(r, id, msg, true);
}

fn sn_bm_free(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    sniff_single(r, id, msg, false);
}

fn sniff_single(r: &mut Router<'_, '_>, id: NodeId, msg: &Message, occupied: bool) {
    let Some(&detector) = msg.payload().first() else { return };
    let Some(base) = r.nodes.get(id).feedback_base() else { return };
    r.backend.set(base + detector as u16, occupied);
}

fn sn_bm_multiple(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let Some(base) = r.nodes.get(id).feedback_base() else { return };
    let (start, size) = (payload[0], payload[1]);
    for i in 0..size {
        let octet = payload.get(2 + (i as usize) / 8).copied().unwrap_or(0);
        let occupied = octet & (1 << (i % 8)) != 0;
        r.backend
            .set(base + start as u16 + i as u16, occupied);
    }
}
