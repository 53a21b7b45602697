#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Downstream handlers of the station's own nodes.

When a controller (remote over netBiDiB, or the local one for its own
root) addresses this node, the opcode resolves through the node's
handler table into one of the functions here. The generic handlers
(identity, features, strings, node table) are shared with the virtual
nodes; the command-station handlers live on the root alone.
*/

use heapless::Vec;

use bidib_core::addr::AddressStack;
use bidib_core::cs::{AccessoryTime, BackendEvent, TrackMode};
use bidib_core::dcc::{current_to_code, DriveCommand};
use bidib_core::feature::{Feature, FeatureTable};
use bidib_core::time::{Duration, Instant};
use bidib_defs::{
    CsState, ErrorCode, FeatureId, MsgType, PomOp, ProgOp, ProgState, BIDIB_SYS_MAGIC,
    MAX_STRING_SIZE,
};
use bidib_network::iface::Router;
use bidib_network::node::{Handler, HandlerTable, NodeFlags, NodeId};
use bidib_network::wire::Message;

/// Handler table of the station root.
pub static ROOT_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[
        (MsgType::SysGetMagic, sys_get_magic as Handler),
        (MsgType::SysGetPVersion, sys_get_p_version as Handler),
        (MsgType::SysGetUniqueId, sys_get_unique_id as Handler),
        (MsgType::SysGetSwVersion, sys_get_sw_version as Handler),
        (MsgType::SysPing, sys_ping as Handler),
        (MsgType::LocalPing, local_ping as Handler),
        (MsgType::SysIdentify, sys_identify as Handler),
        (MsgType::SysReset, sys_reset as Handler),
        (MsgType::SysEnable, sys_enable as Handler),
        (MsgType::SysDisable, sys_disable as Handler),
        (MsgType::SysGetError, sys_get_error as Handler),
        (MsgType::GetPktCapacity, get_pkt_capacity as Handler),
        (MsgType::NodeTabGetAll, nodetab_getall as Handler),
        (MsgType::NodeTabGetNext, nodetab_getnext as Handler),
        (MsgType::FeatureGetAll, feature_getall as Handler),
        (MsgType::FeatureGetNext, feature_getnext as Handler),
        (MsgType::FeatureGet, feature_get as Handler),
        (MsgType::FeatureSet, feature_set as Handler),
        (MsgType::StringGet, string_get as Handler),
        (MsgType::StringSet, string_set as Handler),
        (MsgType::BmGetConfidence, bm_get_confidence as Handler),
        (MsgType::BoostOff, boost_off as Handler),
        (MsgType::BoostOn, boost_on as Handler),
        (MsgType::BoostQuery, boost_query as Handler),
        (MsgType::CsSetState, cs_set_state as Handler),
        (MsgType::CsDrive, cs_drive as Handler),
        (MsgType::CsAccessory, cs_accessory as Handler),
        (MsgType::CsPom, cs_pom as Handler),
        (MsgType::CsQuery, cs_query as Handler),
        (MsgType::CsProg, cs_prog as Handler),
    ],
    upstream: &[],
};

/// Feature array of the station root.
pub fn root_features() -> FeatureTable {
    let mut t = FeatureTable::new();
    t.insert(Feature::new(FeatureId::BstVoltAdjustable.into(), 1));
    t.insert(Feature::settable(FeatureId::BstVolt.into(), 160, clamp_volt));
    t.insert(Feature::new(FeatureId::BstAmpereAdjustable.into(), 1));
    t.insert(Feature::settable(
        FeatureId::BstAmpere.into(),
        current_to_code(6500),
        accept,
    ));
    t.insert(Feature::settable(
        FeatureId::BstCurmeasInterval.into(),
        100,
        clamp_curmeas,
    ));
    t.insert(Feature::new(FeatureId::GenDriveAck.into(), 1));
    t.insert(Feature::new(FeatureId::GenSwitchAck.into(), 1));
    t.insert(Feature::settable(FeatureId::GenPomRepeat.into(), 3, clamp_pom_repeat));
    t.insert(Feature::settable(FeatureId::GenStartState.into(), 0, to_bool));
    t.insert(Feature::settable(FeatureId::GenWatchdog.into(), 0, accept));
    t.insert(Feature::new(FeatureId::StringSize.into(), MAX_STRING_SIZE as u8));
    t.insert(Feature::new(FeatureId::RelevantPidBits.into(), 16));
    t
}

fn accept(_id: u8, requested: u8) -> u8 {
    requested
}

fn to_bool(_id: u8, requested: u8) -> u8 {
    (requested != 0) as u8
}

fn clamp_volt(_id: u8, requested: u8) -> u8 {
    requested.clamp(80, 220)
}

/// Units of 10 ms, minimum 100 ms, 0 disables.
fn clamp_curmeas(_id: u8, requested: u8) -> u8 {
    if requested == 0 {
        0
    } else {
        requested.max(10)
    }
}

fn clamp_pom_repeat(_id: u8, requested: u8) -> u8 {
    requested.clamp(1, 4)
}

// --- identity ---------------------------------------------------------

pub fn sys_get_magic(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.reply(
        id,
        MsgType::SysMagic,
        &BIDIB_SYS_MAGIC.to_le_bytes(),
    );
}

pub fn sys_get_p_version(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let version = r.nodes.get(id).p_version;
    r.reply(id, MsgType::SysPVersion, &version);
}

pub fn sys_get_unique_id(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let uid = r.nodes.get(id).uid;
    r.reply(id, MsgType::SysUniqueId, uid.as_bytes());
}

pub fn sys_get_sw_version(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let version = r.nodes.get(id).sw_version;
    r.reply(id, MsgType::SysSwVersion, &version);
}

pub fn sys_ping(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let token = msg.payload().first().copied().unwrap_or(0);
    r.reply(id, MsgType::SysPong, &[token]);
}

pub fn local_ping(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.reply(id, MsgType::LocalPong, &[]);
}

pub fn sys_identify(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let on = msg.payload().first().copied().unwrap_or(0) != 0;
    let node = r.nodes.get_mut(id);
    node.flags.set(NodeFlags::IDENTIFY, on);
    r.reply(id, MsgType::SysIdentifyState, &[on as u8]);
}

fn sys_reset(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let node = r.nodes.get_mut(id);
    node.reset_seq();
    node.flags.remove(NodeFlags::SYS_DISABLED | NodeFlags::IDENTIFY);
    node.error = ErrorCode::None;
}

pub fn sys_enable(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.nodes.get_mut(id).flags.remove(NodeFlags::SYS_DISABLED);
}

pub fn sys_disable(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.nodes.get_mut(id).flags.insert(NodeFlags::SYS_DISABLED);
}

pub fn sys_get_error(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let code = r.nodes.get(id).error;
    r.nodes.get_mut(id).error = ErrorCode::None;
    r.reply(id, MsgType::SysError, &[code.into()]);
}

fn get_pkt_capacity(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.reply(id, MsgType::PktCapacity, &[64]);
}

fn bm_get_confidence(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    r.reply(id, MsgType::BmConfidence, &[0, 0, 0]);
}

// --- node table -------------------------------------------------------

/// The node table of any node lists itself at address zero, then its
/// children.
pub fn nodetab_getall(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let count = 1 + r.nodes.child_count(id) as u8;
    r.nodes.get_mut(id).tab_cursor = Some(0);
    r.reply(id, MsgType::NodeTabCount, &[count]);
}

pub fn nodetab_getnext(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let cursor = r.nodes.get(id).tab_cursor;
    let Some(cursor) = cursor else {
        r.reply(id, MsgType::NodeNa, &[255]);
        return;
    };
    let version = r.nodes.get(id).table_version;
    let entry = if cursor == 0 {
        Some((0, r.nodes.get(id).uid))
    } else {
        r.nodes
            .children(id)
            .nth(cursor as usize - 1)
            .map(|c| (r.nodes.get(c).local_addr, r.nodes.get(c).uid))
    };
    match entry {
        Some((addr, uid)) => {
            let mut payload = [0u8; 9];
            payload[0] = version;
            payload[1] = addr;
            payload[2..].copy_from_slice(uid.as_bytes());
            r.nodes.get_mut(id).tab_cursor = Some(cursor + 1);
            r.reply(id, MsgType::NodeTab, &payload);
        }
        None => {
            r.nodes.get_mut(id).tab_cursor = None;
            r.reply(id, MsgType::NodeNa, &[255]);
        }
    }
}

// --- features ---------------------------------------------------------

pub fn feature_getall(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let stream = msg.payload().first().is_some_and(|b| b & 1 != 0);
    let node = r.nodes.get_mut(id);
    node.feature_cursor = 0;
    let count = node.features.len() as u8;
    let mut listed: Vec<(u8, u8), { bidib_core::feature::MAX_FEATURES }> = Vec::new();
    if stream {
        for f in node.features.iter() {
            let _ = listed.push((f.id, f.value));
        }
        node.feature_cursor = count;
    }
    r.reply(id, MsgType::FeatureCount, &[count]);
    for (fid, value) in listed {
        r.reply(id, MsgType::Feature, &[fid, value]);
    }
}

pub fn feature_getnext(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let node = r.nodes.get_mut(id);
    let cursor = node.feature_cursor as usize;
    match node.features.nth(cursor) {
        Some(f) => {
            let entry = [f.id, f.value];
            node.feature_cursor += 1;
            r.reply(id, MsgType::Feature, &entry);
        }
        None => r.reply(id, MsgType::FeatureNa, &[255]),
    }
}

pub fn feature_get(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let Some(&fid) = msg.payload().first() else { return };
    match r.nodes.get(id).features.get(fid) {
        Some(value) => r.reply(id, MsgType::Feature, &[fid, value]),
        None => r.reply(id, MsgType::FeatureNa, &[fid]),
    }
}

pub fn feature_set(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let (fid, requested) = (payload[0], payload[1]);
    let node = r.nodes.get_mut(id);
    match node.features.set(fid, requested) {
        Some(accepted) => {
            if node.is_virtual() {
                let uid = node.uid;
                r.config.feature_changed(&uid, fid, accepted);
            }
            r.reply(id, MsgType::Feature, &[fid, accepted]);
        }
        None => r.reply(id, MsgType::FeatureNa, &[fid]),
    }
}

// --- strings ----------------------------------------------------------

fn string_reply(r: &mut Router<'_, '_>, id: NodeId, ns: u8, sid: u8, text: &str) {
    let mut payload: Vec<u8, { 3 + MAX_STRING_SIZE }> = Vec::new();
    let _ = payload.push(ns);
    let _ = payload.push(sid);
    let _ = payload.push(text.len() as u8);
    let _ = payload.extend_from_slice(text.as_bytes());
    r.reply(id, MsgType::String, &payload);
}

pub fn string_get(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 2 {
        return;
    }
    let (ns, sid) = (payload[0], payload[1]);
    if ns != 0 {
        string_reply(r, id, ns, sid, "");
        return;
    }
    let text = match sid {
        0 => r.nodes.get(id).product.clone(),
        1 => r.nodes.get(id).user.clone(),
        _ => heapless::String::new(),
    };
    string_reply(r, id, 0, sid, &text);
}

pub fn string_set(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 3 {
        return;
    }
    let (ns, sid, size) = (payload[0], payload[1], payload[2] as usize);
    if ns == 0 && sid == 1 {
        let mut user: heapless::String<MAX_STRING_SIZE> = heapless::String::new();
        for &b in payload[3..].iter().take(size.min(MAX_STRING_SIZE)) {
            if !b.is_ascii() || b == 0 {
                break;
            }
            let _ = user.push(b as char);
        }
        let node = r.nodes.get_mut(id);
        node.user = user.clone();
        let uid = node.uid;
        r.config.user_changed(&uid, &user);
    }
    // product is read-only; either way report what is stored now
    string_get(r, id, &Message::new(msg.addr, MsgType::StringGet, &[ns, sid]));
}

// --- booster ----------------------------------------------------------

fn boost_off(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let target = match r.backend.track_mode() {
        TrackMode::Go => TrackMode::Stop,
        _ => TrackMode::Off,
    };
    let reached = r.backend.set_track_mode(target);
    r.reply(id, MsgType::BoostStat, &[reached.boost_state().into()]);
}

fn boost_on(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    if !r.backend.has_signal() {
        r.reply(
            id,
            MsgType::BoostStat,
            &[bidib_defs::BoostState::OffNoDcc.into()],
        );
        return;
    }
    let reached = r.backend.set_track_mode(TrackMode::Go);
    r.reply(id, MsgType::BoostStat, &[reached.boost_state().into()]);
}

fn boost_query(r: &mut Router<'_, '_>, id: NodeId, _msg: &Message) {
    let state = r.backend.track_mode().boost_state();
    r.reply(id, MsgType::BoostStat, &[state.into()]);
    emit_diagnostic(r, id);
}

fn emit_diagnostic(r: &mut Router<'_, '_>, id: NodeId) {
    let current = current_to_code(r.backend.current_ma());
    let voltage = r.backend.voltage_dv().min(255) as u8;
    let temperature = r.backend.temperature_c();
    r.reply(
        id,
        MsgType::BoostDiagnostic,
        &[0, current, 1, voltage, 2, temperature],
    );
}

// --- command station --------------------------------------------------

fn cs_set_state(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let Some(&code) = msg.payload().first() else { return };
    let requested = CsState::from(code);
    let reached = match TrackMode::from_cs_state(requested) {
        Some(mode) => r.backend.set_track_mode(mode),
        None => r.backend.track_mode(),
    };
    r.reply(id, MsgType::CsState, &[reached.cs_state().into()]);
}

fn cs_drive(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    let Some(cmd) = DriveCommand::from_bytes(payload) else {
        if payload.len() >= 2 {
            r.reply(id, MsgType::CsDriveAck, &[payload[0], payload[1], 0]);
        }
        return;
    };
    let ack = r.backend.track_mode() == TrackMode::Go && r.backend.drive(&cmd);
    r.reply(
        id,
        MsgType::CsDriveAck,
        &[payload[0], payload[1], ack as u8],
    );
}

fn cs_accessory(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 3 {
        return;
    }
    let addr = u16::from_le_bytes([payload[0], payload[1]]);
    let data = payload[2];
    let aspect = if data & 0x80 != 0 { data & 0x7F } else { data & 0x1F };
    let time = payload.get(3).map(|&t| AccessoryTime::from_byte(t));
    let ack = r.backend.switch(addr, aspect, time);
    r.reply(
        id,
        MsgType::CsAccessoryAck,
        &[payload[0], payload[1], ack as u8],
    );
}

fn cs_pom(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 10 {
        return;
    }
    let addr = u16::from_le_bytes([payload[0], payload[1]]);
    let cv = u32::from_le_bytes([payload[6], payload[7], payload[8], 0]);
    let data = payload[9];
    // extended and manufacturer-addressed variants acknowledge 0
    let ack = match PomOp::try_from(payload[5]) {
        Ok(op @ (PomOp::RdBlock | PomOp::RdByte | PomOp::WrBit | PomOp::WrByte)) => {
            r.backend.pom(addr, op, cv, data)
        }
        _ => false,
    };
    r.reply(
        id,
        MsgType::CsPomAck,
        &[payload[0], payload[1], payload[2], payload[3], ack as u8],
    );
}

fn cs_query(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    let Some(&what) = payload.first() else { return };
    if what & 1 == 0 {
        return;
    }
    if payload.len() >= 3 {
        let addr = u16::from_le_bytes([payload[1], payload[2]]);
        let state = r.backend.loco_state_by_addr(addr).unwrap_or(DriveCommand {
            addr,
            ..DriveCommand::default()
        });
        r.reply(id, MsgType::CsDriveState, &state.to_bytes());
    } else {
        // whole-list reports stream from the service poll
        r.nodes.get_mut(id).query_cursor = Some(0);
    }
}

fn cs_prog(r: &mut Router<'_, '_>, id: NodeId, msg: &Message) {
    let payload = msg.payload();
    if payload.len() < 4 {
        return;
    }
    let op = ProgOp::from(payload[0]);
    let cv = u16::from_le_bytes([payload[1], payload[2]]);
    let data = payload[3];
    let started = r.backend.prog(op, cv, data);
    let state = if started {
        ProgState::Running
    } else {
        ProgState::Stopped
    };
    r.reply(
        id,
        MsgType::CsProgState,
        &[state.into(), 0, payload[1], payload[2], data],
    );
}

/// Streamed drive-state reports per poll; keeps the upstream queue
/// shallow.
const QUERY_BURST: usize = 4;

/// The station-side service: backend completions, drive-state
/// streaming and the periodic booster diagnostic.
#[derive(Default)]
pub struct Server {
    next_diag: Option<Instant>,
}

impl Server {
    pub fn new() -> Server {
        Server::default()
    }

    pub fn poll(&mut self, r: &mut Router<'_, '_>) {
        let root = r.root;

        while let Some(event) = r.backend.poll_event() {
            match event {
                BackendEvent::PomCv { addr, cv, value } => {
                    let a = addr.to_le_bytes();
                    let c = cv.to_le_bytes();
                    r.reply(root, MsgType::BmCv, &[a[0], a[1], c[0], c[1], value]);
                }
                BackendEvent::Prog { state, cv, value } => {
                    let c = cv.to_le_bytes();
                    r.reply(
                        root,
                        MsgType::CsProgState,
                        &[state.into(), 0, c[0], c[1], value],
                    );
                }
                BackendEvent::TrackMode(mode) => {
                    r.reply(root, MsgType::CsState, &[mode.cs_state().into()]);
                    // stop and go reach the whole bus as booster state
                    let opcode = if mode == TrackMode::Go {
                        MsgType::BoostOn
                    } else {
                        MsgType::BoostOff
                    };
                    let bc = Message::new(AddressStack::SELF, opcode, &[0]);
                    r.downlink(root, &bc);
                }
            }
        }

        if let Some(cursor) = r.nodes.get(root).query_cursor {
            let mut cursor = cursor;
            for _ in 0..QUERY_BURST {
                match r.backend.loco_state(cursor as usize) {
                    Some(state) => {
                        r.reply(root, MsgType::CsDriveState, &state.to_bytes());
                        cursor += 1;
                    }
                    None => {
                        r.nodes.get_mut(root).query_cursor = None;
                        return self.poll_diag(r);
                    }
                }
            }
            r.nodes.get_mut(root).query_cursor = Some(cursor);
        }

        self.poll_diag(r);
    }

    fn poll_diag(&mut self, r: &mut Router<'_, '_>) {
        let root = r.root;
        let interval = r
            .nodes
            .get(root)
            .features
            .get(FeatureId::BstCurmeasInterval.into())
            .unwrap_or(0);
        if interval == 0 || r.nodes.get(root).flags.contains(NodeFlags::SYS_DISABLED) {
            self.next_diag = None;
            return;
        }
        let period = Duration::from_millis((interval as u64) * 10).max(Duration::from_millis(100));
        match self.next_diag {
            None => self.next_diag = Some(r.now + period),
            Some(at) if r.now >= at => {
                emit_diagnostic(r, root);
                self.next_diag = Some(r.now + period);
            }
            Some(_) => {}
        }
    }
}
