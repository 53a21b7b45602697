/*! The persisted station state.

One ini-structured document holds the global settings, every virtual
node with its settable features, the trusted netBiDiB clients, and the
short-uid-to-feedback-base map. Parsing accepts missing sections and
skips unknown keys, so documents written by newer firmware load fine.
*/

use core::fmt::Write as _;

use embedded_storage::Storage as StorageDriver;
use heapless::{String, Vec};

use bidib_core::uid::Uid;
use bidib_defs::{MAX_STRING_SIZE, NETBIDIB_PORT};

use crate::ini::{lines, Line};

/// State that can be blanked back to factory defaults.
pub trait Storage {
    fn wipe(&mut self);
}

/// A model bound to a backing store.
///
/// `load` runs once before anything reads the model; mutations mark
/// it dirty; the station decides when a `flush` writes the document
/// back out.
pub trait PersistentStorage {
    fn load(&mut self);

    fn is_dirty(&self) -> bool;

    /// Write back if anything changed since the last flush.
    fn flush(&mut self);

    /// Write back regardless of the dirty state.
    fn force_flush(&mut self);
}

pub const MAX_VNODES: usize = 16;
pub const MAX_CLIENTS: usize = 16;
pub const MAX_FB_MAP: usize = 32;
pub const MAX_VNODE_FEATURES: usize = 8;

/// Size of the serialised document, terminator included.
pub const DOC_SIZE: usize = 2048;

type Str = String<MAX_STRING_SIZE>;

/// Stored state of one virtual node.
#[derive(Debug, Clone, Default)]
pub struct VirtualNodeConfig {
    pub uid: Uid,
    pub user: Str,
    pub features: Vec<(u8, u8), MAX_VNODE_FEATURES>,
}

/// One remembered pairing.
#[derive(Debug, Clone, Default)]
pub struct TrustedClient {
    pub uid: Uid,
    pub product: Str,
    pub user: Str,
}

/// The whole persisted model, with change tracking.
pub struct StationConfig {
    pub port: u16,
    pub user: Str,
    vnodes: Vec<VirtualNodeConfig, MAX_VNODES>,
    clients: Vec<TrustedClient, MAX_CLIENTS>,
    fb_map: Vec<(Uid, u16), MAX_FB_MAP>,
    dirty: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StationConfig {
    pub fn new() -> StationConfig {
        StationConfig {
            port: NETBIDIB_PORT,
            user: String::new(),
            vnodes: Vec::new(),
            clients: Vec::new(),
            fb_map: Vec::new(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn set_port(&mut self, port: u16) {
        if self.port != port {
            self.port = port;
            self.dirty = true;
        }
    }

    pub fn set_user(&mut self, user: &str) {
        if self.user.as_str() != user {
            self.user = truncated(user);
            self.dirty = true;
        }
    }

    pub fn clients(&self) -> &[TrustedClient] {
        &self.clients
    }

    pub fn is_trusted(&self, uid: &Uid) -> bool {
        self.clients.iter().any(|c| c.uid.matches_short(uid))
    }

    pub fn trust_add(&mut self, uid: &Uid, product: &str, user: &str) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.uid.matches_short(uid)) {
            client.product = truncated(product);
            client.user = truncated(user);
            self.dirty = true;
            return;
        }
        let _ = self.clients.push(TrustedClient {
            uid: *uid,
            product: truncated(product),
            user: truncated(user),
        });
        self.dirty = true;
    }

    pub fn trust_remove(&mut self, uid: &Uid) {
        let before = self.clients.len();
        self.clients.retain(|c| !c.uid.matches_short(uid));
        if self.clients.len() != before {
            self.dirty = true;
        }
    }

    pub fn vnodes(&self) -> &[VirtualNodeConfig] {
        &self.vnodes
    }

    pub fn vnode(&self, uid: &Uid) -> Option<&VirtualNodeConfig> {
        self.vnodes.iter().find(|v| v.uid.matches_short(uid))
    }

    fn vnode_entry(&mut self, uid: &Uid) -> Option<&mut VirtualNodeConfig> {
        if let Some(i) = self.vnodes.iter().position(|v| v.uid.matches_short(uid)) {
            return self.vnodes.get_mut(i);
        }
        self.vnodes
            .push(VirtualNodeConfig {
                uid: *uid,
                ..VirtualNodeConfig::default()
            })
            .ok()?;
        self.vnodes.last_mut()
    }

    pub fn vnode_set_user(&mut self, uid: &Uid, user: &str) {
        if let Some(v) = self.vnode_entry(uid) {
            v.user = truncated(user);
            self.dirty = true;
        }
    }

    pub fn vnode_set_feature(&mut self, uid: &Uid, feature: u8, value: u8) {
        if let Some(v) = self.vnode_entry(uid) {
            if let Some(slot) = v.features.iter_mut().find(|(f, _)| *f == feature) {
                slot.1 = value;
            } else {
                let _ = v.features.push((feature, value));
            }
            self.dirty = true;
        }
    }

    pub fn fb_map(&self) -> &[(Uid, u16)] {
        &self.fb_map
    }

    pub fn fb_base(&self, uid: &Uid) -> Option<u16> {
        self.fb_map
            .iter()
            .find(|(u, _)| u.matches_short(uid))
            .map(|(_, base)| *base)
    }

    pub fn set_fb_base(&mut self, uid: &Uid, base: u16) {
        if let Some(slot) = self.fb_map.iter_mut().find(|(u, _)| u.matches_short(uid)) {
            if slot.1 != base {
                slot.1 = base;
                self.dirty = true;
            }
            return;
        }
        let _ = self.fb_map.push((uid.short(), base));
        self.dirty = true;
    }

    /// Serialise the whole document.
    pub fn save_to<W: core::fmt::Write>(&self, w: &mut W) -> core::fmt::Result {
        writeln!(w, "[global]")?;
        writeln!(w, "port={}", self.port)?;
        writeln!(w, "user={}", self.user)?;
        for v in self.vnodes.iter() {
            writeln!(w, "[ND{}]", v.uid)?;
            writeln!(w, "user={}", v.user)?;
            for (feature, value) in v.features.iter() {
                writeln!(w, "FT{feature}={value}")?;
            }
        }
        for c in self.clients.iter() {
            writeln!(w, "[CL{}]", c.uid)?;
            writeln!(w, "product={}", c.product)?;
            writeln!(w, "user={}", c.user)?;
        }
        writeln!(w, "[s88map]")?;
        for (uid, base) in self.fb_map.iter() {
            writeln!(w, "{}={}", uid.short(), base)?;
        }
        Ok(())
    }

    /// Replace the model from a document. Unknown keys and sections
    /// are skipped, missing sections leave the defaults.
    pub fn load_from(&mut self, text: &str) {
        #[derive(Clone, Copy)]
        enum At {
            Nowhere,
            Global,
            VNode(Uid),
            Client(Uid),
            FbMap,
        }

        *self = StationConfig::new();
        let mut at = At::Nowhere;
        for line in lines(text) {
            match line {
                Line::Section("global") => at = At::Global,
                Line::Section("s88map") => at = At::FbMap,
                Line::Section(name) => {
                    at = At::Nowhere;
                    if let Some(uid) = name.strip_prefix("ND").and_then(Uid::parse_hex) {
                        self.vnode_entry(&uid);
                        at = At::VNode(uid);
                    } else if let Some(uid) = name.strip_prefix("CL").and_then(Uid::parse_hex) {
                        self.trust_add(&uid, "", "");
                        at = At::Client(uid);
                    }
                }
                Line::Pair(key, value) => match at {
                    At::Global => match key {
                        "port" => self.port = value.parse().unwrap_or(NETBIDIB_PORT),
                        "user" => self.user = truncated(value),
                        _ => {}
                    },
                    At::VNode(uid) => {
                        if key == "user" {
                            self.vnode_set_user(&uid, value);
                        } else if let Some(feature) =
                            key.strip_prefix("FT").and_then(|n| n.parse().ok())
                        {
                            if let Ok(value) = value.parse() {
                                self.vnode_set_feature(&uid, feature, value);
                            }
                        }
                    }
                    At::Client(uid) => {
                        let client = self.clients.iter_mut().find(|c| c.uid.matches_short(&uid));
                        if let Some(client) = client {
                            match key {
                                "product" => client.product = truncated(value),
                                "user" => client.user = truncated(value),
                                _ => {}
                            }
                        }
                    }
                    At::FbMap => {
                        if let (Some(uid), Ok(base)) = (Uid::parse_hex(key), value.parse()) {
                            self.set_fb_base(&uid, base);
                        }
                    }
                    At::Nowhere => {}
                },
                Line::Blank => {}
            }
        }
        self.dirty = false;
    }
}

impl Storage for StationConfig {
    fn wipe(&mut self) {
        *self = StationConfig::new();
        self.dirty = true;
    }
}

fn truncated(s: &str) -> Str {
    let mut out = String::new();
    for c in s.chars().take(MAX_STRING_SIZE) {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// The configuration bound to its storage driver.
pub struct ConfigStore<S> {
    driver: S,
    pub config: StationConfig,
}

impl<S: StorageDriver> ConfigStore<S> {
    pub fn new(driver: S) -> ConfigStore<S> {
        ConfigStore {
            driver,
            config: StationConfig::new(),
        }
    }
}

impl<S: StorageDriver> PersistentStorage for ConfigStore<S> {
    fn load(&mut self) {
        let mut buf = [0u8; DOC_SIZE];
        if self.driver.read(0, &mut buf).is_err() {
            return;
        }
        let end = buf
            .iter()
            .position(|&b| b == 0 || b == 0xFF)
            .unwrap_or(buf.len());
        if let Ok(text) = core::str::from_utf8(&buf[..end]) {
            self.config.load_from(text);
        }
    }

    fn is_dirty(&self) -> bool {
        self.config.is_dirty()
    }

    fn flush(&mut self) {
        if self.config.is_dirty() {
            self.force_flush();
        }
    }

    fn force_flush(&mut self) {
        let mut doc: String<DOC_SIZE> = String::new();
        if self.config.save_to(&mut doc).is_err() {
            return;
        }
        let mut bytes: Vec<u8, DOC_SIZE> = Vec::new();
        let _ = bytes.extend_from_slice(doc.as_bytes());
        let _ = bytes.push(0);
        if self.driver.write(0, &bytes).is_ok() {
            self.config.mark_clean();
        }
    }
}
