/*! The hierarchical node store.

One root node represents this station; hubs and leaves hang below it.
Children sit in a singly-linked sibling chain, strictly ascending by
local address. Storage is an arena with stable handles, borrowed or
owned, in the manner of a socket set.
*/

use core::fmt;

use bitflags::bitflags;
use managed::ManagedSlice;

use bidib_core::addr::AddressStack;
use bidib_core::feature::FeatureTable;
use bidib_core::time::Instant;
use bidib_core::uid::Uid;
use bidib_defs::{ErrorCode, MsgType, BIDIB_VERSION, MAX_STRING_SIZE};

use crate::iface::Router;
use crate::wire::Message;

mod vfb;

pub use self::vfb::VFeedback;

/// A handle to a node in a [`NodeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Synthesised locally, not present on any bus.
        const VIRTUAL = 0x01;
        /// `SysDisable` is in force; spontaneous reports are held.
        const SYS_DISABLED = 0x02;
        /// The identify indicator is lit.
        const IDENTIFY = 0x04;
    }
}

/// Commissioning progress of a node, driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Commissioning {
    GetMagic,
    GetPVersion,
    ReadFeatures,
    AutoReadFeatures,
    GetProdString,
    GetUserName,
    GetSwVersion,
    ReadNtabCount,
    ReadNodeTab,
    #[default]
    Idle,
    BootMode,
    Failed,
}

/// Node-kind specific payload.
#[derive(Debug, Clone)]
pub enum Private {
    /// A virtual feedback module's detector state.
    VFeedback(VFeedback),
    /// Offset of an external occupancy node in the global feedback
    /// space.
    FeedbackBase(u16),
}

/// Outcome of checking a received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    Ok,
    /// Sequence zero: the counter was reset and the message accepted.
    Reset,
    /// Out of order; the peer's numbering is adopted going forward.
    Mismatch,
}

/// Per-opcode entry points of a node.
///
/// Tables are shared statics; nodes of the same kind point at the same
/// table. Missing opcodes fall through to the generic handling of the
/// router.
#[derive(Debug)]
pub struct HandlerTable {
    pub downstream: &'static [(MsgType, Handler)],
    pub upstream: &'static [(MsgType, Handler)],
}

pub type Handler = fn(&mut Router<'_, '_>, NodeId, &Message);

pub static EMPTY_HANDLERS: HandlerTable = HandlerTable {
    downstream: &[],
    upstream: &[],
};

impl HandlerTable {
    pub fn down(&self, opcode: u8) -> Option<Handler> {
        self.downstream
            .iter()
            .find(|(t, _)| u8::from(*t) == opcode)
            .map(|(_, h)| *h)
    }

    pub fn up(&self, opcode: u8) -> Option<Handler> {
        self.upstream
            .iter()
            .find(|(t, _)| u8::from(*t) == opcode)
            .map(|(_, h)| *h)
    }
}

/// One node record.
#[derive(Debug)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) next_sibling: Option<NodeId>,
    pub local_addr: u8,
    pub uid: Uid,
    pub p_version: [u8; 2],
    pub sw_version: [u8; 3],
    pub product: heapless::String<MAX_STRING_SIZE>,
    pub user: heapless::String<MAX_STRING_SIZE>,
    pub error: ErrorCode,
    pub features: FeatureTable,
    pub handlers: &'static HandlerTable,
    tx_num: u8,
    rx_num: u8,
    pub state: Commissioning,
    pub deadline: Option<Instant>,
    pub retries: u8,
    /// Reset cycles spent waiting for the magic answer.
    pub resets: u8,
    pub flags: NodeFlags,
    pub private: Option<Private>,
    /// Streaming position handed out by `NodeTabGetAll`.
    pub tab_cursor: Option<u8>,
    /// Streaming position of a drive-state query.
    pub query_cursor: Option<u16>,
    pub feature_cursor: u8,
    pub table_version: u8,
}

impl Node {
    pub fn new(local_addr: u8, uid: Uid) -> Node {
        Node {
            parent: None,
            first_child: None,
            next_sibling: None,
            local_addr,
            uid,
            p_version: BIDIB_VERSION,
            sw_version: [0; 3],
            product: heapless::String::new(),
            user: heapless::String::new(),
            error: ErrorCode::None,
            features: FeatureTable::new(),
            handlers: &EMPTY_HANDLERS,
            tx_num: 0,
            rx_num: 0,
            state: Commissioning::Idle,
            deadline: None,
            retries: 0,
            resets: 0,
            flags: NodeFlags::empty(),
            private: None,
            tab_cursor: None,
            query_cursor: None,
            feature_cursor: 0,
            table_version: 0,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(NodeFlags::VIRTUAL)
    }

    /// The next sequence number for messages sent to this node,
    /// cycling 1..255.
    pub fn next_tx_num(&mut self) -> u8 {
        self.tx_num = if self.tx_num >= 255 { 1 } else { self.tx_num + 1 };
        self.tx_num
    }

    /// Verify an incoming sequence number against the expected one.
    pub fn check_rx_num(&mut self, num: u8) -> SeqStatus {
        if num == 0 {
            self.rx_num = 0;
            return SeqStatus::Reset;
        }
        let expected = if self.rx_num >= 255 { 1 } else { self.rx_num + 1 };
        let status = if num == expected {
            SeqStatus::Ok
        } else {
            SeqStatus::Mismatch
        };
        self.rx_num = num;
        status
    }

    /// Drop both counters to the reset state.
    pub fn reset_seq(&mut self) {
        self.tx_num = 0;
        self.rx_num = 0;
    }

    pub fn bump_table_version(&mut self) -> u8 {
        self.table_version = if self.table_version == 255 {
            1
        } else {
            self.table_version + 1
        };
        self.table_version
    }

    pub fn vfeedback(&self) -> Option<&VFeedback> {
        match &self.private {
            Some(Private::VFeedback(v)) => Some(v),
            _ => None,
        }
    }

    pub fn vfeedback_mut(&mut self) -> Option<&mut VFeedback> {
        match &mut self.private {
            Some(Private::VFeedback(v)) => Some(v),
            _ => None,
        }
    }

    pub fn feedback_base(&self) -> Option<u16> {
        match self.private {
            Some(Private::FeedbackBase(base)) => Some(base),
            Some(Private::VFeedback(ref v)) => Some(v.base),
            None => None,
        }
    }
}

/// An item of a [`NodeSet`].
#[derive(Default)]
pub struct NodeStorage {
    inner: Option<Node>,
}

impl NodeStorage {
    pub const EMPTY: NodeStorage = NodeStorage { inner: None };
}

/// The arena holding the tree.
pub struct NodeSet<'a> {
    slots: ManagedSlice<'a, NodeStorage>,
    changed: bool,
}

impl<'a> NodeSet<'a> {
    pub fn new<S>(slots: S) -> NodeSet<'a>
    where
        S: Into<ManagedSlice<'a, NodeStorage>>,
    {
        NodeSet {
            slots: slots.into(),
            changed: false,
        }
    }

    /// Place a node without linking it anywhere.
    ///
    /// # Panics
    /// This function panics if borrowed storage is exhausted.
    pub fn add(&mut self, node: Node) -> NodeId {
        fn put(slot: &mut NodeStorage, index: usize, node: Node) -> NodeId {
            net_trace!("tree: adding node {}", index);
            slot.inner = Some(node);
            NodeId(index)
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.inner.is_none() {
                return put(slot, index, node);
            }
        }

        match &mut self.slots {
            ManagedSlice::Borrowed(_) => panic!("adding a node to a full NodeSet"),
            #[cfg(feature = "alloc")]
            ManagedSlice::Owned(slots) => {
                slots.push(NodeStorage { inner: Some(node) });
                let index = slots.len() - 1;
                NodeId(index)
            }
        }
    }

    /// Get a node.
    ///
    /// # Panics
    /// This function panics if the handle is vacant.
    pub fn get(&self, id: NodeId) -> &Node {
        match self.slots[id.0].inner.as_ref() {
            Some(node) => node,
            None => panic!("handle does not refer to a valid node"),
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        match self.slots[id.0].inner.as_mut() {
            Some(node) => node,
            None => panic!("handle does not refer to a valid node"),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.inner.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the tree changed since this was last called.
    pub fn take_changed(&mut self) -> bool {
        core::mem::replace(&mut self.changed, false)
    }

    /// Link `node` under `parent`, keeping the sibling chain sorted by
    /// local address. Fails if the address is taken.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> Result<NodeId, Node> {
        if self.child_by_addr(parent, node.local_addr).is_some() {
            return Err(node);
        }
        node.parent = Some(parent);
        let addr = node.local_addr;
        let id = self.add(node);

        // find the insertion point in the ascending chain
        let mut prev: Option<NodeId> = None;
        let mut at = self.get(parent).first_child;
        while let Some(cur) = at {
            if self.get(cur).local_addr > addr {
                break;
            }
            prev = Some(cur);
            at = self.get(cur).next_sibling;
        }
        self.get_mut(id).next_sibling = at;
        match prev {
            Some(prev) => self.get_mut(prev).next_sibling = Some(id),
            None => self.get_mut(parent).first_child = Some(id),
        }
        self.changed = true;
        Ok(id)
    }

    /// Unlink and free a node and its whole subtree.
    pub fn remove(&mut self, id: NodeId) {
        // unlink from the parent chain
        if let Some(parent) = self.get(id).parent {
            let mut prev: Option<NodeId> = None;
            let mut at = self.get(parent).first_child;
            while let Some(cur) = at {
                if cur == id {
                    let next = self.get(cur).next_sibling;
                    match prev {
                        Some(prev) => self.get_mut(prev).next_sibling = next,
                        None => self.get_mut(parent).first_child = next,
                    }
                    break;
                }
                prev = Some(cur);
                at = self.get(cur).next_sibling;
            }
        }
        self.free_subtree(id);
        self.changed = true;
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut child = self.get(id).first_child;
        while let Some(cur) = child {
            child = self.get(cur).next_sibling;
            self.free_subtree(cur);
        }
        net_trace!("tree: removing node {}", id);
        self.slots[id.0].inner = None;
    }

    pub fn child_by_addr(&self, parent: NodeId, addr: u8) -> Option<NodeId> {
        self.children(parent).find(|&id| self.get(id).local_addr == addr)
    }

    pub fn children(&self, parent: NodeId) -> ChildIter<'_, 'a> {
        ChildIter {
            set: self,
            at: self.get(parent).first_child,
        }
    }

    pub fn child_count(&self, parent: NodeId) -> usize {
        self.children(parent).count()
    }

    /// Descend from `from` one hop per address-stack level.
    pub fn find_by_stack(&self, from: NodeId, stack: AddressStack) -> Option<NodeId> {
        let mut at = from;
        let mut stack = stack;
        while !stack.is_self() {
            at = self.child_by_addr(at, stack.first_hop())?;
            stack = stack.descend();
        }
        Some(at)
    }

    pub fn find_by_uid(&self, from: NodeId, uid: &Uid) -> Option<NodeId> {
        self.find_recursive(from, &|node| node.uid == *uid)
    }

    pub fn find_by_short_uid(&self, from: NodeId, uid: &Uid) -> Option<NodeId> {
        self.find_recursive(from, &|node| node.uid.matches_short(uid))
    }

    fn find_recursive(&self, at: NodeId, pred: &dyn Fn(&Node) -> bool) -> Option<NodeId> {
        if pred(self.get(at)) {
            return Some(at);
        }
        let mut child = self.get(at).first_child;
        while let Some(cur) = child {
            if let Some(hit) = self.find_recursive(cur, pred) {
                return Some(hit);
            }
            child = self.get(cur).next_sibling;
        }
        None
    }

    /// The lowest unused child address in `min..=max`, 0 if exhausted.
    pub fn lowest_free_addr(&self, parent: NodeId, min: u8, max: u8) -> u8 {
        let mut candidate = min;
        for id in self.children(parent) {
            let addr = self.get(id).local_addr;
            if addr < candidate {
                continue;
            }
            if addr > candidate {
                break;
            }
            if candidate == max {
                return 0;
            }
            candidate += 1;
        }
        if candidate > max {
            0
        } else {
            candidate
        }
    }

    /// The route from the root down to `id`.
    pub fn address_of(&self, id: NodeId) -> AddressStack {
        let mut stack = AddressStack::SELF;
        let mut at = id;
        while let Some(parent) = self.get(at).parent {
            stack = stack.ascend(self.get(at).local_addr);
            at = parent;
        }
        stack
    }

    /// Every occupied slot, handles ascending.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.inner.is_some())
            .map(|(i, _)| NodeId(i))
    }
}

pub struct ChildIter<'s, 'a> {
    set: &'s NodeSet<'a>,
    at: Option<NodeId>,
}

impl<'s, 'a> Iterator for ChildIter<'s, 'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.at?;
        self.at = self.set.get(cur).next_sibling;
        Some(cur)
    }
}
