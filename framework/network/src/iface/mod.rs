/*! Message routing across the node tree.

The [`Router`] is the per-poll context handed to every handler: the
tree, the backend collaborators, the egress queues and the current
time. Downlink walks the address stack toward a node, uplink prepends
hop addresses on the way to the root.
*/

use heapless::Deque;

use bidib_core::cs::Backend;
use bidib_core::time::{Duration, Instant};
use bidib_core::uid::Uid;
use bidib_defs::{ErrorCode, MsgType};

use crate::config::EGRESS_QUEUE;
use crate::node::{NodeFlags, NodeId, NodeSet, SeqStatus};
use crate::wire::Message;

/// Messages leaving the local node, split by direction.
#[derive(Default)]
pub struct Egress {
    /// For physical children below the root; drained into the bus
    /// master's transmit queue.
    pub to_subbus: Deque<Message, EGRESS_QUEUE>,
    /// Messages leaving the root upward, stacks fully built.
    pub upstream: Deque<Message, EGRESS_QUEUE>,
    /// An egress queue overflowed since last cleared.
    pub stalled: bool,
}

impl Egress {
    pub fn new() -> Egress {
        Egress::default()
    }

    fn push_subbus(&mut self, msg: Message) {
        if self.to_subbus.push_back(msg).is_err() {
            net_debug!("iface: sub-bus egress full");
            self.stalled = true;
        }
    }

    fn push_upstream(&mut self, msg: Message) {
        if self.upstream.push_back(msg).is_err() {
            net_debug!("iface: upstream egress full");
            self.stalled = true;
        }
    }
}

/// Hook through which handlers report persistable changes on virtual
/// nodes; the station wires it to the configuration store.
pub trait ConfigSink {
    fn feature_changed(&mut self, uid: &Uid, feature: u8, value: u8);

    fn user_changed(&mut self, uid: &Uid, user: &str);
}

/// A sink for embeddings without persistence.
pub struct NullConfig;

impl ConfigSink for NullConfig {
    fn feature_changed(&mut self, _uid: &Uid, _feature: u8, _value: u8) {}

    fn user_changed(&mut self, _uid: &Uid, _user: &str) {}
}

/// The routing context of one poll step.
pub struct Router<'a, 'n> {
    pub nodes: &'a mut NodeSet<'n>,
    pub backend: &'a mut dyn Backend,
    pub egress: &'a mut Egress,
    pub config: &'a mut dyn ConfigSink,
    pub now: Instant,
    pub root: NodeId,
}

impl<'a, 'n> Router<'a, 'n> {
    /// Route a message at `at` toward its address-stack target.
    ///
    /// Unknown children answer `NodeNa` upstream; physical children of
    /// the root leave unmodified through the sub-bus queue; a consumed
    /// broadcast additionally fans out to every child, the sub-bus
    /// served once.
    pub fn downlink(&mut self, at: NodeId, msg: &Message) {
        if !msg.addr.is_self() {
            let hop = msg.addr.first_hop();
            match self.nodes.child_by_addr(at, hop) {
                None => {
                    net_debug!("iface: no child {} below {}", hop, at);
                    self.reply(at, MsgType::NodeNa, &[hop]);
                }
                Some(child) => {
                    if at == self.root && !self.nodes.get(child).is_virtual() {
                        self.egress.push_subbus(msg.clone());
                    } else {
                        let mut inner = msg.clone();
                        inner.addr = msg.addr.descend();
                        self.downlink(child, &inner);
                    }
                }
            }
            return;
        }

        if !msg.is_local() && !msg.is_broadcast() {
            let node = self.nodes.get_mut(at);
            match node.check_rx_num(msg.num) {
                SeqStatus::Ok => {}
                SeqStatus::Reset => node.reset_seq(),
                SeqStatus::Mismatch => {
                    node.error = ErrorCode::Sequence;
                    self.reply(at, MsgType::SysError, &[ErrorCode::Sequence.into()]);
                }
            }
        }

        match self.nodes.get(at).handlers.down(msg.opcode) {
            Some(handler) => handler(self, at, msg),
            None => net_trace!("iface: node {} ignores opcode {:#04x}", at, msg.opcode),
        }

        if msg.is_broadcast() {
            if at == self.root {
                // one copy serves the whole sub-bus segment
                self.egress.push_subbus(msg.clone());
            }
            let mut child = self.nodes.get(at).first_child;
            while let Some(cur) = child {
                child = self.nodes.get(cur).next_sibling;
                if at != self.root || self.nodes.get(cur).is_virtual() {
                    self.downlink(cur, msg);
                }
            }
        }
    }

    /// Take a message a directly-attached child handed up: verify its
    /// sequence, run the source node's upstream handlers, and forward
    /// toward the root unless it is link-local.
    pub fn ingest_upstream(&mut self, from_child: NodeId, msg: &Message) -> SeqStatus {
        let status = if !msg.is_local() && !msg.is_broadcast() {
            self.nodes.get_mut(from_child).check_rx_num(msg.num)
        } else {
            SeqStatus::Ok
        };
        if status == SeqStatus::Mismatch {
            net_debug!("iface: sequence mismatch from {}", from_child);
        }

        // the stack may point below the child when a hub forwarded
        match self.nodes.find_by_stack(from_child, msg.addr) {
            Some(source) => {
                if let Some(handler) = self.nodes.get(source).handlers.up(msg.opcode) {
                    handler(self, source, msg);
                }
            }
            None => net_trace!("iface: upstream from unknown descendant of {}", from_child),
        }

        if !msg.is_local() {
            let mut full = msg.clone();
            full.addr = self.stack_via(from_child, msg.addr);
            self.egress.push_upstream(full);
        }
        status
    }

    /// Send a reply out of `from`: the address stack names the node,
    /// the message travels up.
    pub fn reply(&mut self, from: NodeId, opcode: MsgType, payload: &[u8]) {
        let msg = Message::new(self.nodes.address_of(from), opcode, payload);
        self.egress.push_upstream(msg);
    }

    /// Address and send a message from the root down to `to`,
    /// assigning the node's next sequence number.
    pub fn send_down(&mut self, to: NodeId, opcode: MsgType, payload: &[u8]) {
        let mut msg = Message::new(self.nodes.address_of(to), opcode, payload);
        if !msg.is_local() && !msg.is_broadcast() {
            msg.num = self.nodes.get_mut(to).next_tx_num();
        }
        self.downlink(self.root, &msg);
    }

    /// As [`send_down`] with an explicit sequence number (0 asks the
    /// receiver to reset its counters).
    ///
    /// [`send_down`]: #method.send_down
    pub fn send_down_seq(&mut self, to: NodeId, opcode: MsgType, payload: &[u8], num: u8) {
        let mut msg = Message::new(self.nodes.address_of(to), opcode, payload);
        msg.num = num;
        self.downlink(self.root, &msg);
    }

    fn stack_via(&self, child: NodeId, below: bidib_core::addr::AddressStack) -> bidib_core::addr::AddressStack {
        let mut stack = below;
        let mut at = child;
        loop {
            stack = stack.ascend(self.nodes.get(at).local_addr);
            match self.nodes.get(at).parent() {
                Some(p) if p == self.root => break,
                Some(p) => at = p,
                None => break,
            }
        }
        stack
    }
}

/// A pending node-table change to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    New { addr: u8, uid: Uid },
    Lost { addr: u8 },
}

const REPORT_PERIOD: Duration = Duration::from_millis(250);
const REPORT_RETRIES: u8 = 16;

/// Announces `NodeNew`/`NodeLost` to a remote controller until it
/// acknowledges the table version, with bounded retries.
#[derive(Default)]
pub struct TableReporter {
    pending: Deque<TableChange, 16>,
    deadline: Option<Instant>,
    retries: u8,
}

impl TableReporter {
    pub fn new() -> TableReporter {
        TableReporter::default()
    }

    pub fn push(&mut self, change: TableChange) {
        if self.pending.push_back(change).is_err() {
            net_debug!("iface: table report queue full");
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::ZERO);
        }
    }

    /// A `NodeChangedAck` arrived; reporting stops once the remote
    /// caught up with the current version.
    pub fn ack(&mut self, acked: u8, current: u8) {
        if acked == current {
            self.pending.clear();
            self.deadline = None;
            self.retries = 0;
        }
    }

    /// Forget all pending reports, e.g. on loss of external control.
    pub fn cancel(&mut self) {
        self.pending.clear();
        self.deadline = None;
        self.retries = 0;
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Re-announce pending changes every period. Suppressed while the
    /// root sits under `SysDisable`.
    pub fn poll(&mut self, r: &mut Router<'_, '_>) {
        let deadline = match self.deadline {
            Some(d) => d,
            None => return,
        };
        if r.now < deadline || self.pending.is_empty() {
            return;
        }
        if r.nodes.get(r.root).flags.contains(NodeFlags::SYS_DISABLED) {
            return;
        }
        if self.retries >= REPORT_RETRIES {
            net_debug!("iface: table report abandoned after {} tries", REPORT_RETRIES);
            self.cancel();
            return;
        }
        let version = r.nodes.get(r.root).table_version;
        let root = r.root;
        for change in self.pending.iter() {
            match *change {
                TableChange::New { addr, uid } => {
                    let mut payload = [0u8; 9];
                    payload[0] = version;
                    payload[1] = addr;
                    payload[2..].copy_from_slice(uid.as_bytes());
                    r.reply(root, MsgType::NodeNew, &payload);
                }
                TableChange::Lost { addr } => {
                    r.reply(root, MsgType::NodeLost, &[version, addr]);
                }
            }
        }
        self.retries += 1;
        self.deadline = Some(r.now + REPORT_PERIOD);
    }
}
