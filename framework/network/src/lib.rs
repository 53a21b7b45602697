#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

#[macro_use]
mod macros;

pub mod config {
    //! Tunables of the stack; capacities of the bounded queues.
    #![allow(unused)]

    /// Messages waiting for a sub-bus self-slot.
    pub const SUBBUS_TX_QUEUE: usize = 32;
    /// Link events waiting for the station between polls.
    pub const SUBBUS_EVENT_QUEUE: usize = 32;
    /// Messages per routing direction at the root.
    pub const EGRESS_QUEUE: usize = 32;
    /// Receive buffer per network session.
    pub const SESSION_RX_BUFFER: usize = 512;
    /// Entries in the single-writer network transmit queue.
    pub const SESSION_TX_QUEUE: usize = 32;
    /// Session-layer events waiting for the station.
    pub const SESSION_EVENT_QUEUE: usize = 16;
}

pub mod iface;
pub mod node;
pub mod phy;
pub mod session;
pub mod subbus;
pub mod wire;
