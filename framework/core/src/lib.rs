#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate alloc;

pub mod addr;
pub mod clock;
pub mod cs;
pub mod dcc;
pub mod feature;
pub mod time;
pub mod uid;
