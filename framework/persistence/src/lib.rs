#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Persisted station state.

Everything the station must remember across power cycles lives in one
ini-structured document: global settings, virtual-node features, the
trusted netBiDiB clients, and the feedback-base map. [`ini`] gives the
line-level view of that document, [`station_config`] the typed model
and its binding to a storage driver.
*/

pub mod ini;
pub mod station_config;

pub use station_config::{ConfigStore, PersistentStorage, StationConfig, Storage};
