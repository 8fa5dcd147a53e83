//! Upstream satellite adapter: connects out to a companion satellite
//! device, translates its text-line wire protocol into state-store writes,
//! and dispatches router-addressed bridge commands back onto the wire.

mod adapter;
mod capability;
mod codec;
mod connection;
mod error;

pub use adapter::{KeyState, SatelliteAdapter, SatelliteConfig, DEFAULT_PORT};
pub use capability::Capabilities;
pub use codec::{decode_in, encode_out, InCommand, KeyStateTag, OutCommand};
pub use connection::{reconnect_delay, transition, ConnectionEvent, ConnectionState};
pub use error::SatelliteError;
