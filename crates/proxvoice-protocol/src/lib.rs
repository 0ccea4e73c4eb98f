//! Wire protocol shared by the proxvoice server and client.
//!
//! - [`io`]: big-endian byte cursor and the [`io::Wire`] trait
//! - [`tcp`]: control channel packets and framing
//! - [`udp`]: media datagrams (`[secret][encrypted packet]`)
//! - [`types`] / [`activation`]: the activation and source line model

#[macro_use]
mod registry;

pub mod activation;
pub mod codec;
pub mod error;
pub mod io;
pub mod tcp;
pub mod types;
pub mod udp;

pub use error::ProtocolError;
