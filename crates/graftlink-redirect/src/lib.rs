//! Local redirector: receives connections and datagrams aimed at synthetic
//! loopback addresses and forwards them to their real targets through an
//! upstream.

pub mod dns_hijack;
pub mod error;
pub mod mtu;
pub mod nat;
pub mod redirector;
pub mod tcp;
mod udp;

pub use error::RedirectError;
pub use redirector::{RedirectPorts, RedirectSettings, Redirector};
