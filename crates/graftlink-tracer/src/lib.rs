//! ptrace-based syscall interception.
//!
//! The engine runs a program under ptrace, follows its forks and threads,
//! and rewrites the destinations of `connect`, `sendto` and `sendmsg` so
//! that TCP and UDP traffic reaches the local redirector through synthetic
//! loopback addresses.

#[cfg(not(target_os = "linux"))]
compile_error!("graftlink-tracer only supports Linux");

mod arch;
pub mod capability;
pub mod error;
pub mod event;
pub mod handler;
pub mod memory;
mod scratch;
pub mod sockaddr;
pub mod sockets;
pub mod tracer;

pub use error::TraceError;
pub use handler::{Handler, RewritePolicy};
pub use tracer::{CancelHandle, Tracer};
