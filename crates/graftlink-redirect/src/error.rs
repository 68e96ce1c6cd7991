use std::net::SocketAddr;

use graftlink_core::upstream::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to bind {proto} redirector: {source}")]
    Bind {
        proto: &'static str,
        source: std::io::Error,
    },
    #[error("mapped target address not found for {0}")]
    TargetNotFound(SocketAddr),
    #[error("refusing connection on non-loopback address {0}")]
    NotLoopback(SocketAddr),
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("upstream dial to {0} timed out")]
    DialTimeout(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
