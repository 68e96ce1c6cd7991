use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed to attach to pid {pid}: {source}")]
    Attach { pid: i32, source: nix::Error },
    #[error("waitpid failed: {0}")]
    Wait(nix::Error),
    #[error("tracee memory access at {addr:#x} failed: {source}")]
    Memory { addr: u64, source: nix::Error },
    #[error("register access for pid {pid} failed: {source}")]
    Registers { pid: i32, source: nix::Error },
    #[error("unsupported address family {0}")]
    UnsupportedFamily(u16),
    #[error("malformed socket address: {0}")]
    Sockaddr(&'static str),
    #[error("ptrace is not permitted: {0}")]
    NotPermitted(String),
    #[error("tracing cancelled")]
    Cancelled,
}
