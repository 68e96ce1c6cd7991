use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use graftlink_core::mapping::AddressTable;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::arch::{self, Registers};
use crate::error::TraceError;
use crate::event::SyscallEvent;
use crate::handler::{Handler, RewritePolicy};
use crate::memory::PtraceMemory;

/// Stops a running [`Tracer`] from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    root: Arc<AtomicI32>,
}

impl CancelHandle {
    /// Request cancellation and wake the tracing thread out of `waitpid`.
    pub fn cancel(&self) {
        self.token.cancel();
        let root = self.root.load(Ordering::SeqCst);
        if root > 0 {
            let _ = signal::kill(Pid::from_raw(root), Signal::SIGCONT);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs a program under ptrace and rewrites its socket destinations.
///
/// Every ptrace request must come from the thread that spawned the tracee,
/// so [`Tracer::run`] does both and blocks until the program exits.
pub struct Tracer {
    program: OsString,
    args: Vec<OsString>,
    handler: Handler,
    cancel: CancellationToken,
    root: Arc<AtomicI32>,
}

impl Tracer {
    pub fn new<I, S>(program: impl Into<OsString>, args: I, table: Arc<AddressTable>, policy: RewritePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            handler: Handler::new(table, policy),
            cancel: CancellationToken::new(),
            root: Arc::new(AtomicI32::new(0)),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
            root: self.root.clone(),
        }
    }

    /// Run on a dedicated OS thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<i32, TraceError>>> {
        thread::Builder::new()
            .name("graftlink-tracer".to_string())
            .spawn(move || self.run())
    }

    /// Trace until the program exits, returning its exit code
    /// (`128 + signo` when killed by a signal).
    pub fn run(mut self) -> Result<i32, TraceError> {
        let root = self.start()?;
        self.root.store(root.as_raw(), Ordering::SeqCst);
        tracing::info!(pid = root.as_raw(), program = ?self.program, "tracing started");

        let result = self.trace(root);
        match &result {
            Ok(code) => tracing::info!(pid = root.as_raw(), code, "traced program exited"),
            Err(TraceError::Cancelled) => tracing::info!(pid = root.as_raw(), "tracing cancelled"),
            Err(e) => {
                tracing::error!(pid = root.as_raw(), error = %e, "tracing failed, killing tracee");
                let _ = signal::kill(root, Signal::SIGKILL);
            }
        }
        result
    }

    fn start(&self) -> Result<Pid, TraceError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        // SAFETY: PTRACE_TRACEME is async-signal-safe and touches no memory.
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
        }
        let child = command.spawn().map_err(|source| TraceError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        // the child stops with SIGTRAP once execve succeeds
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(status) => {
                tracing::error!(pid = pid.as_raw(), status = ?status, "unexpected first stop");
                return Err(TraceError::Attach {
                    pid: pid.as_raw(),
                    source: Errno::ESRCH,
                });
            }
            Err(e) => return Err(TraceError::Wait(e)),
        }

        let options = Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_EXITKILL;
        let attach_err = |source| TraceError::Attach {
            pid: pid.as_raw(),
            source,
        };
        ptrace::setoptions(pid, options).map_err(attach_err)?;
        ptrace::syscall(pid, None).map_err(attach_err)?;
        Ok(pid)
    }

    fn trace(&mut self, root: Pid) -> Result<i32, TraceError> {
        let mut mem = PtraceMemory;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.detach(root, None));
            }
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TraceError::Wait(e)),
            };
            if self.cancel.is_cancelled() {
                return Err(self.detach(root, status.pid()));
            }

            match status {
                WaitStatus::Exited(pid, code) => {
                    self.handler.on_process_exit(pid.as_raw());
                    if pid == root {
                        return Ok(code);
                    }
                    tracing::trace!(pid = pid.as_raw(), code, "tracee exited");
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    self.handler.on_process_exit(pid.as_raw());
                    if pid == root {
                        return Ok(128 + sig as i32);
                    }
                    tracing::trace!(pid = pid.as_raw(), signal = ?sig, "tracee killed");
                }
                WaitStatus::PtraceSyscall(pid) => {
                    self.on_syscall(&mut mem, pid);
                    resume(pid, None);
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    self.on_event(pid, event);
                    resume(pid, None);
                }
                WaitStatus::Stopped(pid, sig) => {
                    // new tracees start with SIGSTOP
                    let inject = (sig != Signal::SIGSTOP).then_some(sig);
                    if inject.is_some() {
                        tracing::trace!(pid = pid.as_raw(), signal = ?sig, "forwarding signal");
                    }
                    resume(pid, inject);
                }
                _ => {}
            }
        }
    }

    fn on_event(&mut self, pid: Pid, event: libc::c_int) {
        let is_clone = match event {
            libc::PTRACE_EVENT_CLONE => true,
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => false,
            _ => return,
        };
        match ptrace::getevent(pid) {
            Ok(child) => {
                let child = child as i32;
                if is_clone {
                    self.handler.on_clone(pid.as_raw(), child);
                } else {
                    self.handler.on_fork(pid.as_raw(), child);
                }
                tracing::debug!(parent = pid.as_raw(), child, thread = is_clone, "new tracee");
            }
            Err(e) => tracing::debug!(pid = pid.as_raw(), error = %e, "failed to read new tracee pid"),
        }
    }

    fn on_syscall(&mut self, mem: &mut PtraceMemory, pid: Pid) {
        let mut regs = match Registers::fetch(pid) {
            Ok(regs) => regs,
            Err(source) => {
                let e = TraceError::Registers {
                    pid: pid.as_raw(),
                    source,
                };
                tracing::debug!(error = %e, "skipping syscall stop");
                return;
            }
        };
        let Some(syscall) = arch::classify(regs.syscall_number()) else {
            return;
        };

        let mut event = SyscallEvent::new(pid.as_raw(), syscall, regs.args(), regs.return_value());
        if !regs.is_entry() {
            self.handler.on_exit(&event);
            return;
        }

        self.handler.on_entry(mem, &mut event);
        if event.is_dirty() {
            for (index, value) in event.args().into_iter().enumerate() {
                regs.set_arg(index, value);
            }
            if let Err(e) = regs.store(pid) {
                tracing::debug!(pid = pid.as_raw(), error = %e, "failed to write back syscall arguments");
            }
        }
    }

    fn detach(&self, root: Pid, stopped: Option<Pid>) -> TraceError {
        for pid in stopped.into_iter().chain((stopped != Some(root)).then_some(root)) {
            if let Err(e) = ptrace::detach(pid, None) {
                tracing::trace!(pid = pid.as_raw(), error = %e, "detach failed");
            }
        }
        TraceError::Cancelled
    }
}

fn resume(pid: Pid, signal: Option<Signal>) {
    if let Err(e) = ptrace::syscall(pid, signal) {
        // the tracee may have been killed meanwhile
        tracing::trace!(pid = pid.as_raw(), error = %e, "resume failed");
    }
}
