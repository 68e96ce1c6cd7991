use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use graftlink_core::upstream::PacketConn;
use tokio::sync::watch;
use tokio::time::Instant;

/// One NAT-style UDP session: a tracee socket mapped to an upstream packet conn.
pub struct UdpSession {
    pub conn: Arc<dyn PacketConn>,
    state: Mutex<SessionState>,
}

struct SessionState {
    deadline: Instant,
    /// Idle timeout chosen by the last outbound datagram.
    timeout: Duration,
    /// Synthetic address the peer last sent to; replies leave from here.
    reply_from: Ipv4Addr,
}

impl UdpSession {
    pub fn new(conn: Arc<dyn PacketConn>, reply_from: Ipv4Addr, timeout: Duration) -> Self {
        Self {
            conn,
            state: Mutex::new(SessionState {
                deadline: Instant::now() + timeout,
                timeout,
                reply_from,
            }),
        }
    }

    /// Push the idle deadline out by `timeout` and remember where the peer sent to.
    pub fn touch(&self, reply_from: Ipv4Addr, timeout: Duration) {
        let mut state = self.lock();
        state.deadline = Instant::now() + timeout;
        state.timeout = timeout;
        state.reply_from = reply_from;
    }

    /// Push the idle deadline out by the current timeout; called for responses.
    pub fn refresh(&self) {
        let mut state = self.lock();
        state.deadline = Instant::now() + state.timeout;
    }

    fn is_idle(&self) -> bool {
        self.deadline() <= Instant::now()
    }

    pub fn deadline(&self) -> Instant {
        self.lock().deadline
    }

    pub fn reply_from(&self) -> Ipv4Addr {
        self.lock().reply_from
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Slot {
    /// A dial is in flight; the receiver fires when its sender is dropped.
    Establishing(watch::Receiver<()>),
    Active(Arc<UdpSession>),
}

/// Outcome of [`SessionTable::claim`].
pub enum Claim<'a> {
    Active(Arc<UdpSession>),
    /// Another task is establishing the session; wait on the receiver.
    Wait(watch::Receiver<()>),
    /// The caller must dial and then call [`BuildGuard::complete`].
    Build(BuildGuard<'a>),
}

/// Exclusive right to establish the session for one key. Dropping the
/// guard without completing it clears the slot and wakes all waiters.
pub struct BuildGuard<'a> {
    table: &'a SessionTable,
    key: String,
    _signal: watch::Sender<()>,
    completed: bool,
}

impl BuildGuard<'_> {
    pub fn complete(mut self, session: Arc<UdpSession>) {
        self.table
            .sessions
            .insert(self.key.clone(), Slot::Active(session));
        self.completed = true;
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.table
                .sessions
                .remove_if(&self.key, |_, slot| matches!(slot, Slot::Establishing(_)));
        }
    }
}

/// UDP session table keyed by the tracee-side peer address.
///
/// Guarantees at most one upstream dial per session: the first datagram
/// from an unseen peer gets a [`BuildGuard`], concurrent ones wait for it.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, Slot>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `key`. An active session is touched while the
    /// entry is locked, so it cannot be reaped as idle in between.
    pub fn claim(&self, key: &str, reply_from: Ipv4Addr, timeout: Duration) -> Claim<'_> {
        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Active(session) => {
                    session.touch(reply_from, timeout);
                    Claim::Active(session.clone())
                }
                Slot::Establishing(rx) => Claim::Wait(rx.clone()),
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(());
                entry.insert(Slot::Establishing(rx));
                Claim::Build(BuildGuard {
                    table: self,
                    key: key.to_string(),
                    _signal: tx,
                    completed: false,
                })
            }
        }
    }

    /// Touch and return the active session for `key`, if establishment has
    /// finished successfully.
    pub fn touch(&self, key: &str, reply_from: Ipv4Addr, timeout: Duration) -> Option<Arc<UdpSession>> {
        match self.sessions.get(key).as_deref() {
            Some(Slot::Active(session)) => {
                session.touch(reply_from, timeout);
                Some(session.clone())
            }
            _ => None,
        }
    }

    /// Remove `session` unless the key has since been taken by a newer one.
    pub fn remove(&self, key: &str, session: &Arc<UdpSession>) -> bool {
        self.sessions
            .remove_if(key, |_, slot| match slot {
                Slot::Active(current) => Arc::ptr_eq(current, session),
                Slot::Establishing(_) => false,
            })
            .is_some()
    }

    /// Remove `session` if it is still the one stored under `key` and its
    /// deadline has passed. Checked under the entry lock, so a concurrent
    /// [`claim`](Self::claim) either refreshes it first or finds the slot empty.
    pub fn remove_idle(&self, key: &str, session: &Arc<UdpSession>) -> bool {
        self.sessions
            .remove_if(key, |_, slot| match slot {
                Slot::Active(current) => Arc::ptr_eq(current, session) && current.is_idle(),
                Slot::Establishing(_) => false,
            })
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use graftlink_core::upstream::{Destination, UpstreamError};

    struct NullConn;

    #[async_trait]
    impl PacketConn for NullConn {
        async fn send_to(&self, buf: &[u8], _target: &Destination) -> Result<usize, UpstreamError> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, Destination), UpstreamError> {
            std::future::pending().await
        }

        fn local_addr(&self) -> Result<SocketAddr, UpstreamError> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    const REPLY_FROM: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
    const IDLE: Duration = Duration::from_secs(180);

    fn session() -> Arc<UdpSession> {
        Arc::new(UdpSession::new(Arc::new(NullConn), REPLY_FROM, IDLE))
    }

    #[test]
    fn test_claim_lifecycle() {
        let table = SessionTable::new();
        let key = "127.0.0.1:40000";

        let guard = match table.claim(key, REPLY_FROM, IDLE) {
            Claim::Build(guard) => guard,
            _ => panic!("first claim must build"),
        };
        assert!(matches!(table.claim(key, REPLY_FROM, IDLE), Claim::Wait(_)));
        assert!(table.touch(key, REPLY_FROM, IDLE).is_none());

        let s = session();
        guard.complete(s.clone());
        match table.claim(key, REPLY_FROM, IDLE) {
            Claim::Active(active) => assert!(Arc::ptr_eq(&active, &s)),
            _ => panic!("session should be active"),
        }

        assert!(table.remove(key, &s));
        assert!(table.is_empty());
    }

    #[test]
    fn test_dropped_guard_clears_slot() {
        let table = SessionTable::new();
        let key = "127.0.0.1:40001";

        let waiter = match table.claim(key, REPLY_FROM, IDLE) {
            Claim::Build(guard) => {
                let waiter = match table.claim(key, REPLY_FROM, IDLE) {
                    Claim::Wait(rx) => rx,
                    _ => panic!("second claim must wait"),
                };
                drop(guard);
                waiter
            }
            _ => panic!("first claim must build"),
        };

        assert!(table.is_empty());
        // sender dropped: the waiter observes closure instead of hanging
        assert!(waiter.has_changed().is_err());
        assert!(matches!(table.claim(key, REPLY_FROM, IDLE), Claim::Build(_)));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_completion() {
        let table = Arc::new(SessionTable::new());
        let key = "127.0.0.1:40002";

        let guard = match table.claim(key, REPLY_FROM, IDLE) {
            Claim::Build(guard) => guard,
            _ => panic!("first claim must build"),
        };
        let mut rx = match table.claim(key, REPLY_FROM, IDLE) {
            Claim::Wait(rx) => rx,
            _ => panic!("second claim must wait"),
        };

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let _ = rx.changed().await;
                table.touch(key, REPLY_FROM, IDLE).is_some()
            })
        };
        guard.complete(session());
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_remove_ignores_replaced_session() {
        let table = SessionTable::new();
        let key = "127.0.0.1:40003";
        let old = session();
        let new = session();

        if let Claim::Build(guard) = table.claim(key, REPLY_FROM, IDLE) {
            guard.complete(old.clone());
        }
        table.remove(key, &old);
        if let Claim::Build(guard) = table.claim(key, REPLY_FROM, IDLE) {
            guard.complete(new.clone());
        }

        assert!(!table.remove(key, &old));
        assert!(table.touch(key, REPLY_FROM, IDLE).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_deadline() {
        let s = session();
        let before = s.deadline();
        tokio::time::advance(Duration::from_secs(5)).await;
        s.touch(Ipv4Addr::new(127, 0, 0, 9), Duration::from_secs(17));
        assert!(s.deadline() < before);
        assert_eq!(s.reply_from(), Ipv4Addr::new(127, 0, 0, 9));
        assert_eq!(s.deadline(), Instant::now() + Duration::from_secs(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_uses_last_timeout() {
        let s = session();
        s.touch(REPLY_FROM, Duration::from_secs(17));
        tokio::time::advance(Duration::from_secs(10)).await;
        s.refresh();
        assert_eq!(s.deadline(), Instant::now() + Duration::from_secs(17));
        assert_eq!(s.reply_from(), REPLY_FROM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_removal_spares_claimed_session() {
        let table = SessionTable::new();
        let key = "127.0.0.1:40004";
        let timeout = Duration::from_secs(1);
        let s = Arc::new(UdpSession::new(Arc::new(NullConn), REPLY_FROM, timeout));
        if let Claim::Build(guard) = table.claim(key, REPLY_FROM, timeout) {
            guard.complete(s.clone());
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        // a datagram lands after the deadline but before the reaper runs
        assert!(matches!(table.claim(key, REPLY_FROM, timeout), Claim::Active(_)));
        assert!(!table.remove_idle(key, &s));
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.remove_idle(key, &s));
        assert!(table.is_empty());
    }
}
