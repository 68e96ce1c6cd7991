//! Runs real programs under the tracer.

use std::io::Read;
use std::net::{IpAddr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use graftlink_core::mapping::AddressTable;
use graftlink_tracer::{capability, RewritePolicy, TraceError, Tracer};

// waitpid(-1) sees every child of the test process
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> Option<MutexGuard<'static, ()>> {
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Err(e) = capability::check() {
        eprintln!("skipping: {}", e);
        return None;
    }
    Some(guard)
}

fn policy(port: u16) -> RewritePolicy {
    RewritePolicy {
        tcp_port: port,
        udp_port: port,
        no_udp: false,
    }
}

fn sh(script: &str) -> Tracer {
    Tracer::new("sh", ["-c", script], Arc::new(AddressTable::new()), policy(1))
}

#[test]
fn test_exit_code_is_propagated() {
    let Some(_guard) = serial() else { return };
    assert_eq!(sh("exit 7").run().unwrap(), 7);
}

#[test]
fn test_forked_children_are_followed() {
    let Some(_guard) = serial() else { return };
    assert_eq!(sh("(exit 3); exit $?").run().unwrap(), 3);
}

#[test]
fn test_signal_death_maps_to_128_plus_signo() {
    let Some(_guard) = serial() else { return };
    assert_eq!(sh("kill -TERM $$").run().unwrap(), 128 + libc::SIGTERM);
}

#[test]
fn test_missing_program_fails_to_spawn() {
    let Some(_guard) = serial() else { return };
    let tracer = Tracer::new(
        "/nonexistent/graftlink-test",
        Vec::<String>::new(),
        Arc::new(AddressTable::new()),
        policy(1),
    );
    assert!(matches!(tracer.run(), Err(TraceError::Spawn { .. })));
}

#[test]
fn test_cancel_detaches_and_reports_cancelled() {
    let Some(_guard) = serial() else { return };
    let tracer = Tracer::new("sleep", ["2"], Arc::new(AddressTable::new()), policy(1));
    let handle = tracer.cancel_handle();
    let thread = tracer.spawn().unwrap();

    thread::sleep(Duration::from_millis(300));
    handle.cancel();
    assert!(matches!(thread.join().unwrap(), Err(TraceError::Cancelled)));
}

#[test]
fn test_connect_is_redirected_to_synthetic_address() {
    let Some(_guard) = serial() else { return };
    if !Path::new("/bin/bash").exists() {
        eprintln!("skipping: bash not found");
        return;
    }

    let listener = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();
    let accepted = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    let local = stream.local_addr().unwrap().ip();
                    let mut payload = String::new();
                    stream.read_to_string(&mut payload).unwrap();
                    return Some((local, payload));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(_) => return None,
            }
        }
    });

    let table = Arc::new(AddressTable::new());
    // TEST-NET-1: unreachable unless the connect is rewritten
    let script = "exec 3<>/dev/tcp/192.0.2.10/80; printf hello >&3; exec 3>&-";
    let tracer = Tracer::new("/bin/bash", ["-c", script], table.clone(), policy(port));
    assert_eq!(tracer.run().unwrap(), 0);

    let (local, payload) = accepted.join().unwrap().expect("no redirected connection");
    assert_eq!(payload, "hello");
    assert!(local.is_loopback());
    assert_ne!(local, IpAddr::from([127, 0, 0, 1]));
    assert_eq!(table.get_projection(local).as_deref(), Some("192.0.2.10:80"));
}
