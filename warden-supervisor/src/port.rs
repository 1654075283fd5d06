//! Host TCP port allocation.

use std::net::TcpListener;

use crate::SupervisorError;

/// Find the first free TCP port at or above `start_port`.
///
/// Probes sequentially by binding and immediately releasing a listener on
/// 127.0.0.1. The released port can in principle be taken by another process
/// before the child binds it; the child's own bind failure covers that race.
///
/// # Errors
/// Returns [`SupervisorError::PortRangeExhausted`] carrying the last bind
/// error when nothing below 65536 is free.
pub fn find_usable_port(start_port: u16) -> Result<u16, SupervisorError> {
    let mut last_error = String::from("no ports probed");

    for port in start_port..=u16::MAX {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(SupervisorError::PortRangeExhausted {
        start: start_port,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn returns_start_port_when_free() {
        // Ask the OS for a port that is certainly free, release it, then
        // probe from there.
        let probe = match TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(e) => panic!("bind to ephemeral port failed: {e}"),
        };
        let free = match probe.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("local_addr failed: {e}"),
        };
        drop(probe);

        let found = match find_usable_port(free) {
            Ok(p) => p,
            Err(e) => panic!("expected a usable port: {e}"),
        };
        assert!(found >= free, "allocator must never go below the floor");
    }

    #[test]
    fn skips_an_occupied_port() {
        let held = match TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        let occupied = match held.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("local_addr failed: {e}"),
        };

        // The listener is still held, so the allocator must move past it.
        let found = match find_usable_port(occupied) {
            Ok(p) => p,
            Err(e) => panic!("expected a usable port above {occupied}: {e}"),
        };
        assert!(found > occupied, "occupied port {occupied} must be skipped, got {found}");
    }

    #[test]
    fn repeated_calls_under_occupation_return_increasing_ports() {
        let held = match TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        let floor = match held.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("local_addr failed: {e}"),
        };

        let first = match find_usable_port(floor) {
            Ok(p) => p,
            Err(e) => panic!("first probe failed: {e}"),
        };
        // Occupy the first result too, then probe again.
        let held_first = match TcpListener::bind(("127.0.0.1", first)) {
            Ok(l) => l,
            Err(e) => panic!("bind to {first} failed: {e}"),
        };
        let second = match find_usable_port(floor) {
            Ok(p) => p,
            Err(e) => panic!("second probe failed: {e}"),
        };
        assert!(second > first, "expected strictly increasing ports: {first} then {second}");
        drop(held_first);
    }

    proptest::proptest! {
        #[test]
        fn proptest_found_port_is_never_below_floor(start in 1024u16..60000) {
            if let Ok(port) = find_usable_port(start) {
                proptest::prop_assert!(port >= start);
            }
        }
    }
}
