use rand::RngCore;
use std::time::Duration;

/// States of the upstream connection (`spec.md` §4.5, "Connection state
/// machine"). Free functions over this enum, rather than methods tangled
/// with socket I/O, keep the transition table unit testable without a
/// live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

/// The events that drive a [`ConnectionState`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    SocketOpened,
    SocketClosed,
    ConnectionTimedOut,
    ReconnectScheduled,
}

/// Apply one event to the state machine (`spec.md` §4.5's transition list).
#[must_use]
pub fn transition(event: ConnectionEvent) -> ConnectionState {
    match event {
        ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
        ConnectionEvent::SocketOpened => ConnectionState::Connected,
        ConnectionEvent::SocketClosed => ConnectionState::Disconnected,
        ConnectionEvent::ConnectionTimedOut => ConnectionState::Error,
        ConnectionEvent::ReconnectScheduled => ConnectionState::Reconnecting,
    }
}

/// `min(base * 2^(attempt-1), 60_000) + uniform(0, 1000)` milliseconds
/// (`spec.md` §4.5, "Reconnection"). `attempt` is 1-based; `attempt == 0` is
/// treated the same as `1`.
#[must_use]
pub fn reconnect_delay(attempt: u32, base_ms: u64, rng: &mut dyn RngCore) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let backoff = base_ms.saturating_mul(1u64 << exponent).min(60_000);
    let jitter = rng.next_u64() % 1000;
    Duration::from_millis(backoff + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn connect_requested_moves_to_connecting() {
        assert_eq!(transition(ConnectionEvent::ConnectRequested), ConnectionState::Connecting);
    }

    #[test]
    fn socket_opened_moves_to_connected() {
        assert_eq!(transition(ConnectionEvent::SocketOpened), ConnectionState::Connected);
    }

    #[test]
    fn socket_closed_moves_to_disconnected() {
        assert_eq!(transition(ConnectionEvent::SocketClosed), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_timeout_moves_to_error() {
        assert_eq!(transition(ConnectionEvent::ConnectionTimedOut), ConnectionState::Error);
    }

    #[test]
    fn reconnect_delay_grows_exponentially_and_caps_at_60s() {
        let mut rng = StdRng::seed_from_u64(42);
        let first = reconnect_delay(1, 1000, &mut rng);
        let second = reconnect_delay(2, 1000, &mut rng);
        let third = reconnect_delay(3, 1000, &mut rng);
        assert!(first.as_millis() >= 1000 && first.as_millis() < 2000);
        assert!(second.as_millis() >= 2000 && second.as_millis() < 3000);
        assert!(third.as_millis() >= 4000 && third.as_millis() < 5000);

        let capped = reconnect_delay(20, 1000, &mut rng);
        assert!(capped.as_millis() >= 60_000 && capped.as_millis() < 61_000);
    }

    #[test]
    fn reconnect_delay_is_deterministic_for_a_fixed_seed() {
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        assert_eq!(reconnect_delay(1, 500, &mut rng_a), reconnect_delay(1, 500, &mut rng_b));
    }
}
