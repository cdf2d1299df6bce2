//! Server-side heartbeat bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

/// What the driver should do when the heartbeat interval fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    /// The previous ping was never answered
    Expired,
}

/// Last-sent ping and last-received pong for one connection.
///
/// Only transport-level pongs count; application `ping` messages are
/// answered but do not prove the server-to-client direction is alive.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping: None,
            last_pong: None,
            awaiting_pong: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Called each time the interval fires.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.awaiting_pong {
            return HeartbeatAction::Expired;
        }
        self.awaiting_pong = true;
        self.last_ping = Some(now);
        HeartbeatAction::SendPing
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.awaiting_pong = false;
        self.last_pong = Some(now);
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answered_pings_keep_connection_alive() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60));

        for round in 0..3u64 {
            let tick = start + Duration::from_secs(60 * (round + 1));
            assert_eq!(heartbeat.on_tick(tick), HeartbeatAction::SendPing);
            heartbeat.on_pong(tick + Duration::from_millis(20));
        }

        assert!(!heartbeat.is_awaiting_pong());
        assert!(heartbeat.last_pong() > heartbeat.last_ping());
    }

    #[test]
    fn test_missing_pong_expires_on_next_tick() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60));

        assert_eq!(heartbeat.on_tick(start), HeartbeatAction::SendPing);
        assert_eq!(
            heartbeat.on_tick(start + Duration::from_secs(60)),
            HeartbeatAction::Expired
        );
    }
}
