//! Per-peer session timers.
//!
//! Pure deadline bookkeeping: the device reports traffic and handshake
//! milestones, and a periodic tick calls [`PeerTimers::poll`] to collect
//! whatever has fired. Nothing here sends packets.

use crate::noise::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
};
use rand::Rng;
use std::time::{Duration, Instant};

/// Upper bound of the random delay added to handshake timers.
const JITTER_MAX_MS: u64 = 333;

/// A timer that fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// No response to our initiation within `REKEY_TIMEOUT`.
    RetransmitHandshake,
    /// We received data and have sent nothing back for `KEEPALIVE_TIMEOUT`.
    SendKeepalive,
    /// We sent data and have heard nothing for
    /// `KEEPALIVE_TIMEOUT + REKEY_TIMEOUT`.
    NewHandshake,
    /// No new session for `3 * REJECT_AFTER_TIME`.
    ZeroKeyMaterial,
    PersistentKeepalive,
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS))
}

/// Deadlines for one peer.
#[derive(Debug, Default)]
pub struct PeerTimers {
    retransmit_handshake: Option<Instant>,
    send_keepalive: Option<Instant>,
    new_handshake: Option<Instant>,
    zero_key_material: Option<Instant>,
    persistent_keepalive: Option<Instant>,

    /// Zero disables persistent keepalives.
    persistent_keepalive_interval: Duration,
    handshake_attempts: u32,
    need_another_keepalive: bool,
}

impl PeerTimers {
    pub fn new(persistent_keepalive_interval: Duration) -> Self {
        Self {
            persistent_keepalive_interval,
            ..Default::default()
        }
    }

    pub fn persistent_keepalive_interval(&self) -> Duration {
        self.persistent_keepalive_interval
    }

    pub fn set_persistent_keepalive_interval(&mut self, interval: Duration) {
        self.persistent_keepalive_interval = interval;
        if interval.is_zero() {
            self.persistent_keepalive = None;
        }
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts
    }

    // === Milestones ===

    /// A transport packet carrying data went out.
    pub fn data_sent(&mut self, now: Instant) {
        if self.new_handshake.is_none() {
            self.new_handshake = Some(now + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + jitter());
        }
    }

    /// A transport packet carrying data came in.
    pub fn data_received(&mut self, now: Instant) {
        if self.send_keepalive.is_none() {
            self.send_keepalive = Some(now + KEEPALIVE_TIMEOUT);
        } else {
            self.need_another_keepalive = true;
        }
    }

    /// Any authenticated packet went out, keepalives included.
    pub fn any_authenticated_packet_sent(&mut self) {
        self.send_keepalive = None;
    }

    /// Any authenticated packet came in, keepalives included.
    pub fn any_authenticated_packet_received(&mut self) {
        self.new_handshake = None;
    }

    /// Any authenticated packet went either way.
    pub fn any_authenticated_packet_traversal(&mut self, now: Instant) {
        if !self.persistent_keepalive_interval.is_zero() {
            self.persistent_keepalive = Some(now + self.persistent_keepalive_interval);
        }
    }

    /// An initiation went out.
    pub fn handshake_initiated(&mut self, now: Instant) {
        self.retransmit_handshake = Some(now + REKEY_TIMEOUT + jitter());
    }

    /// Our initiation was answered.
    pub fn handshake_complete(&mut self) {
        self.retransmit_handshake = None;
        self.handshake_attempts = 0;
    }

    /// A new keypair was derived, either role.
    pub fn session_derived(&mut self, now: Instant) {
        self.zero_key_material = Some(now + REJECT_AFTER_TIME * 3);
    }

    /// Count a retransmission. `None` once the attempt budget is used up,
    /// in which case the handshake is abandoned and key material is
    /// scheduled for zeroing.
    pub fn next_attempt(&mut self, now: Instant) -> Option<u32> {
        if self.handshake_attempts >= MAX_TIMER_HANDSHAKES {
            self.retransmit_handshake = None;
            self.handshake_attempts = 0;
            if self.zero_key_material.is_none() {
                self.zero_key_material = Some(now + REJECT_AFTER_TIME * 3);
            }
            return None;
        }
        self.handshake_attempts += 1;
        Some(self.handshake_attempts)
    }

    /// After a keepalive went out: re-arm if more data arrived meanwhile.
    pub fn keepalive_sent(&mut self, now: Instant) {
        if self.need_another_keepalive {
            self.need_another_keepalive = false;
            self.send_keepalive = Some(now + KEEPALIVE_TIMEOUT);
        }
    }

    pub fn stop_all(&mut self) {
        let interval = self.persistent_keepalive_interval;
        *self = Self::new(interval);
    }

    /// Collect and disarm every deadline at or before `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        let slots = [
            (&mut self.retransmit_handshake, TimerEvent::RetransmitHandshake),
            (&mut self.send_keepalive, TimerEvent::SendKeepalive),
            (&mut self.new_handshake, TimerEvent::NewHandshake),
            (&mut self.zero_key_material, TimerEvent::ZeroKeyMaterial),
            (&mut self.persistent_keepalive, TimerEvent::PersistentKeepalive),
        ];
        for (slot, event) in slots {
            if slot.is_some_and(|at| at <= now) {
                *slot = None;
                fired.push(event);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_idle_timers_fire_nothing() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        assert!(timers.poll(Instant::now() + secs(1000)).is_empty());
    }

    #[test]
    fn test_retransmit_after_rekey_timeout() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.handshake_initiated(now);
        assert!(timers.poll(now + secs(4)).is_empty());
        let fired = timers.poll(now + REKEY_TIMEOUT + secs(1));
        assert_eq!(fired, vec![TimerEvent::RetransmitHandshake]);
        // Disarmed once fired
        assert!(timers.poll(now + secs(60)).is_empty());
    }

    #[test]
    fn test_handshake_complete_cancels_retransmit() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.handshake_initiated(now);
        timers.next_attempt(now);
        timers.handshake_complete();
        assert_eq!(timers.handshake_attempts(), 0);
        assert!(timers.poll(now + secs(10)).is_empty());
    }

    #[test]
    fn test_attempt_budget() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        for i in 1..=MAX_TIMER_HANDSHAKES {
            assert_eq!(timers.next_attempt(now), Some(i));
        }
        assert_eq!(timers.next_attempt(now), None);
        let fired = timers.poll(now + REJECT_AFTER_TIME * 3);
        assert_eq!(fired, vec![TimerEvent::ZeroKeyMaterial]);
    }

    #[test]
    fn test_passive_keepalive() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.data_received(now);
        assert_eq!(
            timers.poll(now + KEEPALIVE_TIMEOUT),
            vec![TimerEvent::SendKeepalive]
        );
    }

    #[test]
    fn test_reply_cancels_keepalive() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.data_received(now);
        timers.any_authenticated_packet_sent();
        assert!(timers.poll(now + KEEPALIVE_TIMEOUT).is_empty());
    }

    #[test]
    fn test_another_keepalive_rearms() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.data_received(now);
        timers.data_received(now + secs(1));
        let at = now + KEEPALIVE_TIMEOUT;
        assert_eq!(timers.poll(at), vec![TimerEvent::SendKeepalive]);
        timers.keepalive_sent(at);
        assert_eq!(
            timers.poll(at + KEEPALIVE_TIMEOUT),
            vec![TimerEvent::SendKeepalive]
        );
    }

    #[test]
    fn test_new_handshake_when_unanswered() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.data_sent(now);
        assert!(timers.poll(now + KEEPALIVE_TIMEOUT).is_empty());
        let fired = timers.poll(now + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + secs(1));
        assert_eq!(fired, vec![TimerEvent::NewHandshake]);
    }

    #[test]
    fn test_answer_cancels_new_handshake() {
        let mut timers = PeerTimers::new(Duration::ZERO);
        let now = Instant::now();
        timers.data_sent(now);
        timers.any_authenticated_packet_received();
        assert!(timers.poll(now + secs(60)).is_empty());
    }

    #[test]
    fn test_persistent_keepalive() {
        let mut timers = PeerTimers::new(secs(25));
        let now = Instant::now();
        timers.any_authenticated_packet_traversal(now);
        assert!(timers.poll(now + secs(24)).is_empty());
        assert_eq!(
            timers.poll(now + secs(25)),
            vec![TimerEvent::PersistentKeepalive]
        );

        timers.set_persistent_keepalive_interval(Duration::ZERO);
        timers.any_authenticated_packet_traversal(now);
        assert!(timers.poll(now + secs(100)).is_empty());
    }

    #[test]
    fn test_stop_all_keeps_interval() {
        let mut timers = PeerTimers::new(secs(5));
        let now = Instant::now();
        timers.handshake_initiated(now);
        timers.data_received(now);
        timers.stop_all();
        assert!(timers.poll(now + secs(60)).is_empty());
        assert_eq!(timers.persistent_keepalive_interval(), secs(5));
    }
}
