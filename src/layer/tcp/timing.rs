use crate::time::{Duration, Expiration, Instant};
use crate::wire::SeqNumber;

/// Lower bound of the retransmission timeout.
const MIN_RTO: Duration = Duration::from_millis(200);

/// Upper bound of the retransmission timeout, also capping backoff.
const MAX_RTO: Duration = Duration::from_secs(60);

/// Timeout used before the first round-trip sample exists.
const INITIAL_RTO: Duration = Duration::from_secs(3);

/// Duplicate acknowledgements before fast retransmit is assumed.
const DUP_ACK_THRESHOLD: u8 = 3;

/// What an incoming acknowledgement meant to the timing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckSignal {
    /// The acknowledgement advanced past previously unacknowledged data.
    Advanced,

    /// A repeated acknowledgement below the fast-retransmit threshold.
    Duplicate,

    /// The third duplicate: the peer is missing a segment and the other
    /// endpoint will fast-retransmit.
    FastRetransmit,
}

/// Round-trip estimation and retransmission timer state of one direction.
///
/// The middlebox is not an endpoint: on timer expiry it cannot retransmit
/// data, it can only provoke the real sender by re-sending an
/// acknowledgement. This state tracks when to do so and how hard to back
/// off.
///
/// RTT smoothing follows RFC 6298; segments that were retransmitted never
/// produce a sample (Karn/Partridge).
#[derive(Debug, Clone)]
pub struct RetransmissionTiming {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    timer: Expiration,
    last_ack: Option<SeqNumber>,
    duplicate_acks: u8,
    /// Open measurement: the sequence number whose acknowledgement will
    /// close the sample, and when its segment was sent.
    sample: Option<(SeqNumber, Instant)>,
}

impl Default for RetransmissionTiming {
    fn default() -> Self {
        RetransmissionTiming {
            srtt: None,
            rttvar: Duration::from_millis(0),
            rto: INITIAL_RTO,
            timer: Expiration::Never,
            last_ack: None,
            duplicate_acks: 0,
            sample: None,
        }
    }
}

impl RetransmissionTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for reuse from a pool.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record that a segment reaching up to `seq_end` left the middlebox.
    ///
    /// A retransmitted segment invalidates the open sample instead of
    /// starting one.
    pub fn signal_send(&mut self, seq_end: SeqNumber, now: Instant, retransmit: bool) {
        if retransmit {
            self.sample = None;
        } else if self.sample.is_none() {
            self.sample = Some((seq_end, now));
        }
        if self.timer == Expiration::Never {
            self.timer = Expiration::When(now + self.rto);
        }
    }

    /// Digest an acknowledgement received for this direction's stream.
    pub fn signal_ack(&mut self, ack: SeqNumber, now: Instant) -> AckSignal {
        match self.last_ack {
            Some(previous) if previous == ack => {
                self.duplicate_acks = self.duplicate_acks.saturating_add(1);
                if self.duplicate_acks == DUP_ACK_THRESHOLD {
                    return AckSignal::FastRetransmit;
                }
                return AckSignal::Duplicate;
            }
            Some(previous) if ack < previous => {
                // Reordered stale ack, nothing to learn.
                return AckSignal::Duplicate;
            }
            _ => {}
        }

        self.last_ack = Some(ack);
        self.duplicate_acks = 0;

        if let Some((sampled, sent_at)) = self.sample {
            if sampled <= ack {
                self.rtt_sample(now - sent_at);
                self.sample = None;
            }
        }

        // Data remains outstanding until proven otherwise; rearm for it.
        self.timer = Expiration::When(now + self.rto);
        AckSignal::Advanced
    }

    /// Check the retransmission timer.
    ///
    /// Returns true when the timer fired; the timeout then backs off
    /// exponentially and the timer rearms.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        match self.timer {
            Expiration::When(at) if at <= now => {
                self.rto = (self.rto * 2).min(MAX_RTO);
                self.timer = Expiration::When(now + self.rto);
                true
            }
            _ => false,
        }
    }

    /// Stop the timer, e.g. when the connection is torn down.
    pub fn disarm(&mut self) {
        self.timer = Expiration::Never;
        self.sample = None;
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// The smoothed round-trip estimate, if any sample completed.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// When the timer fires next.
    pub fn expires(&self) -> Expiration {
        self.timer
    }

    fn rtt_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + deviation) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.expect("sample was just stored");
        self.rto = (srtt + self.rttvar * 4).max(MIN_RTO).min(MAX_RTO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> Instant {
        Instant::from_millis(millis)
    }

    #[test]
    fn first_sample_sets_estimate() {
        let mut timing = RetransmissionTiming::new();
        timing.signal_send(SeqNumber(1100), at(0), false);
        assert_eq!(timing.signal_ack(SeqNumber(1100), at(100)), AckSignal::Advanced);

        assert_eq!(timing.srtt(), Some(Duration::from_millis(100)));
        // 100ms + 4 * 50ms, above the floor.
        assert_eq!(timing.rto(), Duration::from_millis(300));
    }

    #[test]
    fn rto_never_below_floor() {
        let mut timing = RetransmissionTiming::new();
        timing.signal_send(SeqNumber(1100), at(0), false);
        timing.signal_ack(SeqNumber(1100), at(1));
        assert_eq!(timing.rto(), MIN_RTO);
    }

    #[test]
    fn retransmitted_segments_never_sampled() {
        let mut timing = RetransmissionTiming::new();
        timing.signal_send(SeqNumber(1100), at(0), false);
        // The same segment goes out again; Karn says drop the measurement.
        timing.signal_send(SeqNumber(1100), at(50), true);
        timing.signal_ack(SeqNumber(1100), at(100));
        assert_eq!(timing.srtt(), None);
    }

    #[test]
    fn third_duplicate_triggers_fast_retransmit() {
        let mut timing = RetransmissionTiming::new();
        assert_eq!(timing.signal_ack(SeqNumber(1000), at(0)), AckSignal::Advanced);
        assert_eq!(timing.signal_ack(SeqNumber(1000), at(1)), AckSignal::Duplicate);
        assert_eq!(timing.signal_ack(SeqNumber(1000), at(2)), AckSignal::Duplicate);
        assert_eq!(timing.signal_ack(SeqNumber(1000), at(3)), AckSignal::FastRetransmit);
        // An advancing ack resets the counter.
        assert_eq!(timing.signal_ack(SeqNumber(1100), at(4)), AckSignal::Advanced);
        assert_eq!(timing.signal_ack(SeqNumber(1100), at(5)), AckSignal::Duplicate);
    }

    #[test]
    fn timer_backs_off_exponentially() {
        let mut timing = RetransmissionTiming::new();
        timing.signal_send(SeqNumber(1100), at(0), false);
        assert!(!timing.on_timer(at(100)));

        assert!(timing.on_timer(at(3_000)));
        assert_eq!(timing.rto(), Duration::from_secs(6));
        assert!(timing.on_timer(at(9_000)));
        assert_eq!(timing.rto(), Duration::from_secs(12));

        // Clamped at the maximum.
        for step in 0..8 {
            timing.on_timer(at(100_000 * (step + 1)));
        }
        assert_eq!(timing.rto(), MAX_RTO);
    }

    #[test]
    fn disarm_stops_firing() {
        let mut timing = RetransmissionTiming::new();
        timing.signal_send(SeqNumber(1100), at(0), false);
        timing.disarm();
        assert!(!timing.on_timer(at(1_000_000)));
        assert_eq!(timing.expires(), Expiration::Never);
    }
}
