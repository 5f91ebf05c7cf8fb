//! RTT estimation and the congestion window.
//!
//! RTT smoothing is the Jacobson/Karels recipe: `srtt <- 7/8 srtt + 1/8 sample`,
//!  `rttvar <- 3/4 rttvar + 1/4 |sample - srtt|`. Samples are not taken for datagrams
//!  that carried retransmitted messages (Karn's rule).
//!
//! The window counts datagrams, starts at 1, grows by one per ack in slow start and by
//!  `1/cwnd` per ack in congestion avoidance, and halves on loss - at most once per
//!  RTT, so a burst of losses within one window does not collapse it to the floor.

use std::time::{Duration, Instant};

pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    has_sample: bool,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration, min_rto: Duration, max_rto: Duration) -> RttEstimator {
        RttEstimator {
            srtt: initial_rtt,
            rttvar: initial_rtt / 2,
            has_sample: false,
            min_rto,
            max_rto,
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        if !self.has_sample {
            self.srtt = sample;
            self.rttvar = sample / 2;
            self.has_sample = true;
            return;
        }

        let deviation = if sample > self.srtt {
            sample - self.srtt
        } else {
            self.srtt - sample
        };
        self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
        self.srtt = self.srtt * 7 / 8 + sample / 8;
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Per-datagram retransmission timeout: `rtt + 4 * rttvar`, clamped.
    pub fn rto(&self) -> Duration {
        (self.srtt + 4 * self.rttvar).clamp(self.min_rto, self.max_rto)
    }
}

pub struct CongestionController {
    cwnd: f64,
    ssthresh: f64,
    last_loss_cut: Option<Instant>,
    /// pacing token bucket, in datagrams
    tokens: f64,
    last_refill: Instant,
    /// peer-advertised cap from a FlowControl frame, datagrams per second
    peer_rate_cap: Option<f64>,
}

const INITIAL_CWND: f64 = 1.0;
const INITIAL_SSTHRESH: f64 = 64.0;
const MIN_CWND: f64 = 1.0;

impl CongestionController {
    pub fn new(now: Instant) -> CongestionController {
        CongestionController {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            last_loss_cut: None,
            tokens: INITIAL_CWND,
            last_refill: now,
            peer_rate_cap: None,
        }
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd as usize
    }

    pub fn on_ack(&mut self) {
        if self.cwnd < self.ssthresh {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    pub fn on_loss(&mut self, now: Instant, srtt: Duration) {
        // one cut per RTT: losses detected within the same flight share one cause
        if let Some(last) = self.last_loss_cut {
            if now.duration_since(last) < srtt {
                return;
            }
        }
        self.last_loss_cut = Some(now);
        self.ssthresh = (self.cwnd / 2.0).max(2.0);
        self.cwnd = (self.cwnd / 2.0).max(MIN_CWND);
    }

    pub fn set_peer_rate_cap(&mut self, datagrams_per_second: u32) {
        self.peer_rate_cap = Some(datagrams_per_second.max(1) as f64);
    }

    /// Datagrams per second the pacer allows right now.
    fn send_rate(&self, srtt: Duration) -> f64 {
        let srtt_secs = srtt.as_secs_f64().max(0.001);
        let rate = self.cwnd / srtt_secs;
        match self.peer_rate_cap {
            Some(cap) => rate.min(cap),
            None => rate,
        }
    }

    /// Refill the pacing bucket; call once per tick before draining the scheduler.
    pub fn refill(&mut self, now: Instant, srtt: Duration) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let burst = self.cwnd.max(1.0);
        self.tokens = (self.tokens + elapsed * self.send_rate(srtt)).min(burst);
    }

    /// Whether another datagram may leave, given how many are in flight.
    pub fn may_send(&self, in_flight: usize) -> bool {
        in_flight < self.cwnd as usize && self.tokens >= 1.0
    }

    pub fn on_datagram_sent(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}
