//! The send simulator: a deterministic local fault injector for testing.
//!
//! When enabled, outgoing datagrams are held in a time-sorted delay queue with a
//!  release time of `now + constant + Uniform(0, random)`, or dropped outright with
//!  the configured probability. Only the local send side is affected; the peer just
//!  sees jitter and loss.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulatorParams {
    pub enabled: bool,
    pub constant_packet_send_delay: Duration,
    pub uniform_random_packet_send_delay: Duration,
    /// in `[0, 1]`
    pub packet_loss_rate: f64,
}

impl Default for SimulatorParams {
    fn default() -> SimulatorParams {
        SimulatorParams {
            enabled: false,
            constant_packet_send_delay: Duration::ZERO,
            uniform_random_packet_send_delay: Duration::ZERO,
            packet_loss_rate: 0.0,
        }
    }
}

struct DelayedDatagram {
    release_at: Instant,
    insertion: u64,
    bytes: Vec<u8>,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.insertion == other.insertion
    }
}
impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-release-first
        other
            .release_at
            .cmp(&self.release_at)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

pub enum SimulatorVerdict {
    /// Simulator disabled or zero delay drawn; send on the spot.
    SendNow(Vec<u8>),
    /// Held in the delay queue; poll `due` later.
    Delayed,
    /// Lost to the configured drop probability.
    Dropped,
}

pub struct SendSimulator {
    params: SimulatorParams,
    queue: BinaryHeap<DelayedDatagram>,
    insertion_counter: u64,
    rng: SmallRng,
}

impl SendSimulator {
    pub fn new() -> SendSimulator {
        Self::with_rng(SmallRng::from_rng(&mut rand::rng()))
    }

    pub fn with_rng(rng: SmallRng) -> SendSimulator {
        SendSimulator {
            params: SimulatorParams::default(),
            queue: BinaryHeap::new(),
            insertion_counter: 0,
            rng,
        }
    }

    pub fn configure(&mut self, params: SimulatorParams) {
        self.params = params;
    }

    pub fn params(&self) -> &SimulatorParams {
        &self.params
    }

    pub fn offer(&mut self, bytes: Vec<u8>, now: Instant) -> SimulatorVerdict {
        if !self.params.enabled {
            return SimulatorVerdict::SendNow(bytes);
        }

        if self.params.packet_loss_rate > 0.0
            && self.rng.random::<f64>() < self.params.packet_loss_rate
        {
            trace!("simulator: dropping datagram of {} bytes", bytes.len());
            return SimulatorVerdict::Dropped;
        }

        let mut delay = self.params.constant_packet_send_delay;
        let jitter = self.params.uniform_random_packet_send_delay;
        if !jitter.is_zero() {
            delay += jitter.mul_f64(self.rng.random::<f64>());
        }

        if delay.is_zero() {
            return SimulatorVerdict::SendNow(bytes);
        }

        self.queue.push(DelayedDatagram {
            release_at: now + delay,
            insertion: self.insertion_counter,
            bytes,
        });
        self.insertion_counter += 1;
        SimulatorVerdict::Delayed
    }

    /// The next datagram whose release time has passed, if any.
    pub fn due(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.queue.peek()?.release_at <= now {
            Some(self.queue.pop().unwrap().bytes)
        } else {
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SendSimulator {
        SendSimulator::with_rng(SmallRng::seed_from_u64(12345))
    }

    #[test]
    fn test_disabled_sends_immediately() {
        let mut sim = seeded();
        let now = Instant::now();
        match sim.offer(vec![1, 2, 3], now) {
            SimulatorVerdict::SendNow(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("disabled simulator must pass datagrams through"),
        }
    }

    #[test]
    fn test_constant_delay_releases_in_order() {
        let mut sim = seeded();
        sim.configure(SimulatorParams {
            enabled: true,
            constant_packet_send_delay: Duration::from_millis(50),
            ..Default::default()
        });

        let now = Instant::now();
        assert!(matches!(sim.offer(vec![1], now), SimulatorVerdict::Delayed));
        assert!(matches!(
            sim.offer(vec![2], now + Duration::from_millis(1)),
            SimulatorVerdict::Delayed
        ));

        assert!(sim.due(now + Duration::from_millis(49)).is_none());
        assert_eq!(sim.due(now + Duration::from_millis(50)), Some(vec![1]));
        assert!(sim.due(now + Duration::from_millis(50)).is_none());
        assert_eq!(sim.due(now + Duration::from_millis(51)), Some(vec![2]));
        assert_eq!(sim.pending(), 0);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let mut sim = seeded();
        sim.configure(SimulatorParams {
            enabled: true,
            packet_loss_rate: 1.0,
            ..Default::default()
        });

        let now = Instant::now();
        for i in 0..100u8 {
            assert!(matches!(sim.offer(vec![i], now), SimulatorVerdict::Dropped));
        }
        assert_eq!(sim.pending(), 0);
    }

    #[test]
    fn test_loss_rate_is_roughly_honored() {
        let mut sim = seeded();
        sim.configure(SimulatorParams {
            enabled: true,
            packet_loss_rate: 0.1,
            ..Default::default()
        });

        let now = Instant::now();
        let mut dropped = 0;
        for i in 0..1000u32 {
            if matches!(sim.offer(i.to_le_bytes().to_vec(), now), SimulatorVerdict::Dropped) {
                dropped += 1;
            }
        }
        assert!((50..200).contains(&dropped), "dropped {} of 1000 at 10% loss", dropped);
    }

    #[test]
    fn test_jitter_bounded_by_configuration() {
        let mut sim = seeded();
        sim.configure(SimulatorParams {
            enabled: true,
            constant_packet_send_delay: Duration::from_millis(50),
            uniform_random_packet_send_delay: Duration::from_millis(100),
            ..Default::default()
        });

        let now = Instant::now();
        for i in 0..100u32 {
            sim.offer(i.to_le_bytes().to_vec(), now);
        }

        // everything must be out by now + constant + jitter
        let mut released = 0;
        while sim.due(now + Duration::from_millis(150)).is_some() {
            released += 1;
        }
        assert_eq!(released, 100);

        // and nothing before the constant floor
        for i in 0..100u32 {
            sim.offer(i.to_le_bytes().to_vec(), now);
        }
        assert!(sim.due(now + Duration::from_millis(49)).is_none());
    }

    #[test]
    fn test_zero_delay_enabled_sends_now() {
        let mut sim = seeded();
        sim.configure(SimulatorParams { enabled: true, ..Default::default() });
        let now = Instant::now();
        assert!(matches!(sim.offer(vec![9], now), SimulatorVerdict::SendNow(_)));
    }
}
