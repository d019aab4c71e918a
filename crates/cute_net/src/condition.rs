//! Debug-only packet conditioner: randomly drops and delays datagrams to
//! exercise reliable delivery under loss.
//!
//! **Test and development use only.** A released build should never wrap its
//! transport in this.
//!
//! Adapted from the delay/loss conditioner design the reliability layer of
//! this crate family borrows its shape from: a configured drop chance, plus
//! a uniform delay window (`rand_distr`'s normal distribution isn't part of
//! this workspace's dependency set, so delays are drawn uniformly between
//! zero and `delay_max` rather than from a normal distribution). Time is
//! passed in explicitly rather than read from the clock internally, matching
//! every other tick-driven type in this crate.

use std::time::{Duration, Instant};

use rand::Rng;

/// Tunables for a [`Conditioner`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionerConfig {
    /// Chance, in `0.0..=1.0`, that a datagram is dropped outright. Values
    /// outside that range are clamped.
    pub loss_rate: f32,
    /// Upper bound of the uniform delay window applied to datagrams that
    /// survive the loss roll.
    pub delay_max: Duration,
}

struct Scheduled<E> {
    event: E,
    release_at: Instant,
}

/// Buffers and reorders/drops items of type `E` (typically a raw datagram)
/// according to a [`ConditionerConfig`].
pub struct Conditioner<E> {
    loss_rate: f32,
    delay_max: Duration,
    scheduled: Vec<Scheduled<E>>,
}

impl<E> Conditioner<E> {
    /// Builds a conditioner from `config`.
    #[must_use]
    pub fn new(config: &ConditionerConfig) -> Self {
        Self {
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            delay_max: config.delay_max,
            scheduled: Vec::new(),
        }
    }

    /// Feeds one item through the conditioner. Call [`Conditioner::drain_ready`]
    /// on later ticks to pick up items whose delay has elapsed.
    pub fn condition(&mut self, now: Instant, event: E) {
        if rand::thread_rng().gen::<f32>() < self.loss_rate {
            return;
        }
        let delay = if self.delay_max.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..=self.delay_max.as_nanos().min(u128::from(u64::MAX)) as u64))
        };
        self.scheduled.push(Scheduled {
            event,
            release_at: now + delay,
        });
    }

    /// Drains every item whose delay has elapsed as of `now`, in the order
    /// they become ready.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<E> {
        let pending = std::mem::take(&mut self.scheduled);
        let mut ready = Vec::new();
        for item in pending {
            if item.release_at <= now {
                ready.push(item);
            } else {
                self.scheduled.push(item);
            }
        }
        ready.sort_by_key(|item| item.release_at);
        ready.into_iter().map(|item| item.event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_loss_and_delay_is_immediately_ready() {
        let mut conditioner = Conditioner::new(&ConditionerConfig {
            loss_rate: 0.0,
            delay_max: Duration::ZERO,
        });
        let now = Instant::now();
        conditioner.condition(now, b"hello".to_vec());
        assert_eq!(vec![b"hello".to_vec()], conditioner.drain_ready(now));
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut conditioner = Conditioner::new(&ConditionerConfig {
            loss_rate: 1.0,
            delay_max: Duration::ZERO,
        });
        let now = Instant::now();
        conditioner.condition(now, b"hello".to_vec());
        assert!(conditioner.drain_ready(now).is_empty());
    }

    #[test]
    fn delayed_item_waits_for_its_release_time() {
        let mut conditioner = Conditioner::new(&ConditionerConfig {
            loss_rate: 0.0,
            delay_max: Duration::from_secs(10),
        });
        let now = Instant::now();
        conditioner.condition(now, 1u32);
        // immediately after, it may or may not be ready depending on the random
        // delay; but it must become ready by now + delay_max.
        assert_eq!(vec![1u32], conditioner.drain_ready(now + Duration::from_secs(10)));
    }
}
