//! Simulated recipient behaviour: whether to open, whether and when to reply.

use crate::model::WarmupConfig;

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngagementPolicy {
    /// Probability that an inbox message is opened. `1.0` opens everything.
    pub open_probability: f64,
    /// Fixed reply delay for messages rescued from spam.
    pub rescued_reply_delay: Duration,
}

impl Default for EngagementPolicy {
    fn default() -> Self {
        Self {
            open_probability: 1.0,
            rescued_reply_delay: Duration::from_secs(5),
        }
    }
}

/// What to do with one located message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementDecision {
    pub open: bool,
    pub reply: bool,
    /// Delay between the open and the reply.
    pub reply_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EngagementSimulator {
    policy: EngagementPolicy,
}

impl EngagementSimulator {
    pub fn new(policy: EngagementPolicy) -> Self {
        Self { policy }
    }

    /// Draw the engagement for one message.
    ///
    /// Rescued messages are always opened and answered after the short fixed
    /// delay. Everything else replies with probability `target_reply_rate / 100`
    /// after a uniform delay in `[0, read_delay_seconds]`.
    pub fn decide<R: Rng>(
        &self,
        rescued: bool,
        config: &WarmupConfig,
        rng: &mut R,
    ) -> EngagementDecision {
        if rescued {
            return EngagementDecision {
                open: true,
                reply: true,
                reply_delay: self.policy.rescued_reply_delay,
            };
        }

        let open = rng.random_bool(self.policy.open_probability.clamp(0.0, 1.0));
        if !open {
            return EngagementDecision {
                open: false,
                reply: false,
                reply_delay: Duration::ZERO,
            };
        }

        let reply_probability = (config.target_reply_rate / 100.0).clamp(0.0, 1.0);
        let reply = rng.random_bool(reply_probability);
        let reply_delay = if reply {
            self.reply_delay(config, rng)
        } else {
            Duration::ZERO
        };

        EngagementDecision {
            open,
            reply,
            reply_delay,
        }
    }

    pub fn reply_delay<R: Rng>(&self, config: &WarmupConfig, rng: &mut R) -> Duration {
        if config.read_delay_seconds == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(u64::from(rng.random_range(0..=config.read_delay_seconds)))
    }
}
