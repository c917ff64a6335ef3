//! Per-host pacing.
//!
//! Every host gets a delay between consecutive dispatches. With autothrottle
//! enabled the delay follows observed latency: each response pulls it halfway
//! towards `latency / target_concurrency`, and only successful responses may
//! pull it down. Without autothrottle the delay is the fixed download delay,
//! optionally jittered.

use std::collections::HashMap;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;

use crate::config::Config;

/// Meta key that excludes a response from delay adjustment.
pub const DONT_ADJUST_DELAY: &str = "autothrottle_dont_adjust_delay";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// An HTTP response arrived with this status.
    Status(u16),
    /// Timeout, connection error or any other transport failure.
    Failed,
}

impl FetchOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, FetchOutcome::Status(s) if (200..300).contains(&s))
    }
}

#[derive(Clone, Debug)]
pub struct HostThrottle {
    /// Current delay in seconds.
    pub delay: f64,
    pub floor: f64,
    pub ceiling: f64,
    pub target_concurrency: f64,
    /// Running average of the delay, for reporting.
    pub avg_delay: f64,
    pub adjustments: u64,
    last_dispatch: Option<Instant>,
    /// Jitter factor drawn at the last dispatch.
    jitter: f64,
}

impl HostThrottle {
    fn new(delay: f64, floor: f64, ceiling: f64, target_concurrency: f64) -> Self {
        Self {
            delay,
            floor,
            ceiling,
            target_concurrency,
            avg_delay: delay,
            adjustments: 0,
            last_dispatch: None,
            jitter: 1.0,
        }
    }

    /// Feed one observed latency; returns the new delay.
    pub fn adjust(&mut self, latency: Duration, outcome: FetchOutcome) -> f64 {
        let old = self.delay;
        let target = latency.as_secs_f64() / self.target_concurrency;
        let mut new = (old + target) / 2.0;
        if !outcome.is_success() {
            new = new.max(old);
        }
        self.delay = new.max(self.floor).min(self.ceiling);
        self.avg_delay = (self.avg_delay + self.delay) / 2.0;
        self.adjustments += 1;
        self.delay
    }

    /// Earliest instant the next request for this host may be dispatched.
    pub fn next_eligible(&self) -> Option<Instant> {
        self.last_dispatch
            .map(|t| t + Duration::from_secs_f64((self.delay * self.jitter).max(0.0)))
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible().map_or(true, |t| t <= now)
    }
}

pub struct AutoThrottle {
    enabled: bool,
    debug: bool,
    randomize: bool,
    download_delay: f64,
    start_delay: f64,
    max_delay: f64,
    target_concurrency: f64,
    hosts: HashMap<String, HostThrottle>,
    rng: ChaCha8Rng,
}

impl AutoThrottle {
    pub fn new(config: &Config) -> Self {
        Self::with_rng(config, ChaCha8Rng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(config: &Config, seed: u64) -> Self {
        Self::with_rng(config, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(config: &Config, rng: ChaCha8Rng) -> Self {
        Self {
            enabled: config.autothrottle_enabled,
            debug: config.autothrottle_debug,
            randomize: config.randomize_download_delay,
            download_delay: config.download_delay,
            start_delay: config.autothrottle_start_delay,
            max_delay: config.autothrottle_max_delay,
            target_concurrency: config.autothrottle_target_concurrency,
            hosts: HashMap::new(),
            rng,
        }
    }

    fn host_mut(&mut self, host: &str) -> &mut HostThrottle {
        let (start, floor, ceiling) = if self.enabled {
            (self.start_delay, self.download_delay, self.max_delay)
        } else {
            (self.download_delay, self.download_delay, self.download_delay)
        };
        let target = self.target_concurrency;
        self.hosts
            .entry(host.to_owned())
            .or_insert_with(|| HostThrottle::new(start, floor, ceiling, target))
    }

    pub fn delay(&self, host: &str) -> Option<f64> {
        self.hosts.get(host).map(|h| h.delay)
    }

    pub fn is_eligible(&self, host: &str, now: Instant) -> bool {
        self.hosts.get(host).map_or(true, |h| h.is_eligible(now))
    }

    pub fn next_eligible(&self, host: &str) -> Option<Instant> {
        self.hosts.get(host).and_then(HostThrottle::next_eligible)
    }

    /// The soonest instant after `now` at which a waiting host becomes
    /// eligible again.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.hosts
            .values()
            .filter_map(HostThrottle::next_eligible)
            .filter(|t| *t > now)
            .min()
    }

    /// Record that a request for `host` was handed to the downloader.
    pub fn on_dispatch(&mut self, host: &str, now: Instant) {
        let jitter = if !self.enabled && self.randomize {
            self.rng.gen_range(0.5..1.5)
        } else {
            1.0
        };
        let throttle = self.host_mut(host);
        throttle.last_dispatch = Some(now);
        throttle.jitter = jitter;
    }

    /// Feed a completed fetch into the controller.
    pub fn on_response(
        &mut self,
        host: &str,
        latency: Duration,
        outcome: FetchOutcome,
        dont_adjust: bool,
    ) {
        if !self.enabled || dont_adjust {
            return;
        }
        let debug = self.debug;
        let throttle = self.host_mut(host);
        let old = throttle.delay;
        let new = throttle.adjust(latency, outcome);
        if debug {
            log::info!(
                "autothrottle {}: delay {:.0} ms ({:+.0}) | avg {:.0} ms over {} | latency {:.0} ms | {:?}",
                host,
                new * 1000.0,
                (new - old) * 1000.0,
                throttle.avg_delay * 1000.0,
                throttle.adjustments,
                latency.as_secs_f64() * 1000.0,
                outcome,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled_config() -> Config {
        Config {
            autothrottle_enabled: true,
            autothrottle_start_delay: 1.0,
            download_delay: 0.5,
            autothrottle_max_delay: 10.0,
            autothrottle_target_concurrency: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_converges_to_latency_over_concurrency() {
        let mut at = AutoThrottle::with_seed(&throttled_config(), 1);
        for _ in 0..40 {
            at.on_response("a.com", Duration::from_secs(4), FetchOutcome::Status(200), false);
        }
        let delay = at.delay("a.com").unwrap();
        assert!((delay - 2.0).abs() < 1e-6, "delay {}", delay);
    }

    #[test]
    fn test_failure_never_speeds_up() {
        let mut at = AutoThrottle::with_seed(&throttled_config(), 1);
        at.on_response("a.com", Duration::from_secs(8), FetchOutcome::Status(200), false);
        let before = at.delay("a.com").unwrap();

        at.on_response("a.com", Duration::from_millis(1), FetchOutcome::Status(503), false);
        assert!(at.delay("a.com").unwrap() >= before);
        at.on_response("a.com", Duration::ZERO, FetchOutcome::Failed, false);
        assert!(at.delay("a.com").unwrap() >= before);

        at.on_response("a.com", Duration::from_secs(60), FetchOutcome::Failed, false);
        assert!(at.delay("a.com").unwrap() > before);
    }

    #[test]
    fn test_delay_stays_within_bounds() {
        let config = throttled_config();
        let mut at = AutoThrottle::with_seed(&config, 7);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..500 {
            let latency = Duration::from_millis(rng.gen_range(0..60_000));
            let outcome = if rng.gen_bool(0.7) {
                FetchOutcome::Status(200)
            } else {
                FetchOutcome::Status(500)
            };
            at.on_response("a.com", latency, outcome, false);
            let delay = at.delay("a.com").unwrap();
            assert!(delay >= config.download_delay && delay <= config.autothrottle_max_delay);
        }
    }

    #[test]
    fn test_adjust_tracks_running_average() {
        let mut host = HostThrottle::new(1.0, 0.5, 10.0, 2.0);
        assert_eq!(host.adjust(Duration::from_secs(4), FetchOutcome::Status(200)), 1.5);
        host.adjust(Duration::from_secs(4), FetchOutcome::Failed);
        assert_eq!(host.adjustments, 2);
        assert!((host.avg_delay - 1.5).abs() < 1e-9, "avg {}", host.avg_delay);
    }

    #[test]
    fn test_start_delay_is_not_clamped() {
        let config = Config {
            autothrottle_start_delay: 0.1,
            ..throttled_config()
        };
        let mut at = AutoThrottle::with_seed(&config, 1);
        at.on_dispatch("a.com", Instant::now());
        assert_eq!(at.delay("a.com"), Some(0.1));
        at.on_response("a.com", Duration::ZERO, FetchOutcome::Status(200), false);
        assert_eq!(at.delay("a.com"), Some(0.5));
    }

    #[test]
    fn test_dont_adjust_and_disabled() {
        let mut at = AutoThrottle::with_seed(&throttled_config(), 1);
        at.on_dispatch("a.com", Instant::now());
        at.on_response("a.com", Duration::from_secs(9), FetchOutcome::Status(200), true);
        assert_eq!(at.delay("a.com"), Some(1.0));

        let config = Config {
            download_delay: 2.0,
            randomize_download_delay: false,
            ..Default::default()
        };
        let mut at = AutoThrottle::with_seed(&config, 1);
        at.on_dispatch("a.com", Instant::now());
        at.on_response("a.com", Duration::from_secs(9), FetchOutcome::Status(200), false);
        assert_eq!(at.delay("a.com"), Some(2.0));
    }

    #[test]
    fn test_eligibility_follows_delay() {
        let config = Config {
            download_delay: 2.0,
            randomize_download_delay: false,
            ..Default::default()
        };
        let mut at = AutoThrottle::with_seed(&config, 1);
        let now = Instant::now();
        assert!(at.is_eligible("a.com", now));

        at.on_dispatch("a.com", now);
        assert!(!at.is_eligible("a.com", now + Duration::from_secs(1)));
        assert!(at.is_eligible("a.com", now + Duration::from_secs(2)));
        assert!(at.is_eligible("b.com", now));
        assert_eq!(at.next_wakeup(now), Some(now + Duration::from_secs(2)));
        assert_eq!(at.next_wakeup(now + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_randomized_delay_range() {
        let config = Config {
            download_delay: 2.0,
            ..Default::default()
        };
        let mut at = AutoThrottle::with_seed(&config, 3);
        let now = Instant::now();
        for _ in 0..50 {
            at.on_dispatch("a.com", now);
            let wait = at.next_eligible("a.com").unwrap() - now;
            assert!(wait >= Duration::from_secs(1) && wait < Duration::from_secs(3));
        }
    }
}
