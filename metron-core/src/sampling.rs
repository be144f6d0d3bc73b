//! Transaction Sampling

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::sanitize_rate;

/// Fidelity chosen for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingTier {
    /// Collect nothing
    Off,
    /// Wall time of the whole transaction only, no span tree
    WallTimeOnly,
    /// Full span trace
    FullTrace,
    /// Trace only explicitly watched functions
    Whitelist,
}

impl SamplingTier {
    /// True when any data is collected for the transaction
    pub fn is_profiling(self) -> bool {
        self != SamplingTier::Off
    }

    /// True when span creation is meaningful
    pub fn is_tracing(self) -> bool {
        matches!(self, SamplingTier::FullTrace | SamplingTier::Whitelist)
    }

    /// Wire name of the tier
    pub fn as_str(self) -> &'static str {
        match self {
            SamplingTier::Off => "off",
            SamplingTier::WallTimeOnly => "wall_time",
            SamplingTier::FullTrace => "full_trace",
            SamplingTier::Whitelist => "whitelist",
        }
    }
}

/// Already-parsed sample-rate override values.
///
/// The host integration layer parses headers, cookies, and environment
/// variables; the core only applies the fixed priority order: explicit call
/// parameter > inbound header > cookie > environment variable > configured
/// default. First present wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleOverrides {
    /// Explicit per-call-site rate (highest priority)
    pub parameter: Option<f64>,
    /// Rate parsed from an inbound HTTP header
    pub header: Option<f64>,
    /// Rate parsed from a cookie
    pub cookie: Option<f64>,
    /// Rate parsed from an environment variable
    pub env: Option<f64>,
}

impl SampleOverrides {
    /// No overrides; the configured default rate applies
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the explicit call-parameter rate
    pub fn with_parameter(mut self, rate: f64) -> Self {
        self.parameter = Some(rate);
        self
    }

    /// Set the header-supplied rate
    pub fn with_header(mut self, rate: f64) -> Self {
        self.header = Some(rate);
        self
    }

    /// Set the cookie-supplied rate
    pub fn with_cookie(mut self, rate: f64) -> Self {
        self.cookie = Some(rate);
        self
    }

    /// Set the environment-supplied rate
    pub fn with_env(mut self, rate: f64) -> Self {
        self.env = Some(rate);
        self
    }

    /// The highest-priority override present, if any
    pub fn effective(&self) -> Option<f64> {
        self.parameter
            .or(self.header)
            .or(self.cookie)
            .or(self.env)
    }
}

/// Explicit mode requests that bypass the random draw
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeRequest {
    /// Trace only watched functions (explicit session request)
    pub whitelist: bool,
    /// Record wall time even when the draw says Off
    pub wall_time_always_on: bool,
}

/// Decides, per transaction, whether to profile and at what fidelity.
///
/// Deterministic under a seeded RNG so tests can pin the draw.
pub struct SamplingDecider {
    default_rate: f64,
    rng: StdRng,
}

impl SamplingDecider {
    /// Create a decider with the configured default rate
    pub fn new(default_rate: f64) -> Self {
        Self {
            default_rate: sanitize_rate(default_rate),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a decider with a fixed RNG seed
    pub fn with_seed(default_rate: f64, seed: u64) -> Self {
        Self {
            default_rate: sanitize_rate(default_rate),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The effective rate after applying overrides and the
    /// malformed-value fallback.
    pub fn effective_rate(&self, overrides: &SampleOverrides) -> f64 {
        match overrides.effective() {
            Some(rate) if rate.is_finite() && (0.0..=1.0).contains(&rate) => rate,
            Some(rate) => {
                tracing::warn!(rate, "malformed sample rate override, using configured default");
                self.default_rate
            }
            None => self.default_rate,
        }
    }

    /// Decide the sampling tier for one transaction
    pub fn decide(&mut self, overrides: &SampleOverrides, mode: &ModeRequest) -> SamplingTier {
        if mode.whitelist {
            return SamplingTier::Whitelist;
        }

        let rate = self.effective_rate(overrides);
        let draw: f64 = self.rng.gen();

        match tier_for_draw(rate, draw) {
            SamplingTier::Off if mode.wall_time_always_on => SamplingTier::WallTimeOnly,
            tier => tier,
        }
    }
}

/// Pure decision function: `FullTrace` iff `draw < rate`.
///
/// `WallTimeOnly` and `Whitelist` are never chosen by the draw; they are
/// explicit mode requests applied by the caller.
pub fn tier_for_draw(rate: f64, draw: f64) -> SamplingTier {
    if draw < rate {
        SamplingTier::FullTrace
    } else {
        SamplingTier::Off
    }
}
