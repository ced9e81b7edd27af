//! # Ingestion Policies
//!
//! Every tunable of the engine whose value differed between deployments
//! (window size, emission threshold, how a delta is computed, what happens to
//! negative deltas, how strict payload decoding is, how the watchdog recovers)
//! is a value here rather than a constant in the engine.
//!
//! All enums parse from the kebab-case names used on the command line and in
//! the JSON configuration file (`"windowed-sum"`, `"pass-through"`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Topic segment every relevant message carries.
pub const RELEVANCE_MARKER: &str = "energy/consumption/";

/// Fixed trailing segment of the data topic of every gateway.
pub const DEFAULT_TOPIC_SUFFIX: &str = "71435500-6791-11ce-97c6-313131303230";

/// Registry protocol class of gateways speaking the consumption pull protocol.
pub const DEFAULT_ELIGIBLE_PROTOCOL: i32 = 1;

/// Errors raised while building or parsing a policy.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("window size must be at least 2, got {0}")]
    WindowTooSmall(usize),

    #[error("emit threshold must be at least 1, got {0}")]
    ThresholdTooSmall(u32),

    #[error("register divisor must be a positive finite number, got {0}")]
    InvalidDivisor(f64),

    #[error("at least one register key is required")]
    NoRegisterKeys,

    #[error("{what} must be greater than zero")]
    ZeroDuration { what: &'static str },

    #[error("unknown {kind} '{value}' (expected one of: {expected})")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Implements `FromStr`/`Display` over a fixed table of kebab-case names.
macro_rules! named_policy {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            const NAMES: &'static str = concat!($($name, " "),+);

            /// The kebab-case name of this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = PolicyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(PolicyError::UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                        expected: $ty::NAMES.trim_end(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// How the delta of a full window is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaMode {
    /// `newest - oldest`.
    #[default]
    Boundary,
    /// Sum of consecutive differences. A step that goes backwards is read as a
    /// meter reset and contributes the new reading instead of a negative step.
    WindowedSum,
}

named_policy!(DeltaMode, "delta mode", {
    Boundary => "boundary",
    WindowedSum => "windowed-sum",
});

/// What happens to a delta below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegativeDeltaPolicy {
    /// Emitted unchanged, with a warning.
    #[default]
    PassThrough,
    /// Emitted as zero.
    Clamp,
    /// Not emitted. The window is still reset.
    Drop,
}

named_policy!(NegativeDeltaPolicy, "negative delta policy", {
    PassThrough => "pass-through",
    Clamp => "clamp",
    Drop => "drop",
});

/// How a record missing some of its configured registers is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeStrictness {
    /// Every configured register must be present and numeric.
    #[default]
    Strict,
    /// Missing registers are logged as unavailable and left out of the sum.
    /// A record with none of them is still rejected.
    Lenient,
}

named_policy!(DecodeStrictness, "decode strictness", {
    Strict => "strict",
    Lenient => "lenient",
});

/// What the watchdog does once the feed has been silent for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Re-issue every eligible subscription on the live connection.
    #[default]
    Soft,
    /// Ask the supervising layer to restart the process.
    Hard,
}

named_policy!(RecoveryStrategy, "recovery strategy", {
    Soft => "soft",
    Hard => "hard",
});

/// Shape of the per-device sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPolicy {
    /// Number of cumulative values a full window holds (N).
    pub capacity: usize,
    /// Number of times the window must be seen full before a delta is emitted.
    pub emit_threshold: u32,
    pub delta_mode: DeltaMode,
    pub negative_delta: NegativeDeltaPolicy,
}

impl WindowPolicy {
    pub fn new(
        capacity: usize,
        emit_threshold: u32,
        delta_mode: DeltaMode,
        negative_delta: NegativeDeltaPolicy,
    ) -> Result<Self, PolicyError> {
        if capacity < 2 {
            return Err(PolicyError::WindowTooSmall(capacity));
        }
        if emit_threshold < 1 {
            return Err(PolicyError::ThresholdTooSmall(emit_threshold));
        }
        Ok(Self {
            capacity,
            emit_threshold,
            delta_mode,
            negative_delta,
        })
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            capacity: 7,
            emit_threshold: 1,
            delta_mode: DeltaMode::Boundary,
            negative_delta: NegativeDeltaPolicy::PassThrough,
        }
    }
}

/// Which registers of a payload make up a device's reading, and how they scale.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadProfile {
    /// Keys of the `measures` map that are summed. Deployment specific.
    pub register_keys: Vec<String>,
    /// Raw register units per kWh.
    pub divisor: f64,
    pub strictness: DecodeStrictness,
}

impl PayloadProfile {
    pub fn new(
        register_keys: Vec<String>,
        divisor: f64,
        strictness: DecodeStrictness,
    ) -> Result<Self, PolicyError> {
        let register_keys: Vec<String> = register_keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if register_keys.is_empty() {
            return Err(PolicyError::NoRegisterKeys);
        }
        if !(divisor.is_finite() && divisor > 0.0) {
            return Err(PolicyError::InvalidDivisor(divisor));
        }
        Ok(Self {
            register_keys,
            divisor,
            strictness,
        })
    }
}

impl Default for PayloadProfile {
    fn default() -> Self {
        Self {
            register_keys: vec!["Load_0_30001".to_string(), "Load_0_30000".to_string()],
            divisor: 1000.0,
            strictness: DecodeStrictness::Strict,
        }
    }
}

/// Topic naming and subscription eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    pub suffix: String,
    pub eligible_protocol: i32,
}

impl TopicScheme {
    /// Data topic of one gateway:
    /// `energy/consumption/<device>/message/data/<suffix>`.
    pub fn topic_for(&self, device_name: &str) -> String {
        format!("{}{}/message/data/{}", RELEVANCE_MARKER, device_name, self.suffix)
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_TOPIC_SUFFIX.to_string(),
            eligible_protocol: DEFAULT_ELIGIBLE_PROTOCOL,
        }
    }
}

/// Liveness watchdog timing and recovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogPolicy {
    pub check_interval: Duration,
    /// Silence longer than this triggers recovery.
    pub silence_threshold: Duration,
    pub strategy: RecoveryStrategy,
    /// Reconcile the registry against the subscriptions on every tick.
    pub reconcile_every_tick: bool,
}

impl WatchdogPolicy {
    pub fn new(
        check_interval: Duration,
        silence_threshold: Duration,
        strategy: RecoveryStrategy,
        reconcile_every_tick: bool,
    ) -> Result<Self, PolicyError> {
        if check_interval.is_zero() {
            return Err(PolicyError::ZeroDuration {
                what: "watchdog interval",
            });
        }
        if silence_threshold.is_zero() {
            return Err(PolicyError::ZeroDuration {
                what: "silence threshold",
            });
        }
        Ok(Self {
            check_interval,
            silence_threshold,
            strategy,
            reconcile_every_tick,
        })
    }
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            silence_threshold: Duration::from_secs(660),
            strategy: RecoveryStrategy::Soft,
            reconcile_every_tick: true,
        }
    }
}
