//! Application-level configuration: arbitration window, timer durations,
//! scoring tiers, and housekeeping intervals.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::engine::records::Difficulty;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BUZZWIRE_CONFIG_PATH";

/// Points curve for one difficulty tier: the available points decay from
/// `start` down to `floor` over `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringTier {
    /// Points awarded for an instant correct answer.
    pub start: i64,
    /// Minimum points once the curve bottoms out.
    pub floor: i64,
    /// Time over which the decay runs, in milliseconds.
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct EngineConfig {
    /// Collection window opened by the first race event.
    pub race_window: Duration,
    /// Dramatic delay before a tied vote is broken at random.
    pub tiebreak_delay: Duration,
    /// Local recompute interval for the synchronized timer.
    pub timer_tick: Duration,
    /// Interval between clock-offset probes.
    pub clock_resync: Duration,
    /// Open-window duration of one turn.
    pub turn_duration: Duration,
    /// How long a rejected answer locks its actor out.
    pub lockout: Duration,
    /// Points subtracted for a rejected answer (score floors at zero).
    pub wrong_answer_penalty: i64,
    /// Decay curve for normal-difficulty turns.
    pub scoring_normal: ScoringTier,
    /// Decay curve for hard-difficulty turns.
    pub scoring_hard: ScoringTier,
    /// Idle age past which an abandoned room is reaped.
    pub room_ttl: Duration,
    /// Sweep interval of the room reaper.
    pub reaper_interval: Duration,
    /// Broadcast capacity of each per-room event channel.
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Decay curve for the given difficulty tier.
    pub fn tier(&self, difficulty: Difficulty) -> &ScoringTier {
        match difficulty {
            Difficulty::Normal => &self.scoring_normal,
            Difficulty::Hard => &self.scoring_hard,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            race_window: Duration::from_millis(150),
            tiebreak_delay: Duration::from_secs(3),
            timer_tick: Duration::from_millis(250),
            clock_resync: Duration::from_secs(30),
            turn_duration: Duration::from_secs(30),
            lockout: Duration::from_secs(8),
            wrong_answer_penalty: 25,
            scoring_normal: ScoringTier {
                start: 1_000,
                floor: 200,
                duration_ms: 30_000,
            },
            scoring_hard: ScoringTier {
                start: 1_500,
                floor: 300,
                duration_ms: 20_000,
            },
            room_ttl: Duration::from_secs(2 * 60 * 60),
            reaper_interval: Duration::from_secs(60),
            event_capacity: 64,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file; every field is optional
/// and falls back to the built-in default.
struct RawConfig {
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    race_window_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    tiebreak_delay_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    timer_tick_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    clock_resync_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    turn_duration_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    lockout_ms: Option<Duration>,
    wrong_answer_penalty: Option<i64>,
    scoring: Option<RawScoring>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    room_ttl_ms: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    reaper_interval_ms: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct RawScoring {
    normal: Option<RawTier>,
    hard: Option<RawTier>,
}

#[derive(Debug, Deserialize)]
struct RawTier {
    start: i64,
    floor: i64,
    duration_ms: u64,
}

impl From<RawTier> for ScoringTier {
    fn from(raw: RawTier) -> Self {
        Self {
            start: raw.start,
            floor: raw.floor,
            duration_ms: raw.duration_ms,
        }
    }
}

impl From<RawConfig> for EngineConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = Self::default();
        let (normal, hard) = match raw.scoring {
            Some(scoring) => (
                scoring
                    .normal
                    .map(Into::into)
                    .unwrap_or(defaults.scoring_normal),
                scoring
                    .hard
                    .map(Into::into)
                    .unwrap_or(defaults.scoring_hard),
            ),
            None => (defaults.scoring_normal, defaults.scoring_hard),
        };

        Self {
            race_window: raw.race_window_ms.unwrap_or(defaults.race_window),
            tiebreak_delay: raw.tiebreak_delay_ms.unwrap_or(defaults.tiebreak_delay),
            timer_tick: raw.timer_tick_ms.unwrap_or(defaults.timer_tick),
            clock_resync: raw.clock_resync_ms.unwrap_or(defaults.clock_resync),
            turn_duration: raw.turn_duration_ms.unwrap_or(defaults.turn_duration),
            lockout: raw.lockout_ms.unwrap_or(defaults.lockout),
            wrong_answer_penalty: raw
                .wrong_answer_penalty
                .unwrap_or(defaults.wrong_answer_penalty),
            scoring_normal: normal,
            scoring_hard: hard,
            room_ttl: raw.room_ttl_ms.unwrap_or(defaults.room_ttl),
            reaper_interval: raw.reaper_interval_ms.unwrap_or(defaults.reaper_interval),
            event_capacity: defaults.event_capacity,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
