use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::error::ConfigError;

/// Tunables for one room session. Defaults match the mobile client.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Idle time after the last keystroke before `isTyping=false` goes out.
    pub typing_debounce: Duration,
    /// How long a remote `isTyping=true` stays visible without a refresh.
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    pub mention_limit: usize,
    pub streak: StreakConfig,
    /// Fixed delay between resubscription attempts after a channel drop.
    pub reconnect_backoff: Duration,
    pub auto_read_receipts: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StreakConfig {
    pub lookback_days: u32,
    /// Calendar days are cut at midnight in this offset. UTC unless configured.
    pub day_offset: FixedOffset,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            lookback_days: 60,
            day_offset: Utc.fix(),
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            typing_debounce: Duration::from_secs(2),
            typing_ttl: Duration::from_secs(5),
            typing_sweep_interval: Duration::from_secs(1),
            mention_limit: 5,
            streak: StreakConfig::default(),
            reconnect_backoff: Duration::from_secs(3),
            auto_read_receipts: true,
        }
    }
}

impl RoomConfig {
    /// Read `HAVEN_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "HAVEN_TYPING_DEBOUNCE_MS")? {
            config.typing_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "HAVEN_TYPING_TTL_MS")? {
            config.typing_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "HAVEN_TYPING_SWEEP_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "HAVEN_TYPING_SWEEP_MS",
                    value: ms.to_string(),
                });
            }
            config.typing_sweep_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse(&lookup, "HAVEN_MENTION_LIMIT")? {
            config.mention_limit = limit;
        }
        if let Some(days) = parse(&lookup, "HAVEN_STREAK_LOOKBACK_DAYS")? {
            config.streak.lookback_days = days;
        }
        if let Some(minutes) = parse::<i32, _>(&lookup, "HAVEN_STREAK_UTC_OFFSET_MINUTES")? {
            config.streak.day_offset = minutes
                .checked_mul(60)
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "HAVEN_STREAK_UTC_OFFSET_MINUTES",
                    value: minutes.to_string(),
                })?;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "HAVEN_RECONNECT_BACKOFF_MS")? {
            config.reconnect_backoff = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse(&lookup, "HAVEN_AUTO_READ_RECEIPTS")? {
            config.auto_read_receipts = enabled;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
