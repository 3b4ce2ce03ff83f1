//! Application-level configuration loading, including theme palettes and
//! gameplay timing tunables.

use std::{collections::HashMap, env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::room::GameMode;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "MEMORY_ARENA_CONFIG_PATH";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    themes: HashMap<String, Vec<String>>,
    /// Delay before a missed pair is flipped back face-down.
    pub reveal_delay_ms: u64,
    /// How long peek/reveal effects stay visible client-side.
    pub peek_duration_ms: u64,
    /// How long the freeze power-up pauses the room clock.
    pub freeze_duration_ms: u64,
    /// Countdown for blitz games.
    pub blitz_time_limit_secs: u64,
    /// Countdown for games created in sudden-death mode.
    pub sudden_death_mode_limit_secs: u64,
    /// Duration of the two-card sudden-death tie breaker.
    pub sudden_death_round_secs: u64,
    /// Turn auto-pass timeout; 0 disables it.
    pub turn_timeout_secs: u64,
    /// Grace window before a disconnected player forfeits; 0 means immediate.
    pub disconnect_grace_ms: u64,
    /// Idle duration after which the sweep reaps a room.
    pub reap_after_secs: u64,
    /// Interval between inactivity sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum retained chat entries per room.
    pub chat_history: usize,
    /// Maximum chat message length after trimming.
    pub chat_max_len: usize,
    /// Probability that a card carries a power-up in regular modes.
    pub power_up_chance: f64,
    /// Probability that a card carries a power-up in powerup-frenzy mode.
    pub frenzy_power_up_chance: f64,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to baked-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        themes = config.themes.len(),
                        "loaded configuration"
                    );
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

    /// Symbol palette for a theme, if the theme exists.
    pub fn palette(&self, theme: &str) -> Option<&[String]> {
        self.themes.get(theme).map(Vec::as_slice)
    }

    /// Per-card power-up probability for the given mode.
    pub fn power_up_chance_for(&self, mode: GameMode) -> f64 {
        match mode {
            GameMode::PowerupFrenzy => self.frenzy_power_up_chance,
            _ => self.power_up_chance,
        }
    }

    /// Countdown applied at game start: mode default, overridable per room.
    pub fn time_limit_for(&self, mode: GameMode, override_secs: Option<u64>) -> Option<Duration> {
        let secs = match (mode, override_secs) {
            (_, Some(secs)) if secs > 0 => secs,
            (GameMode::Blitz, _) => self.blitz_time_limit_secs,
            (GameMode::SuddenDeath, _) => self.sudden_death_mode_limit_secs,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// Delay before a missed pair is flipped back.
    pub fn reveal_delay(&self) -> Duration {
        Duration::from_millis(self.reveal_delay_ms)
    }

    /// Duration of the sudden-death tie breaker.
    pub fn sudden_death_round(&self) -> Duration {
        Duration::from_secs(self.sudden_death_round_secs)
    }

    /// Turn auto-pass timeout, if enabled.
    pub fn turn_timeout(&self) -> Option<Duration> {
        (self.turn_timeout_secs > 0).then(|| Duration::from_secs(self.turn_timeout_secs))
    }

    /// Freeze power-up duration.
    pub fn freeze_duration(&self) -> Duration {
        Duration::from_millis(self.freeze_duration_ms)
    }

    /// Grace window before a disconnect counts as a departure.
    pub fn disconnect_grace(&self) -> Option<Duration> {
        (self.disconnect_grace_ms > 0).then(|| Duration::from_millis(self.disconnect_grace_ms))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            themes: default_themes(),
            reveal_delay_ms: 1500,
            peek_duration_ms: 3000,
            freeze_duration_ms: 10_000,
            blitz_time_limit_secs: 120,
            sudden_death_mode_limit_secs: 90,
            sudden_death_round_secs: 15,
            turn_timeout_secs: 30,
            disconnect_grace_ms: 0,
            reap_after_secs: 600,
            sweep_interval_secs: 60,
            chat_history: 200,
            chat_max_len: 500,
            power_up_chance: 0.15,
            frenzy_power_up_chance: 0.40,
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    themes: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    reveal_delay_ms: Option<u64>,
    #[serde(default)]
    peek_duration_ms: Option<u64>,
    #[serde(default)]
    freeze_duration_ms: Option<u64>,
    #[serde(default)]
    blitz_time_limit_secs: Option<u64>,
    #[serde(default)]
    sudden_death_mode_limit_secs: Option<u64>,
    #[serde(default)]
    sudden_death_round_secs: Option<u64>,
    #[serde(default)]
    turn_timeout_secs: Option<u64>,
    #[serde(default)]
    disconnect_grace_ms: Option<u64>,
    #[serde(default)]
    reap_after_secs: Option<u64>,
    #[serde(default)]
    sweep_interval_secs: Option<u64>,
    #[serde(default)]
    chat_history: Option<usize>,
    #[serde(default)]
    chat_max_len: Option<usize>,
    #[serde(default)]
    power_up_chance: Option<f64>,
    #[serde(default)]
    frenzy_power_up_chance: Option<f64>,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            themes: raw.themes.unwrap_or(defaults.themes),
            reveal_delay_ms: raw.reveal_delay_ms.unwrap_or(defaults.reveal_delay_ms),
            peek_duration_ms: raw.peek_duration_ms.unwrap_or(defaults.peek_duration_ms),
            freeze_duration_ms: raw.freeze_duration_ms.unwrap_or(defaults.freeze_duration_ms),
            blitz_time_limit_secs: raw
                .blitz_time_limit_secs
                .unwrap_or(defaults.blitz_time_limit_secs),
            sudden_death_mode_limit_secs: raw
                .sudden_death_mode_limit_secs
                .unwrap_or(defaults.sudden_death_mode_limit_secs),
            sudden_death_round_secs: raw
                .sudden_death_round_secs
                .unwrap_or(defaults.sudden_death_round_secs),
            turn_timeout_secs: raw.turn_timeout_secs.unwrap_or(defaults.turn_timeout_secs),
            disconnect_grace_ms: raw
                .disconnect_grace_ms
                .unwrap_or(defaults.disconnect_grace_ms),
            reap_after_secs: raw.reap_after_secs.unwrap_or(defaults.reap_after_secs),
            sweep_interval_secs: raw
                .sweep_interval_secs
                .unwrap_or(defaults.sweep_interval_secs),
            chat_history: raw.chat_history.unwrap_or(defaults.chat_history),
            chat_max_len: raw.chat_max_len.unwrap_or(defaults.chat_max_len),
            power_up_chance: raw.power_up_chance.unwrap_or(defaults.power_up_chance),
            frenzy_power_up_chance: raw
                .frenzy_power_up_chance
                .unwrap_or(defaults.frenzy_power_up_chance),
        }
    }
}

/// Resolve the configuration path from the environment or the default location.
fn resolve_config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Built-in theme palettes. Each palette holds 32 symbols so it can cover the
/// largest (8x8) board.
fn default_themes() -> HashMap<String, Vec<String>> {
    let animals = [
        "🐶", "🐱", "🐭", "🐹", "🐰", "🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐮", "🐷", "🐸",
        "🐵", "🐔", "🐧", "🐦", "🐤", "🦆", "🦅", "🦉", "🦇", "🐺", "🐗", "🐴", "🦄", "🐝",
        "🐛", "🦋", "🐌", "🐞",
    ];
    let foods = [
        "🍎", "🍐", "🍊", "🍋", "🍌", "🍉", "🍇", "🍓", "🍒", "🍑", "🥭", "🍍", "🥥", "🥝",
        "🍅", "🥑", "🥦", "🥕", "🌽", "🥔", "🍞", "🥐", "🥨", "🧀", "🍔", "🍕", "🌮", "🍣",
        "🍪", "🍩", "🍰", "🍫",
    ];
    let shapes = [
        "🔴", "🟠", "🟡", "🟢", "🔵", "🟣", "🟤", "⚫", "⚪", "🟥", "🟧", "🟨", "🟩", "🟦",
        "🟪", "🟫", "⬛", "⬜", "🔶", "🔷", "🔸", "🔹", "🔺", "🔻", "💠", "🔘", "⭐", "🌟",
        "✨", "💫", "🎯", "🎲",
    ];
    let space = [
        "🚀", "🛸", "🌍", "🌕", "🌙", "☄️", "🪐", "🌌", "👽", "🤖", "🛰️", "🔭", "🌠", "🌑",
        "🌒", "🌓", "🌔", "🌖", "🌗", "🌘", "🌎", "🌏", "⚡", "🔥", "💥", "❄️", "🌈", "☁️",
        "🌪️", "🌊", "🗿", "💎",
    ];

    [
        ("animals", animals),
        ("foods", foods),
        ("shapes", shapes),
        ("space", space),
    ]
    .into_iter()
    .map(|(name, symbols)| {
        (
            name.to_string(),
            symbols.iter().map(ToString::to_string).collect(),
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_palettes_cover_largest_board() {
        let config = AppConfig::default();
        for theme in ["animals", "foods", "shapes", "space"] {
            let palette = config.palette(theme).expect("built-in theme");
            assert!(palette.len() >= 32, "palette `{theme}` too small");
        }
    }

    #[test]
    fn unknown_theme_is_none() {
        assert!(AppConfig::default().palette("nonexistent").is_none());
    }

    #[test]
    fn frenzy_mode_gets_denser_power_ups() {
        let config = AppConfig::default();
        assert!(
            config.power_up_chance_for(GameMode::PowerupFrenzy)
                > config.power_up_chance_for(GameMode::Classic)
        );
    }

    #[test]
    fn blitz_always_has_a_clock() {
        let config = AppConfig::default();
        assert!(config.time_limit_for(GameMode::Blitz, None).is_some());
        assert!(config.time_limit_for(GameMode::Classic, None).is_none());
        assert_eq!(
            config.time_limit_for(GameMode::Classic, Some(60)),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn partial_raw_config_keeps_defaults() {
        let raw: RawConfig = serde_json::from_str(r#"{ "reveal_delay_ms": 200 }"#).unwrap();
        let config: AppConfig = raw.into();
        assert_eq!(config.reveal_delay_ms, 200);
        assert_eq!(config.chat_max_len, AppConfig::default().chat_max_len);
    }
}
