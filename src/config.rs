use std::{fs, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tunable parameters for the monitoring core, loaded from a JSON file when
/// one exists and falling back to defaults otherwise. Defaults follow the
/// deployed appliance: four MQ135 gas channels on a 0-500 AQI scale, a 5s
/// sample cadence and a 30s persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Logical sensor channels polled each sample tick.
    pub channels: Vec<String>,

    /// Short period: sampling, aggregation and actuation.
    pub sample_period_secs: u64,
    /// Long period: persistence of the averaged window.
    pub persist_period_secs: u64,
    /// Per-channel read timeout. Must stay strictly below the sample
    /// period so one hung channel cannot stall the tick.
    pub channel_timeout_ms: u64,

    /// Physical range for a plausible reading; anything outside is treated
    /// as a faulted channel.
    pub valid_min: f64,
    pub valid_max: f64,

    /// Fan hysteresis thresholds. Two distinct values: the fan latches on
    /// strictly above `fan_on_threshold` and releases at or below
    /// `fan_off_threshold`, which prevents relay chatter at the boundary.
    pub fan_on_threshold: f64,
    pub fan_off_threshold: f64,

    /// Freshener pulse trigger level, pulse width, and the minimum quiet
    /// period before the freshener may pulse again.
    pub freshener_threshold: f64,
    pub freshener_pulse_ms: u64,
    pub freshener_cooldown_secs: u64,

    /// Minimum interval between honored occupancy transitions.
    pub debounce_ms: u64,

    /// Rolling window length and the delta (in AQI units) that separates
    /// Stable from Rising/Falling.
    pub trend_window: usize,
    pub trend_threshold: f64,

    /// Remote retry shape: per-record attempt budget, how many consecutive
    /// failures trigger a backoff wave, and the backoff bounds shared by
    /// both supervised links.
    pub retry_budget: u32,
    pub consecutive_failure_backoff: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,

    /// How long shutdown waits for the final persistence flush.
    pub shutdown_flush_secs: u64,

    pub local_db_path: PathBuf,
    /// Remote store location; `None` runs the appliance local-only, the
    /// same degradation the hub applies when the hosted database is
    /// unreachable at boot.
    pub remote_db_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                "GAS1".to_string(),
                "GAS2".to_string(),
                "GAS3".to_string(),
                "GAS4".to_string(),
            ],
            sample_period_secs: 5,
            persist_period_secs: 30,
            channel_timeout_ms: 1000,
            valid_min: 0.0,
            valid_max: 500.0,
            fan_on_threshold: 220.0,
            fan_off_threshold: 200.0,
            freshener_threshold: 300.0,
            freshener_pulse_ms: 500,
            freshener_cooldown_secs: 30,
            debounce_ms: 500,
            trend_window: 6,
            trend_threshold: 10.0,
            retry_budget: 5,
            consecutive_failure_backoff: 3,
            backoff_initial_ms: 1000,
            backoff_max_secs: 60,
            shutdown_flush_secs: 5,
            local_db_path: PathBuf::from("cubicle-data/monitor.db"),
            remote_db_path: None,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("at least one sensor channel must be configured");
        }
        if self.fan_off_threshold > self.fan_on_threshold {
            bail!(
                "fan_off_threshold ({}) must not exceed fan_on_threshold ({})",
                self.fan_off_threshold,
                self.fan_on_threshold
            );
        }
        if self.channel_timeout_ms >= self.sample_period_secs * 1000 {
            bail!(
                "channel_timeout_ms ({}) must be strictly below the sample period ({}s)",
                self.channel_timeout_ms,
                self.sample_period_secs
            );
        }
        if self.valid_min >= self.valid_max {
            bail!("valid_min must be below valid_max");
        }
        if self.trend_window == 0 {
            bail!("trend_window must be at least 1");
        }
        Ok(())
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_period_secs)
    }

    pub fn persist_period(&self) -> Duration {
        Duration::from_secs(self.persist_period_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn debounce_period(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn freshener_pulse(&self) -> Duration {
        Duration::from_millis(self.freshener_pulse_ms)
    }

    pub fn freshener_cooldown(&self) -> Duration {
        Duration::from_secs(self.freshener_cooldown_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn shutdown_flush(&self) -> Duration {
        Duration::from_secs(self.shutdown_flush_secs)
    }
}
