//! Configuration loading and management for the simulation.
//!
//! The configuration is stored in TOML format and defines:
//! - Waiting room size and the elastic registration threshold
//! - Simulated-time scale and service-time ranges
//! - Director cadences (control tick, leave injection, drift audit)
//! - Channel retry and polling behaviour
//! - Output directory and IPC key path

use crate::cli::RunArgs;
use crate::timing::{scale_minutes, MsRange, ReleasePoint, Timing};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Name of the configuration file looked up in the working directory and
/// the XDG config directory.
pub const CONFIG_FILE_NAME: &str = "sor.toml";

/// Largest capacity a single `semop` can move at once.
pub const MAX_CAPACITY: i32 = i16::MAX as i32;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),

    #[error("Path does not exist: {0}")]
    PathNotFound(PathBuf),
}

/// Interval in simulated minutes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MinutesRange {
    pub min: f64,
    pub max: f64,
}

impl MinutesRange {
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Wall-clock range for the given scale.
    #[must_use]
    pub fn scaled(&self, ms_per_sim_minute: u64) -> MsRange {
        MsRange::new(
            scale_minutes(self.min, ms_per_sim_minute),
            scale_minutes(self.max, ms_per_sim_minute),
        )
    }

    fn check(&self, name: &str) -> Result<(), ConfigError> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min < 0.0 || self.min > self.max {
            return Err(ConfigError::ValidationError(format!(
                "timing.{name} must satisfy 0 <= min <= max (got {} .. {})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Waiting room settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingRoomConfig {
    /// Places in the waiting room (permits in the capacity gate).
    #[serde(default = "default_capacity")]
    pub capacity: i32,

    /// Registration backlog at which the second window opens.
    #[serde(default = "default_open_threshold")]
    pub registration_open_threshold: i32,

    /// Stage that returns a unit's permits to the gate.
    #[serde(default)]
    pub release_point: ReleasePoint,
}

const fn default_capacity() -> i32 {
    10
}

const fn default_open_threshold() -> i32 {
    5
}

impl Default for WaitingRoomConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            registration_open_threshold: default_open_threshold(),
            release_point: ReleasePoint::default(),
        }
    }
}

/// Simulated time settings. Ranges are in simulated minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Wall-clock milliseconds per simulated minute.
    #[serde(default = "default_ms_per_sim_minute")]
    pub ms_per_sim_minute: u64,

    /// Run length in simulated minutes.
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u64,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_arrival")]
    pub arrival: MinutesRange,

    #[serde(default = "default_registration")]
    pub registration: MinutesRange,

    #[serde(default = "default_triage")]
    pub triage: MinutesRange,

    #[serde(default = "default_exam")]
    pub specialist_exam: MinutesRange,

    #[serde(default = "default_leave")]
    pub specialist_leave: MinutesRange,
}

const fn default_ms_per_sim_minute() -> u64 {
    100
}

const fn default_duration_minutes() -> u64 {
    60
}

const fn default_seed() -> u64 {
    12345
}

const fn default_arrival() -> MinutesRange {
    MinutesRange::new(0.5, 2.5)
}

const fn default_registration() -> MinutesRange {
    MinutesRange::new(0.5, 1.5)
}

const fn default_triage() -> MinutesRange {
    MinutesRange::new(0.5, 1.0)
}

const fn default_exam() -> MinutesRange {
    MinutesRange::new(0.5, 2.0)
}

const fn default_leave() -> MinutesRange {
    MinutesRange::new(5.0, 25.0)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ms_per_sim_minute: default_ms_per_sim_minute(),
            duration_minutes: default_duration_minutes(),
            seed: default_seed(),
            arrival: default_arrival(),
            registration: default_registration(),
            triage: default_triage(),
            specialist_exam: default_exam(),
            specialist_leave: default_leave(),
        }
    }
}

/// Director control loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectorConfig {
    /// Reset the gate when the same permits are missing on two audits in a row.
    #[serde(default)]
    pub reconciliation_guardrail: bool,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_leave_period_ms")]
    pub leave_period_ms: u64,

    #[serde(default = "default_leave_probability")]
    pub leave_probability_percent: u32,

    #[serde(default = "default_audit_period_ms")]
    pub audit_period_ms: u64,

    /// Wait for a signalled worker before killing it.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

const fn default_tick_ms() -> u64 {
    100
}

const fn default_leave_period_ms() -> u64 {
    1000
}

const fn default_leave_probability() -> u32 {
    5
}

const fn default_audit_period_ms() -> u64 {
    5000
}

const fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            reconciliation_guardrail: false,
            tick_ms: default_tick_ms(),
            leave_period_ms: default_leave_period_ms(),
            leave_probability_percent: default_leave_probability(),
            audit_period_ms: default_audit_period_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl DirectorConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Patient generator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Most patient processes alive at once.
    #[serde(default = "default_max_live_patients")]
    pub max_live_patients: u32,
}

const fn default_max_live_patients() -> u32 {
    2000
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_live_patients: default_max_live_patients(),
        }
    }
}

/// Message channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Attempts before a send to a full channel gives up.
    #[serde(default = "default_send_retry_limit")]
    pub send_retry_limit: u32,

    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_ms: u64,

    /// How often blocking waits recheck the shutdown flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Requested `msg_qbytes`; 0 keeps the system default.
    #[serde(default = "default_queue_bytes")]
    pub queue_bytes: usize,
}

const fn default_send_retry_limit() -> u32 {
    5000
}

const fn default_send_backoff_ms() -> u64 {
    1
}

const fn default_poll_interval_ms() -> u64 {
    5
}

const fn default_queue_bytes() -> usize {
    262_144
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_retry_limit: default_send_retry_limit(),
            send_backoff_ms: default_send_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_bytes: default_queue_bytes(),
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    /// Directory for the run log and the summary report.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

/// IPC settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcConfig {
    /// Existing file used to derive the IPC keys. Defaults to the executable.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Complete simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    #[serde(default)]
    pub waiting_room: WaitingRoomConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub director: DirectorConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub ipc: IpcConfig,
}

impl SimulationConfig {
    /// Read a configuration file without validating it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load and validate configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find the configuration to use, without validating it.
    ///
    /// An explicit path must exist. Otherwise `sor.toml` in the working
    /// directory, then in the XDG config directory; built-in defaults if
    /// neither exists.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::PathNotFound(path.to_path_buf()));
            }
            info!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            info!("Loading configuration from {}", local.display());
            return Self::from_file(&local);
        }

        if let Some(dirs) = directories::ProjectDirs::from("org", "sor", "sor-engine") {
            let xdg_config = dirs.config_dir().join(CONFIG_FILE_NAME);
            if xdg_config.exists() {
                info!("Loading configuration from {}", xdg_config.display());
                return Self::from_file(&xdg_config);
            }
        }

        info!("No configuration file found; using defaults");
        Ok(Self::default())
    }

    /// Apply command-line overrides.
    pub fn apply_overrides(&mut self, args: &RunArgs) {
        if let Some(capacity) = args.capacity {
            self.waiting_room.capacity = capacity;
        }
        if let Some(threshold) = args.threshold {
            self.waiting_room.registration_open_threshold = threshold;
        }
        if let Some(duration) = args.duration {
            self.timing.duration_minutes = duration;
        }
        if let Some(seed) = args.seed {
            self.timing.seed = seed;
        }
        if args.guardrail {
            self.director.reconciliation_guardrail = true;
        }
    }

    /// Validate the configuration (pure function).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
        let room = &self.waiting_room;

        if room.capacity <= 0 || room.capacity > MAX_CAPACITY {
            return invalid(format!(
                "waiting_room.capacity must be in 1..={MAX_CAPACITY} (got {})",
                room.capacity
            ));
        }
        if room.registration_open_threshold <= 0
            || i64::from(room.registration_open_threshold) * 2 < i64::from(room.capacity) {
            return invalid(format!(
                "waiting_room.registration_open_threshold must be positive and at least capacity/2 (got {} for capacity {})",
                room.registration_open_threshold, room.capacity
            ));
        }
        if self.timing.ms_per_sim_minute == 0 {
            return invalid("timing.ms_per_sim_minute must be positive".to_string());
        }
        if self.timing.duration_minutes == 0 {
            return invalid("timing.duration_minutes must be positive".to_string());
        }
        self.timing.arrival.check("arrival")?;
        self.timing.registration.check("registration")?;
        self.timing.triage.check("triage")?;
        self.timing.specialist_exam.check("specialist_exam")?;
        self.timing.specialist_leave.check("specialist_leave")?;

        if self.director.leave_probability_percent > 100 {
            return invalid(format!(
                "director.leave_probability_percent must be at most 100 (got {})",
                self.director.leave_probability_percent
            ));
        }
        if self.generator.max_live_patients == 0 {
            return invalid("generator.max_live_patients must be positive".to_string());
        }
        if self.channels.send_retry_limit == 0 {
            return invalid("channels.send_retry_limit must be positive".to_string());
        }
        Ok(())
    }

    /// Scaled timing for a run whose clock started at `sim_start_ms`.
    #[must_use]
    pub fn timing(&self, sim_start_ms: i64) -> Timing {
        let scale = self.timing.ms_per_sim_minute;
        Timing {
            ms_per_sim_minute: scale,
            duration_minutes: self.timing.duration_minutes,
            arrival: self.timing.arrival.scaled(scale),
            registration: self.timing.registration.scaled(scale),
            triage: self.timing.triage.scaled(scale),
            exam: self.timing.specialist_exam.scaled(scale),
            leave: self.timing.specialist_leave.scaled(scale),
            max_live_patients: self.generator.max_live_patients,
            send_retry_limit: self.channels.send_retry_limit,
            send_backoff: Duration::from_millis(self.channels.send_backoff_ms),
            poll_interval: Duration::from_millis(self.channels.poll_interval_ms.max(1)),
            seed: self.timing.seed,
            release_point: self.waiting_room.release_point,
            sim_start_ms,
        }
    }

    /// File the IPC keys are derived from.
    #[must_use]
    pub fn resolve_key_path(&self, exe: &Path) -> PathBuf {
        self.ipc.key_path.clone().unwrap_or_else(|| exe.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config = SimulationConfig::parse("")?;
        assert_eq!(config.waiting_room.capacity, 10);
        assert_eq!(config.waiting_room.registration_open_threshold, 5);
        assert_eq!(config.waiting_room.release_point, ReleasePoint::Registration);
        assert_eq!(config.timing.ms_per_sim_minute, 100);
        assert_eq!(config.timing.seed, 12345);
        assert_eq!(config.generator.max_live_patients, 2000);
        assert_eq!(config.channels.send_retry_limit, 5000);
        assert!(!config.director.reconciliation_guardrail);
        Ok(())
    }

    #[test]
    fn test_parse_full_config() -> Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
[waiting_room]
capacity = 20
registration_open_threshold = 12
release_point = "terminal"

[timing]
ms_per_sim_minute = 50
duration_minutes = 30
seed = 7
arrival = { min = 1.0, max = 2.0 }
specialist_leave = { min = 10.0, max = 10.0 }

[director]
reconciliation_guardrail = true
tick_ms = 20
leave_probability_percent = 100

[channels]
queue_bytes = 0

[output]
log_dir = "runs"

[ipc]
key_path = "/tmp"
"#;
        let config = SimulationConfig::parse(toml)?;
        assert_eq!(config.waiting_room.capacity, 20);
        assert_eq!(config.waiting_room.release_point, ReleasePoint::Terminal);
        assert_eq!(config.timing.arrival, MinutesRange::new(1.0, 2.0));
        assert_eq!(config.timing.triage, MinutesRange::new(0.5, 1.0));
        assert!(config.director.reconciliation_guardrail);
        assert_eq!(config.output.log_dir, PathBuf::from("runs"));
        assert_eq!(config.resolve_key_path(Path::new("/usr/bin/sor")), PathBuf::from("/tmp"));

        let timing = config.timing(1_000);
        assert_eq!(timing.arrival, MsRange::new(50, 100));
        assert_eq!(timing.leave, MsRange::new(500, 500));
        assert_eq!(timing.release_point, ReleasePoint::Terminal);
        assert_eq!(timing.sim_start_ms, 1_000);
        Ok(())
    }

    #[test]
    fn test_threshold_below_half_capacity_rejected() {
        let toml = r#"
[waiting_room]
capacity = 10
registration_open_threshold = 4
"#;
        let Err(err) = SimulationConfig::parse(toml) else {
            panic!("expected threshold validation to fail");
        };
        assert!(err.to_string().contains("registration_open_threshold"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[waiting_room]\ncapacity = 0",
            "[waiting_room]\ncapacity = 40000\nregistration_open_threshold = 20000",
            "[timing]\nms_per_sim_minute = 0",
            "[timing]\nduration_minutes = 0",
            "[timing]\ntriage = { min = 2.0, max = 1.0 }",
            "[timing]\narrival = { min = -1.0, max = 1.0 }",
            "[director]\nleave_probability_percent = 101",
            "[generator]\nmax_live_patients = 0",
            "[channels]\nsend_retry_limit = 0",
        ];
        for case in cases {
            assert!(
                matches!(SimulationConfig::parse(case), Err(ConfigError::ValidationError(_))),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn test_overrides_applied_before_validation() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = SimulationConfig::default();
        config.apply_overrides(&RunArgs {
            capacity: Some(30),
            threshold: Some(15),
            duration: Some(5),
            seed: Some(99),
            guardrail: true,
            ..RunArgs::default()
        });
        config.validate()?;
        assert_eq!(config.waiting_room.capacity, 30);
        assert_eq!(config.timing.duration_minutes, 5);
        assert_eq!(config.timing.seed, 99);
        assert!(config.director.reconciliation_guardrail);

        config.apply_overrides(&RunArgs {
            threshold: Some(3),
            ..RunArgs::default()
        });
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_discover_explicit_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[waiting_room]\ncapacity = 14\nregistration_open_threshold = 7\n")?;
        let config = SimulationConfig::discover(Some(&path))?;
        assert_eq!(config.waiting_room.capacity, 14);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            SimulationConfig::discover(Some(&missing)),
            Err(ConfigError::PathNotFound(_))
        ));
        Ok(())
    }
}
