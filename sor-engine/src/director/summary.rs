//! End-of-run summary report (`key=value` lines).

use super::StopReason;
use crate::event_log::WIRE_FORMAT_VERSION;
use crate::ipc::SharedState;
use crate::messages::Specialty;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// One opening of the elastic registration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElasticSpawn {
    pub pid: u32,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

/// A gate reset ordered by the guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftCorrection {
    pub at_minute: i64,
    pub drift: i32,
    pub reset_to: i32,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub stop_reason: StopReason,
    pub elapsed_minutes: i64,
    pub state: SharedState,
    pub elastic: Vec<ElasticSpawn>,
    pub corrections: Vec<DriftCorrection>,
    pub force_killed: Vec<String>,
    pub log_file: PathBuf,
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    /// Render the report.
    #[must_use]
    pub fn render(&self) -> String {
        let s = &self.state;
        let timing = s.timing();
        let mut out = String::new();
        let mut kv = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "{key}={value}");
        };

        kv("generated_at", &self.generated_at.to_rfc3339());
        kv("log_format_version", &WIRE_FORMAT_VERSION);
        kv("log_file", &self.log_file.display());
        kv("stop_reason", &self.stop_reason);
        kv("elapsed_sim_minutes", &self.elapsed_minutes);

        kv("waiting_room_capacity", &s.waiting_room_capacity);
        kv("waiting_room_final", &s.current_in_waiting_room);
        kv("total_patients", &s.total_patients);
        kv("triage_red", &s.triage_red);
        kv("triage_yellow", &s.triage_yellow);
        kv("triage_green", &s.triage_green);
        kv("triage_sent_home", &s.triage_sent_home);
        kv("outcome_home", &s.outcome_home);
        kv("outcome_ward", &s.outcome_ward);
        kv("outcome_other", &s.outcome_other);
        kv("dropped_units", &s.dropped_units);

        for specialty in Specialty::ALL {
            let i = specialty.index();
            let name = specialty.name();
            kv(&format!("{name}_handled"), &s.specialist_handled[i]);
            kv(&format!("{name}_home"), &s.specialist_home[i]);
            kv(&format!("{name}_ward"), &s.specialist_ward[i]);
            kv(&format!("{name}_other"), &s.specialist_other[i]);
            kv(&format!("{name}_leaves"), &s.specialist_leaves[i]);
        }

        kv("ms_per_sim_minute", &timing.ms_per_sim_minute);
        kv("duration_minutes", &timing.duration_minutes);
        kv("seed", &timing.seed);
        kv("release_point", &format!("{:?}", timing.release_point).to_lowercase());
        kv("arrival_ms", &format!("{}-{}", timing.arrival.min, timing.arrival.max));
        kv(
            "registration_ms",
            &format!("{}-{}", timing.registration.min, timing.registration.max),
        );
        kv("triage_ms", &format!("{}-{}", timing.triage.min, timing.triage.max));
        kv("exam_ms", &format!("{}-{}", timing.exam.min, timing.exam.max));
        kv("leave_ms", &format!("{}-{}", timing.leave.min, timing.leave.max));

        kv("director_pid", &s.director_pid);
        kv("logger_pid", &s.logger_pid);
        kv("registration1_pid", &s.registration1_pid);
        kv("registration2_pid", &s.registration2_pid);
        kv("triage_pid", &s.triage_pid);
        kv("generator_pid", &s.generator_pid);
        for specialty in Specialty::ALL {
            kv(
                &format!("{}_pid", specialty.name()),
                &s.specialist_pids[specialty.index()],
            );
        }

        kv("elastic_spawns", &self.elastic.len());
        for (n, spawn) in self.elastic.iter().enumerate() {
            let closed = spawn.closed_at.map_or_else(|| "open".to_string(), |m| m.to_string());
            kv(
                &format!("elastic_{n}"),
                &format!("pid={};opened={};closed={closed}", spawn.pid, spawn.opened_at),
            );
        }

        kv("drift_corrections", &self.corrections.len());
        for (n, c) in self.corrections.iter().enumerate() {
            kv(
                &format!("drift_correction_{n}"),
                &format!("minute={};drift={};reset_to={}", c.at_minute, c.drift, c.reset_to),
            );
        }

        kv("force_killed", &self.force_killed.join(","));
        out
    }

    /// Write the report to `path`.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.render().as_bytes())?;
        file.flush()
    }
}

/// Run log and summary file names for a run started at `unix_ts`.
#[must_use]
pub fn output_paths(log_dir: &Path, unix_ts: i64) -> (PathBuf, PathBuf) {
    (
        log_dir.join(format!("sor_run_{unix_ts}.log")),
        log_dir.join(format!("sor_summary_{unix_ts}.txt")),
    )
}
