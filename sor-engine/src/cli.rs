//! Command line: the interactive `run` mode and the hidden worker modes the
//! director and generator use to start child processes.

use crate::messages::SPECIALIST_COUNT;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// SOR emergency department simulation
#[derive(Parser, Debug)]
#[command(name = "sor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Mode>,
}

impl Cli {
    /// The selected mode; no subcommand means `run` with defaults.
    #[must_use]
    pub fn mode(self) -> Mode {
        self.command.unwrap_or_else(|| Mode::Run(RunArgs::default()))
    }
}

/// Options of the `run` mode.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run in verbose mode (debug logging)
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the waiting-room capacity
    #[arg(long, value_name = "N")]
    pub capacity: Option<i32>,

    /// Override the registration open threshold
    #[arg(long, value_name = "K")]
    pub threshold: Option<i32>,

    /// Override the duration in simulated minutes
    #[arg(long, value_name = "MINUTES")]
    pub duration: Option<u64>,

    /// Override the random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Reset the capacity gate when permits go missing
    #[arg(long)]
    pub guardrail: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run a simulation (default)
    Run(RunArgs),

    #[command(hide = true)]
    Logger { key_path: PathBuf, log_path: PathBuf },

    #[command(hide = true)]
    Registration {
        key_path: PathBuf,
        #[arg(long)]
        elastic: bool,
    },

    #[command(hide = true)]
    Triage { key_path: PathBuf },

    #[command(hide = true)]
    Specialist {
        key_path: PathBuf,
        #[arg(value_parser = clap::value_parser!(u8).range(0..SPECIALIST_COUNT as i64))]
        index: u8,
    },

    #[command(hide = true)]
    Generator { key_path: PathBuf },

    #[command(hide = true)]
    Patient {
        key_path: PathBuf,
        id: i32,
        age: i32,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        vip: u8,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        guardian: u8,
        #[arg(value_parser = clap::value_parser!(i32).range(1..=2))]
        persons: i32,
    },
}

impl Mode {
    /// Arguments that reproduce this mode on a child's command line.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let path = |p: &PathBuf| p.to_string_lossy().into_owned();
        match self {
            Self::Run(args) => {
                let mut out = vec!["run".to_string()];
                if let Some(config) = &args.config {
                    out.extend(["--config".to_string(), path(config)]);
                }
                if args.verbose {
                    out.push("--verbose".to_string());
                }
                if let Some(n) = args.capacity {
                    out.extend(["--capacity".to_string(), n.to_string()]);
                }
                if let Some(k) = args.threshold {
                    out.extend(["--threshold".to_string(), k.to_string()]);
                }
                if let Some(d) = args.duration {
                    out.extend(["--duration".to_string(), d.to_string()]);
                }
                if let Some(s) = args.seed {
                    out.extend(["--seed".to_string(), s.to_string()]);
                }
                if args.guardrail {
                    out.push("--guardrail".to_string());
                }
                out
            }
            Self::Logger { key_path, log_path } => vec!["logger".to_string(), path(key_path), path(log_path)],
            Self::Registration { key_path, elastic } => {
                let mut out = vec!["registration".to_string(), path(key_path)];
                if *elastic {
                    out.push("--elastic".to_string());
                }
                out
            }
            Self::Triage { key_path } => vec!["triage".to_string(), path(key_path)],
            Self::Specialist { key_path, index } => {
                vec!["specialist".to_string(), path(key_path), index.to_string()]
            }
            Self::Generator { key_path } => vec!["generator".to_string(), path(key_path)],
            Self::Patient {
                key_path,
                id,
                age,
                vip,
                guardian,
                persons,
            } => vec![
                "patient".to_string(),
                path(key_path),
                id.to_string(),
                age.to_string(),
                vip.to_string(),
                guardian.to_string(),
                persons.to_string(),
            ],
        }
    }

    #[must_use]
    pub fn is_worker(&self) -> bool {
        !matches!(self, Self::Run(_))
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        matches!(self, Self::Run(args) if args.verbose)
    }
}
