//! SOR engine - emergency department simulation over System V IPC.
//!
//! Every actor of the department runs as its own process. They share one
//! state segment, a capacity gate semaphore and a set of priority message
//! queues, all created and removed by the director.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────────────────────────────┐
//!              │                  Director                    │
//!              │  provisioning · scaling · leave · gate audit │
//!              └──────────────────────────────────────────────┘
//!                   │ spawns + signals                  │ END
//!                   ▼                                   ▼
//! ┌───────────┐  ┌──────────────┐  ┌────────┐  ┌─────────────┐
//! │ Generator │─▶│ Registration │─▶│ Triage │─▶│ Specialists │
//! │ (patients)│  │  reg1 + reg2 │  └────────┘  │   (x6)      │
//! └───────────┘  └──────────────┘              └─────────────┘
//!        all roles ──▶ log channel ──▶ Logger ──▶ sor_run_<ts>.log
//! ```

pub mod cli;
pub mod config;
pub mod director;
pub mod event_log;
pub mod ipc;
pub mod messages;
pub mod process_manager;
pub mod random;
pub mod roles;
pub mod shutdown;
pub mod timing;

pub use config::SimulationConfig;
pub use director::{Director, RunReport, StopReason};
pub use ipc::{IpcError, IpcHandles, IpcKeys, IpcResources, SharedState};
pub use messages::{Envelope, PatientUnit, Specialty, TriageColour};
