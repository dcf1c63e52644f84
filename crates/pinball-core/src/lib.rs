//! # Pinball Core
//!
//! Shared vocabulary for the pinball workflow platform: the token record and
//! its ownership lease, the hierarchical name scheme that encodes workflow
//! state, the application payloads carried in token data, and the
//! `TokenMaster` trait every client is written against.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Token Master                           │
//! │   (atomic, versioned, leased, durable key-value authority)  │
//! └─────────────────────────────────────────────────────────────┘
//!                  ▲                           ▲
//!                  │ TokenMaster trait         │
//! ┌────────────────┴──────────┐   ┌────────────┴────────────────┐
//! │          Workers          │   │          Scheduler           │
//! │ (claim → run → post       │   │ (due schedules → parser →    │
//! │  events → advance/archive)│   │  instance bootstrap)         │
//! └───────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! The master is a single-threaded authority; workers and the scheduler
//! coordinate exclusively through atomic token operations and optimistic
//! version checks.

pub mod api;
pub mod clock;
pub mod error;
pub mod graph;
pub mod job;
pub mod name;
pub mod schedule;
pub mod signal;
pub mod telemetry;
pub mod token;

pub use api::{TokenMaster, TokenQuery};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::MasterError;
pub use graph::{GraphError, JobSpec, WorkflowGraph};
pub use job::{EventData, ExecutionOutcome, ExecutionRecord, JobData};
pub use name::{EventName, JobName, JobState, SignalKind};
pub use schedule::{OverrunDecision, OverrunPolicy, ScheduleData};
pub use signal::SignalData;
pub use token::{Token, INFINITE_EXPIRATION, PARKED_OWNER};
