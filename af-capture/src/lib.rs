//! Application capture on pooled VMs.
//!
//! A capture leases a VM from a workpool, snapshots it before and after an
//! application is installed, and builds a virtualized package from the
//! difference. [`CaptureService`] hands out tickets through which clients
//! follow a capture's [`Status`] and step it forward.

pub mod automatic;
pub mod capturer;
pub mod command;
pub mod config;
pub mod download;
pub mod drive;
pub mod error;
pub mod guest;
pub mod manual;
pub mod monitor;
pub mod mounter;
pub mod packager;
pub mod plan;
pub mod process;
pub mod request;
pub mod service;
pub mod state;
pub mod status;
pub mod vmrun;

pub use automatic::AutomaticMode;
pub use capturer::{CaptureContext, CaptureInputs, CaptureMode, CaptureSession, Capturer};
pub use command::{Command, ConversionPhase, PhaseCommands};
pub use config::CaptureConfig;
pub use error::{CaptureError, Result};
pub use guest::{GuestCommands, GuestConnector, ProgramOutput, RunProgramOptions};
pub use manual::ManualMode;
pub use plan::{Datastore, DatastoreDirectory, ProjectFile, RequestFactory, TicketRequest};
pub use process::ProcessMonitor;
pub use request::{CaptureRequest, Project};
pub use service::CaptureService;
pub use state::CaptureState;
pub use status::{Status, StatusReport};
