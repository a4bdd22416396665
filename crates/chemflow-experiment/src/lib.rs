//! Method execution for the chemflow bench.
//!
//! A method is a flat list of [`Command`]s. The [`Dispatcher`] validates each
//! one into an [`Action`], resolves its device through the registry, runs it
//! (pump runs go to the [`Scheduler`] in the background) and writes one
//! [`LogEntry`] per outcome.
//!
//! ```rust,ignore
//! let log = Arc::new(MemoryRunLog::new());
//! let mut dispatcher = Dispatcher::new(Arc::new(registry), RunLogger::new(log.clone()));
//! let summary = dispatcher
//!     .run(vec![
//!         Command::new("Pump", "dispense").with_params("flow_rate=1000,volume=500,pump_id=1"),
//!         Command::sync(),
//!     ])
//!     .await?;
//! ```

pub mod command;
pub mod dispatcher;
pub mod params;
pub mod resolve;
pub mod run_log;
pub mod scheduler;

pub use command::{parse_kv_params, Command, Component, DEFAULT_DELAY, DEFAULT_SCRIPT_DELAY};
pub use dispatcher::{Dispatcher, EngineState, RunControl, RunSummary};
pub use params::{Action, DeviceId, ValveTarget, XyTarget, ZTarget};
pub use resolve::Resolver;
pub use run_log::{LogEntry, MemoryRunLog, RunLogSink, RunLogger};
pub use scheduler::{BarrierReport, OperationLabel, PendingOperation, Scheduler};
