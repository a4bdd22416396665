//! Dispatcher - command interpreter for a method run
//!
//! Walks the command list in order. For each command it honours the pause
//! flag, validates the command into an [`Action`], resolves the target device
//! through the registry, runs the operation (inline, or through the
//! [`Scheduler`] for pump runs), logs the outcome and sleeps the command's
//! delay.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌─────────┐  commands done  ┌──────────┐
//! │ Idle │──────────▶│ Running │────────────────▶│ Finished │
//! └──────┘           └────┬────┘                 └──────────┘
//!                      ▲  │ pause()
//!             resume() │  ▼
//!                    ┌────────┐
//!                    │ Paused │
//!                    └────────┘
//!   fatal error (any state) ───▶ Failed
//! ```
//!
//! Validation and not-found errors are logged and the run continues. Any
//! other error raised on the control path is fatal: it is logged, every device
//! is closed and the error is returned.

use chemflow_core::capabilities::{nominal_travel_time, PumpDirection};
use chemflow_core::{LabError, LabResult};
use chemflow_hardware::registry::DeviceRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::command::Command;
use crate::params::{Action, XyTarget, ZTarget};
use crate::resolve::Resolver;
use crate::run_log::RunLogger;
use crate::scheduler::{OperationLabel, Scheduler};

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started
    Idle,
    /// Executing commands
    Running,
    /// Waiting for resume before the next command
    Paused,
    /// All commands done, devices closed
    Finished,
    /// Stopped by a fatal error, devices closed
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Finished => write!(f, "finished"),
            EngineState::Failed => write!(f, "failed"),
        }
    }
}

struct Shared {
    paused: watch::Sender<bool>,
    state: RwLock<EngineState>,
}

/// Pause/resume handle, usable from any task while a run is in progress.
#[derive(Clone)]
pub struct RunControl {
    shared: Arc<Shared>,
}

impl RunControl {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                paused,
                state: RwLock::new(EngineState::Idle),
            }),
        }
    }

    /// Hold the run before its next command.
    pub fn pause(&self) {
        info!("Pause requested");
        self.shared.paused.send_replace(true);
    }

    /// Release a paused run.
    pub fn resume(&self) {
        info!("Resume requested");
        self.shared.paused.send_replace(false);
    }

    /// Whether a pause is requested.
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Current dispatcher state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    fn set_state(&self, state: EngineState) {
        *self.shared.state.write() = state;
    }
}

enum Step {
    Done,
    Skipped,
}

/// Totals for a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Commands that ran without error
    pub commands_executed: usize,
    /// Commands that failed with a recoverable error
    pub recoverable_failures: usize,
    /// Pump commands skipped for a non-positive rate or volume
    pub skipped: usize,
    /// Background operations that succeeded
    pub background_completed: usize,
    /// Background operations that failed
    pub background_failed: usize,
    /// Final state
    pub state: EngineState,
}

/// Executes a command list against a registry.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    logger: RunLogger,
    scheduler: Scheduler,
    control: RunControl,
}

impl Dispatcher {
    /// Dispatcher over already-registered devices.
    pub fn new(registry: Arc<DeviceRegistry>, logger: RunLogger) -> Self {
        Self {
            registry,
            scheduler: Scheduler::new(logger.clone()),
            logger,
            control: RunControl::new(),
        }
    }

    /// Pause/resume handle.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.control.state()
    }

    /// Run every command in order.
    ///
    /// Returns the fatal error if one stopped the run; devices are closed in
    /// either case.
    #[instrument(skip_all, fields(commands = commands.len()))]
    pub async fn run(&mut self, commands: Vec<Command>) -> LabResult<RunSummary> {
        if self.control.state() != EngineState::Idle {
            return Err(LabError::validation(format!(
                "cannot start: dispatcher is {}",
                self.control.state()
            )));
        }
        self.control.set_state(EngineState::Running);
        info!("Run started");

        let mut summary = RunSummary {
            commands_executed: 0,
            recoverable_failures: 0,
            skipped: 0,
            background_completed: 0,
            background_failed: 0,
            state: EngineState::Running,
        };

        for (index, command) in commands.iter().enumerate() {
            self.wait_while_paused(index).await;

            match self.execute(command, &mut summary).await {
                Ok(Step::Done) => summary.commands_executed += 1,
                Ok(Step::Skipped) => summary.skipped += 1,
                Err(e) if e.is_recoverable() => {
                    warn!(component = %command.component, action = %command.action, error = %e, "command failed, continuing");
                    summary.recoverable_failures += 1;
                    self.logger.log(
                        &command.component,
                        &command.action,
                        command.params_text(),
                        format!("Error: {e}"),
                        &command.notes,
                    );
                }
                Err(e) => return Err(self.abort(command, e).await),
            }

            tokio::time::sleep(command.delay).await;
        }

        if !self.scheduler.is_empty() {
            let report = self.scheduler.wait_all().await;
            summary.background_completed += report.completed;
            summary.background_failed += report.failed;
            self.logger.log(
                "RUN",
                "wait_for_pumps",
                "",
                "All pumps finished",
                format!("{} completed, {} failed", report.completed, report.failed),
            );
        }

        let close_failures = self.registry.close_all().await;
        self.control.set_state(EngineState::Finished);
        summary.state = EngineState::Finished;
        self.logger.log(
            "RUN",
            "finished",
            "",
            format!("{} commands executed", summary.commands_executed),
            format!(
                "{} recoverable failures, {} close failures",
                summary.recoverable_failures, close_failures
            ),
        );
        info!(?summary, "Run complete");
        Ok(summary)
    }

    async fn wait_while_paused(&self, index: usize) {
        let mut paused = self.control.shared.paused.subscribe();
        if !*paused.borrow_and_update() {
            return;
        }
        self.control.set_state(EngineState::Paused);
        self.logger.log(
            "RUN",
            "pause",
            "",
            format!("Paused before command {}", index + 1),
            "",
        );
        // the sender lives in `self.control`, so the channel cannot close here
        let _ = paused.wait_for(|paused| !*paused).await;
        self.control.set_state(EngineState::Running);
        info!(command = index + 1, "Resumed");
    }

    async fn abort(&mut self, command: &Command, e: LabError) -> LabError {
        error!(component = %command.component, action = %command.action, error = %e, kind = e.kind(), "fatal error, aborting run");
        self.logger.log(
            "RUN",
            "abort",
            command.params_text(),
            format!("Fatal: {e}"),
            format!("during {}/{}", command.component, command.action),
        );
        let close_failures = self.registry.close_all().await;
        let detached = self.scheduler.detach_all();
        if detached > 0 {
            warn!(detached, "background operations left running after abort");
        }
        if close_failures > 0 {
            warn!(close_failures, "some devices failed to close");
        }
        self.control.set_state(EngineState::Failed);
        e
    }

    async fn execute(&mut self, command: &Command, summary: &mut RunSummary) -> LabResult<Step> {
        let action = Action::from_command(command)?;
        let resolver = Resolver::new(&self.registry);
        let component = command.component.as_str();
        let params = command.params_text();
        let notes = command.notes.as_str();

        match action {
            Action::WaitForPumps => {
                let outstanding = self.scheduler.len();
                let report = self.scheduler.wait_all().await;
                summary.background_completed += report.completed;
                summary.background_failed += report.failed;
                self.logger.log(
                    component,
                    &command.action,
                    params,
                    "All pumps finished",
                    format!(
                        "{outstanding} joined: {} completed, {} failed",
                        report.completed, report.failed
                    ),
                );
            }

            Action::SetTemperature { id, celsius } => {
                let (name, tc) = resolver.temperature(id)?;
                let applied = tc.set_temperature(celsius).await?;
                self.logger.log(
                    component,
                    &command.action,
                    params,
                    format!("Temperature Controller {name} set to {applied} °C"),
                    notes,
                );
            }

            Action::ReadTemperature { id, sensor } => {
                let (name, tc) = resolver.temperature(id)?;
                let celsius = tc.read_temperature(sensor).await?;
                self.logger.log(
                    component,
                    &command.action,
                    params,
                    format!("{celsius}"),
                    format!("{name} {sensor:?}"),
                );
            }

            Action::ValveGoTo { target, position } => {
                for (name, valve) in resolver.valves(target)? {
                    valve.go_to_position(position).await?;
                    let current = valve.current_position().await?;
                    self.logger.log(
                        component,
                        &command.action,
                        params.clone(),
                        format!("Moved {name} to {position} (now {current})"),
                        notes,
                    );
                }
            }

            Action::ValveHome { target } => {
                for (name, valve) in resolver.valves(target)? {
                    valve.home().await?;
                    let current = valve.current_position().await?;
                    self.logger.log(
                        component,
                        &command.action,
                        params.clone(),
                        format!("Homed {name} (now {current})"),
                        notes,
                    );
                }
            }

            Action::Pump {
                id,
                direction,
                rate_ul_min,
                volume_ul,
            } => {
                let (name, pump) = resolver.flow_pump(id)?;
                if !(rate_ul_min > 0.0 && volume_ul > 0.0) {
                    self.logger.log(
                        component,
                        &command.action,
                        params,
                        format!(
                            "{direction} of {volume_ul} uL at {rate_ul_min} uL/min on {name} skipped: rate and volume must be positive"
                        ),
                        notes,
                    );
                    return Ok(Step::Skipped);
                }
                let estimated = pump.estimate(rate_ul_min, volume_ul);
                self.logger.log(
                    component,
                    &command.action,
                    params.clone(),
                    format!("Started async {direction} on {name}"),
                    format!("exp. {:.1} s", estimated.as_secs_f64()),
                );
                let label = self.label(command, params, &name);
                self.scheduler.launch(label, estimated, async move {
                    let report = pump.pump(direction, rate_ul_min, volume_ul).await?;
                    let verb = match direction {
                        PumpDirection::Aspirate => "Aspirated",
                        PumpDirection::Dispense => "Dispensed",
                    };
                    let calibration = if report.calibrated { "" } else { " (uncalibrated)" };
                    Ok(format!(
                        "{verb} {:.1} uL @ {:.1} uL/min on {name}{calibration}",
                        report.delivered_ul, report.realized_rate_ul_min
                    ))
                });
            }

            Action::SelectSyringe { id, size_ml } => {
                let (name, pump) = resolver.syringe_pump(id)?;
                pump.select_syringe(size_ml).await?;
                self.logger.log(
                    component,
                    &command.action,
                    params,
                    format!("Loaded {size_ml} mL syringe on {name}"),
                    notes,
                );
            }

            Action::Infuse {
                id,
                volume_ul,
                rate_ul_min,
            } => {
                if !(rate_ul_min > 0.0 && volume_ul > 0.0) {
                    return Err(LabError::validation(format!(
                        "infusion needs positive volume and rate, got {volume_ul} uL at {rate_ul_min} uL/min"
                    )));
                }
                let (name, pump) = resolver.syringe_pump(id)?;
                let estimated = nominal_travel_time(rate_ul_min, volume_ul);
                self.logger.log(
                    component,
                    &command.action,
                    params.clone(),
                    format!("Started async infusion {volume_ul} uL @ {rate_ul_min} uL/min on {name}"),
                    format!("exp. {:.1} s", estimated.as_secs_f64()),
                );
                let label = self.label(command, params, &name);
                self.scheduler.launch(label, estimated, async move {
                    pump.infuse(volume_ul, rate_ul_min).await?;
                    Ok(format!("Infusion done on {name}"))
                });
            }

            Action::StopSyringe { id } => {
                let (name, pump) = resolver.syringe_pump(id)?;
                pump.stop().await?;
                self.logger
                    .log(component, &command.action, params, format!("Stopped {name}"), notes);
            }

            Action::SetBedLayout { id, bed, rack } => {
                let (name, handler) = resolver.liquid_handler(id)?;
                handler.set_bed_layout(bed, rack).await?;
                self.logger.log(
                    component,
                    &command.action,
                    params,
                    format!("Setting {name} bed {bed} to rack layout {rack}"),
                    notes,
                );
            }

            Action::Home { id } => {
                let (name, handler) = resolver.liquid_handler(id)?;
                handler.home().await?;
                self.logger
                    .log(component, &command.action, params, format!("Homed {name}"), notes);
            }

            Action::MoveXy { id, target } => {
                let (name, handler) = resolver.liquid_handler(id)?;
                let outcome = match target {
                    XyTarget::Well { bed, well } => {
                        let reached = handler.move_to_well(bed, well).await?;
                        format!(
                            "Moving {name} to bed {bed} well {well}: coordinates: ({}, {})",
                            reached.x, reached.y
                        )
                    }
                    XyTarget::Point { x, y } => {
                        let (x, y) = handler.move_xy(x, y).await?;
                        format!("Moving {name} to coordinates: ({x}, {y})")
                    }
                };
                self.logger
                    .log(component, &command.action, params, outcome, notes);
            }

            Action::MoveZ { id, target } => {
                let (name, handler) = resolver.liquid_handler(id)?;
                let outcome = match target {
                    ZTarget::Well { bed, well } => {
                        let depth = handler.deck().well(bed, well)?.z;
                        let z = handler.move_z(depth).await?;
                        format!("Moving {name} needle on bed {bed} well {well}: z {z}")
                    }
                    ZTarget::Height(height) => {
                        let z = handler.move_z(height).await?;
                        format!("Moving {name} needle to z height {z}")
                    }
                };
                self.logger
                    .log(component, &command.action, params, outcome, notes);
            }
        }
        Ok(Step::Done)
    }

    fn label(&self, command: &Command, parameters: String, device: &str) -> OperationLabel {
        OperationLabel {
            component: command.component.clone(),
            action: command.action.clone(),
            parameters,
            device: device.to_string(),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("devices", &self.registry.len())
            .field("pending", &self.scheduler.len())
            .finish()
    }
}

