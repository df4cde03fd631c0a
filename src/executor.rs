/// Step program interpreter
///
/// Runs a program on a worker thread, one step at a time. The UI keeps an
/// `ExecutorHandle` to pause, resume or stop the run and receives progress as
/// `ExecutorEvent`s over a channel. Stop is cooperative: it is checked between
/// steps, so a step that is already sleeping finishes its sleep first.
///
/// The connection is shared behind a mutex. The worker only holds the lock for
/// individual hardware calls, never across a sleep, so the UI thread can send
/// pause/stop to the pump while a step is waiting.

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cached_connection::CachedConnection;
use crate::config_loader::PumpConfig;
use crate::pump_connection::{PumpConnection, PumpMode, Units};
use crate::steps::{Step, StepFunction};

pub type SharedConnection<C> = Arc<Mutex<CachedConnection<C>>>;

/// Blocking delay used for timed steps. Tests substitute a recording or gated sleeper.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Volume sent for jog moves; large enough to run until released
pub const JOG_VOLUME: f64 = 50.0;
pub const DEFAULT_JOG_RATE: f64 = 5.0;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(thread::sleep)
}

pub fn shared<C: PumpConnection>(connection: C) -> SharedConnection<C> {
    Arc::new(Mutex::new(CachedConnection::new(connection)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Stopped,
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// Index of the step about to execute
    StepChanged(usize),
    Error(String),
    /// Sent exactly once when the run ends, however it ends
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFrame {
    pub start_index: usize,
    pub iterations: i64,
    pub current_iteration: i64,
}

#[derive(Debug)]
struct Control {
    state: Mutex<ExecutionState>,
    changed: Condvar,
}

impl Control {
    fn new() -> Self {
        Self { state: Mutex::new(ExecutionState::Idle), changed: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self) -> ExecutionState {
        *self.lock()
    }

    /// Apply `next` if the current state is one of `from`. Returns whether it changed.
    fn transition(&self, from: &[ExecutionState], next: ExecutionState) -> bool {
        let mut state = self.lock();
        if from.contains(&*state) {
            *state = next;
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Block while paused. Returns false once the run has been stopped.
    fn wait_while_paused(&self) -> bool {
        let mut state = self.lock();
        while *state == ExecutionState::Paused {
            state = self.changed.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *state != ExecutionState::Stopped
    }
}

fn lock_pump<C: PumpConnection>(connection: &SharedConnection<C>) -> Result<MutexGuard<'_, CachedConnection<C>>> {
    connection.lock().map_err(|_| anyhow!("Pump connection lock poisoned"))
}

/// Send the parameter set for one pump move and start it.
/// Negative volume infuses, anything else withdraws. Returns the absolute volume sent.
pub fn apply_pump_operation<P: PumpConnection + ?Sized>(pump: &mut P, diameter: f64, volume: f64, rate: f64) -> Result<f64> {
    let actual_volume = volume.abs();
    pump.set_units(Units::MlPerMin)?;
    pump.set_diameter(diameter)?;
    if volume < 0.0 {
        pump.set_mode(PumpMode::Infuse)?;
    } else {
        pump.set_mode(PumpMode::Withdraw)?;
    }
    pump.set_volume(actual_volume)?;
    pump.set_rate(rate.abs())?;
    pump.start_pump()?;
    Ok(actual_volume)
}

/// Seconds a volume move is expected to take, plus one second of margin
pub fn completion_wait(volume: f64, rate: f64) -> f64 {
    volume.abs() / rate.abs() * 60.0 + 1.0
}

/// Signed volume moved by pumping at `rate` (mL/min) for `duration` seconds
pub fn pump_time_volume(duration: f64, rate: f64) -> f64 {
    let volume = rate.abs() * duration / 60.0;
    if rate < 0.0 { -volume } else { volume }
}

/// Start a jog move: fill infuses, empty withdraws. No completion wait.
pub fn jog<C: PumpConnection>(connection: &SharedConnection<C>, config: &PumpConfig, fill: bool, rate: f64) -> Result<()> {
    let volume = if fill { -JOG_VOLUME } else { JOG_VOLUME };
    let mut pump = lock_pump(connection)?;
    apply_pump_operation(&mut *pump, config.diameter, volume, rate)?;
    log::info!(target: "executor", "Jog {} at {} mL/min", if fill { "fill" } else { "empty" }, rate);
    Ok(())
}

/// Stop a jog move. Failures are logged, not returned.
pub fn stop_jog<C: PumpConnection>(connection: &SharedConnection<C>) {
    match lock_pump(connection).and_then(|mut pump| pump.stop_pump()) {
        Ok(()) => log::debug!(target: "executor", "Jog stopped"),
        Err(e) => log::error!(target: "executor", "Stop jog error: {:#}", e),
    }
}

pub struct StepExecutor<C: PumpConnection> {
    steps: Vec<Step>,
    connection: SharedConnection<C>,
    config: PumpConfig,
    current_step: usize,
    loop_stack: Vec<LoopFrame>,
    control: Arc<Control>,
    events: Sender<ExecutorEvent>,
    sleeper: Sleeper,
}

impl<C: PumpConnection + 'static> StepExecutor<C> {
    pub fn new(steps: Vec<Step>, connection: SharedConnection<C>, config: PumpConfig, events: Sender<ExecutorEvent>) -> Self {
        Self {
            steps,
            connection,
            config,
            current_step: 0,
            loop_stack: Vec::new(),
            control: Arc::new(Control::new()),
            events,
            sleeper: thread_sleeper(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn loop_stack(&self) -> &[LoopFrame] {
        &self.loop_stack
    }

    pub fn state(&self) -> ExecutionState {
        self.control.get()
    }

    /// Run the program on a background thread
    pub fn spawn(self) -> Result<ExecutorHandle<C>> {
        let control = Arc::clone(&self.control);
        let connection = Arc::clone(&self.connection);
        let mut executor = self;
        let join = thread::Builder::new()
            .name("step-executor".to_string())
            .spawn(move || executor.execute_steps())?;
        Ok(ExecutorHandle { control, connection, join: Some(join) })
    }

    /// Run every step in order on the calling thread. Always ends with one `Finished` event.
    pub fn execute_steps(&mut self) {
        self.control.transition(&[ExecutionState::Idle], ExecutionState::Running);
        log::info!(target: "executor", "Starting program: {} steps", self.steps.len());

        if let Err(e) = self.run_program() {
            log::error!(target: "executor", "Program error: {:#}", e);
            self.emit(ExecutorEvent::Error(format!("{:#}", e)));
        }

        self.control.transition(
            &[ExecutionState::Idle, ExecutionState::Running, ExecutionState::Paused],
            ExecutionState::Finished,
        );
        log::info!(target: "executor", "Program ended at step {} ({:?})", self.current_step + 1, self.control.get());
        self.emit(ExecutorEvent::Finished);
    }

    fn run_program(&mut self) -> Result<()> {
        self.initialize_pump_state()?;
        self.current_step = 0;
        self.loop_stack.clear();

        while self.current_step < self.steps.len() {
            if !self.control.wait_while_paused() {
                log::info!(target: "executor", "Stopped before step {}", self.current_step + 1);
                break;
            }
            self.emit(ExecutorEvent::StepChanged(self.current_step));

            let step = self.steps[self.current_step].clone();
            if let Err(e) = self.execute_single_step(&step) {
                let message = format!("Step {}: {:#}", self.current_step + 1, e);
                log::error!(target: "executor", "{}", message);
                self.emit(ExecutorEvent::Error(message));
                break;
            }
            self.current_step += 1;
        }
        Ok(())
    }

    /// Execute one step. Loop steps only affect this executor's loop stack.
    pub fn execute_single_step(&mut self, step: &Step) -> Result<()> {
        log::debug!(target: "executor", "Step {}: {} ({})", self.current_step + 1, step.function, step.describe());
        match step.function {
            StepFunction::PumpVolume => {
                self.pump_volume(step.param("volume"), step.param("rate"))?;
            }
            StepFunction::PumpTime => {
                self.pump_time(step.param("time"), step.param("rate"))?;
            }
            StepFunction::Wait => {
                self.sleep_secs(step.param("time"))?;
            }
            StepFunction::StartLoop => {
                self.loop_stack.push(LoopFrame {
                    start_index: self.current_step,
                    iterations: step.param("iterations") as i64,
                    current_iteration: 0,
                });
            }
            StepFunction::EndLoop => {
                if let Some(frame) = self.loop_stack.last_mut() {
                    frame.current_iteration += 1;
                    if frame.current_iteration < frame.iterations {
                        self.current_step = frame.start_index;
                    } else {
                        self.loop_stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn pump_operation(&mut self, volume: f64, rate: f64, wait_for_completion: bool) -> Result<()> {
        let actual_volume = {
            let mut pump = lock_pump(&self.connection)?;
            apply_pump_operation(&mut *pump, self.config.diameter, volume, rate)?
        };
        if wait_for_completion && actual_volume > 0.0 {
            self.sleep_secs(completion_wait(actual_volume, rate))?;
        }
        Ok(())
    }

    fn pump_volume(&mut self, volume: f64, rate: f64) -> Result<()> {
        if rate == 0.0 && volume != 0.0 {
            return Err(anyhow!("Rate must be non-zero to pump {} mL", volume));
        }
        self.pump_operation(volume, rate, true)
    }

    fn pump_time(&mut self, duration: f64, rate: f64) -> Result<()> {
        if duration < 0.0 {
            return Err(anyhow!("Invalid duration {} s", duration));
        }
        let volume = pump_time_volume(duration, rate);
        self.pump_operation(volume, rate.abs(), false)?;
        self.sleep_secs(duration + 1.0)
    }

    fn initialize_pump_state(&mut self) -> Result<()> {
        let mut pump = lock_pump(&self.connection)?;
        pump.reset_cache();
        pump.set_units(Units::MlPerMin)?;
        pump.set_diameter(self.config.diameter)?;
        Ok(())
    }

    fn sleep_secs(&self, secs: f64) -> Result<()> {
        if secs.is_nan() || secs < 0.0 {
            return Err(anyhow!("Invalid duration {} s", secs));
        }
        if secs == 0.0 {
            return Ok(());
        }
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow!("Invalid duration {} s: {}", secs, e))?;
        (self.sleeper)(duration);
        Ok(())
    }

    fn emit(&self, event: ExecutorEvent) {
        // The receiver may be gone (single-step or jog callers don't listen)
        let _ = self.events.send(event);
    }
}

/// UI-side control of a running program
pub struct ExecutorHandle<C: PumpConnection> {
    control: Arc<Control>,
    connection: SharedConnection<C>,
    join: Option<JoinHandle<()>>,
}

impl<C: PumpConnection> ExecutorHandle<C> {
    pub fn state(&self) -> ExecutionState {
        self.control.get()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ExecutionState::Paused
    }

    /// Hold the program before its next step and pause the pump.
    /// Returns false when the program was not running.
    pub fn pause(&self) -> bool {
        let paused = self.control.transition(&[ExecutionState::Running], ExecutionState::Paused);
        if paused {
            log::info!(target: "executor", "Paused");
            self.pump_command("pause", |pump| pump.pause_pump());
        }
        paused
    }

    /// Let the program continue. Pump parameters are not resent.
    pub fn resume(&self) -> bool {
        let resumed = self.control.transition(&[ExecutionState::Paused], ExecutionState::Running);
        if resumed {
            log::info!(target: "executor", "Resumed");
        }
        resumed
    }

    /// End the run at the next step boundary and stop the pump
    pub fn stop(&self) {
        let stopped = self.control.transition(
            &[ExecutionState::Idle, ExecutionState::Running, ExecutionState::Paused],
            ExecutionState::Stopped,
        );
        if stopped {
            log::info!(target: "executor", "Stop requested");
            self.pump_command("stop", |pump| pump.stop_pump());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Wait for the worker thread to exit
    pub fn join(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("Step executor thread panicked"))?;
        }
        Ok(())
    }

    fn pump_command<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut CachedConnection<C>) -> Result<()>,
    {
        if let Err(e) = lock_pump(&self.connection).and_then(|mut pump| f(&mut *pump)) {
            log::warn!(target: "executor", "Pump {} failed: {:#}", name, e);
        }
    }
}
