use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pumpdriver::config_loader::PumpConfig;
use pumpdriver::executor::{self, ExecutionState, ExecutorEvent, Sleeper, StepExecutor};
use pumpdriver::pump_connection::{PumpConnection, PumpMode, Units};
use pumpdriver::steps::{Step, StepFunction};

/// Pump double that records every command it receives
#[derive(Default)]
struct MockPump {
    log: Vec<String>,
    fail_on: Option<&'static str>,
}

impl MockPump {
    fn record(&mut self, cmd: String) -> Result<()> {
        if let Some(bad) = self.fail_on {
            if cmd.starts_with(bad) {
                return Err(anyhow!("{} rejected", bad));
            }
        }
        self.log.push(cmd);
        Ok(())
    }
}

impl PumpConnection for MockPump {
    fn open_connection(&mut self) -> Result<()> { self.record("open".into()) }
    fn close_connection(&mut self) -> Result<()> { self.record("close".into()) }
    fn set_units(&mut self, units: Units) -> Result<()> { self.record(format!("units {}", units.code())) }
    fn set_diameter(&mut self, d: f64) -> Result<()> { self.record(format!("diameter {}", d)) }
    fn set_volume(&mut self, v: f64) -> Result<()> { self.record(format!("volume {}", v)) }
    fn set_mode(&mut self, mode: PumpMode) -> Result<()> { self.record(format!("mode {}", mode.code())) }
    fn set_rate(&mut self, r: f64) -> Result<()> { self.record(format!("rate {}", r)) }
    fn set_delay(&mut self, d: f64) -> Result<()> { self.record(format!("delay {}", d)) }
    fn set_time(&mut self, t: f64) -> Result<()> { self.record(format!("time {}", t)) }
    fn set_pump(&mut self, p: u8) -> Result<()> { self.record(format!("pump {}", p)) }
    fn start_pump(&mut self) -> Result<()> { self.record("start".into()) }
    fn stop_pump(&mut self) -> Result<()> { self.record("stop".into()) }
    fn pause_pump(&mut self) -> Result<()> { self.record("pause".into()) }
    fn get_parameters(&mut self) -> Result<Vec<String>> { Ok(self.log.clone()) }
}

fn step(function: StepFunction, params: &[(&str, f64)]) -> Step {
    let params: BTreeMap<String, f64> = params.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    Step::new(function, params)
}

/// Sleeper that blocks each sleep until the test sends a tick
fn gated_sleeper() -> (Sleeper, Sender<()>) {
    let (tick_tx, tick_rx) = unbounded::<()>();
    let sleeper: Sleeper = Arc::new(move |_: Duration| {
        let _ = tick_rx.recv_timeout(Duration::from_secs(5));
    });
    (sleeper, tick_tx)
}

fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<f64>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&sleeps);
    let sleeper: Sleeper = Arc::new(move |d: Duration| recorded.lock().unwrap().push(d.as_secs_f64()));
    (sleeper, sleeps)
}

fn next_event(rx: &Receiver<ExecutorEvent>) -> ExecutorEvent {
    rx.recv_timeout(Duration::from_secs(5)).expect("executor event")
}

fn three_waits() -> Vec<Step> {
    vec![
        step(StepFunction::Wait, &[("time", 1.0)]),
        step(StepFunction::Wait, &[("time", 2.0)]),
        step(StepFunction::Wait, &[("time", 3.0)]),
    ]
}

#[test]
fn full_program_sends_expected_commands() {
    let connection = executor::shared(MockPump::default());
    let (tx, rx) = unbounded();
    let (sleeper, sleeps) = recording_sleeper();
    let program = vec![
        step(StepFunction::PumpVolume, &[("volume", -1.0), ("rate", 2.0)]),
        step(StepFunction::PumpTime, &[("time", 60.0), ("rate", 3.0)]),
    ];
    let mut handle = StepExecutor::new(program, Arc::clone(&connection), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();
    handle.join().unwrap();

    let log = connection.lock().unwrap().inner().log.clone();
    assert_eq!(
        log,
        vec![
            "units 0", "diameter 28.6",
            "mode 1", "volume 1", "rate 2", "start",
            "mode 0", "volume 3", "rate 3", "start",
        ]
    );
    assert_eq!(*sleeps.lock().unwrap(), vec![31.0, 61.0]);

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        events,
        vec![ExecutorEvent::StepChanged(0), ExecutorEvent::StepChanged(1), ExecutorEvent::Finished]
    );
    assert_eq!(handle.state(), ExecutionState::Finished);
}

#[test]
fn each_run_resends_parameters() {
    let connection = executor::shared(MockPump::default());
    let program = vec![step(StepFunction::PumpVolume, &[("volume", 1.0), ("rate", 1.0)])];
    for _ in 0..2 {
        let (tx, _rx) = unbounded();
        let (sleeper, _) = recording_sleeper();
        let mut handle = StepExecutor::new(program.clone(), Arc::clone(&connection), PumpConfig::default(), tx)
            .with_sleeper(sleeper)
            .spawn()
            .unwrap();
        handle.join().unwrap();
    }
    let log = connection.lock().unwrap().inner().log.clone();
    assert_eq!(log.iter().filter(|c| *c == "units 0").count(), 2);
    assert_eq!(log.iter().filter(|c| *c == "rate 1").count(), 2);
}

#[test]
fn stop_halts_before_next_step_with_single_finished() {
    let connection = executor::shared(MockPump::default());
    let (tx, rx) = unbounded();
    let (sleeper, tick) = gated_sleeper();
    let mut handle = StepExecutor::new(three_waits(), Arc::clone(&connection), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();

    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(0));
    handle.stop();
    tick.send(()).unwrap();

    assert_eq!(next_event(&rx), ExecutorEvent::Finished);
    handle.join().unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(handle.state(), ExecutionState::Stopped);
    assert_eq!(connection.lock().unwrap().inner().log.last().map(String::as_str), Some("stop"));
}

#[test]
fn pause_holds_until_resume() {
    let connection = executor::shared(MockPump::default());
    let (tx, rx) = unbounded();
    let (sleeper, tick) = gated_sleeper();
    let mut handle = StepExecutor::new(three_waits(), Arc::clone(&connection), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();

    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(0));
    handle.pause();
    assert!(handle.is_paused());
    tick.send(()).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(connection.lock().unwrap().inner().log.contains(&"pause".to_string()));

    handle.resume();
    assert_eq!(handle.state(), ExecutionState::Running);
    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(1));
    tick.send(()).unwrap();
    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(2));
    tick.send(()).unwrap();
    assert_eq!(next_event(&rx), ExecutorEvent::Finished);
    handle.join().unwrap();
}

#[test]
fn stop_while_paused_wakes_worker() {
    let connection = executor::shared(MockPump::default());
    let (tx, rx) = unbounded();
    let (sleeper, tick) = gated_sleeper();
    let mut handle = StepExecutor::new(three_waits(), connection, PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();

    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(0));
    handle.pause();
    tick.send(()).unwrap();
    handle.stop();
    assert_eq!(next_event(&rx), ExecutorEvent::Finished);
    handle.join().unwrap();
    assert_eq!(handle.state(), ExecutionState::Stopped);
}

#[test]
fn initialization_failure_reports_error_then_finished() {
    let pump = MockPump { fail_on: Some("diameter"), ..MockPump::default() };
    let (tx, rx) = unbounded();
    let (sleeper, sleeps) = recording_sleeper();
    let mut handle = StepExecutor::new(three_waits(), executor::shared(pump), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();
    handle.join().unwrap();

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events, vec![ExecutorEvent::Error("diameter rejected".to_string()), ExecutorEvent::Finished]);
    assert!(sleeps.lock().unwrap().is_empty());
}

#[test]
fn step_error_names_the_step() {
    let pump = MockPump { fail_on: Some("mode"), ..MockPump::default() };
    let (tx, rx) = bounded(16);
    let (sleeper, _) = recording_sleeper();
    let program = vec![
        step(StepFunction::StartLoop, &[("iterations", 2.0)]),
        step(StepFunction::PumpVolume, &[("volume", 1.0), ("rate", 1.0)]),
        step(StepFunction::EndLoop, &[]),
    ];
    let mut handle = StepExecutor::new(program, executor::shared(pump), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();
    handle.join().unwrap();

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        events,
        vec![
            ExecutorEvent::StepChanged(0),
            ExecutorEvent::StepChanged(1),
            ExecutorEvent::Error("Step 2: mode rejected".to_string()),
            ExecutorEvent::Finished,
        ]
    );
}

#[test]
fn oversized_wait_still_finishes_worker() {
    let (tx, rx) = unbounded();
    let (sleeper, sleeps) = recording_sleeper();
    let program = vec![step(StepFunction::Wait, &[("time", 1e20)])];
    let mut handle = StepExecutor::new(program, executor::shared(MockPump::default()), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();
    handle.join().unwrap();

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], ExecutorEvent::StepChanged(0));
    assert!(matches!(&events[1], ExecutorEvent::Error(m) if m.starts_with("Step 1: Invalid duration")));
    assert_eq!(events[2], ExecutorEvent::Finished);
    assert!(sleeps.lock().unwrap().is_empty());
    assert!(handle.is_finished());
}

#[test]
fn pause_and_resume_report_whether_state_changed() {
    let (tx, rx) = unbounded();
    let (sleeper, tick) = gated_sleeper();
    let mut handle = StepExecutor::new(three_waits(), executor::shared(MockPump::default()), PumpConfig::default(), tx)
        .with_sleeper(sleeper)
        .spawn()
        .unwrap();

    assert_eq!(next_event(&rx), ExecutorEvent::StepChanged(0));
    assert!(!handle.resume());
    assert!(handle.pause());
    assert!(!handle.pause());
    assert!(handle.resume());
    assert!(!handle.resume());

    for _ in 0..3 {
        tick.send(()).unwrap();
    }
    while next_event(&rx) != ExecutorEvent::Finished {}
    handle.join().unwrap();
    assert!(!handle.pause());
    assert!(!handle.resume());
    assert_eq!(handle.state(), ExecutionState::Finished);
}

#[test]
fn jog_directions_and_stop() {
    let connection = executor::shared(MockPump::default());
    let config = PumpConfig { diameter: 14.5, ..PumpConfig::default() };
    executor::jog(&connection, &config, false, 2.5).unwrap();
    executor::stop_jog(&connection);
    let log = connection.lock().unwrap().inner().log.clone();
    assert_eq!(log, vec!["units 0", "diameter 14.5", "mode 0", "volume 50", "rate 2.5", "start", "stop"]);
}
