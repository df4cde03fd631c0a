/// Chemyx pump control GUI
///
/// Run with: cargo run --bin pump_gui
///
/// Program tab: connect, edit and run a step program, jog the syringe.
/// Configuration tab: port, baud rate and syringe settings, saved on every change.

use eframe::egui;
use egui::{Color32, RichText};
use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pumpdriver::config_loader::{self, PumpConfig, BAUD_RATES};
use pumpdriver::executor::{self, ExecutorEvent, ExecutorHandle, SharedConnection, StepExecutor, DEFAULT_JOG_RATE};
use pumpdriver::pump_connection::{self, ChemyxConnection, PumpConnection};
use pumpdriver::steps::{self, Step, StepFunction};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    debug: bool,
    /// Config file (defaults to PUMPDRIVER_CONFIG or chemyx_config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Auto-saved program file (defaults to PUMPDRIVER_STEPS or chemyx_steps.json)
    #[arg(long)]
    steps: Option<PathBuf>,
}

// Sunset Glow palette
const BACKGROUND: Color32 = Color32::from_rgb(0x1e, 0x1b, 0x4b);
const PANEL: Color32 = Color32::from_rgb(0x31, 0x2e, 0x81);
const ACCENT: Color32 = Color32::from_rgb(0x43, 0x38, 0xca);
const TEXT: Color32 = Color32::from_rgb(0xe0, 0xe7, 0xff);
const CONNECTED: Color32 = Color32::from_rgb(0x10, 0xb9, 0x81);
const DISCONNECTED: Color32 = Color32::from_rgb(0xf4, 0x3f, 0x5e);
const COMPLETED_ROW: Color32 = Color32::from_rgba_premultiplied(17, 99, 47, 80);

fn apply_theme(ctx: &egui::Context) {
    let mut visuals = egui::Visuals::dark();
    visuals.panel_fill = BACKGROUND;
    visuals.window_fill = PANEL;
    visuals.extreme_bg_color = BACKGROUND;
    visuals.faint_bg_color = PANEL;
    visuals.override_text_color = Some(TEXT);
    visuals.selection.bg_fill = ACCENT;
    visuals.widgets.inactive.weak_bg_fill = PANEL;
    visuals.widgets.hovered.weak_bg_fill = ACCENT;
    ctx.set_visuals(visuals);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tab {
    Program,
    Configuration,
}

/// Parameter editor for a new step (row None) or an existing one
struct StepDialog {
    row: Option<usize>,
    step: Step,
}

struct Alert {
    title: String,
    message: String,
}

enum RowAction {
    Select(usize),
    Edit(usize),
    Up(usize),
    Down(usize),
}

/// Pump GUI state
struct PumpGUI {
    config: PumpConfig,
    config_path: PathBuf,
    steps_path: PathBuf,
    steps: Vec<Step>,
    selected_row: Option<usize>,
    new_function: StepFunction,
    available_ports: Vec<String>,
    connection: Option<SharedConnection<ChemyxConnection>>,
    executor: Option<ExecutorHandle<ChemyxConnection>>,
    single_step_job: Option<JoinHandle<()>>,
    events: Option<Receiver<ExecutorEvent>>,
    current_step: Option<usize>,
    completed_steps: BTreeSet<usize>,
    status_text: String,
    progress: f32,
    progress_text: String,
    jog_rate: f64,
    jogging: Option<bool>,
    step_dialog: Option<StepDialog>,
    alert: Option<Alert>,
    message: String,
    tab: Tab,
}

impl PumpGUI {
    fn new(config_path: PathBuf, steps_path: PathBuf) -> Result<Self> {
        let config = config_loader::load_config(&config_path)?;
        let mut gui = Self {
            config,
            config_path,
            steps_path,
            steps: Vec::new(),
            selected_row: None,
            new_function: StepFunction::PumpVolume,
            available_ports: Vec::new(),
            connection: None,
            executor: None,
            single_step_job: None,
            events: None,
            current_step: None,
            completed_steps: BTreeSet::new(),
            status_text: "Ready".to_string(),
            progress: 0.0,
            progress_text: String::new(),
            jog_rate: DEFAULT_JOG_RATE,
            jogging: None,
            step_dialog: None,
            alert: None,
            message: String::new(),
            tab: Tab::Program,
        };

        match steps::auto_load_steps(&gui.steps_path) {
            Ok(loaded) => {
                for (i, step) in loaded.iter().enumerate() {
                    if let Err(e) = step.validate() {
                        gui.append_message(&format!("Warning: step {}: {}", i + 1, e));
                    }
                }
                gui.steps = loaded;
            }
            Err(e) => log::warn!("Failed to auto-load steps: {:#}", e),
        }
        gui.scan_ports();
        gui.append_message(&format!("Loaded {} steps, config from {}", gui.steps.len(), gui.config_path.display()));
        Ok(gui)
    }

    /// Append a timestamped line to the message log
    fn append_message(&mut self, msg: &str) {
        if !self.message.is_empty() {
            self.message.push('\n');
        }
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.message.push_str(&format!("[{}] {}", stamp, msg));
        if self.message.len() > 20000 {
            self.message = self.message.split_off(self.message.len() - 10000);
        }
    }

    fn show_alert(&mut self, title: &str, message: &str) {
        self.append_message(&format!("{}: {}", title, message));
        self.alert = Some(Alert { title: title.to_string(), message: message.to_string() });
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn is_running(&self) -> bool {
        self.executor.is_some()
    }

    fn is_busy(&self) -> bool {
        self.is_running() || self.single_step_job.is_some()
    }

    fn scan_ports(&mut self) {
        match pump_connection::get_open_ports() {
            Ok(ports) => self.available_ports = ports,
            Err(e) => log::warn!("Failed to scan ports: {:#}", e),
        }
    }

    fn update_and_save_config(&mut self) {
        if let Err(e) = config_loader::save_config(&self.config_path, &self.config) {
            log::warn!("Failed to save config: {:#}", e);
        }
    }

    fn toggle_connection(&mut self) {
        if self.is_connected() {
            self.disconnect();
        } else {
            self.connect();
        }
    }

    fn connect(&mut self) {
        self.append_message(&format!("Connecting to pump on {} @{}", self.config.port, self.config.baudrate));
        let mut raw = ChemyxConnection::new(self.config.port.clone(), self.config.baudrate);
        match raw.open_connection() {
            Ok(()) => {
                self.connection = Some(executor::shared(raw));
                self.append_message("Connected to pump with caching enabled");
            }
            Err(e) => self.show_alert("Connection Error", &format!("Failed to connect: {:#}", e)),
        }
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            match connection.lock() {
                Ok(mut pump) => {
                    if let Err(e) = pump.inner_mut().close_connection() {
                        log::warn!("Error disconnecting: {:#}", e);
                    }
                    pump.reset_cache();
                }
                Err(_) => log::warn!("Error disconnecting: connection lock poisoned"),
            }
            self.append_message("Disconnected from pump");
        }
    }

    fn persist_steps(&self) {
        steps::auto_save_steps(&self.steps_path, &self.steps);
    }

    fn add_step(&mut self) {
        let step = Step::with_defaults(self.new_function);
        if step.function.param_specs().is_empty() {
            self.steps.push(step);
            self.persist_steps();
        } else {
            self.step_dialog = Some(StepDialog { row: None, step });
        }
    }

    fn edit_step(&mut self, row: usize) {
        if let Some(step) = self.steps.get(row) {
            let mut step = step.clone();
            for spec in step.function.param_specs() {
                step.params.entry(spec.name.to_string()).or_insert(spec.initial);
            }
            self.step_dialog = Some(StepDialog { row: Some(row), step });
        }
    }

    fn apply_step_dialog(&mut self, dialog: StepDialog) {
        match dialog.row {
            Some(row) if row < self.steps.len() => self.steps[row] = dialog.step,
            Some(_) => return,
            None => self.steps.push(dialog.step),
        }
        self.persist_steps();
    }

    fn remove_step(&mut self) {
        if let Some(row) = self.selected_row.filter(|&r| r < self.steps.len()) {
            let removed = self.steps.remove(row);
            self.append_message(&format!("Removed step {}: {}", row + 1, removed.function));
            self.selected_row = None;
            self.persist_steps();
        }
    }

    fn move_step_up(&mut self, row: usize) {
        if steps::move_up(&mut self.steps, row) {
            self.selected_row = Some(row - 1);
            self.persist_steps();
        }
    }

    fn move_step_down(&mut self, row: usize) {
        if steps::move_down(&mut self.steps, row) {
            self.selected_row = Some(row + 1);
            self.persist_steps();
        }
    }

    fn save_program(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .set_title("Save Program")
            .set_directory(self.program_dir())
            .add_filter("JSON Files", &["json"])
            .save_file()
        else {
            return;
        };
        match steps::save_program(&path, &self.steps) {
            Ok(()) => self.show_alert("Success", "Program saved successfully!"),
            Err(e) => self.show_alert("Error", &format!("Failed to save program: {:#}", e)),
        }
    }

    fn load_program(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .set_title("Load Program")
            .set_directory(self.program_dir())
            .add_filter("JSON Files", &["json"])
            .pick_file()
        else {
            return;
        };
        match steps::load_program(&path) {
            Ok(loaded) => {
                self.steps = loaded;
                self.selected_row = None;
                self.reset_progress();
                self.persist_steps();
                self.show_alert("Success", "Program loaded successfully!");
            }
            Err(e) => self.show_alert("Error", &format!("Failed to load program: {:#}", e)),
        }
    }

    fn program_dir(&self) -> PathBuf {
        let absolute = std::fs::canonicalize(&self.steps_path).unwrap_or_else(|_| self.steps_path.clone());
        absolute
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Mark `step_index` as executing, completing the one before it
    fn highlight_current_step(&mut self, step_index: usize) {
        if let Some(previous) = self.current_step {
            if step_index > previous {
                self.completed_steps.insert(previous);
            }
        }
        self.current_step = Some(step_index);
        self.selected_row = Some(step_index);

        let total = self.steps.len();
        if let Some(step) = self.steps.get(step_index) {
            let mut status = format!("Executing Step {} of {}: {}", step_index + 1, total, step.function);
            let params = step.describe();
            if !params.is_empty() {
                status.push_str(&format!(" ({})", params));
            }
            self.status_text = status;
            let percent = (step_index + 1) * 100 / total;
            self.progress = percent as f32 / 100.0;
            self.progress_text = format!("Step {} of {} ({}%)", step_index + 1, total, percent);
        }
    }

    fn reset_progress(&mut self) {
        self.current_step = None;
        self.completed_steps.clear();
        self.status_text = "Ready".to_string();
        self.progress = 0.0;
        self.progress_text.clear();
    }

    fn play_program(&mut self) {
        let Some(connection) = self.connection.as_ref().map(Arc::clone) else {
            self.show_alert("Not Connected", "Please connect to pump first");
            return;
        };
        if self.steps.is_empty() {
            self.show_alert("No Steps", "Please add steps to the program");
            return;
        }
        if self.is_busy() {
            return;
        }

        self.reset_progress();
        let (tx, rx) = unbounded();
        let executor = StepExecutor::new(self.steps.clone(), connection, self.config.clone(), tx);
        match executor.spawn() {
            Ok(handle) => {
                self.executor = Some(handle);
                self.events = Some(rx);
                self.append_message(&format!("Program started ({} steps)", self.steps.len()));
            }
            Err(e) => self.show_alert("Execution Error", &format!("Failed to start program: {:#}", e)),
        }
    }

    fn pause_program(&mut self) {
        let Some(handle) = self.executor.as_ref() else {
            return;
        };
        if handle.is_paused() {
            if handle.resume() {
                self.append_message("Resumed");
            }
        } else if handle.pause() {
            self.append_message("Paused");
        }
    }

    fn stop_program(&mut self) {
        if let Some(handle) = self.executor.as_ref() {
            handle.stop();
            self.append_message("Stop requested");
        }
    }

    /// Run the selected step once on a worker thread
    fn single_step(&mut self) {
        let Some(connection) = self.connection.as_ref().map(Arc::clone) else {
            self.show_alert("Not Connected", "Please connect to pump first");
            return;
        };
        if self.is_busy() {
            return;
        }
        let Some(row) = self.selected_row.filter(|&r| r < self.steps.len()) else {
            return;
        };
        let step = self.steps[row].clone();
        self.highlight_current_step(row);

        let (tx, rx) = unbounded();
        let mut executor = StepExecutor::new(vec![step.clone()], connection, self.config.clone(), tx.clone());
        let spawned = thread::Builder::new()
            .name("single-step".to_string())
            .spawn(move || {
                if let Err(e) = executor.execute_single_step(&step) {
                    let _ = tx.send(ExecutorEvent::Error(format!("Step {}: {:#}", row + 1, e)));
                }
            });
        match spawned {
            Ok(job) => {
                self.single_step_job = Some(job);
                self.events = Some(rx);
            }
            Err(e) => self.show_alert("Execution Error", &format!("{:#}", e)),
        }
    }

    /// Drain executor events and reap finished workers
    fn poll_executor(&mut self) {
        // Checked before draining so a Finished sent just before exit is still seen
        let worker_exited = self.executor.as_ref().map_or(false, |handle| handle.is_finished());
        let events: Vec<ExecutorEvent> = self
            .events
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default();
        for event in events {
            match event {
                ExecutorEvent::StepChanged(index) => self.highlight_current_step(index),
                ExecutorEvent::Error(message) => self.execution_error(&message),
                ExecutorEvent::Finished => self.execution_finished(),
            }
        }

        if worker_exited && self.executor.is_some() {
            log::warn!("Step executor exited without finishing");
            if let Some(mut handle) = self.executor.take() {
                if let Err(e) = handle.join() {
                    self.show_alert("Execution Error", &format!("{:#}", e));
                }
            }
            self.execution_finished();
        }

        if self.single_step_job.as_ref().map_or(false, |job| job.is_finished()) {
            if let Some(job) = self.single_step_job.take() {
                if job.join().is_err() {
                    log::error!("Single step thread panicked");
                }
            }
        }
    }

    fn execution_finished(&mut self) {
        if let Some(mut handle) = self.executor.take() {
            if let Err(e) = handle.join() {
                log::error!("{:#}", e);
            }
        }
        self.events = None;
        self.append_message("Program finished");
        self.reset_progress();
    }

    fn execution_error(&mut self, message: &str) {
        self.show_alert("Execution Error", message);
        self.stop_program();
    }

    fn start_jog(&mut self, fill: bool) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        if let Err(e) = executor::jog(connection, &self.config, fill, self.jog_rate) {
            log::error!("Jog error: {:#}", e);
        }
    }

    fn stop_jog(&mut self) {
        if let Some(connection) = self.connection.as_ref() {
            executor::stop_jog(connection);
        }
    }

    /// Start or stop jogging to follow which jog button is held
    fn update_jog(&mut self, wanted: Option<bool>) {
        if wanted == self.jogging {
            return;
        }
        if self.jogging.is_some() {
            self.stop_jog();
        }
        if let Some(fill) = wanted {
            self.start_jog(fill);
        }
        self.jogging = wanted;
    }

    fn render_program_tab(&mut self, ui: &mut egui::Ui) {
        let running = self.is_busy();

        // Connection
        egui::Frame::group(ui.style()).show(ui, |ui| {
            ui.horizontal(|ui| {
                ui.label("Status:");
                if self.is_connected() {
                    ui.label(RichText::new("CONNECTED").color(CONNECTED).strong());
                } else {
                    ui.label(RichText::new("DISCONNECTED").color(DISCONNECTED).strong());
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let label = if self.is_connected() { "🔌 Disconnect" } else { "🔌 Connect" };
                    if ui.add_enabled(!running, egui::Button::new(label)).clicked() {
                        self.toggle_connection();
                    }
                });
            });
        });

        ui.add_space(6.0);
        ui.heading("Program Steps");
        self.render_steps_table(ui, running);

        ui.horizontal(|ui| {
            ui.add_enabled_ui(!running, |ui| {
                egui::ComboBox::from_id_source("function_select")
                    .selected_text(self.new_function.name())
                    .show_ui(ui, |ui| {
                        for function in StepFunction::ALL {
                            ui.selectable_value(&mut self.new_function, function, function.name());
                        }
                    });
                if ui.button("➕ Add Step").clicked() {
                    self.add_step();
                }
                if ui.add_enabled(self.selected_row.is_some(), egui::Button::new("➖ Remove Step")).clicked() {
                    self.remove_step();
                }
                ui.separator();
                if ui.button("💾 Save Program").clicked() {
                    self.save_program();
                }
                if ui.button("📂 Load Program").clicked() {
                    self.load_program();
                }
            });
        });

        ui.separator();

        // Execution controls
        ui.horizontal(|ui| {
            let connected = self.is_connected();
            if ui.add_enabled(connected && !running, egui::Button::new("▶ Play")).clicked() {
                self.play_program();
            }
            let paused = self.executor.as_ref().map_or(false, |h| h.is_paused());
            let pause_label = if paused { "▶ Resume" } else { "⏸ Pause" };
            if ui.add_enabled(self.is_running(), egui::Button::new(pause_label)).clicked() {
                self.pause_program();
            }
            if ui.add_enabled(self.is_running(), egui::Button::new("⏹ Stop")).clicked() {
                self.stop_program();
            }
            if ui.add_enabled(connected && !running, egui::Button::new("⏭ Single Step")).clicked() {
                self.single_step();
            }
        });

        // Jog controls act while held
        egui::Frame::group(ui.style()).show(ui, |ui| {
            ui.horizontal(|ui| {
                ui.label("Jog Controls");
                ui.label("Rate:");
                ui.add(egui::DragValue::new(&mut self.jog_rate)
                    .clamp_range(0.1..=50.0)
                    .speed(0.1)
                    .suffix(" mL/min"));
                let enabled = self.is_connected() && !running;
                let fill = ui.add_enabled(enabled, egui::Button::new("🔼 Jog Fill"));
                let empty = ui.add_enabled(enabled, egui::Button::new("🔽 Jog Empty"));
                let wanted = if fill.is_pointer_button_down_on() {
                    Some(true)
                } else if empty.is_pointer_button_down_on() {
                    Some(false)
                } else {
                    None
                };
                self.update_jog(wanted);
            });
        });

        ui.add_space(6.0);
        ui.label(RichText::new(&self.status_text).strong());
        if self.is_running() {
            ui.add(egui::ProgressBar::new(self.progress).text(self.progress_text.as_str()));
        }
    }

    fn render_steps_table(&mut self, ui: &mut egui::Ui, running: bool) {
        let mut action = None;
        let last = self.steps.len().saturating_sub(1);

        egui::ScrollArea::vertical()
            .id_source("steps_scroll")
            .max_height(320.0)
            .auto_shrink([false, true])
            .show(ui, |ui| {
                egui::Grid::new("steps_table").striped(true).num_columns(6).show(ui, |ui| {
                    ui.strong("#");
                    ui.strong("Function");
                    ui.strong("Parameters");
                    ui.strong("Edit");
                    ui.strong("↑");
                    ui.strong("↓");
                    ui.end_row();

                    for (i, step) in self.steps.iter().enumerate() {
                        let completed = self.completed_steps.contains(&i);
                        let cell = |text: String| {
                            let text = RichText::new(text);
                            if completed { text.background_color(COMPLETED_ROW) } else { text }
                        };
                        let selected = self.selected_row == Some(i);
                        if ui.selectable_label(selected, cell((i + 1).to_string())).clicked() {
                            action = Some(RowAction::Select(i));
                        }
                        if ui.selectable_label(selected, cell(step.function.to_string())).clicked() {
                            action = Some(RowAction::Select(i));
                        }
                        ui.label(cell(step.describe()));
                        ui.add_enabled_ui(!running, |ui| {
                            if ui.small_button("✏ Edit").clicked() {
                                action = Some(RowAction::Edit(i));
                            }
                        });
                        if ui.add_enabled(!running && i > 0, egui::Button::new("🔼").small()).clicked() {
                            action = Some(RowAction::Up(i));
                        }
                        if ui.add_enabled(!running && i < last, egui::Button::new("🔽").small()).clicked() {
                            action = Some(RowAction::Down(i));
                        }
                        ui.end_row();
                    }
                });
            });

        match action {
            Some(RowAction::Select(i)) => self.selected_row = Some(i),
            Some(RowAction::Edit(i)) => self.edit_step(i),
            Some(RowAction::Up(i)) => self.move_step_up(i),
            Some(RowAction::Down(i)) => self.move_step_down(i),
            None => {}
        }
    }

    fn render_configuration_tab(&mut self, ui: &mut egui::Ui) {
        let mut changed = false;

        ui.heading("Pump Configuration");
        egui::Frame::group(ui.style()).show(ui, |ui| {
            egui::Grid::new("config_grid").num_columns(2).spacing([12.0, 8.0]).show(ui, |ui| {
                ui.label("Serial Port:");
                ui.horizontal(|ui| {
                    changed |= ui.add(egui::TextEdit::singleline(&mut self.config.port).desired_width(160.0)).changed();
                    egui::ComboBox::from_id_source("port_select")
                        .selected_text("Available")
                        .show_ui(ui, |ui| {
                            for port in &self.available_ports {
                                if ui.selectable_label(&self.config.port == port, port.as_str()).clicked() {
                                    self.config.port = port.clone();
                                    changed = true;
                                }
                            }
                        });
                });
                ui.end_row();

                ui.label("Baud Rate:");
                egui::ComboBox::from_id_source("baud_select")
                    .selected_text(self.config.baudrate.to_string())
                    .show_ui(ui, |ui| {
                        for baud in BAUD_RATES {
                            changed |= ui.selectable_value(&mut self.config.baudrate, baud, baud.to_string()).changed();
                        }
                    });
                ui.end_row();

                ui.label("Syringe Diameter:");
                changed |= ui.add(egui::DragValue::new(&mut self.config.diameter)
                    .clamp_range(0.1..=100.0)
                    .speed(0.1)
                    .suffix(" mm")).changed();
                ui.end_row();

                ui.label("Max Volume:");
                changed |= ui.add(egui::DragValue::new(&mut self.config.max_volume)
                    .clamp_range(0.1..=1000.0)
                    .speed(0.1)
                    .suffix(" mL")).changed();
                ui.end_row();

                ui.label("Max Rate:");
                changed |= ui.add(egui::DragValue::new(&mut self.config.max_rate)
                    .clamp_range(0.1..=1000.0)
                    .speed(0.1)
                    .suffix(" mL/min")).changed();
                ui.end_row();
            });

            if ui.button("🔍 Scan Ports").clicked() {
                self.scan_ports();
                let found = self.available_ports.len();
                self.append_message(&format!("Found {} serial ports", found));
            }
        });

        if changed {
            self.update_and_save_config();
        }
    }

    fn render_step_dialog(&mut self, ctx: &egui::Context) {
        let Some(dialog) = self.step_dialog.as_mut() else {
            return;
        };
        let function = dialog.step.function;
        let title = match dialog.row {
            Some(row) => format!("Edit Step {}: {}", row + 1, function),
            None => format!("Add Step: {}", function),
        };
        let mut accepted = false;
        let mut cancelled = false;

        egui::Window::new(title)
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                egui::Grid::new("step_params").num_columns(2).show(ui, |ui| {
                    for spec in function.param_specs() {
                        ui.label(format!("{}:", spec.label));
                        let value = dialog.step.params.entry(spec.name.to_string()).or_insert(spec.initial);
                        let mut drag = egui::DragValue::new(value).clamp_range(spec.min..=spec.max);
                        drag = if function == StepFunction::StartLoop {
                            drag.speed(1.0).fixed_decimals(0)
                        } else {
                            drag.speed(0.1).max_decimals(2)
                        };
                        if !spec.suffix.is_empty() {
                            drag = drag.suffix(format!(" {}", spec.suffix));
                        }
                        ui.add(drag);
                        ui.end_row();
                    }
                });
                ui.separator();
                ui.horizontal(|ui| {
                    if ui.button("OK").clicked() {
                        accepted = true;
                    }
                    if ui.button("Cancel").clicked() {
                        cancelled = true;
                    }
                });
            });

        if accepted {
            if let Some(mut dialog) = self.step_dialog.take() {
                if dialog.step.function == StepFunction::StartLoop {
                    let iterations = dialog.step.param("iterations").round();
                    dialog.step.set_param("iterations", iterations);
                }
                self.apply_step_dialog(dialog);
            }
        } else if cancelled {
            self.step_dialog = None;
        }
    }

    fn render_alert(&mut self, ctx: &egui::Context) {
        let Some(alert) = self.alert.as_ref() else {
            return;
        };
        let mut dismissed = false;
        egui::Window::new(alert.title.as_str())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(alert.message.as_str());
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.alert = None;
        }
    }
}

impl eframe::App for PumpGUI {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_executor();
        if self.is_busy() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }

        egui::TopBottomPanel::top("tabs").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.selectable_value(&mut self.tab, Tab::Program, "Program");
                ui.selectable_value(&mut self.tab, Tab::Configuration, "Configuration");
            });
        });

        egui::TopBottomPanel::bottom("messages").resizable(true).show(ctx, |ui| {
            ui.collapsing("Messages", |ui| {
                egui::ScrollArea::vertical()
                    .max_height(160.0)
                    .auto_shrink([false; 2])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        ui.add(
                            egui::TextEdit::multiline(&mut self.message)
                                .desired_width(f32::INFINITY)
                                .interactive(false)
                        );
                    });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| match self.tab {
            Tab::Program => self.render_program_tab(ui),
            Tab::Configuration => self.render_configuration_tab(ui),
        });

        self.render_step_dialog(ctx);
        self.render_alert(ctx);
    }
}

impl Drop for PumpGUI {
    fn drop(&mut self) {
        if let Some(mut handle) = self.executor.take() {
            handle.stop();
            if let Err(e) = handle.join() {
                log::warn!("{:#}", e);
            }
        }
        if self.jogging.is_some() {
            self.stop_jog();
        }
        self.disconnect();
    }
}

fn main() {
    let args = Args::parse();
    let level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(level).init();

    println!("Pump GUI starting...");
    let config_path = args.config.unwrap_or_else(config_loader::config_path);
    let steps_path = args.steps.unwrap_or_else(config_loader::steps_path);

    let gui = match PumpGUI::new(config_path, steps_path) {
        Ok(gui) => {
            println!("✓ PumpGUI created successfully");
            gui
        }
        Err(e) => {
            eprintln!("✗ Failed to create PumpGUI: {:#}", e);
            std::process::exit(1);
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Chemyx Pump Control")
            .with_inner_size([820.0, 720.0]),
        ..Default::default()
    };

    if let Err(e) = eframe::run_native(
        "Chemyx Pump Control",
        options,
        Box::new(|cc| {
            apply_theme(&cc.egui_ctx);
            Box::new(gui)
        }),
    ) {
        eprintln!("✗ GUI error: {}", e);
        std::process::exit(1);
    }

    println!("Pump GUI exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn gui_in(dir: &tempfile::TempDir) -> PumpGUI {
        PumpGUI::new(dir.path().join("config.json"), dir.path().join("steps.json")).unwrap()
    }

    #[test]
    fn poll_reaps_worker_that_exited_without_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut gui = gui_in(&dir);
        let connection = executor::shared(ChemyxConnection::new("unused", 38400));
        let (tx, rx) = unbounded();
        let handle = StepExecutor::new(Vec::new(), connection, gui.config.clone(), tx)
            .with_sleeper(Arc::new(|_: Duration| {}))
            .spawn()
            .unwrap();
        drop(rx);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        gui.executor = Some(handle);
        gui.current_step = Some(0);

        gui.poll_executor();
        assert!(gui.executor.is_none());
        assert!(!gui.is_busy());
        assert_eq!(gui.current_step, None);
        assert!(gui.message.contains("Program finished"));
    }

    #[test]
    fn single_step_error_names_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut gui = gui_in(&dir);
        gui.connection = Some(executor::shared(ChemyxConnection::new("unused", 38400)));
        gui.steps = vec![
            Step::with_defaults(StepFunction::Wait),
            Step::with_defaults(StepFunction::PumpVolume),
        ];
        gui.selected_row = Some(1);
        gui.single_step();

        let deadline = Instant::now() + Duration::from_secs(5);
        while gui.alert.is_none() && Instant::now() < deadline {
            gui.poll_executor();
            thread::sleep(Duration::from_millis(10));
        }
        let alert = gui.alert.as_ref().unwrap();
        assert_eq!(alert.message, "Step 2: Pump not connected");
    }

    #[test]
    fn pause_on_finished_run_logs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut gui = gui_in(&dir);
        let connection = executor::shared(ChemyxConnection::new("unused", 38400));
        let (tx, _rx) = unbounded();
        let mut handle = StepExecutor::new(Vec::new(), connection, gui.config.clone(), tx)
            .with_sleeper(Arc::new(|_: Duration| {}))
            .spawn()
            .unwrap();
        handle.join().unwrap();
        gui.executor = Some(handle);
        gui.message.clear();

        gui.pause_program();
        assert!(!gui.message.contains("Paused"));
        assert!(!gui.message.contains("Resumed"));
    }
}
