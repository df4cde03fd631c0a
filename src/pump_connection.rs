/// Chemyx pump connection
///
/// `PumpConnection` is the hardware surface the rest of the crate drives: open/close,
/// the eight parameter setters, run controls and a parameter readout.
/// `ChemyxConnection` implements it over a serial port by writing the pump's ASCII
/// commands one line at a time and reading back a single reply.

use anyhow::{anyhow, Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Flow-rate units understood by the pump. The discriminant is the serial code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    MlPerMin = 0,
    MlPerHr = 1,
    UlPerMin = 2,
    UlPerHr = 3,
}

impl Units {
    pub const ALL: [Units; 4] = [Units::MlPerMin, Units::MlPerHr, Units::UlPerMin, Units::UlPerHr];

    pub fn label(self) -> &'static str {
        match self {
            Units::MlPerMin => "mL/min",
            Units::MlPerHr => "mL/hr",
            Units::UlPerMin => "\u{03BC}L/min",
            Units::UlPerHr => "\u{03BC}L/hr",
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pump direction. Withdraw draws liquid into the syringe, infuse pushes it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Withdraw = 0,
    Infuse = 1,
}

impl PumpMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Hardware operations exposed by a pump connection.
///
/// Parameter setters take effect on the next `start_pump`.
pub trait PumpConnection: Send {
    fn open_connection(&mut self) -> Result<()>;
    fn close_connection(&mut self) -> Result<()>;

    fn set_units(&mut self, units: Units) -> Result<()>;
    fn set_diameter(&mut self, diameter: f64) -> Result<()>;
    fn set_volume(&mut self, volume: f64) -> Result<()>;
    fn set_mode(&mut self, mode: PumpMode) -> Result<()>;
    fn set_rate(&mut self, rate: f64) -> Result<()>;
    fn set_delay(&mut self, delay: f64) -> Result<()>;
    fn set_time(&mut self, time: f64) -> Result<()>;
    /// Select which pump subsequent commands address (multi-pump setups)
    fn set_pump(&mut self, pump: u8) -> Result<()>;

    fn start_pump(&mut self) -> Result<()>;
    fn stop_pump(&mut self) -> Result<()>;
    fn pause_pump(&mut self) -> Result<()>;

    /// Raw parameter readout lines, as the pump reports them
    fn get_parameters(&mut self) -> Result<Vec<String>>;

    fn multipump(&self) -> bool {
        false
    }

    fn current_pump(&self) -> u8 {
        1
    }
}

/// List serial port names available on this machine
pub fn get_open_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Serial connection to a Chemyx pump
pub struct ChemyxConnection {
    port: Option<Box<dyn SerialPort>>,
    port_path: String,
    baudrate: u32,
    multipump: bool,
    current_pump: u8,
}

impl fmt::Debug for ChemyxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChemyxConnection")
            .field("port_path", &self.port_path)
            .field("baudrate", &self.baudrate)
            .field("connected", &self.port.is_some())
            .field("multipump", &self.multipump)
            .field("current_pump", &self.current_pump)
            .finish()
    }
}

impl ChemyxConnection {
    pub fn new(port_path: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: None,
            port_path: port_path.into(),
            baudrate,
            multipump: false,
            current_pump: 1,
        }
    }

    /// Address commands to individual pumps on a multi-channel unit
    pub fn with_multipump(mut self, multipump: bool) -> Self {
        self.multipump = multipump;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn format_command(&self, cmd: &str) -> String {
        if self.multipump {
            format!("{} {}\r\n", self.current_pump, cmd)
        } else {
            format!("{}\r\n", cmd)
        }
    }

    /// Write one command line and read back the reply
    fn send_command(&mut self, cmd: &str) -> Result<String> {
        let line = self.format_command(cmd);
        let port = self.port.as_mut().ok_or_else(|| anyhow!("Pump not connected"))?;
        let _ = port.clear(serialport::ClearBuffer::Input);
        log::debug!(target: "pump_connection", "SEND: {:?}", line.trim_end());
        port.write_all(line.as_bytes())?;
        port.flush()?;

        let mut buffer = Vec::new();
        let start_time = Instant::now();
        while start_time.elapsed() < READ_TIMEOUT {
            let mut chunk = [0u8; 256];
            match port.read(&mut chunk) {
                Ok(n) if n > 0 => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.iter().any(|&b| b == b'>' || b == b'\n') {
                        break;
                    }
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(anyhow!("Read error on {}: {}", self.port_path, e)),
            }
        }

        let reply = String::from_utf8_lossy(&buffer).trim().to_string();
        log::debug!(target: "pump_connection", "RECV: {:?}", reply);
        Ok(reply)
    }
}

impl PumpConnection for ChemyxConnection {
    fn open_connection(&mut self) -> Result<()> {
        log::info!(target: "pump_connection", "Connecting to pump on {} @{}", self.port_path, self.baudrate);
        let port = serialport::new(self.port_path.as_str(), self.baudrate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open {} at {} baud", self.port_path, self.baudrate))?;
        self.port = Some(port);
        Ok(())
    }

    fn close_connection(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            log::info!(target: "pump_connection", "Closed {}", self.port_path);
        }
        Ok(())
    }

    fn set_units(&mut self, units: Units) -> Result<()> {
        self.send_command(&format!("set units {}", units.code())).map(|_| ())
    }

    fn set_diameter(&mut self, diameter: f64) -> Result<()> {
        self.send_command(&format!("set diameter {}", diameter)).map(|_| ())
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.send_command(&format!("set volume {}", volume)).map(|_| ())
    }

    fn set_mode(&mut self, mode: PumpMode) -> Result<()> {
        self.send_command(&format!("set mode {}", mode.code())).map(|_| ())
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        self.send_command(&format!("set rate {}", rate)).map(|_| ())
    }

    fn set_delay(&mut self, delay: f64) -> Result<()> {
        self.send_command(&format!("set delay {}", delay)).map(|_| ())
    }

    fn set_time(&mut self, time: f64) -> Result<()> {
        self.send_command(&format!("set time {}", time)).map(|_| ())
    }

    fn set_pump(&mut self, pump: u8) -> Result<()> {
        if pump == 0 {
            return Err(anyhow!("Pump numbers start at 1"));
        }
        self.current_pump = pump;
        Ok(())
    }

    fn start_pump(&mut self) -> Result<()> {
        self.send_command("start").map(|_| ())
    }

    fn stop_pump(&mut self) -> Result<()> {
        self.send_command("stop").map(|_| ())
    }

    fn pause_pump(&mut self) -> Result<()> {
        self.send_command("pause").map(|_| ())
    }

    fn get_parameters(&mut self) -> Result<Vec<String>> {
        let reply = self.send_command("view parameter")?;
        Ok(reply.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    fn multipump(&self) -> bool {
        self.multipump
    }

    fn current_pump(&self) -> u8 {
        self.current_pump
    }
}
