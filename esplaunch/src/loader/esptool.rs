//! Backend that drives the external `esptool` program.
//!
//! Each loader operation becomes one `esptool` invocation against the port.
//! Only the first call (autodetection) resets the chip into its bootloader;
//! later calls pass `--before no_reset` so the chip stays there until the
//! session asks for a reset.

use super::{
    Capabilities, ChipIdentity, Framing, Loader, LoaderBackend, MacAddress, Transport,
    WriteProgress,
};
use crate::device::DetectedPort;
use crate::error::{Error, Result};
use log::{debug, trace, warn};
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Program names tried, in order, when none is configured.
pub const CANDIDATE_PROGRAMS: &[&str] = &["esptool", "esptool.py"];

/// Locate a working `esptool` on `PATH`.
pub fn find_esptool() -> Option<String> {
    CANDIDATE_PROGRAMS
        .iter()
        .find(|candidate| {
            Command::new(candidate)
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|s| s.success())
        })
        .map(|candidate| (*candidate).to_string())
}

/// Creates esptool-driven transports and loaders.
#[derive(Debug, Clone, Default)]
pub struct EsptoolBackend {
    program: Option<String>,
}

impl EsptoolBackend {
    /// Backend that searches `PATH` for `esptool`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that runs a specific program.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// The program that will be run.
    pub fn program(&self) -> Result<String> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        find_esptool().ok_or_else(|| {
            Error::Unsupported("esptool not found, install it with `pip install esptool`".into())
        })
    }
}

impl LoaderBackend for EsptoolBackend {
    fn open(&self, device: &DetectedPort, framing: Framing) -> Result<Box<dyn Transport>> {
        debug!("Opening {} for esptool ({framing:?})", device.name);
        Ok(Box::new(EsptoolTransport {
            device: device.clone(),
            open: true,
        }))
    }

    fn create_loader(
        &self,
        transport: Box<dyn Transport>,
        baud: u32,
        rom_baud: u32,
    ) -> Result<Box<dyn Loader>> {
        Ok(Box::new(EsptoolLoader {
            program: self.program()?,
            transport,
            baud,
            rom_baud,
            in_bootloader: false,
        }))
    }
}

/// Serial port handed to esptool by name.
///
/// The port itself is never held open here; esptool needs exclusive access.
#[derive(Debug)]
pub struct EsptoolTransport {
    device: DetectedPort,
    open: bool,
}

impl Transport for EsptoolTransport {
    fn device(&self) -> &DetectedPort {
        &self.device
    }

    fn framing(&self) -> Framing {
        Framing::Serial
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            trace!("Releasing {}", self.device.name);
            self.open = false;
        }
        Ok(())
    }
}

/// Loader backed by esptool invocations.
///
/// Probing commands (`chip_id`, `read_mac`) run at the ROM baud rate; erase,
/// write and reset run at the flashing baud rate.
pub struct EsptoolLoader {
    program: String,
    transport: Box<dyn Transport>,
    baud: u32,
    rom_baud: u32,
    in_bootloader: bool,
}

impl EsptoolLoader {
    fn base_args(&self, baud: u32, before: &str, after: &str) -> Vec<String> {
        vec![
            "--port".into(),
            self.transport.device().name.clone(),
            "--baud".into(),
            baud.to_string(),
            "--before".into(),
            before.into(),
            "--after".into(),
            after.into(),
        ]
    }

    fn before(&self) -> &'static str {
        if self.in_bootloader {
            "no_reset"
        } else {
            "default_reset"
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program).args(args).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!("esptool stdout: {}", stdout.trim());
        if output.status.success() {
            Ok(format!("{stdout}\n{stderr}"))
        } else {
            Err(Error::Device(failure_message(&stdout, &stderr)))
        }
    }
}

impl Loader for EsptoolLoader {
    fn detect(&mut self) -> Result<ChipIdentity> {
        debug!("Detecting chip (ROM baud {})", self.rom_baud);
        let mut args = self.base_args(self.rom_baud, self.before(), "no_reset");
        args.push("chip_id".into());
        let output = self.run(&args)?;
        self.in_bootloader = true;

        let description = parse_chip_description(&output)
            .ok_or_else(|| Error::Device("esptool did not report a chip".into()))?;
        Ok(ChipIdentity::new(description)
            .with_features(parse_features(&output))
            .with_capabilities(Capabilities::ALL))
    }

    fn read_mac_address(&mut self) -> Result<MacAddress> {
        let mut args = self.base_args(self.rom_baud, self.before(), "no_reset");
        args.push("read_mac".into());
        let output = self.run(&args)?;
        parse_mac(&output).ok_or_else(|| Error::Device("esptool did not report a MAC".into()))
    }

    fn erase_all(&mut self) -> Result<()> {
        let mut args = self.base_args(self.baud, self.before(), "no_reset");
        args.push("erase_flash".into());
        self.run(&args).map(|_| ())
    }

    fn write_image(
        &mut self,
        data: &[u8],
        address: u32,
        compress: bool,
        progress: &mut WriteProgress<'_>,
    ) -> Result<()> {
        let mut image = tempfile::NamedTempFile::new()?;
        image.write_all(data)?;
        image.flush()?;

        let mut args = self.base_args(self.baud, self.before(), "no_reset");
        args.push("write_flash".into());
        args.push(if compress { "-z" } else { "-u" }.into());
        args.push(format!("0x{address:X}"));
        args.push(image.path().display().to_string());

        debug!("Running {} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let total = data.len();
        let transcript = match child.stdout.take() {
            Some(mut stdout) => match read_write_output(&mut stdout, total, progress) {
                Ok(transcript) => transcript,
                Err(e) => {
                    abort_child(&mut child);
                    if let Some(handle) = stderr_reader {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                },
            },
            None => String::new(),
        };

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            self.in_bootloader = true;
            progress(total, total);
            Ok(())
        } else {
            Err(Error::Device(failure_message(&transcript, &stderr)))
        }
    }

    fn soft_reset(&mut self) -> Result<()> {
        let mut args = self.base_args(self.baud, "no_reset", "no_reset");
        args.push("run".into());
        self.run(&args)?;
        self.in_bootloader = false;
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<()> {
        let mut args = self.base_args(self.baud, self.before(), "hard_reset");
        args.push("chip_id".into());
        self.run(&args)?;
        self.in_bootloader = false;
        Ok(())
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }
}

/// Collect `write_flash` output, reporting progress per `Writing at` line.
fn read_write_output(
    stdout: &mut impl Read,
    total: usize,
    progress: &mut WriteProgress<'_>,
) -> io::Result<String> {
    let mut transcript = String::new();
    let mut pending = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = stdout.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            if byte == b'\r' || byte == b'\n' {
                let line = String::from_utf8_lossy(&pending).into_owned();
                if let Some(percent) = parse_write_percent(&line) {
                    progress(bytes_for_percent(total, percent), total);
                }
                transcript.push_str(&line);
                transcript.push('\n');
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }
    transcript.push_str(&String::from_utf8_lossy(&pending));
    Ok(transcript)
}

/// Kill and reap an esptool process whose output can no longer be read.
fn abort_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        trace!("esptool already exited: {e}");
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap esptool: {e}");
    }
}

/// Value after the first `key:` occurrence on any line.
fn field<'a>(output: &'a str, keys: &[&str]) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let line = line.trim();
        keys.iter()
            .find_map(|key| line.strip_prefix(key))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

/// Chip description from `chip_id` output.
pub fn parse_chip_description(output: &str) -> Option<String> {
    field(output, &["Chip is ", "Chip type:"]).map(str::to_string)
}

/// Feature list from `chip_id` output.
pub fn parse_features(output: &str) -> Vec<String> {
    field(output, &["Features:"])
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Factory MAC from `read_mac` or `chip_id` output.
pub fn parse_mac(output: &str) -> Option<MacAddress> {
    let value = field(output, &["MAC:", "BASE MAC:"])?;
    let candidate = value.split_whitespace().next()?;
    match MacAddress::parse(candidate) {
        Ok(mac) => Some(mac),
        Err(e) => {
            warn!("{e}");
            None
        },
    }
}

/// Percentage from a `write_flash` progress line.
///
/// Understands both `Writing at 0x00010000... (45 %)` and the bar style
/// `Writing at 0x00010000 [====>   ]  45.3% 4096/9000 bytes...`.
pub fn parse_write_percent(line: &str) -> Option<f64> {
    if !line.contains("Writing at") {
        return None;
    }
    let end = line.find('%')?;
    let head = line[..end].trim_end();
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map_or(0, |(i, c)| i + c.len_utf8());
    head[start..]
        .parse::<f64>()
        .ok()
        .map(|p| p.clamp(0.0, 100.0))
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn bytes_for_percent(total: usize, percent: f64) -> usize {
    ((total as f64) * percent / 100.0).round() as usize
}

fn failure_message(stdout: &str, stderr: &str) -> String {
    let last = |text: &str| {
        text.lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
    };
    last(stderr)
        .or_else(|| last(stdout))
        .unwrap_or_else(|| "esptool failed".to_string())
}
