//! Decoders for line-protocol telegrams.
//!
//! A telegram is the whole multi-line reply to one command. Line 0 is the
//! `CMD Mxxx Received.` echo, the payload starts at line 1. Every decoder is
//! all-or-nothing: one missing line or bad number fails the whole telegram.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::gcode_commands::CMD_GET_THUMBNAIL;

fn lines(telegram: &str) -> Vec<&str> {
    telegram.split('\n').map(|l| l.trim_end_matches('\r')).collect()
}

fn line<'a>(lines: &[&'a str], idx: usize, kind: &'static str) -> Result<&'a str> {
    lines
        .get(idx)
        .copied()
        .ok_or_else(|| Error::decode(kind, format!("missing line {}", idx)))
}

/// `"Label: value"` -> `"value"`, failing if the label is not there.
fn labelled<'a>(line: &'a str, label: &str, kind: &'static str) -> Result<&'a str> {
    line.trim_start()
        .strip_prefix(label)
        .map(str::trim)
        .ok_or_else(|| Error::decode(kind, format!("expected `{}` in {:?}", label, line)))
}

/// Everything right of the first `:`.
fn right_of_colon<'a>(line: &'a str, kind: &'static str) -> Result<&'a str> {
    line.split_once(':')
        .map(|(_, v)| v.trim())
        .ok_or_else(|| Error::decode(kind, format!("no `:` in {:?}", line)))
}

fn number<T: std::str::FromStr>(s: &str, kind: &'static str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| Error::decode(kind, format!("not a number: {:?}", s)))
}

/// MARK: Temperature

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureReading {
    pub current: i32,
    /// `None` when the heater only reports its current value. An explicit
    /// `/0` target is kept as `Some(0)`.
    pub target: Option<i32>,
}

impl TemperatureReading {
    /// Parses `"210/220"`, `"45.6"` or `"25.1/0.0"`.
    pub fn parse(s: &str) -> Result<Self> {
        const KIND: &str = "temperature";
        let s = s.trim();
        match s.split_once('/') {
            Some((current, target)) => {
                Ok(Self {
                    current: round_temp(current, KIND)?,
                    target: Some(round_temp(target, KIND)?),
                })
            }
            None => Ok(Self {
                current: round_temp(s, KIND)?,
                target: None,
            }),
        }
    }
}

/// Half-away-from-zero, which is what `f64::round` does.
fn round_temp(s: &str, kind: &'static str) -> Result<i32> {
    let v: f64 = number(s, kind)?;
    if !v.is_finite() {
        return Err(Error::decode(kind, format!("not finite: {:?}", s)));
    }
    Ok(v.round() as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureSnapshot {
    pub extruder: TemperatureReading,
    pub bed: TemperatureReading,
}

impl TemperatureSnapshot {
    pub fn is_cooled(&self) -> bool {
        self.bed.current <= 40 && self.extruder.current <= 200
    }

    pub fn are_temps_safe(&self) -> bool {
        self.extruder.current < 250 && self.bed.current < 100
    }
}

/// `~M105`
///
/// ```text
/// CMD M105 Received.
/// T0:210/210 T1:0/0 B:60/60
/// ok
/// ```
pub fn decode_temperature(telegram: &str) -> Result<TemperatureSnapshot> {
    const KIND: &str = "temperature";
    let lines = lines(telegram);
    let data = line(&lines, 1, KIND)?;

    let mut extruder = None;
    let mut bed = None;
    for token in data.split_whitespace() {
        if let Some(v) = token.strip_prefix("T0:") {
            extruder = Some(TemperatureReading::parse(v)?);
        } else if let Some(v) = token.strip_prefix("B:") {
            bed = Some(TemperatureReading::parse(v)?);
        }
    }

    match (extruder, bed) {
        (Some(extruder), Some(bed)) => Ok(TemperatureSnapshot { extruder, bed }),
        (None, _) => Err(Error::decode(KIND, "missing T0 field")),
        (_, None) => Err(Error::decode(KIND, "missing B field")),
    }
}

/// MARK: Endstop

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    BuildingFromSd,
    BuildingCompleted,
    Paused,
    Ready,
    Unknown,
}

impl MachineStatus {
    fn from_token(s: &str) -> Self {
        let out = if s.contains("BUILDING_FROM_SD") {
            MachineStatus::BuildingFromSd
        } else if s.contains("BUILDING_COMPLETED") {
            MachineStatus::BuildingCompleted
        } else if s.contains("PAUSED") {
            MachineStatus::Paused
        } else if s.contains("READY") {
            MachineStatus::Ready
        } else {
            MachineStatus::Unknown
        };
        if out == MachineStatus::Unknown {
            warn!("unknown MachineStatus: {:?}", s);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Moving,
    Paused,
    Ready,
    Unknown,
}

impl MoveMode {
    fn from_token(s: &str) -> Self {
        if s.contains("MOVING") {
            MoveMode::Moving
        } else if s.contains("PAUSED") {
            MoveMode::Paused
        } else if s.contains("READY") {
            MoveMode::Ready
        } else {
            warn!("unknown MoveMode: {:?}", s);
            MoveMode::Unknown
        }
    }
}

/// Endstop trigger flags, -1 when the key is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endstops {
    pub x_max: i32,
    pub y_max: i32,
    pub z_min: i32,
}

/// The packed `Status: S:1 L:0 J:0 F:0` counters, -1 when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
    pub s: i32,
    pub l: i32,
    pub j: i32,
    pub f: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndstopSnapshot {
    pub endstops: Endstops,
    pub machine_status: MachineStatus,
    pub move_mode: MoveMode,
    pub status: StatusFlags,
    pub led_enabled: bool,
    pub current_file: Option<String>,
}

impl EndstopSnapshot {
    pub fn is_printing(&self) -> bool {
        self.machine_status == MachineStatus::BuildingFromSd
    }

    pub fn is_print_complete(&self) -> bool {
        self.machine_status == MachineStatus::BuildingCompleted
    }

    pub fn is_ready(&self) -> bool {
        self.move_mode == MoveMode::Ready && self.machine_status == MachineStatus::Ready
    }

    pub fn is_paused(&self) -> bool {
        self.machine_status == MachineStatus::Paused || self.move_mode == MoveMode::Paused
    }
}

static KEY_VALUE_REGEX: OnceLock<Regex> = OnceLock::new();

/// `key:digits` anywhere in `input`, -1 if the key is missing.
fn keyed_value(input: &str, key: &str) -> i32 {
    let re = KEY_VALUE_REGEX
        .get_or_init(|| Regex::new(r"([A-Za-z-]+):(\d+)").expect("invalid key:value regex"));

    re.captures_iter(input)
        .find(|c| c.get(1).is_some_and(|k| k.as_str() == key))
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

/// `~M119`
///
/// ```text
/// CMD M119 Received.
/// Endstop: X-max:0 Y-max:0 Z-min:0
/// MachineStatus: READY
/// MoveMode: READY
/// Status: S:1 L:0 J:0 F:0
/// LED: 1
/// CurrentFile:
/// ok
/// ```
pub fn decode_endstop(telegram: &str) -> Result<EndstopSnapshot> {
    const KIND: &str = "endstop";
    let lines = lines(telegram);

    let endstop_line = labelled(line(&lines, 1, KIND)?, "Endstop:", KIND)?;
    let endstops = Endstops {
        x_max: keyed_value(endstop_line, "X-max"),
        y_max: keyed_value(endstop_line, "Y-max"),
        z_min: keyed_value(endstop_line, "Z-min"),
    };

    let machine_status =
        MachineStatus::from_token(labelled(line(&lines, 2, KIND)?, "MachineStatus:", KIND)?);
    let move_mode = MoveMode::from_token(labelled(line(&lines, 3, KIND)?, "MoveMode:", KIND)?);

    let status_line = labelled(line(&lines, 4, KIND)?, "Status:", KIND)?;
    let status = StatusFlags {
        s: keyed_value(status_line, "S"),
        l: keyed_value(status_line, "L"),
        j: keyed_value(status_line, "J"),
        f: keyed_value(status_line, "F"),
    };

    let led: i32 = number(labelled(line(&lines, 5, KIND)?, "LED:", KIND)?, KIND)?;

    let current_file = labelled(line(&lines, 6, KIND)?, "CurrentFile:", KIND)?;
    let current_file = (!current_file.is_empty()).then(|| current_file.to_string());

    Ok(EndstopSnapshot {
        endstops,
        machine_status,
        move_mode,
        status,
        led_enabled: led == 1,
        current_file,
    })
}

/// MARK: Location

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSnapshot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// `~M114`
///
/// ```text
/// CMD M114 Received.
/// X:10.5 Y:-3 Z:120.25 A:0 B:0
/// ok
/// ```
pub fn decode_location(telegram: &str) -> Result<LocationSnapshot> {
    const KIND: &str = "location";
    let lines = lines(telegram);
    let data: Vec<&str> = line(&lines, 1, KIND)?.split_whitespace().collect();

    let axis = |idx: usize, label: &str| -> Result<f64> {
        let token = data
            .get(idx)
            .ok_or_else(|| Error::decode(KIND, format!("missing {} field", label)))?;
        number(labelled(token, label, KIND)?, KIND)
    };

    Ok(LocationSnapshot {
        x: axis(0, "X:")?,
        y: axis(1, "Y:")?,
        z: axis(2, "Z:")?,
    })
}

/// MARK: Legacy print status

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPrintSnapshot {
    pub sd_current: u64,
    pub sd_total: u64,
    pub layer_current: u32,
    pub layer_total: u32,
}

impl LegacyPrintSnapshot {
    /// Byte progress as a percentage, rounded half away from zero.
    pub fn print_percent(&self) -> u32 {
        if self.sd_total == 0 {
            return 0;
        }
        (self.sd_current as f64 / self.sd_total as f64 * 100.0).round() as u32
    }

    pub fn layer_progress(&self) -> String {
        format!("{}/{}", self.layer_current, self.layer_total)
    }
}

fn fraction<T: std::str::FromStr>(s: &str, kind: &'static str) -> Result<(T, T)> {
    let (a, b) = s
        .split_once('/')
        .ok_or_else(|| Error::decode(kind, format!("no `/` in {:?}", s)))?;
    Ok((number(a, kind)?, number(b, kind)?))
}

/// `~M27`
///
/// ```text
/// CMD M27 Received.
/// SD printing byte 1234/56789
/// Layer: 3/120
/// ok
/// ```
pub fn decode_print_status(telegram: &str) -> Result<LegacyPrintSnapshot> {
    const KIND: &str = "print status";
    let lines = lines(telegram);

    let sd = labelled(line(&lines, 1, KIND)?, "SD printing byte", KIND)?;
    let (sd_current, sd_total) = fraction(sd, KIND)?;

    let layer = labelled(line(&lines, 2, KIND)?, "Layer:", KIND)?;
    let (layer_current, layer_total) = fraction(layer, KIND)?;

    Ok(LegacyPrintSnapshot {
        sd_current,
        sd_total,
        layer_current,
        layer_total,
    })
}

/// MARK: Device info

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoSnapshot {
    pub type_name: String,
    pub name: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub dimensions: String,
    pub tool_count: u32,
    pub mac_address: String,
}

impl DeviceInfoSnapshot {
    pub fn is_pro(&self) -> bool {
        self.type_name.contains("Pro")
    }

    /// The 5M Pro is the only model known to carry a filament runout sensor.
    pub fn is_5m_pro(&self) -> bool {
        self.type_name.contains("5M") && self.is_pro()
    }
}

/// `~M115`
///
/// ```text
/// CMD M115 Received.
/// Machine Type: Flashforge Adventurer 5M Pro
/// Machine Name: Adventurer 5M Pro
/// Firmware: v2.7.5
/// SN: SNMOMC9900728
/// X: 220 Y: 220 Z: 220
/// Tool Count: 1
/// Mac Address:88:A9:A7:90:9E:2B
/// ok
/// ```
pub fn decode_device_info(telegram: &str) -> Result<DeviceInfoSnapshot> {
    const KIND: &str = "device info";
    let lines = lines(telegram);

    let required = |idx: usize| -> Result<String> {
        let v = right_of_colon(line(&lines, idx, KIND)?, KIND)?;
        if v.is_empty() {
            return Err(Error::decode(KIND, format!("empty field on line {}", idx)));
        }
        Ok(v.to_string())
    };

    let type_name = required(1)?;
    let name = required(2)?;
    let firmware_version = required(3)?;
    let serial_number = required(4)?;
    let dimensions = line(&lines, 5, KIND)?.trim().to_string();
    let tool_count = number(&required(6)?, KIND)?;
    let mac_address = labelled(line(&lines, 7, KIND)?, "Mac Address:", KIND)?.to_string();

    Ok(DeviceInfoSnapshot {
        type_name,
        name,
        firmware_version,
        serial_number,
        dimensions,
        tool_count,
        mac_address,
    })
}

/// MARK: File list

const FILE_SEPARATOR: &str = "::";
const FILE_PATH_MARKER: &str = "/data/";

/// `~M661`
///
/// Entries are separated by `::` and carry binary noise before the `/data/`
/// path. Entries without the marker are dropped, the marker itself is removed.
/// Anything from the `~M662` thumbnail stream onwards is ignored.
pub fn decode_file_list(telegram: &str) -> Vec<String> {
    let listing = telegram
        .split_once(CMD_GET_THUMBNAIL)
        .map_or(telegram, |(head, _)| head);
    let out: Vec<String> = listing
        .split(FILE_SEPARATOR)
        .filter_map(|entry| {
            let entry = entry.trim();
            let idx = entry.to_ascii_lowercase().find(FILE_PATH_MARKER)?;
            let path: String = entry[idx + FILE_PATH_MARKER.len()..]
                .chars()
                .filter(|c| (' '..='~').contains(c))
                .collect();
            (!path.is_empty()).then_some(path)
        })
        .collect();
    trace!("decoded {} file(s)", out.len());
    out
}

/// Logs a failed decode with the raw telegram and hands the error back.
pub(crate) fn log_decode_failure<T>(res: Result<T>, telegram: &str) -> Result<T> {
    if let Err(e) = &res {
        debug!("{}; raw telegram: {:?}", e, telegram);
    }
    res
}
