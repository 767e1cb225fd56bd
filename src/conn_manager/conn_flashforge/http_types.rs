use serde::{Deserialize, Serialize, Serializer};

/// MARK: Requests

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials<'a> {
    pub serial_number: &'a str,
    pub check_code: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOff {
    Open,
    Close,
}

impl From<bool> for OnOff {
    fn from(on: bool) -> Self {
        if on {
            OnOff::Open
        } else {
            OnOff::Close
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pause,
    /// Resume
    Continue,
    Cancel,
}

/// `printerCtl_cmd` arguments.
///
/// Every field is sent every time, so a call that only changes one value
/// resets the others to these defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterControlArgs {
    /// The firmware only accepts this in `1.0E-002` notation.
    #[serde(serialize_with = "serialize_scientific")]
    pub z_axis_compensation: f64,
    pub speed: i32,
    pub chamber_fan: i32,
    pub cooling_fan: i32,
    pub cooling_left_fan: i32,
}

impl Default for PrinterControlArgs {
    fn default() -> Self {
        Self {
            z_axis_compensation: 0.0,
            speed: 100,
            chamber_fan: 100,
            cooling_fan: 100,
            cooling_left_fan: 0,
        }
    }
}

/// Arguments of a `/control` command, one variant per command kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlArgs {
    Light {
        status: OnOff,
    },
    PrinterControl(PrinterControlArgs),
    Circulation {
        internal: OnOff,
        external: OnOff,
    },
    Job {
        #[serde(rename = "jobID")]
        job_id: String,
        action: JobAction,
    },
    Camera {
        action: OnOff,
    },
    State {
        action: &'static str,
    },
}

impl ControlArgs {
    pub const CMD_LIGHT: &'static str = "lightControl_cmd";
    pub const CMD_PRINTER: &'static str = "printerCtl_cmd";
    pub const CMD_CIRCULATION: &'static str = "circulateCtl_cmd";
    pub const CMD_JOB: &'static str = "jobCtl_cmd";
    pub const CMD_CAMERA: &'static str = "streamCtrl_cmd";
    pub const CMD_STATE: &'static str = "stateCtrl_cmd";

    pub fn cmd(&self) -> &'static str {
        match self {
            ControlArgs::Light { .. } => Self::CMD_LIGHT,
            ControlArgs::PrinterControl(_) => Self::CMD_PRINTER,
            ControlArgs::Circulation { .. } => Self::CMD_CIRCULATION,
            ControlArgs::Job { .. } => Self::CMD_JOB,
            ControlArgs::Camera { .. } => Self::CMD_CAMERA,
            ControlArgs::State { .. } => Self::CMD_STATE,
        }
    }

    pub fn job(action: JobAction) -> Self {
        ControlArgs::Job {
            job_id: String::new(),
            action,
        }
    }

    pub fn clear_platform() -> Self {
        ControlArgs::State {
            action: "setClearPlatform",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ControlPayload<'a> {
    pub cmd: &'static str,
    pub args: &'a ControlArgs,
}

/// `{serialNumber, checkCode, payload: {cmd, args}}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEnvelope<'a> {
    #[serde(flatten)]
    pub credentials: Credentials<'a>,
    pub payload: ControlPayload<'a>,
}

impl<'a> ControlEnvelope<'a> {
    pub fn new(credentials: Credentials<'a>, args: &'a ControlArgs) -> Self {
        Self {
            credentials,
            payload: ControlPayload {
                cmd: args.cmd(),
                args,
            },
        }
    }
}

/// Extra print flags newer firmware expects, only meaningful with a material station.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialStationArgs {
    pub flow_calibration: bool,
    pub use_matl_station: bool,
    pub gcode_tool_cnt: u32,
    pub material_mappings: Vec<serde_json::Value>,
}

impl Default for MaterialStationArgs {
    fn default() -> Self {
        Self {
            flow_calibration: false,
            use_matl_station: false,
            gcode_tool_cnt: 0,
            material_mappings: vec![],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintLocalRequest<'a> {
    #[serde(flatten)]
    pub credentials: Credentials<'a>,
    pub file_name: &'a str,
    pub leveling_before_print: bool,
    #[serde(flatten)]
    pub material_station: Option<MaterialStationArgs>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest<'a> {
    #[serde(flatten)]
    pub credentials: Credentials<'a>,
    pub file_name: &'a str,
}

/// MARK: Scientific

/// Formats like .NET's `E1`: one mantissa digit after the point, signed
/// three-digit exponent. Zero is `0E0`.
pub fn format_scientific(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return "0E0".to_string();
    }
    let s = format!("{:.1E}", v);
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}E{}{:03}", mantissa, sign, exp.abs())
        }
        None => s,
    }
}

fn serialize_scientific<S>(v: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::Error;
    let raw = serde_json::value::RawValue::from_string(format_scientific(*v))
        .map_err(S::Error::custom)?;
    raw.serialize(serializer)
}

/// MARK: Responses

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenericResponse {
    pub code: i32,
    pub message: String,
}

pub fn is_success(code: i32, message: &str) -> bool {
    code == 0 && message.eq_ignore_ascii_case("Success")
}

impl GenericResponse {
    pub fn is_ok(&self) -> bool {
        is_success(self.code, &self.message)
    }
}

/// Which controls are physically fitted, 0 meaning absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Product {
    pub chamber_temp_ctrl_state: i32,
    pub external_fan_ctrl_state: i32,
    pub internal_fan_ctrl_state: i32,
    pub light_ctrl_state: i32,
    pub nozzle_temp_ctrl_state: i32,
    pub platform_temp_ctrl_state: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProductResponse {
    pub code: i32,
    pub message: String,
    pub product: Option<Product>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub led_control: bool,
    pub filtration_control: bool,
}

impl From<&Product> for Capabilities {
    fn from(p: &Product) -> Self {
        Self {
            led_control: p.light_ctrl_state != 0,
            filtration_control: p.internal_fan_ctrl_state != 0 && p.external_fan_ctrl_state != 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Detail {
    pub auto_shutdown: String,
    pub auto_shutdown_time: i64,
    pub camera_stream_url: String,
    pub chamber_fan_speed: i64,
    pub chamber_target_temp: f64,
    pub chamber_temp: f64,
    pub cooling_fan_speed: i64,
    pub cumulative_filament: f64,
    /// Minutes
    pub cumulative_print_time: i64,
    pub current_print_speed: i64,
    pub door_status: String,
    pub error_code: String,
    pub estimated_right_len: f64,
    pub estimated_right_weight: f64,
    /// Seconds
    pub estimated_time: f64,
    pub external_fan_status: String,
    pub fill_amount: i64,
    pub firmware_version: String,
    pub flash_register_code: String,
    pub internal_fan_status: String,
    pub ip_addr: String,
    pub light_status: String,
    pub location: String,
    pub mac_addr: String,
    pub measure: String,
    pub name: String,
    pub nozzle_cnt: i64,
    pub nozzle_model: String,
    pub nozzle_style: i64,
    pub pid: i64,
    pub plat_target_temp: f64,
    pub plat_temp: f64,
    pub polar_register_code: String,
    /// Seconds
    pub print_duration: i64,
    pub print_file_name: String,
    pub print_file_thumb_url: String,
    pub print_layer: i64,
    /// 0.0 - 1.0
    pub print_progress: f64,
    pub print_speed_adjust: f64,
    pub remaining_disk_space: f64,
    pub right_filament_type: String,
    pub right_target_temp: f64,
    pub right_temp: f64,
    pub status: String,
    pub target_print_layer: i64,
    pub tvoc: i64,
    pub z_axis_compensation: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DetailResponse {
    pub code: i32,
    pub message: String,
    pub detail: Option<Detail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GCodeListResponse {
    pub code: i32,
    pub gcode_list: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThumbnailResponse {
    pub code: i32,
    pub image_data: String,
    pub message: String,
}

/// MARK: Firmware

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Accepts `3.1.3`, `v3.1.3` and `3.1.3-beta`. Missing parts count as 0.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches(['v', 'V']);
        let end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let mut parts = s[..end].split('.').filter(|p| !p.is_empty());

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

/// Upload and print payload layout, picked from the firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadShape {
    Legacy,
    /// 3.1.3 and newer, with the material-station fields.
    MaterialStation,
}

impl UploadShape {
    pub const CUTOFF: FirmwareVersion = FirmwareVersion::new(3, 1, 3);

    /// Unknown or unreadable firmware gets the legacy shape.
    pub fn for_firmware(firmware: Option<&str>) -> Self {
        match firmware.and_then(FirmwareVersion::parse) {
            Some(v) if v >= Self::CUTOFF => UploadShape::MaterialStation,
            _ => UploadShape::Legacy,
        }
    }

    pub fn boundary(&self) -> &'static str {
        match self {
            UploadShape::Legacy => "------------------------DHD3lr8XwXBuyC8G3dWjK7",
            UploadShape::MaterialStation => "------------------------v3GcLTGebpPzgLGBOgAQKJ",
        }
    }

    /// Headers sent after the common ones.
    pub fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            UploadShape::Legacy => &[],
            UploadShape::MaterialStation => &[
                ("flowCalibration", "false"),
                ("useMatlStation", "false"),
                ("gcodeToolCnt", "0"),
                // base64 of "[]"
                ("materialMappings", "W10="),
            ],
        }
    }

    pub fn material_station_args(&self) -> Option<MaterialStationArgs> {
        match self {
            UploadShape::Legacy => None,
            UploadShape::MaterialStation => Some(MaterialStationArgs::default()),
        }
    }
}
