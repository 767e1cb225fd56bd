use serde::{Deserialize, Serialize};

use crate::conn_manager::conn_flashforge::http_types::Detail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Ready,
    Busy,
    Calibrating,
    Error,
    Heating,
    Printing,
    Pausing,
    Paused,
    Cancelled,
    Completed,
    Unknown,
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState::Unknown
    }
}

impl MachineState {
    /// Maps the `status` string of `/detail`.
    pub fn from_status(status: &str) -> Self {
        match status {
            "ready" => MachineState::Ready,
            "busy" => MachineState::Busy,
            "calibrate_doing" => MachineState::Calibrating,
            "error" => MachineState::Error,
            "heating" => MachineState::Heating,
            "printing" => MachineState::Printing,
            "pausing" => MachineState::Pausing,
            "paused" => MachineState::Paused,
            "cancel" => MachineState::Cancelled,
            "completed" => MachineState::Completed,
            _ => {
                tracing::debug!("unknown machine status: {:?}", status);
                MachineState::Unknown
            }
        }
    }

    pub fn to_text(&self) -> &'static str {
        match self {
            MachineState::Ready => "Ready",
            MachineState::Busy => "Busy",
            MachineState::Calibrating => "Calibrating",
            MachineState::Error => "Error",
            MachineState::Heating => "Heating",
            MachineState::Printing => "Printing",
            MachineState::Pausing => "Pausing",
            MachineState::Paused => "Paused",
            MachineState::Cancelled => "Cancelled",
            MachineState::Completed => "Completed",
            MachineState::Unknown => "Unknown",
        }
    }
}

/// `/detail` translated into friendlier units, with the unused fields dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInfo {
    pub name: String,
    pub firmware_version: String,
    pub status: String,
    pub machine_state: MachineState,

    pub auto_shutdown: bool,
    pub auto_shutdown_time: i64,
    /// Broken on firmware 2.7.5
    pub door_open: bool,
    pub lights_on: bool,
    pub internal_fan_on: bool,
    pub external_fan_on: bool,
    pub chamber_fan_speed: i64,
    pub cooling_fan_speed: i64,

    pub camera_stream_url: String,
    pub ip_address: String,
    pub mac_address: String,
    pub nozzle_size: String,
    pub filament_type: String,
    pub error_code: String,

    pub extruder_temp: f64,
    pub extruder_set_temp: f64,
    pub print_bed_temp: f64,
    pub print_bed_set_temp: f64,

    pub print_file_name: String,
    pub print_file_thumb_url: String,
    pub current_print_layer: i64,
    pub total_print_layers: i64,
    /// 0.0 - 1.0
    pub print_progress: f64,
    /// 0 - 100
    pub print_progress_int: i64,
    pub current_print_speed: i64,
    pub print_speed_adjust: f64,
    pub fill_amount: i64,
    pub z_axis_compensation: f64,
    pub tvoc: i64,

    pub print_duration: chrono::Duration,
    pub estimated_time: chrono::Duration,
    /// Remaining time as `hh:mm`
    pub print_eta: String,
    /// Elapsed time as `hh:mm`
    pub formatted_run_time: String,
    /// Lifetime print time as `<h>h:<m>m`
    pub formatted_total_run_time: String,

    /// Filament used by the current job so far, meters
    pub est_length: f64,
    /// Filament used by the current job so far, grams
    pub est_weight: f64,
    /// Lifetime filament, meters
    pub cumulative_filament: f64,
    /// Free space in GB, two decimals
    pub free_disk_space: String,

    pub flash_cloud_register_code: String,
    pub polar_cloud_register_code: String,
}

fn hh_mm(d: chrono::Duration) -> String {
    format!("{:02}:{:02}", d.num_hours(), d.num_minutes() % 60)
}

impl MachineInfo {
    pub fn from_detail(detail: &Detail) -> Self {
        let print_duration = chrono::Duration::seconds(detail.print_duration);
        let estimated_time = chrono::Duration::seconds(detail.estimated_time.round() as i64);

        let total_minutes = detail.cumulative_print_time;

        Self {
            name: detail.name.clone(),
            firmware_version: detail.firmware_version.clone(),
            status: detail.status.clone(),
            machine_state: MachineState::from_status(&detail.status),

            auto_shutdown: detail.auto_shutdown == "open",
            auto_shutdown_time: detail.auto_shutdown_time,
            door_open: detail.door_status == "open",
            lights_on: detail.light_status == "open",
            internal_fan_on: detail.internal_fan_status == "open",
            external_fan_on: detail.external_fan_status == "open",
            chamber_fan_speed: detail.chamber_fan_speed,
            cooling_fan_speed: detail.cooling_fan_speed,

            camera_stream_url: detail.camera_stream_url.clone(),
            ip_address: detail.ip_addr.clone(),
            mac_address: detail.mac_addr.clone(),
            nozzle_size: detail.nozzle_model.clone(),
            filament_type: detail.right_filament_type.clone(),
            error_code: detail.error_code.clone(),

            extruder_temp: detail.right_temp,
            extruder_set_temp: detail.right_target_temp,
            print_bed_temp: detail.plat_temp,
            print_bed_set_temp: detail.plat_target_temp,

            print_file_name: detail.print_file_name.clone(),
            print_file_thumb_url: detail.print_file_thumb_url.clone(),
            current_print_layer: detail.print_layer,
            total_print_layers: detail.target_print_layer,
            print_progress: detail.print_progress,
            print_progress_int: (detail.print_progress * 100.0) as i64,
            current_print_speed: detail.current_print_speed,
            print_speed_adjust: detail.print_speed_adjust,
            fill_amount: detail.fill_amount,
            z_axis_compensation: detail.z_axis_compensation,
            tvoc: detail.tvoc,

            print_duration,
            estimated_time,
            print_eta: hh_mm(estimated_time),
            formatted_run_time: hh_mm(print_duration),
            formatted_total_run_time: format!("{}h:{}m", total_minutes / 60, total_minutes % 60),

            est_length: detail.estimated_right_len / 1000.0 * detail.print_progress,
            est_weight: detail.estimated_right_weight * detail.print_progress,
            cumulative_filament: detail.cumulative_filament,
            free_disk_space: format!("{:.2}", detail.remaining_disk_space),

            flash_cloud_register_code: detail.flash_register_code.clone(),
            polar_cloud_register_code: detail.polar_register_code.clone(),
        }
    }

    /// Only `printing` counts as an active job. Paused jobs do not.
    pub fn is_printing(&self) -> bool {
        self.status == "printing"
    }

    pub fn is_pro(&self) -> bool {
        self.name.contains("Pro")
    }
}
