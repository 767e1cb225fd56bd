use tracing::{debug, info, trace, warn};

use serde::{Deserialize, Serialize};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::RwLock, time::Instant};

use crate::{
    config::printer_config::{PrinterConfigFlashForge, SequencerOptions},
    error::{Error, Result},
};

use super::{
    gcode_commands::*,
    replies::{self, *},
    tcp_session::TcpSession,
};

const PARK_POSITION: (i32, i32, i32) = (105, 105, 220);
const RAPID_FEEDRATE: u32 = 9000;

const PREPARE_PURGE_LENGTH: i32 = 300;
const LOAD_LENGTH: i32 = 250;
const PRIME_LENGTH: i32 = 125;

const LOGIN_SETTLE: Duration = Duration::from_millis(100);

/// Filament preset for the load sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filament {
    pub name: String,
    /// Nozzle temperature while printing, °C
    pub print_temp: i32,
    /// Nozzle temperature for purging and loading, °C
    pub load_temp: i32,
}

impl Filament {
    pub fn new(name: &str, print_temp: i32, load_temp: i32) -> Self {
        Self {
            name: name.to_string(),
            print_temp,
            load_temp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heater {
    Extruder,
    Bed,
}

/// Which side of the target ends the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approach {
    Heating,
    Cooling,
}

/// Composite G-code operations on top of a [`TcpSession`].
///
/// Every composite is fail-fast: the first step that errors aborts the rest and
/// nothing already sent is undone.
#[derive(Clone)]
pub struct GCodeController {
    session: TcpSession,
    printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>,
    is_5m_pro: Arc<AtomicBool>,
}

/// new, init
impl GCodeController {
    pub fn new(session: TcpSession, printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>) -> Self {
        Self {
            session,
            printer_cfg,
            is_5m_pro: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> &TcpSession {
        &self.session
    }

    pub fn is_5m_pro(&self) -> bool {
        self.is_5m_pro.load(Ordering::SeqCst)
    }

    async fn options(&self) -> SequencerOptions {
        self.printer_cfg.read().await.sequencer
    }

    /// Logs in, then reads the device info to learn which model this is.
    pub async fn init_control(&self) -> Result<DeviceInfoSnapshot> {
        self.session.authenticate().await?;
        tokio::time::sleep(LOGIN_SETTLE).await;

        let info = self.get_device_info().await?;
        self.is_5m_pro.store(info.is_5m_pro(), Ordering::SeqCst);
        info!(
            "controlling {} ({}), firmware {}",
            info.name, info.type_name, info.firmware_version
        );
        Ok(info)
    }

    /// One device-info round trip.
    pub async fn validate(&self) -> bool {
        match self.get_device_info().await {
            Ok(_) => true,
            Err(e) => {
                warn!("validation failed: {}", e);
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}

/// raw commands
impl GCodeController {
    /// Sends a command and requires the `Received.` + `ok` acknowledgement.
    pub async fn send_cmd_ok(&self, line: &str) -> Result<()> {
        let reply = self.session.send_command(line).await?;
        if is_command_ack(&reply) {
            Ok(())
        } else {
            warn!("{:?} not acknowledged: {:?}", line, reply);
            Err(Error::Rejected {
                command: line.to_string(),
                reply: reply.trim().to_string(),
            })
        }
    }

    /// Raw telegram. A file listing comes back as one path per line.
    pub async fn send_raw_cmd(&self, line: &str) -> Result<String> {
        let reply = self.session.send_command(line).await?;
        if line.trim().starts_with(CMD_LIST_LOCAL_FILES) {
            return Ok(decode_file_list(&reply).join("\n"));
        }
        Ok(reply)
    }

    async fn query<T>(&self, line: &str, decode: fn(&str) -> Result<T>) -> Result<T> {
        let reply = self.session.send_command(line).await?;
        replies::log_decode_failure(decode(&reply), &reply)
    }
}

/// info
impl GCodeController {
    pub async fn get_temp_info(&self) -> Result<TemperatureSnapshot> {
        self.query(CMD_TEMP, decode_temperature).await
    }

    pub async fn get_endstop_info(&self) -> Result<EndstopSnapshot> {
        self.query(CMD_ENDSTOP_INFO, decode_endstop).await
    }

    pub async fn get_location_info(&self) -> Result<LocationSnapshot> {
        self.query(CMD_INFO_XYZAB, decode_location).await
    }

    pub async fn get_print_status(&self) -> Result<LegacyPrintSnapshot> {
        self.query(CMD_PRINT_STATUS, decode_print_status).await
    }

    pub async fn get_device_info(&self) -> Result<DeviceInfoSnapshot> {
        self.query(CMD_INFO_STATUS, decode_device_info).await
    }

    pub async fn get_file_list(&self) -> Result<Vec<String>> {
        let reply = self.session.send_command(CMD_LIST_LOCAL_FILES).await?;
        Ok(decode_file_list(&reply))
    }
}

/// lights, sensors
impl GCodeController {
    pub async fn led_on(&self) -> Result<()> {
        self.send_cmd_ok(CMD_LED_ON).await
    }

    pub async fn led_off(&self) -> Result<()> {
        self.send_cmd_ok(CMD_LED_OFF).await
    }

    pub async fn set_runout_sensor(&self, enabled: bool) -> Result<()> {
        if !self.is_5m_pro() {
            return Err(Error::NotEquipped("filament runout sensor"));
        }
        if enabled {
            self.send_cmd_ok(CMD_RUNOUT_SENSOR_ON).await
        } else {
            self.send_cmd_ok(CMD_RUNOUT_SENSOR_OFF).await
        }
    }
}

/// motion
impl GCodeController {
    /// Waits for the acknowledgement, so a following move starts from home.
    pub async fn home_axes(&self) -> Result<()> {
        self.send_cmd_ok(CMD_HOME_AXES).await
    }

    pub async fn rapid_home(&self) -> Result<()> {
        self.send_cmd_ok(CMD_ABSOLUTE_POSITIONING).await?;
        let (x, y, z) = PARK_POSITION;
        self.move_to(x, y, z, RAPID_FEEDRATE).await?;
        self.home_axes().await
    }

    pub async fn move_to(&self, x: i32, y: i32, z: i32, feedrate: u32) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::Move { x, y, z, feedrate }.to_line())
            .await
    }

    pub async fn move_extruder(&self, x: i32, y: i32, feedrate: u32) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::MoveExtruder { x, y, feedrate }.to_line())
            .await
    }

    pub async fn extrude(&self, length: i32, feedrate: u32) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::Extrude { length, feedrate }.to_line())
            .await
    }
}

/// temperatures
impl GCodeController {
    pub async fn set_extruder_temp(&self, temp: i32, wait: bool) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::SetExtruderTemp(temp).to_line())
            .await?;
        if wait {
            self.wait_for_temp(Heater::Extruder, temp, Approach::Heating)
                .await?;
        }
        Ok(())
    }

    pub async fn cancel_extruder_temp(&self) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::SetExtruderTemp(0).to_line())
            .await
    }

    pub async fn set_bed_temp(&self, temp: i32, wait: bool) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::SetBedTemp(temp).to_line())
            .await?;
        if wait {
            self.wait_for_temp(Heater::Bed, temp, Approach::Heating)
                .await?;
        }
        Ok(())
    }

    /// Turns the bed off, optionally waiting until parts can be removed.
    pub async fn cancel_bed_temp(&self, wait_for_cool: bool) -> Result<()> {
        self.send_cmd_ok(&GCodeCmd::SetBedTemp(0).to_line()).await?;
        if wait_for_cool {
            let temp = self.options().await.part_cool_temp;
            self.wait_for_part_cool(temp).await?;
        }
        Ok(())
    }

    pub async fn wait_for_part_cool(&self, temp: i32) -> Result<()> {
        self.wait_for_temp(Heater::Bed, temp, Approach::Cooling)
            .await
    }

    /// Polls `~M105` until the heater reaches `target`.
    ///
    /// The heater is left as set when the deadline passes.
    async fn wait_for_temp(&self, heater: Heater, target: i32, approach: Approach) -> Result<()> {
        let opts = self.options().await;
        let deadline = Instant::now() + opts.temp_wait_timeout;

        loop {
            let temps = self.get_temp_info().await?;
            let current = match heater {
                Heater::Extruder => temps.extruder.current,
                Heater::Bed => temps.bed.current,
            };
            trace!("{:?} at {}, waiting for {}", heater, current, target);

            let reached = match approach {
                Approach::Heating => current >= target,
                Approach::Cooling => current <= target,
            };
            if reached {
                debug!("{:?} reached {}", heater, target);
                return Ok(());
            }

            if Instant::now() + opts.temp_poll_interval >= deadline {
                warn!("{:?} did not reach {} in time", heater, target);
                return Err(Error::Timeout {
                    after: opts.temp_wait_timeout,
                    what: format!("{:?} to reach {}°C", heater, target).to_lowercase(),
                });
            }
            tokio::time::sleep(opts.temp_poll_interval).await;
        }
    }

    /// Refuses to extrude through a cold nozzle.
    async fn ensure_nozzle_hot(&self) -> Result<()> {
        let min = self.options().await.min_extrude_temp;
        let current = self.get_temp_info().await?.extruder.current;
        if current < min {
            warn!("nozzle at {}°C, refusing to extrude below {}°C", current, min);
            return Err(Error::Precondition(format!(
                "nozzle at {}°C, needs at least {}°C",
                current, min
            )));
        }
        Ok(())
    }
}

/// filament
impl GCodeController {
    /// Parks the head at the front corner, heats to the filament's load temperature, then purges.
    pub async fn prepare_filament_load(&self, filament: &Filament) -> Result<()> {
        info!(
            "preparing {} filament load at {}°C",
            filament.name, filament.load_temp
        );
        self.cancel_extruder_temp().await?;
        self.send_cmd_ok(CMD_ABSOLUTE_POSITIONING).await?;
        self.home_axes().await?;
        self.move_extruder(0, 0, RAPID_FEEDRATE).await?;
        self.set_extruder_temp(filament.load_temp, true).await?;
        self.extrude(PREPARE_PURGE_LENGTH, DEFAULT_EXTRUDE_FEEDRATE)
            .await
    }

    pub async fn load_filament(&self) -> Result<()> {
        self.ensure_nozzle_hot().await?;
        self.extrude(LOAD_LENGTH, DEFAULT_EXTRUDE_FEEDRATE).await
    }

    pub async fn prime_nozzle(&self) -> Result<()> {
        self.ensure_nozzle_hot().await?;
        self.extrude(PRIME_LENGTH, DEFAULT_EXTRUDE_FEEDRATE).await
    }

    pub async fn finish_filament_load(&self) -> Result<()> {
        self.cancel_extruder_temp().await?;
        let delay = self.options().await.cool_down_delay;
        tokio::time::sleep(delay).await;
        self.home_axes().await
    }
}
