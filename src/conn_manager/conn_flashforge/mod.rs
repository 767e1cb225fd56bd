pub mod gcode_commands;
pub mod gcode_controller;
pub mod http_gateway;
pub mod http_types;
pub mod keep_alive;
pub mod replies;
pub mod tcp_session;

use tracing::{debug, info, warn};

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    config::{printer_config::PrinterConfigFlashForge, printer_id::PrinterId},
    error::Result,
};

use self::{
    gcode_controller::GCodeController, http_gateway::HttpGateway, http_types::Capabilities,
    replies::DeviceInfoSnapshot, tcp_session::TcpSession,
};

/// Both control channels of one printer under one handle.
///
/// The line protocol and the HTTP server are locked independently, a TCP
/// command and an HTTP command may be in flight at the same time.
#[derive(Clone)]
pub struct FlashForgeDevice {
    id: PrinterId,
    printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>,
    gcode: GCodeController,
    http: HttpGateway,
}

impl FlashForgeDevice {
    pub fn new(id: PrinterId, printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>) -> Result<Self> {
        let session = TcpSession::new(id.clone(), printer_cfg.clone());
        let gcode = GCodeController::new(session, printer_cfg.clone());
        let http = HttpGateway::new(id.clone(), printer_cfg.clone())?;
        Ok(Self {
            id,
            printer_cfg,
            gcode,
            http,
        })
    }

    pub fn from_config(printer_cfg: PrinterConfigFlashForge) -> Result<Self> {
        let id = printer_cfg.id.clone();
        Self::new(id, Arc::new(RwLock::new(printer_cfg)))
    }

    pub fn id(&self) -> &PrinterId {
        &self.id
    }

    pub fn printer_cfg(&self) -> &Arc<RwLock<PrinterConfigFlashForge>> {
        &self.printer_cfg
    }

    pub fn gcode(&self) -> &GCodeController {
        &self.gcode
    }

    pub fn http(&self) -> &HttpGateway {
        &self.http
    }

    /// Queries the fitted controls, then logs in on the line protocol.
    pub async fn connect(&self) -> Result<(Capabilities, DeviceInfoSnapshot)> {
        let caps = self.http.send_product_command().await?;
        let info = self.gcode.init_control().await?;

        if self.http.firmware_version().is_none() {
            let fw = info.firmware_version.trim_start_matches(['v', 'V']);
            debug!("seeding firmware version {} from device info", fw);
            self.http.set_firmware_version(fw);
        }

        info!("{} connected: {}", self.id, info.name);
        Ok((caps, info))
    }

    pub async fn shutdown(&self) {
        self.gcode.shutdown().await;
        if self.http.gate().is_busy() {
            warn!("{} shut down with an HTTP request in flight", self.id);
        }
    }
}
