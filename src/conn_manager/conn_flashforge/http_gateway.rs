use tracing::{debug, info, trace, warn};

use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::{
    io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{io::AsyncReadExt, sync::RwLock};

use crate::{
    config::{printer_config::PrinterConfigFlashForge, printer_id::PrinterId},
    error::{Error, Result},
    status::MachineInfo,
};

use super::http_types::*;

/// Fans stay off below this layer so they don't lift the first layers.
const LOW_LAYER_THRESHOLD: i64 = 2;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Single-writer gate for one device's HTTP server.
///
/// The device misorders concurrent requests, so every gated request holds
/// this for its whole round trip, uploads included.
#[derive(Default)]
pub struct HttpGate {
    lock: tokio::sync::Mutex<()>,
    acquisitions: AtomicU64,
}

pub struct HttpGateGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl HttpGate {
    pub async fn acquire(&self) -> HttpGateGuard<'_> {
        let guard = self.lock.lock().await;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        HttpGateGuard { _guard: guard }
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

/// JSON and upload client for one printer.
#[derive(Clone)]
pub struct HttpGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    id: PrinterId,
    printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>,
    client: reqwest::Client,
    gate: HttpGate,
    capabilities: parking_lot::RwLock<Option<Capabilities>>,
    firmware_version: parking_lot::RwLock<Option<String>>,
    machine_name: parking_lot::RwLock<Option<String>>,
}

/// new
impl HttpGateway {
    const URL_PRODUCT: &'static str = "/product";
    const URL_CONTROL: &'static str = "/control";
    const URL_DETAIL: &'static str = "/detail";
    const URL_UPLOAD: &'static str = "/uploadGcode";
    const URL_GCODE_LIST: &'static str = "/gcodeList";
    const URL_PRINT_GCODE: &'static str = "/printGcode";
    const URL_GCODE_THUMB: &'static str = "/gcodeThumb";

    pub fn new(id: PrinterId, printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            inner: Arc::new(GatewayInner {
                id,
                printer_cfg,
                client,
                gate: HttpGate::default(),
                capabilities: parking_lot::RwLock::new(None),
                firmware_version: parking_lot::RwLock::new(None),
                machine_name: parking_lot::RwLock::new(None),
            }),
        })
    }

    pub fn gate(&self) -> &HttpGate {
        &self.inner.gate
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        *self.inner.capabilities.read()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.inner.firmware_version.read().clone()
    }

    /// Seeds the firmware version, e.g. from the line protocol's device info.
    pub fn set_firmware_version(&self, version: &str) {
        *self.inner.firmware_version.write() = Some(version.to_string());
    }

    pub fn is_pro(&self) -> bool {
        self.inner
            .machine_name
            .read()
            .as_deref()
            .map(|n| n.contains("Pro"))
            .unwrap_or(false)
    }

    pub fn upload_shape(&self) -> UploadShape {
        UploadShape::for_firmware(self.inner.firmware_version.read().as_deref())
    }
}

/// requests
impl HttpGateway {
    async fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.printer_cfg.read().await.http_base(), path)
    }

    /// `serialNumber` and `checkCode`, owned so no config lock is held across a request.
    async fn credentials(&self) -> (String, String) {
        let cfg = self.inner.printer_cfg.read().await;
        (cfg.serial.clone(), cfg.check_code.clone())
    }

    /// Posts a JSON body. Callers decide whether the gate is held.
    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Vec<u8>) -> Result<T> {
        let url = self.url(path).await;
        trace!("POST {} {}", url, String::from_utf8_lossy(&body));

        let text = self
            .inner
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(REQUEST_TIMEOUT)
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        trace!("{} replied {}", path, text);
        Ok(serde_json::from_str(&text)?)
    }

    async fn credentials_body(&self) -> Result<Vec<u8>> {
        let (serial, check_code) = self.credentials().await;
        Ok(serde_json::to_vec(&Credentials {
            serial_number: &serial,
            check_code: &check_code,
        })?)
    }

    fn check(command: &str, code: i32, message: &str) -> Result<()> {
        if is_success(code, message) {
            Ok(())
        } else {
            warn!("{} failed: code {}, {:?}", command, code, message);
            Err(Error::Rejected {
                command: command.to_string(),
                reply: format!("code {}: {}", code, message),
            })
        }
    }
}

/// product, detail
impl HttpGateway {
    /// Learns which optional controls are fitted. Must run before LED or filtration commands.
    pub async fn send_product_command(&self) -> Result<Capabilities> {
        let body = self.credentials_body().await?;
        let resp: ProductResponse = {
            let _gate = self.inner.gate.acquire().await;
            self.post_json(Self::URL_PRODUCT, body).await?
        };

        if resp.code != 0 {
            return Err(Error::Rejected {
                command: Self::URL_PRODUCT.to_string(),
                reply: format!("code {}: {}", resp.code, resp.message),
            });
        }
        let product = resp
            .product
            .ok_or_else(|| Error::decode("product", "missing `product` object"))?;

        let caps = Capabilities::from(&product);
        debug!(
            "{}: led control {}, filtration control {}",
            self.inner.id, caps.led_control, caps.filtration_control
        );
        *self.inner.capabilities.write() = Some(caps);
        Ok(caps)
    }

    /// Fresh device status. Not gated, so a status read never waits behind an upload.
    pub async fn get_detail_response(&self) -> Result<DetailResponse> {
        let body = self.credentials_body().await?;
        let resp: DetailResponse = self.post_json(Self::URL_DETAIL, body).await?;

        if let Some(detail) = &resp.detail {
            if !detail.firmware_version.is_empty() {
                *self.inner.firmware_version.write() = Some(detail.firmware_version.clone());
            }
            if !detail.name.is_empty() {
                *self.inner.machine_name.write() = Some(detail.name.clone());
            }
        }
        Ok(resp)
    }

    pub async fn get_detail(&self) -> Result<Detail> {
        self.get_detail_response()
            .await?
            .detail
            .ok_or_else(|| Error::decode("detail", "missing `detail` object"))
    }

    pub async fn get_machine_info(&self) -> Result<MachineInfo> {
        Ok(MachineInfo::from_detail(&self.get_detail().await?))
    }

    pub async fn is_printing(&self) -> Result<bool> {
        Ok(self.get_machine_info().await?.is_printing())
    }

    pub async fn verify_connection(&self) -> Result<bool> {
        let resp = self.get_detail_response().await?;
        Ok(is_success(resp.code, &resp.message))
    }
}

/// control commands
impl HttpGateway {
    /// Sends one `/control` command through the gate.
    pub async fn send_control_command(&self, args: ControlArgs) -> Result<()> {
        let (serial, check_code) = self.credentials().await;
        let creds = Credentials {
            serial_number: &serial,
            check_code: &check_code,
        };
        let body = serde_json::to_vec(&ControlEnvelope::new(creds, &args))?;
        debug!("control command: {}", String::from_utf8_lossy(&body));

        let resp: GenericResponse = {
            let _gate = self.inner.gate.acquire().await;
            self.post_json(Self::URL_CONTROL, body).await?
        };
        Self::check(args.cmd(), resp.code, &resp.message)
    }

    /// Speed, fan and z-offset overrides for the running job.
    ///
    /// Refused when no job is printing: the firmware stops answering until
    /// power-cycled if this arrives while idle. Fans are forced off below layer 2.
    pub async fn send_printer_control_command(&self, mut args: PrinterControlArgs) -> Result<()> {
        let info = self.get_machine_info().await?;

        if !info.is_printing() {
            warn!(
                "refusing {} on {}: no active job (status {:?})",
                ControlArgs::CMD_PRINTER,
                self.inner.id,
                info.status
            );
            return Err(Error::Precondition(format!(
                "{} needs an active job, printer is {:?}",
                ControlArgs::CMD_PRINTER,
                info.status
            )));
        }

        if info.current_print_layer < LOW_LAYER_THRESHOLD {
            debug!(
                "layer {} < {}, forcing fans off",
                info.current_print_layer, LOW_LAYER_THRESHOLD
            );
            args.chamber_fan = 0;
            args.cooling_fan = 0;
        }

        self.send_control_command(ControlArgs::PrinterControl(args))
            .await
    }

    pub async fn set_speed_override(&self, speed: i32) -> Result<()> {
        self.send_printer_control_command(PrinterControlArgs {
            speed,
            ..Default::default()
        })
        .await
    }

    pub async fn set_z_axis_override(&self, offset: f64) -> Result<()> {
        self.send_printer_control_command(PrinterControlArgs {
            z_axis_compensation: offset,
            ..Default::default()
        })
        .await
    }

    pub async fn set_chamber_fan_speed(&self, speed: i32) -> Result<()> {
        self.send_printer_control_command(PrinterControlArgs {
            chamber_fan: speed,
            ..Default::default()
        })
        .await
    }

    pub async fn set_cooling_fan_speed(&self, speed: i32) -> Result<()> {
        self.send_printer_control_command(PrinterControlArgs {
            cooling_fan: speed,
            ..Default::default()
        })
        .await
    }

    fn require(&self, what: &'static str, equipped: fn(&Capabilities) -> bool) -> Result<()> {
        match self.capabilities() {
            None => Err(Error::CapabilitiesUnknown),
            Some(caps) if equipped(&caps) => Ok(()),
            Some(_) => Err(Error::NotEquipped(what)),
        }
    }

    pub async fn set_led(&self, on: bool) -> Result<()> {
        self.require("LED control", |c| c.led_control)?;
        self.send_control_command(ControlArgs::Light { status: on.into() })
            .await
    }

    pub async fn set_filtration(&self, internal: bool, external: bool) -> Result<()> {
        self.require("filtration", |c| c.filtration_control)?;
        self.send_control_command(ControlArgs::Circulation {
            internal: internal.into(),
            external: external.into(),
        })
        .await
    }

    pub async fn set_internal_filtration_on(&self) -> Result<()> {
        self.set_filtration(true, false).await
    }

    pub async fn set_external_filtration_on(&self) -> Result<()> {
        self.set_filtration(false, true).await
    }

    pub async fn set_filtration_off(&self) -> Result<()> {
        self.set_filtration(false, false).await
    }

    /// Only the Pro models ship with a camera.
    pub async fn set_camera(&self, on: bool) -> Result<()> {
        if !self.is_pro() {
            return Err(Error::NotEquipped("camera"));
        }
        self.send_control_command(ControlArgs::Camera { action: on.into() })
            .await
    }

    pub async fn pause_print(&self) -> Result<()> {
        self.send_control_command(ControlArgs::job(JobAction::Pause))
            .await
    }

    pub async fn resume_print(&self) -> Result<()> {
        self.send_control_command(ControlArgs::job(JobAction::Continue))
            .await
    }

    pub async fn cancel_print(&self) -> Result<()> {
        self.send_control_command(ControlArgs::job(JobAction::Cancel))
            .await
    }

    pub async fn clear_platform(&self) -> Result<()> {
        self.send_control_command(ControlArgs::clear_platform())
            .await
    }
}

/// files
impl HttpGateway {
    /// Streams a file to the printer as `multipart/form-data`.
    ///
    /// Holds the gate for the whole transfer, so other commands wait.
    pub async fn upload_file<P: AsRef<Path>>(
        &self,
        path: P,
        start_print: bool,
        level_before_print: bool,
    ) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no file name in {}", path.display()),
                ))
            })?
            .to_string();

        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();

        let shape = self.upload_shape();
        let boundary = shape.boundary();
        let preamble = format!(
            "--{}\r\nContent-Type: application/octet-stream\r\nContent-Disposition: form-data; name=\"gcodeFile\"; filename=\"{}\"\r\n\r\n",
            boundary, file_name
        );
        let epilogue = format!("\r\n--{}--\r\n", boundary);
        let content_length = preamble.len() as u64 + file_size + epilogue.len() as u64;

        let body = futures::stream::once(async move { Ok::<_, io::Error>(Bytes::from(preamble)) })
            .chain(file_chunks(file))
            .chain(futures::stream::once(async move {
                Ok(Bytes::from(epilogue))
            }));

        let (serial, check_code) = self.credentials().await;
        let url = self.url(Self::URL_UPLOAD).await;

        let mut req = self
            .inner
            .client
            .post(&url)
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
            .header(CONTENT_LENGTH, content_length)
            .header("serialNumber", serial)
            .header("checkCode", check_code)
            .header("fileSize", file_size.to_string())
            .header("printNow", start_print.to_string())
            .header("levelingBeforePrint", level_before_print.to_string());
        for (name, value) in shape.extra_headers() {
            req = req.header(*name, *value);
        }

        info!(
            "uploading {} ({} bytes, {:?}) to {}",
            file_name, file_size, shape, self.inner.id
        );

        let resp: GenericResponse = {
            let _gate = self.inner.gate.acquire().await;
            let text = req
                .body(reqwest::Body::wrap_stream(body))
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            debug!("upload reply: {}", text);
            serde_json::from_str(&text)?
        };
        Self::check(Self::URL_UPLOAD, resp.code, &resp.message)
    }

    pub async fn print_local_file(&self, file_name: &str, leveling_before_print: bool) -> Result<()> {
        let (serial, check_code) = self.credentials().await;
        let body = serde_json::to_vec(&PrintLocalRequest {
            credentials: Credentials {
                serial_number: &serial,
                check_code: &check_code,
            },
            file_name,
            leveling_before_print,
            material_station: self.upload_shape().material_station_args(),
        })?;

        let resp: GenericResponse = {
            let _gate = self.inner.gate.acquire().await;
            self.post_json(Self::URL_PRINT_GCODE, body).await?
        };
        Self::check(Self::URL_PRINT_GCODE, resp.code, &resp.message)
    }

    /// The most recently printed files, newest first.
    pub async fn get_recent_file_list(&self) -> Result<Vec<String>> {
        let body = self.credentials_body().await?;
        let resp: GCodeListResponse = {
            let _gate = self.inner.gate.acquire().await;
            self.post_json(Self::URL_GCODE_LIST, body).await?
        };
        Self::check(Self::URL_GCODE_LIST, resp.code, &resp.message)?;
        Ok(resp.gcode_list)
    }

    /// Decoded thumbnail image bytes for a stored file.
    pub async fn get_gcode_thumbnail(&self, file_name: &str) -> Result<Vec<u8>> {
        let (serial, check_code) = self.credentials().await;
        let body = serde_json::to_vec(&FileRequest {
            credentials: Credentials {
                serial_number: &serial,
                check_code: &check_code,
            },
            file_name,
        })?;

        let resp: ThumbnailResponse = {
            let _gate = self.inner.gate.acquire().await;
            self.post_json(Self::URL_GCODE_THUMB, body).await?
        };
        if resp.code != 0 {
            return Err(Error::Rejected {
                command: Self::URL_GCODE_THUMB.to_string(),
                reply: format!("code {}: {}", resp.code, resp.message),
            });
        }
        Ok(base64::engine::general_purpose::STANDARD.decode(resp.image_data.trim())?)
    }
}

fn file_chunks(
    file: tokio::fs::File,
) -> impl futures::Stream<Item = std::result::Result<Bytes, io::Error>> + Send + 'static {
    futures::stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}
