mod common;

use std::{sync::Arc, time::Duration};

use base64::Engine;
use tokio::sync::RwLock;

use flashforge_client::{
    config::printer_config::PrinterConfigFlashForge,
    conn_manager::conn_flashforge::{
        http_gateway::HttpGateway,
        http_types::{Capabilities, UploadShape},
    },
    error::Error,
    FlashForgeDevice,
};

use common::*;

fn gateway_for(cfg: PrinterConfigFlashForge) -> HttpGateway {
    HttpGateway::new(cfg.id.clone(), Arc::new(RwLock::new(cfg))).unwrap()
}

async fn device_with_detail(status: &'static str, layer: i64) -> HttpFixture {
    HttpFixture::start(Duration::ZERO, move |req| match req.path.as_str() {
        "/detail" => (200, detail_reply(status, layer)),
        _ => (200, success()),
    })
    .await
}

/// MARK: printer control

#[tokio::test]
async fn printer_control_refused_while_idle() {
    let device = device_with_detail("ready", 0).await;
    let http = gateway_for(test_config(0, device.port()));

    let err = http.set_speed_override(120).await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(device.paths(), vec!["/detail"]);
    assert_eq!(http.gate().acquisitions(), 0);
}

#[tokio::test]
async fn fans_forced_off_on_the_first_layers() {
    let device = device_with_detail("printing", 1).await;
    let http = gateway_for(test_config(0, device.port()));

    http.set_speed_override(80).await.unwrap();
    assert_eq!(device.paths(), vec!["/detail", "/control"]);

    let req = device.last("/control").unwrap();
    let body = req.json();
    assert_eq!(body["serialNumber"], "SN-TEST");
    assert_eq!(body["checkCode"], "check-123");
    assert_eq!(body["payload"]["cmd"], "printerCtl_cmd");

    let args = &body["payload"]["args"];
    assert_eq!(args["speed"], 80);
    assert_eq!(args["chamberFan"], 0);
    assert_eq!(args["coolingFan"], 0);
    assert_eq!(args["coolingLeftFan"], 0);
    assert!(req.body_text().contains(r#""zAxisCompensation":0E0"#));
    assert_eq!(http.gate().acquisitions(), 1);
}

#[tokio::test]
async fn later_layers_keep_fan_defaults() {
    let device = device_with_detail("printing", 5).await;
    let http = gateway_for(test_config(0, device.port()));

    http.set_z_axis_override(0.05).await.unwrap();

    let req = device.last("/control").unwrap();
    assert!(req.body_text().contains(r#""zAxisCompensation":5.0E-002"#));
    let args = &req.json()["payload"]["args"];
    assert_eq!(args["speed"], 100);
    assert_eq!(args["chamberFan"], 100);
    assert_eq!(args["coolingFan"], 100);
}

/// MARK: reply mapping

#[tokio::test]
async fn success_message_is_case_insensitive() {
    let device = HttpFixture::start(Duration::ZERO, |_| {
        (200, r#"{"code":0,"message":"success"}"#.to_string())
    })
    .await;
    let http = gateway_for(test_config(0, device.port()));

    http.pause_print().await.unwrap();
    let body = device.last("/control").unwrap().json();
    assert_eq!(body["payload"]["cmd"], "jobCtl_cmd");
    assert_eq!(body["payload"]["args"]["action"], "pause");
    assert_eq!(body["payload"]["args"]["jobID"], "");
}

#[tokio::test]
async fn failed_reply_is_rejected() {
    let device = HttpFixture::start(Duration::ZERO, |_| {
        (200, r#"{"code":1,"message":"Failed"}"#.to_string())
    })
    .await;
    let http = gateway_for(test_config(0, device.port()));

    let err = http.cancel_print().await.unwrap_err();
    assert!(matches!(err, Error::Rejected { ref command, .. } if command == "jobCtl_cmd"));
}

#[tokio::test]
async fn server_error_is_an_http_error() {
    let device = HttpFixture::start(Duration::ZERO, |_| (500, "{}".to_string())).await;
    let http = gateway_for(test_config(0, device.port()));

    let err = http.resume_print().await.unwrap_err();
    assert!(matches!(err, Error::Http(_)));
}

/// MARK: capabilities

#[tokio::test]
async fn optional_controls_need_the_product_query() {
    let fitted = Arc::new(parking_lot::Mutex::new((0, 1, 0)));
    let device = {
        let fitted = fitted.clone();
        HttpFixture::start(Duration::ZERO, move |req| match req.path.as_str() {
            "/product" => {
                let (l, i, e) = *fitted.lock();
                (200, product_reply(l, i, e))
            }
            _ => (200, success()),
        })
        .await
    };
    let http = gateway_for(test_config(0, device.port()));

    assert!(matches!(
        http.set_led(true).await.unwrap_err(),
        Error::CapabilitiesUnknown
    ));
    assert!(matches!(
        http.set_filtration_off().await.unwrap_err(),
        Error::CapabilitiesUnknown
    ));
    assert!(device.paths().is_empty());

    let caps = http.send_product_command().await.unwrap();
    assert_eq!(
        caps,
        Capabilities {
            led_control: false,
            filtration_control: false,
        }
    );
    assert!(matches!(
        http.set_led(true).await.unwrap_err(),
        Error::NotEquipped(_)
    ));
    assert!(matches!(
        http.set_internal_filtration_on().await.unwrap_err(),
        Error::NotEquipped(_)
    ));
    assert_eq!(device.paths(), vec!["/product"]);

    *fitted.lock() = (1, 1, 1);
    http.send_product_command().await.unwrap();

    http.set_led(true).await.unwrap();
    let body = device.last("/control").unwrap().json();
    assert_eq!(body["payload"]["cmd"], "lightControl_cmd");
    assert_eq!(body["payload"]["args"]["status"], "open");

    http.set_external_filtration_on().await.unwrap();
    let body = device.last("/control").unwrap().json();
    assert_eq!(body["payload"]["cmd"], "circulateCtl_cmd");
    assert_eq!(body["payload"]["args"]["internal"], "close");
    assert_eq!(body["payload"]["args"]["external"], "open");
}

#[tokio::test]
async fn camera_needs_a_pro_model() {
    let device = device_with_detail("ready", 0).await;
    let http = gateway_for(test_config(0, device.port()));

    assert!(matches!(
        http.set_camera(true).await.unwrap_err(),
        Error::NotEquipped("camera")
    ));

    let detail = http.get_detail().await.unwrap();
    assert_eq!(detail.name, "Adventurer 5M Pro");
    assert!(http.is_pro());

    http.set_camera(false).await.unwrap();
    let body = device.last("/control").unwrap().json();
    assert_eq!(body["payload"]["cmd"], "streamCtrl_cmd");
    assert_eq!(body["payload"]["args"]["action"], "close");
}

/// MARK: gate

#[tokio::test]
async fn gated_requests_never_overlap() {
    let device = HttpFixture::start(Duration::from_millis(40), |_| (200, success())).await;
    let http = gateway_for(test_config(0, device.port()));

    let mut tasks = vec![];
    for i in 0..4 {
        let http = http.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                http.pause_print().await
            } else {
                http.clear_platform().await
            }
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    assert_eq!(device.requests().len(), 4);
    assert_eq!(device.max_in_flight(), 1);
    assert_eq!(http.gate().acquisitions(), 4);
}

#[tokio::test]
async fn status_reads_bypass_the_gate() {
    let device = device_with_detail("printing", 12).await;
    let http = gateway_for(test_config(0, device.port()));

    let info = http.get_machine_info().await.unwrap();
    assert!(info.is_printing());
    assert!(http.is_printing().await.unwrap());
    assert!(http.verify_connection().await.unwrap());
    assert_eq!(http.gate().acquisitions(), 0);
    assert_eq!(http.firmware_version().as_deref(), Some("2.7.5"));
}

#[tokio::test]
async fn verify_connection_uses_the_success_mapping() {
    let device = HttpFixture::start(Duration::ZERO, |_| {
        (200, r#"{"code":0,"message":"success"}"#.to_string())
    })
    .await;
    let http = gateway_for(test_config(0, device.port()));
    assert!(http.verify_connection().await.unwrap());

    let device = HttpFixture::start(Duration::ZERO, |_| {
        (200, r#"{"code":2,"message":"Success"}"#.to_string())
    })
    .await;
    let http = gateway_for(test_config(0, device.port()));
    assert!(!http.verify_connection().await.unwrap());
}

/// MARK: files

async fn upload_fixture() -> HttpFixture {
    HttpFixture::start(Duration::ZERO, |_| (200, success())).await
}

fn gcode_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("bench.gcode");
    let mut contents = String::new();
    for i in 0..20_000 {
        contents.push_str(&format!("G1 X{} Y{}\n", i % 220, i % 200));
    }
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn legacy_upload_streams_multipart() {
    let device = upload_fixture().await;
    let http = gateway_for(test_config(0, device.port()));
    http.set_firmware_version("2.7.5");
    assert_eq!(http.upload_shape(), UploadShape::Legacy);

    let dir = tempfile::tempdir().unwrap();
    let path = gcode_file(&dir);
    let file_bytes = std::fs::read(&path).unwrap();

    http.upload_file(&path, true, false).await.unwrap();

    let req = device.last("/uploadGcode").unwrap();
    let boundary = UploadShape::Legacy.boundary();
    assert_eq!(
        req.header("content-type"),
        Some(format!("multipart/form-data; boundary={}", boundary).as_str())
    );
    assert_eq!(req.header("serialNumber"), Some("SN-TEST"));
    assert_eq!(req.header("checkCode"), Some("check-123"));
    assert_eq!(req.header("fileSize"), Some(file_bytes.len().to_string().as_str()));
    assert_eq!(req.header("printNow"), Some("true"));
    assert_eq!(req.header("levelingBeforePrint"), Some("false"));
    assert_eq!(req.header("useMatlStation"), None);
    assert_eq!(req.header("materialMappings"), None);

    let preamble = format!(
        "--{}\r\nContent-Type: application/octet-stream\r\nContent-Disposition: form-data; name=\"gcodeFile\"; filename=\"bench.gcode\"\r\n\r\n",
        boundary
    );
    let epilogue = format!("\r\n--{}--\r\n", boundary);
    let mut expected = preamble.into_bytes();
    expected.extend_from_slice(&file_bytes);
    expected.extend_from_slice(epilogue.as_bytes());
    assert_eq!(req.body, expected);
    assert_eq!(http.gate().acquisitions(), 1);
}

#[tokio::test]
async fn new_firmware_upload_adds_material_station_headers() {
    let device = upload_fixture().await;
    let http = gateway_for(test_config(0, device.port()));
    http.set_firmware_version("3.1.3");
    assert_eq!(http.upload_shape(), UploadShape::MaterialStation);

    let dir = tempfile::tempdir().unwrap();
    let path = gcode_file(&dir);

    http.upload_file(&path, false, true).await.unwrap();

    let req = device.last("/uploadGcode").unwrap();
    let boundary = UploadShape::MaterialStation.boundary();
    assert!(req
        .header("content-type")
        .unwrap()
        .ends_with(&format!("boundary={}", boundary)));
    assert_eq!(req.header("printNow"), Some("false"));
    assert_eq!(req.header("levelingBeforePrint"), Some("true"));
    assert_eq!(req.header("flowCalibration"), Some("false"));
    assert_eq!(req.header("useMatlStation"), Some("false"));
    assert_eq!(req.header("gcodeToolCnt"), Some("0"));
    assert_eq!(req.header("materialMappings"), Some("W10="));

    assert!(req.body.starts_with(format!("--{}\r\n", boundary).as_bytes()));
    assert!(req.body.ends_with(format!("\r\n--{}--\r\n", boundary).as_bytes()));
}

#[tokio::test]
async fn upload_of_a_missing_file_sends_nothing() {
    let device = upload_fixture().await;
    let http = gateway_for(test_config(0, device.port()));
    let dir = tempfile::tempdir().unwrap();

    let err = http
        .upload_file(dir.path().join("nope.gcode"), false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(device.paths().is_empty());
}

#[tokio::test]
async fn print_local_file_shape_follows_firmware() {
    let device = upload_fixture().await;
    let http = gateway_for(test_config(0, device.port()));

    http.print_local_file("benchy.gx", true).await.unwrap();
    let body = device.last("/printGcode").unwrap().json();
    assert_eq!(body["fileName"], "benchy.gx");
    assert_eq!(body["levelingBeforePrint"], true);
    assert!(body.get("useMatlStation").is_none());

    http.set_firmware_version("v3.2.0");
    http.print_local_file("benchy.gx", false).await.unwrap();
    let body = device.last("/printGcode").unwrap().json();
    assert_eq!(body["useMatlStation"], false);
    assert_eq!(body["gcodeToolCnt"], 0);
    assert_eq!(body["materialMappings"], serde_json::json!([]));
}

#[tokio::test]
async fn recent_files_and_thumbnails() {
    let png = vec![0x89u8, b'P', b'N', b'G', 0x0d, 0x0a];
    let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
    let device = HttpFixture::start(Duration::ZERO, move |req| match req.path.as_str() {
        "/gcodeList" => (
            200,
            r#"{"code":0,"message":"Success","gcodeList":["cube.gx","benchy.gx"]}"#.to_string(),
        ),
        "/gcodeThumb" => (
            200,
            serde_json::json!({"code": 0, "message": "Success", "imageData": encoded}).to_string(),
        ),
        _ => (404, "{}".to_string()),
    })
    .await;
    let http = gateway_for(test_config(0, device.port()));

    let files = http.get_recent_file_list().await.unwrap();
    assert_eq!(files, vec!["cube.gx", "benchy.gx"]);

    let image = http.get_gcode_thumbnail("cube.gx").await.unwrap();
    assert_eq!(image, png);
    assert_eq!(device.last("/gcodeThumb").unwrap().json()["fileName"], "cube.gx");
    assert_eq!(http.gate().acquisitions(), 2);
}

/// MARK: device

#[tokio::test]
async fn connect_queries_product_then_logs_in() {
    let printer = TcpFixture::start(default_reply).await;
    let device_http = HttpFixture::start(Duration::ZERO, |req| match req.path.as_str() {
        "/product" => (200, product_reply(1, 1, 1)),
        _ => (200, success()),
    })
    .await;

    let device =
        FlashForgeDevice::from_config(test_config(printer.port(), device_http.port())).unwrap();
    let (caps, info) = device.connect().await.unwrap();

    assert!(caps.led_control && caps.filtration_control);
    assert_eq!(info.firmware_version, "v2.7.5");
    assert_eq!(device.http().firmware_version().as_deref(), Some("2.7.5"));
    assert_eq!(device.http().upload_shape(), UploadShape::Legacy);
    assert!(!device.gcode().is_5m_pro());

    assert_eq!(device_http.paths(), vec!["/product"]);
    assert_eq!(printer.lines(), vec!["~M601 S1", "~M115"]);

    device.shutdown().await;
    assert_eq!(printer.lines().last().map(String::as_str), Some("~M602"));
}
