#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use flashforge_client::config::{printer_config::PrinterConfigFlashForge, printer_id::PrinterId};

/// Config pointing at local fixtures, with timings short enough for tests.
pub fn test_config(tcp_port: u16, http_port: u16) -> PrinterConfigFlashForge {
    let mut cfg = PrinterConfigFlashForge::from_id(
        "fixture".to_string(),
        "127.0.0.1".to_string(),
        "SN-TEST".to_string(),
        "check-123".to_string(),
        PrinterId::from_id("fixture"),
    );
    cfg.tcp_port = tcp_port;
    cfg.http_port = http_port;

    cfg.session.connect_timeout = Duration::from_secs(1);
    cfg.session.read_timeout = Duration::from_millis(800);
    cfg.session.idle_grace = Duration::from_millis(150);
    cfg.session.login_retry_step = Duration::from_millis(10);
    cfg.session.keep_alive_floor = Duration::from_secs(30);
    cfg.session.keep_alive_step = Duration::from_millis(50);

    cfg.sequencer.temp_wait_timeout = Duration::from_millis(400);
    cfg.sequencer.temp_poll_interval = Duration::from_millis(20);
    cfg.sequencer.cool_down_delay = Duration::from_millis(10);
    cfg
}

/// MARK: TCP

pub enum Reply {
    Text(String),
    /// Says nothing, the client hits its deadline.
    Silence,
    /// Drops the connection without replying.
    Hangup,
}

/// Standard acknowledgement: `CMD <code> Received.` then `ok`.
pub fn ack(line: &str) -> String {
    let code = line
        .trim_start_matches('~')
        .split_whitespace()
        .next()
        .unwrap_or_default();
    format!("CMD {} Received.\r\nok\r\n", code)
}

pub fn login_ok() -> String {
    "CMD M601 Received.\r\nControl Success.\r\nok\r\n".to_string()
}

pub fn login_refused() -> String {
    "CMD M601 Received.\r\nControl failed.\r\nok\r\n".to_string()
}

/// Heaters idle: current values with a `0.0` target, as the device reports them.
pub fn temp_reply(extruder: i32, bed: i32) -> String {
    format!(
        "CMD M105 Received.\r\nT0:{}.0/0.0 T1:0.0/0.0 B:{}.0/0.0\r\nok\r\n",
        extruder, bed
    )
}

pub fn device_info_reply(type_name: &str) -> String {
    format!(
        "CMD M115 Received.\r\n\
         Machine Type: {}\r\n\
         Machine Name: Bench\r\n\
         Firmware: v2.7.5\r\n\
         SN: SN-TEST\r\n\
         X: 220 Y: 220 Z: 220\r\n\
         Tool Count: 1\r\n\
         Mac Address:88:A9:A7:90:9E:2B\r\n\
         ok\r\n",
        type_name
    )
}

/// Replies like a healthy printer that accepts everything.
pub fn default_reply(line: &str) -> Reply {
    match line {
        "~M601 S1" => Reply::Text(login_ok()),
        "~M105" => Reply::Text(temp_reply(25, 22)),
        "~M115" => Reply::Text(device_info_reply("Flashforge Adventurer 5M")),
        "~M27" => Reply::Text(
            "CMD M27 Received.\r\nSD printing byte 0/100\r\nLayer: 0/0\r\nok\r\n".to_string(),
        ),
        _ => Reply::Text(ack(line)),
    }
}

type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Scripted line-protocol printer.
pub struct TcpFixture {
    pub addr: SocketAddr,
    lines: Arc<Mutex<Vec<String>>>,
    raw: Arc<Mutex<Vec<u8>>>,
    connections: Arc<AtomicUsize>,
}

impl TcpFixture {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder: Responder = Arc::new(responder);

        let lines = Arc::new(Mutex::new(vec![]));
        let raw = Arc::new(Mutex::new(vec![]));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let lines = lines.clone();
            let raw = raw.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_tcp(
                        stream,
                        responder.clone(),
                        lines.clone(),
                        raw.clone(),
                    ));
                }
            });
        }

        Self {
            addr,
            lines,
            raw,
            connections,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.lines.lock().iter().filter(|l| *l == line).count()
    }

    /// Every byte the client wrote, across all connections, in arrival order.
    pub fn raw(&self) -> Vec<u8> {
        self.raw.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_tcp(
    stream: TcpStream,
    responder: Responder,
    lines: Arc<Mutex<Vec<String>>>,
    raw: Arc<Mutex<Vec<u8>>>,
) {
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match read.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        raw.lock().extend_from_slice(&buf);

        let line = String::from_utf8_lossy(&buf).trim().to_string();
        lines.lock().push(line.clone());

        match responder(&line) {
            Reply::Text(text) => {
                if write.write_all(text.as_bytes()).await.is_err() {
                    return;
                }
            }
            Reply::Silence => {}
            Reply::Hangup => return,
        }
    }
}

/// MARK: HTTP

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
    /// Lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

type HttpResponder = Arc<dyn Fn(&HttpRequest) -> (u16, String) + Send + Sync>;

/// Minimal HTTP/1.1 device: records requests and answers from a closure.
pub struct HttpFixture {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl HttpFixture {
    pub async fn start<F>(delay: Duration, responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder: HttpResponder = Arc::new(responder);

        let requests = Arc::new(Mutex::new(vec![]));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        {
            let requests = requests.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_http(
                        stream,
                        delay,
                        responder.clone(),
                        requests.clone(),
                        in_flight.clone(),
                        max_in_flight.clone(),
                    ));
                }
            });
        }

        Self {
            addr,
            requests,
            in_flight,
            max_in_flight,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }

    pub fn last(&self, path: &str) -> Option<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.path == path)
            .cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn serve_http(
    stream: TcpStream,
    delay: Duration,
    responder: HttpResponder,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
) {
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);

    loop {
        let Some(req) = read_request(&mut read).await else {
            return;
        };

        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);

        requests.lock().push(req.clone());
        tokio::time::sleep(delay).await;
        let (status, body) = responder(&req);

        in_flight.fetch_sub(1, Ordering::SeqCst);

        let head = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            status,
            body.len()
        );
        if write.write_all(head.as_bytes()).await.is_err()
            || write.write_all(body.as_bytes()).await.is_err()
        {
            return;
        }
    }
}

async fn read_request<R>(read: &mut R) -> Option<HttpRequest>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if read.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let path = line.split_whitespace().nth(1)?.to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        read.read_line(&mut line).await.ok()?;
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        if let Some((k, v)) = l.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let mut body = Vec::new();
    if headers
        .get("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        loop {
            line.clear();
            read.read_line(&mut line).await.ok()?;
            let size = usize::from_str_radix(line.trim().split(';').next()?, 16).ok()?;
            let mut chunk = vec![0u8; size + 2];
            read.read_exact(&mut chunk).await.ok()?;
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = headers.get("content-length") {
        let len: usize = len.parse().ok()?;
        body.resize(len, 0);
        read.read_exact(&mut body).await.ok()?;
    }

    Some(HttpRequest {
        path,
        headers,
        body,
    })
}

pub fn success() -> String {
    r#"{"code":0,"message":"Success"}"#.to_string()
}

pub fn detail_reply(status: &str, layer: i64) -> String {
    serde_json::json!({
        "code": 0,
        "message": "Success",
        "detail": {
            "name": "Adventurer 5M Pro",
            "firmwareVersion": "2.7.5",
            "status": status,
            "printLayer": layer,
            "targetPrintLayer": 200,
        }
    })
    .to_string()
}

pub fn product_reply(light: i32, internal_fan: i32, external_fan: i32) -> String {
    serde_json::json!({
        "code": 0,
        "message": "Success",
        "product": {
            "lightCtrlState": light,
            "internalFanCtrlState": internal_fan,
            "externalFanCtrlState": external_fan,
            "chamberTempCtrlState": 0,
            "nozzleTempCtrlState": 1,
            "platformTempCtrlState": 1,
        }
    })
    .to_string()
}
