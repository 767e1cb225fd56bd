use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::printer_id::PrinterId;

/// Fixed control port of the G-code line protocol.
pub const DEFAULT_TCP_PORT: u16 = 8899;
/// Fixed port of the JSON command server.
pub const DEFAULT_HTTP_PORT: u16 = 8898;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfigFlashForge {
    #[serde(default = "PrinterId::empty")]
    pub id: PrinterId,
    pub name: String,
    pub host: String,
    /// Serial number, first half of the credential pair sent with every HTTP request.
    pub serial: String,
    /// Check code, second half of the credential pair.
    pub check_code: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub session: TcpSessionOptions,
    #[serde(default)]
    pub sequencer: SequencerOptions,
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl PrinterConfigFlashForge {
    pub fn new(name: String, host: String, serial: String, check_code: String) -> Self {
        Self::from_id(name, host, serial, check_code, PrinterId::generate())
    }

    pub fn from_id(
        name: String,
        host: String,
        serial: String,
        check_code: String,
        id: PrinterId,
    ) -> Self {
        Self {
            id,
            name,
            host,
            serial,
            check_code,
            tcp_port: DEFAULT_TCP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            session: TcpSessionOptions::default(),
            sequencer: SequencerOptions::default(),
        }
    }

    /// Builds a config from `FLASHFORGE_*` environment variables, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let host = std::env::var("FLASHFORGE_IP").context("FLASHFORGE_IP not set")?;
        let serial = std::env::var("FLASHFORGE_SERIAL").context("FLASHFORGE_SERIAL not set")?;
        let check_code =
            std::env::var("FLASHFORGE_CHECK_CODE").context("FLASHFORGE_CHECK_CODE not set")?;
        let name = std::env::var("FLASHFORGE_NAME").unwrap_or_else(|_| "flashforge".to_string());

        let out = Self::new(name, host, serial, check_code);
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("missing host");
        }
        ensure!(!self.serial.is_empty(), "missing serial number");
        ensure!(!self.check_code.is_empty(), "missing check code");
        if self.session.login_attempts == 0 {
            return Err(anyhow!("login_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

/// Timing policy of one TCP session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSessionOptions {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Overall deadline for one reply.
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// How long a partial reply may sit without new bytes before it counts as unterminated.
    #[serde(with = "duration_ms")]
    pub idle_grace: Duration,
    pub login_attempts: u32,
    #[serde(with = "duration_ms")]
    pub login_retry_step: Duration,
    #[serde(with = "duration_ms")]
    pub keep_alive_floor: Duration,
    #[serde(with = "duration_ms")]
    pub keep_alive_step: Duration,
}

impl Default for TcpSessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            idle_grace: Duration::from_millis(500),
            login_attempts: 4,
            login_retry_step: Duration::from_millis(500),
            keep_alive_floor: Duration::from_secs(5),
            keep_alive_step: Duration::from_secs(1),
        }
    }
}

/// Poll and guard policy of the composite G-code operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerOptions {
    #[serde(with = "duration_ms")]
    pub temp_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub temp_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub cool_down_delay: Duration,
    /// Nozzle temperature below which extrusion is refused.
    pub min_extrude_temp: i32,
    /// Bed temperature considered safe for part removal.
    pub part_cool_temp: i32,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            temp_wait_timeout: Duration::from_secs(30),
            temp_poll_interval: Duration::from_millis(500),
            cool_down_delay: Duration::from_secs(5),
            min_extrude_temp: 210,
            part_cool_temp: 37,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
