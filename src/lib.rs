pub mod config;
pub mod conn_manager;
pub mod error;
pub mod logging;
pub mod status;

pub use conn_manager::conn_flashforge::{
    gcode_controller::GCodeController, http_gateway::HttpGateway, tcp_session::TcpSession,
    FlashForgeDevice,
};
pub use error::{Error, Result};
