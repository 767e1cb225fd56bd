pub mod conn_flashforge;

pub use conn_flashforge::FlashForgeDevice;
