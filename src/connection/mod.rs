//! Bridge-side ownership of the UART connection
//!
//! This module handles:
//! - Feeding BlueZ events into the connection manager in order
//! - Readiness timeouts for peripherals without device information
//! - Moving bytes between the local endpoint and the peripheral

mod manager;

pub use manager::{ChannelHandler, ConnectionEvent, UartLink};
