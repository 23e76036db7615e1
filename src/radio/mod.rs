//! Radio adapters driving the UART core

pub mod bluez;

pub use bluez::BluerRadio;
