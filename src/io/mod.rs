// src/io/mod.rs
//
// Device I/O for SimpleCom.
// Serial ports are the only device type; errors are shared across the layer.

mod error;
pub mod serial;

pub use error::SerialError;
