//! Loopback control interface
//!
//! Each TCP connection carries one newline-terminated JSON command and
//! gets one `\r\n`-terminated JSON response back.

mod server;

pub use server::{ControlServer, RESPONSE_TERMINATOR};
