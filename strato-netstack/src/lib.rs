//! Userspace TCP/IP stack for the tunnel
//!
//! Runs a smoltcp interface entirely in-process: the tunnel side exchanges
//! whole IP packets with the stack, while the application side dials TCP
//! connections that are carried inside those packets.

mod conn;
mod device;
mod error;
mod stack;

pub use conn::VirtualTcpStream;
pub use error::{Error, Result};
pub use stack::{StackDevice, VirtualNet};
