//! Layered vehicle diagnostic stack: TTY transport, L1 link framing, L2
//! session protocols (ISO 9141-2, D2, KWP1281) and L7 application services.

pub mod config;
pub mod error;
pub mod l0;
pub mod l1;
pub mod l2;
pub mod l7;
pub mod message;
pub mod os;
pub mod tty;

pub use error::{Error, Result};
pub use message::Message;
