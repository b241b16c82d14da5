//! Transport clients
//!
//! Two leaves with no knowledge of the rest of the service:
//!
//! ```text
//! ┌────────────────────────────┐   ┌────────────────────────────┐
//! │  FieldbusSession (trait)   │   │        SerialClient        │
//! │  connect / read_area /     │   │  open / write /            │
//! │  write_area / disconnect   │   │  read_with_timeout / close │
//! └─────────────┬──────────────┘   └─────────────┬──────────────┘
//!               ▼                                ▼
//!       S7Client (ISO-on-TCP)            tokio-serial (RS-485)
//! ```
//!
//! The Connection Manager owns a boxed [`FieldbusSession`], so tests can
//! swap in a scripted session without touching the network.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub mod mock;
pub mod s7;
pub mod serial;

pub use s7::{S7Client, S7Settings};
pub use serial::{Parity, SerialClient, SerialSettings};

/// Controller memory area addressed by a read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    /// Data block by number
    DataBlock(u16),
    /// Process output image (Q area)
    Outputs,
}

impl Area {
    /// Block number on the wire (0 for non-DB areas)
    pub fn db_number(&self) -> u16 {
        match self {
            Self::DataBlock(n) => *n,
            Self::Outputs => 0,
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataBlock(n) => write!(f, "DB{n}"),
            Self::Outputs => f.write_str("Q"),
        }
    }
}

/// Persistent fieldbus session to one controller
///
/// Implementations are not required to be safe for concurrent use; the
/// Connection Manager serializes every call.
#[async_trait]
pub trait FieldbusSession: Send + Sync + fmt::Debug {
    /// Human-readable endpoint for logs and errors
    fn endpoint(&self) -> String;

    /// Open the session (transport + protocol handshake)
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read `length` bytes starting at byte `offset`
    async fn read_area(
        &mut self,
        area: Area,
        offset: u32,
        length: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write `data` starting at byte `offset`
    async fn write_area(&mut self, area: Area, offset: u32, data: &[u8])
        -> Result<(), TransportError>;

    /// Close the session; never fails
    async fn disconnect(&mut self);

    /// Whether the underlying transport is currently open
    fn is_connected(&self) -> bool;
}
