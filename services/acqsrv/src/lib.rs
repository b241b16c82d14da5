//! Acquisition Service (acqsrv)
//!
//! Polls a PLC over an S7 ISO-on-TCP session and a weighing instrument over
//! RS-485, converts raw register bytes into engineering units, and writes the
//! results to a time-series store in batches.
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │ Connection   │──►│  Parser  │──►│ Converter │──►│  BatchSink   │──► InfluxDB
//! │ Manager (S7) │   │ (schema) │   │ (alarms)  │   │ (fast/normal)│
//! └──────────────┘   └──────────┘   └─────┬─────┘   └──────────────┘
//!        ▲                                │
//!        │           Scheduler            ▼
//!  fast / normal loops ────────────► StatusCache
//! ```
//!
//! With the batch gate enabled ([`batch`]), points are written only while a
//! smelting batch is active, and each carries the batch code as a tag.
//!
//! Blocks are described by a YAML schema document and resolved once at
//! startup into a [`schema::SchemaRegistry`]; everything after that works on
//! flat field tables.

pub mod batch;
pub mod cache;
pub mod config;
pub mod connection;
pub mod converter;
pub mod error;
pub mod parser;
pub mod scheduler;
pub mod schema;
pub mod sink;
pub mod source;
pub mod transport;
pub mod weighing;

pub use batch::BatchTracker;
pub use cache::{StatusCache, StatusSnapshot};
pub use config::AcqConfig;
pub use error::{AcqError, Result};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use schema::SchemaRegistry;
pub use sink::BatchSink;
pub use source::DataSource;

pub const SERVICE_NAME: &str = "acqsrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
