//! Data sources
//!
//! The scheduler pulls raw bytes from a [`DataSource`], chosen once at
//! startup:
//!
//! - [`LiveSource`]: the PLC through the Connection Manager plus the
//!   weighing instrument on the serial link
//! - [`SyntheticSource`]: schema-shaped random data for environments
//!   without hardware
//!
//! Both produce byte buffers of exactly the declared block size, so parsing
//! and everything downstream cannot tell them apart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::converter::{ConversionStyle, Threshold};
use crate::error::{ConnectionError, WeighError};
use crate::schema::{BlockSchema, FieldDescriptor, FieldKind};
use crate::transport::Area;
use crate::weighing::WeighingReader;

/// Bytes of one block read, owned by a single poll iteration
#[derive(Debug, Clone)]
pub struct RawSample {
    pub block_id: String,
    pub read_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

// ============================================================================
// Live
// ============================================================================

/// PLC and weighing instrument
#[derive(Debug)]
pub struct LiveSource {
    manager: Arc<ConnectionManager>,
    weigher: Option<tokio::sync::Mutex<WeighingReader>>,
}

impl LiveSource {
    pub fn new(manager: Arc<ConnectionManager>, weigher: Option<WeighingReader>) -> Self {
        Self {
            manager,
            weigher: weigher.map(tokio::sync::Mutex::new),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    async fn read_block(&self, schema: &BlockSchema) -> Result<RawSample, ConnectionError> {
        let bytes = match schema.area {
            Area::DataBlock(db) => self.manager.read_block(db, 0, schema.size).await?,
            Area::Outputs => self.manager.read_outputs(0, schema.size).await?,
        };
        Ok(RawSample {
            block_id: schema.id.clone(),
            read_at: Utc::now(),
            bytes,
        })
    }
}

// ============================================================================
// Synthetic
// ============================================================================

/// Field values the generator should hold near, keyed by field name
#[derive(Debug, Default)]
struct Hints {
    around: HashMap<String, f64>,
}

impl Hints {
    /// Keep calibrated sources inside their valid window and alarm thresholds sane
    fn for_block(schema: &BlockSchema) -> Self {
        let mut around = HashMap::new();
        for spec in &schema.conversions {
            if let ConversionStyle::Calibrated(cal) = &spec.conversion {
                around.insert(spec.source.clone(), cal.target / cal.normalize_scale);
                if let Some(alarm) = &spec.alarm {
                    if let Threshold::Field { field, scale } = &alarm.setpoint {
                        around.insert(field.clone(), cal.target / scale);
                    }
                }
            }
            if let Some(alarm) = &spec.alarm {
                if let Threshold::Field { field, scale } = &alarm.deadband_percent {
                    around.insert(field.clone(), 15.0 / scale);
                }
            }
        }
        Self { around }
    }
}

/// Deterministic (seeded) generator of schema-shaped bytes
#[derive(Debug)]
pub struct SyntheticSource {
    rng: Mutex<StdRng>,
    weight: Mutex<f64>,
}

impl SyntheticSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            weight: Mutex::new(1200.0),
        }
    }

    /// A buffer of exactly `schema.size` bytes
    pub fn generate(&self, schema: &BlockSchema) -> Vec<u8> {
        let hints = Hints::for_block(schema);
        let mut rng = self.rng.lock();
        let mut bytes = vec![0u8; schema.size];

        for field in &schema.fields {
            let value = match hints.around.get(&field.name) {
                Some(center) => center * rng.gen_range(0.95..1.05),
                None => random_value(&mut *rng, field.kind),
            };
            encode_value(&mut bytes, field, value);
        }

        // Composite sources: spread the hinted value over its two words
        for composite in &schema.composites {
            let Some(center) = hints.around.get(&composite.name) else {
                continue;
            };
            let value = (center * rng.gen_range(0.95..1.05)).max(0.0) as u32;
            if let (Some(high), Some(low)) = (schema.field(&composite.high), schema.field(&composite.low)) {
                encode_value(&mut bytes, high, f64::from(value >> 16));
                encode_value(&mut bytes, low, f64::from(value & 0xFFFF));
            }
        }
        bytes
    }

    /// Random walk in kilograms, never negative
    pub fn next_weight(&self) -> u32 {
        let step = self.rng.lock().gen_range(-25.0..25.0);
        let mut weight = self.weight.lock();
        *weight = (*weight + step).clamp(0.0, 5000.0);
        *weight as u32
    }
}

fn random_value(rng: &mut impl Rng, kind: FieldKind) -> f64 {
    match kind {
        FieldKind::Bit => f64::from(u8::from(rng.gen_bool(0.5))),
        FieldKind::Unsigned8 => f64::from(rng.gen_range(0u8..=100)),
        FieldKind::Signed16 => f64::from(rng.gen_range(-1000i16..=1000)),
        FieldKind::Unsigned16 => f64::from(rng.gen_range(0u16..=1000)),
        FieldKind::Signed32 | FieldKind::Unsigned32 => f64::from(rng.gen_range(0u32..=100_000)),
        FieldKind::Float32 => rng.gen_range(0.0..100.0),
    }
}

fn encode_value(bytes: &mut [u8], field: &FieldDescriptor, value: f64) {
    let Some(slot) = bytes.get_mut(field.offset..field.end()) else {
        return;
    };
    match field.kind {
        FieldKind::Bit => {
            let mask = 1u8 << field.bit;
            if value != 0.0 {
                slot[0] |= mask;
            } else {
                slot[0] &= !mask;
            }
        }
        FieldKind::Unsigned8 => slot[0] = value as u8,
        FieldKind::Signed16 => slot.copy_from_slice(&(value as i16).to_be_bytes()),
        FieldKind::Unsigned16 => slot.copy_from_slice(&(value as u16).to_be_bytes()),
        FieldKind::Signed32 => slot.copy_from_slice(&(value as i32).to_be_bytes()),
        FieldKind::Unsigned32 => slot.copy_from_slice(&(value as u32).to_be_bytes()),
        FieldKind::Float32 => slot.copy_from_slice(&(value as f32).to_be_bytes()),
    }
}

// ============================================================================
// Source selection
// ============================================================================

/// Where raw bytes come from, fixed for the life of the process
#[derive(Debug)]
pub enum DataSource {
    Live(LiveSource),
    Synthetic(SyntheticSource),
}

impl DataSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Live(_) => "live",
            Self::Synthetic(_) => "synthetic",
        }
    }

    /// Make sure the device session is usable (no-op for synthetic data)
    pub async fn prepare(&self) -> Result<(), ConnectionError> {
        match self {
            Self::Live(live) => live.manager.ensure_connected().await,
            Self::Synthetic(_) => Ok(()),
        }
    }

    pub async fn read_block(&self, schema: &BlockSchema) -> Result<RawSample, ConnectionError> {
        match self {
            Self::Live(live) => live.read_block(schema).await,
            Self::Synthetic(synthetic) => Ok(RawSample {
                block_id: schema.id.clone(),
                read_at: Utc::now(),
                bytes: synthetic.generate(schema),
            }),
        }
    }

    /// Whether a weighing instrument is attached
    pub fn has_weighing(&self) -> bool {
        match self {
            Self::Live(live) => live.weigher.is_some(),
            Self::Synthetic(_) => true,
        }
    }

    /// Raw combined register value from the instrument
    pub async fn read_weight(&self) -> Result<u32, WeighError> {
        match self {
            Self::Live(live) => match &live.weigher {
                Some(weigher) => weigher.lock().await.read().await,
                None => Err(WeighError::NoResponse {
                    timeout: std::time::Duration::ZERO,
                }),
            },
            Self::Synthetic(synthetic) => Ok(synthetic.next_weight()),
        }
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self {
            Self::Live(live) => Some(live.manager.status()),
            Self::Synthetic(_) => None,
        }
    }

    /// Release the session and the serial port
    pub async fn shutdown(&self) {
        if let Self::Live(live) = self {
            if let Some(weigher) = &live.weigher {
                weigher.lock().await.close();
            }
            live.manager.disconnect().await;
        }
        info!("{} source shut down", self.kind());
    }
}

impl From<LiveSource> for DataSource {
    fn from(source: LiveSource) -> Self {
        debug!("Using live source ({})", source.manager.endpoint());
        Self::Live(source)
    }
}

impl From<SyntheticSource> for DataSource {
    fn from(source: SyntheticSource) -> Self {
        Self::Synthetic(source)
    }
}
