//! Schema Registry
//!
//! Loads the memory-block layout document once at startup and resolves it
//! into a flat, validated, immutable table of [`BlockSchema`]s.
//!
//! A document has two sections:
//!
//! ```yaml
//! modules:                    # reusable field shapes
//!   PressureSensor:
//!     fields:
//!       - { name: high, offset: 0, kind: unsigned16 }
//!       - { name: low,  offset: 2, kind: unsigned16 }
//!     composites:
//!       - { name: raw, high: high, low: low }
//! blocks:                     # concrete regions on the controller
//!   - id: sensors
//!     db: 32
//!     size: 29
//!     rate: normal
//!     instances:
//!       - { name: pressure_1, module: PressureSensor, offset: 0 }
//!     conversions:
//!       - { name: pressure_1, source: pressure_1.raw, unit: kPa,
//!           conversion: { style: direct, scale: 0.01 } }
//! ```
//!
//! Every inconsistency is reported as a [`SchemaError`] at load time; once a
//! registry exists, parsing and conversion never look anything up by a name
//! that does not resolve.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::converter::{ConversionStyle, QuantitySpec, Threshold};
use crate::error::SchemaError;
use crate::transport::Area;

// ============================================================================
// Field kinds and offsets
// ============================================================================

/// Numeric interpretation of a field (all multi-byte kinds are big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Unsigned8,
    Signed16,
    Unsigned16,
    Signed32,
    Unsigned32,
    Float32,
    Bit,
}

impl FieldKind {
    /// Width in bytes on the wire
    pub fn width(self) -> usize {
        match self {
            Self::Unsigned8 | Self::Bit => 1,
            Self::Signed16 | Self::Unsigned16 => 2,
            Self::Signed32 | Self::Unsigned32 | Self::Float32 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsigned8 => "unsigned8",
            Self::Signed16 => "signed16",
            Self::Unsigned16 => "unsigned16",
            Self::Signed32 => "signed32",
            Self::Unsigned32 => "unsigned32",
            Self::Float32 => "float32",
            Self::Bit => "bit",
        }
    }

    fn is_word(self) -> bool {
        matches!(self, Self::Signed16 | Self::Unsigned16)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte offset with an optional bit index
///
/// Accepts `12`, `12.3` or `"12.3"` (byte 12, bit 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "OffsetRepr")]
pub struct FieldOffset {
    pub byte: usize,
    pub bit: Option<u8>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OffsetRepr {
    Int(u64),
    Float(f64),
    Text(String),
}

impl FieldOffset {
    pub fn byte(byte: usize) -> Self {
        Self { byte, bit: None }
    }
}

impl std::str::FromStr for FieldOffset {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidOffset(s.to_string());
        let (byte, bit) = match s.trim().split_once('.') {
            Some((byte, bit)) => (byte, Some(bit)),
            None => (s.trim(), None),
        };
        let byte = byte.parse::<usize>().map_err(|_| invalid())?;
        let bit = bit
            .map(|b| b.parse::<u8>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self { byte, bit })
    }
}

impl TryFrom<OffsetRepr> for FieldOffset {
    type Error = SchemaError;

    fn try_from(repr: OffsetRepr) -> Result<Self, Self::Error> {
        match repr {
            OffsetRepr::Int(byte) => Ok(Self::byte(byte as usize)),
            OffsetRepr::Float(value) => {
                if !value.is_finite() || value < 0.0 {
                    return Err(SchemaError::InvalidOffset(value.to_string()));
                }
                let byte = value.trunc();
                let bit = ((value - byte) * 10.0).round() as u8;
                Ok(Self {
                    byte: byte as usize,
                    bit: Some(bit),
                })
            }
            OffsetRepr::Text(text) => text.parse(),
        }
    }
}

// ============================================================================
// Document (as written)
// ============================================================================

/// Schema document as deserialized from YAML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDef>,
    #[serde(default)]
    pub blocks: Vec<BlockDef>,
}

/// Reusable field group
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleDef {
    #[serde(default)]
    pub description: Option<String>,
    /// Footprint in bytes; defaults to the end of the last field
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub composites: Vec<CompositeDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub offset: FieldOffset,
    pub kind: FieldKind,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub bit: Option<u8>,
}

/// High/low word pair combined as `high × 65536 + low`
#[derive(Debug, Clone, Deserialize)]
pub struct CompositeDef {
    pub name: String,
    pub high: String,
    pub low: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    Read,
    /// Controller-owned command range, never decoded
    Write,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDef {
    pub name: String,
    pub module: String,
    pub offset: usize,
    #[serde(default)]
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaKind {
    DataBlock,
    Outputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockDef {
    pub id: String,
    #[serde(default)]
    pub db: Option<u16>,
    #[serde(default)]
    pub area: Option<AreaKind>,
    pub size: usize,
    #[serde(default)]
    pub class: BlockClass,
    #[serde(default)]
    pub rate: RateClass,
    /// Time-series measurement name; defaults to the block id
    #[serde(default)]
    pub measurement: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Ad-hoc fields, named without an instance prefix
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub composites: Vec<CompositeDef>,
    #[serde(default)]
    pub instances: Vec<InstanceDef>,
    #[serde(default)]
    pub conversions: Vec<QuantitySpec>,
}

// ============================================================================
// Resolved schema
// ============================================================================

/// Where the decoded result of a block goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockClass {
    /// Persisted through the batch sink (and cached)
    #[default]
    Measurement,
    /// Cached only
    Status,
}

/// Polling rate class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateClass {
    Fast,
    #[default]
    Normal,
}

impl RateClass {
    pub const ALL: [RateClass; 2] = [RateClass::Fast, RateClass::Normal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for RateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decodable field with its fully qualified name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub offset: usize,
    pub width: usize,
    pub kind: FieldKind,
    /// Bit index, only meaningful for [`FieldKind::Bit`]
    pub bit: u8,
}

impl FieldDescriptor {
    pub fn end(&self) -> usize {
        self.offset + self.width
    }

    fn overlaps(&self, other: &FieldDescriptor) -> bool {
        if self.kind == FieldKind::Bit && other.kind == FieldKind::Bit {
            return self.offset == other.offset && self.bit == other.bit;
        }
        self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composite {
    pub name: String,
    pub high: String,
    pub low: String,
}

/// Byte range skipped by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedRange {
    pub instance: String,
    pub start: usize,
    pub end: usize,
}

impl ExcludedRange {
    pub fn contains(&self, field: &FieldDescriptor) -> bool {
        field.offset < self.end && self.start < field.end()
    }
}

/// Immutable, validated layout of one memory block
#[derive(Debug, Clone)]
pub struct BlockSchema {
    pub id: String,
    pub area: Area,
    pub size: usize,
    pub class: BlockClass,
    pub rate: RateClass,
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<FieldDescriptor>,
    pub composites: Vec<Composite>,
    pub excluded: Vec<ExcludedRange>,
    pub conversions: Vec<QuantitySpec>,
}

impl BlockSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether `name` is a field or composite of this block
    pub fn resolves(&self, name: &str) -> bool {
        self.field(name).is_some() || self.composites.iter().any(|c| c.name == name)
    }

    pub fn is_excluded(&self, field: &FieldDescriptor) -> bool {
        self.excluded.iter().any(|range| range.contains(field))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Flat table of resolved blocks, in document order
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    blocks: Vec<Arc<BlockSchema>>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_yaml_str(&content)?;
        info!(
            "Schema loaded from {}: {} blocks",
            path.display(),
            registry.len()
        );
        Ok(registry)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SchemaError> {
        let document: SchemaDocument = serde_yaml::from_str(content)?;
        Self::from_document(document)
    }

    /// Resolve module references and validate every block
    pub fn from_document(document: SchemaDocument) -> Result<Self, SchemaError> {
        let mut blocks = Vec::with_capacity(document.blocks.len());
        let mut index = HashMap::new();

        for def in &document.blocks {
            if index.contains_key(&def.id) {
                return Err(SchemaError::DuplicateBlock(def.id.clone()));
            }
            let block = resolve_block(def, &document.modules)?;
            debug!(
                "Block {} ({}): {} fields, {} composites, {} excluded ranges, {} quantities",
                block.id,
                block.area,
                block.fields.len(),
                block.composites.len(),
                block.excluded.len(),
                block.conversions.len()
            );
            index.insert(block.id.clone(), blocks.len());
            blocks.push(Arc::new(block));
        }

        Ok(Self { blocks, index })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BlockSchema>> {
        self.index.get(id).map(|&i| &self.blocks[i])
    }

    pub fn blocks(&self) -> &[Arc<BlockSchema>] {
        &self.blocks
    }

    /// Blocks polled by the loop of the given rate class
    pub fn blocks_for(&self, rate: RateClass) -> Vec<Arc<BlockSchema>> {
        self.blocks
            .iter()
            .filter(|b| b.rate == rate)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

// ============================================================================
// Resolution
// ============================================================================

fn resolve_area(def: &BlockDef) -> Result<Area, SchemaError> {
    match (def.db, def.area) {
        (Some(db), None | Some(AreaKind::DataBlock)) => Ok(Area::DataBlock(db)),
        (None, Some(AreaKind::Outputs)) => Ok(Area::Outputs),
        (None, _) => Err(invalid_block(def, "needs either 'db' or 'area: outputs'")),
        (Some(_), Some(AreaKind::Outputs)) => {
            Err(invalid_block(def, "'db' cannot be combined with 'area: outputs'"))
        }
    }
}

fn invalid_block(def: &BlockDef, reason: &str) -> SchemaError {
    SchemaError::InvalidBlock {
        block: def.id.clone(),
        reason: reason.to_string(),
    }
}

/// Resolve one field definition at a base offset with an optional name prefix
fn resolve_field(
    block: &str,
    prefix: Option<&str>,
    base: usize,
    size: usize,
    def: &FieldDef,
) -> Result<FieldDescriptor, SchemaError> {
    let name = match prefix {
        Some(prefix) => format!("{prefix}.{}", def.name),
        None => def.name.clone(),
    };

    let expected = def.kind.width();
    if let Some(width) = def.width {
        if width != expected {
            return Err(SchemaError::WidthMismatch {
                block: block.to_string(),
                field: name,
                kind: def.kind.to_string(),
                width,
                expected,
            });
        }
    }

    let bit = def.bit.or(def.offset.bit).unwrap_or(0);
    let bit_allowed = def.kind == FieldKind::Bit || bit == 0;
    if bit > 7 || !bit_allowed {
        return Err(SchemaError::InvalidBit {
            block: block.to_string(),
            field: name,
            bit,
        });
    }

    let offset = match base.checked_add(def.offset.byte) {
        Some(offset) if offset.checked_add(expected).is_some_and(|end| end <= size) => offset,
        _ => {
            return Err(SchemaError::OutOfBounds {
                block: block.to_string(),
                field: name,
                offset: base.saturating_add(def.offset.byte),
                width: expected,
                size,
            })
        }
    };

    Ok(FieldDescriptor {
        name,
        offset,
        width: expected,
        kind: def.kind,
        bit,
    })
}

fn resolve_composite(prefix: Option<&str>, def: &CompositeDef) -> Composite {
    let qualify = |name: &str| match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    };
    Composite {
        name: qualify(&def.name),
        high: qualify(&def.high),
        low: qualify(&def.low),
    }
}

fn module_footprint(module: &ModuleDef) -> usize {
    module.size.unwrap_or_else(|| {
        module
            .fields
            .iter()
            .map(|f| f.offset.byte.saturating_add(f.kind.width()))
            .max()
            .unwrap_or(0)
    })
}

fn check_no_overlap(
    block: &str,
    group: &str,
    fields: &[FieldDescriptor],
) -> Result<(), SchemaError> {
    for (i, first) in fields.iter().enumerate() {
        if let Some(second) = fields[i + 1..].iter().find(|f| first.overlaps(f)) {
            return Err(SchemaError::Overlap {
                block: block.to_string(),
                instance: group.to_string(),
                first: first.name.clone(),
                second: second.name.clone(),
            });
        }
    }
    Ok(())
}

fn resolve_block(
    def: &BlockDef,
    modules: &BTreeMap<String, ModuleDef>,
) -> Result<BlockSchema, SchemaError> {
    let block = def.id.as_str();
    if def.size == 0 {
        return Err(invalid_block(def, "size must be greater than zero"));
    }
    let area = resolve_area(def)?;

    let mut fields = Vec::new();
    let mut composites = Vec::new();
    let mut excluded = Vec::new();

    // Ad-hoc fields form their own overlap group
    let adhoc = def
        .fields
        .iter()
        .map(|f| resolve_field(block, None, 0, def.size, f))
        .collect::<Result<Vec<_>, _>>()?;
    check_no_overlap(block, block, &adhoc)?;
    fields.extend(adhoc);
    composites.extend(def.composites.iter().map(|c| resolve_composite(None, c)));

    for instance in &def.instances {
        let module = modules
            .get(&instance.module)
            .ok_or_else(|| SchemaError::UnknownModule {
                block: block.to_string(),
                instance: instance.name.clone(),
                module: instance.module.clone(),
            })?;

        if instance.access == Access::Write {
            let footprint = module_footprint(module);
            let end = match instance.offset.checked_add(footprint) {
                Some(end) if end <= def.size => end,
                _ => {
                    return Err(SchemaError::OutOfBounds {
                        block: block.to_string(),
                        field: instance.name.clone(),
                        offset: instance.offset,
                        width: footprint,
                        size: def.size,
                    })
                }
            };
            excluded.push(ExcludedRange {
                instance: instance.name.clone(),
                start: instance.offset,
                end,
            });
            continue;
        }

        let resolved = module
            .fields
            .iter()
            .map(|f| resolve_field(block, Some(&instance.name), instance.offset, def.size, f))
            .collect::<Result<Vec<_>, _>>()?;
        check_no_overlap(block, &instance.name, &resolved)?;
        fields.extend(resolved);
        composites.extend(
            module
                .composites
                .iter()
                .map(|c| resolve_composite(Some(&instance.name), c)),
        );
    }

    let mut names = HashSet::new();
    for field in &fields {
        if !names.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                block: block.to_string(),
                field: field.name.clone(),
            });
        }
        if field.end() > def.size {
            return Err(SchemaError::OutOfBounds {
                block: block.to_string(),
                field: field.name.clone(),
                offset: field.offset,
                width: field.width,
                size: def.size,
            });
        }
        if let Some(range) = excluded.iter().find(|r| r.contains(field)) {
            return Err(SchemaError::ExcludedOverlap {
                block: block.to_string(),
                field: field.name.clone(),
                instance: range.instance.clone(),
            });
        }
    }

    for composite in &composites {
        if !names.insert(composite.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                block: block.to_string(),
                field: composite.name.clone(),
            });
        }
        for part in [&composite.high, &composite.low] {
            let word = fields.iter().find(|f| &f.name == part);
            match word {
                Some(f) if f.kind.is_word() => {}
                Some(f) => {
                    return Err(SchemaError::InvalidComposite {
                        block: block.to_string(),
                        composite: composite.name.clone(),
                        reason: format!("word '{part}' is {} (needs a 16-bit kind)", f.kind),
                    })
                }
                None => {
                    return Err(SchemaError::InvalidComposite {
                        block: block.to_string(),
                        composite: composite.name.clone(),
                        reason: format!("references unknown field '{part}'"),
                    })
                }
            }
        }
    }

    let schema = BlockSchema {
        id: def.id.clone(),
        area,
        size: def.size,
        class: def.class,
        rate: def.rate,
        measurement: def.measurement.clone().unwrap_or_else(|| def.id.clone()),
        tags: def.tags.clone(),
        fields,
        composites,
        excluded,
        conversions: def.conversions.clone(),
    };
    validate_conversions(&schema)?;
    Ok(schema)
}

fn validate_conversions(schema: &BlockSchema) -> Result<(), SchemaError> {
    let invalid = |quantity: &str, reason: String| SchemaError::InvalidQuantity {
        block: schema.id.clone(),
        quantity: quantity.to_string(),
        reason,
    };

    let mut seen = HashSet::new();
    for spec in &schema.conversions {
        if !seen.insert(spec.name.as_str()) {
            return Err(invalid(&spec.name, "is declared twice".to_string()));
        }
        if !schema.resolves(&spec.source) {
            return Err(invalid(
                &spec.name,
                format!("has unknown source '{}'", spec.source),
            ));
        }
        if let ConversionStyle::Calibrated(cal) = &spec.conversion {
            cal.validate().map_err(|reason| invalid(&spec.name, reason))?;
        }
        if let Some(alarm) = &spec.alarm {
            for threshold in [&alarm.setpoint, &alarm.deadband_percent] {
                if let Threshold::Field { field, .. } = threshold {
                    if !schema.resolves(field) {
                        return Err(invalid(
                            &spec.name,
                            format!("has unknown alarm field '{field}'"),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
modules:
  PressureSensor:
    fields:
      - { name: high, offset: 0, kind: unsigned16 }
      - { name: low, offset: 2, kind: unsigned16 }
    composites:
      - { name: raw, high: high, low: low }
  ValveBits:
    size: 1
    fields:
      - { name: open, offset: 0.0, kind: bit }
      - { name: closed, offset: "0.1", kind: bit }
  Command:
    size: 4
    fields:
      - { name: word, offset: 0, kind: unsigned32 }
blocks:
  - id: sensors
    db: 32
    size: 16
    tags: { furnace: "1" }
    instances:
      - { name: p1, module: PressureSensor, offset: 0 }
      - { name: p2, module: PressureSensor, offset: 4 }
      - { name: valves, module: ValveBits, offset: 8 }
      - { name: cmd, module: Command, offset: 12, access: write }
    conversions:
      - name: pressure_1
        source: p1.raw
        unit: kPa
        conversion: { style: direct, scale: 0.01 }
  - id: outputs
    area: outputs
    size: 2
    class: status
    rate: fast
    fields:
      - { name: pump, offset: 0.3, kind: bit }
"#;

    #[test]
    fn test_resolves_instances_into_flat_table() {
        let registry = SchemaRegistry::from_yaml_str(DOC).unwrap();
        assert_eq!(registry.len(), 2);

        let sensors = registry.get("sensors").unwrap();
        assert_eq!(sensors.area, Area::DataBlock(32));
        assert_eq!(sensors.measurement, "sensors");
        assert_eq!(sensors.field("p2.low").unwrap().offset, 6);
        assert_eq!(sensors.field("valves.closed").unwrap().bit, 1);
        assert!(sensors.resolves("p2.raw"));
        assert!(sensors.field("cmd.word").is_none());
        assert_eq!(sensors.excluded.len(), 1);
        assert_eq!((sensors.excluded[0].start, sensors.excluded[0].end), (12, 16));

        let outputs = registry.get("outputs").unwrap();
        assert_eq!(outputs.area, Area::Outputs);
        assert_eq!(outputs.field("pump").unwrap().bit, 3);
        assert_eq!(registry.blocks_for(RateClass::Fast).len(), 1);
    }

    #[test]
    fn test_unknown_module_is_rejected() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 4
    instances:
      - { name: x, module: Missing, offset: 0 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownModule { module, .. } if module == "Missing"));
    }

    #[test]
    fn test_field_past_block_end_is_rejected() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 4
    fields:
      - { name: a, offset: 2, kind: float32 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfBounds { offset: 2, width: 4, size: 4, .. }));
    }

    #[test]
    fn test_offsets_near_usize_max_are_out_of_bounds() {
        let doc = r#"
modules:
  Pair:
    fields:
      - { name: a, offset: 18446744073709551614, kind: unsigned16 }
blocks:
  - id: b
    db: 1
    size: 8
    instances:
      - { name: p, module: Pair, offset: 4 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfBounds { field, width: 2, size: 8, .. } if field == "p.a"));

        let doc = r#"
modules:
  Command:
    size: 4
    fields:
      - { name: word, offset: 0, kind: unsigned32 }
blocks:
  - id: b
    db: 1
    size: 8
    instances:
      - { name: cmd, module: Command, offset: 18446744073709551615, access: write }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::OutOfBounds { field, offset: usize::MAX, width: 4, .. } if field == "cmd"
        ));
    }

    #[test]
    fn test_overlapping_fields_are_rejected() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 8
    fields:
      - { name: a, offset: 0, kind: unsigned32 }
      - { name: b, offset: 2, kind: unsigned16 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::Overlap { .. }));
    }

    #[test]
    fn test_bits_share_a_byte_but_not_an_index() {
        let ok = r#"
blocks:
  - id: b
    db: 1
    size: 1
    fields:
      - { name: a, offset: "0.0", kind: bit }
      - { name: b, offset: "0.7", kind: bit }
"#;
        assert!(SchemaRegistry::from_yaml_str(ok).is_ok());

        let clash = ok.replace("\"0.7\"", "\"0.0\"");
        let err = SchemaRegistry::from_yaml_str(&clash).unwrap_err();
        assert!(matches!(err, SchemaError::Overlap { .. }));
    }

    #[test]
    fn test_bad_bit_index_is_rejected() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 1
    fields:
      - { name: a, offset: 0, bit: 8, kind: bit }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidBit { bit: 8, .. }));
    }

    #[test]
    fn test_width_must_match_kind() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 4
    fields:
      - { name: a, offset: 0, kind: unsigned16, width: 4 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::WidthMismatch { expected: 2, width: 4, .. }));
    }

    #[test]
    fn test_field_inside_write_only_range_is_rejected() {
        let doc = r#"
modules:
  Command:
    size: 4
    fields:
      - { name: word, offset: 0, kind: unsigned32 }
blocks:
  - id: b
    db: 1
    size: 8
    fields:
      - { name: status, offset: 2, kind: unsigned16 }
    instances:
      - { name: cmd, module: Command, offset: 0, access: write }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::ExcludedOverlap { instance, .. } if instance == "cmd"));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 4
    fields:
      - { name: a, offset: 0, kind: unsigned16 }
      - { name: a, offset: 2, kind: unsigned16 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));

        let doc = r#"
blocks:
  - { id: b, db: 1, size: 1 }
  - { id: b, db: 2, size: 1 }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateBlock(id) if id == "b"));
    }

    #[test]
    fn test_composite_needs_word_fields() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 6
    fields:
      - { name: hi, offset: 0, kind: unsigned32 }
      - { name: lo, offset: 4, kind: unsigned16 }
    composites:
      - { name: value, high: hi, low: lo }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidComposite { .. }));
    }

    #[test]
    fn test_conversion_source_must_resolve() {
        let doc = r#"
blocks:
  - id: b
    db: 1
    size: 2
    fields:
      - { name: a, offset: 0, kind: unsigned16 }
    conversions:
      - { name: q, source: nope }
"#;
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidQuantity { quantity, .. } if quantity == "q"));
    }

    #[test]
    fn test_block_needs_an_area() {
        let doc = "blocks:\n  - { id: b, size: 2 }\n";
        let err = SchemaRegistry::from_yaml_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidBlock { .. }));
    }

    #[test]
    fn test_offset_forms() {
        assert_eq!("12".parse::<FieldOffset>().unwrap(), FieldOffset::byte(12));
        assert_eq!(
            "12.3".parse::<FieldOffset>().unwrap(),
            FieldOffset {
                byte: 12,
                bit: Some(3)
            }
        );
        assert!("x.1".parse::<FieldOffset>().is_err());
        let from_float = FieldOffset::try_from(OffsetRepr::Float(12.3)).unwrap();
        assert_eq!(from_float.bit, Some(3));
    }
}
