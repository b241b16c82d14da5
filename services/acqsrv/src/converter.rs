//! Unit Converter
//!
//! Pure mapping from a [`FieldMap`] to engineering-unit quantities, with
//! optional alarm band evaluation. No I/O and no state: the same input always
//! yields the same [`Measurement`].
//!
//! Two conversion styles exist:
//!
//! - **direct**: `value = raw × scale + offset` (pressure, flow, distance, weight)
//! - **calibrated**: a two-stage normalize-then-scale used for arc current and
//!   voltage; see [`calibrate`].
//!
//! A source that is missing or undecodable, or a result that is not finite,
//! makes the quantity [`QuantityValue::Unavailable`]. It is never reported as
//! zero.

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::parser::FieldMap;

fn one() -> f64 {
    1.0
}

// ============================================================================
// Conversion specs (deserialized from the schema document)
// ============================================================================

/// How one quantity is derived from one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitySpec {
    pub name: String,
    /// Field or composite name in the same block
    pub source: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub conversion: ConversionStyle,
    #[serde(default)]
    pub alarm: Option<AlarmSpec>,
    /// Persist only when the value differs from the last persisted one
    #[serde(default)]
    pub on_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum ConversionStyle {
    Direct {
        #[serde(default = "one")]
        scale: f64,
        #[serde(default)]
        offset: f64,
    },
    Calibrated(CalibrationSpec),
}

impl Default for ConversionStyle {
    fn default() -> Self {
        Self::Direct {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

/// Parameters of the two-stage calibration
///
/// Bounds are exclusive. `calibration_max: None` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpec {
    #[serde(default = "one")]
    pub normalize_scale: f64,
    pub valid_min: f64,
    pub valid_max: f64,
    pub calibration_min: f64,
    #[serde(default)]
    pub calibration_max: Option<f64>,
    pub target: f64,
    #[serde(default)]
    pub offset: f64,
}

impl CalibrationSpec {
    /// Arc current preset (amperes)
    pub fn arc_current() -> Self {
        Self {
            normalize_scale: 1.0,
            valid_min: 5380.0,
            valid_max: 6576.0,
            calibration_min: 1000.0,
            calibration_max: None,
            target: 5978.0,
            offset: 0.0,
        }
    }

    /// Arc voltage preset (volts)
    pub fn arc_voltage() -> Self {
        Self {
            normalize_scale: 1.0,
            valid_min: 70.0,
            valid_max: 90.0,
            calibration_min: 10.0,
            calibration_max: Some(100.0),
            target: 80.0,
            offset: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.valid_min < self.valid_max) {
            return Err("calibration needs valid_min < valid_max".to_string());
        }
        if matches!(self.calibration_max, Some(max) if max <= self.calibration_min) {
            return Err("calibration needs calibration_min < calibration_max".to_string());
        }
        if !(self.target > 0.0) {
            return Err("calibration target must be positive".to_string());
        }
        if !self.normalize_scale.is_finite() || self.normalize_scale == 0.0 {
            return Err("normalize_scale must be finite and non-zero".to_string());
        }
        Ok(())
    }
}

/// Alarm configuration: setpoint and deadband percentage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSpec {
    pub setpoint: Threshold,
    pub deadband_percent: Threshold,
}

/// Constant, or a value the controller publishes in the same block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Fixed(f64),
    Field {
        field: String,
        #[serde(default = "one")]
        scale: f64,
    },
}

impl Threshold {
    fn resolve(&self, fields: &FieldMap) -> Option<f64> {
        match self {
            Self::Fixed(v) => Some(*v),
            Self::Field { field, scale } => fields
                .get(field)
                .and_then(|v| v.as_f64())
                .map(|v| v * scale)
                .filter(|v| v.is_finite()),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum QuantityValue {
    Available(f64),
    Unavailable(ConversionError),
}

impl QuantityValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Available(v) => Some(*v),
            Self::Unavailable(_) => None,
        }
    }
}

/// Inclusive normal range `[S×(1−D/100), S×(1+D/100)]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmBand {
    pub low: f64,
    pub high: f64,
}

impl AlarmBand {
    /// `None` when either setpoint or deadband is zero (alarm disabled)
    pub fn new(setpoint: f64, deadband_percent: f64) -> Option<Self> {
        if setpoint == 0.0 || deadband_percent == 0.0 {
            return None;
        }
        if !setpoint.is_finite() || !deadband_percent.is_finite() {
            return None;
        }
        let a = setpoint * (1.0 - deadband_percent / 100.0);
        let b = setpoint * (1.0 + deadband_percent / 100.0);
        Some(Self {
            low: a.min(b),
            high: a.max(b),
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }

    pub fn is_alarm(&self, value: f64) -> bool {
        !self.contains(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmState {
    pub band: AlarmBand,
    pub in_alarm: bool,
}

/// Intermediate values of a calibrated conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub stage1: f64,
    /// 1.0 when no correction was applied
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub name: String,
    pub unit: String,
    pub value: QuantityValue,
    pub alarm: Option<AlarmState>,
    pub calibration: Option<CalibrationOutcome>,
    pub on_change: bool,
}

impl Quantity {
    pub fn in_alarm(&self) -> bool {
        self.alarm.is_some_and(|a| a.in_alarm)
    }
}

/// Ordered quantities converted from one block read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub quantities: Vec<Quantity>,
}

impl Measurement {
    pub fn get(&self, name: &str) -> Option<&Quantity> {
        self.quantities.iter().find(|q| q.name == name)
    }

    /// `(name, value)` of every available quantity
    pub fn available(&self) -> impl Iterator<Item = (&str, f64)> {
        self.quantities
            .iter()
            .filter_map(|q| q.value.value().map(|v| (q.name.as_str(), v)))
    }

    pub fn unavailable(&self) -> impl Iterator<Item = &Quantity> {
        self.quantities
            .iter()
            .filter(|q| matches!(q.value, QuantityValue::Unavailable(_)))
    }

    pub fn alarms(&self) -> impl Iterator<Item = &Quantity> {
        self.quantities.iter().filter(|q| q.in_alarm())
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.is_empty()
    }
}

// ============================================================================
// Conversion
// ============================================================================

/// Two-stage calibration
///
/// `stage1 = raw × normalize_scale`, then:
/// - `raw ≤ 0` gives 0
/// - `valid_min < stage1 < valid_max` keeps stage1
/// - `calibration_min < stage1 < calibration_max` and `stage1 < target`
///   multiplies by `max(1, floor(target / stage1))`
/// - anything else keeps stage1
///
/// The configured offset is added last.
pub fn calibrate(raw: f64, spec: &CalibrationSpec) -> (f64, CalibrationOutcome) {
    let stage1 = raw * spec.normalize_scale;
    let mut multiplier = 1.0;

    let value = if raw <= 0.0 {
        0.0
    } else if spec.valid_min < stage1 && stage1 < spec.valid_max {
        stage1
    } else if spec.calibration_min < stage1
        && spec.calibration_max.map_or(true, |max| stage1 < max)
        && stage1 < spec.target
    {
        multiplier = (spec.target / stage1).floor().max(1.0);
        stage1 * multiplier
    } else {
        stage1
    };

    (value + spec.offset, CalibrationOutcome { stage1, multiplier })
}

fn convert_one(fields: &FieldMap, spec: &QuantitySpec) -> Quantity {
    let mut calibration = None;

    let value = match fields.get(&spec.source) {
        None => QuantityValue::Unavailable(ConversionError::MissingField(spec.source.clone())),
        Some(raw) => match raw.as_f64() {
            None => QuantityValue::Unavailable(ConversionError::InvalidField(spec.source.clone())),
            Some(raw) => {
                let converted = match &spec.conversion {
                    ConversionStyle::Direct { scale, offset } => raw * scale + offset,
                    ConversionStyle::Calibrated(cal) => {
                        let (value, outcome) = calibrate(raw, cal);
                        calibration = Some(outcome);
                        value
                    }
                };
                if converted.is_finite() {
                    QuantityValue::Available(converted)
                } else {
                    QuantityValue::Unavailable(ConversionError::NonFinite)
                }
            }
        },
    };

    let alarm = match (&spec.alarm, value.value()) {
        (Some(alarm), Some(v)) => {
            let band = alarm.setpoint.resolve(fields).and_then(|setpoint| {
                alarm
                    .deadband_percent
                    .resolve(fields)
                    .and_then(|deadband| AlarmBand::new(setpoint, deadband))
            });
            band.map(|band| AlarmState {
                band,
                in_alarm: band.is_alarm(v),
            })
        }
        _ => None,
    };

    Quantity {
        name: spec.name.clone(),
        unit: spec.unit.clone(),
        value,
        alarm,
        calibration,
        on_change: spec.on_change,
    }
}

/// Convert every quantity of a block, in spec order
pub fn convert(fields: &FieldMap, specs: &[QuantitySpec]) -> Measurement {
    Measurement {
        quantities: specs.iter().map(|spec| convert_one(fields, spec)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawValue;

    fn direct(name: &str, source: &str, scale: f64) -> QuantitySpec {
        QuantitySpec {
            name: name.to_string(),
            source: source.to_string(),
            unit: String::new(),
            conversion: ConversionStyle::Direct { scale, offset: 0.0 },
            alarm: None,
            on_change: false,
        }
    }

    #[test]
    fn test_alarm_band_bounds_are_inclusive() {
        let band = AlarmBand::new(5978.0, 15.0).unwrap();
        assert!((band.low - 5081.3).abs() < 1e-9);
        assert!((band.high - 6874.7).abs() < 1e-9);
        assert!(!band.is_alarm(band.low));
        assert!(!band.is_alarm(band.high));
        assert!(band.is_alarm(5081.2));
        assert!(band.is_alarm(6874.8));
    }

    #[test]
    fn test_zero_setpoint_or_deadband_disables_alarm() {
        assert!(AlarmBand::new(0.0, 15.0).is_none());
        assert!(AlarmBand::new(5978.0, 0.0).is_none());
    }

    #[test]
    fn test_direct_scale_and_offset() {
        let mut fields = FieldMap::default();
        fields.insert("p", RawValue::Int(12_345));
        let mut spec = direct("pressure", "p", 0.01);
        spec.conversion = ConversionStyle::Direct {
            scale: 0.01,
            offset: -1.0,
        };
        let m = convert(&fields, &[spec]);
        let v = m.get("pressure").unwrap().value.value().unwrap();
        assert!((v - 122.45).abs() < 1e-9);
    }

    #[test]
    fn test_unavailable_is_not_zero() {
        let mut fields = FieldMap::default();
        fields.insert("bad", RawValue::Invalid);
        let m = convert(
            &fields,
            &[direct("a", "bad", 1.0), direct("b", "missing", 1.0)],
        );
        assert_eq!(
            m.get("a").unwrap().value,
            QuantityValue::Unavailable(ConversionError::InvalidField("bad".into()))
        );
        assert_eq!(
            m.get("b").unwrap().value,
            QuantityValue::Unavailable(ConversionError::MissingField("missing".into()))
        );
        assert_eq!(m.available().count(), 0);
        assert_eq!(m.unavailable().count(), 2);
    }

    #[test]
    fn test_non_finite_result_is_unavailable() {
        let mut fields = FieldMap::default();
        fields.insert("x", RawValue::Float(1.0e300));
        let m = convert(&fields, &[direct("q", "x", 1.0e300)]);
        assert_eq!(
            m.get("q").unwrap().value,
            QuantityValue::Unavailable(ConversionError::NonFinite)
        );
    }

    #[test]
    fn test_calibration_keeps_values_in_valid_range() {
        let spec = CalibrationSpec::arc_current();
        let (value, outcome) = calibrate(5500.0, &spec);
        assert_eq!(value, 5500.0);
        assert_eq!(outcome.multiplier, 1.0);
    }

    #[test]
    fn test_calibration_scales_low_values_toward_target() {
        let spec = CalibrationSpec::arc_current();
        // floor(5978 / 2000) = 2
        let (value, outcome) = calibrate(2000.0, &spec);
        assert_eq!(value, 4000.0);
        assert_eq!(outcome.multiplier, 2.0);

        // Below the calibration window: untouched
        assert_eq!(calibrate(900.0, &spec).0, 900.0);
        // Above target and outside the valid window: untouched
        assert_eq!(calibrate(7000.0, &spec).0, 7000.0);
        assert_eq!(calibrate(0.0, &spec).0, 0.0);
        assert_eq!(calibrate(-3.0, &spec).0, 0.0);
    }

    #[test]
    fn test_voltage_preset_respects_upper_calibration_bound() {
        let spec = CalibrationSpec::arc_voltage();
        assert_eq!(calibrate(75.0, &spec).0, 75.0);
        assert_eq!(calibrate(30.0, &spec).0, 60.0);
        assert_eq!(calibrate(95.0, &spec).0, 95.0);
        assert_eq!(calibrate(5.0, &spec).0, 5.0);
    }

    #[test]
    fn test_alarm_thresholds_from_fields() {
        let mut fields = FieldMap::default();
        fields.insert("current", RawValue::Int(5081));
        fields.insert("setpoint", RawValue::Int(5978));
        fields.insert("deadzone", RawValue::Int(15));
        let mut spec = direct("arc_current", "current", 1.0);
        spec.alarm = Some(AlarmSpec {
            setpoint: Threshold::Field {
                field: "setpoint".into(),
                scale: 1.0,
            },
            deadband_percent: Threshold::Field {
                field: "deadzone".into(),
                scale: 1.0,
            },
        });

        let m = convert(&fields, &[spec.clone()]);
        assert!(m.get("arc_current").unwrap().in_alarm());
        assert_eq!(m.alarms().count(), 1);

        fields.insert("deadzone", RawValue::Int(0));
        let m = convert(&fields, &[spec]);
        assert!(m.get("arc_current").unwrap().alarm.is_none());
    }

    #[test]
    fn test_spec_deserializes_both_styles() {
        let yaml = r#"
- name: pressure
  source: p.raw
  unit: kPa
  conversion: { style: direct, scale: 0.001 }
- name: arc_current_u
  source: u.current
  unit: A
  conversion:
    style: calibrated
    valid_min: 5380
    valid_max: 6576
    calibration_min: 1000
    target: 5978
  alarm: { setpoint: 5978, deadband_percent: { field: deadzone } }
  on_change: true
"#;
        let specs: Vec<QuantitySpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            specs[0].conversion,
            ConversionStyle::Direct {
                scale: 0.001,
                offset: 0.0
            }
        );
        assert_eq!(
            specs[1].conversion,
            ConversionStyle::Calibrated(CalibrationSpec::arc_current())
        );
        let alarm = specs[1].alarm.as_ref().unwrap();
        assert_eq!(alarm.setpoint, Threshold::Fixed(5978.0));
        assert!(specs[1].on_change);
    }
}
