//! Value normalization
//!
//! Turns controller values into quality-tagged `f64` samples. Scaling is done
//! in the precision of the source type before promotion: 32-bit and narrower
//! sources are scaled as `f32`, 64-bit sources as `f64`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::controller::RawValue;
use crate::registry::TagRegistry;

/// Largest integer magnitude an `f64` still represents exactly
pub const MAX_EXACT_INT: i64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    /// Storage encoding: 0 = good, 1 = bad
    pub fn code(self) -> i64 {
        match self {
            Quality::Good => 0,
            Quality::Bad => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            Quality::Good
        } else {
            Quality::Bad
        }
    }
}

/// One normalized reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    /// Fully-qualified `controller/tag` name
    pub tag: String,
    pub value: f64,
    pub quality: Quality,
}

/// All samples of one poll cycle, sharing a single capture timestamp
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub timestamp_ns: i64,
    pub samples: Vec<Sample>,
}

impl PollBatch {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns)
    }

    pub fn good_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.quality == Quality::Good)
            .count()
    }

    pub fn bad_count(&self) -> usize {
        self.samples.len() - self.good_count()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert one raw value, applying `scale`. Never fails.
pub fn normalize_value(raw: &RawValue, scale: f64) -> (f64, Quality) {
    let scaled = scale != 1.0;
    let value = match *raw {
        RawValue::F32(v) => scale_f32(v, scale, scaled),
        RawValue::F64(v) => v * scale,
        RawValue::I16(v) => scale_f32(v as f32, scale, scaled),
        RawValue::U16(v) => scale_f32(v as f32, scale, scaled),
        RawValue::I32(v) if scaled => (v as f32 * scale as f32) as f64,
        RawValue::I32(v) => v as f64,
        RawValue::U32(v) if scaled => (v as f32 * scale as f32) as f64,
        RawValue::U32(v) => v as f64,
        RawValue::I64(v) => {
            if v.unsigned_abs() > MAX_EXACT_INT as u64 {
                return (0.0, Quality::Bad);
            }
            v as f64 * scale
        }
        // discrete state, never scaled
        RawValue::Bool(v) => {
            if v {
                1.0
            } else {
                0.0
            }
        }
        RawValue::Unsupported(_) => return (0.0, Quality::Bad),
    };

    if value.is_finite() {
        (value, Quality::Good)
    } else {
        (0.0, Quality::Bad)
    }
}

fn scale_f32(v: f32, scale: f64, scaled: bool) -> f64 {
    if scaled {
        (v * scale as f32) as f64
    } else {
        v as f64
    }
}

/// Normalizes a whole poll result against the registry's scale factors
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<TagRegistry>,
}

impl Normalizer {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }

    pub fn normalize(&self, tag: &str, raw: &RawValue, timestamp_ns: i64) -> Sample {
        let scale = match self.registry.tag(tag) {
            Some(spec) => spec.scale_factor,
            None => {
                debug!("No registry entry for {}, leaving unscaled", tag);
                1.0
            }
        };

        let (value, quality) = normalize_value(raw, scale);
        if quality == Quality::Bad {
            warn!(tag = %tag, raw = ?raw, "Value could not be normalized, recording bad sample");
        }

        Sample {
            timestamp_ns,
            tag: tag.to_string(),
            value,
            quality,
        }
    }

    /// One sample per raw value, all stamped with the batch timestamp
    pub fn normalize_batch(
        &self,
        values: &HashMap<String, RawValue>,
        timestamp_ns: i64,
    ) -> PollBatch {
        let mut samples: Vec<Sample> = values
            .iter()
            .map(|(tag, raw)| self.normalize(tag, raw, timestamp_ns))
            .collect();
        samples.sort_by(|a, b| a.tag.cmp(&b.tag));

        PollBatch {
            timestamp_ns,
            samples,
        }
    }
}
