//! Bulk export for downstream analytics
//!
//! Pivots long-format samples into a wide matrix (one row per capture
//! timestamp, one column per tag) and writes it as CSV.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use crate::normalize::Sample;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMatrix {
    /// Column order, as requested
    pub tags: Vec<String>,
    /// Row keys, ascending
    pub timestamps: Vec<i64>,
    /// `rows[i][j]` is tag `j` at `timestamps[i]`, if sampled
    pub rows: Vec<Vec<Option<f64>>>,
}

impl FeatureMatrix {
    /// Repeated tags get a single column at their first position.
    pub fn from_samples(tags: &[String], samples: &[Sample]) -> Self {
        let mut column: HashMap<&str, usize> = HashMap::with_capacity(tags.len());
        let mut unique = Vec::with_capacity(tags.len());
        for tag in tags {
            if !column.contains_key(tag.as_str()) {
                column.insert(tag.as_str(), unique.len());
                unique.push(tag.clone());
            }
        }

        let mut by_time: BTreeMap<i64, Vec<Option<f64>>> = BTreeMap::new();
        for sample in samples {
            let Some(&j) = column.get(sample.tag.as_str()) else {
                continue;
            };
            by_time
                .entry(sample.timestamp_ns)
                .or_insert_with(|| vec![None; unique.len()])[j] = Some(sample.value);
        }

        let (timestamps, rows) = by_time.into_iter().unzip();
        Self {
            tags: unique,
            timestamps,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// `timestamp_ns,<tag>...` header, then one line per timestamp; gaps are empty cells
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = Vec::with_capacity(self.tags.len() + 1);
        header.push("timestamp_ns");
        header.extend(self.tags.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for (ts, row) in self.timestamps.iter().zip(&self.rows) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(ts.to_string());
            record.extend(row.iter().map(|v| v.map(|v| v.to_string()).unwrap_or_default()));
            wtr.write_record(&record)?;
        }

        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Quality;

    fn sample(ts: i64, tag: &str, value: f64) -> Sample {
        Sample {
            timestamp_ns: ts,
            tag: tag.to_string(),
            value,
            quality: Quality::Good,
        }
    }

    #[test]
    fn test_pivot_fills_gaps() {
        let tags = vec!["a/temp".to_string(), "a/level".to_string()];
        let samples = vec![
            sample(100, "a/level", 5.0),
            sample(100, "a/temp", 21.5),
            sample(200, "a/temp", 22.0),
            sample(200, "a/other", 1.0),
        ];

        let matrix = FeatureMatrix::from_samples(&tags, &samples);
        assert_eq!(matrix.timestamps, vec![100, 200]);
        assert_eq!(
            matrix.rows,
            vec![vec![Some(21.5), Some(5.0)], vec![Some(22.0), None]]
        );
    }

    #[test]
    fn test_csv_layout() {
        let tags = vec!["a/temp".to_string(), "a/level".to_string()];
        let matrix = FeatureMatrix::from_samples(
            &tags,
            &[sample(100, "a/temp", 21.5), sample(100, "a/level", 5.0), sample(200, "a/temp", 22.0)],
        );

        let mut out = Vec::new();
        matrix.write_csv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "timestamp_ns,a/temp,a/level\n100,21.5,5\n200,22,\n"
        );
    }

    #[test]
    fn test_repeated_tag_gets_one_column() {
        let tags = vec![
            "a/x".to_string(),
            "a/y".to_string(),
            "a/x".to_string(),
        ];
        let matrix =
            FeatureMatrix::from_samples(&tags, &[sample(100, "a/x", 5.0), sample(100, "a/y", 1.0)]);

        assert_eq!(matrix.tags, vec!["a/x", "a/y"]);
        assert_eq!(matrix.rows, vec![vec![Some(5.0), Some(1.0)]]);
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = FeatureMatrix::from_samples(&["a/x".to_string()], &[]);
        assert!(matrix.is_empty());
    }
}
