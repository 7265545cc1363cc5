//! Tabular result frames
//!
//! ## Table of Contents
//! - **DataFrame**: Keyed rows with index and value columns; concat unions the columns
//! - **Row**: One row (spec id, index cells, value cells)
//! - **keys**: Well-known dataframe keys
//!
//! Frames have two encodings: a compact binary form (bincode + zstd) for
//! durable storage and a CSV export for humans.

use crate::error::{FanoutError, Result};
use crate::types::SpecId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;

/// zstd level used for stored frames
const COMPRESSION_LEVEL: i32 = 3;

/// Well-known dataframe keys
pub mod keys {
    /// Monthly/annual energy and peak demand summary, one row per building
    pub const ENERGY_AND_PEAK: &str = "EnergyAndPeak";
    /// Hourly timeseries, one row per building and hour
    pub const HOURLY_DATA: &str = "HourlyData";
}

/// One row of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Spec the row belongs to
    pub key: SpecId,
    /// Index cells (features, timestamps), aligned with `index_columns`
    pub index: Vec<String>,
    /// Numeric cells, aligned with `value_columns`
    pub values: Vec<f64>,
}

impl Row {
    /// Create a row
    pub fn new(key: impl Into<SpecId>, index: Vec<String>, values: Vec<f64>) -> Self {
        Self {
            key: key.into(),
            index,
            values,
        }
    }
}

/// Keyed tabular data with a fixed schema
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataFrame {
    /// Names of the index columns
    pub index_columns: Vec<String>,
    /// Names of the numeric value columns
    pub value_columns: Vec<String>,
    /// Rows in insertion order
    pub rows: Vec<Row>,
}

impl DataFrame {
    /// Create an empty frame with the given schema
    pub fn new(index_columns: Vec<String>, value_columns: Vec<String>) -> Self {
        Self {
            index_columns,
            value_columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the frame has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether two frames share a schema
    pub fn same_schema(&self, other: &DataFrame) -> bool {
        self.index_columns == other.index_columns && self.value_columns == other.value_columns
    }

    /// Append a row, checking its width against the schema
    pub fn push(&mut self, row: Row) -> Result<()> {
        if row.index.len() != self.index_columns.len() || row.values.len() != self.value_columns.len()
        {
            return Err(FanoutError::integrity(format!(
                "row {} has {}+{} cells, schema has {}+{}",
                row.key,
                row.index.len(),
                row.values.len(),
                self.index_columns.len(),
                self.value_columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Concatenate another frame's rows onto this one
    ///
    /// Columns are the union of both schemas, in order of first appearance.
    /// Cells a row has no column for are filled with an empty index cell or
    /// a NaN value. No deduplication is performed.
    pub fn concat(&mut self, other: DataFrame) {
        if self.index_columns.is_empty() && self.value_columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }
        if self.same_schema(&other) {
            self.rows.extend(other.rows);
            return;
        }

        let index_columns = union(&self.index_columns, &other.index_columns);
        let value_columns = union(&self.value_columns, &other.value_columns);

        let mine = Reshape::new(&self.index_columns, &self.value_columns, &index_columns, &value_columns);
        let theirs = Reshape::new(&other.index_columns, &other.value_columns, &index_columns, &value_columns);

        let mut rows = Vec::with_capacity(self.rows.len() + other.rows.len());
        rows.extend(std::mem::take(&mut self.rows).into_iter().map(|r| mine.apply(r)));
        rows.extend(other.rows.into_iter().map(|r| theirs.apply(r)));

        self.index_columns = index_columns;
        self.value_columns = value_columns;
        self.rows = rows;
    }

    /// Distinct spec ids in row order
    pub fn distinct_keys(&self) -> Vec<SpecId> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|r| seen.insert(r.key.clone()))
            .map(|r| r.key.clone())
            .collect()
    }

    /// Encode to the stored binary form
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let raw = bincode::serialize(self)?;
        let mut encoder = zstd::Encoder::new(Vec::new(), COMPRESSION_LEVEL)?;
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Decode from the stored binary form
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let raw = zstd::decode_all(bytes)?;
        Ok(bincode::deserialize(&raw)?)
    }

    /// Export as CSV with a `building_id` column first
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = Vec::with_capacity(1 + self.index_columns.len() + self.value_columns.len());
        header.push("building_id");
        header.extend(self.index_columns.iter().map(String::as_str));
        header.extend(self.value_columns.iter().map(String::as_str));
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = Vec::with_capacity(header.len());
            record.push(row.key.to_string());
            record.extend(row.index.iter().cloned());
            record.extend(
                row.values
                    .iter()
                    .map(|v| if v.is_nan() { String::new() } else { v.to_string() }),
            );
            writer.write_record(&record)?;
        }

        writer
            .into_inner()
            .map_err(|e| FanoutError::codec(format!("flush csv: {}", e)))
    }
}

fn union(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = first.iter().map(String::as_str).collect();
    let mut merged = first.to_vec();
    merged.extend(second.iter().filter(|c| seen.insert(c.as_str())).cloned());
    merged
}

/// Source position of every target column, `None` where the source lacks it
struct Reshape {
    index: Vec<Option<usize>>,
    values: Vec<Option<usize>>,
}

impl Reshape {
    fn new(from_index: &[String], from_values: &[String], to_index: &[String], to_values: &[String]) -> Self {
        let positions = |from: &[String], to: &[String]| -> Vec<Option<usize>> {
            let at: HashMap<&str, usize> = from.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();
            to.iter().map(|c| at.get(c.as_str()).copied()).collect()
        };
        Self {
            index: positions(from_index, to_index),
            values: positions(from_values, to_values),
        }
    }

    fn apply(&self, row: Row) -> Row {
        let index = self
            .index
            .iter()
            .map(|p| p.and_then(|i| row.index.get(i).cloned()).unwrap_or_default())
            .collect();
        let values = self
            .values
            .iter()
            .map(|p| p.and_then(|i| row.values.get(i).copied()).unwrap_or(f64::NAN))
            .collect();
        Row {
            key: row.key,
            index,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(keys: &[&str]) -> DataFrame {
        let mut df = DataFrame::new(
            vec!["feature.semantic.Typology".to_string()],
            vec!["Energy.Heating.Annual".to_string(), "Peak.Electricity.Annual".to_string()],
        );
        for (i, k) in keys.iter().enumerate() {
            df.push(Row::new(*k, vec!["Residential".to_string()], vec![i as f64, 1.5]))
                .unwrap();
        }
        df
    }

    #[test]
    fn test_push_checks_width() {
        let mut df = frame(&[]);
        let err = df.push(Row::new("x", vec![], vec![1.0, 2.0]));
        assert!(matches!(err, Err(FanoutError::DataIntegrity(_))));
    }

    #[test]
    fn test_concat_adopts_schema() {
        let mut merged = DataFrame::default();
        merged.concat(frame(&["a", "b"]));
        merged.concat(frame(&["c"]));
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.distinct_keys().len(), 3);
        assert_eq!(merged.index_columns, frame(&[]).index_columns);
    }

    #[test]
    fn test_concat_unions_differing_columns() {
        let mut merged = frame(&["a"]);
        let mut aged = DataFrame::new(
            vec!["feature.semantic.Age".to_string(), "feature.semantic.Typology".to_string()],
            vec!["Energy.Cooling.Annual".to_string(), "Energy.Heating.Annual".to_string()],
        );
        aged.push(Row::new("b", vec!["1975".to_string(), "Office".to_string()], vec![3.0, 4.0]))
            .unwrap();
        merged.concat(aged);

        assert_eq!(
            merged.index_columns,
            vec!["feature.semantic.Typology", "feature.semantic.Age"]
        );
        assert_eq!(
            merged.value_columns,
            vec!["Energy.Heating.Annual", "Peak.Electricity.Annual", "Energy.Cooling.Annual"]
        );

        let a = &merged.rows[0];
        assert_eq!(a.index, vec!["Residential", ""]);
        assert_eq!(a.values[..2], [0.0, 1.5]);
        assert!(a.values[2].is_nan());

        let b = &merged.rows[1];
        assert_eq!(b.index, vec!["Office", "1975"]);
        assert_eq!(b.values[0], 4.0);
        assert!(b.values[1].is_nan());
        assert_eq!(b.values[2], 3.0);

        let csv = String::from_utf8(merged.to_csv().unwrap()).unwrap();
        assert_eq!(csv.lines().nth(2).unwrap(), "b,Office,1975,4,,3");
    }

    #[test]
    fn test_binary_encoding_preserves_frame() {
        let df = frame(&["a", "b", "c"]);
        let bytes = df.to_binary().unwrap();
        assert_eq!(DataFrame::from_binary(&bytes).unwrap(), df);
    }

    #[test]
    fn test_csv_export() {
        let df = frame(&["a"]);
        let text = String::from_utf8(df.to_csv().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "building_id,feature.semantic.Typology,Energy.Heating.Annual,Peak.Electricity.Annual"
        );
        assert_eq!(lines.next().unwrap(), "a,Residential,0,1.5");
    }
}
