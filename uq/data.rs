//! # Tabular Data Loading
//!
//! Label, prediction and training matrices are exchanged as tab-separated
//! files with one header row. Every data row must have as many fields as the
//! header and every field must parse as a finite number.
//!
//! - Class labels are read from a single-column file and must be
//!   non-negative integers.
//! - Writers emit the same format, so a file written here can be read back.

use ndarray::{Array1, Array2, ArrayView2};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed tab-separated file: {0}")]
    CsvError(#[from] csv::Error),
    #[error("'{0}' contains no data rows.")]
    Empty(PathBuf),
    #[error("Line {line} has {found} fields, but the header declares {expected}.")]
    RaggedRow {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("Line {line}, column '{column}': '{value}' is not a number.")]
    NotANumber {
        line: u64,
        column: String,
        value: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. All values must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("A class label file must have exactly one column, found {0}.")]
    LabelColumns(usize),
    #[error("Line {line}: '{value}' is not a non-negative integer class label.")]
    InvalidLabel { line: u64, value: String },
    #[error("{found} column names were given for a matrix with {expected} columns.")]
    HeaderMismatch { expected: usize, found: usize },
}

/// A numeric table with its column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, DataError> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?)
}

fn line_of(record: &csv::StringRecord, fallback: u64) -> u64 {
    record.position().map_or(fallback, csv::Position::line)
}

/// Reads a numeric TSV file into a `[rows, columns]` matrix.
pub fn load_table(path: &Path) -> Result<Table, DataError> {
    let mut rdr = reader(path)?;
    let columns: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let width = columns.len();

    let mut flat = Vec::new();
    let mut rows = 0;
    for (i, result) in rdr.records().enumerate() {
        let record = result?;
        let line = line_of(&record, i as u64 + 2);
        if record.len() != width {
            return Err(DataError::RaggedRow {
                line,
                expected: width,
                found: record.len(),
            });
        }
        for (field, column) in record.iter().zip(&columns) {
            let value: f64 = field.trim().parse().map_err(|_| DataError::NotANumber {
                line,
                column: column.clone(),
                value: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(column.clone()));
            }
            flat.push(value);
        }
        rows += 1;
    }
    if rows == 0 {
        return Err(DataError::Empty(path.to_path_buf()));
    }

    let values = Array2::from_shape_vec((rows, width), flat)
        .map_err(|_| DataError::Empty(path.to_path_buf()))?;
    log::debug!("Loaded {}x{} matrix from {}", rows, width, path.display());
    Ok(Table { columns, values })
}

pub fn load_matrix(path: &Path) -> Result<Array2<f64>, DataError> {
    Ok(load_table(path)?.values)
}

/// Reads integer class labels from a single-column TSV file.
pub fn load_class_labels(path: &Path) -> Result<Array1<usize>, DataError> {
    let mut rdr = reader(path)?;
    let width = rdr.headers()?.len();
    if width != 1 {
        return Err(DataError::LabelColumns(width));
    }

    let mut labels = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let record = result?;
        let line = line_of(&record, i as u64 + 2);
        if record.len() != 1 {
            return Err(DataError::RaggedRow {
                line,
                expected: 1,
                found: record.len(),
            });
        }
        let field = record[0].trim();
        let label = field.parse::<usize>().map_err(|_| DataError::InvalidLabel {
            line,
            value: field.to_string(),
        })?;
        labels.push(label);
    }
    if labels.is_empty() {
        return Err(DataError::Empty(path.to_path_buf()));
    }
    Ok(Array1::from(labels))
}

/// Generated column names `{prefix}0`, `{prefix}1`, ...
pub fn column_names(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}{i}")).collect()
}

/// Writes `values` as a TSV file with the given header.
pub fn write_matrix(
    path: &Path,
    columns: &[String],
    values: ArrayView2<f64>,
) -> Result<(), DataError> {
    if columns.len() != values.ncols() {
        return Err(DataError::HeaderMismatch {
            expected: values.ncols(),
            found: columns.len(),
        });
    }
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    wtr.write_record(columns)?;
    for row in values.outer_iter() {
        wtr.write_record(row.iter().map(|v| v.to_string()))?;
    }
    wtr.flush()?;
    log::debug!("Wrote {}x{} matrix to {}", values.nrows(), values.ncols(), path.display());
    Ok(())
}
