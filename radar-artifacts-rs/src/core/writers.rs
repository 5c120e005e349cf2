//! Writers for labeled detection tables and cluster statistics.
//!
//! This module provides:
//! - CSV with one row per detection and its final cluster id / refined label
//! - Pretty-printed JSON mapping cluster id to its statistics record

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::loaders::DetectionTable;
use crate::config::DataConfig;
use crate::processors::labeling::ClusterStatistics;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// JSON serialization error.
    #[error("JSON write error for '{path}': {source}")]
    JsonError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Mismatched array lengths.
    #[error("array length mismatch: table has {table_len} rows, cluster ids has {ids_len} elements")]
    LengthMismatch { table_len: usize, ids_len: usize },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Write the labeled detection table to CSV.
///
/// Columns: class, the two position columns, the refined label column,
/// cluster, followed by every feature column in matrix order. Class,
/// position and refined label column names come from `columns`, so the file
/// loads back with the same [`DataConfig`].
///
/// # Errors
///
/// Returns `LengthMismatch` if `cluster_ids` does not have one entry per
/// detection, otherwise I/O and CSV errors.
pub fn write_detections_csv(
    path: &Path,
    table: &DetectionTable,
    cluster_ids: &[usize],
    columns: &DataConfig,
) -> Result<()> {
    if table.len() != cluster_ids.len() {
        return Err(WriteError::LengthMismatch {
            table_len: table.len(),
            ids_len: cluster_ids.len(),
        });
    }

    ensure_parent_dirs(path)?;
    let buf_writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(buf_writer);
    let path_str = path.display().to_string();
    let csv_err = |e| WriteError::CsvError {
        path: path_str.clone(),
        source: e,
    };

    let mut header: Vec<&str> = vec![
        columns.class_column.as_str(),
        columns.position_columns[0].as_str(),
        columns.position_columns[1].as_str(),
        columns.refined_column.as_str(),
        "cluster",
    ];
    header.extend(table.feature_names.iter().map(String::as_str));
    csv_writer.write_record(&header).map_err(csv_err)?;

    for i in 0..table.len() {
        let mut record = vec![
            table.classes[i].clone(),
            format!("{:.6}", table.positions[i][0]),
            format!("{:.6}", table.positions[i][1]),
            table.refined_labels[i].clone(),
            cluster_ids[i].to_string(),
        ];
        record.extend(table.features.row(i).iter().map(|v| format!("{:.6}", v)));
        csv_writer.write_record(&record).map_err(csv_err)?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    })?;

    Ok(())
}

/// Write the cluster statistics mapping as pretty-printed JSON.
///
/// Keys are cluster ids in ascending order.
pub fn write_statistics_json(
    path: &Path,
    stats: &BTreeMap<usize, ClusterStatistics>,
) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();

    serde_json::to_writer_pretty(&mut writer, stats).map_err(|e| WriteError::JsonError {
        path: path_str.clone(),
        source: e,
    })?;
    writeln!(writer).map_err(|e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    })?;
    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}
