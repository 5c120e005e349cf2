//! Loader for detection tables stored as headed CSV files.
//!
//! Each row is one radar detection: a broad source class, a position pair
//! used for plotting, and the normalized feature vector consumed by the
//! encoder. Row order is preserved so results can be reattached by position.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

use super::transforms::{Matrix, MatrixError};
use crate::config::DataConfig;

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Malformed feature matrix: {0}")]
    Matrix(#[from] MatrixError),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Detections of one test case, in file order.
#[derive(Debug, Clone)]
pub struct DetectionTable {
    /// Broad source class per detection.
    pub classes: Vec<String>,
    /// Refined artifact label per detection; starts out equal to the class.
    pub refined_labels: Vec<String>,
    /// Plot position per detection.
    pub positions: Vec<[f32; 2]>,
    /// Normalized feature vectors, one row per detection.
    pub features: Matrix,
    /// Names of the feature columns, in matrix column order.
    pub feature_names: Vec<String>,
}

impl DetectionTable {
    /// Returns the number of detections.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Assemble a table from already-loaded parts.
    ///
    /// Fails with `ParseError` when the per-row vectors disagree on length.
    pub fn from_parts(
        classes: Vec<String>,
        positions: Vec<[f32; 2]>,
        features: Matrix,
        feature_names: Vec<String>,
    ) -> Result<Self> {
        if classes.len() != positions.len() || classes.len() != features.n_rows() {
            return Err(LoaderError::ParseError(format!(
                "row count mismatch: {} classes, {} positions, {} feature rows",
                classes.len(),
                positions.len(),
                features.n_rows()
            )));
        }
        if feature_names.len() != features.n_cols() {
            return Err(LoaderError::ParseError(format!(
                "{} feature names for {} feature columns",
                feature_names.len(),
                features.n_cols()
            )));
        }
        Ok(Self {
            refined_labels: classes.clone(),
            classes,
            positions,
            features,
            feature_names,
        })
    }
}

fn parse_cell(value: Option<&str>, column: &str, row: usize) -> Result<f32> {
    let raw = value.unwrap_or("").trim();
    if raw.is_empty() {
        return Ok(f32::NAN);
    }
    raw.parse::<f32>().map_err(|_| {
        LoaderError::ParseError(format!(
            "row {}: column '{}' has non-numeric value '{}'",
            row, column, raw
        ))
    })
}

/// Load a detection table from a CSV file with a header row.
///
/// Column names are matched exactly (after trimming whitespace) against the
/// configured feature, class and position columns. Empty feature cells load
/// as NaN so that they surface as numeric instability downstream rather than
/// aborting the load.
///
/// # Errors
///
/// Returns `MissingColumns` if any configured column is absent, `ParseError`
/// for non-numeric values, and `EmptyFile` when there are no data rows.
pub fn load_detections<P: AsRef<Path>>(path: P, config: &DataConfig) -> Result<DetectionTable> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let col_map: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim(), i))
        .collect();

    let mut missing: Vec<String> = Vec::new();
    let mut lookup = |name: &str| -> Option<usize> {
        let idx = col_map.get(name).copied();
        if idx.is_none() {
            missing.push(name.to_string());
        }
        idx
    };

    let class_idx = lookup(config.class_column.as_str());
    let x_idx = lookup(config.position_columns[0].as_str());
    let y_idx = lookup(config.position_columns[1].as_str());
    let feature_idx: Vec<Option<usize>> = config
        .feature_columns
        .iter()
        .map(|c| lookup(c.as_str()))
        .collect();

    if !missing.is_empty() {
        return Err(LoaderError::MissingColumns(missing.join(", ")));
    }

    // All lookups succeeded past this point
    let class_idx = class_idx.unwrap_or_default();
    let x_idx = x_idx.unwrap_or_default();
    let y_idx = y_idx.unwrap_or_default();
    let feature_idx: Vec<usize> = feature_idx.into_iter().flatten().collect();

    let n_features = feature_idx.len();
    let mut classes = Vec::new();
    let mut positions = Vec::new();
    let mut data = Vec::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;

        classes.push(record.get(class_idx).unwrap_or("").trim().to_string());
        positions.push([
            parse_cell(record.get(x_idx), &config.position_columns[0], row)?,
            parse_cell(record.get(y_idx), &config.position_columns[1], row)?,
        ]);
        for (&idx, name) in feature_idx.iter().zip(&config.feature_columns) {
            data.push(parse_cell(record.get(idx), name, row)?);
        }
    }

    if classes.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    let features = Matrix::new(data, n_features)?;
    log::debug!(
        "{}: loaded {} detections x {} features",
        path.display(),
        features.n_rows(),
        n_features
    );

    DetectionTable::from_parts(
        classes,
        positions,
        features,
        config.feature_columns.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn small_config() -> DataConfig {
        DataConfig {
            feature_columns: vec!["snr".to_string(), "azimuth".to_string()],
            ..DataConfig::default()
        }
    }

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_load_detections() {
        let file = write_csv(
            "class,x,y,snr,azimuth,extra\n\
             clutter,1.0,2.0,0.5,-0.5,a\n\
             target,3.0,4.0,1.5,0.25,b\n",
        );

        let table = load_detections(file.path(), &small_config()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.classes, vec!["clutter", "target"]);
        assert_eq!(table.refined_labels, table.classes);
        assert_eq!(table.positions[1], [3.0, 4.0]);
        assert_eq!(table.features.row(0), &[0.5, -0.5]);
        assert_eq!(table.features.row(1), &[1.5, 0.25]);
    }

    #[test]
    fn test_feature_order_follows_config() {
        let file = write_csv("azimuth,snr,class,x,y\n0.1,0.9,ghost,0,0\n");

        let table = load_detections(file.path(), &small_config()).unwrap();
        assert_eq!(table.features.row(0), &[0.9, 0.1]);
        assert_eq!(table.feature_names, vec!["snr", "azimuth"]);
    }

    #[test]
    fn test_missing_columns() {
        let file = write_csv("class,x,snr\nclutter,1.0,0.5\n");

        match load_detections(file.path(), &small_config()) {
            Err(LoaderError::MissingColumns(cols)) => {
                assert!(cols.contains('y'));
                assert!(cols.contains("azimuth"));
            }
            other => panic!("Expected MissingColumns, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn test_empty_cell_is_nan() {
        let file = write_csv("class,x,y,snr,azimuth\nclutter,0,0,,1.0\n");

        let table = load_detections(file.path(), &small_config()).unwrap();
        assert!(table.features.row(0)[0].is_nan());
    }

    #[test]
    fn test_non_numeric_value() {
        let file = write_csv("class,x,y,snr,azimuth\nclutter,0,0,loud,1.0\n");

        let result = load_detections(file.path(), &small_config());
        assert!(matches!(result, Err(LoaderError::ParseError(_))));
    }

    #[test]
    fn test_empty_file() {
        let file = write_csv("class,x,y,snr,azimuth\n");

        let result = load_detections(file.path(), &small_config());
        assert!(matches!(result, Err(LoaderError::EmptyFile(_))));
    }

    #[test]
    fn test_from_parts_mismatch() {
        let features = Matrix::from_rows(&[vec![1.0]]).unwrap();
        let result = DetectionTable::from_parts(
            vec!["a".to_string(), "b".to_string()],
            vec![[0.0, 0.0]],
            features,
            vec!["f".to_string()],
        );
        assert!(matches!(result, Err(LoaderError::ParseError(_))));
    }
}
