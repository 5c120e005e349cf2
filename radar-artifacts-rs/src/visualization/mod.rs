//! Visualization of labeled detections.
//!
//! Renders a 2D scatter plot of the detection positions, coloured by final
//! cluster id, using the plotters bitmap backend.

use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::core::loaders::DetectionTable;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("No detections with finite positions to plot")]
    Empty,

    #[error("{ids} cluster ids for {rows} detections")]
    LengthMismatch { ids: usize, rows: usize },
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Default plot width in pixels.
const DEFAULT_WIDTH: u32 = 1920;

/// Default plot height in pixels.
const DEFAULT_HEIGHT: u32 = 1080;

/// Color palette for cluster visualization.
const CLUSTER_COLORS: &[(u8, u8, u8)] = &[
    (228, 26, 28),   // Red
    (55, 126, 184),  // Blue
    (77, 175, 74),   // Green
    (152, 78, 163),  // Purple
    (255, 127, 0),   // Orange
    (255, 255, 51),  // Yellow
    (166, 86, 40),   // Brown
    (247, 129, 191), // Pink
    (153, 153, 153), // Gray
    (0, 206, 209),   // Turquoise
];

/// Color for a final cluster id.
fn cluster_color(id: usize) -> RGBColor {
    let c = CLUSTER_COLORS[id % CLUSTER_COLORS.len()];
    RGBColor(c.0, c.1, c.2)
}

/// Plot detection positions coloured by `cluster_ids` and save as PNG.
///
/// At most `max_points` detections are drawn, subsampled with a fixed stride.
/// Detections with non-finite positions are skipped.
pub fn plot_clusters(
    output_path: &Path,
    table: &DetectionTable,
    cluster_ids: &[usize],
    max_points: usize,
) -> Result<()> {
    if cluster_ids.len() != table.len() {
        return Err(VisualizationError::LengthMismatch {
            ids: cluster_ids.len(),
            rows: table.len(),
        });
    }

    let n = table.len();
    let step = if max_points > 0 && n > max_points {
        n.div_ceil(max_points)
    } else {
        1
    };

    let points: Vec<(f32, f32, RGBColor)> = (0..n)
        .step_by(step)
        .filter(|&i| table.positions[i].iter().all(|v| v.is_finite()))
        .map(|i| {
            let [x, y] = table.positions[i];
            (x, y, cluster_color(cluster_ids[i]))
        })
        .collect();

    if points.is_empty() {
        return Err(VisualizationError::Empty);
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (x_min, x_max, y_min, y_max) = compute_bounds(&points);
    let x_padding = (x_max - x_min) * 0.05;
    let y_padding = (y_max - y_min) * 0.05;

    let root =
        BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();

    root.fill(&WHITE)
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    // No mesh or captions: the bitmap backend is built without font support.
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(
            (x_min - x_padding)..(x_max + x_padding),
            (y_min - y_padding)..(y_max + y_padding),
        )
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    chart
        .draw_series(
            points
                .iter()
                .map(|(x, y, color)| Circle::new((*x, *y), 3, color.filled())),
        )
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    root.present()
        .map_err(|e| VisualizationError::PlottingError(e.to_string()))?;

    log::info!("wrote cluster plot with {} points to {}", points.len(), output_path.display());
    Ok(())
}

/// Compute the bounds (min/max) for x and y coordinates.
fn compute_bounds(points: &[(f32, f32, RGBColor)]) -> (f32, f32, f32, f32) {
    let mut x_min = f32::MAX;
    let mut x_max = f32::MIN;
    let mut y_min = f32::MAX;
    let mut y_max = f32::MIN;

    for (x, y, _) in points {
        x_min = x_min.min(*x);
        x_max = x_max.max(*x);
        y_min = y_min.min(*y);
        y_max = y_max.max(*y);
    }

    if (x_max - x_min).abs() < f32::EPSILON {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if (y_max - y_min).abs() < f32::EPSILON {
        y_min -= 1.0;
        y_max += 1.0;
    }

    (x_min, x_max, y_min, y_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::Matrix;
    use tempfile::tempdir;

    fn table(positions: Vec<[f32; 2]>) -> DetectionTable {
        let n = positions.len();
        DetectionTable::from_parts(
            vec!["clutter".to_string(); n],
            positions,
            Matrix::new(vec![0.0; n], 1).unwrap(),
            vec!["snr".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_compute_bounds_pads_degenerate_axis() {
        let c = cluster_color(0);
        let (x_min, x_max, y_min, y_max) = compute_bounds(&[(1.0, 2.0, c), (3.0, 2.0, c)]);
        assert_eq!((x_min, x_max), (1.0, 3.0));
        assert_eq!((y_min, y_max), (1.0, 3.0));
    }

    #[test]
    fn test_cluster_color_wraps() {
        assert_eq!(cluster_color(1), cluster_color(1 + CLUSTER_COLORS.len()));
    }

    #[test]
    fn test_plot_clusters_writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plots").join("clusters.png");
        let t = table((0..50).map(|i| [i as f32, (i * i) as f32]).collect());
        let ids: Vec<usize> = (0..50).map(|i| i % 4).collect();

        plot_clusters(&path, &t, &ids, 20).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_plot_clusters_rejects_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clusters.png");

        let t = table(vec![[f32::NAN, 0.0]]);
        assert!(matches!(
            plot_clusters(&path, &t, &[0], 10),
            Err(VisualizationError::Empty)
        ));

        let t = table(vec![[0.0, 0.0]]);
        assert!(matches!(
            plot_clusters(&path, &t, &[], 10),
            Err(VisualizationError::LengthMismatch { ids: 0, rows: 1 })
        ));
    }
}
