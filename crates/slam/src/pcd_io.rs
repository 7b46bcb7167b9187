//! Map persistence: one PCD file per keypoint category, sharing a
//! common file prefix.

use std::path::{Path, PathBuf};

use pcd_rs::{DataKind, PcdDeserialize, PcdSerialize, Reader, WriterInit};
use thiserror::Error;
use tracing::warn;
use types::{Category, Frame, Header, Point, PointCloud};

#[derive(Error, Debug)]
pub enum PcdIoError {
    #[error("PCD write failed for {path}: {message}")]
    Write { path: String, message: String },
    #[error("PCD read failed for {path}: {message}")]
    Read { path: String, message: String },
}

/// On-disk encoding of the map files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcdFormat {
    Ascii,
    #[default]
    Binary,
    /// Accepted for compatibility; written as plain binary
    BinaryCompressed,
}

impl PcdFormat {
    fn data_kind(&self) -> DataKind {
        match self {
            PcdFormat::Ascii => DataKind::Ascii,
            PcdFormat::Binary => DataKind::Binary,
            PcdFormat::BinaryCompressed => {
                warn!("Compressed PCD output is not supported, writing plain binary");
                DataKind::Binary
            }
        }
    }
}

#[derive(PcdSerialize, PcdDeserialize)]
struct MapRecord {
    x: f64,
    y: f64,
    z: f64,
    intensity: f64,
    time: f64,
    ring: u16,
    label: u8,
}

impl From<&Point> for MapRecord {
    fn from(p: &Point) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            intensity: p.intensity,
            time: p.time,
            ring: p.ring,
            label: p.label,
        }
    }
}

impl From<MapRecord> for Point {
    fn from(r: MapRecord) -> Self {
        Self {
            x: r.x,
            y: r.y,
            z: r.z,
            intensity: r.intensity,
            time: r.time,
            ring: r.ring,
            label: r.label,
        }
    }
}

/// Path of one category's map file under a common prefix.
pub fn map_path(prefix: &str, category: Category) -> PathBuf {
    PathBuf::from(format!("{prefix}_{}.pcd", category.as_str()))
}

pub fn save_cloud(path: &Path, cloud: &PointCloud, format: PcdFormat) -> Result<(), PcdIoError> {
    let to_error = |e: String| PcdIoError::Write {
        path: path.display().to_string(),
        message: e,
    };
    let mut writer = WriterInit {
        width: cloud.len() as u64,
        height: 1,
        viewpoint: Default::default(),
        data_kind: format.data_kind(),
        schema: None,
    }
    .create(path)
    .map_err(|e| to_error(e.to_string()))?;
    for p in &cloud.points {
        writer
            .push(&MapRecord::from(p))
            .map_err(|e| to_error(e.to_string()))?;
    }
    writer.finish().map_err(|e| to_error(e.to_string()))?;
    Ok(())
}

pub fn load_cloud(path: &Path) -> Result<PointCloud, PcdIoError> {
    let to_error = |e: String| PcdIoError::Read {
        path: path.display().to_string(),
        message: e,
    };
    let reader = Reader::open(path).map_err(|e| to_error(e.to_string()))?;
    let mut cloud = PointCloud::new(Header {
        frame: Frame::World,
        ..Header::default()
    });
    for record in reader {
        let record: MapRecord = record.map_err(|e| to_error(e.to_string()))?;
        cloud.points.push(record.into());
    }
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> PointCloud {
        let points = vec![
            Point {
                intensity: 10.0,
                time: 0.01,
                ring: 3,
                label: 1,
                ..Point::new(1.0, -2.0, 0.5)
            },
            Point {
                intensity: 42.0,
                time: 0.05,
                ring: 7,
                label: 0,
                ..Point::new(-4.0, 3.0, 2.5)
            },
        ];
        PointCloud::with_points(Header::default(), points)
    }

    #[test]
    fn test_roundtrip_ascii_and_binary() {
        for (format, name) in [
            (PcdFormat::Ascii, "ascii"),
            (PcdFormat::Binary, "binary"),
            (PcdFormat::BinaryCompressed, "compressed"),
        ] {
            let path = std::env::temp_dir().join(format!("sweep_slam_pcd_{name}.pcd"));
            let cloud = sample_cloud();
            save_cloud(&path, &cloud, format).unwrap();
            let loaded = load_cloud(&path).unwrap();
            assert_eq!(loaded.len(), cloud.len());
            for (a, b) in loaded.points.iter().zip(cloud.points.iter()) {
                assert!((a.x - b.x).abs() < 1e-12);
                assert!((a.intensity - b.intensity).abs() < 1e-12);
                assert_eq!(a.ring, b.ring);
                assert_eq!(a.label, b.label);
            }
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn test_map_path_naming() {
        assert_eq!(
            map_path("/tmp/run1/map", Category::Edge),
            PathBuf::from("/tmp/run1/map_edges.pcd")
        );
    }
}
