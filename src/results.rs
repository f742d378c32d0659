//! Persisted navigation results.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// A visited simulator state, persisted as `[viewpoint, heading, elevation]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, f64, f64)", into = "(String, f64, f64)")]
pub struct PathPoint {
    pub viewpoint: String,
    pub heading: f64,
    pub elevation: f64,
}

impl From<(String, f64, f64)> for PathPoint {
    fn from((viewpoint, heading, elevation): (String, f64, f64)) -> Self {
        Self {
            viewpoint,
            heading,
            elevation,
        }
    }
}

impl From<PathPoint> for (String, f64, f64) {
    fn from(point: PathPoint) -> Self {
        (point.viewpoint, point.heading, point.elevation)
    }
}

/// The trajectory an agent followed for one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub instr_id: String,
    pub trajectory: Vec<PathPoint>,
}

impl Trajectory {
    pub fn new(instr_id: String, start: PathPoint) -> Self {
        Self {
            instr_id,
            trajectory: vec![start],
        }
    }

    /// The last recorded state.
    pub fn last(&self) -> Option<&PathPoint> {
        self.trajectory.last()
    }
}

/// Write trajectories as a JSON list of `{instr_id, trajectory}` records.
pub fn write_results<P: AsRef<Path>>(
    path: P,
    results: &BTreeMap<String, Vec<PathPoint>>,
) -> io::Result<()> {
    let records: Vec<Trajectory> = results
        .iter()
        .map(|(instr_id, trajectory)| Trajectory {
            instr_id: instr_id.clone(),
            trajectory: trajectory.clone(),
        })
        .collect();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &records)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_point_serializes_as_triple() {
        let point = PathPoint {
            viewpoint: "vp".into(),
            heading: 0.5,
            elevation: 0.0,
        };
        assert_eq!(serde_json::to_string(&point).unwrap(), r#"["vp",0.5,0.0]"#);
        let parsed: PathPoint = serde_json::from_str(r#"["vp",0.5,0.0]"#).unwrap();
        assert_eq!(parsed, point);
    }

    #[test]
    fn write_results_to_file() {
        let dir = std::env::temp_dir().join(format!("confignav-results-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("results.json");
        let mut results = BTreeMap::new();
        results.insert(
            "3_0".to_string(),
            vec![PathPoint {
                viewpoint: "a".into(),
                heading: 0.0,
                elevation: 0.0,
            }],
        );
        write_results(&path, &results).unwrap();
        let records: Vec<Trajectory> =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instr_id, "3_0");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
