// src/formats/model_devi.rs
//
// Ensemble deviation table written by the MD engine next to each
// trajectory. One row per printed frame:
//
//   #  step  max_devi_v  min_devi_v  avg_devi_v  max_devi_f  min_devi_f  avg_devi_f
//
// Lines starting with `#` are comments. Extra trailing columns are ignored.

use crate::errors::{PipelineError, PipelineResult};
use std::fs;
use std::path::Path;

/// Column of the maximum per-atom force deviation.
const MAX_DEVI_F_COLUMN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationRow {
    pub step: u64,
    pub max_devi_f: f64,
    pub avg_devi_f: f64,
}

pub fn parse(text: &str, origin: &Path) -> PipelineResult<Vec<DeviationRow>> {
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            return Err(PipelineError::parse(
                origin,
                format!("line {}: expected 7 columns, got {}", n + 1, fields.len()),
            ));
        }
        let num = |i: usize| -> PipelineResult<f64> {
            fields[i].parse::<f64>().map_err(|_| {
                PipelineError::parse(origin, format!("line {}: bad number `{}`", n + 1, fields[i]))
            })
        };
        rows.push(DeviationRow {
            step: num(0)? as u64,
            max_devi_f: num(MAX_DEVI_F_COLUMN)?,
            avg_devi_f: num(6)?,
        });
    }
    Ok(rows)
}

pub fn read(path: &Path) -> PipelineResult<Vec<DeviationRow>> {
    let text = fs::read_to_string(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    parse(&text, path)
}

/// The series the selector works on.
pub fn max_force_deviation(rows: &[DeviationRow]) -> Vec<f64> {
    rows.iter().map(|r| r.max_devi_f).collect()
}
