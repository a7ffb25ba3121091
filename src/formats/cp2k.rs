// src/formats/cp2k.rs
//
// Reference labels from the DFT engine:
// - Total energy from the main output, line
//   `ENERGY| Total FORCE_EVAL ( QS ) energy [a.u.]:   -34.1234`
//   (the last occurrence wins).
// - Atomic forces from the `*-forces-1_0.xyz` print file, a table of
//   `# Atom Kind Element X Y Z` rows closed by `SUM OF ATOMIC FORCES`.
//
// Values are returned in atomic units; callers convert.

use crate::errors::{PipelineError, PipelineResult};
use std::fs;
use std::path::Path;

const ENERGY_TAG: &str = "ENERGY| Total FORCE_EVAL";

pub fn parse_energy(text: &str, origin: &Path) -> PipelineResult<f64> {
    let line = text
        .lines()
        .filter(|l| l.contains(ENERGY_TAG))
        .last()
        .ok_or_else(|| PipelineError::parse(origin, "no total energy line"))?;
    let value = line
        .rsplit(':')
        .next()
        .map(str::trim)
        .ok_or_else(|| PipelineError::parse(origin, "malformed energy line"))?;
    value
        .parse()
        .map_err(|_| PipelineError::parse(origin, format!("bad energy value `{}`", value)))
}

/// Forces as `[fx, fy, fz]` per atom, in file order.
pub fn parse_forces(text: &str, origin: &Path) -> PipelineResult<Vec<[f64; 3]>> {
    let mut forces = Vec::new();
    let mut in_table = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("# Atom") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        if trimmed.starts_with("SUM OF ATOMIC FORCES") || trimmed.is_empty() {
            break;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(PipelineError::parse(origin, format!("short force row `{}`", trimmed)));
        }
        let mut f = [0.0; 3];
        for (slot, tok) in f.iter_mut().zip(&fields[3..6]) {
            *slot = tok
                .parse()
                .map_err(|_| PipelineError::parse(origin, format!("bad force value `{}`", tok)))?;
        }
        forces.push(f);
    }

    if forces.is_empty() {
        return Err(PipelineError::parse(origin, "no atomic forces table"));
    }
    Ok(forces)
}

pub fn read_energy(path: &Path) -> PipelineResult<f64> {
    let text = fs::read_to_string(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    parse_energy(&text, path)
}

pub fn read_forces(path: &Path) -> PipelineResult<Vec<[f64; 3]>> {
    let text = fs::read_to_string(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    parse_forces(&text, path)
}
