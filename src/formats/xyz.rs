// src/formats/xyz.rs
//
// Multi-frame XYZ: an atom count line, a free comment line, then one
// `symbol x y z` line per atom. Frames follow each other without separator.

use crate::errors::{PipelineError, PipelineResult};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Upper bound on atoms pre-allocated from an atom-count line.
const MAX_PREALLOC_ATOMS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub symbol: String,
    pub position: [f64; 3], // Å
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub comment: String,
    pub atoms: Vec<Atom>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.atoms.iter().map(|a| a.symbol.as_str())
    }

    /// Flattened `[x0, y0, z0, x1, ...]`.
    pub fn flat_positions(&self) -> Vec<f64> {
        self.atoms.iter().flat_map(|a| a.position).collect()
    }
}

pub fn parse(text: &str, origin: &Path) -> PipelineResult<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((lineno, header)) = lines.next() {
        let header = header.trim();
        if header.is_empty() {
            continue;
        }
        let count: usize = header.parse().map_err(|_| {
            PipelineError::parse(origin, format!("line {}: expected atom count, got `{}`", lineno + 1, header))
        })?;

        let comment = match lines.next() {
            Some((_, c)) => c.trim().to_string(),
            None => {
                return Err(PipelineError::parse(origin, "truncated frame: missing comment line"));
            }
        };

        let mut atoms = Vec::with_capacity(count.min(MAX_PREALLOC_ATOMS));
        for _ in 0..count {
            let (n, line) = lines.next().ok_or_else(|| {
                PipelineError::parse(origin, format!("truncated frame {}: expected {} atoms", frames.len(), count))
            })?;
            let mut fields = line.split_whitespace();
            let symbol = fields
                .next()
                .ok_or_else(|| PipelineError::parse(origin, format!("line {}: empty atom line", n + 1)))?
                .to_string();
            let mut position = [0.0; 3];
            for slot in position.iter_mut() {
                let tok = fields.next().ok_or_else(|| {
                    PipelineError::parse(origin, format!("line {}: expected 3 coordinates", n + 1))
                })?;
                *slot = tok.parse().map_err(|_| {
                    PipelineError::parse(origin, format!("line {}: bad coordinate `{}`", n + 1, tok))
                })?;
            }
            atoms.push(Atom { symbol, position });
        }
        frames.push(Frame { comment, atoms });
    }

    Ok(frames)
}

pub fn read(path: &Path) -> PipelineResult<Vec<Frame>> {
    let text = fs::read_to_string(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
    parse(&text, path)
}

pub fn render(frames: &[Frame]) -> String {
    let mut out = String::new();
    for frame in frames {
        let _ = writeln!(out, "{}", frame.atoms.len());
        let _ = writeln!(out, "{}", frame.comment);
        for atom in &frame.atoms {
            let _ = writeln!(
                out,
                "{:<3} {:>16.8} {:>16.8} {:>16.8}",
                atom.symbol, atom.position[0], atom.position[1], atom.position[2]
            );
        }
    }
    out
}

pub fn write(path: &Path, frames: &[Frame]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render(frames))
}
