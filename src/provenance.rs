// src/provenance.rs
//
// =============================================================================
// NNPAL: MODEL NOTARY
// =============================================================================
//
// The Trust Layer.
//
// Responsibilities:
// 1. Streamed SHA-256 of model files (frozen graphs are hundreds of MB).
// 2. Promotion of trained graphs into the shared `NNP/` directory with the
//    hash recorded in the training state.
// 3. Verification before a graph is handed to exploration jobs, so a model
//    silently replaced on disk is caught.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

// ============================================================================
// 1. HASHING
// ============================================================================

/// SHA-256 of a file, read in 64 KiB chunks.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for hashing: {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// 2. NOTARY
// ============================================================================

/// A promoted model as recorded in `training_<NNN>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub file: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct ModelNotary;

impl ModelNotary {
    /// Copies `source` to `dest_dir/<name>` and returns its record.
    /// The copy lands under a temp name first, then is renamed into place.
    pub fn promote(source: &Path, dest_dir: &Path, name: &str) -> Result<ModelRecord> {
        if !source.exists() {
            return Err(anyhow!("Model file not found: {:?}", source));
        }
        fs::create_dir_all(dest_dir)?;

        let final_path = dest_dir.join(name);
        let tmp_path = dest_dir.join(format!(".{}.partial", name));
        fs::copy(source, &tmp_path)
            .with_context(|| format!("Failed to copy {:?} into {:?}", source, dest_dir))?;
        fs::rename(&tmp_path, &final_path)?;

        if let Ok(dir) = File::open(dest_dir) {
            let _ = dir.sync_all();
        }

        let sha256 = sha256_file(&final_path).context("Failed to hash model weights")?;
        let bytes = fs::metadata(&final_path)?.len();
        Ok(ModelRecord {
            file: name.to_string(),
            sha256,
            bytes,
        })
    }

    /// Checks that the model on disk still matches its record.
    pub fn verify(model_path: &Path, expected_hash: Option<&str>) -> Result<String> {
        if !model_path.exists() {
            return Err(anyhow!("Model file not found: {:?}", model_path));
        }
        let actual = sha256_file(model_path).context("Failed to hash model weights")?;

        if let Some(expected) = expected_hash {
            if actual != expected {
                return Err(anyhow!(
                    "Model integrity violation! Path: {:?}\nExpected: {}\nActual:   {}",
                    model_path,
                    expected,
                    actual
                ));
            }
        }
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_records_hash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("graph.pb");
        fs::write(&src, b"abc").unwrap();

        let rec = ModelNotary::promote(&src, &dir.path().join("NNP"), "graph_1_000.pb").unwrap();
        assert_eq!(
            rec.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(rec.bytes, 3);
        assert!(dir.path().join("NNP/graph_1_000.pb").exists());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.pb");
        fs::write(&path, b"abc").unwrap();
        let h = ModelNotary::verify(&path, None).unwrap();

        fs::write(&path, b"abd").unwrap();
        assert!(ModelNotary::verify(&path, Some(&h)).is_err());
    }
}
