// src/formats/markers.rs
//
// Success markers: substrings an external program prints only when it ends
// normally. A job is complete when every marker of its kind is present in
// its log.

use std::fs;
use std::path::Path;

/// LAMMPS exploration log.
pub const LAMMPS_DONE: &[&str] = &["Total wall time:"];

/// CP2K labeling output.
pub const CP2K_DONE: &[&str] = &["SCF run converged in", "PROGRAM ENDED AT"];

/// DeePMD training log.
pub const DEEPMD_TRAIN_DONE: &[&str] = &["finished training"];

/// DeePMD test log.
pub const DEEPMD_TEST_DONE: &[&str] = &["number of test data"];

pub fn text_has_all(text: &str, markers: &[&str]) -> bool {
    markers.iter().all(|m| text.contains(m))
}

/// False when the file is missing or unreadable.
pub fn file_has_all(path: &Path, markers: &[&str]) -> bool {
    match fs::read(path) {
        Ok(bytes) => text_has_all(&String::from_utf8_lossy(&bytes), markers),
        Err(_) => false,
    }
}
