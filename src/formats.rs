// src/formats.rs
//
// =============================================================================
// NNPAL: FILE FORMAT CODECS
// =============================================================================
//
// Readers and writers for the files exchanged with the external engines:
// 1. xyz:        multi-frame trajectories and candidate sets.
// 2. npy:        NumPy arrays of the training datasets.
// 3. model_devi: ensemble deviation tables written by the MD engine.
// 4. cp2k:       reference energies and forces from the DFT engine.
// 5. markers:    success substrings searched in job logs.

pub mod cp2k;
pub mod markers;
pub mod model_devi;
pub mod npy;
pub mod xyz;
