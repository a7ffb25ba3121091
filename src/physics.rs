// src/physics.rs
//
// =============================================================================
// NNPAL: CANDIDATE SANITY CHECK
// =============================================================================
//
// Frames selected for labeling come from trajectories driven by imperfect
// potentials. A frame with two atoms almost on top of each other would only
// waste a DFT job (or crash it), so candidates are screened first.
// Nearest-neighbour search uses a KD-tree (O(N log N)).

use crate::formats::xyz::Frame;
use anyhow::{anyhow, Result};
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;

// ============================================================================
// 1. CONSTANTS & MASS TABLE
// ============================================================================

/// Default minimal interatomic distance in Å.
pub const DEFAULT_MIN_DISTANCE: f64 = 0.5;

const AMU_PER_CUBIC_ANGSTROM_TO_G_CM3: f64 = 1.660539;

const ATOMIC_MASSES: &[(&str, f64)] = &[
    ("H", 1.008),
    ("Li", 6.94),
    ("B", 10.81),
    ("C", 12.011),
    ("N", 14.007),
    ("O", 15.999),
    ("F", 18.998),
    ("Na", 22.99),
    ("Mg", 24.305),
    ("Al", 26.982),
    ("Si", 28.085),
    ("P", 30.974),
    ("S", 32.06),
    ("Cl", 35.45),
    ("K", 39.098),
    ("Ca", 40.078),
    ("Ti", 47.867),
    ("Fe", 55.845),
    ("Ni", 58.693),
    ("Cu", 63.546),
    ("Zn", 65.38),
    ("Br", 79.904),
    ("Zr", 91.224),
    ("Ag", 107.87),
    ("I", 126.90),
    ("Cs", 132.91),
    ("Pt", 195.08),
    ("Au", 196.97),
    ("Pb", 207.2),
];

fn atomic_mass(symbol: &str) -> Option<f64> {
    ATOMIC_MASSES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, m)| *m)
}

// ============================================================================
// 2. THE TRAIT
// ============================================================================

pub trait SanityCheck {
    /// Fails when two atoms are closer than `min_dist` Å.
    fn check_overlaps(&self, min_dist: f64) -> Result<()>;

    /// Density in g/cm³ inside an orthorhombic cell, `None` when an element
    /// has no tabulated mass.
    fn density(&self, cell: [f64; 3]) -> Option<f64>;
}

// ============================================================================
// 3. IMPLEMENTATION
// ============================================================================

impl SanityCheck for Frame {
    fn check_overlaps(&self, min_dist: f64) -> Result<()> {
        if self.atoms.len() < 2 {
            return Ok(());
        }

        let mut tree: KdTree<f64, usize, [f64; 3]> = KdTree::new(3);
        for (i, atom) in self.atoms.iter().enumerate() {
            tree.add(atom.position, i)
                .map_err(|e| anyhow!("KDTree error: {}", e))?;
        }

        let min_sq = min_dist * min_dist;
        for (i, atom) in self.atoms.iter().enumerate() {
            // Three nearest: self plus a neighbour, with one spare for exact duplicates.
            let nearest = tree
                .nearest(&atom.position, 3, &squared_euclidean)
                .map_err(|e| anyhow!("KDTree query error: {}", e))?;

            let neighbour = nearest.iter().find(|entry| *entry.1 != i);
            if let Some(&(dist_sq, &j)) = neighbour {
                if dist_sq < min_sq {
                    return Err(anyhow!(
                        "Atom overlap: {}[{}] and {}[{}] are {:.3} A apart",
                        atom.symbol,
                        i,
                        self.atoms[j].symbol,
                        j,
                        dist_sq.sqrt()
                    ));
                }
            }
        }
        Ok(())
    }

    fn density(&self, cell: [f64; 3]) -> Option<f64> {
        let volume = cell[0] * cell[1] * cell[2];
        if volume <= 0.0 {
            return None;
        }
        let mut mass = 0.0;
        for atom in &self.atoms {
            mass += atomic_mass(&atom.symbol)?;
        }
        Some(mass / volume * AMU_PER_CUBIC_ANGSTROM_TO_G_CM3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::xyz::Atom;

    fn frame(positions: &[[f64; 3]]) -> Frame {
        Frame {
            comment: String::new(),
            atoms: positions
                .iter()
                .map(|p| Atom {
                    symbol: "O".into(),
                    position: *p,
                })
                .collect(),
        }
    }

    #[test]
    fn test_spread_atoms_pass() {
        let f = frame(&[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 2.0, 0.0]]);
        f.check_overlaps(DEFAULT_MIN_DISTANCE).unwrap();
    }

    #[test]
    fn test_overlap_detected() {
        let f = frame(&[[0.0, 0.0, 0.0], [3.0, 0.0, 0.0], [3.1, 0.0, 0.0]]);
        let err = f.check_overlaps(DEFAULT_MIN_DISTANCE).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_duplicate_positions_detected() {
        let f = frame(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]);
        assert!(f.check_overlaps(DEFAULT_MIN_DISTANCE).is_err());
    }

    #[test]
    fn test_water_like_density() {
        // 1 O in 2.5^3 Å^3 ~ 1.7 g/cm3
        let f = frame(&[[0.0, 0.0, 0.0]]);
        let d = f.density([2.5, 2.5, 2.5]).unwrap();
        assert!((d - 15.999 / 15.625 * 1.660539).abs() < 1e-9);
    }
}
