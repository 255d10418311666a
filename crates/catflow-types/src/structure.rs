//! Crystal geometry owned by a pipeline run.
//!
//! A [`Structure`] is treated as a value: relaxation stages produce a new one
//! that replaces the old, and sorting returns a fresh copy.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::elements::{electronegativity, element, element_symbol};
use crate::{CatflowError, Result};

/// g/mol per Å^3 to g/cm^3.
const AMU_PER_A3_TO_G_PER_CM3: f64 = 1.660_539_066_60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub species: String,
    pub frac_coords: [f64; 3],
    /// Signed initial spin; zero for non-magnetic sites.
    #[serde(default)]
    pub spin: f64,
}

impl Site {
    pub fn new(species: impl Into<String>, frac_coords: [f64; 3]) -> Self {
        Self {
            species: species.into(),
            frac_coords,
            spin: 0.0,
        }
    }

    pub fn with_spin(mut self, spin: f64) -> Self {
        self.spin = spin;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub lattice: [[f64; 3]; 3],
    pub sites: Vec<Site>,
}

impl Structure {
    pub fn new(lattice: [[f64; 3]; 3], sites: Vec<Site>) -> Self {
        Self { lattice, sites }
    }

    pub fn num_sites(&self) -> usize {
        self.sites.len()
    }

    /// Distinct species in order of first appearance. Ordering-dependent
    /// inputs (potential mapping, per-site lists) follow this order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = Vec::new();
        for site in &self.sites {
            if !kinds.contains(&site.species.as_str()) {
                kinds.push(&site.species);
            }
        }
        kinds
    }

    /// Returns `true` when sorting would change the spin sequence, i.e. a
    /// relaxation flipped moments so that spin-up and spin-down sites of one
    /// species are no longer grouped.
    pub fn needs_sort(&self) -> bool {
        let sorted = self.sorted();
        self.sites
            .iter()
            .zip(&sorted.sites)
            .any(|(a, b)| a.spin != b.spin)
    }

    /// A copy with sites ordered by species electronegativity (cations
    /// first), then by spin (up before down). The sort is stable, so equal
    /// sites keep their relative order.
    pub fn sorted(&self) -> Structure {
        let mut sites = self.sites.clone();
        sites.sort_by(|a, b| {
            compare_species(&a.species, &b.species).then_with(|| b.spin.total_cmp(&a.spin))
        });
        Structure {
            lattice: self.lattice,
            sites,
        }
    }

    /// Lengths of the three lattice vectors in Å.
    pub fn lattice_lengths(&self) -> [f64; 3] {
        self.lattice.map(norm)
    }

    /// Cell volume in Å^3.
    pub fn volume(&self) -> f64 {
        let [a, b, c] = self.lattice;
        let cross = [
            b[1] * c[2] - b[2] * c[1],
            b[2] * c[0] - b[0] * c[2],
            b[0] * c[1] - b[1] * c[0],
        ];
        (a[0] * cross[0] + a[1] * cross[1] + a[2] * cross[2]).abs()
    }

    /// Site count per element symbol.
    pub fn composition(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for site in &self.sites {
            *counts
                .entry(element_symbol(&site.species).to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    /// Number of sites of one element, whatever their kind suffix.
    pub fn count_element(&self, symbol: &str) -> usize {
        self.sites
            .iter()
            .filter(|s| element_symbol(&s.species) == symbol)
            .count()
    }

    /// Formula weight of the cell in g/mol.
    pub fn weight(&self) -> Result<f64> {
        self.sites
            .iter()
            .map(|site| {
                element(&site.species).map(|e| e.mass).ok_or_else(|| {
                    CatflowError::InvalidParameter {
                        key: "species".into(),
                        message: format!("unknown species '{}'", site.species),
                    }
                })
            })
            .sum()
    }

    /// Mass density in g/cm^3.
    pub fn density(&self) -> Result<f64> {
        let volume = self.volume();
        if volume <= 0.0 {
            return Err(CatflowError::InvalidParameter {
                key: "lattice".into(),
                message: "cell has no volume".into(),
            });
        }
        Ok(self.weight()? * AMU_PER_A3_TO_G_PER_CM3 / volume)
    }

    /// A copy with every site of element `symbol` removed.
    pub fn without_element(&self, symbol: &str) -> Structure {
        Structure {
            lattice: self.lattice,
            sites: self
                .sites
                .iter()
                .filter(|s| element_symbol(&s.species) != symbol)
                .cloned()
                .collect(),
        }
    }
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Electronegativity order; species without a value sort last, ties break on
/// the label.
fn compare_species(a: &str, b: &str) -> Ordering {
    let xa = electronegativity(a).unwrap_or(f64::INFINITY);
    let xb = electronegativity(b).unwrap_or(f64::INFINITY);
    xa.total_cmp(&xb).then_with(|| a.cmp(b))
}
