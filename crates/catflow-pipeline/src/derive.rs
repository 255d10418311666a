//! Reference [`ParameterDeriver`]: rebuilds `MAGMOM` from the current site
//! order and spins, and the DFT+U block from the current kind order.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use catflow_types::{atomic_number, element_symbol, CatflowError, Parameters, Result, Structure};

use crate::collaborators::ParameterDeriver;

/// Keys holding one entry per kind, in the order of [`Structure::kinds`].
pub const PER_KIND: &[&str] = &["LDAUU", "LDAUJ", "LDAUL"];

/// Initial moment for a species: large for f-block and beyond, moderate for
/// transition metals, small otherwise.
fn default_moment(z: u32) -> f64 {
    if z > 56 {
        7.0
    } else if z > 20 {
        5.0
    } else {
        0.6
    }
}

fn unknown_species(key: &str, species: &str) -> CatflowError {
    CatflowError::InvalidParameter {
        key: key.into(),
        message: format!("unknown species '{species}'"),
    }
}

// ---------------------------------------------------------------------------
// HubbardSet
// ---------------------------------------------------------------------------

/// U, J and angular-momentum values keyed by element symbol.
///
/// ```yaml
/// LDAUU: { Fe: 5.3, Mn: 3.9 }
/// LDAUJ: { Fe: 0.0, Mn: 0.0 }
/// LDAUL: { Fe: 2, Mn: 2 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHubbardSet", into = "RawHubbardSet")]
pub struct HubbardSet {
    u: BTreeMap<String, f64>,
    j: BTreeMap<String, f64>,
    l: BTreeMap<String, i64>,
}

#[derive(Serialize, Deserialize)]
struct RawHubbardSet {
    #[serde(rename = "LDAUU")]
    u: BTreeMap<String, f64>,
    #[serde(rename = "LDAUJ", default)]
    j: BTreeMap<String, f64>,
    #[serde(rename = "LDAUL")]
    l: BTreeMap<String, i64>,
}

impl TryFrom<RawHubbardSet> for HubbardSet {
    type Error = String;

    fn try_from(raw: RawHubbardSet) -> std::result::Result<Self, String> {
        for element in raw.u.keys() {
            if !raw.l.contains_key(element) {
                return Err(format!("'{element}' has a U value but no LDAUL entry"));
            }
        }
        Ok(Self {
            u: raw.u,
            j: raw.j,
            l: raw.l,
        })
    }
}

impl From<HubbardSet> for RawHubbardSet {
    fn from(set: HubbardSet) -> Self {
        Self {
            u: set.u,
            j: set.j,
            l: set.l,
        }
    }
}

impl HubbardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: U and L for `element`, J defaulting to zero.
    pub fn with(mut self, element: &str, u: f64, l: i64) -> Self {
        self.u.insert(element.to_string(), u);
        self.l.insert(element.to_string(), l);
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// The DFT+U block for `structure`: one `LDAUU`/`LDAUJ`/`LDAUL` entry per
    /// kind, kinds without a U getting `0, 0, -1`.
    pub fn parameters(&self, structure: &Structure) -> Result<Parameters> {
        let mut max_z = 0;
        let (mut u, mut j, mut l) = (Vec::new(), Vec::new(), Vec::new());
        for kind in structure.kinds() {
            let z = atomic_number(kind).ok_or_else(|| unknown_species("LDAUU", kind))?;
            max_z = max_z.max(z);
            let symbol = element_symbol(kind);
            match self.u.get(symbol) {
                Some(value) => {
                    u.push(*value);
                    j.push(self.j.get(symbol).copied().unwrap_or(0.0));
                    l.push(self.l.get(symbol).copied().unwrap_or(-1));
                }
                None => {
                    u.push(0.0);
                    j.push(0.0);
                    l.push(-1);
                }
            }
        }

        let mut block = Parameters::new()
            .with("LDAU", true)
            .with("LDAUPRINT", 1)
            .with("LDAUTYPE", 2)
            .with("LDAUU", u)
            .with("LDAUJ", j)
            .with("LDAUL", l);
        if max_z > 56 {
            block.insert("LMAXMIX", 6);
        } else if max_z > 20 {
            block.insert("LMAXMIX", 4);
        }
        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Kind-order remapping
// ---------------------------------------------------------------------------

/// Reorder the per-kind lists of `parameters`, written for kind order `from`,
/// onto kind order `to`.
pub fn remap_per_kind(parameters: &Parameters, from: &[String], to: &[&str]) -> Result<Parameters> {
    let mut remapped = parameters.clone();
    for key in PER_KIND {
        let Some(Value::Array(values)) = parameters.get(key) else {
            continue;
        };
        if values.len() != from.len() {
            return Err(CatflowError::InvalidParameter {
                key: key.to_string(),
                message: format!(
                    "{} entries for {} kinds ({})",
                    values.len(),
                    from.len(),
                    from.join(", ")
                ),
            });
        }
        let reordered = to
            .iter()
            .map(|kind| {
                from.iter()
                    .position(|k| k == kind)
                    .map(|i| values[i].clone())
                    .ok_or_else(|| CatflowError::InvalidParameter {
                        key: key.to_string(),
                        message: format!("no entry for kind '{kind}'"),
                    })
            })
            .collect::<Result<Vec<Value>>>()?;
        remapped.insert(*key, reordered);
    }
    Ok(remapped)
}

// ---------------------------------------------------------------------------
// VaspDeriver
// ---------------------------------------------------------------------------

/// Sets `MAGMOM` to one entry per site, and the DFT+U block when a
/// [`HubbardSet`] is configured. Sites with a non-zero spin get the species
/// default scaled by that spin, so antiferromagnetic orderings carry their
/// sign.
#[derive(Debug, Clone, Default)]
pub struct VaspDeriver {
    hubbard: Option<HubbardSet>,
}

impl VaspDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hubbard(mut self, hubbard: HubbardSet) -> Self {
        self.hubbard = Some(hubbard);
        self
    }
}

impl ParameterDeriver for VaspDeriver {
    fn derive(&self, structure: &Structure, parameters: &Parameters) -> Result<Parameters> {
        let magmom = structure
            .sites
            .iter()
            .map(|site| {
                let z = atomic_number(&site.species)
                    .ok_or_else(|| unknown_species("MAGMOM", &site.species))?;
                let base = default_moment(z);
                Ok(if site.spin != 0.0 { site.spin * base } else { base })
            })
            .collect::<Result<Vec<f64>>>()?;

        let mut derived = parameters.clone();
        derived.insert("MAGMOM", magmom);
        if let Some(hubbard) = &self.hubbard {
            derived.extend_from(&hubbard.parameters(structure)?);
        }
        Ok(derived)
    }
}
