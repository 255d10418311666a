//! Periodic-table data needed to order species and weigh cells.

/// One row of the periodic table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Element {
    pub symbol: &'static str,
    /// Standard atomic weight in g/mol.
    pub mass: f64,
    /// Pauling electronegativity; `None` for the lighter noble gases.
    pub electronegativity: Option<f64>,
}

const fn el(symbol: &'static str, mass: f64, electronegativity: f64) -> Element {
    Element {
        symbol,
        mass,
        electronegativity: Some(electronegativity),
    }
}

const fn noble(symbol: &'static str, mass: f64) -> Element {
    Element {
        symbol,
        mass,
        electronegativity: None,
    }
}

/// Elements 1 (H) to 103 (Lr), indexed by atomic number minus one.
pub const ELEMENTS: [Element; 103] = [
    el("H", 1.00794, 2.20),
    noble("He", 4.002602),
    el("Li", 6.941, 0.98),
    el("Be", 9.012182, 1.57),
    el("B", 10.811, 2.04),
    el("C", 12.0107, 2.55),
    el("N", 14.0067, 3.04),
    el("O", 15.9994, 3.44),
    el("F", 18.9984032, 3.98),
    noble("Ne", 20.1797),
    el("Na", 22.98976928, 0.93),
    el("Mg", 24.305, 1.31),
    el("Al", 26.9815386, 1.61),
    el("Si", 28.0855, 1.90),
    el("P", 30.973762, 2.19),
    el("S", 32.065, 2.58),
    el("Cl", 35.453, 3.16),
    noble("Ar", 39.948),
    el("K", 39.0983, 0.82),
    el("Ca", 40.078, 1.00),
    el("Sc", 44.955912, 1.36),
    el("Ti", 47.867, 1.54),
    el("V", 50.9415, 1.63),
    el("Cr", 51.9961, 1.66),
    el("Mn", 54.938045, 1.55),
    el("Fe", 55.845, 1.83),
    el("Co", 58.933195, 1.88),
    el("Ni", 58.6934, 1.91),
    el("Cu", 63.546, 1.90),
    el("Zn", 65.409, 1.65),
    el("Ga", 69.723, 1.81),
    el("Ge", 72.64, 2.01),
    el("As", 74.9216, 2.18),
    el("Se", 78.96, 2.55),
    el("Br", 79.904, 2.96),
    el("Kr", 83.798, 3.00),
    el("Rb", 85.4678, 0.82),
    el("Sr", 87.62, 0.95),
    el("Y", 88.90585, 1.22),
    el("Zr", 91.224, 1.33),
    el("Nb", 92.90638, 1.6),
    el("Mo", 95.94, 2.16),
    el("Tc", 98.0, 1.9),
    el("Ru", 101.07, 2.2),
    el("Rh", 102.9055, 2.28),
    el("Pd", 106.42, 2.20),
    el("Ag", 107.8682, 1.93),
    el("Cd", 112.411, 1.69),
    el("In", 114.818, 1.78),
    el("Sn", 118.71, 1.96),
    el("Sb", 121.76, 2.05),
    el("Te", 127.6, 2.1),
    el("I", 126.90447, 2.66),
    el("Xe", 131.293, 2.60),
    el("Cs", 132.9054519, 0.79),
    el("Ba", 137.327, 0.89),
    el("La", 138.90547, 1.10),
    el("Ce", 140.116, 1.12),
    el("Pr", 140.90765, 1.13),
    el("Nd", 144.242, 1.14),
    el("Pm", 145.0, 1.13),
    el("Sm", 150.36, 1.17),
    el("Eu", 151.964, 1.2),
    el("Gd", 157.25, 1.2),
    el("Tb", 158.92535, 1.1),
    el("Dy", 162.5, 1.22),
    el("Ho", 164.93032, 1.23),
    el("Er", 167.259, 1.24),
    el("Tm", 168.93421, 1.25),
    el("Yb", 173.04, 1.1),
    el("Lu", 174.967, 1.27),
    el("Hf", 178.49, 1.3),
    el("Ta", 180.94788, 1.5),
    el("W", 183.84, 2.36),
    el("Re", 186.207, 1.9),
    el("Os", 190.23, 2.2),
    el("Ir", 192.217, 2.20),
    el("Pt", 195.084, 2.28),
    el("Au", 196.966569, 2.54),
    el("Hg", 200.59, 2.00),
    el("Tl", 204.3833, 1.62),
    el("Pb", 207.2, 2.33),
    el("Bi", 208.9804, 2.02),
    el("Po", 209.0, 2.0),
    el("At", 210.0, 2.2),
    el("Rn", 222.0, 2.2),
    el("Fr", 223.0, 0.7),
    el("Ra", 226.0, 0.9),
    el("Ac", 227.0, 1.1),
    el("Th", 232.03806, 1.3),
    el("Pa", 231.03588, 1.5),
    el("U", 238.02891, 1.38),
    el("Np", 237.0, 1.36),
    el("Pu", 244.0, 1.28),
    el("Am", 243.0, 1.3),
    el("Cm", 247.0, 1.3),
    el("Bk", 247.0, 1.3),
    el("Cf", 251.0, 1.3),
    el("Es", 252.0, 1.3),
    el("Fm", 257.0, 1.3),
    el("Md", 258.0, 1.3),
    el("No", 259.0, 1.3),
    el("Lr", 262.0, 1.3),
];

/// Element symbol of a species label such as `Fe`, `Fe2` or `Fe_pv`.
pub fn element_symbol(species: &str) -> &str {
    let end = species
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(species.len());
    &species[..end]
}

/// Periodic-table row of a species label.
pub fn element(species: &str) -> Option<&'static Element> {
    let symbol = element_symbol(species);
    ELEMENTS.iter().find(|e| e.symbol == symbol)
}

/// Atomic number of a species label.
pub fn atomic_number(species: &str) -> Option<u32> {
    let symbol = element_symbol(species);
    ELEMENTS
        .iter()
        .position(|e| e.symbol == symbol)
        .map(|i| i as u32 + 1)
}

pub fn electronegativity(species: &str) -> Option<f64> {
    element(species).and_then(|e| e.electronegativity)
}
