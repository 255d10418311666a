//! Built-in VASP error handlers.
//!
//! Each handler reacts to one or more catalog signatures and proposes INCAR
//! overrides. Priorities leave gaps so site-specific handlers can be slotted
//! in between.

use catflow_catalog::ClassifiedErrors;
use catflow_types::Modifications;

use crate::handler::{ErrorHandler, HandlerAction, HandlerRegistry, RestartDirective};
use crate::restart::JobState;

// ---------------------------------------------------------------------------
// SignatureHandler: fires on any of a fixed set of signatures
// ---------------------------------------------------------------------------

type ActionFn = fn(&JobState) -> HandlerAction;

#[derive(Clone, Copy)]
pub struct SignatureHandler {
    name: &'static str,
    triggers: &'static [&'static str],
    action: ActionFn,
}

impl SignatureHandler {
    pub const fn new(name: &'static str, triggers: &'static [&'static str], action: ActionFn) -> Self {
        Self {
            name,
            triggers,
            action,
        }
    }

    pub fn triggers(&self) -> &[&'static str] {
        self.triggers
    }
}

impl ErrorHandler for SignatureHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn matches(&self, errors: &ClassifiedErrors, _state: &JobState) -> bool {
        errors.contains_any(self.triggers)
    }

    fn act(&self, _errors: &ClassifiedErrors, state: &JobState) -> HandlerAction {
        (self.action)(state)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

const DEFAULT_POTIM: f64 = 0.5;
const DEFAULT_EDIFF: f64 = 1e-6;

fn potim(state: &JobState) -> f64 {
    state.parameters.get_f64("POTIM").unwrap_or(DEFAULT_POTIM)
}

fn tetrahedron(state: &JobState) -> HandlerAction {
    match state.parameters.get_f64("KSPACING") {
        Some(kspacing) => HandlerAction::modify(Modifications::new().with("KSPACING", kspacing * 0.8)),
        None => HandlerAction::modify(Modifications::new().with("ISMEAR", 0).with("SIGMA", 0.05)),
    }
}

fn inverse_rotation_matrix(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("SYMPREC", 1e-8))
}

fn lreal_false(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("LREAL", false))
}

fn amin(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("AMIN", 0.01))
}

fn pricel(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ISYM", 0).with("SYMPREC", 1e-8))
}

fn brions(state: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("POTIM", potim(state) + 0.1))
}

fn pssyevx(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ALGO", "Normal"))
}

fn eddrmm(state: &JobState) -> HandlerAction {
    let mut mods = Modifications::new().with("ISTART", 0).with("ICHARG", 2);
    match state.parameters.get_str("ALGO") {
        Some("Fast") | Some("VeryFast") => mods.set("ALGO", "Normal"),
        _ => mods.set("POTIM", potim(state) / 2.0),
    }
    HandlerAction::modify(mods).with_restart(RestartDirective::FromLastAttempt)
}

fn edddav(_: &JobState) -> HandlerAction {
    HandlerAction::modify(
        Modifications::new()
            .with("ALGO", "All")
            .with("ISTART", 0)
            .with("ICHARG", 2),
    )
}

fn smearing(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ISMEAR", 0).with("SIGMA", 0.05))
}

fn zheev(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ALGO", "Exact"))
}

fn elf_kpar(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("KPAR", 1))
}

fn rhosyg(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ISYM", 0).with("SYMPREC", 1e-4))
}

fn posmap(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("SYMPREC", 1e-6))
}

fn point_group(_: &JobState) -> HandlerAction {
    HandlerAction::modify(Modifications::new().with("ISYM", 0))
}

fn zpotrf(state: &JobState) -> HandlerAction {
    HandlerAction::modify(
        Modifications::new()
            .with("ISYM", 0)
            .with("POTIM", potim(state) / 2.0),
    )
}

/// Tighten EDIFF; if ZBRENT keeps coming back, shorten the ionic step too.
fn zbrent(state: &JobState) -> HandlerAction {
    let ediff = state.parameters.get_f64("EDIFF").unwrap_or(DEFAULT_EDIFF) * 0.01;
    let mut mods = Modifications::new().with("EDIFF", ediff);
    if state.occurrences("zbrent") >= 2 {
        mods.set("POTIM", potim(state) / 2.0);
    }
    HandlerAction::modify(mods)
}

fn timeout(_: &JobState) -> HandlerAction {
    HandlerAction::restart_from_last_attempt()
}

// ---------------------------------------------------------------------------
// Default registry
// ---------------------------------------------------------------------------

/// (priority, enabled, handler) for every built-in handler.
pub const BUILTIN_HANDLERS: &[(i32, bool, SignatureHandler)] = &[
    (100, false, SignatureHandler::new("tetrahedron", &["tet"], tetrahedron)),
    (110, true, SignatureHandler::new("inverse_rotation_matrix", &["inv_rot_mat"], inverse_rotation_matrix)),
    (120, true, SignatureHandler::new("subspace_matrix", &["subspacematrix"], lreal_false)),
    (130, true, SignatureHandler::new("amin", &["amin"], amin)),
    (140, true, SignatureHandler::new("pricel", &["pricel"], pricel)),
    (150, true, SignatureHandler::new("brions", &["brions"], brions)),
    (160, true, SignatureHandler::new("pssyevx", &["pssyevx"], pssyevx)),
    (170, true, SignatureHandler::new("eddrmm", &["eddrmm"], eddrmm)),
    (180, true, SignatureHandler::new("edddav", &["edddav"], edddav)),
    (190, true, SignatureHandler::new("grad_not_orth", &["grad_not_orth"], smearing)),
    (200, false, SignatureHandler::new("zheev", &["zheev"], zheev)),
    (210, true, SignatureHandler::new("elf_kpar", &["elf_kpar"], elf_kpar)),
    (220, false, SignatureHandler::new("rhosyg", &["rhosyg"], rhosyg)),
    (230, false, SignatureHandler::new("posmap", &["posmap"], posmap)),
    (240, true, SignatureHandler::new("point_group", &["point_group"], point_group)),
    (250, true, SignatureHandler::new("zpotrf", &["zpotrf"], zpotrf)),
    (300, true, SignatureHandler::new("lreal", &["lreal"], lreal_false)),
    (310, true, SignatureHandler::new("rsphere", &["rsphere", "rspher"], lreal_false)),
    (320, true, SignatureHandler::new("zbrent", &["zbrent"], zbrent)),
    (570, true, SignatureHandler::new("timeout", &["walltime"], timeout)),
];

/// A registry holding every built-in VASP handler with its default
/// priority and enabled flag.
pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    for (priority, enabled, handler) in BUILTIN_HANDLERS {
        reg.register(*priority, *enabled, *handler);
    }
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
