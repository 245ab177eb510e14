//! # Embedding Safety Checks
//!
//! A unit may only be hosted off-heap if it references no per-instance
//! runtime state and if its calling convention leaves the trampoline
//! register alone: calls into off-heap code load that register with the
//! target before jumping, clobbering whatever the caller put there.
//!
//! All violations are collected before reporting so one build shows every
//! offending unit.

use core::fmt;

use helix_relocation::{Architecture, Register};

use crate::code::CodeSource;
use crate::{BlobError, BlobResult};

/// Why a unit cannot be embedded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Unit references per-instance runtime state
    ContextDependent,
    /// Call descriptor passes something in the trampoline register
    AliasesTrampolineRegister(Register),
}

/// One unit that failed the safety checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyViolation {
    /// Unit index
    pub unit: usize,
    /// Unit name
    pub name: String,
    /// What is wrong
    pub violation: Violation,
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.violation {
            Violation::ContextDependent => {
                write!(f, "{} (#{}) is not context-independent", self.name, self.unit)
            },
            Violation::AliasesTrampolineRegister(register) => write!(
                f,
                "{} (#{}) aliases the off-heap trampoline register (r{})",
                self.name,
                self.unit,
                register.code()
            ),
        }
    }
}

/// Every violation in `source`, in unit order
pub fn check_units<S>(source: &S, arch: Architecture) -> Vec<SafetyViolation>
where
    S: CodeSource + ?Sized,
{
    let trampoline = arch.trampoline_register();
    let mut violations = Vec::new();

    for unit in 0..source.unit_count() {
        let mut report = |violation| {
            violations.push(SafetyViolation {
                unit,
                name: source.name(unit).to_owned(),
                violation,
            })
        };

        if !source.is_context_independent(unit) {
            report(Violation::ContextDependent);
        }

        if source.kind(unit).has_call_descriptor()
            && source.call_descriptor(unit).uses(trampoline)
        {
            report(Violation::AliasesTrampolineRegister(trampoline));
        }
    }

    violations
}

/// Fail if any unit of `source` cannot be embedded
pub fn ensure_embeddable<S>(source: &S, arch: Architecture) -> BlobResult<()>
where
    S: CodeSource + ?Sized,
{
    let violations = check_units(source, arch);
    if violations.is_empty() {
        return Ok(());
    }
    for violation in &violations {
        log::error!("embedded: {}", violation);
    }
    Err(BlobError::UnsafeCodeUnits(violations))
}
