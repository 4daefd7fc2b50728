//! Export gating: the last check before proposal content leaves the system.

pub mod gatekeeper;
pub mod rules;
#[cfg(test)]
mod tests;

pub use gatekeeper::{ExportEvaluation, ExportGatekeeper};
pub use rules::{
    ENFORCEMENT_FAILURE, EnforcementData, ExportRule, RuleAction, RuleCheck, export_rule_table,
};
