//! Phase pipeline definition for the per-domain state machine.
//!
//! The default pipeline is fixed at six phases; configuration can reorder
//! or re-flag them but never invent unknown phase names.

use crate::config::PhaseEntry;
use crate::errors::OrchestratorError;
use serde::{Deserialize, Serialize};

pub const PHASE_VALIDATION: &str = "validation";
pub const PHASE_INITIALIZATION: &str = "initialization";
pub const PHASE_DATABASE: &str = "database";
pub const PHASE_SECRETS: &str = "secrets";
pub const PHASE_DEPLOYMENT: &str = "deployment";
pub const PHASE_POST_VALIDATION: &str = "post-validation";

const KNOWN_PHASES: [&str; 6] = [
    PHASE_VALIDATION,
    PHASE_INITIALIZATION,
    PHASE_DATABASE,
    PHASE_SECRETS,
    PHASE_DEPLOYMENT,
    PHASE_POST_VALIDATION,
];

/// One step of the per-domain machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// A critical phase failure terminates the domain with `failed`;
    /// non-critical failures leave `completed_with_warnings`.
    pub critical: bool,
}

impl PhaseSpec {
    pub fn new(name: &str, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            critical,
        }
    }
}

/// The default six-phase pipeline.
pub fn default_pipeline() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new(PHASE_VALIDATION, true),
        PhaseSpec::new(PHASE_INITIALIZATION, true),
        PhaseSpec::new(PHASE_DATABASE, false),
        PhaseSpec::new(PHASE_SECRETS, false),
        PhaseSpec::new(PHASE_DEPLOYMENT, true),
        PhaseSpec::new(PHASE_POST_VALIDATION, false),
    ]
}

/// Build the pipeline from configuration, falling back to the default when
/// no entries are configured. Unknown phase names are a configuration error.
pub fn pipeline_from_config(entries: &[PhaseEntry]) -> Result<Vec<PhaseSpec>, OrchestratorError> {
    if entries.is_empty() {
        return Ok(default_pipeline());
    }
    entries
        .iter()
        .map(|entry| {
            if KNOWN_PHASES.contains(&entry.name.as_str()) {
                Ok(PhaseSpec::new(&entry.name, entry.critical))
            } else {
                Err(OrchestratorError::Config(format!(
                    "unknown phase '{}' in pipeline configuration (known: {})",
                    entry.name,
                    KNOWN_PHASES.join(", ")
                )))
            }
        })
        .collect()
}

/// What a phase handler reports back on success.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutput {
    pub warnings: Vec<String>,
    /// Worker URL recovered during the deployment phase.
    pub url: Option<String>,
    pub deployed: bool,
}

impl PhaseOutput {
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_order_and_criticality() {
        let pipeline = default_pipeline();
        let names: Vec<&str> = pipeline.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "validation",
                "initialization",
                "database",
                "secrets",
                "deployment",
                "post-validation"
            ]
        );
        let critical: Vec<bool> = pipeline.iter().map(|p| p.critical).collect();
        assert_eq!(critical, vec![true, true, false, false, true, false]);
    }

    #[test]
    fn config_pipeline_falls_back_to_default() {
        let pipeline = pipeline_from_config(&[]).unwrap();
        assert_eq!(pipeline, default_pipeline());
    }

    #[test]
    fn config_pipeline_rejects_unknown_phases() {
        let entries = vec![PhaseEntry {
            name: "teleport".to_string(),
            critical: true,
        }];
        let err = pipeline_from_config(&entries).unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn config_pipeline_can_reflag_phases() {
        let entries = vec![
            PhaseEntry {
                name: "validation".to_string(),
                critical: true,
            },
            PhaseEntry {
                name: "deployment".to_string(),
                critical: false,
            },
        ];
        let pipeline = pipeline_from_config(&entries).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert!(!pipeline[1].critical);
    }
}
