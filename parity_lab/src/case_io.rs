use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cases::FieldCase;

/// A labeled group of cases, the unit the harness reports residuals for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSet {
    pub label: String,
    pub cases: Vec<FieldCase>,
}

impl CaseSet {
    pub fn new(label: impl Into<String>, cases: Vec<FieldCase>) -> Self {
        Self {
            label: label.into(),
            cases,
        }
    }

    pub fn node_count(&self) -> usize {
        self.cases.iter().map(|case| case.nodes.len()).sum()
    }
}

/// Writes labeled case sets to JSON so other runners can replay them.
pub fn export_case_sets_to_json<P: AsRef<Path>>(sets: &[CaseSet], path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(sets).context("failed to serialise case sets")?;
    fs::write(&path, json)
        .with_context(|| format!("failed to write cases JSON to {}", path.as_ref().display()))?;
    Ok(())
}

pub fn import_case_sets_from_json<P: AsRef<Path>>(path: P) -> Result<Vec<CaseSet>> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read cases JSON {}", path.as_ref().display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("malformed cases JSON {}", path.as_ref().display()))
}
