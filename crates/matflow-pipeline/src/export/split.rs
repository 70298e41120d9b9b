//! Named subsets of a canonical table
//!
//! A split exports only the rows whose structure matches every one of its
//! field conditions, under `{destination}/{split}`. Each split therefore has
//! its own shards and its own checkpoint.

use crate::error::ConfigError;
use crate::models::CanonicalRecord;
use serde_json::Value;

/// Functionals with a compatible split of their own
pub const SPLIT_FUNCTIONALS: &[&str] = &["pbe", "pbesol", "scan"];

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSplit {
    name: String,
    conditions: Vec<(String, Value)>,
}

impl ExportSplit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
        }
    }

    /// Require `structure[field] == value`
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| record.structure.get(field) == Some(value))
    }

    /// Destination the split's shards are written under
    pub fn destination(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.name)
    }

    /// One `compatible_{functional}` split per functional, then `non_compatible`
    pub fn by_functional() -> Vec<ExportSplit> {
        SPLIT_FUNCTIONALS
            .iter()
            .map(|functional| {
                ExportSplit::new(format!("compatible_{functional}"))
                    .with("functional", *functional)
                    .with("cross_compatibility", true)
            })
            .chain(std::iter::once(
                ExportSplit::new("non_compatible").with("cross_compatibility", false),
            ))
            .collect()
    }

    /// Look up one of [`ExportSplit::by_functional`] by name
    pub fn named(name: &str) -> Result<ExportSplit, ConfigError> {
        Self::by_functional()
            .into_iter()
            .find(|split| split.name == name)
            .ok_or_else(|| ConfigError::invalid("split", format!("unknown split '{name}'")))
    }
}
