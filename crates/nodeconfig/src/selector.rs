//! Label selectors: a conjunction of match expressions over node labels.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("requirement for key {0:?}: operator {1:?} needs at least one value")]
    MissingValues(String, SelectorOperator),

    #[error("requirement for key {0:?}: operator {1:?} takes no values")]
    UnexpectedValues(String, SelectorOperator),

    #[error("requirement has an empty key")]
    EmptyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    pub fn new(key: &str, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }

    fn canonical(&self) -> String {
        let values: BTreeSet<&str> = self.values.iter().map(String::as_str).collect();
        let values = values.into_iter().collect::<Vec<_>>().join(",");
        match self.operator {
            SelectorOperator::In => format!("{} in ({})", self.key, values),
            SelectorOperator::NotIn => format!("{} notin ({})", self.key, values),
            SelectorOperator::Exists => self.key.clone(),
            SelectorOperator::DoesNotExist => format!("!{}", self.key),
        }
    }

    fn validate(&self) -> Result<(), SelectorError> {
        if self.key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn if self.values.is_empty() => {
                Err(SelectorError::MissingValues(self.key.clone(), self.operator))
            }
            SelectorOperator::Exists | SelectorOperator::DoesNotExist if !self.values.is_empty() => {
                Err(SelectorError::UnexpectedValues(self.key.clone(), self.operator))
            }
            _ => Ok(()),
        }
    }
}

/// Empty selector matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSelector(pub Vec<SelectorRequirement>);

impl NodeSelector {
    pub fn new(requirements: Vec<SelectorRequirement>) -> Self {
        Self(requirements)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn requirements(&self) -> &[SelectorRequirement] {
        &self.0
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| r.matches(labels))
    }

    /// Order-independent string form: requirements sorted, values sorted
    /// and deduplicated. Two selectors with the same canonical string
    /// select the same nodes.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self.0.iter().map(SelectorRequirement::canonical).collect();
        parts.sort();
        parts.dedup();
        parts.join(",")
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        self.0.iter().try_for_each(SelectorRequirement::validate)
    }
}
