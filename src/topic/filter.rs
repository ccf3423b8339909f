//! Attribute filters for subscriptions.

use crate::types::{EventKind, KIND_ATTRIBUTE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One `(attribute, allowed values)` requirement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub allowed: BTreeSet<String>,
}

impl Constraint {
    fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        attributes
            .get(&self.attribute)
            .map_or(false, |value| self.allowed.contains(value))
    }
}

/// Filter criteria for a subscription.
///
/// An event matches when every constraint's attribute is present with one of
/// the allowed values. No constraints means everything matches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    constraints: Vec<Constraint>,
}

impl Filter {
    /// Match every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `attribute` to take one of `values`.
    pub fn attribute_in<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::all().and(attribute, values)
    }

    /// Match events of the given kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::attribute_in(KIND_ATTRIBUTE, kinds.into_iter().map(|k| k.as_str()))
    }

    /// Add another constraint.
    #[must_use]
    pub fn and<I, S>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints.push(Constraint {
            attribute: attribute.into(),
            allowed: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn is_unconditional(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Check an event's attributes against this filter.
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        self.constraints.iter().all(|c| c.matches(attributes))
    }
}
