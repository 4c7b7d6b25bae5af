//! Compiled label selectors.
//!
//! A `LabelSelector` is compiled into a sorted list of requirements with a
//! canonical string rendering. The rendering doubles as the selector's
//! deduplication key, so it must be deterministic: requirements are ordered
//! by key, then operator, then values, and `in`/`notin` values are sorted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use rampart_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Operator {
    Equals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

impl Requirement {
    fn from_expression(expr: &LabelSelectorRequirement) -> Result<Self> {
        let operator = match expr.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            other => {
                return Err(Error::Selector(format!(
                    "unknown operator {:?} for key {:?}",
                    other, expr.key
                )))
            }
        };

        let mut values = expr.values.clone().unwrap_or_default();
        match operator {
            Operator::In | Operator::NotIn => {
                if values.is_empty() {
                    return Err(Error::Selector(format!(
                        "operator {:?} for key {:?} requires values",
                        expr.operator, expr.key
                    )));
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !values.is_empty() {
                    return Err(Error::Selector(format!(
                        "operator {:?} for key {:?} admits no values",
                        expr.operator, expr.key
                    )));
                }
            }
            Operator::Equals => unreachable!(),
        }
        values.sort();
        values.dedup();

        Ok(Self {
            key: expr.key.clone(),
            operator,
            values,
        })
    }

    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let value = labels.and_then(|l| l.get(&self.key));
        match self.operator {
            Operator::Equals | Operator::In => {
                value.map_or(false, |v| self.values.iter().any(|w| w == v))
            }
            Operator::NotIn => value.map_or(true, |v| self.values.iter().all(|w| w != v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A compiled label-match predicate.
///
/// The empty selector matches everything and renders as the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    requirements: Vec<Requirement>,
    canonical: String,
}

impl LabelMatcher {
    pub fn compile(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();

        if let Some(labels) = &selector.match_labels {
            for (key, value) in labels {
                requirements.push(Requirement {
                    key: key.clone(),
                    operator: Operator::Equals,
                    values: vec![value.clone()],
                });
            }
        }

        if let Some(expressions) = &selector.match_expressions {
            for expr in expressions {
                requirements.push(Requirement::from_expression(expr)?);
            }
        }

        requirements.sort();

        let canonical = requirements
            .iter()
            .map(Requirement::to_string)
            .collect::<Vec<_>>()
            .join(",");

        Ok(Self {
            requirements,
            canonical,
        })
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// The canonical rendering, used as the deduplication key.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}
