//! Label selector evaluation against a node's labels.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unsupported selector operator {0:?}")]
    UnsupportedOperator(String),

    #[error("operator {operator} on key {key:?} requires values")]
    MissingValues { key: String, operator: String },
}

/// Evaluate `selector` against `labels`.
///
/// A missing selector matches nothing, an empty one matches everything.
pub fn label_selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let Some(selector) = selector else {
        return Ok(false);
    };

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        if !requirement_matches(requirement, labels)? {
            return Ok(false);
        }
    }

    Ok(true)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let values = requirement.values.as_deref().unwrap_or_default();
    let current = labels.get(&requirement.key);

    let require_values = || {
        if values.is_empty() {
            Err(SelectorError::MissingValues {
                key: requirement.key.clone(),
                operator: requirement.operator.clone(),
            })
        } else {
            Ok(())
        }
    };

    match requirement.operator.as_str() {
        "In" => {
            require_values()?;
            Ok(current.is_some_and(|v| values.contains(v)))
        }
        "NotIn" => {
            require_values()?;
            Ok(current.is_none_or(|v| !values.contains(v)))
        }
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        other => Err(SelectorError::UnsupportedOperator(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_missing_selector_matches_nothing() {
        assert_eq!(label_selector_matches(None, &labels(&[("a", "b")])), Ok(false));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert_eq!(label_selector_matches(Some(&selector), &labels(&[])), Ok(true));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("mock", "true")])),
            ..Default::default()
        };
        let node = labels(&[("mock", "true"), ("zone", "a")]);
        assert_eq!(label_selector_matches(Some(&selector), &node), Ok(true));
        let node = labels(&[("mock", "false")]);
        assert_eq!(label_selector_matches(Some(&selector), &node), Ok(false));
    }

    #[test]
    fn test_match_expressions() {
        let node = labels(&[("zone", "a"), ("gpu", "yes")]);
        let check = |e: LabelSelectorRequirement| {
            let selector = LabelSelector {
                match_expressions: Some(vec![e]),
                ..Default::default()
            };
            label_selector_matches(Some(&selector), &node)
        };

        assert_eq!(check(expr("zone", "In", &["a", "b"])), Ok(true));
        assert_eq!(check(expr("zone", "In", &["c"])), Ok(false));
        assert_eq!(check(expr("zone", "NotIn", &["c"])), Ok(true));
        assert_eq!(check(expr("missing", "NotIn", &["c"])), Ok(true));
        assert_eq!(check(expr("gpu", "Exists", &[])), Ok(true));
        assert_eq!(check(expr("gpu", "DoesNotExist", &[])), Ok(false));
        assert_eq!(
            check(expr("zone", "Gt", &["1"])),
            Err(SelectorError::UnsupportedOperator("Gt".to_string()))
        );
        assert!(matches!(
            check(expr("zone", "In", &[])),
            Err(SelectorError::MissingValues { .. })
        ));
    }
}
