//! Label selector evaluation
//!
//! Evaluates `metav1.LabelSelector` against a label set locally, and renders
//! it to the query string the API server understands for server-side lists.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

/// True when the selector has neither `matchLabels` nor `matchExpressions`.
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .as_ref()
        .map(BTreeMap::is_empty)
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(Vec::is_empty)
            .unwrap_or(true)
}

/// Evaluate a selector against a label set.
///
/// An empty selector matches everything; callers that need "empty matches
/// nothing" semantics check [`is_empty`] first. Requirements with an unknown
/// operator never match.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    labels_match
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => labels
            .get(&req.key)
            .map(|v| values.contains(v))
            .unwrap_or(false),
        "NotIn" => labels
            .get(&req.key)
            .map(|v| !values.contains(v))
            .unwrap_or(true),
        "Exists" => labels.contains_key(&req.key),
        "DoesNotExist" => !labels.contains_key(&req.key),
        _ => false,
    }
}

/// Render a selector as an API label query, e.g. `a=b,tier in (x,y),!legacy`.
pub fn to_query(selector: &LabelSelector) -> Result<String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.clone().unwrap_or_default().join(",");
        let part = match req.operator.as_str() {
            "In" => format!("{} in ({values})", req.key),
            "NotIn" => format!("{} notin ({values})", req.key),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            other => {
                return Err(Error::Invalid(format!(
                    "unsupported label selector operator {other:?} for key {}",
                    req.key
                )))
            }
        };
        parts.push(part);
    }

    Ok(parts.join(","))
}

/// Build a selector that matches exactly the given labels.
pub fn from_labels(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels.clone()),
        match_expressions: None,
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

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test]
    fn test_match_labels() {
        let selector = from_labels(&labels(&[("app", "worker")]));
        assert!(matches(&selector, &labels(&[("app", "worker"), ("x", "y")])));
        assert!(!matches(&selector, &labels(&[("app", "master")])));
        assert!(!matches(&selector, &labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("zone", "In", &["a", "b"]),
                requirement("legacy", "DoesNotExist", &[]),
                requirement("tier", "NotIn", &["frontend"]),
            ]),
        };

        assert!(matches(&selector, &labels(&[("zone", "a")])));
        assert!(matches(&selector, &labels(&[("zone", "b"), ("tier", "backend")])));
        assert!(!matches(&selector, &labels(&[("zone", "c")])));
        assert!(!matches(&selector, &labels(&[("zone", "a"), ("legacy", "1")])));
        assert!(!matches(&selector, &labels(&[("zone", "a"), ("tier", "frontend")])));
    }

    #[test]
    fn test_empty_selector() {
        let selector = LabelSelector::default();
        assert!(is_empty(&selector));
        assert!(matches(&selector, &labels(&[("anything", "goes")])));

        let empty_map = LabelSelector {
            match_labels: Some(BTreeMap::new()),
            match_expressions: Some(vec![]),
        };
        assert!(is_empty(&empty_map));
    }

    #[test]
    fn test_unknown_operator() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("zone", "Gt", &["1"])]),
        };
        assert!(!matches(&selector, &labels(&[("zone", "2")])));
        assert!(to_query(&selector).is_err());
    }

    #[test]
    fn test_to_query() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "worker")])),
            match_expressions: Some(vec![
                requirement("zone", "In", &["a", "b"]),
                requirement("legacy", "DoesNotExist", &[]),
                requirement("gpu", "Exists", &[]),
            ]),
        };
        assert_eq!(
            to_query(&selector).unwrap(),
            "app=worker,zone in (a,b),!legacy,gpu"
        );
    }
}
