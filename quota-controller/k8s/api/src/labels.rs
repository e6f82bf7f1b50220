use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of namespaces by their labels.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("operator {operator:?} on key {key:?} requires at least one value")]
    MissingValues { key: String, operator: Operator },

    #[error("operator {operator:?} on key {key:?} must not have values")]
    UnexpectedValues { key: String, operator: Operator },
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }

    /// Checks that every expression's values agree with its operator.
    pub fn validate(&self) -> Result<(), SelectorError> {
        for expr in self.match_expressions.iter().flatten() {
            expr.validate()?;
        }
        Ok(())
    }

    /// All label keys referenced by this selector.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.match_labels
            .iter()
            .flat_map(|m| m.keys())
            .chain(self.match_expressions.iter().flatten().map(|e| &e.key))
            .map(String::as_str)
    }

    /// All label values referenced by this selector.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.match_labels
            .iter()
            .flat_map(|m| m.values())
            .chain(
                self.match_expressions
                    .iter()
                    .flatten()
                    .flat_map(|e| e.values.iter()),
            )
            .map(String::as_str)
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl Labels {
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl ToString,
        operator: Operator,
        values: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }

    fn validate(&self) -> Result<(), SelectorError> {
        match self.operator {
            Operator::In | Operator::NotIn if self.values.is_empty() => {
                Err(SelectorError::MissingValues {
                    key: self.key.clone(),
                    operator: self.operator.clone(),
                })
            }
            Operator::Exists | Operator::DoesNotExist if !self.values.is_empty() => {
                Err(SelectorError::UnexpectedValues {
                    key: self.key.clone(),
                    operator: self.operator.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "label value mismatch",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::In, ["bar"]))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::NotIn, ["bar"]))),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "excluded value",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::NotIn, ["bar"]))),
                Labels::default(),
                true,
                "missing key satisfies NotIn",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "team",
                    Operator::Exists,
                    None::<&str>,
                ))),
                Labels::from_iter(Some(("team", ""))),
                true,
                "exists with empty value",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "team",
                    Operator::DoesNotExist,
                    None::<&str>,
                ))),
                Labels::from_iter(Some(("team", "a"))),
                false,
                "does not exist",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn validates_expression_values() {
        assert!(Selector::default().validate().is_ok());
        assert_eq!(
            Selector::from_iter(Some(Expression::new("a", Operator::In, None::<&str>)))
                .validate(),
            Err(SelectorError::MissingValues {
                key: "a".to_string(),
                operator: Operator::In
            })
        );
        assert_eq!(
            Selector::from_iter(Some(Expression::new("a", Operator::Exists, ["x"]))).validate(),
            Err(SelectorError::UnexpectedValues {
                key: "a".to_string(),
                operator: Operator::Exists
            })
        );
    }

    #[test]
    fn deserializes_label_selector() {
        let selector: Selector = serde_json::from_value(serde_json::json!({
            "matchLabels": { "team": "a" },
            "matchExpressions": [
                { "key": "env", "operator": "In", "values": ["prod", "staging"] },
                { "key": "legacy", "operator": "DoesNotExist" },
            ],
        }))
        .unwrap();
        assert!(selector.matches(&Labels::from_iter(vec![("team", "a"), ("env", "prod")])));
        assert!(!selector.matches(&Labels::from_iter(vec![
            ("team", "a"),
            ("env", "prod"),
            ("legacy", "true"),
        ])));
        assert_eq!(
            selector.keys().collect::<Vec<_>>(),
            vec!["team", "env", "legacy"]
        );
    }
}
