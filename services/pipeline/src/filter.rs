//! Subscription filter policies.
//!
//! A subscription can narrow what it receives from a topic with a declarative
//! policy instead of filtering inside the consumer. Policies are plain data,
//! so they can also be loaded from configuration.

use crate::event::TopicMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a filter rule reads its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterScope {
    /// The flat routing attributes attached to the message
    MessageAttributes,
    /// The structured payload, addressed by a dotted path
    MessageBody,
}

/// A single allowlist rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub scope: FilterScope,
    /// Attribute name, or dotted path into the body
    pub path: String,
    /// Values the addressed field may take
    pub allowlist: Vec<String>,
}

impl FilterRule {
    pub fn attribute(
        path: impl Into<String>,
        allowlist: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            scope: FilterScope::MessageAttributes,
            path: path.into(),
            allowlist: allowlist.into_iter().map(Into::into).collect(),
        }
    }

    pub fn body(
        path: impl Into<String>,
        allowlist: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            scope: FilterScope::MessageBody,
            path: path.into(),
            allowlist: allowlist.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the message satisfies this rule
    pub fn matches(&self, message: &TopicMessage) -> bool {
        match self.scope {
            FilterScope::MessageAttributes => message
                .attribute(&self.path)
                .map(|value| self.allowlist.iter().any(|allowed| allowed == value))
                .unwrap_or(false),
            FilterScope::MessageBody => {
                let segments: Vec<&str> = self.path.split('.').collect();
                value_matches(&message.body, &segments, &self.allowlist)
            }
        }
    }
}

/// Conjunction of [`FilterRule`]s evaluated against one message.
///
/// Every rule must match for the policy to match; a rule matches when the
/// addressed field equals any allowlist entry. A policy with no rules matches
/// every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterPolicy {
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl FilterPolicy {
    /// A policy that lets every message through
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn matches(&self, message: &TopicMessage) -> bool {
        self.rules.iter().all(|rule| rule.matches(message))
    }
}

/// Walk `segments` into `value`, comparing the leaf against the allowlist.
///
/// Arrays are transparent: at any depth the rule matches if any element
/// matches the remaining path.
fn value_matches(value: &Value, segments: &[&str], allowlist: &[String]) -> bool {
    if let Value::Array(items) = value {
        return items.iter().any(|item| value_matches(item, segments, allowlist));
    }

    match segments.split_first() {
        None => leaf_matches(value, allowlist),
        Some((head, rest)) => match value {
            Value::Object(fields) => fields
                .get(*head)
                .map(|nested| value_matches(nested, rest, allowlist))
                .unwrap_or(false),
            _ => false,
        },
    }
}

/// Scalars compare by their string form; objects never match an allowlist.
fn leaf_matches(value: &Value, allowlist: &[String]) -> bool {
    match value {
        Value::String(text) => allowlist.iter().any(|allowed| allowed == text),
        Value::Number(number) => {
            let text = number.to_string();
            allowlist.iter().any(|allowed| *allowed == text)
        }
        Value::Bool(flag) => {
            let text = flag.to_string();
            allowlist.iter().any(|allowed| *allowed == text)
        }
        _ => false,
    }
}
