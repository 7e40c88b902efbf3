//! Declarative field validation for action payloads.
//!
//! Rules are checked in declaration order and validation of a field stops at
//! its first failing rule. A missing optional field skips its remaining
//! rules. Rules can be built directly or parsed from pipe-separated strings
//! such as `"required|string|max:255"`.

use crate::error::ValidationErrors;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// JSON kinds a `type` rule can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Integer,
    Numeric,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Numeric => {
                value.is_number()
                    || value
                        .as_str()
                        .map(|s| s.trim().parse::<f64>().is_ok())
                        .unwrap_or(false)
            }
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Numeric => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        f.write_str(name)
    }
}

/// A single validation rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Required,
    Type(ValueType),
    /// Minimum string length, array size or numeric value
    Min(f64),
    /// Maximum string length, array size or numeric value
    Max(f64),
    In(Vec<String>),
    Uuid,
    Email,
    Url,
}

/// A rule string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown validation rule '{0}'")]
pub struct UnknownRule(pub String);

impl FromStr for Rule {
    type Err = UnknownRule;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let (name, arg) = match spec.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (spec, None),
        };
        let bound = |arg: Option<&str>| {
            arg.and_then(|a| a.trim().parse::<f64>().ok())
                .ok_or_else(|| UnknownRule(spec.to_string()))
        };
        let rule = match name {
            "required" => Rule::Required,
            "string" => Rule::Type(ValueType::String),
            "integer" | "int" => Rule::Type(ValueType::Integer),
            "numeric" | "number" => Rule::Type(ValueType::Numeric),
            "boolean" | "bool" => Rule::Type(ValueType::Boolean),
            "array" => Rule::Type(ValueType::Array),
            "object" => Rule::Type(ValueType::Object),
            "min" => Rule::Min(bound(arg)?),
            "max" => Rule::Max(bound(arg)?),
            "in" => Rule::In(
                arg.unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            "uuid" => Rule::Uuid,
            "email" => Rule::Email,
            "url" => Rule::Url,
            _ => return Err(UnknownRule(spec.to_string())),
        };
        Ok(rule)
    }
}

/// `None` only if the pattern fails to compile; the rule then rejects.
fn email_pattern() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// Size used by min/max: string length, array length or the number itself.
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn unit(value: &Value) -> &'static str {
    match value {
        Value::String(_) => " characters",
        Value::Array(_) => " items",
        _ => "",
    }
}

fn display_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as i64)
    } else {
        bound.to_string()
    }
}

impl Rule {
    /// Check one present, non-null value. Returns a message on failure.
    fn check(&self, field: &str, value: &Value) -> Option<String> {
        match self {
            Rule::Required => None,
            Rule::Type(kind) => (!kind.matches(value))
                .then(|| format!("The {field} field must be a {kind}.")),
            Rule::Min(min) => match measure(value) {
                Some(size) if size < *min => Some(format!(
                    "The {field} field must be at least {}{}.",
                    display_bound(*min),
                    unit(value)
                )),
                _ => None,
            },
            Rule::Max(max) => match measure(value) {
                Some(size) if size > *max => Some(format!(
                    "The {field} field must not be greater than {}{}.",
                    display_bound(*max),
                    unit(value)
                )),
                _ => None,
            },
            Rule::In(allowed) => {
                let candidate = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (!allowed.contains(&candidate))
                    .then(|| format!("The selected {field} is invalid."))
            }
            Rule::Uuid => {
                let valid = value
                    .as_str()
                    .map(|s| uuid::Uuid::parse_str(s).is_ok())
                    .unwrap_or(false);
                (!valid).then(|| format!("The {field} field must be a valid UUID."))
            }
            Rule::Email => {
                let valid = value
                    .as_str()
                    .zip(email_pattern())
                    .is_some_and(|(s, pattern)| pattern.is_match(s));
                (!valid).then(|| format!("The {field} field must be a valid email address."))
            }
            Rule::Url => {
                let valid = value
                    .as_str()
                    .and_then(|s| url::Url::parse(s).ok())
                    .map(|u| u.has_host())
                    .unwrap_or(false);
                (!valid).then(|| format!("The {field} field must be a valid URL."))
            }
        }
    }
}

/// Rules per field for one payload shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRules {
    fields: BTreeMap<String, Vec<Rule>>,
}

impl FieldRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to add rules for a field.
    pub fn field(mut self, name: impl Into<String>, rules: Vec<Rule>) -> Self {
        self.fields.insert(name.into(), rules);
        self
    }

    /// Builder-style method to add rules parsed from a pipe string.
    pub fn parse_field(self, name: impl Into<String>, spec: &str) -> Result<Self, UnknownRule> {
        let rules = spec
            .split('|')
            .filter(|s| !s.trim().is_empty())
            .map(Rule::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.field(name, rules))
    }

    /// Validate a payload.
    ///
    /// With `partial` set, `required` is not enforced on absent fields, which
    /// is what updates carrying only changed columns need.
    pub fn validate(&self, data: &Value, partial: bool) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for (field, rules) in &self.fields {
            let value = data.get(field);
            let required = rules.contains(&Rule::Required);

            if is_blank(value) {
                let absent = value.is_none();
                if required && !(partial && absent) {
                    errors.add(field, format!("The {field} field is required."));
                }
                continue;
            }

            let Some(value) = value else { continue };
            for rule in rules {
                if let Some(message) = rule.check(field, value) {
                    errors.add(field, message);
                    break;
                }
            }
        }
        errors
    }
}

/// Rules for every table an action may touch, plus action-level data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSchema {
    tables: BTreeMap<String, FieldRules>,
    action: Option<FieldRules>,
}

impl ValidationSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to set rules for a table's records.
    pub fn table(mut self, name: impl Into<String>, rules: FieldRules) -> Self {
        self.tables.insert(name.into(), rules);
        self
    }

    /// Builder-style method to set rules for action-level data.
    pub fn action_data(mut self, rules: FieldRules) -> Self {
        self.action = Some(rules);
        self
    }

    pub fn rules_for(&self, table: &str) -> Option<&FieldRules> {
        self.tables.get(table)
    }

    pub fn action_rules(&self) -> Option<&FieldRules> {
        self.action.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_rules() -> FieldRules {
        FieldRules::new()
            .parse_field("title", "required|string|min:3|max:20")
            .unwrap()
            .parse_field("status", "in:open,done")
            .unwrap()
            .parse_field("owner_email", "email")
            .unwrap()
    }

    #[test]
    fn valid_payload() {
        let errors = todo_rules().validate(
            &json!({"title": "Buy milk", "status": "open", "owner_email": "a@b.io"}),
            false,
        );
        assert!(errors.is_empty(), "{errors}");
    }

    #[test]
    fn required_short_circuits() {
        let errors = todo_rules().validate(&json!({"title": ""}), false);
        assert_eq!(
            errors.get("title").unwrap(),
            &["The title field is required.".to_string()]
        );
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn stops_at_first_failing_rule() {
        let errors = todo_rules().validate(&json!({"title": 42}), false);
        assert_eq!(
            errors.get("title").unwrap(),
            &["The title field must be a string.".to_string()]
        );
    }

    #[test]
    fn accumulates_across_fields() {
        let errors = todo_rules().validate(
            &json!({"title": "ab", "status": "archived", "owner_email": "nope"}),
            false,
        );
        assert_eq!(errors.len(), 3);
        assert_eq!(
            errors.get("title").unwrap()[0],
            "The title field must be at least 3 characters."
        );
        assert_eq!(errors.get("status").unwrap()[0], "The selected status is invalid.");
    }

    #[test]
    fn partial_skips_absent_required() {
        let rules = todo_rules();
        assert!(rules.validate(&json!({"status": "done"}), true).is_empty());
        assert!(!rules.validate(&json!({"title": null}), true).is_empty());
    }

    #[test]
    fn numeric_bounds_uuid_url() {
        let rules = FieldRules::new()
            .field("count", vec![Rule::Type(ValueType::Integer), Rule::Max(10.0)])
            .field("ref", vec![Rule::Uuid])
            .field("link", vec![Rule::Url]);

        let ok = rules.validate(
            &json!({
                "count": 10,
                "ref": "67e55044-10b1-426f-9247-bb680e5fe0c8",
                "link": "https://example.com/a"
            }),
            false,
        );
        assert!(ok.is_empty(), "{ok}");

        let bad = rules.validate(
            &json!({"count": 11, "ref": "123", "link": "not a url"}),
            false,
        );
        assert_eq!(bad.len(), 3);
        assert_eq!(
            bad.get("count").unwrap()[0],
            "The count field must not be greater than 10."
        );
    }

    #[test]
    fn email_rule() {
        assert!(email_pattern().is_some());
        let rules = FieldRules::new().field("contact", vec![Rule::Email]);
        assert!(rules.validate(&json!({"contact": "ops@example.com"}), false).is_empty());
        for bad in [json!("ops@example"), json!("two words@x.io"), json!(7)] {
            let errors = rules.validate(&json!({ "contact": bad }), false);
            assert_eq!(
                errors.get("contact").unwrap()[0],
                "The contact field must be a valid email address."
            );
        }
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            Rule::from_str("min:abc"),
            Err(UnknownRule("min:abc".into()))
        );
        assert!(Rule::from_str("unique:users").is_err());
        assert_eq!(
            Rule::from_str("in:a, b"),
            Ok(Rule::In(vec!["a".into(), "b".into()]))
        );
    }
}
