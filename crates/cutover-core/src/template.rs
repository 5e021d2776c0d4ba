//! `{{name}}` template resolution
//!
//! Placeholders resolve from a member's data snapshot plus the reserved names
//! `_batch_id` and `_batch_start_time`. Resolution is all-or-nothing per call:
//! every unresolved name is accumulated and reported in one typed error so the
//! caller can log the full list and skip the member.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Reserved placeholder: the owning batch's integer id
pub const BATCH_ID: &str = "_batch_id";

/// Reserved placeholder: the owning batch's start time, ISO-8601
pub const BATCH_START_TIME: &str = "_batch_start_time";

/// Resolution context: batch scope plus an optional member snapshot
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    batch_id: i64,
    batch_start_time: DateTime<Utc>,
    member: Option<&'a serde_json::Map<String, Value>>,
}

impl<'a> TemplateContext<'a> {
    /// Context with only the reserved names (init steps, rollbacks without a
    /// member in scope)
    pub fn batch_scoped(batch_id: i64, batch_start_time: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            batch_start_time,
            member: None,
        }
    }

    /// Context carrying a member's data snapshot
    pub fn for_member(
        batch_id: i64,
        batch_start_time: DateTime<Utc>,
        member: &'a serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            batch_id,
            batch_start_time,
            member: Some(member),
        }
    }

    /// Look up a placeholder name. Reserved names win; member columns are
    /// matched case-sensitively. Null columns substitute to the empty string.
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            BATCH_ID => Some(self.batch_id.to_string()),
            BATCH_START_TIME => Some(
                self.batch_start_time
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            _ => self.member.and_then(|m| m.get(name)).map(value_to_string),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute every `{{name}}` in `template`.
///
/// Returns the resolved string, or an error naming every placeholder that did
/// not resolve. Text outside placeholders passes through untouched; a `{{`
/// without a closing `}}` is treated as literal text.
pub fn resolve(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut missing: Vec<String> = Vec::new();
    scan(template, |part| match part {
        Part::Literal(text) => out.push_str(text),
        Part::Placeholder(name) => match ctx.lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
            }
        },
    });

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(CoreError::UnresolvedPlaceholders {
            template: template.to_string(),
            names: missing,
        })
    }
}

/// Resolve every value of a parameter map.
///
/// Unresolved names are accumulated across all values and reported in a
/// single error so a member with several bad parameters is logged once.
pub fn resolve_map(
    params: &BTreeMap<String, String>,
    ctx: &TemplateContext<'_>,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    let mut missing: Vec<String> = Vec::new();
    let mut failed_template = String::new();

    for (key, value) in params {
        match resolve(value, ctx) {
            Ok(v) => {
                resolved.insert(key.clone(), v);
            }
            Err(CoreError::UnresolvedPlaceholders { template, names }) => {
                for name in names {
                    if !missing.iter().any(|m| m == &name) {
                        missing.push(name);
                    }
                }
                if failed_template.is_empty() {
                    failed_template = template;
                }
            }
            Err(other) => return Err(other),
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(CoreError::UnresolvedPlaceholders {
            template: failed_template,
            names: missing,
        })
    }
}

/// Every placeholder name appearing in `template`, in order of first use.
pub fn placeholder_names(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    scan(template, |part| {
        if let Part::Placeholder(name) = part {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    });
    names
}

enum Part<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Left-to-right scan splitting a template into literals and placeholders
fn scan<'a>(template: &'a str, mut emit: impl FnMut(Part<'a>)) {
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        match rest[open + 2..].find("}}") {
            Some(close) => {
                if open > 0 {
                    emit(Part::Literal(&rest[..open]));
                }
                emit(Part::Placeholder(&rest[open + 2..open + 2 + close]));
                rest = &rest[open + 2 + close + 2..];
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        emit(Part::Literal(rest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member() -> serde_json::Map<String, Value> {
        json!({
            "user_id": "u-42",
            "email": "a@example.com",
            "region": null,
            "quota": 25,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_member_substitution() {
        let m = member();
        let ctx = TemplateContext::for_member(7, Utc::now(), &m);
        assert_eq!(
            resolve("id={{user_id}} mail={{email}}", &ctx).unwrap(),
            "id=u-42 mail=a@example.com"
        );
    }

    #[test]
    fn test_reserved_names() {
        let start = "2026-03-01T12:00:00Z".parse().unwrap();
        let ctx = TemplateContext::batch_scoped(99, start);
        assert_eq!(resolve("{{_batch_id}}", &ctx).unwrap(), "99");
        assert_eq!(
            resolve("{{_batch_start_time}}", &ctx).unwrap(),
            "2026-03-01T12:00:00Z"
        );
    }

    #[test]
    fn test_null_becomes_empty() {
        let m = member();
        let ctx = TemplateContext::for_member(1, Utc::now(), &m);
        assert_eq!(resolve("r=[{{region}}]", &ctx).unwrap(), "r=[]");
    }

    #[test]
    fn test_non_string_values_stringified() {
        let m = member();
        let ctx = TemplateContext::for_member(1, Utc::now(), &m);
        assert_eq!(resolve("{{quota}}", &ctx).unwrap(), "25");
    }

    #[test]
    fn test_unresolved_collected() {
        let m = member();
        let ctx = TemplateContext::for_member(1, Utc::now(), &m);
        let err = resolve("{{user_id}} {{nope}} {{also_nope}}", &ctx).unwrap_err();
        match err {
            CoreError::UnresolvedPlaceholders { names, .. } => {
                assert_eq!(names, vec!["nope".to_string(), "also_nope".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_batch_scope_rejects_member_columns() {
        let ctx = TemplateContext::batch_scoped(1, Utc::now());
        assert!(resolve("{{user_id}}", &ctx).is_err());
        assert!(resolve("{{_batch_id}}", &ctx).is_ok());
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let m = member();
        let ctx = TemplateContext::for_member(1, Utc::now(), &m);
        assert_eq!(resolve("tail {{oops", &ctx).unwrap(), "tail {{oops");
    }

    #[test]
    fn test_resolve_map_accumulates_across_values() {
        let m = member();
        let ctx = TemplateContext::for_member(1, Utc::now(), &m);
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), "{{missing_one}}".to_string());
        params.insert("b".to_string(), "{{user_id}}".to_string());
        params.insert("c".to_string(), "{{missing_two}}".to_string());

        let err = resolve_map(&params, &ctx).unwrap_err();
        match err {
            CoreError::UnresolvedPlaceholders { names, .. } => {
                assert!(names.contains(&"missing_one".to_string()));
                assert!(names.contains(&"missing_two".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(
            placeholder_names("{{a}}-{{b}}-{{a}}"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(placeholder_names("no placeholders").is_empty());
    }
}
