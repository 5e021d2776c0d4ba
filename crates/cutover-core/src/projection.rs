//! SELECT-list projection parsing
//!
//! The dynamic table's schema mirrors the output columns of a runbook's data
//! source query, so the SELECT list is parsed once at publish time. Only the
//! output names are needed: `expr AS name` yields `name`, `table.col` yields
//! `col`, and `[bracketed]` identifiers are unwrapped. Commas inside
//! parentheses and string literals do not split columns.

use crate::error::{CoreError, Result};

/// Extract the output column names of `query`'s SELECT list.
pub fn select_columns(query: &str) -> Result<Vec<String>> {
    let list = select_list(query)?;
    let items = split_top_level(list);
    if items.is_empty() {
        return Err(CoreError::InvalidProjection(
            "empty SELECT list".to_string(),
        ));
    }

    let mut columns = Vec::with_capacity(items.len());
    for item in items {
        let name = output_name(item)?;
        columns.push(name);
    }
    Ok(columns)
}

/// Slice of the query between SELECT and its matching top-level FROM
fn select_list(query: &str) -> Result<&str> {
    let lower = query.to_ascii_lowercase();
    let select = find_keyword(&lower, "select", 0).ok_or_else(|| {
        CoreError::InvalidProjection("query has no SELECT".to_string())
    })?;
    let list_start = select + "select".len();

    // FROM must be at parenthesis depth zero relative to the list start so a
    // subquery's FROM is not mistaken for the outer one.
    let mut depth = 0isize;
    let mut search_from = list_start;
    loop {
        let from = find_keyword(&lower, "from", search_from).ok_or_else(|| {
            CoreError::InvalidProjection("query has no FROM".to_string())
        })?;
        depth += paren_depth_delta(&query[search_from..from]);
        if depth <= 0 {
            let mut list = query[list_start..from].trim();
            // DISTINCT / TOP n prefixes are not part of the first column
            if let Some(rest) = strip_leading_keyword(list, "distinct") {
                list = rest;
            }
            return Ok(list);
        }
        search_from = from + "from".len();
    }
}

fn strip_leading_keyword<'a>(list: &'a str, keyword: &str) -> Option<&'a str> {
    let trimmed = list.trim_start();
    let head = trimmed.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword)
        && trimmed[keyword.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace())
    {
        Some(trimmed[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Find `keyword` as a standalone word (ASCII boundaries) at or after `start`
fn find_keyword(lower: &str, keyword: &str, start: usize) -> Option<usize> {
    let mut at = start;
    while let Some(found) = lower[at..].find(keyword) {
        let pos = at + found;
        let before_ok = pos == 0
            || !lower.as_bytes()[pos - 1].is_ascii_alphanumeric()
                && lower.as_bytes()[pos - 1] != b'_';
        let after = pos + keyword.len();
        let after_ok = after >= lower.len()
            || !lower.as_bytes()[after].is_ascii_alphanumeric()
                && lower.as_bytes()[after] != b'_';
        if before_ok && after_ok {
            return Some(pos);
        }
        at = pos + keyword.len();
    }
    None
}

fn paren_depth_delta(segment: &str) -> isize {
    let mut depth = 0isize;
    for c in segment.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Split a SELECT list on commas at parenthesis depth zero, outside quotes
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in list.char_indices() {
        match (in_quote, c) {
            (Some(q), _) if c == q => in_quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => in_quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                let item = list[start..i].trim();
                if !item.is_empty() {
                    items.push(item);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = list[start..].trim();
    if !tail.is_empty() {
        items.push(tail);
    }
    items
}

/// Output name of one SELECT-list item
fn output_name(item: &str) -> Result<String> {
    if item == "*" || item.ends_with(".*") {
        return Err(CoreError::InvalidProjection(
            "SELECT * projections are not supported; name the output columns".to_string(),
        ));
    }

    // `expr AS name` wins when the AS sits at depth zero
    let lower = item.to_ascii_lowercase();
    if let Some(as_pos) = rfind_top_level_as(&lower) {
        return Ok(unwrap_identifier(item[as_pos + 4..].trim()));
    }

    // Bare column reference: last path segment of `table.col`
    let tail = item.rsplit('.').next().unwrap_or(item).trim();
    let name = unwrap_identifier(tail);
    if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '(') {
        return Err(CoreError::InvalidProjection(format!(
            "cannot derive an output name from {item:?}; add an AS alias"
        )));
    }
    Ok(name)
}

/// Last ` as ` at parenthesis depth zero, or None
fn rfind_top_level_as(lower: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut found = None;
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'a' | b'A'
                if depth == 0
                    && i > 0
                    && bytes[i - 1].is_ascii_whitespace()
                    && lower[i..].starts_with("as")
                    && lower[i + 2..].chars().next().is_some_and(|c| c.is_whitespace()) =>
            {
                found = Some(i - 1);
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Strip `[name]`, `"name"`, and `` `name` `` wrappers
fn unwrap_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    let unwrapped = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .or_else(|| trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .or_else(|| trimmed.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .unwrap_or(trimmed);
    unwrapped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_columns() {
        let cols = select_columns("SELECT user_id, email FROM users").unwrap();
        assert_eq!(cols, vec!["user_id", "email"]);
    }

    #[test]
    fn test_aliases_win() {
        let cols =
            select_columns("SELECT u.id AS user_id, UPPER(u.mail) AS email FROM users u").unwrap();
        assert_eq!(cols, vec!["user_id", "email"]);
    }

    #[test]
    fn test_qualified_and_bracketed() {
        let cols = select_columns("SELECT users.id, [region] FROM t").unwrap();
        assert_eq!(cols, vec!["id", "region"]);
    }

    #[test]
    fn test_bracketed_name_with_space_rejected() {
        assert!(select_columns("SELECT [cutover date] FROM t").is_err());
    }

    #[test]
    fn test_function_call_commas_do_not_split() {
        let cols = select_columns(
            "SELECT COALESCE(a, b) AS merged, CONCAT(x, ',', y) AS joined FROM t",
        )
        .unwrap();
        assert_eq!(cols, vec!["merged", "joined"]);
    }

    #[test]
    fn test_subquery_from_not_confused() {
        let cols = select_columns(
            "SELECT id, (SELECT MAX(ts) FROM audit) AS last_seen FROM users",
        )
        .unwrap();
        assert_eq!(cols, vec!["id", "last_seen"]);
    }

    #[test]
    fn test_distinct_prefix() {
        let cols = select_columns("SELECT DISTINCT user_id FROM logins").unwrap();
        assert_eq!(cols, vec!["user_id"]);
    }

    #[test]
    fn test_star_rejected() {
        assert!(select_columns("SELECT * FROM users").is_err());
        assert!(select_columns("SELECT u.* FROM users u").is_err());
    }

    #[test]
    fn test_expression_without_alias_rejected() {
        assert!(select_columns("SELECT COUNT(1) FROM users").is_err());
    }

    #[test]
    fn test_no_select_rejected() {
        assert!(select_columns("UPDATE users SET x = 1").is_err());
    }
}
