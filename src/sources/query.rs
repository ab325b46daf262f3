//! Search expressions for a project scope
//!
//! Keywords and participants narrow the search independently; a scope may
//! carry only one of the two. Dates bound the search on both ends, the end
//! day included.

use chrono::Duration;

use crate::jobs::ProjectScope;

/// Gmail `q` parameter.
///
/// `("k1" OR "k2") AND (from:a OR to:a) after:YYYY/MM/DD before:YYYY/MM/DD`
pub fn gmail_query(scope: &ProjectScope) -> String {
    let mut groups = Vec::new();

    if !scope.keywords.is_empty() {
        let keywords: Vec<String> = scope
            .keywords
            .iter()
            .map(|k| format!("\"{}\"", k.replace('"', "")))
            .collect();
        groups.push(format!("({})", keywords.join(" OR ")));
    }

    if !scope.participants.is_empty() {
        let people: Vec<String> = scope
            .participants
            .iter()
            .flat_map(|p| [format!("from:{}", p), format!("to:{}", p)])
            .collect();
        groups.push(format!("({})", people.join(" OR ")));
    }

    // before: is exclusive
    let range = &scope.date_range;
    format!(
        "{} after:{} before:{}",
        groups.join(" AND "),
        range.start.format("%Y/%m/%d"),
        (range.end + Duration::days(1)).format("%Y/%m/%d")
    )
}

/// Drive `q` parameter, trashed files excluded
pub fn drive_query(scope: &ProjectScope) -> String {
    let mut clauses = Vec::new();

    if !scope.keywords.is_empty() {
        let keywords: Vec<String> = scope
            .keywords
            .iter()
            .map(|k| {
                let k = drive_literal(k);
                format!("name contains '{}' or fullText contains '{}'", k, k)
            })
            .collect();
        clauses.push(format!("({})", keywords.join(" or ")));
    }

    if !scope.participants.is_empty() {
        let people: Vec<String> = scope
            .participants
            .iter()
            .map(|p| {
                let p = drive_literal(p);
                format!("'{}' in owners or '{}' in writers", p, p)
            })
            .collect();
        clauses.push(format!("({})", people.join(" or ")));
    }

    let range = &scope.date_range;
    clauses.push(format!(
        "modifiedTime >= '{}'",
        range.start.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    clauses.push(format!(
        "modifiedTime <= '{}'",
        range.end.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    clauses.push("trashed = false".into());
    clauses.join(" and ")
}

fn drive_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
