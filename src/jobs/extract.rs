//! Artifact extraction from generated markdown

use serde::{Deserialize, Serialize};

const SUMMARY_HEADINGS: &[&str] = &["executive summary"];
const INSIGHT_HEADINGS: &[&str] = &["key insights", "lessons learned"];
const RECOMMENDATION_HEADINGS: &[&str] = &["recommendations", "best practices"];

/// Accumulated outputs of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub summary: Option<String>,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub full_content: String,
}

impl Artifacts {
    /// Re-derive summary and lists from `full_content`
    pub fn refresh(&mut self) {
        self.summary = extract_section(&self.full_content, SUMMARY_HEADINGS);
        self.key_insights = extract_list_items(&self.full_content, INSIGHT_HEADINGS);
        self.recommendations = extract_list_items(&self.full_content, RECOMMENDATION_HEADINGS);
    }
}

fn is_heading(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn heading_matches(line: &str, names: &[&str]) -> bool {
    let lower = line.to_lowercase();
    is_heading(line) && names.iter().any(|name| lower.contains(name))
}

/// Lines under the first heading matching any of `names`, up to the next heading
fn section_lines<'a>(content: &'a str, names: &[&str]) -> Option<Vec<&'a str>> {
    let mut lines = content.lines();
    lines.find(|line| heading_matches(line, names))?;
    Some(lines.take_while(|line| !is_heading(line)).collect())
}

/// Body text of a named section
pub fn extract_section(content: &str, names: &[&str]) -> Option<String> {
    let body = section_lines(content, names)?.join("\n");
    let body = body.trim();
    (!body.is_empty()).then(|| body.to_string())
}

/// Bullet or numbered items of a named section
pub fn extract_list_items(content: &str, names: &[&str]) -> Vec<String> {
    section_lines(content, names)
        .unwrap_or_default()
        .into_iter()
        .filter_map(list_item)
        .collect()
}

fn list_item(line: &str) -> Option<String> {
    let line = line.trim();
    let item = if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        rest
    } else {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix(". ")?
    };
    let item = item.trim();
    (!item.is_empty()).then(|| item.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "## Executive Summary\n\nThe migration landed on time.\nCosts fell.\n\n\
## Lessons Learned\n\n- Start with the data model\n* Keep stakeholders close\n2. Measure early\nplain prose\n\n\
## Recommendations & Best Practices\n\n- Automate cutover\n\n## Appendix\n\n- not a recommendation\n";

    #[test]
    fn test_summary() {
        assert_eq!(
            extract_section(DOC, SUMMARY_HEADINGS).as_deref(),
            Some("The migration landed on time.\nCosts fell.")
        );
        assert_eq!(extract_section("no headings here", SUMMARY_HEADINGS), None);
    }

    #[test]
    fn test_list_items() {
        assert_eq!(
            extract_list_items(DOC, INSIGHT_HEADINGS),
            vec![
                "Start with the data model".to_string(),
                "Keep stakeholders close".to_string(),
                "Measure early".to_string(),
            ]
        );
        assert_eq!(
            extract_list_items(DOC, RECOMMENDATION_HEADINGS),
            vec!["Automate cutover".to_string()]
        );
    }

    #[test]
    fn test_refresh() {
        let mut artifacts = Artifacts {
            full_content: DOC.to_string(),
            ..Default::default()
        };
        artifacts.refresh();
        assert!(artifacts.summary.is_some());
        assert_eq!(artifacts.key_insights.len(), 3);
        assert_eq!(artifacts.recommendations.len(), 1);
    }
}
