//! Section plans per template

use serde::{Deserialize, Serialize};

use super::model::TemplateType;

/// One section the engine is asked to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionPlan {
    pub key: String,
    pub title: String,
    pub guidance: String,
    /// The section is expected to be a bullet list
    pub list: bool,
}

fn section(key: &str, title: &str, guidance: &str, list: bool) -> SectionPlan {
    SectionPlan {
        key: key.into(),
        title: title.into(),
        guidance: guidance.into(),
        list,
    }
}

impl TemplateType {
    /// Ordered sections of this template
    pub fn sections(&self) -> Vec<SectionPlan> {
        let middle = match self {
            Self::Technical => section(
                "technical_decisions",
                "Architecture & Technical Decisions",
                "Technical choices made, the alternatives considered and their trade-offs.",
                false,
            ),
            Self::Marketing => section(
                "campaign",
                "Campaign Strategy & Performance",
                "Positioning, channels and the measurable results of the work.",
                false,
            ),
            Self::Product => section(
                "product_decisions",
                "Product Decisions & User Feedback",
                "How user feedback shaped scope, priorities and releases.",
                false,
            ),
            Self::Comprehensive | Self::Custom => section(
                "communication",
                "Communication Analysis",
                "How the team communicated, recurring themes and collaboration patterns.",
                false,
            ),
        };

        vec![
            section(
                "executive_summary",
                "Executive Summary",
                "A short overview of the project, its outcome and why it matters.",
                false,
            ),
            section(
                "background",
                "Project Background & Context",
                "Where the project started, the problem it addressed and its constraints.",
                false,
            ),
            section(
                "stakeholders",
                "Key Stakeholders & Timeline",
                "Who was involved and the major milestones in order.",
                false,
            ),
            middle,
            section(
                "decisions",
                "Decision Points & Challenges",
                "The pivotal decisions, obstacles encountered and how they were resolved.",
                false,
            ),
            section(
                "outcomes",
                "Outcomes & Results",
                "Concrete results, metrics where available, and impact.",
                false,
            ),
            section(
                "lessons",
                "Lessons Learned",
                "Insights worth carrying into future projects.",
                true,
            ),
            section(
                "recommendations",
                "Recommendations & Best Practices",
                "Actionable recommendations for similar projects.",
                true,
            ),
        ]
    }

    /// Tone guidance passed to the engine
    pub fn focus(&self) -> &'static str {
        match self {
            Self::Comprehensive => "Balanced coverage of process, people and results.",
            Self::Technical => "Emphasise engineering detail, architecture and implementation.",
            Self::Marketing => "Emphasise audience, messaging and measurable business impact.",
            Self::Product => "Emphasise user needs, product decisions and adoption.",
            Self::Custom => "Follow the custom instructions closely.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_template_has_extractable_sections() {
        for template in [
            TemplateType::Comprehensive,
            TemplateType::Technical,
            TemplateType::Marketing,
            TemplateType::Product,
            TemplateType::Custom,
        ] {
            let sections = template.sections();
            assert_eq!(sections.len(), 8);
            assert_eq!(sections[0].title, "Executive Summary");
            assert!(sections.iter().any(|s| s.title == "Lessons Learned" && s.list));
        }
    }

    #[test]
    fn test_templates_differ() {
        assert_ne!(
            TemplateType::Technical.sections()[3],
            TemplateType::Marketing.sections()[3]
        );
    }
}
