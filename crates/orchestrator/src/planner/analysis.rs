//! Task analysis heuristics

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub mod capabilities {
    pub const REASONING: &str = "REASONING";
    pub const PLANNING: &str = "PLANNING";
    pub const CODE_GENERATION: &str = "CODE_GENERATION";
    pub const CODE_ANALYSIS: &str = "CODE_ANALYSIS";
    pub const DATA_ANALYSIS: &str = "DATA_ANALYSIS";
}

pub mod roles {
    pub const PLANNER: &str = "PLANNER";
    pub const CODER_AGENT: &str = "CODER_AGENT";
    pub const ANALYST_AGENT: &str = "ANALYST_AGENT";
    pub const COMMON_AGENT: &str = "COMMON_AGENT";
}

/// Word stems that signal a required capability. A word matches when it starts with the stem.
const SKILL_KEYWORDS: &[(&str, &[&str])] = &[
    (
        capabilities::CODE_GENERATION,
        &[
            "code", "coding", "implement", "function", "program", "script", "refactor", "debug",
            "compile", "api", "bug",
        ],
    ),
    (
        capabilities::DATA_ANALYSIS,
        &[
            "analy", "data", "statistic", "metric", "report", "trend", "dataset", "chart",
        ],
    ),
    (
        capabilities::PLANNING,
        &[
            "plan", "schedule", "roadmap", "strategy", "organiz", "organis", "design",
        ],
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
}

impl TaskComplexity {
    pub fn from_word_count(words: usize) -> Self {
        if words > 50 {
            TaskComplexity::High
        } else if words > 20 {
            TaskComplexity::Medium
        } else {
            TaskComplexity::Low
        }
    }

    pub fn estimated_steps(&self) -> usize {
        match self {
            TaskComplexity::Low => 1,
            TaskComplexity::Medium => 3,
            TaskComplexity::High => 5,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            TaskComplexity::Low => 0.9,
            TaskComplexity::Medium => 0.8,
            TaskComplexity::High => 0.7,
        }
    }
}

impl std::fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskComplexity::Low => write!(f, "low"),
            TaskComplexity::Medium => write!(f, "medium"),
            TaskComplexity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub word_count: usize,
    pub complexity: TaskComplexity,
    pub required_capabilities: BTreeSet<String>,
    pub estimated_steps: usize,
}

impl TaskAnalysis {
    pub fn requires_specialization(&self) -> bool {
        self.required_capabilities.len() > 2
    }

    /// Specialised capabilities in a fixed order, REASONING excluded
    pub fn specialized_capabilities(&self) -> Vec<&str> {
        SKILL_KEYWORDS
            .iter()
            .map(|(capability, _)| *capability)
            .filter(|capability| self.required_capabilities.contains(*capability))
            .collect()
    }

    /// Role that best fits the task's first specialised capability
    pub fn primary_role(&self) -> &'static str {
        self.specialized_capabilities()
            .first()
            .map(|capability| role_for_capability(capability))
            .unwrap_or(roles::COMMON_AGENT)
    }
}

pub fn role_for_capability(capability: &str) -> &'static str {
    match capability {
        capabilities::CODE_GENERATION => roles::CODER_AGENT,
        capabilities::DATA_ANALYSIS => roles::ANALYST_AGENT,
        _ => roles::COMMON_AGENT,
    }
}

/// Capabilities an agent must have to run a step assigned to `agent_type`.
/// The type is matched case-insensitively with any `_AGENT` suffix dropped.
pub fn capabilities_for_agent_type(agent_type: &str) -> Vec<String> {
    let normalized = agent_type.trim().to_uppercase();
    let role = normalized.strip_suffix("_AGENT").unwrap_or(&normalized);
    let required: &[&str] = match role {
        "PLANNER" => &[capabilities::PLANNING, capabilities::REASONING],
        "CODER" => &[capabilities::CODE_GENERATION, capabilities::CODE_ANALYSIS],
        "ANALYST" => &[capabilities::DATA_ANALYSIS, capabilities::REASONING],
        _ => &[capabilities::REASONING],
    };
    required.iter().map(|c| c.to_string()).collect()
}

pub fn analyze_task(description: &str) -> TaskAnalysis {
    let words: Vec<String> = description
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect();

    let mut required_capabilities = BTreeSet::new();
    required_capabilities.insert(capabilities::REASONING.to_string());
    for (capability, stems) in SKILL_KEYWORDS {
        let matched = words
            .iter()
            .any(|word| stems.iter().any(|stem| word.starts_with(stem)));
        if matched {
            required_capabilities.insert(capability.to_string());
        }
    }

    let complexity = TaskComplexity::from_word_count(words.len());
    TaskAnalysis {
        word_count: words.len(),
        complexity,
        required_capabilities,
        estimated_steps: complexity.estimated_steps(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[rstest]
    #[case(1, TaskComplexity::Low, 1)]
    #[case(20, TaskComplexity::Low, 1)]
    #[case(21, TaskComplexity::Medium, 3)]
    #[case(50, TaskComplexity::Medium, 3)]
    #[case(51, TaskComplexity::High, 5)]
    fn test_complexity_by_word_count(
        #[case] count: usize,
        #[case] expected: TaskComplexity,
        #[case] steps: usize,
    ) {
        let analysis = analyze_task(&words(count));
        assert_eq!(analysis.complexity, expected);
        assert_eq!(analysis.estimated_steps, steps);
    }

    #[rstest]
    #[case("PLANNER", &[capabilities::PLANNING, capabilities::REASONING])]
    #[case("coder_agent", &[capabilities::CODE_GENERATION, capabilities::CODE_ANALYSIS])]
    #[case("ANALYST_AGENT", &[capabilities::DATA_ANALYSIS, capabilities::REASONING])]
    #[case("COMMON_AGENT", &[capabilities::REASONING])]
    #[case("translator", &[capabilities::REASONING])]
    fn test_capabilities_for_agent_type(#[case] agent_type: &str, #[case] expected: &[&str]) {
        assert_eq!(capabilities_for_agent_type(agent_type), expected);
    }

    #[test]
    fn test_reasoning_is_always_required() {
        let analysis = analyze_task("say hello");
        assert_eq!(
            analysis.required_capabilities,
            BTreeSet::from([capabilities::REASONING.to_string()])
        );
        assert_eq!(analysis.primary_role(), roles::COMMON_AGENT);
    }

    #[test]
    fn test_keywords_extract_skills() {
        let analysis = analyze_task("Implement a parser, then analyze the data and plan a rollout.");
        assert!(analysis
            .required_capabilities
            .contains(capabilities::CODE_GENERATION));
        assert!(analysis
            .required_capabilities
            .contains(capabilities::DATA_ANALYSIS));
        assert!(analysis.required_capabilities.contains(capabilities::PLANNING));
        assert!(analysis.requires_specialization());
        assert_eq!(analysis.primary_role(), roles::CODER_AGENT);
    }
}
