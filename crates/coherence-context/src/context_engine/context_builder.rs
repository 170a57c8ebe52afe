//! Assembles titled sections into one context string under a size budget

use crate::utils::TextUtils;
use tracing::debug;

/// One titled block of context. Higher priority survives trimming longer.
#[derive(Debug, Clone)]
pub struct Section {
    pub title: String,
    pub body: String,
    pub priority: u8,
}

impl Section {
    pub fn new(title: impl Into<String>, body: impl Into<String>, priority: u8) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority,
        }
    }

    fn render(&self) -> String {
        format!("## {}\n{}", self.title, self.body.trim_end())
    }
}

#[derive(Debug, Clone)]
pub struct ContextBuilderConfig {
    pub max_total_chars: usize,
}

impl Default for ContextBuilderConfig {
    fn default() -> Self {
        Self { max_total_chars: 16_000 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltContext {
    pub text: String,
    /// Titles of sections dropped to fit the budget
    pub dropped: Vec<String>,
    pub truncated: bool,
}

/// Builds context text from prioritised sections
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextBuilderConfig,
    sections: Vec<Section>,
}

impl ContextBuilder {
    pub fn new(config: ContextBuilderConfig) -> Self {
        Self {
            config,
            sections: Vec::new(),
        }
    }

    pub fn with_budget(max_total_chars: usize) -> Self {
        Self::new(ContextBuilderConfig { max_total_chars })
    }

    /// Empty bodies are ignored.
    pub fn push(&mut self, section: Section) -> &mut Self {
        if !section.body.trim().is_empty() {
            self.sections.push(section);
        }
        self
    }

    pub fn section(&mut self, title: impl Into<String>, body: impl Into<String>, priority: u8) -> &mut Self {
        self.push(Section::new(title, body, priority))
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Render sections in insertion order, dropping the lowest-priority ones
    /// (latest first among equals) until the text fits. A single remaining
    /// section that is still too long is truncated.
    pub fn build(&self) -> BuiltContext {
        let mut kept: Vec<bool> = vec![true; self.sections.len()];
        let mut dropped = Vec::new();

        let mut order: Vec<usize> = (0..self.sections.len()).collect();
        order.sort_by(|a, b| {
            self.sections[*a]
                .priority
                .cmp(&self.sections[*b].priority)
                .then(b.cmp(a))
        });

        let total = |kept: &[bool]| -> usize {
            self.sections
                .iter()
                .zip(kept)
                .filter(|(_, k)| **k)
                .map(|(s, _)| s.render().len() + 2)
                .sum::<usize>()
                .saturating_sub(2)
        };

        for idx in order {
            if total(&kept) <= self.config.max_total_chars {
                break;
            }
            if kept.iter().filter(|k| **k).count() <= 1 {
                break;
            }
            kept[idx] = false;
            dropped.push(self.sections[idx].title.clone());
        }

        let text = self
            .sections
            .iter()
            .zip(&kept)
            .filter(|(_, k)| **k)
            .map(|(s, _)| s.render())
            .collect::<Vec<_>>()
            .join("\n\n");

        let truncated = text.len() > self.config.max_total_chars;
        let text = if truncated {
            TextUtils::truncate_with_ellipsis(&text, self.config.max_total_chars).into_owned()
        } else {
            text
        };
        if !dropped.is_empty() || truncated {
            debug!("Context trimmed: dropped {:?}, truncated: {}", dropped, truncated);
        }
        BuiltContext { text, dropped, truncated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_render_in_order() {
        let mut builder = ContextBuilder::with_budget(1_000);
        builder.section("Target", "Boss room", 100).section("Empty", "   ", 10).section("Next", "Exit", 50);
        let built = builder.build();
        assert_eq!(built.text, "## Target\nBoss room\n\n## Next\nExit");
        assert!(built.dropped.is_empty());
    }

    #[test]
    fn test_lowest_priority_dropped_first() {
        let mut builder = ContextBuilder::with_budget(60);
        builder
            .section("Target", "x".repeat(30), 100)
            .section("Facts", "y".repeat(30), 70)
            .section("Summaries", "z".repeat(30), 20);
        let built = builder.build();
        assert_eq!(built.dropped, vec!["Summaries", "Facts"]);
        assert!(built.text.starts_with("## Target"));
        assert!(!built.truncated);
    }

    #[test]
    fn test_single_oversized_section_is_truncated() {
        let mut builder = ContextBuilder::with_budget(20);
        builder.section("Target", "é".repeat(40), 100);
        let built = builder.build();
        assert!(built.truncated);
        assert!(built.text.len() <= 20);
        assert!(built.text.ends_with("..."));
    }
}
