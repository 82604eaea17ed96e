//! System instruction composition (spec §4.7 step 4): priority-ordered
//! parts, lowest priority first, joined by blank lines. Generalizes the
//! teacher's single `Option<String>` `system_prompt` field, which had no
//! notion of layering file-sourced instructions under skill summaries.

use std::sync::Arc;

/// One contributor to the composed system instruction. Lower `priority()`
/// sorts earlier (closer to the base of the prompt); a source that has
/// nothing to say for this turn returns `None` from `render()`.
pub trait SystemInstructionSource: Send + Sync {
    fn priority(&self) -> i32;
    fn render(&self) -> Option<String>;
}

/// A fixed block of text at a fixed priority — the common case for
/// file-sourced instructions and skill summaries alike.
pub struct StaticSystemPart {
    pub priority: i32,
    pub text: String,
}

impl StaticSystemPart {
    pub fn new(priority: i32, text: impl Into<String>) -> Arc<dyn SystemInstructionSource> {
        Arc::new(Self {
            priority,
            text: text.into(),
        })
    }
}

impl SystemInstructionSource for StaticSystemPart {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn render(&self) -> Option<String> {
        if self.text.trim().is_empty() {
            None
        } else {
            Some(self.text.clone())
        }
    }
}

/// Composes all sources lowest-priority-first, joined by a blank line.
/// Returns `None` if every source was empty for this turn.
pub fn build_system_instruction(sources: &[Arc<dyn SystemInstructionSource>]) -> Option<String> {
    let mut parts: Vec<(i32, String)> = sources
        .iter()
        .filter_map(|s| s.render().map(|text| (s.priority(), text)))
        .collect();
    parts.sort_by_key(|(priority, _)| *priority);

    if parts.is_empty() {
        return None;
    }
    Some(
        parts
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lowest_priority_first() {
        let sources = vec![
            StaticSystemPart::new(10, "skill summary"),
            StaticSystemPart::new(0, "base instructions"),
        ];
        let composed = build_system_instruction(&sources).unwrap();
        assert_eq!(composed, "base instructions\n\nskill summary");
    }

    #[test]
    fn empty_sources_render_none() {
        let sources = vec![StaticSystemPart::new(0, "   ")];
        assert!(build_system_instruction(&sources).is_none());
    }

    #[test]
    fn no_sources_is_none() {
        assert!(build_system_instruction(&[]).is_none());
    }
}
