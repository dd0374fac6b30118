//! Interactive input sources.
//!
//! The resolver asks questions through the [`Prompter`] trait. Production
//! runs use [`WhiptailPrompter`] on a terminal and [`NonInteractive`]
//! everywhere else; tests script answers.

mod whiptail;

use anyhow::Result;

pub use whiptail::WhiptailPrompter;

/// Outcome of a single question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome<T> {
    Answered(T),
    /// The operator pressed Cancel or Escape.
    Cancelled,
}

/// A selectable option for [`Prompter::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub tag: String,
    pub description: String,
}

impl Choice {
    pub fn new(tag: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            description: description.into(),
        }
    }
}

/// Source of interactively collected values.
pub trait Prompter {
    /// Returns false when no operator is available to answer questions.
    fn is_interactive(&self) -> bool;

    /// Asks for free text, pre-filled with `default`.
    fn input(&self, title: &str, prompt: &str, default: &str) -> Result<PromptOutcome<String>>;

    /// Asks for one of `choices`, pre-selecting the tag equal to `default`.
    fn select(
        &self,
        title: &str,
        prompt: &str,
        choices: &[Choice],
        default: &str,
    ) -> Result<PromptOutcome<String>>;

    /// Asks a yes/no question.
    fn confirm(&self, title: &str, prompt: &str, default_yes: bool) -> Result<PromptOutcome<bool>>;
}

/// Prompter for unattended runs: every question takes its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn input(&self, _title: &str, _prompt: &str, default: &str) -> Result<PromptOutcome<String>> {
        Ok(PromptOutcome::Answered(default.to_string()))
    }

    fn select(
        &self,
        _title: &str,
        _prompt: &str,
        _choices: &[Choice],
        default: &str,
    ) -> Result<PromptOutcome<String>> {
        Ok(PromptOutcome::Answered(default.to_string()))
    }

    fn confirm(&self, _title: &str, _prompt: &str, default_yes: bool) -> Result<PromptOutcome<bool>> {
        Ok(PromptOutcome::Answered(default_yes))
    }
}
