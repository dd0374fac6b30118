//! `whiptail` dialog prompter.
//!
//! whiptail draws on the terminal and writes the answer to stderr. Exit code
//! 0 means OK/Yes, 1 means Cancel/No and 255 means Escape.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use which::which;

use super::{Choice, PromptOutcome, Prompter};
use crate::error::ProvisionError;

const BACKTITLE: &str = "pvestrap: Proxmox VE provisioning";
const WIDTH: &str = "64";

/// Prompter backed by the `whiptail` dialog program.
#[derive(Debug, Clone)]
pub struct WhiptailPrompter {
    program: std::path::PathBuf,
}

enum DialogExit {
    Ok(String),
    No,
    Escape,
}

impl WhiptailPrompter {
    /// Locates `whiptail` in PATH.
    pub fn new() -> Result<Self> {
        let program = which("whiptail").map_err(|_| ProvisionError::CommandNotFound {
            command: "whiptail".to_string(),
        })?;
        Ok(Self { program })
    }

    fn run(&self, args: Vec<String>) -> Result<DialogExit> {
        tracing::trace!("whiptail {:?}", args);
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .context("failed to run whiptail")?;
        match output.status.code() {
            Some(0) => Ok(DialogExit::Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())),
            Some(1) => Ok(DialogExit::No),
            Some(255) => Ok(DialogExit::Escape),
            other => Err(ProvisionError::Execution {
                command: "whiptail".to_string(),
                status: format!("unexpected exit status {:?}", other),
            }
            .into()),
        }
    }
}

fn base_args(title: &str) -> Vec<String> {
    vec![
        "--backtitle".to_string(),
        BACKTITLE.to_string(),
        "--title".to_string(),
        title.to_string(),
    ]
}

pub(super) fn input_args(title: &str, prompt: &str, default: &str) -> Vec<String> {
    let mut args = base_args(title);
    args.extend(["--inputbox", prompt, "8", WIDTH, default].map(String::from));
    args
}

pub(super) fn select_args(title: &str, prompt: &str, choices: &[Choice], default: &str) -> Vec<String> {
    let mut args = base_args(title);
    args.extend(["--radiolist", prompt, "16", WIDTH].map(String::from));
    args.push(choices.len().to_string());
    for choice in choices {
        args.push(choice.tag.clone());
        args.push(choice.description.clone());
        args.push(if choice.tag == default { "ON" } else { "OFF" }.to_string());
    }
    args
}

pub(super) fn confirm_args(title: &str, prompt: &str, default_yes: bool) -> Vec<String> {
    let mut args = base_args(title);
    if !default_yes {
        args.push("--defaultno".to_string());
    }
    args.extend(["--yesno", prompt, "10", WIDTH].map(String::from));
    args
}

impl Prompter for WhiptailPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    fn input(&self, title: &str, prompt: &str, default: &str) -> Result<PromptOutcome<String>> {
        Ok(match self.run(input_args(title, prompt, default))? {
            DialogExit::Ok(answer) => PromptOutcome::Answered(answer),
            DialogExit::No | DialogExit::Escape => PromptOutcome::Cancelled,
        })
    }

    fn select(
        &self,
        title: &str,
        prompt: &str,
        choices: &[Choice],
        default: &str,
    ) -> Result<PromptOutcome<String>> {
        Ok(match self.run(select_args(title, prompt, choices, default))? {
            DialogExit::Ok(answer) if answer.is_empty() => {
                PromptOutcome::Answered(default.to_string())
            }
            DialogExit::Ok(answer) => PromptOutcome::Answered(answer),
            DialogExit::No | DialogExit::Escape => PromptOutcome::Cancelled,
        })
    }

    fn confirm(&self, title: &str, prompt: &str, default_yes: bool) -> Result<PromptOutcome<bool>> {
        Ok(match self.run(confirm_args(title, prompt, default_yes))? {
            DialogExit::Ok(_) => PromptOutcome::Answered(true),
            DialogExit::No => PromptOutcome::Answered(false),
            DialogExit::Escape => PromptOutcome::Cancelled,
        })
    }
}
