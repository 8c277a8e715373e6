use inquire::Confirm;

use crate::error::VbError;

/// Asks the operator yes/no questions before destructive or unverified steps.
pub trait Prompter {
    fn confirm(&self, question: &str) -> Result<bool, VbError>;
}

/// Interactive prompts on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    fn confirm(&self, question: &str) -> Result<bool, VbError> {
        Confirm::new(question)
            .with_default(false)
            .prompt()
            .map_err(map_inquire_err)
    }
}

/// Answers every question with "yes" (for `--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Prompter for AssumeYes {
    fn confirm(&self, question: &str) -> Result<bool, VbError> {
        tracing::info!(question, "assuming yes");
        Ok(true)
    }
}

fn map_inquire_err(e: inquire::InquireError) -> VbError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            VbError::Cancelled {
                message: "prompt interrupted".into(),
            }
        }
        other => VbError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}
