//! Challenges: the questions a dialog suspends on.
//!
//! A challenge pairs the prompt sent to the chat with the rule deciding
//! which replies are allowed to resume the script.

use crate::telegram::{ChatTransport, TransportError};

/// A prompt plus its acceptance rule. Built with [`Challenge::open`] for
/// free-form questions or [`Challenge::keyboard`] for restricted ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    text: String,
    choices: Option<Vec<Vec<String>>>,
}

impl Challenge {
    /// A free-form question: any reply resumes the script.
    pub fn open(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            choices: None,
        }
    }

    /// A restricted question: only one of the offered choices resumes the
    /// script. `rows` also shapes the reply keyboard shown in the chat.
    pub fn keyboard(text: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            text: text.into(),
            choices: Some(rows),
        }
    }

    /// Whether a reply satisfies this challenge. Choice matching is exact
    /// and case-sensitive; row boundaries carry no meaning here.
    pub fn accepts(&self, reply: &str) -> bool {
        match &self.choices {
            None => true,
            Some(rows) => rows.iter().flatten().any(|choice| choice == reply),
        }
    }

    /// Send the prompt, with the choice keyboard when restricted.
    pub async fn present<T: ChatTransport>(
        &self,
        transport: &T,
        chat_id: i64,
    ) -> Result<(), TransportError> {
        transport.send(chat_id, &self.text, self.choices.as_deref()).await
    }
}
