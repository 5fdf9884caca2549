//! Caller-supplied conversation messages.

use serde::{Deserialize, Serialize};
use stepwise_model::ModelMessage;

/// Who authored a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions from the host.
    System,
    /// The human user.
    User,
    /// A previous reply of the agent.
    Assistant,
}

/// One message of the conversation passed to [`crate::Agent::chat`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// The author.
    pub role: Role,
    /// The text.
    pub content: String,
}

impl ConversationMessage {
    /// Creates a user message.
    #[inline]
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates an assistant message.
    #[inline]
    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Creates a system message.
    #[inline]
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub(crate) fn to_model_message(&self) -> ModelMessage {
        let content = self.content.clone();
        match self.role {
            Role::System => ModelMessage::System(content),
            Role::User => ModelMessage::User(content),
            Role::Assistant => ModelMessage::assistant(content),
        }
    }
}

/// Builds the initial transcript: the system prompt followed by the
/// conversation in order.
pub(crate) fn build_transcript(
    system_prompt: &str,
    conversation: &[ConversationMessage],
) -> Vec<ModelMessage> {
    let mut transcript = Vec::with_capacity(conversation.len() + 1);
    if !system_prompt.is_empty() {
        transcript.push(ModelMessage::System(system_prompt.to_owned()));
    }
    transcript.extend(conversation.iter().map(|m| m.to_model_message()));
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_transcript() {
        let conversation = [
            ConversationMessage::user("hi"),
            ConversationMessage::assistant("hello"),
            ConversationMessage::user("what is 2+2"),
        ];
        let transcript = build_transcript("be brief", &conversation);
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[0], ModelMessage::System("be brief".to_owned()));
        assert_eq!(transcript[2], ModelMessage::assistant("hello"));

        assert_eq!(build_transcript("", &conversation).len(), 3);
    }

    #[test]
    fn test_role_wire_names() {
        let msg: ConversationMessage =
            serde_json::from_str(r#"{"role":"user","content":"what is 2+2"}"#)
                .unwrap();
        assert_eq!(msg, ConversationMessage::user("what is 2+2"));
    }
}
