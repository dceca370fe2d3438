//! Persona document loading.
//!
//! The persona is a fixed instruction document that steers response
//! style. It is read on every call that asks for it, so edits to the file
//! take effect without a restart.

use std::path::PathBuf;

use crate::error::ChatError;
use crate::types::{ChatMessage, Role};

const BUILTIN_PERSONA: &str = include_str!("../persona/default.md");

#[derive(Debug, Clone)]
pub enum PersonaSource {
    Builtin,
    File(PathBuf),
    Inline(String),
}

impl PersonaSource {
    pub fn from_path(path: Option<PathBuf>) -> Self {
        path.map_or(PersonaSource::Builtin, PersonaSource::File)
    }

    pub async fn load(&self) -> Result<String, ChatError> {
        match self {
            PersonaSource::Builtin => Ok(BUILTIN_PERSONA.trim().to_string()),
            PersonaSource::Inline(text) => Ok(text.trim().to_string()),
            PersonaSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|content| content.trim().to_string())
                .map_err(|source| ChatError::Persona {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

/// Prepend the persona as a system message unless the conversation
/// already opens with one.
pub fn prepend_persona(persona: String, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    if messages.first().is_some_and(|m| m.role == Role::System) {
        return messages.to_vec();
    }
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(persona));
    out.extend_from_slice(messages);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Runtime::new().unwrap()
    }

    #[test]
    fn test_builtin_persona_is_not_empty() {
        let text = rt().block_on(PersonaSource::Builtin.load()).unwrap();
        assert!(text.starts_with("# Persona"));
    }

    #[test]
    fn test_file_persona_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.md");
        std::fs::write(&path, "\n  Speak like a pirate.\n\n").unwrap();
        let text = rt().block_on(PersonaSource::File(path).load()).unwrap();
        assert_eq!(text, "Speak like a pirate.");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = rt()
            .block_on(PersonaSource::File(PathBuf::from("/nonexistent/persona.md")).load())
            .unwrap_err();
        assert!(matches!(err, ChatError::Persona { .. }));
        assert!(err.to_string().contains("/nonexistent/persona.md"));
    }

    #[test]
    fn test_prepend_persona() {
        let messages = vec![ChatMessage::user("hi")];
        let out = prepend_persona("persona".to_string(), &messages);
        assert_eq!(out, vec![ChatMessage::system("persona"), ChatMessage::user("hi")]);
    }

    #[test]
    fn test_prepend_persona_keeps_existing_system_message() {
        let messages = vec![ChatMessage::system("title prompt"), ChatMessage::user("hi")];
        assert_eq!(prepend_persona("persona".to_string(), &messages), messages);
    }
}
