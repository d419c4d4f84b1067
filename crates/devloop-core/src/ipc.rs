//! IPC envelope shared by the app child and reflection children
//!
//! One message is one JSON object on one line, internally tagged by `type`.
//! The app child writes to its IPC socket; reflection children write to stdout,
//! where lines that do not decode are plain application output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manifest::PluginManifest;

/// Kind of a reflection failure reported by the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReflectionErrorKind {
    RuntimeError,
    TsError,
}

impl std::fmt::Display for ReflectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReflectionErrorKind::RuntimeError => write!(f, "runtime-error"),
            ReflectionErrorKind::TsError => write!(f, "ts-error"),
        }
    }
}

/// Error shape carried across the process boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A message sent by a child process to devloop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// The app loaded a module; devloop may need to watch it
    ModuleImported { file_path: PathBuf },

    UncaughtError {
        error: String,
        #[serde(default)]
        stack: String,
        /// False when no custom handler was observed; the process exits on its own
        will_terminate: bool,
    },

    UnhandledRejection {
        error: String,
        #[serde(default)]
        stack: String,
        will_terminate: bool,
    },

    ServerReady,

    ReflectionSuccessPlugin { plugins: Vec<PluginManifest> },

    ReflectionSuccessTypegen,

    ReflectionError {
        kind: ReflectionErrorKind,
        serialized_error: SerializedError,
    },
}

impl Message {
    /// Whether this message ends a reflection run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Message::ReflectionSuccessPlugin { .. }
                | Message::ReflectionSuccessTypegen
                | Message::ReflectionError { .. }
        )
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match self {
            Message::ModuleImported { file_path } => {
                format!("Module imported: {}", file_path.display())
            }
            Message::UncaughtError { error, .. } => format!("Uncaught error: {}", error),
            Message::UnhandledRejection { error, .. } => {
                format!("Unhandled rejection: {}", error)
            }
            Message::ServerReady => "Server ready".to_string(),
            Message::ReflectionSuccessPlugin { plugins } => {
                format!("Reflection found {} plugin(s)", plugins.len())
            }
            Message::ReflectionSuccessTypegen => "Type artifacts generated".to_string(),
            Message::ReflectionError {
                kind,
                serialized_error,
            } => format!("Reflection {}: {}", kind, serialized_error),
        }
    }
}

/// Encode a message as a single newline-terminated line
pub fn encode_line(message: &Message) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line into a message.
///
/// Returns `None` for anything that is not a well-formed envelope, so callers
/// can treat the line as ordinary output.
pub fn decode_line(line: &str) -> Option<Message> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return None;
    }

    match serde_json::from_str(trimmed) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::trace!("Line is not an IPC message ({}): {}", e, trimmed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_ready_wire_format() {
        let line = encode_line(&Message::ServerReady).unwrap();
        assert_eq!(line, "{\"type\":\"server_ready\"}\n");
    }

    #[test]
    fn test_decode_module_imported() {
        let msg = decode_line(r#"{"type":"module_imported","filePath":"/app/lib/db.ts"}"#);
        assert_eq!(
            msg,
            Some(Message::ModuleImported {
                file_path: PathBuf::from("/app/lib/db.ts")
            })
        );
    }

    #[test]
    fn test_decode_uncaught_error_without_stack() {
        let msg = decode_line(
            r#"{"type":"uncaught_error","error":"TypeError: x is undefined","willTerminate":false}"#,
        )
        .unwrap();

        match msg {
            Message::UncaughtError {
                error,
                stack,
                will_terminate,
            } => {
                assert_eq!(error, "TypeError: x is undefined");
                assert!(stack.is_empty());
                assert!(!will_terminate);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_reflection_error() {
        let msg = decode_line(
            r#"{"type":"reflection_error","kind":"ts-error","serializedError":{"name":"TSError","message":"2 errors","stack":"at x"}}"#,
        )
        .unwrap();

        assert!(msg.is_terminal());
        match msg {
            Message::ReflectionError {
                kind,
                serialized_error,
            } => {
                assert_eq!(kind, ReflectionErrorKind::TsError);
                assert_eq!(serialized_error.name, "TSError");
                assert_eq!(serialized_error.to_string(), "TSError: 2 errors");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_plugin_success() {
        let msg = decode_line(
            r#"{"type":"reflection_success_plugin","plugins":[{"name":"prisma"},{"name":"jwt-auth"}]}"#,
        )
        .unwrap();

        assert_eq!(msg.summary(), "Reflection found 2 plugin(s)");
    }

    #[test]
    fn test_plain_output_is_not_a_message() {
        assert!(decode_line("Server listening on :4000").is_none());
        assert!(decode_line("").is_none());
        assert!(decode_line(r#"{"type":"no_such_message"}"#).is_none());
        assert!(decode_line(r#"{"level":"info","msg":"json logger line"}"#).is_none());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Message::ReflectionSuccessTypegen.is_terminal());
        assert!(!Message::ServerReady.is_terminal());
        assert!(!Message::ModuleImported {
            file_path: PathBuf::from("a.ts")
        }
        .is_terminal());
    }
}
