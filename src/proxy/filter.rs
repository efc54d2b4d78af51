//! Presentation of backend payloads to clients
//!
//! Error payloads from the gateway carry internal codes that mean nothing to
//! an end user. The filter rewrites their human-readable text; every other
//! payload passes through byte-for-byte.

use serde_json::Value;

use crate::error::TetherError;

pub trait PresentationFilter: Send + Sync {
    /// Backend→client text frame
    fn filter_text(&self, text: String) -> String;

    /// Close reason shown when the session ends on `err`
    fn close_reason(&self, err: &TetherError) -> String;
}

/// One rewrite: payloads whose code or message contains `needle` get `message`
#[derive(Debug, Clone)]
pub struct TranslationRule {
    pub needle: String,
    pub message: String,
}

/// Default filter: rewrites known error codes into actionable text
#[derive(Debug, Clone)]
pub struct ErrorTranslator {
    rules: Vec<TranslationRule>,
}

impl Default for ErrorTranslator {
    fn default() -> Self {
        Self::empty()
            .with_rule(
                "token_mismatch",
                "Gateway token mismatch. Reload the page to pick up the current token.",
            )
            .with_rule(
                "gateway token missing",
                "This session has no gateway token. Reload the page to sign in again.",
            )
            .with_rule(
                "pairing required",
                "This device is not paired yet. Approve it from the admin panel, then retry.",
            )
    }
}

impl ErrorTranslator {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push(TranslationRule {
            needle: needle.into(),
            message: message.into(),
        });
        self
    }

    fn translate(&self, code: Option<&str>, message: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| {
                code.map(|c| c.contains(rule.needle.as_str())).unwrap_or(false)
                    || message.contains(rule.needle.as_str())
            })
            .map(|rule| rule.message.as_str())
    }

    /// Rewrite the text of an error object in place; `true` if anything changed
    fn rewrite(&self, payload: &mut Value) -> bool {
        let Some(obj) = payload.as_object_mut() else {
            return false;
        };
        let is_error_type = obj.get("type").and_then(Value::as_str) == Some("error");
        let top_code = obj.get("code").and_then(Value::as_str).map(str::to_string);

        // {"error": {"code": .., "message": ..}}
        if let Some(Value::Object(inner)) = obj.get_mut("error") {
            let code = inner.get("code").and_then(Value::as_str).map(str::to_string);
            if let Some(Value::String(message)) = inner.get_mut("message") {
                if let Some(replacement) = self.translate(code.as_deref(), message) {
                    *message = replacement.to_string();
                    return true;
                }
            }
            return false;
        }

        // {"error": "text"}
        if let Some(Value::String(message)) = obj.get_mut("error") {
            if let Some(replacement) = self.translate(top_code.as_deref(), message) {
                *message = replacement.to_string();
                return true;
            }
            return false;
        }

        // {"type": "error", "message": "text"}
        if is_error_type {
            if let Some(Value::String(message)) = obj.get_mut("message") {
                if let Some(replacement) = self.translate(top_code.as_deref(), message) {
                    *message = replacement.to_string();
                    return true;
                }
            }
        }

        false
    }
}

impl PresentationFilter for ErrorTranslator {
    fn filter_text(&self, text: String) -> String {
        // Cheap pre-check before paying for a parse
        if !text.contains("error") {
            return text;
        }
        let Ok(mut payload) = serde_json::from_str::<Value>(&text) else {
            return text;
        };
        if self.rewrite(&mut payload) {
            serde_json::to_string(&payload).unwrap_or(text)
        } else {
            text
        }
    }

    fn close_reason(&self, err: &TetherError) -> String {
        match err.hint() {
            Some(hint) => hint.to_string(),
            None => err.to_string(),
        }
    }
}
