//! Authorization tokens.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Token kind whose body is renewed by the tokens service.
pub const TVM_TOKEN_KIND: &str = "TVM";

/// An authorization credential. Replaced wholesale, never edited in place.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Token {
    kind: String,
    body: String,
}

impl Token {
    pub fn new(kind: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Same kind, new body.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            body: body.into(),
        }
    }
}

// The body is a secret; keep it out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// The current token, shared between the refresh task and readers.
#[derive(Clone, Debug)]
pub struct SharedToken {
    inner: Arc<Mutex<Token>>,
}

impl SharedToken {
    pub fn new(token: Token) -> Self {
        Self {
            inner: Arc::new(Mutex::new(token)),
        }
    }

    /// A complete snapshot of the current token.
    pub fn get(&self) -> Token {
        self.inner.lock().clone()
    }

    /// Replace the body, keeping the kind.
    pub fn replace_body(&self, body: String) {
        let mut token = self.inner.lock();
        *token = token.with_body(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_the_body_keeps_the_kind() {
        let shared = SharedToken::new(Token::new(TVM_TOKEN_KIND, "t0"));
        let before = shared.get();

        shared.replace_body("t1".to_string());

        assert_eq!(before.body(), "t0");
        assert_eq!(shared.get(), Token::new("TVM", "t1"));
    }

    #[test]
    fn debug_hides_the_body() {
        let rendered = format!("{:?}", Token::new("TVM", "very_secret"));
        assert!(!rendered.contains("very_secret"));
        assert!(rendered.contains("TVM"));
    }
}
