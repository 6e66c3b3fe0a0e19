//! Build event message types.
//!
//! The build service publishes a small JSON object per event. Only the
//! four keys that identify a build are read; everything else (`versrel`,
//! `bcnt`, `reason`, ...) is ignored.
//!
//! # Example
//!
//! ```rust
//! use obs_watcher::broker::BuildEvent;
//!
//! let body = br#"{
//!   "project": "home:x",
//!   "package": "foo",
//!   "repository": "SLE_15",
//!   "arch": "x86_64",
//!   "versrel": "1.0-1",
//!   "bcnt": "1"
//! }"#;
//!
//! let event = BuildEvent::decode(body).unwrap();
//! assert!(event.is_complete());
//! assert_eq!(event.project(), "home:x");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a message body.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Body is not valid UTF-8.
    #[error("message body is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Body is not a JSON object of the expected shape.
    #[error("message body is not a build event: {0}")]
    Json(#[from] serde_json::Error),
}

/// A raw delivery handed over by the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub body: Vec<u8>,
}

impl BrokerMessage {
    /// Creates a message from a routing key and body.
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    /// Body as text for logging; invalid UTF-8 is replaced.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A "package build succeeded" event.
///
/// Fields are optional at the type level because the broker does not
/// guarantee them; [`BuildEvent::is_complete`] tells whether the event
/// can be matched at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Build service project, e.g. `home:trenn:cobbler_test_build`.
    #[serde(default)]
    pub project: Option<String>,

    /// Package name within the project.
    #[serde(default)]
    pub package: Option<String>,

    /// Repository the package was built for.
    #[serde(default)]
    pub repository: Option<String>,

    /// Build architecture.
    #[serde(default)]
    pub arch: Option<String>,
}

impl BuildEvent {
    /// Decodes a message body into a build event.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the body is not UTF-8 or not a JSON
    /// object whose known keys are strings (or null).
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(body)?;
        Ok(serde_json::from_str(text)?)
    }

    /// True when project, package, repository and arch are all present
    /// and non-empty.
    pub fn is_complete(&self) -> bool {
        [&self.project, &self.package, &self.repository, &self.arch]
            .iter()
            .all(|field| field.as_deref().is_some_and(|v| !v.is_empty()))
    }

    /// Project, or an empty string when missing.
    pub fn project(&self) -> &str {
        self.project.as_deref().unwrap_or_default()
    }

    /// Package, or an empty string when missing.
    pub fn package(&self) -> &str {
        self.package.as_deref().unwrap_or_default()
    }

    /// Repository, or an empty string when missing.
    pub fn repository(&self) -> &str {
        self.repository.as_deref().unwrap_or_default()
    }

    /// Architecture, or an empty string when missing.
    pub fn arch(&self) -> &str {
        self.arch.as_deref().unwrap_or_default()
    }
}
