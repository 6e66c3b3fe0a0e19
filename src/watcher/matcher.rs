//! Event matching against the watch-list
//!
//! Decodes build success events and determines which watch entry, if any,
//! an event belongs to.

use std::sync::Arc;

use tracing::warn;

use super::watch_list::{WatchEntry, WatchList};
use crate::broker::{BuildEvent, DecodeError};

/// Matches build events against a shared watch-list.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use obs_watcher::watcher::{EventMatcher, WatchList};
///
/// let matcher = EventMatcher::new(Arc::new(WatchList::default()));
/// let event = matcher
///     .decode(br#"{"project":"p","package":"q","repository":"r","arch":"x86_64"}"#)
///     .unwrap();
///
/// assert!(matcher.validate(&event));
/// assert!(matcher.find_match(&event).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct EventMatcher {
    watch_list: Arc<WatchList>,
}

impl EventMatcher {
    /// Create a matcher over `watch_list`.
    pub fn new(watch_list: Arc<WatchList>) -> Self {
        Self { watch_list }
    }

    /// The watch-list being matched against.
    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    /// Decode a raw message body.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the body is not UTF-8 JSON describing a
    /// build event.
    pub fn decode(&self, body: &[u8]) -> Result<BuildEvent, DecodeError> {
        BuildEvent::decode(body)
    }

    /// Check that the event carries everything needed for matching.
    ///
    /// Logs a warning and returns false if project, package, arch or
    /// repository is missing or empty.
    pub fn validate(&self, event: &BuildEvent) -> bool {
        if event.is_complete() {
            return true;
        }

        warn!(
            project = event.project(),
            package = event.package(),
            repository = event.repository(),
            arch = event.arch(),
            "Suspicious build success event"
        );
        false
    }

    /// First watch entry for the event's build, if any.
    pub fn find_match(&self, event: &BuildEvent) -> Option<&WatchEntry> {
        self.watch_list.find(
            event.project(),
            event.package(),
            event.repository(),
            event.arch(),
        )
    }
}
