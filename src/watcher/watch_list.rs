//! The watch-list: which builds to act on, and as whom.
//!
//! A [`WatchList`] is built once at startup from the configuration and
//! never changes afterwards. It is shared behind an `Arc` and only ever
//! read.

use std::fmt;
use std::path::PathBuf;

use crate::error::WatcherError;

/// Owner identity of a local user.
///
/// Commands run as this user get its uid/gid and its login environment
/// (`HOME`, `USER`, `LOGNAME`), so tools find the user's own config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Login name.
    pub name: String,
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

impl UserIdentity {
    /// Identity of the user running this process.
    pub fn current() -> Self {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        let (name, home) = match nix::unistd::User::from_uid(uid) {
            Ok(Some(user)) => (user.name, user.dir),
            _ => (
                uid.to_string(),
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/")),
            ),
        };
        Self {
            name,
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            home,
        }
    }
}

/// Resolves user names to identities.
pub trait UserResolver {
    /// Looks up `name`.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::UnknownUser`] if there is no such user.
    fn resolve(&self, name: &str) -> Result<UserIdentity, WatcherError>;
}

/// Resolver backed by the system user database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserResolver for SystemUsers {
    fn resolve(&self, name: &str) -> Result<UserIdentity, WatcherError> {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Ok(UserIdentity {
                name: user.name,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                home: user.dir,
            }),
            Ok(None) => Err(WatcherError::UnknownUser(name.to_string())),
            Err(errno) => Err(WatcherError::UnknownUser(format!("{name} ({errno})"))),
        }
    }
}

/// One watched (project, package, repository, architecture) tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    /// Label of the configuration entry.
    pub name: String,
    /// Build service project.
    pub project: String,
    /// Package name.
    pub package: String,
    /// Repository name.
    pub repo: String,
    /// Architecture the package is built on, matched against the event.
    pub build_arch: String,
    /// Architecture of the resulting packages (e.g. `noarch`).
    pub pkg_arch: String,
    /// User the download runs as and who owns the artifact directory.
    pub user: String,
    /// Command launched after a successful install.
    pub trigger_cmd: String,
    /// Resolved identity of `user`.
    pub identity: UserIdentity,
}

impl WatchEntry {
    /// True if this entry watches the given build.
    pub fn matches(&self, project: &str, package: &str, repo: &str, arch: &str) -> bool {
        self.project == project
            && self.package == package
            && self.repo == repo
            && self.build_arch == arch
    }
}

impl fmt::Display for WatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.package, self.project, self.repo, self.build_arch
        )
    }
}

/// Ordered, read-only collection of watch entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    entries: Vec<WatchEntry>,
}

impl WatchList {
    /// Creates a watch-list; order is preserved and decides ties.
    pub fn new(entries: Vec<WatchEntry>) -> Self {
        Self { entries }
    }

    /// First entry watching the given build, if any.
    pub fn find(&self, project: &str, package: &str, repo: &str, arch: &str) -> Option<&WatchEntry> {
        self.entries
            .iter()
            .find(|entry| entry.matches(project, package, repo, arch))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in configuration order.
    pub fn iter(&self) -> std::slice::Iter<'_, WatchEntry> {
        self.entries.iter()
    }

    /// One line per entry, for the startup log.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<'a> IntoIterator for &'a WatchList {
    type Item = &'a WatchEntry;
    type IntoIter = std::slice::Iter<'a, WatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::watch_entry;

    #[test]
    fn test_find_exact_match() {
        let list = WatchList::new(vec![
            watch_entry("home:x", "foo", "SLE_15", "x86_64"),
            watch_entry("home:x", "bar", "SLE_15", "x86_64"),
        ]);
        let hit = list.find("home:x", "bar", "SLE_15", "x86_64").unwrap();
        assert_eq!(hit.package, "bar");
    }

    #[test]
    fn test_find_requires_all_four_fields() {
        let list = WatchList::new(vec![watch_entry("home:x", "foo", "SLE_15", "x86_64")]);
        assert!(list.find("home:x", "foo", "SLE_15", "aarch64").is_none());
        assert!(list.find("home:x", "foo", "SLE_12", "x86_64").is_none());
        assert!(list.find("home:y", "foo", "SLE_15", "x86_64").is_none());
        assert!(list.find("home:x", "fo", "SLE_15", "x86_64").is_none());
    }

    #[test]
    fn test_find_first_match_wins() {
        let mut first = watch_entry("home:x", "foo", "SLE_15", "x86_64");
        first.name = "first".to_string();
        let mut second = watch_entry("home:x", "foo", "SLE_15", "x86_64");
        second.name = "second".to_string();
        let list = WatchList::new(vec![first, second]);

        let hit = list.find("home:x", "foo", "SLE_15", "x86_64").unwrap();
        assert_eq!(hit.name, "first");
    }

    #[test]
    fn test_matches_uses_build_arch_not_pkg_arch() {
        let mut entry = watch_entry("home:x", "foo", "SLE_15", "x86_64");
        entry.pkg_arch = "noarch".to_string();
        assert!(entry.matches("home:x", "foo", "SLE_15", "x86_64"));
        assert!(!entry.matches("home:x", "foo", "SLE_15", "noarch"));
    }

    #[test]
    fn test_summary_lists_entries() {
        let list = WatchList::new(vec![
            watch_entry("home:x", "foo", "SLE_15", "x86_64"),
            watch_entry("devel:tools", "gcc", "openSUSE_Tumbleweed", "aarch64"),
        ]);
        let summary = list.summary();
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.contains("foo\thome:x\tSLE_15"));
        assert!(summary.contains("gcc\tdevel:tools"));
    }

    #[test]
    fn test_empty_list() {
        let list = WatchList::default();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.find("a", "b", "c", "d").is_none());
    }

    #[test]
    fn test_system_users_resolves_root() {
        let identity = SystemUsers.resolve("root").unwrap();
        assert_eq!(identity.uid, 0);
        assert_eq!(identity.name, "root");
        assert!(identity.home.is_absolute());
    }

    #[test]
    fn test_system_users_unknown_user() {
        let result = SystemUsers.resolve("no-such-user-obs-watcher");
        assert!(matches!(result, Err(WatcherError::UnknownUser(_))));
    }

    #[test]
    fn test_current_identity_matches_process() {
        let identity = UserIdentity::current();
        assert_eq!(identity.uid, nix::unistd::getuid().as_raw());
        assert_eq!(identity.gid, nix::unistd::getgid().as_raw());
    }
}
