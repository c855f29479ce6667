use std::fmt;
use std::str::FromStr;

use crate::error::{FsError, Result};
use crate::layout::{MAX_FILENAME, MAX_PATHNAME, MAX_USERNAME};

/// An absolute path split into validated components.
///
/// A valid path starts with `/`, is at most [`MAX_PATHNAME`] bytes long and has at least
/// one component. Components are non-empty, at most [`MAX_FILENAME`] bytes and contain no
/// whitespace or NUL. The root itself (`/`) is not addressable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPath {
    components: Vec<String>,
}

impl FsPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.len() > MAX_PATHNAME {
            return Err(invalid(format!("path longer than {} bytes", MAX_PATHNAME)));
        }
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| invalid("path must start with \"/\"".to_string()))?;

        let components = rest
            .split('/')
            .map(|name| check_component(name).map(|_| name.to_string()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { components })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Every component except the last.
    pub fn parent(&self) -> &[String] {
        &self.components[..self.components.len() - 1]
    }

    /// The last component.
    pub fn name(&self) -> &str {
        &self.components[self.components.len() - 1]
    }
}

impl FromStr for FsPath {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.components {
            write!(f, "/{}", name)?;
        }
        Ok(())
    }
}

fn invalid(reason: String) -> FsError {
    FsError::InvalidArgument(reason)
}

fn check_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("empty path component".to_string()));
    }
    if name.len() > MAX_FILENAME {
        return Err(invalid(format!(
            "path component longer than {} bytes",
            MAX_FILENAME
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(invalid(format!("bad character in {:?}", name)));
    }
    Ok(())
}

/// Checks a requester or owner name: non-empty, at most [`MAX_USERNAME`] bytes, no
/// whitespace or NUL.
pub fn check_username(user: &str) -> Result<()> {
    if user.is_empty() || user.len() > MAX_USERNAME {
        return Err(invalid(format!(
            "username must be 1 to {} bytes",
            MAX_USERNAME
        )));
    }
    if user.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(invalid(format!("bad character in username {:?}", user)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_components() {
        let path = FsPath::parse("/alice/docs/note").unwrap();
        assert_eq!(path.components(), &["alice", "docs", "note"]);
        assert_eq!(path.parent(), &["alice", "docs"]);
        assert_eq!(path.name(), "note");
        assert_eq!(path.to_string(), "/alice/docs/note");
    }

    #[test]
    fn top_level_entry_has_empty_parent() {
        let path: FsPath = "/alice".parse().unwrap();
        assert!(path.parent().is_empty());
        assert_eq!(path.name(), "alice");
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", "/", "alice", "//alice", "/alice/", "/a//b", "/a b", "/a\0b"] {
            assert!(
                matches!(FsPath::parse(bad), Err(FsError::InvalidArgument(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn enforces_length_limits() {
        let longest = format!("/{}", "n".repeat(MAX_FILENAME));
        assert!(FsPath::parse(&longest).is_ok());
        let too_long = format!("/{}", "n".repeat(MAX_FILENAME + 1));
        assert!(FsPath::parse(&too_long).is_err());

        // Three 42 byte components make a 129 byte path.
        let component = "c".repeat(42);
        let path = format!("/{0}/{0}/{0}", component);
        assert_eq!(path.len(), MAX_PATHNAME + 1);
        assert!(FsPath::parse(&path).is_err());
        assert!(FsPath::parse(&path[..MAX_PATHNAME]).is_ok());
    }

    #[test]
    fn usernames() {
        assert!(check_username("alice").is_ok());
        assert!(check_username(&"u".repeat(MAX_USERNAME)).is_ok());
        assert!(check_username(&"u".repeat(MAX_USERNAME + 1)).is_err());
        assert!(check_username("").is_err());
        assert!(check_username("al ice").is_err());
    }
}
