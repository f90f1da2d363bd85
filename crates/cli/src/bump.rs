//! Semantic version bumping for release tags like `v1.0.13`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Increment {
    Major,
    Minor,
    #[default]
    Patch,
}

impl Increment {
    /// Anything other than `major` or `minor` (including empty) bumps the patch.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" => Increment::Major,
            "minor" => Increment::Minor,
            _ => Increment::Patch,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BumpError {
    #[error("version string {0:?} does not match expected format (e.g., v1.0.13)")]
    Format(String),
    #[error("invalid {part} version {value:?}")]
    Component { part: &'static str, value: String },
    #[error("{part} version is already at its maximum")]
    Overflow { part: &'static str },
}

/// Bump `current` (`vMAJOR.MINOR.PATCH`, leading `v` optional) and return it with a `v` prefix.
/// Components must be non-negative integers that fit in a `u64`.
pub fn bump_version(current: &str, increment: &str) -> Result<String, BumpError> {
    let version = current.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let parts: Vec<&str> = version.split('.').collect();
    let [major, minor, patch] = parts.as_slice() else {
        return Err(BumpError::Format(current.to_string()));
    };
    let parse = |part: &'static str, value: &str| {
        value
            .parse::<u64>()
            .map_err(|_| BumpError::Component { part, value: value.to_string() })
    };
    let (major, minor, patch) = (parse("major", *major)?, parse("minor", *minor)?, parse("patch", *patch)?);
    let next = |part: &'static str, value: u64| value.checked_add(1).ok_or(BumpError::Overflow { part });

    let (major, minor, patch) = match Increment::parse_lenient(increment) {
        Increment::Major => (next("major", major)?, 0, 0),
        Increment::Minor => (major, next("minor", minor)?, 0),
        Increment::Patch => (major, minor, next("patch", patch)?),
    };
    Ok(format!("v{}.{}.{}", major, minor, patch))
}
