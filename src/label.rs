//! Snapshot label validation.
//!
//! A snapshot label doubles as the PostgreSQL backup label, the name of the
//! snapshot directory under the destination root, the suffix of the published
//! volume name and an annotation value. [`SnapshotLabel`] can only be built
//! through [`validate`], so any path, program argument or SQL parameter that
//! carries a label has already passed the checks below.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Prefix used when a label has to be synthesised rather than copied from a
/// request uid.
pub const GENERATED_LABEL_PREFIX: &str = "snap-";

/// Reasons a candidate label is refused.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LabelError {
    /// The candidate is empty or only whitespace.
    #[error("snapshot label must not be empty")]
    Empty,
    /// The candidate has no alphabetic character.
    #[error("snapshot label '{0}' must contain at least one letter")]
    NoLetter(String),
    /// The candidate contains a path separator.
    #[error("snapshot label '{0}' must not contain '/'")]
    PathSeparator(String),
    /// The candidate contains an ASCII control character.
    #[error("snapshot label must not contain control characters")]
    ControlCharacter,
}

/// A label that passed [`validate`].
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SnapshotLabel(String);

impl SnapshotLabel {
    /// Returns the label text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotLabel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates `candidate` and wraps it in a [`SnapshotLabel`].
///
/// # Errors
///
/// Returns [`LabelError`] when the candidate is blank, lacks a letter,
/// contains `/` or contains a control character.
///
/// # Examples
///
/// ```
/// use pg_reflinker::label::validate;
///
/// assert!(validate("snap-2024-01-01-abc").is_ok());
/// assert!(validate("a/b").is_err());
/// ```
pub fn validate(candidate: &str) -> Result<SnapshotLabel, LabelError> {
    if candidate.trim().is_empty() {
        return Err(LabelError::Empty);
    }
    if candidate.chars().any(char::is_control) {
        return Err(LabelError::ControlCharacter);
    }
    if candidate.contains('/') {
        return Err(LabelError::PathSeparator(candidate.to_owned()));
    }
    if !candidate.chars().any(char::is_alphabetic) {
        return Err(LabelError::NoLetter(candidate.to_owned()));
    }
    Ok(SnapshotLabel(candidate.to_owned()))
}

/// Derives the label for a request.
///
/// The request uid is used verbatim when it is a valid label, so recreating
/// the same request lands on the same directory and volume name. A uid
/// without letters gets the [`GENERATED_LABEL_PREFIX`]. A fresh random label
/// is produced only when no uid is known yet.
///
/// # Errors
///
/// Returns [`LabelError`] when the uid cannot be turned into a valid label,
/// for example because it contains `/`.
pub fn derive(uid: Option<&str>) -> Result<SnapshotLabel, LabelError> {
    let Some(raw) = uid.map(str::trim).filter(|value| !value.is_empty()) else {
        return validate(&format!("{GENERATED_LABEL_PREFIX}{}", Uuid::new_v4()));
    };

    match validate(raw) {
        Err(LabelError::NoLetter(_)) => validate(&format!("{GENERATED_LABEL_PREFIX}{raw}")),
        other => other,
    }
}
