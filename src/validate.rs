//! Identifier validation.
//!
//! Every string that originates outside the engine (commit hashes, branch
//! names, backup ids, file paths) must pass the relevant check here before it
//! is handed to a subprocess argument vector or joined into a filesystem
//! path. These are pure, total functions with no I/O.

/// Check whether `s` is a plausible commit hash: 7 to 40 hex characters.
pub fn is_valid_hash(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check whether `s` is an acceptable branch or ref name.
///
/// Accepts names starting with an alphanumeric or underscore followed by
/// word characters, `-`, `/` and `.`. Rejects `..`, `//`, and names longer
/// than 255 bytes — the subset of git's ref rules this engine ever produces
/// or consumes.
pub fn is_valid_branch_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    if s.contains("..") || s.contains("//") {
        return false;
    }
    let mut bytes = s.bytes();
    let first = bytes.next().unwrap_or(b'.');
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return false;
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/' | b'.'))
}

/// Check whether `s` is a well-formed snapshot backup id.
///
/// Backup ids are used to build filesystem paths, so this is the invariant
/// that keeps a crafted id from escaping the snapshot directory: only
/// `backup-` followed by word characters and dashes, no `..`, no path
/// separators, 8 to 255 bytes.
pub fn is_valid_backup_id(s: &str) -> bool {
    if !(8..=255).contains(&s.len()) {
        return false;
    }
    if s.contains("..") || s.contains('/') || s.contains('\\') {
        return false;
    }
    let Some(rest) = s.strip_prefix("backup-") else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
}

/// Check whether `s` is an acceptable relative file path.
///
/// Rejects shell-metacharacter-adjacent bytes (`<>"|?*`) and any colon that
/// is not a single leading drive-letter colon.
pub fn is_valid_path(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.bytes().any(|b| matches!(b, b'<' | b'>' | b'"' | b'|' | b'?' | b'*' | 0)) {
        return false;
    }
    for (i, b) in s.bytes().enumerate() {
        if b == b':' {
            let drive_colon = i == 1 && s.as_bytes()[0].is_ascii_alphabetic();
            if !drive_colon {
                return false;
            }
        }
    }
    true
}
