//! Doc string parsing: split `<remote><path>` addresses and join them back.
//!
//! A doc doubles as the stable external document ID and as the backend
//! address, so the split/join helpers must round-trip: re-listing a parent
//! produces exactly the doc strings handed out before. Trailing slashes are
//! never part of a canonical doc.

/// Malformed doc or remote-name input. Always the caller's fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("{0:?} has no remote delimiter")]
    NoRemote(String),
    #[error("invalid remote name {0:?}")]
    InvalidName(String),
    #[error("{0:?} is a directory, expected a file")]
    IsDirectory(String),
}

/// Check that a remote name is acceptable for a config section.
///
/// Accepts ASCII alphanumerics plus `_ - . + @` and inner spaces. A name
/// may not be empty, start with `-` or a space, or end with a space.
pub fn check_remote_name(name: &str) -> Result<(), ParseError> {
    let invalid = || ParseError::InvalidName(name.to_string());

    if name.is_empty() || name.starts_with('-') || name.starts_with(' ') || name.ends_with(' ') {
        return Err(invalid());
    }

    for ch in name.chars() {
        let ok = ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+' | '@' | ' ');
        if !ok {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Split a doc into `(remote, path)` where the remote keeps its trailing
/// colon. Fails if the doc has no remote delimiter before any path
/// separator.
pub fn split_remote(doc: &str) -> Result<(String, String), ParseError> {
    let idx = match doc.find(':') {
        Some(idx) => idx,
        None => return Err(ParseError::NoRemote(doc.to_string())),
    };

    let name = &doc[..idx];
    // A slash before the delimiter means the colon belongs to a path
    // component, not a remote name.
    if name.is_empty() || name.contains('/') {
        return Err(ParseError::NoRemote(doc.to_string()));
    }
    check_remote_name(name)?;

    Ok((format!("{name}:"), doc[idx + 1..].to_string()))
}

/// Split a doc into `(parent_doc, leaf_name)`.
///
/// The parent has any trailing slash stripped so that it matches the doc
/// string a listing of the grandparent would produce.
pub fn split_parent_leaf(doc: &str) -> Result<(String, String), ParseError> {
    let (remote, path) = split_remote(doc)?;

    let (parent_raw, leaf) = match path.rfind('/') {
        Some(idx) => (
            format!("{remote}{}", &path[..=idx]),
            path[idx + 1..].to_string(),
        ),
        None => (remote, path),
    };

    Ok((parent_raw.trim_end_matches('/').to_string(), leaf))
}

/// Join a parent doc with a leaf name, the inverse of [`split_parent_leaf`]
/// for well-formed inputs.
pub fn join(parent_doc: &str, leaf_name: &str) -> String {
    let base = parent_doc.trim_end_matches('/');
    if leaf_name.is_empty() {
        return base.to_string();
    }
    if base.ends_with(':') {
        format!("{base}{leaf_name}")
    } else {
        format!("{base}/{leaf_name}")
    }
}

/// Decide how an operation should address a doc on its backend.
///
/// Returns `(root_doc, name)`: the doc to root the backend at and the leaf
/// name to operate on. With `treat_as_file` the doc is addressed through
/// its parent, and a doc with an empty leaf (a bare remote root) is
/// rejected because a file-target operation cannot aim at a directory.
/// Without it, the doc itself is the root; whether the node turns out to be
/// a file is for the caller to probe against the backend.
pub fn resolve_for_operation(doc: &str, treat_as_file: bool) -> Result<(String, String), ParseError> {
    if treat_as_file {
        let (parent, leaf) = split_parent_leaf(doc)?;
        if leaf.is_empty() {
            return Err(ParseError::IsDirectory(doc.to_string()));
        }
        Ok((parent, leaf))
    } else {
        // Validate even though the doc passes through unchanged.
        split_remote(doc)?;
        Ok((doc.to_string(), String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_remote_basic() {
        assert_eq!(
            split_remote("gdrive:/a/b").unwrap(),
            ("gdrive:".to_string(), "/a/b".to_string())
        );
        assert_eq!(
            split_remote("gdrive:").unwrap(),
            ("gdrive:".to_string(), String::new())
        );
    }

    #[test]
    fn split_remote_rejects_missing_delimiter() {
        assert!(matches!(
            split_remote("noremotehere"),
            Err(ParseError::NoRemote(_))
        ));
        assert!(matches!(
            split_remote("dir/with:colon"),
            Err(ParseError::NoRemote(_))
        ));
        assert!(matches!(split_remote(":path"), Err(ParseError::NoRemote(_))));
    }

    #[test]
    fn split_parent_leaf_strips_trailing_slash() {
        assert_eq!(
            split_parent_leaf("gdrive:/a/b").unwrap(),
            ("gdrive:/a".to_string(), "b".to_string())
        );
        assert_eq!(
            split_parent_leaf("gdrive:/a/").unwrap(),
            ("gdrive:/a".to_string(), String::new())
        );
        assert_eq!(
            split_parent_leaf("gdrive:name").unwrap(),
            ("gdrive:".to_string(), "name".to_string())
        );
        assert_eq!(
            split_parent_leaf("gdrive:").unwrap(),
            ("gdrive:".to_string(), String::new())
        );
    }

    #[test]
    fn join_inverts_split() {
        for doc in ["gdrive:/a/b", "gdrive:a/b/c", "gdrive:name", "s3:x y/z.txt"] {
            let (parent, leaf) = split_parent_leaf(doc).unwrap();
            assert_eq!(join(&parent, &leaf), doc);
        }

        // A trailing slash is dropped on reconstruction.
        let (parent, leaf) = split_parent_leaf("gdrive:/a/b/").unwrap();
        assert_eq!(join(&parent, &leaf), "gdrive:/a/b");
    }

    #[test]
    fn join_at_remote_root() {
        assert_eq!(join("gdrive:", "file.txt"), "gdrive:file.txt");
        assert_eq!(join("gdrive:dir", "file.txt"), "gdrive:dir/file.txt");
        assert_eq!(join("gdrive:dir", ""), "gdrive:dir");
    }

    #[test]
    fn resolve_for_operation_file_target() {
        assert_eq!(
            resolve_for_operation("gdrive:/a/b", true).unwrap(),
            ("gdrive:/a".to_string(), "b".to_string())
        );
        assert!(matches!(
            resolve_for_operation("gdrive:", true),
            Err(ParseError::IsDirectory(_))
        ));
    }

    #[test]
    fn resolve_for_operation_directory_target() {
        assert_eq!(
            resolve_for_operation("gdrive:/a/b", false).unwrap(),
            ("gdrive:/a/b".to_string(), String::new())
        );
    }

    #[test]
    fn remote_name_charset() {
        assert!(check_remote_name("my-remote.2+test@x").is_ok());
        assert!(check_remote_name("two words").is_ok());
        assert!(check_remote_name("").is_err());
        assert!(check_remote_name("-leading").is_err());
        assert!(check_remote_name(" leading").is_err());
        assert!(check_remote_name("trailing ").is_err());
        assert!(check_remote_name("bad/slash").is_err());
        assert!(check_remote_name("colon:name").is_err());
    }
}
