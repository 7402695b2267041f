//! Path containment checks.
//!
//! Every path that reaches the filesystem goes through here twice: once
//! lexically, on the joined path, and once on the real (symlink-expanded)
//! path. A symlink inside a mount can point anywhere, so a lexically clean
//! path proves nothing on its own.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

use super::error::{VfsError, VfsResult};

/// How many rounds of percent-decoding to inspect for `..` segments.
///
/// Covers `%2e%2e` and double-encoded `%252e%252e`; deeper nesting would
/// need as many decoding layers upstream to ever become a real `..`.
const MAX_DECODE_ROUNDS: usize = 3;

/// Validate `user_path` against `root` and return `root/clean(user_path)`.
///
/// `root` must already be canonical (mount roots are canonicalized when the
/// mount is built). The returned path is the lexical join; its real path has
/// been checked to stay under `root` as well.
///
/// Fails with [`VfsError::PathTraversal`] if either check fails and with
/// [`VfsError::NotFound`] if the target does not exist.
pub fn safe(root: &Path, user_path: &str) -> VfsResult<PathBuf> {
    let joined = lexical(root, user_path)?;
    let real = dunce::canonicalize(&joined).map_err(|e| VfsError::from_io(e, user_path))?;
    contain(root, &real)?;
    Ok(joined)
}

/// The I/O-free half of [`safe`]: reject traversal, join and clean.
pub fn lexical(root: &Path, user_path: &str) -> VfsResult<PathBuf> {
    reject_traversal(user_path)?;

    let mut joined = root.to_path_buf();
    for segment in clean_segments(user_path) {
        joined.push(segment);
    }

    // Catches anything `push` treats as absolute (drive prefixes on Windows).
    contain(root, &joined)?;
    Ok(joined)
}

/// Check that `candidate` is `root` or lies beneath it.
///
/// Comparison is component-wise, so `/srv/docs-private` is not under
/// `/srv/docs`.
pub fn contain(root: &Path, candidate: &Path) -> VfsResult<()> {
    if candidate.starts_with(root) {
        Ok(())
    } else {
        Err(VfsError::PathTraversal)
    }
}

/// Reject NUL bytes and `..` segments in the raw input or any of its
/// percent-decoded forms, before any cleaning happens.
pub fn reject_traversal(user_path: &str) -> VfsResult<()> {
    let mut current = Cow::Borrowed(user_path);

    for _ in 0..=MAX_DECODE_ROUNDS {
        if current.contains('\0') {
            return Err(VfsError::invalid_path("embedded NUL byte"));
        }
        if has_parent_segment(&current) {
            return Err(VfsError::PathTraversal);
        }

        let decoded = percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if decoded == current {
            break;
        }
        current = Cow::Owned(decoded);
    }

    Ok(())
}

/// Split a request path into the segments that survive lexical cleaning.
///
/// Empty and `.` segments are dropped. `..` never reaches this point.
pub fn clean_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}
