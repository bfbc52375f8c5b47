//! Collision-free naming inside the receive directory.
//!
//! [`resolve`] is a plain existence check and only best-effort under
//! concurrent callers. [`create_unique`] closes the gap by creating the file
//! with `create_new` and checking again if another connection won the name.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs::{self, File, OpenOptions};

/// Picks `dir/requested`, or `stem (N)ext` for the smallest free `N`.
/// Returns the path and whether the name had to be altered.
pub async fn resolve(dir: &Path, requested: &str) -> io::Result<(PathBuf, bool)> {
    let first = dir.join(requested);
    if !fs::try_exists(&first).await? {
        return Ok((first, false));
    }

    let (stem, ext) = split_name(requested);
    let mut counter: u64 = 1;
    loop {
        let candidate = dir.join(format!("{stem} ({counter}){ext}"));
        if !fs::try_exists(&candidate).await? {
            return Ok((candidate, true));
        }
        counter += 1;
    }
}

/// Resolves a name and creates the file atomically. Retries the resolution
/// when the chosen name is taken between the check and the create.
pub async fn create_unique(dir: &Path, requested: &str) -> io::Result<(File, PathBuf, bool)> {
    loop {
        let (path, renamed) = resolve(dir, requested).await?;
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path, renamed)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                log::debug!("lost naming race for {path:?}, resolving again");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Splits like `stem` + `ext` where `ext` keeps its dot. Leading dots belong
/// to the stem, so `.bashrc` has no extension.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if name[..idx].chars().any(|c| c != '.') => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Final path component as a display name for the peer.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
