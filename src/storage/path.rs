use std::path::PathBuf;

use super::StorageError;

/// Expands a leading `~` or `$HOME` path segment against `HOME`. Used for
/// every configured directory: storage, definitions, mail spool.
pub fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let relative = ["~", "$HOME"].iter().find_map(|prefix| {
        let rest = raw_path.strip_prefix(prefix)?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    });
    let Some(relative) = relative else {
        return Ok(PathBuf::from(raw_path));
    };

    let home = std::env::var_os("HOME").ok_or(StorageError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(relative.trim_start_matches('/')))
}
