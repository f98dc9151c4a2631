use crate::error::{CurtainError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File name constants
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "curtain.yaml";

pub const LOCAL_STATE_FILE: &str = "state.yaml";
pub const LOCAL_LOCK_FILE: &str = "migration.lock";

pub const REVISION_EXT: &str = "yaml";

/// `strftime` layout of revision versions; sorts lexically in time order.
pub const REVISION_VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn local_state_path(store_dir: &Path) -> PathBuf {
    store_dir.join(LOCAL_STATE_FILE)
}

pub fn local_lock_path(store_dir: &Path) -> PathBuf {
    store_dir.join(LOCAL_LOCK_FILE)
}

pub fn revision_path(scripts_dir: &Path, version: &str, slug: &str) -> PathBuf {
    scripts_dir.join(format!("{version}_{slug}.{REVISION_EXT}"))
}

/// Walk upward from `start` looking for [`CONFIG_FILE`].
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Revision slugs
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Turn a free-form revision message into a file-name slug.
pub fn slugify(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    for ch in message.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug: String = slug.chars().take(48).collect();
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "revision".to_string()
    } else {
        slug
    }
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 64 || !slug_re().is_match(slug) {
        return Err(CurtainError::InvalidConfig(format!(
            "invalid revision slug '{slug}': must be lowercase alphanumeric with underscores"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn slugify_messages() {
        assert_eq!(slugify("Add user email"), "add_user_email");
        assert_eq!(slugify("  drop -- legacy   table!! "), "drop_legacy_table");
        assert_eq!(slugify("***"), "revision");
        for s in ["add_user_email", "drop_legacy_table", "revision"] {
            validate_slug(s).unwrap();
        }
    }

    #[test]
    fn invalid_slugs() {
        for slug in ["", "_lead", "trail_", "has space", "UPPER", "a-b"] {
            assert!(validate_slug(slug).is_err(), "expected invalid: {slug}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/srv/app");
        assert_eq!(
            revision_path(&root.join("migrations"), "20261019120000", "init"),
            PathBuf::from("/srv/app/migrations/20261019120000_init.yaml")
        );
        assert_eq!(
            resolve_against(root, Path::new("state")),
            PathBuf::from("/srv/app/state")
        );
        assert_eq!(
            resolve_against(root, Path::new("/var/state")),
            PathBuf::from("/var/state")
        );
    }

    #[test]
    fn find_config_walks_upward() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "version: 1\n").unwrap();
        let deep = dir.path().join("services/auth/src");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_config(&deep), Some(dir.path().join(CONFIG_FILE)));
    }
}
