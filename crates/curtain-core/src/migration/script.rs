use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};
use crate::paths;
use crate::schema::SchemaChange;

// ---------------------------------------------------------------------------
// RevisionScript
// ---------------------------------------------------------------------------

/// One forward change set. `parent` is `None` only for the base revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionScript {
    pub version: String,
    pub parent: Option<String>,
    pub name: String,
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl RevisionScript {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut script: RevisionScript =
            serde_yaml::from_str(&data).map_err(|e| MigrationError::InvalidScript {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let prefix = stem.split('_').next().unwrap_or("");
        if prefix != script.version {
            return Err(MigrationError::InvalidScript {
                path: path.to_path_buf(),
                reason: format!(
                    "file name prefix '{prefix}' does not match version '{}'",
                    script.version
                ),
            }
            .into());
        }
        script.path = path.to_path_buf();
        Ok(script)
    }
}

// ---------------------------------------------------------------------------
// ScriptDir
// ---------------------------------------------------------------------------

/// The scripts directory, validated as a single linear chain from base to head.
#[derive(Debug, Clone, Default)]
pub struct ScriptDir {
    pub dir: PathBuf,
    /// Scripts in chain order, base first.
    chain: Vec<RevisionScript>,
}

impl ScriptDir {
    /// Load every `*.yaml` revision in `dir`. A missing directory is an empty chain.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut scripts = Vec::new();
        if dir.exists() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.extension().and_then(|x| x.to_str()) == Some(paths::REVISION_EXT)
                })
                .collect();
            entries.sort();
            for path in entries {
                scripts.push(RevisionScript::load(&path)?);
            }
        }
        let chain = link_chain(dir, scripts)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            chain,
        })
    }

    pub fn scripts(&self) -> &[RevisionScript] {
        &self.chain
    }

    pub fn head(&self) -> Option<&str> {
        self.chain.last().map(|s| s.version.as_str())
    }

    pub fn contains(&self, version: &str) -> bool {
        self.chain.iter().any(|s| s.version == version)
    }

    /// Scripts not yet in `applied`, in chain order.
    pub fn pending<'a>(&'a self, applied: &[String]) -> Vec<&'a RevisionScript> {
        let done: HashSet<&str> = applied.iter().map(String::as_str).collect();
        self.chain
            .iter()
            .filter(|s| !done.contains(s.version.as_str()))
            .collect()
    }

    /// Write a new head revision holding `changes` and return it.
    pub fn write_revision(&mut self, message: &str, changes: Vec<SchemaChange>) -> Result<RevisionScript> {
        let parent = self.head().map(str::to_string);
        let mut version = Utc::now().format(paths::REVISION_VERSION_FORMAT).to_string();
        if let Some(p) = &parent {
            if version.as_str() <= p.as_str() {
                version = bump_version(p);
            }
        }
        let slug = paths::slugify(message);
        paths::validate_slug(&slug)?;
        let path = paths::revision_path(&self.dir, &version, &slug);
        let script = RevisionScript {
            version,
            parent,
            name: message.to_string(),
            changes,
            path: path.clone(),
        };
        let yaml = serde_yaml::to_string(&script)?;
        if !crate::io::write_new(&path, yaml.as_bytes())? {
            return Err(MigrationError::RevisionExists(path).into());
        }
        self.chain.push(script.clone());
        Ok(script)
    }
}

/// Next version after `v`: numeric increment when `v` is all digits.
fn bump_version(v: &str) -> String {
    match v.parse::<u64>() {
        Ok(n) => format!("{:0width$}", n + 1, width = v.len()),
        Err(_) => format!("{v}1"),
    }
}

fn link_chain(dir: &Path, scripts: Vec<RevisionScript>) -> Result<Vec<RevisionScript>> {
    let broken = |reason: String| MigrationError::ChainBroken {
        dir: dir.to_path_buf(),
        reason,
    };
    if scripts.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_version: BTreeMap<String, RevisionScript> = BTreeMap::new();
    for script in scripts {
        if let Some(prev) = by_version.get(&script.version) {
            return Err(broken(format!(
                "version {} appears in both {} and {}",
                script.version,
                prev.path.display(),
                script.path.display()
            ))
            .into());
        }
        by_version.insert(script.version.clone(), script);
    }

    let mut children: BTreeMap<Option<&str>, Vec<&str>> = BTreeMap::new();
    for script in by_version.values() {
        if let Some(parent) = &script.parent {
            if !by_version.contains_key(parent) {
                return Err(broken(format!(
                    "revision {} names missing parent {parent}",
                    script.version
                ))
                .into());
            }
        }
        children
            .entry(script.parent.as_deref())
            .or_default()
            .push(script.version.as_str());
    }

    for (parent, kids) in &children {
        if kids.len() > 1 {
            let at = parent.unwrap_or("base");
            return Err(broken(format!("branch at {at}: {}", kids.join(", "))).into());
        }
    }

    let mut order = Vec::with_capacity(by_version.len());
    let mut cursor: Option<&str> = None;
    while let Some(next) = children.get(&cursor).and_then(|kids| kids.first()) {
        order.push(next.to_string());
        cursor = Some(*next);
    }
    if order.is_empty() {
        return Err(broken("no base revision (parent: null)".to_string()).into());
    }
    if order.len() != by_version.len() {
        return Err(broken("revisions form a cycle unreachable from base".to_string()).into());
    }

    Ok(order
        .into_iter()
        .filter_map(|v| by_version.remove(&v))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CurtainError;
    use tempfile::TempDir;

    fn write(dir: &Path, file: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), body).unwrap();
    }

    fn base(dir: &Path) {
        write(
            dir,
            "20261001090000_init.yaml",
            r#"
version: "20261001090000"
parent: null
name: init
changes:
  - op: create_table
    table: users
    columns:
      id: { type: uuid, nullable: false }
"#,
        );
    }

    fn second(dir: &Path) {
        write(
            dir,
            "20261002090000_add_email.yaml",
            r#"
version: "20261002090000"
parent: "20261001090000"
name: add email
changes:
  - op: add_column
    table: users
    column: email
    definition: { type: text }
"#,
        );
    }

    fn chain_error(err: CurtainError) -> String {
        match err {
            CurtainError::Migration(MigrationError::ChainBroken { reason, .. }) => reason,
            other => panic!("expected ChainBroken, got {other:?}"),
        }
    }

    #[test]
    fn missing_dir_is_empty_chain() {
        let dir = TempDir::new().unwrap();
        let scripts = ScriptDir::load(&dir.path().join("migrations")).unwrap();
        assert!(scripts.scripts().is_empty());
        assert_eq!(scripts.head(), None);
    }

    #[test]
    fn linear_chain_orders_base_first() {
        let dir = TempDir::new().unwrap();
        second(dir.path());
        base(dir.path());
        let scripts = ScriptDir::load(dir.path()).unwrap();
        let versions: Vec<_> = scripts.scripts().iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, ["20261001090000", "20261002090000"]);
        assert_eq!(scripts.head(), Some("20261002090000"));

        let pending = scripts.pending(&["20261001090000".to_string()]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "add email");
    }

    #[test]
    fn branching_is_rejected() {
        let dir = TempDir::new().unwrap();
        base(dir.path());
        second(dir.path());
        write(
            dir.path(),
            "20261003090000_other.yaml",
            "version: \"20261003090000\"\nparent: \"20261001090000\"\nname: other\n",
        );
        let reason = chain_error(ScriptDir::load(dir.path()).unwrap_err());
        assert!(reason.starts_with("branch at 20261001090000"), "{reason}");
    }

    #[test]
    fn missing_parent_is_rejected() {
        let dir = TempDir::new().unwrap();
        second(dir.path());
        let reason = chain_error(ScriptDir::load(dir.path()).unwrap_err());
        assert!(reason.contains("missing parent"), "{reason}");
    }

    #[test]
    fn two_bases_are_rejected() {
        let dir = TempDir::new().unwrap();
        base(dir.path());
        write(
            dir.path(),
            "20261005090000_again.yaml",
            "version: \"20261005090000\"\nparent: null\nname: again\n",
        );
        let reason = chain_error(ScriptDir::load(dir.path()).unwrap_err());
        assert!(reason.starts_with("branch at base"), "{reason}");
    }

    #[test]
    fn file_name_must_match_version() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "20261001090000_init.yaml",
            "version: \"20261001090001\"\nparent: null\nname: init\n",
        );
        let err = ScriptDir::load(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CurtainError::Migration(MigrationError::InvalidScript { .. })
        ));
    }

    #[test]
    fn write_revision_extends_head() {
        let dir = TempDir::new().unwrap();
        base(dir.path());
        let mut scripts = ScriptDir::load(dir.path()).unwrap();
        let change = SchemaChange::DropTable {
            table: "users".into(),
        };
        let script = scripts.write_revision("Drop users!", vec![change]).unwrap();
        assert_eq!(script.parent.as_deref(), Some("20261001090000"));
        assert!(script.path.ends_with(format!("{}_drop_users.yaml", script.version)));
        assert_eq!(scripts.head(), Some(script.version.as_str()));

        // round-trips through the directory as the new head
        let reloaded = ScriptDir::load(dir.path()).unwrap();
        assert_eq!(reloaded.head(), Some(script.version.as_str()));
        assert_eq!(reloaded.scripts().len(), 2);
    }

    #[test]
    fn version_stays_ahead_of_parent() {
        assert_eq!(bump_version("20991231235959"), "20991231235960");
        assert_eq!(bump_version("007"), "008");
    }
}
