// Migration configuration: workspace-relative defaults with environment overrides.
use std::path::{Path, PathBuf};

pub const DUMP_DIR: &str = "legacy";
pub const MAPPING_DIR: &str = "mappings";
pub const DUMP_EXTENSION: &str = "sql";
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@legacy-migration.local";

pub const ENV_DUMP_DIR: &str = "MIGRATE_DUMP_DIR";
pub const ENV_MAPPING_DIR: &str = "MIGRATE_MAPPING_DIR";
pub const ENV_DEFAULT_ADMIN_EMAIL: &str = "MIGRATE_DEFAULT_ADMIN_EMAIL";
pub const ENV_SUPER_ADMIN_EMAILS: &str = "MIGRATE_SUPER_ADMIN_EMAILS";

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    pub dump_dir: PathBuf,
    pub mapping_dir: PathBuf,
    /// Account that owns records whose legacy creator cannot be mapped.
    pub default_admin_email: String,
    /// Addresses that always become the highest-privilege role.
    pub super_admin_emails: Vec<String>,
}

impl MigrationConfig {
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            dump_dir: workspace.join(DUMP_DIR),
            mapping_dir: workspace.join(MAPPING_DIR),
            default_admin_email: DEFAULT_ADMIN_EMAIL.to_string(),
            super_admin_emails: Vec::new(),
        }
    }

    /// Workspace defaults, then any `MIGRATE_*` variables from the environment.
    pub fn from_env(workspace: &Path) -> Self {
        let mut cfg = Self::for_workspace(workspace);
        if let Ok(v) = std::env::var(ENV_DUMP_DIR) {
            cfg.dump_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(ENV_MAPPING_DIR) {
            cfg.mapping_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(ENV_DEFAULT_ADMIN_EMAIL) {
            if !v.trim().is_empty() {
                cfg.default_admin_email = v.trim().to_ascii_lowercase();
            }
        }
        if let Ok(v) = std::env::var(ENV_SUPER_ADMIN_EMAILS) {
            cfg.super_admin_emails = parse_email_list(&v);
        }
        cfg
    }

    pub fn dump_path(&self, table: &str) -> PathBuf {
        self.dump_dir.join(format!("{table}.{DUMP_EXTENSION}"))
    }
}

fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_defaults() {
        let cfg = MigrationConfig::for_workspace(Path::new("/tmp/ws"));
        assert_eq!(cfg.dump_path("users"), PathBuf::from("/tmp/ws/legacy/users.sql"));
        assert_eq!(cfg.mapping_dir, PathBuf::from("/tmp/ws/mappings"));
        assert_eq!(cfg.default_admin_email, DEFAULT_ADMIN_EMAIL);
    }

    #[test]
    fn email_list_is_normalised() {
        assert_eq!(
            parse_email_list(" Ops@Example.com,, owner@example.com "),
            vec!["ops@example.com".to_string(), "owner@example.com".to_string()]
        );
    }
}
