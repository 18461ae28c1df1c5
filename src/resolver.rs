use crate::dump::SourceRow;
use crate::lookup::HIGHEST_ROLE;
use crate::mapping::IdMapping;
use crate::store::{Collection, Document, NaturalKey, TargetStore, MIGRATED_MARKER};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

pub const SENTINEL_ORGANISATION_NAME: &str = "Legacy Migration Org";

/// Legacy column naming the parent account in the `users` table.
const PARENT_COLUMN: &str = "admin_id";
const COMPANY_COLUMN: &str = "company_name";

/// Resolves legacy user ids to target organisation and user ids.
pub struct EntityResolver<'a, S: TargetStore + ?Sized> {
    store: &'a S,
    legacy_users: HashMap<i64, SourceRow>,
    organisations: HashMap<i64, String>,
    users: HashMap<i64, String>,
    default_admin_email: String,
    sentinel_org: Option<String>,
    default_admin: Option<String>,
}

impl<'a, S: TargetStore + ?Sized> EntityResolver<'a, S> {
    /// `legacy_users` are in dump order; a later row for the same id wins.
    pub fn new(store: &'a S, legacy_users: &[SourceRow], default_admin_email: &str) -> Self {
        let mut by_id = HashMap::new();
        for row in legacy_users {
            if let Some(id) = row.int("id") {
                by_id.insert(id, row.clone());
            }
        }
        Self {
            store,
            legacy_users: by_id,
            organisations: HashMap::new(),
            users: HashMap::new(),
            default_admin_email: default_admin_email.trim().to_ascii_lowercase(),
            sentinel_org: None,
            default_admin: None,
        }
    }

    pub fn with_organisations(mut self, mapping: &IdMapping) -> Self {
        for e in mapping.entries() {
            self.organisations.insert(e.old_id, e.new_id.clone());
        }
        self
    }

    pub fn with_users(mut self, mapping: &IdMapping) -> Self {
        for e in mapping.entries() {
            self.users.insert(e.old_id, e.new_id.clone());
        }
        self
    }

    pub fn register_organisation(&mut self, old_user_id: i64, org_id: &str) {
        self.organisations
            .entry(old_user_id)
            .or_insert_with(|| org_id.to_string());
    }

    pub fn resolve_organisation(&self, old_user_id: i64) -> anyhow::Result<Option<String>> {
        let mut visited = HashSet::new();
        self.resolve_chain(old_user_id, &mut visited)
    }

    fn resolve_chain(
        &self,
        old_user_id: i64,
        visited: &mut HashSet<i64>,
    ) -> anyhow::Result<Option<String>> {
        if let Some(id) = self.organisations.get(&old_user_id) {
            return Ok(Some(id.clone()));
        }
        if !visited.insert(old_user_id) {
            warn!(user = old_user_id, "cycle in legacy ownership chain");
            return Ok(None);
        }
        let Some(row) = self.legacy_users.get(&old_user_id) else {
            return Ok(None);
        };

        if let Some(parent) = row.int(PARENT_COLUMN).filter(|p| *p > 0) {
            if let Some(id) = self.resolve_chain(parent, visited)? {
                return Ok(Some(id));
            }
        }

        if let Some(company) = row.text(COMPANY_COLUMN) {
            let hit = self
                .store
                .find_by_natural_key(Collection::Organisations, &NaturalKey::new("name", company))?;
            return Ok(hit.map(|r| r.id));
        }
        Ok(None)
    }

    pub fn resolve_organisation_with_fallback(&mut self, old_user_id: Option<i64>) -> anyhow::Result<String> {
        if let Some(uid) = old_user_id {
            if let Some(id) = self.resolve_organisation(uid)? {
                return Ok(id);
            }
        }
        self.sentinel_organisation()
    }

    pub fn resolve_user_with_fallback(&mut self, old_user_id: Option<i64>) -> anyhow::Result<String> {
        if let Some(id) = old_user_id.and_then(|uid| self.users.get(&uid)) {
            return Ok(id.clone());
        }
        self.default_admin()
    }

    pub fn sentinel_organisation(&mut self) -> anyhow::Result<String> {
        if let Some(id) = &self.sentinel_org {
            return Ok(id.clone());
        }
        let key = NaturalKey::new("name", SENTINEL_ORGANISATION_NAME);
        let id = match self.store.find_by_natural_key(Collection::Organisations, &key)? {
            Some(r) => r.id,
            None => {
                let mut doc = Document::new();
                doc.insert("name".into(), json!(SENTINEL_ORGANISATION_NAME));
                doc.insert("is_sentinel".into(), json!(true));
                doc.insert(MIGRATED_MARKER.into(), json!(true));
                let id = self.store.insert(Collection::Organisations, doc)?;
                info!(id = %id, "created sentinel organisation");
                id
            }
        };
        self.sentinel_org = Some(id.clone());
        Ok(id)
    }

    pub fn default_admin(&mut self) -> anyhow::Result<String> {
        if let Some(id) = &self.default_admin {
            return Ok(id.clone());
        }
        let key = NaturalKey::new("email", self.default_admin_email.clone());
        let id = match self.store.find_by_natural_key(Collection::Users, &key)? {
            Some(r) => r.id,
            None => {
                let org_id = self.sentinel_organisation()?;
                let mut doc = Document::new();
                doc.insert("email".into(), json!(self.default_admin_email));
                doc.insert("first_name".into(), json!("Legacy"));
                doc.insert("last_name".into(), json!("Migration"));
                doc.insert("role".into(), json!(HIGHEST_ROLE));
                doc.insert("organisation_id".into(), json!(org_id));
                doc.insert("is_sentinel".into(), json!(true));
                doc.insert(MIGRATED_MARKER.into(), json!(true));
                let id = self.store.insert(Collection::Users, doc)?;
                info!(id = %id, email = %self.default_admin_email, "created default admin");
                id
            }
        };
        self.default_admin = Some(id.clone());
        Ok(id)
    }
}
