use super::derive;
use super::fields::{self, DocBuilder};
use super::{Migrator, StepLog};
use crate::dump::{SourceRow, SqlValue};
use crate::lookup::{ASSET_TYPES, ENTITY_TYPES, INDUSTRIES, LOAN_PURPOSES, LOAN_TYPES};
use crate::mapping::{IdMapping, MappingEntry, MappingKind, MappingStore};
use crate::resolver::EntityResolver;
use crate::store::{Collection, NaturalKey, TargetStore};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Look up by natural key; insert only when nothing matches.
/// Returns the record id and whether it was created.
fn find_or_insert<S: TargetStore + ?Sized>(
    store: &S,
    collection: Collection,
    key: &NaturalKey,
    build: impl FnOnce() -> serde_json::Map<String, Value>,
) -> anyhow::Result<(String, bool)> {
    if let Some(existing) = store.find_by_natural_key(collection, key)? {
        debug!(collection = collection.name(), key = %key.describe(), "natural key hit");
        return Ok((existing.id, false));
    }
    let id = store.insert(collection, build())?;
    Ok((id, true))
}

/// Index of the last row for each key; later rows in a dump are newer.
fn latest_by<K: std::hash::Hash + Eq>(
    rows: &[SourceRow],
    key: impl Fn(&SourceRow) -> Option<K>,
) -> HashMap<K, usize> {
    let mut out = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if let Some(k) = key(row) {
            out.insert(k, i);
        }
    }
    out
}

/// Rows in dump order with earlier duplicates of an `id` dropped and logged.
/// Rows without an id pass through for the caller to reject.
fn newest_rows<'r>(rows: &'r [SourceRow], what: &str, log: &mut StepLog) -> Vec<&'r SourceRow> {
    let latest = latest_by(rows, |r| r.int("id"));
    rows.iter()
        .enumerate()
        .filter(|(i, row)| match row.int("id") {
            Some(id) if latest.get(&id) != Some(i) => {
                log.superseded(format!("{what} {id}: a newer row follows"));
                false
            }
            _ => true,
        })
        .map(|(_, row)| row)
        .collect()
}

fn opportunity_ref(legacy_id: i64) -> String {
    format!("OPP-{legacy_id:06}")
}

pub(super) fn organisations<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let users = m.load_table("users", log)?;
    let mut orgs = IdMapping::load(m.mappings(), MappingKind::Organisations)?;
    let mut resolver = EntityResolver::new(store, &users.rows, &m.config().default_admin_email)
        .with_organisations(&orgs);

    for row in newest_rows(&users.rows, "legacy user", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("legacy user without id");
            continue;
        };
        if let Some(owner) = row.int("admin_id").filter(|p| *p > 0) {
            log.note(format!(
                "skipped-sub-account legacy user {old_id} belongs to legacy user {owner}"
            ));
            continue;
        }
        let Some(company) = row.text("company_name") else {
            log.invalid(format!("legacy user {old_id}: no company name"));
            continue;
        };
        let abn = fields::abn(row, "abn");

        if let Some(entry) = orgs.get(old_id) {
            log.exists(format!("organisation {company} (legacy user {old_id}) -> {}", entry.new_id));
            continue;
        }

        // With an ABN, only the ABN identifies the organisation.
        let existing = match &abn {
            Some(abn) => store
                .find_by_natural_key(Collection::Organisations, &NaturalKey::new("abn", abn.as_str()))?
                .map(|r| r.id),
            None => resolver.resolve_organisation(old_id)?,
        };

        let id = match existing {
            Some(id) => {
                log.exists(format!("organisation {company} (legacy user {old_id}) -> {id}"));
                id
            }
            None => {
                let doc = DocBuilder::migrated()
                    .set("name", company.as_str())
                    .set("abn", abn.clone())
                    .set("trading_name", row.text("trading_name"))
                    .set("email", fields::email(row, "email"))
                    .set("phone", row.text("phone"))
                    .set_if("address", fields::address(row))
                    .set("industry", INDUSTRIES.translate(row.get("industry")))
                    .set("entity_type", ENTITY_TYPES.translate(row.get("entity_type")))
                    .set("legacy_user_id", old_id)
                    .set("created_at", fields::timestamp(row, "created_at"))
                    .build();
                let id = store.insert(Collection::Organisations, doc)?;
                log.created(format!("organisation {company} (legacy user {old_id}) -> {id}"));
                id
            }
        };

        resolver.register_organisation(old_id, &id);
        orgs.record(
            MappingEntry::new(old_id, id)
                .with("company_name", company)
                .with("abn", abn),
        );
    }

    orgs.save(m.mappings())
}

pub(super) fn users<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let cfg = m.config();
    let legacy = m.load_table("users", log)?;
    let orgs = IdMapping::load(m.mappings(), MappingKind::Organisations)?;
    let mut users = IdMapping::load(m.mappings(), MappingKind::Users)?;
    let mut resolver =
        EntityResolver::new(store, &legacy.rows, &cfg.default_admin_email).with_organisations(&orgs);

    for row in newest_rows(&legacy.rows, "legacy user", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("legacy user without id");
            continue;
        };
        let Some(email) = fields::email(row, "email") else {
            log.invalid(format!("legacy user {old_id}: no usable email"));
            continue;
        };
        if users.get(old_id).is_some() {
            log.exists(format!("user {email} (legacy user {old_id})"));
            continue;
        }

        let key = NaturalKey::new("email", email.as_str());
        let (id, created) = match store.find_by_natural_key(Collection::Users, &key)? {
            Some(r) => (r.id, false),
            None => {
                let org_id = resolver.resolve_organisation_with_fallback(Some(old_id))?;
                let role = derive::user_role(Some(email.as_str()), row.get("role"), &cfg.super_admin_emails);
                let doc = DocBuilder::migrated()
                    .set("email", email.as_str())
                    .set("first_name", row.text("first_name"))
                    .set("last_name", row.text("last_name"))
                    .set("phone", row.text("phone"))
                    .set("role", role)
                    .set("organisation_id", org_id)
                    .set("is_active", fields::flag(row, "is_active").unwrap_or(true))
                    .set("legacy_id", old_id)
                    .set("created_at", fields::timestamp(row, "created_at"))
                    .build();
                (store.insert(Collection::Users, doc)?, true)
            }
        };
        if created {
            log.created(format!("user {email} (legacy user {old_id}) -> {id}"));
        } else {
            log.exists(format!("user {email} (legacy user {old_id}) -> {id}"));
        }
        users.record(MappingEntry::new(old_id, id).with("email", email));
    }

    users.save(m.mappings())
}

pub(super) fn directors<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let directors = m.load_table("directors", log)?;
    let legacy_users = m.load_table("users", log)?;
    let orgs = IdMapping::load(m.mappings(), MappingKind::Organisations)?;
    let mut resolver = EntityResolver::new(store, &legacy_users.rows, &m.config().default_admin_email)
        .with_organisations(&orgs);

    for row in newest_rows(&directors.rows, "legacy director", log) {
        let old_id = row.int("id");
        let first = row.text("first_name");
        let last = row.text("last_name");
        let Some(name) = fields::full_name(first.as_deref(), last.as_deref()) else {
            log.invalid(format!("director {old_id:?}: no name"));
            continue;
        };
        let org_id = resolver.resolve_organisation_with_fallback(row.int("user_id"))?;
        let key = NaturalKey::new("organisation_id", org_id.as_str())
            .and("first_name", first.clone().unwrap_or_default())
            .and("last_name", last.clone().unwrap_or_default());

        let (id, created) = find_or_insert(store, Collection::Directors, &key, || {
            DocBuilder::migrated()
                .set("organisation_id", org_id.as_str())
                .set("first_name", first.clone().unwrap_or_default())
                .set("last_name", last.clone().unwrap_or_default())
                .set("email", fields::email(row, "email"))
                .set("phone", row.text("phone"))
                .set("date_of_birth", fields::date(row, "date_of_birth"))
                .set_if("address", fields::address(row))
                .set("legacy_id", old_id)
                .build()
        })?;
        if created {
            log.created(format!("director {name} -> {id}"));
        } else {
            log.exists(format!("director {name} -> {id}"));
        }
    }
    Ok(())
}

pub(super) fn clients<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let legacy = m.load_table("clients", log)?;
    let legacy_users = m.load_table("users", log)?;
    let orgs = IdMapping::load(m.mappings(), MappingKind::Organisations)?;
    let mut clients = IdMapping::load(m.mappings(), MappingKind::Clients)?;
    let mut resolver = EntityResolver::new(store, &legacy_users.rows, &m.config().default_admin_email)
        .with_organisations(&orgs);

    for row in newest_rows(&legacy.rows, "legacy client", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("legacy client without id");
            continue;
        };
        let contact = fields::full_name(
            row.text("contact_first_name").as_deref(),
            row.text("contact_last_name").as_deref(),
        );
        let Some(name) = row.text("company_name").or(contact) else {
            log.invalid(format!("legacy client {old_id}: no company or contact name"));
            continue;
        };
        if let Some(entry) = clients.get(old_id) {
            log.exists(format!("client {name} (legacy client {old_id}) -> {}", entry.new_id));
            continue;
        }

        let org_id = resolver.resolve_organisation_with_fallback(row.int("user_id"))?;
        let abn = fields::abn(row, "abn");
        let key = match &abn {
            Some(abn) => NaturalKey::new("organisation_id", org_id.as_str()).and("abn", abn.as_str()),
            None => NaturalKey::new("organisation_id", org_id.as_str()).and("name", name.as_str()),
        };

        let (id, created) = find_or_insert(store, Collection::Clients, &key, || {
            let contact_doc = DocBuilder::patch()
                .set("first_name", row.text("contact_first_name"))
                .set("last_name", row.text("contact_last_name"))
                .set("email", fields::email(row, "email"))
                .set("phone", row.text("phone"))
                .build();
            DocBuilder::migrated()
                .set("organisation_id", org_id.as_str())
                .set("name", name.as_str())
                .set("trading_name", row.text("trading_name"))
                .set("abn", abn.clone())
                .set("entity_type", ENTITY_TYPES.translate(row.get("entity_type")))
                .set("industry", INDUSTRIES.translate(row.get("industry")))
                .set_if(
                    "contact",
                    (!contact_doc.is_empty()).then(|| Value::Object(contact_doc)),
                )
                .set_if("address", fields::address(row))
                .set("legacy_id", old_id)
                .set("created_at", fields::timestamp(row, "created_at"))
                .build()
        })?;
        if created {
            log.created(format!("client {name} (legacy client {old_id}) -> {id}"));
        } else {
            log.exists(format!("client {name} (legacy client {old_id}) -> {id}"));
        }
        clients.record(
            MappingEntry::new(old_id, id)
                .with("organisation_id", org_id)
                .with("company_name", name),
        );
    }

    clients.save(m.mappings())
}

pub(super) fn opportunities<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let deals = m.load_table("deals", log)?;
    let clients = IdMapping::load(m.mappings(), MappingKind::Clients)?;
    let users = IdMapping::load(m.mappings(), MappingKind::Users)?;
    let mut opportunities = IdMapping::load(m.mappings(), MappingKind::Opportunities)?;
    let mut resolver = EntityResolver::new(store, &[], &m.config().default_admin_email).with_users(&users);

    for row in newest_rows(&deals.rows, "legacy deal", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("legacy deal without id");
            continue;
        };
        let reference = opportunity_ref(old_id);
        let Some(client) = row.int("client_id").and_then(|c| clients.get(c)) else {
            log.no_mapping(format!(
                "opportunity {reference}: legacy client {:?} was not migrated",
                row.int("client_id")
            ));
            continue;
        };
        let loan_amount = row.number("loan_amount");
        let asset_value = row.number("asset_value");

        let key = NaturalKey::new("opportunity_id", reference.as_str());
        let id = match store.find_by_natural_key(Collection::Opportunities, &key)? {
            Some(r) => {
                log.exists(format!("opportunity {reference} -> {}", r.id));
                r.id
            }
            None => {
                let org_id = match client.context_str("organisation_id") {
                    Some(o) => o.to_string(),
                    None => resolver.sentinel_organisation()?,
                };
                let created_by = resolver.resolve_user_with_fallback(row.int("user_id"))?;
                let settlement_date = fields::date(row, "settlement_date");
                let status = derive::opportunity_status(
                    row.int("status"),
                    settlement_date.as_deref(),
                    row.get("application_status"),
                );
                let doc = DocBuilder::migrated()
                    .set("opportunity_id", reference.as_str())
                    .set("client_id", client.new_id.as_str())
                    .set("organisation_id", org_id)
                    .set("created_by", created_by)
                    .set("status", status)
                    .set("loan_type", LOAN_TYPES.translate(row.get("loan_type")))
                    .set("asset_type", ASSET_TYPES.translate(row.get("asset_type")))
                    .set("loan_purpose", LOAN_PURPOSES.translate(row.get("loan_purpose")))
                    .set("loan_amount", loan_amount)
                    .set("asset_value", asset_value)
                    .set("lender", row.text("lender"))
                    .set("settlement_date", settlement_date)
                    .set("has_details", false)
                    .set("legacy_id", old_id)
                    .set("created_at", fields::timestamp(row, "created_at"))
                    .build();
                let id = store.insert(Collection::Opportunities, doc)?;
                log.created(format!("opportunity {reference} ({status}) -> {id}"));
                id
            }
        };
        opportunities.record(
            MappingEntry::new(old_id, id)
                .with("opportunity_id", reference)
                .with("organisation_id", client.context_str("organisation_id"))
                .with("loan_amount", loan_amount)
                .with("asset_value", asset_value),
        );
    }

    opportunities.save(m.mappings())
}

pub(super) fn opportunity_details<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let details = m.load_table("deal_details", log)?;
    let opportunities = IdMapping::load(m.mappings(), MappingKind::Opportunities)?;
    let latest = latest_by(&details.rows, |r| r.int("deal_id"));

    for (i, row) in details.rows.iter().enumerate() {
        let Some(deal_id) = row.int("deal_id") else {
            log.invalid("deal detail without deal_id");
            continue;
        };
        if latest.get(&deal_id) != Some(&i) {
            log.superseded(format!("deal detail for legacy deal {deal_id}: a newer row follows"));
            continue;
        }
        let Some(opp) = opportunities.get(deal_id) else {
            log.no_mapping(format!("deal detail: legacy deal {deal_id} was not migrated"));
            continue;
        };
        let reference = opp
            .context_str("opportunity_id")
            .map(str::to_string)
            .unwrap_or_else(|| opportunity_ref(deal_id));

        let key = NaturalKey::new("opportunity_id", opp.new_id.as_str());
        let (id, created) = find_or_insert(store, Collection::OpportunityDetails, &key, || {
            let tax_debt = fields::flag(row, "outstanding_ato_debt").unwrap_or(false);
            let credit_issues = fields::flag(row, "credit_issues").unwrap_or(false);
            let lvr = derive::loan_to_value(opp.context_f64("loan_amount"), opp.context_f64("asset_value"));
            DocBuilder::migrated()
                .set("opportunity_id", opp.new_id.as_str())
                .set("opportunity_ref", reference.as_str())
                .set("brief_overview", row.text("brief_overview"))
                .set("notes", row.text("notes"))
                .set("outstanding_tax_debt", tax_debt)
                .set("tax_debt_amount", row.number("ato_debt_amount"))
                .set("credit_issues", credit_issues)
                .set("existing_debt", row.number("existing_debt"))
                .set("time_in_business_months", row.int("time_in_business"))
                .set("annual_revenue", row.number("annual_revenue"))
                .set("lvr", lvr)
                .set("risk_level", derive::risk_level(tax_debt, credit_issues, lvr))
                .set("legacy_id", row.int("id"))
                .build()
        })?;

        // Patched on every run so a retry after an abort still links the pair.
        let patch = DocBuilder::patch()
            .set("has_details", true)
            .set("details_id", id.as_str())
            .build();
        if !store.update(Collection::Opportunities, &opp.new_id, patch)? {
            log.note(format!(
                "warning: opportunity {reference} ({}) missing from store",
                opp.new_id
            ));
        }

        if created {
            log.created(format!("details for opportunity {reference} -> {id}"));
        } else {
            log.exists(format!("details for opportunity {reference} -> {id}"));
        }
    }
    Ok(())
}

pub(super) fn comments<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let legacy = m.load_table("deal_comments", log)?;
    let opportunities = IdMapping::load(m.mappings(), MappingKind::Opportunities)?;
    let users = IdMapping::load(m.mappings(), MappingKind::Users)?;
    let mut resolver = EntityResolver::new(store, &[], &m.config().default_admin_email).with_users(&users);

    for row in newest_rows(&legacy.rows, "legacy comment", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("legacy comment without id");
            continue;
        };
        let Some(body) = row.text("comment") else {
            log.invalid(format!("legacy comment {old_id}: empty"));
            continue;
        };
        let Some(opp) = row.int("deal_id").and_then(|d| opportunities.get(d)) else {
            log.no_mapping(format!(
                "legacy comment {old_id}: legacy deal {:?} was not migrated",
                row.int("deal_id")
            ));
            continue;
        };

        let source_ref = format!("legacy-comment-{old_id}");
        let key = NaturalKey::new("source_ref", source_ref.as_str());
        let id = match store.find_by_natural_key(Collection::Comments, &key)? {
            Some(r) => {
                log.exists(format!("comment {source_ref} -> {}", r.id));
                continue;
            }
            None => {
                let user_id = resolver.resolve_user_with_fallback(row.int("user_id"))?;
                let doc = DocBuilder::migrated()
                    .set("opportunity_id", opp.new_id.as_str())
                    .set("user_id", user_id)
                    .set("body", body)
                    .set("source_ref", source_ref.as_str())
                    .set("legacy_id", old_id)
                    .set("created_at", fields::timestamp(row, "created_at"))
                    .build();
                store.insert(Collection::Comments, doc)?
            }
        };
        log.created(format!("comment {source_ref} -> {id}"));
    }
    Ok(())
}

pub(super) fn pre_assessment<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let legacy = m.load_table("pre_assessments", log)?;

    for row in newest_rows(&legacy.rows, "pre-assessment", log) {
        let Some(old_id) = row.int("id") else {
            log.invalid("pre-assessment without id");
            continue;
        };
        let email = fields::email(row, "email");
        let phone = row.text("phone");
        if email.is_none() && phone.is_none() {
            log.invalid(format!("pre-assessment {old_id}: no email or phone"));
            continue;
        }

        let source_ref = format!("legacy-pre-assessment-{old_id}");
        let key = NaturalKey::new("source_ref", source_ref.as_str());
        let (id, created) = find_or_insert(store, Collection::PreAssessmentContacts, &key, || {
            DocBuilder::migrated()
                .set("first_name", row.text("first_name"))
                .set("last_name", row.text("last_name"))
                .set("email", email.clone())
                .set("phone", phone.clone())
                .set("company_name", row.text("company_name"))
                .set("loan_amount", row.number("loan_amount"))
                .set("loan_purpose", LOAN_PURPOSES.translate(row.get("loan_purpose")))
                .set("message", row.text("message"))
                .set("source_ref", source_ref.as_str())
                .set("legacy_id", old_id)
                .set("created_at", fields::timestamp(row, "created_at"))
                .build()
        })?;
        if created {
            log.created(format!("pre-assessment contact {source_ref} -> {id}"));
        } else {
            log.exists(format!("pre-assessment contact {source_ref} -> {id}"));
        }
    }
    Ok(())
}

pub(super) fn global_settings<S: TargetStore + ?Sized, M: MappingStore + ?Sized>(
    m: &Migrator<'_, S, M>,
    log: &mut StepLog,
) -> anyhow::Result<()> {
    let store = m.store();
    let legacy = m.load_table("settings", log)?;
    let setting_key = |r: &SourceRow| {
        r.text("name")
            .or_else(|| r.text("key"))
            .map(|k| k.to_ascii_lowercase())
    };
    let latest = latest_by(&legacy.rows, setting_key);

    for (i, row) in legacy.rows.iter().enumerate() {
        let Some(key_name) = setting_key(row) else {
            log.invalid("setting without a name");
            continue;
        };
        if latest.get(&key_name) != Some(&i) {
            log.superseded(format!("setting {key_name}: a newer row follows"));
            continue;
        }
        let value = match row.get("value") {
            Some(SqlValue::Number(n)) => json!(n),
            Some(SqlValue::Text(s)) => json!(s),
            _ => Value::Null,
        };

        let key = NaturalKey::new("key", key_name.as_str());
        let (id, created) = find_or_insert(store, Collection::GlobalSettings, &key, || {
            let mut doc = DocBuilder::migrated().set("key", key_name.as_str()).build();
            // Null values are kept: the key's presence is the setting.
            doc.insert("value".into(), value.clone());
            doc
        })?;
        if created {
            log.created(format!("setting {key_name} -> {id}"));
        } else {
            log.exists(format!("setting {key_name} -> {id}"));
        }
    }
    Ok(())
}
