use migrated::config::MigrationConfig;
use migrated::db::SqliteStore;
use migrated::mapping::{FileMappingStore, IdMapping, MappingKind, MappingStore};
use migrated::migrate::{Migrator, Step, StepReport};
use migrated::resolver::SENTINEL_ORGANISATION_NAME;
use migrated::store::{Collection, Document, NaturalKey, TargetStore};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn write_dump(cfg: &MigrationConfig, table: &str, text: &str) {
    std::fs::create_dir_all(&cfg.dump_dir).expect("create dump dir");
    std::fs::write(cfg.dump_path(table), text).expect("write dump");
}

const USERS: &str = "\
INSERT INTO `users` (`id`,`role`,`admin_id`,`company_name`,`abn`,`email`,`first_name`,`last_name`) VALUES
(5,3,NULL,'Acme Pty Ltd','12 345 678 901','Owner@Acme.test','Ann','Owner'),
(6,4,5,NULL,NULL,'staff@acme.test','Sam','Staff'),
(7,4,NULL,NULL,NULL,'loner@solo.test','Lo','Ner');
";

const CLIENTS: &str = "\
INSERT INTO `clients` (`id`,`user_id`,`company_name`,`abn`,`contact_first_name`,`email`) VALUES
(1,5,'Widget Co',NULL,'Wendy','wendy@widget.test');
";

fn seed_full_fixture(cfg: &MigrationConfig) {
    write_dump(cfg, "users", USERS);
    write_dump(cfg, "clients", CLIENTS);
    write_dump(
        cfg,
        "directors",
        "INSERT INTO directors (id, user_id, first_name, last_name) VALUES (1, 6, 'Dee', 'Rector'), (2, 6, NULL, NULL);\n",
    );
    write_dump(
        cfg,
        "deals",
        "INSERT INTO deals (id, client_id, user_id, status, settlement_date, application_status, loan_amount, asset_value, loan_type) VALUES
(1, 1, 6, 2, '2023-05-01', 6, 450000, 600000, 1),
(2, 99, 6, 1, NULL, 4, 10000, NULL, 2);
",
    );
    write_dump(
        cfg,
        "deal_details",
        "INSERT INTO deal_details (id, deal_id, brief_overview, outstanding_ato_debt, credit_issues) VALUES
(1, 1, 'first draft', 0, 0),
(2, 1, 'final overview', 1, 0);
",
    );
    write_dump(
        cfg,
        "deal_comments",
        "INSERT INTO deal_comments (id, deal_id, user_id, comment) VALUES
(1, 1, 6, 'Called the client'),
(2, 1, 6, ''),
(3, 1, 42, 'Orphaned author');
",
    );
    write_dump(
        cfg,
        "pre_assessments",
        "INSERT INTO pre_assessments (id, first_name, email, phone, loan_amount) VALUES
(1, 'Lee', 'lead@prospect.test', NULL, 50000),
(2, 'Nobody', NULL, NULL, NULL);
",
    );
    write_dump(
        cfg,
        "settings",
        "INSERT INTO settings (id, name, value) VALUES (1, 'footer', 'old'), (2, 'footer', 'new'), (3, 'rate', 7.5);\n",
    );
}

fn assert_ok(step: Step, report: &StepReport) {
    assert!(report.success, "{} failed: {:?}", step, report.logs);
}

fn doc(v: serde_json::Value) -> Document {
    v.as_object().cloned().expect("object")
}

fn find(store: &SqliteStore, collection: Collection, field: &str, value: &str) -> migrated::store::Record {
    store
        .find_by_natural_key(collection, &NaturalKey::new(field, value))
        .expect("find")
        .unwrap_or_else(|| panic!("no {} with {}={}", collection.name(), field, value))
}

#[test]
fn acme_owner_and_client_share_one_organisation() {
    let dir = temp_dir("migrated-e2e-acme");
    let cfg = MigrationConfig::for_workspace(&dir);
    write_dump(&cfg, "users", USERS);
    write_dump(&cfg, "clients", CLIENTS);

    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    let orgs = migrator.run_step(Step::Organisations);
    assert_ok(Step::Organisations, &orgs);
    assert_eq!(orgs.count, 1);
    assert!(orgs.logs.iter().any(|l| l.starts_with("skipped-sub-account")));
    assert!(orgs.logs.iter().any(|l| l.starts_with("skipped-invalid")));

    let clients = migrator.run_step(Step::Clients);
    assert_ok(Step::Clients, &clients);
    assert_eq!(clients.count, 1);

    let all_orgs = store.list(Collection::Organisations).expect("list");
    assert_eq!(all_orgs.len(), 1);
    assert_eq!(all_orgs[0].str_field("name"), Some("Acme Pty Ltd"));
    assert_eq!(all_orgs[0].str_field("abn"), Some("12345678901"));

    let all_clients = store.list(Collection::Clients).expect("list");
    assert_eq!(all_clients.len(), 1);
    assert_eq!(
        all_clients[0].str_field("organisation_id"),
        Some(all_orgs[0].id.as_str())
    );

    assert!(mappings.path(MappingKind::Organisations).is_file());
    assert!(cfg.mapping_dir.join("clients_mapping.json").is_file());

    let _ = std::fs::remove_dir_all(dir);
}

fn run_all(migrator: &Migrator<'_, SqliteStore, FileMappingStore>) -> Vec<(Step, StepReport)> {
    Step::ORDER
        .iter()
        .copied()
        .filter(|s| *s != Step::Reset)
        .map(|s| (s, migrator.run_step(s)))
        .collect()
}

fn collection_counts(store: &SqliteStore) -> Vec<usize> {
    Collection::ALL
        .iter()
        .map(|c| store.count(*c).expect("count"))
        .collect()
}

#[test]
fn full_pipeline_builds_the_graph_and_reruns_are_no_ops() {
    let dir = temp_dir("migrated-e2e-full");
    let mut cfg = MigrationConfig::for_workspace(&dir);
    cfg.super_admin_emails = vec!["owner@acme.test".to_string()];
    seed_full_fixture(&cfg);

    let store = SqliteStore::open(&dir).expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    for (step, report) in run_all(&migrator) {
        assert_ok(step, &report);
    }
    let first = collection_counts(&store);

    // Users: the allow-listed owner is promoted, the orphan lands in the sentinel org.
    let owner = find(&store, Collection::Users, "email", "owner@acme.test");
    assert_eq!(owner.str_field("role"), Some("super_admin"));
    let acme = find(&store, Collection::Organisations, "name", "Acme Pty Ltd");
    assert_eq!(owner.str_field("organisation_id"), Some(acme.id.as_str()));
    let staff = find(&store, Collection::Users, "email", "staff@acme.test");
    assert_eq!(staff.str_field("organisation_id"), Some(acme.id.as_str()));
    assert_eq!(staff.str_field("role"), Some("referrer_team"));
    let sentinel = find(&store, Collection::Organisations, "name", SENTINEL_ORGANISATION_NAME);
    let loner = find(&store, Collection::Users, "email", "loner@solo.test");
    assert_eq!(loner.str_field("organisation_id"), Some(sentinel.id.as_str()));

    // Directors resolve through the sub-account's owner.
    let directors = store.list(Collection::Directors).expect("directors");
    assert_eq!(directors.len(), 1);
    assert_eq!(directors[0].str_field("organisation_id"), Some(acme.id.as_str()));

    // Opportunity: settled, created by staff, with details patched in.
    let opp = find(&store, Collection::Opportunities, "opportunity_id", "OPP-000001");
    assert_eq!(opp.str_field("status"), Some("settled"));
    assert_eq!(opp.str_field("created_by"), Some(staff.id.as_str()));
    assert_eq!(opp.str_field("loan_type"), Some("business_loan"));
    assert_eq!(opp.doc.get("has_details"), Some(&json!(true)));
    assert_eq!(store.count(Collection::Opportunities).expect("count"), 1);

    let details = store.list(Collection::OpportunityDetails).expect("details");
    assert_eq!(details.len(), 1);
    assert_eq!(opp.str_field("details_id"), Some(details[0].id.as_str()));
    assert_eq!(details[0].str_field("brief_overview"), Some("final overview"));
    assert_eq!(details[0].doc.get("lvr"), Some(&json!(75.0)));
    assert_eq!(details[0].str_field("risk_level"), Some("medium"));

    // Comments: empty body skipped, unknown author falls back to the default admin.
    let orphan = find(&store, Collection::Comments, "source_ref", "legacy-comment-3");
    let admin = find(&store, Collection::Users, "email", &cfg.default_admin_email);
    assert_eq!(orphan.str_field("user_id"), Some(admin.id.as_str()));
    assert_eq!(store.count(Collection::Comments).expect("count"), 2);

    assert_eq!(
        store.count(Collection::PreAssessmentContacts).expect("count"),
        1
    );
    let footer = find(&store, Collection::GlobalSettings, "key", "footer");
    assert_eq!(footer.str_field("value"), Some("new"));
    let rate = find(&store, Collection::GlobalSettings, "key", "rate");
    assert_eq!(rate.doc.get("value"), Some(&json!(7.5)));

    // Second pass: nothing created, nothing duplicated.
    for (step, report) in run_all(&migrator) {
        assert_ok(step, &report);
        assert_eq!(report.count, 0, "{} created on rerun: {:?}", step, report.logs);
        assert!(
            !report.logs.iter().any(|l| l.starts_with("created")),
            "{}: {:?}",
            step,
            report.logs
        );
    }
    assert_eq!(collection_counts(&store), first);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn row_level_skips_are_audited() {
    let dir = temp_dir("migrated-e2e-audit");
    let cfg = MigrationConfig::for_workspace(&dir);
    seed_full_fixture(&cfg);
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    let reports = run_all(&migrator);
    let logs = |step: Step| -> Vec<String> {
        reports
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, r)| r.logs.clone())
            .expect("report")
    };

    assert!(logs(Step::Opportunities)
        .iter()
        .any(|l| l.starts_with("skipped-no-mapping") && l.contains("OPP-000002")));
    assert!(logs(Step::OpportunityDetails)
        .iter()
        .any(|l| l.starts_with("skipped-superseded")));
    assert!(logs(Step::Comments)
        .iter()
        .any(|l| l.starts_with("skipped-invalid legacy comment 2")));
    assert!(logs(Step::Directors)
        .iter()
        .any(|l| l.starts_with("skipped-invalid")));
    assert!(logs(Step::PreAssessment)
        .iter()
        .any(|l| l.starts_with("skipped-invalid pre-assessment 2")));
    assert!(logs(Step::GlobalSettings)
        .iter()
        .any(|l| l.starts_with("skipped-superseded setting footer")));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn malformed_dump_rows_are_reported_not_fatal() {
    let dir = temp_dir("migrated-e2e-malformed");
    let cfg = MigrationConfig::for_workspace(&dir);
    write_dump(
        &cfg,
        "users",
        "INSERT INTO users (id, company_name) VALUES (1, 'Good Co'), (2), (3, 'Other Co');\n",
    );
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let report = Migrator::new(&store, &mappings, &cfg).run_step(Step::Organisations);

    assert_ok(Step::Organisations, &report);
    assert_eq!(report.count, 2);
    assert!(report
        .logs
        .iter()
        .any(|l| l == "skipped-malformed users tuple #2: expected 2 values, found 1"));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn steps_refuse_to_run_before_their_inputs_exist() {
    let dir = temp_dir("migrated-e2e-prereq");
    let cfg = MigrationConfig::for_workspace(&dir);
    seed_full_fixture(&cfg);
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    let report = migrator.run_step(Step::Clients);
    assert!(!report.success);
    assert_eq!(report.count, 0);
    let last = report.logs.last().expect("error line");
    assert!(last.starts_with("error: step clients aborted"), "{last}");
    assert!(last.contains("organisations"));
    assert!(collection_counts(&store).iter().all(|n| *n == 0));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn missing_dump_aborts_without_saving_the_mapping() {
    let dir = temp_dir("migrated-e2e-missing");
    let cfg = MigrationConfig::for_workspace(&dir);
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());

    let report = Migrator::new(&store, &mappings, &cfg).run_step(Step::Organisations);
    assert!(!report.success);
    assert!(report
        .logs
        .last()
        .map(|l| l.contains("users.sql"))
        .unwrap_or(false));
    assert!(!mappings.exists(MappingKind::Organisations).expect("exists"));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn lost_mapping_is_rebuilt_from_the_store() {
    let dir = temp_dir("migrated-e2e-rebuild");
    let cfg = MigrationConfig::for_workspace(&dir);
    write_dump(&cfg, "users", USERS);
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    assert_ok(Step::Organisations, &migrator.run_step(Step::Organisations));
    let before = IdMapping::load(&mappings, MappingKind::Organisations).expect("load");
    mappings.remove(MappingKind::Organisations).expect("remove");

    let again = migrator.run_step(Step::Organisations);
    assert_ok(Step::Organisations, &again);
    assert_eq!(again.count, 0);
    assert!(again.logs.iter().any(|l| l.starts_with("skipped-exists")));

    let after = IdMapping::load(&mappings, MappingKind::Organisations).expect("load");
    assert_eq!(after.new_id(5), before.new_id(5));
    assert_eq!(store.count(Collection::Organisations).expect("count"), 1);

    let _ = std::fs::remove_dir_all(dir);
}

fn migrated_count(store: &SqliteStore) -> usize {
    Collection::ALL
        .iter()
        .map(|c| {
            store
                .list(*c)
                .expect("list")
                .iter()
                .filter(|r| r.doc.get("migrated_from_legacy") == Some(&json!(true)))
                .count()
        })
        .sum()
}

fn mapping_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn reset_removes_only_migrated_records_and_mappings() {
    let dir = temp_dir("migrated-e2e-reset");
    let cfg = MigrationConfig::for_workspace(&dir);
    seed_full_fixture(&cfg);
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    for (step, report) in run_all(&migrator) {
        assert_ok(step, &report);
    }
    let live = store
        .insert(
            Collection::Organisations,
            doc(json!({ "name": "Signed Up After Go-Live" })),
        )
        .expect("insert live");
    let migrated = migrated_count(&store);
    assert!(migrated > 0);
    assert!(mapping_files(&cfg.mapping_dir) > 0);

    let report = migrator.run_step(Step::Reset);
    assert_ok(Step::Reset, &report);
    assert_eq!(report.count, migrated);
    assert_eq!(migrated_count(&store), 0);
    let remaining = store.list(Collection::Organisations).expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, live);
    assert_eq!(mapping_files(&cfg.mapping_dir), 0);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn repeated_legacy_ids_keep_only_the_newest_row() {
    let dir = temp_dir("migrated-e2e-dupe");
    let cfg = MigrationConfig::for_workspace(&dir);
    write_dump(
        &cfg,
        "users",
        "INSERT INTO users (id, admin_id, company_name, abn, email) VALUES
(5, NULL, 'Old Name Pty Ltd', NULL, 'old@acme.test'),
(5, NULL, 'Acme Pty Ltd', NULL, 'owner@acme.test');
",
    );
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    let orgs = migrator.run_step(Step::Organisations);
    assert_ok(Step::Organisations, &orgs);
    assert_eq!(orgs.count, 1);
    assert!(orgs
        .logs
        .iter()
        .any(|l| l.starts_with("skipped-superseded legacy user 5")));

    let all_orgs = store.list(Collection::Organisations).expect("list");
    assert_eq!(all_orgs.len(), 1);
    assert_eq!(all_orgs[0].str_field("name"), Some("Acme Pty Ltd"));
    let mapped = IdMapping::load(&mappings, MappingKind::Organisations).expect("load");
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped.get(5).and_then(|e| e.context_str("company_name")), Some("Acme Pty Ltd"));

    let users = migrator.run_step(Step::Users);
    assert_ok(Step::Users, &users);
    assert_eq!(users.count, 1);
    assert_eq!(store.count(Collection::Users).expect("count"), 1);
    find(&store, Collection::Users, "email", "owner@acme.test");

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn same_company_name_with_different_abns_stays_two_organisations() {
    let dir = temp_dir("migrated-e2e-abn");
    let cfg = MigrationConfig::for_workspace(&dir);
    write_dump(
        &cfg,
        "users",
        "INSERT INTO users (id, admin_id, company_name, abn, email) VALUES
(5, NULL, 'Acme Pty Ltd', '12 345 678 901', 'north@acme.test'),
(6, NULL, 'Acme Pty Ltd', '98 765 432 109', 'south@acme.test');
",
    );
    let store = SqliteStore::open_in_memory().expect("store");
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(&store, &mappings, &cfg);

    let orgs = migrator.run_step(Step::Organisations);
    assert_ok(Step::Organisations, &orgs);
    assert_eq!(orgs.count, 2);
    assert_eq!(store.count(Collection::Organisations).expect("count"), 2);

    let mapped = IdMapping::load(&mappings, MappingKind::Organisations).expect("load");
    assert_ne!(mapped.new_id(5), mapped.new_id(6));

    assert_ok(Step::Users, &migrator.run_step(Step::Users));
    let north = find(&store, Collection::Users, "email", "north@acme.test");
    let south = find(&store, Collection::Users, "email", "south@acme.test");
    assert_eq!(north.str_field("organisation_id"), mapped.new_id(5));
    assert_eq!(south.str_field("organisation_id"), mapped.new_id(6));
    assert_ne!(north.str_field("organisation_id"), south.str_field("organisation_id"));

    let _ = std::fs::remove_dir_all(dir);
}
