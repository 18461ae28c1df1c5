//! Staged legacy → target migration. Each step is run on its own by the
//! operator, in order; mapping lists carry identifiers between steps.

pub mod derive;
pub mod fields;
mod steps;

use crate::config::MigrationConfig;
use crate::dump::{read_table_dump, TableDump};
use crate::mapping::{MappingKind, MappingStore};
use crate::store::{Collection, DeleteFilter, TargetStore, MIGRATED_MARKER};
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Reset,
    Organisations,
    Users,
    Directors,
    Clients,
    Opportunities,
    OpportunityDetails,
    Comments,
    PreAssessment,
    GlobalSettings,
}

impl Step {
    pub const ORDER: [Step; 10] = [
        Step::Reset,
        Step::Organisations,
        Step::Users,
        Step::Directors,
        Step::Clients,
        Step::Opportunities,
        Step::OpportunityDetails,
        Step::Comments,
        Step::PreAssessment,
        Step::GlobalSettings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Reset => "reset",
            Step::Organisations => "organisations",
            Step::Users => "users",
            Step::Directors => "directors",
            Step::Clients => "clients",
            Step::Opportunities => "opportunities",
            Step::OpportunityDetails => "opportunity_details",
            Step::Comments => "comments",
            Step::PreAssessment => "pre_assessment",
            Step::GlobalSettings => "global_settings",
        }
    }

    /// Mapping list this step writes, if any.
    pub fn produces(self) -> Option<MappingKind> {
        match self {
            Step::Organisations => Some(MappingKind::Organisations),
            Step::Users => Some(MappingKind::Users),
            Step::Clients => Some(MappingKind::Clients),
            Step::Opportunities => Some(MappingKind::Opportunities),
            _ => None,
        }
    }

    /// Mapping lists the step reads. All must have been saved before the step
    /// may run.
    pub fn prerequisites(self) -> Vec<MappingKind> {
        use MappingKind::*;
        match self {
            Step::Users | Step::Directors | Step::Clients => vec![Organisations],
            Step::Opportunities => vec![Clients, Users],
            Step::OpportunityDetails => vec![Opportunities],
            Step::Comments => vec![Opportunities, Users],
            _ => Vec::new(),
        }
    }

    /// Legacy tables read by the step, one dump file each.
    pub fn tables(self) -> &'static [&'static str] {
        match self {
            Step::Reset => &[],
            Step::Organisations | Step::Users => &["users"],
            Step::Directors => &["directors", "users"],
            Step::Clients => &["clients", "users"],
            Step::Opportunities => &["deals"],
            Step::OpportunityDetails => &["deal_details"],
            Step::Comments => &["deal_comments"],
            Step::PreAssessment => &["pre_assessments"],
            Step::GlobalSettings => &["settings"],
        }
    }
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Step::ORDER
            .into_iter()
            .find(|step| step.name() == wanted)
            .ok_or_else(|| anyhow::anyhow!("unknown migration step: {}", s))
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one step: one audit line per processed row.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StepReport {
    pub success: bool,
    pub logs: Vec<String>,
    pub count: usize,
}

/// Audit trail accumulated while a step runs.
#[derive(Default)]
pub(crate) struct StepLog {
    lines: Vec<String>,
    count: usize,
}

impl StepLog {
    pub(crate) fn created(&mut self, what: impl Display) {
        self.count += 1;
        self.lines.push(format!("created {what}"));
    }

    pub(crate) fn exists(&mut self, what: impl Display) {
        self.lines.push(format!("skipped-exists {what}"));
    }

    pub(crate) fn no_mapping(&mut self, what: impl Display) {
        self.lines.push(format!("skipped-no-mapping {what}"));
    }

    pub(crate) fn invalid(&mut self, what: impl Display) {
        self.lines.push(format!("skipped-invalid {what}"));
    }

    pub(crate) fn superseded(&mut self, what: impl Display) {
        self.lines.push(format!("skipped-superseded {what}"));
    }

    pub(crate) fn note(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

pub struct Migrator<'a, S: TargetStore + ?Sized, M: MappingStore + ?Sized> {
    store: &'a S,
    mappings: &'a M,
    config: &'a MigrationConfig,
}

impl<'a, S: TargetStore + ?Sized, M: MappingStore + ?Sized> Migrator<'a, S, M> {
    pub fn new(store: &'a S, mappings: &'a M, config: &'a MigrationConfig) -> Self {
        Self {
            store,
            mappings,
            config,
        }
    }

    /// Runs one step to completion. Errors abort the step: rows already
    /// written stay in the store and the step's mapping list is not saved.
    pub fn run_step(&self, step: Step) -> StepReport {
        info!(step = step.name(), "migration step started");
        let mut log = StepLog::default();
        let outcome = self.execute(step, &mut log);
        match outcome {
            Ok(()) => {
                info!(step = step.name(), count = log.count, "migration step finished");
                StepReport {
                    success: true,
                    logs: log.lines,
                    count: log.count,
                }
            }
            Err(e) => {
                warn!(step = step.name(), error = %format!("{e:#}"), "migration step aborted");
                log.lines
                    .push(format!("error: step {} aborted: {e:#}", step.name()));
                StepReport {
                    success: false,
                    logs: log.lines,
                    count: log.count,
                }
            }
        }
    }

    fn execute(&self, step: Step, log: &mut StepLog) -> anyhow::Result<()> {
        self.check_prerequisites(step)?;
        match step {
            Step::Reset => self.reset(log),
            Step::Organisations => steps::organisations(self, log),
            Step::Users => steps::users(self, log),
            Step::Directors => steps::directors(self, log),
            Step::Clients => steps::clients(self, log),
            Step::Opportunities => steps::opportunities(self, log),
            Step::OpportunityDetails => steps::opportunity_details(self, log),
            Step::Comments => steps::comments(self, log),
            Step::PreAssessment => steps::pre_assessment(self, log),
            Step::GlobalSettings => steps::global_settings(self, log),
        }
    }

    fn check_prerequisites(&self, step: Step) -> anyhow::Result<()> {
        for kind in step.prerequisites() {
            if !self.mappings.exists(kind)? {
                anyhow::bail!(
                    "step {} requires the {} step to have completed first",
                    step.name(),
                    kind.name()
                );
            }
        }
        Ok(())
    }

    /// Which steps have a saved mapping list, for the operator view.
    pub fn completed_mappings(&self) -> anyhow::Result<Vec<MappingKind>> {
        let mut out = Vec::new();
        for kind in MappingKind::ALL {
            if self.mappings.exists(kind)? {
                out.push(kind);
            }
        }
        Ok(out)
    }

    pub(crate) fn store(&self) -> &'a S {
        self.store
    }

    pub(crate) fn mappings(&self) -> &'a M {
        self.mappings
    }

    pub(crate) fn config(&self) -> &'a MigrationConfig {
        self.config
    }

    /// Parses one legacy table; malformed tuples become audit lines.
    pub(crate) fn load_table(&self, table: &str, log: &mut StepLog) -> anyhow::Result<TableDump> {
        let path = self.config.dump_path(table);
        let dump = read_table_dump(&path, table)?;
        for s in &dump.skipped {
            log.note(format!(
                "skipped-malformed {} tuple #{}: {}",
                table,
                s.ordinal + 1,
                s.reason
            ));
        }
        info!(
            table,
            rows = dump.rows.len(),
            skipped = dump.skipped.len(),
            "legacy table parsed"
        );
        Ok(dump)
    }

    // Deletes only documents carrying the migration marker, so records the
    // live system created after go-live survive a reset.
    fn reset(&self, log: &mut StepLog) -> anyhow::Result<()> {
        let filter = DeleteFilter::FieldEquals(MIGRATED_MARKER.to_string(), json!(true));
        for collection in Collection::ALL {
            let n = self.store.delete_many(collection, &filter)?;
            log.count += n;
            log.note(format!("deleted {} {}", n, collection.name()));
        }
        for kind in MappingKind::ALL {
            self.mappings.remove(kind)?;
            log.note(format!("removed {} mapping", kind.name()));
        }
        Ok(())
    }
}
