use serde_json::Value;

pub type Document = serde_json::Map<String, Value>;

/// Marker carried by every document the pipeline writes; reset deletes by it.
pub const MIGRATED_MARKER: &str = "migrated_from_legacy";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Organisations,
    Users,
    Directors,
    Clients,
    Opportunities,
    OpportunityDetails,
    Comments,
    PreAssessmentContacts,
    GlobalSettings,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Organisations,
        Collection::Users,
        Collection::Directors,
        Collection::Clients,
        Collection::Opportunities,
        Collection::OpportunityDetails,
        Collection::Comments,
        Collection::PreAssessmentContacts,
        Collection::GlobalSettings,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Organisations => "organisations",
            Collection::Users => "users",
            Collection::Directors => "directors",
            Collection::Clients => "clients",
            Collection::Opportunities => "opportunities",
            Collection::OpportunityDetails => "opportunity_details",
            Collection::Comments => "comments",
            Collection::PreAssessmentContacts => "pre_assessment_contacts",
            Collection::GlobalSettings => "global_settings",
        }
    }
}

/// One or more `field = value` pairs, compared case-insensitively after trim.
#[derive(Clone, Debug, PartialEq)]
pub struct NaturalKey {
    pub fields: Vec<(String, String)>,
}

impl NaturalKey {
    pub fn new(field: &str, value: impl Into<String>) -> Self {
        Self {
            fields: vec![(field.to_string(), value.into())],
        }
    }

    pub fn and(mut self, field: &str, value: impl Into<String>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|(f, v)| format!("{f}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeleteFilter {
    All,
    FieldEquals(String, Value),
}

#[derive(Clone, Debug)]
pub struct Record {
    pub id: String,
    pub doc: Document,
}

impl Record {
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.doc.get(field).and_then(|v| v.as_str())
    }
}

/// The document store the migrated entities land in.
pub trait TargetStore {
    fn find_by_natural_key(
        &self,
        collection: Collection,
        key: &NaturalKey,
    ) -> anyhow::Result<Option<Record>>;
    fn insert(&self, collection: Collection, doc: Document) -> anyhow::Result<String>;
    /// Merges `patch` into the stored document. False when `id` is unknown.
    fn update(&self, collection: Collection, id: &str, patch: Document) -> anyhow::Result<bool>;
    fn delete_many(&self, collection: Collection, filter: &DeleteFilter) -> anyhow::Result<usize>;
    fn list(&self, collection: Collection) -> anyhow::Result<Vec<Record>>;
    fn count(&self, collection: Collection) -> anyhow::Result<usize>;
}
