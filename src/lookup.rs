use crate::dump::SqlValue;

/// Fixed translation from a legacy numeric code to a target enum string.
pub struct LookupTable {
    pub name: &'static str,
    pub entries: &'static [(i64, &'static str)],
}

impl LookupTable {
    pub fn code(&self, code: i64) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| *v)
    }

    /// Accepts numeric codes, numeric text, or a value that is already one of
    /// the target strings (some legacy rows were backfilled with names).
    pub fn translate(&self, value: Option<&SqlValue>) -> Option<&'static str> {
        let value = value?;
        if let Some(code) = value.as_i64() {
            return self.code(code);
        }
        let text = value.as_text()?.trim();
        self.entries
            .iter()
            .map(|(_, v)| *v)
            .find(|v| v.eq_ignore_ascii_case(text))
    }
}

pub static LOAN_TYPES: LookupTable = LookupTable {
    name: "loan_type",
    entries: &[
        (1, "business_loan"),
        (2, "equipment_finance"),
        (3, "commercial_property"),
        (4, "residential_property"),
        (5, "line_of_credit"),
        (6, "invoice_finance"),
        (7, "smsf_loan"),
        (8, "other"),
    ],
};

pub static ASSET_TYPES: LookupTable = LookupTable {
    name: "asset_type",
    entries: &[
        (1, "residential_property"),
        (2, "commercial_property"),
        (3, "vacant_land"),
        (4, "vehicle"),
        (5, "equipment"),
        (6, "unsecured"),
        (7, "other"),
    ],
};

pub static LOAN_PURPOSES: LookupTable = LookupTable {
    name: "loan_purpose",
    entries: &[
        (1, "purchase"),
        (2, "refinance"),
        (3, "working_capital"),
        (4, "equity_release"),
        (5, "construction"),
        (6, "debt_consolidation"),
        (7, "business_acquisition"),
        (8, "other"),
    ],
};

pub static INDUSTRIES: LookupTable = LookupTable {
    name: "industry",
    entries: &[
        (1, "agriculture"),
        (2, "construction"),
        (3, "manufacturing"),
        (4, "retail"),
        (5, "hospitality"),
        (6, "professional_services"),
        (7, "healthcare"),
        (8, "transport"),
        (9, "real_estate"),
        (10, "financial_services"),
        (11, "other"),
    ],
};

pub static ROLES: LookupTable = LookupTable {
    name: "role",
    entries: &[
        (1, "super_admin"),
        (2, "admin"),
        (3, "referrer_admin"),
        (4, "referrer_team"),
    ],
};

pub static ENTITY_TYPES: LookupTable = LookupTable {
    name: "entity_type",
    entries: &[
        (1, "sole_trader"),
        (2, "partnership"),
        (3, "company"),
        (4, "trust"),
        (5, "smsf"),
        (6, "other"),
    ],
};

/// Secondary `application_status` code carried by legacy deals.
pub static APPLICATION_STATUSES: LookupTable = LookupTable {
    name: "application_status",
    entries: &[
        (1, "draft"),
        (2, "opportunity"),
        (3, "application_created"),
        (4, "application_submitted"),
        (5, "conditionally_approved"),
        (6, "approved"),
        (7, "declined"),
        (8, "withdrawn"),
        (9, "settled"),
    ],
};

pub const HIGHEST_ROLE: &str = "super_admin";
pub const LOWEST_TEAM_ROLE: &str = "referrer_team";
