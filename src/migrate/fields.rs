use crate::dump::SourceRow;
use crate::store::{Document, MIGRATED_MARKER};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};

/// Builds a target document; null values are left out.
pub struct DocBuilder {
    doc: Document,
}

impl DocBuilder {
    pub fn migrated() -> Self {
        let mut doc = Document::new();
        doc.insert(MIGRATED_MARKER.into(), json!(true));
        Self { doc }
    }

    pub fn patch() -> Self {
        Self {
            doc: Document::new(),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.doc.insert(key.to_string(), value);
        }
        self
    }

    pub fn set_if(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Document {
        self.doc
    }
}

/// Street/suburb/state/postcode columns folded into one nested object.
pub fn address(row: &SourceRow) -> Option<Value> {
    let mut out = serde_json::Map::new();
    for (col, key) in [
        ("address", "street"),
        ("suburb", "suburb"),
        ("state", "state"),
        ("postcode", "postcode"),
    ] {
        if let Some(v) = row.text(col) {
            out.insert(key.to_string(), json!(v));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

pub fn abn(row: &SourceRow, column: &str) -> Option<String> {
    let digits: String = row
        .text(column)?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

pub fn email(row: &SourceRow, column: &str) -> Option<String> {
    row.text(column)
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| e.contains('@'))
}

/// Legacy yes/no columns: 0/1, "Y"/"N", "yes"/"no", "true"/"false".
pub fn flag(row: &SourceRow, column: &str) -> Option<bool> {
    if let Some(n) = row.number(column) {
        return Some(n != 0.0);
    }
    match row.text(column)?.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "t" => Some(true),
        "n" | "no" | "false" | "f" => Some(false),
        _ => None,
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

fn parse_legacy_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    // MySQL zero dates mean "unset".
    if raw.starts_with("0000-00-00") {
        return None;
    }
    for f in DATETIME_FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(raw, f) {
            return Some(v);
        }
    }
    for f in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, f) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// `YYYY-MM-DD`, or `None` for blank, zero or unparseable dates.
pub fn date(row: &SourceRow, column: &str) -> Option<String> {
    let v = parse_legacy_datetime(&row.text(column)?)?;
    Some(v.date().format("%Y-%m-%d").to_string())
}

/// RFC 3339 in UTC; legacy timestamps carry no zone.
pub fn timestamp(row: &SourceRow, column: &str) -> Option<String> {
    let v = parse_legacy_datetime(&row.text(column)?)?;
    Some(v.and_utc().to_rfc3339())
}

pub fn full_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let name = [first, last]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::SqlValue;

    fn row(cells: &[(&str, SqlValue)]) -> SourceRow {
        SourceRow::new(
            cells
                .iter()
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn dates_normalise_and_zero_dates_vanish() {
        let r = row(&[
            ("a", SqlValue::Text("2021-03-04 10:22:00".into())),
            ("b", SqlValue::Text("0000-00-00 00:00:00".into())),
            ("c", SqlValue::Text("04/03/2021".into())),
            ("d", SqlValue::Text("soon".into())),
        ]);
        assert_eq!(date(&r, "a").as_deref(), Some("2021-03-04"));
        assert_eq!(timestamp(&r, "a").as_deref(), Some("2021-03-04T10:22:00+00:00"));
        assert_eq!(date(&r, "b"), None);
        assert_eq!(date(&r, "c").as_deref(), Some("2021-03-04"));
        assert_eq!(date(&r, "d"), None);
    }

    #[test]
    fn abn_email_and_flags() {
        let r = row(&[
            ("abn", SqlValue::Text("12 345 678 901".into())),
            ("email", SqlValue::Text(" Jo@Example.COM ".into())),
            ("bad_email", SqlValue::Text("n/a".into())),
            ("f1", SqlValue::Number(1.0)),
            ("f2", SqlValue::Text("N".into())),
        ]);
        assert_eq!(abn(&r, "abn").as_deref(), Some("12345678901"));
        assert_eq!(email(&r, "email").as_deref(), Some("jo@example.com"));
        assert_eq!(email(&r, "bad_email"), None);
        assert_eq!(flag(&r, "f1"), Some(true));
        assert_eq!(flag(&r, "f2"), Some(false));
        assert_eq!(flag(&r, "missing"), None);
    }

    #[test]
    fn builder_skips_nulls() {
        let doc = DocBuilder::migrated()
            .set("name", "x")
            .set("gone", Option::<String>::None)
            .build();
        assert_eq!(doc.get("name"), Some(&json!("x")));
        assert!(doc.get("gone").is_none());
        assert_eq!(doc.get(MIGRATED_MARKER), Some(&json!(true)));
    }
}
