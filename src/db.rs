use crate::store::{Collection, DeleteFilter, Document, NaturalKey, Record, TargetStore};
use anyhow::Context;
use rusqlite::types::Value as SqlParam;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STORE_FILE: &str = "migration.sqlite3";

/// Document store backed by a single SQLite table of JSON bodies.
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(workspace)?;
        let db_path = workspace.join(STORE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// On-disk location; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    register_fold_key(conn)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents(
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)",
        [],
    )?;
    Ok(())
}

/// Comparison form of a natural-key value: trimmed, Unicode lowercase.
pub fn fold_key(value: &str) -> String {
    value.trim().to_lowercase()
}

// SQLite's lower() only folds ASCII, so key comparison goes through Rust.
fn register_fold_key(conn: &Connection) -> anyhow::Result<()> {
    conn.create_scalar_function(
        "fold_key",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.as_deref().map(fold_key).unwrap_or_default())
        },
    )
    .context("failed to register fold_key")?;
    Ok(())
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

fn parse_body(id: String, body: &str) -> anyhow::Result<Record> {
    let doc: Document = serde_json::from_str(body)
        .with_context(|| format!("document {id} has an invalid body"))?;
    Ok(Record { id, doc })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl TargetStore for SqliteStore {
    fn find_by_natural_key(
        &self,
        collection: Collection,
        key: &NaturalKey,
    ) -> anyhow::Result<Option<Record>> {
        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        let mut params: Vec<SqlParam> = vec![SqlParam::Text(collection.name().to_string())];
        for (field, value) in &key.fields {
            sql.push_str(" AND fold_key(CAST(json_extract(body, ?) AS TEXT)) = ?");
            params.push(SqlParam::Text(json_path(field)));
            params.push(SqlParam::Text(fold_key(value)));
        }
        sql.push_str(" ORDER BY rowid LIMIT 1");

        let mut stmt = self.conn.prepare(&sql)?;
        let hit = stmt
            .query_row(params_from_iter(params), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        match hit {
            Some((id, body)) => Ok(Some(parse_body(id, &body)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, collection: Collection, doc: Document) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&doc).context("failed to serialize document")?;
        self.conn
            .execute(
                "INSERT INTO documents(id, collection, body, created_at) VALUES(?, ?, ?, ?)",
                (&id, collection.name(), &body, now()),
            )
            .with_context(|| format!("insert into {} failed", collection.name()))?;
        Ok(id)
    }

    fn update(&self, collection: Collection, id: &str, patch: Document) -> anyhow::Result<bool> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE id = ? AND collection = ?",
                (id, collection.name()),
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Ok(false);
        };
        let mut record = parse_body(id.to_string(), &body)?;
        for (k, v) in patch {
            record.doc.insert(k, v);
        }
        let body = serde_json::to_string(&record.doc).context("failed to serialize document")?;
        self.conn.execute(
            "UPDATE documents SET body = ?, updated_at = ? WHERE id = ?",
            (&body, now(), id),
        )?;
        Ok(true)
    }

    fn delete_many(&self, collection: Collection, filter: &DeleteFilter) -> anyhow::Result<usize> {
        let n = match filter {
            DeleteFilter::All => self.conn.execute(
                "DELETE FROM documents WHERE collection = ?",
                [collection.name()],
            )?,
            DeleteFilter::FieldEquals(field, value) => {
                let param = match value {
                    serde_json::Value::Bool(b) => SqlParam::Integer(*b as i64),
                    serde_json::Value::Number(n) => match n.as_i64() {
                        Some(i) => SqlParam::Integer(i),
                        None => SqlParam::Real(n.as_f64().unwrap_or_default()),
                    },
                    serde_json::Value::String(s) => SqlParam::Text(s.clone()),
                    other => SqlParam::Text(other.to_string()),
                };
                self.conn.execute(
                    "DELETE FROM documents WHERE collection = ? AND json_extract(body, ?) = ?",
                    params_from_iter([
                        SqlParam::Text(collection.name().to_string()),
                        SqlParam::Text(json_path(field)),
                        param,
                    ]),
                )?
            }
        };
        Ok(n)
    }

    fn list(&self, collection: Collection) -> anyhow::Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM documents WHERE collection = ? ORDER BY rowid")?;
        let rows = stmt
            .query_map([collection.name()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, body)| parse_body(id, &body))
            .collect()
    }

    fn count(&self, collection: Collection) -> anyhow::Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?",
            [collection.name()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
