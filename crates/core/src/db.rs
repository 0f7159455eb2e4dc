use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{Moment, MomentPatch};
use crate::store::MomentStorage;

const MOMENT_COLUMNS: &str = "id, name, description, original_uri, cropped_uri, \
                              start_time, end_time, created_at, thumbnail_uri";

pub struct SqliteMomentStorage {
    conn: Connection,
}

impl SqliteMomentStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS moments (
              id TEXT PRIMARY KEY NOT NULL,
              name TEXT NOT NULL,
              description TEXT,
              original_uri TEXT NOT NULL,
              cropped_uri TEXT NOT NULL,
              start_time REAL NOT NULL,
              end_time REAL NOT NULL,
              created_at TEXT NOT NULL,
              thumbnail_uri TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_moments_created_at ON moments(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_moments_name ON moments(name);
            "#,
        )?;
        Ok(())
    }

    fn query_moments(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Moment>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_moment)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl MomentStorage for SqliteMomentStorage {
    fn insert(&self, moment: &Moment) -> Result<()> {
        let description = Some(moment.description.as_str()).filter(|d| !d.is_empty());
        let res = self.conn.execute(
            r#"
            INSERT INTO moments (
              id, name, description, original_uri, cropped_uri,
              start_time, end_time, created_at, thumbnail_uri
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                moment.id,
                moment.name,
                description,
                moment.original_uri,
                moment.cropped_uri,
                moment.start_time_secs,
                moment.end_time_secs,
                format_timestamp(&moment.created_at),
                moment.thumbnail_uri.as_deref(),
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(Error::DuplicateId(moment.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn select_all(&self) -> Result<Vec<Moment>> {
        self.query_moments(
            &format!("SELECT {MOMENT_COLUMNS} FROM moments ORDER BY created_at DESC, id"),
            &[],
        )
    }

    fn select_by_id(&self, id: &str) -> Result<Option<Moment>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {MOMENT_COLUMNS} FROM moments WHERE id = ?1 LIMIT 1"),
                [id],
                row_to_moment,
            )
            .optional()?;
        Ok(row)
    }

    fn update(&self, id: &str, patch: &MomentPatch) -> Result<bool> {
        let mut set_clause = Vec::new();
        let mut values: Vec<Option<&str>> = Vec::new();
        if let Some(name) = &patch.name {
            set_clause.push("name = ?");
            values.push(Some(name.as_str()));
        }
        if let Some(description) = &patch.description {
            set_clause.push("description = ?");
            values.push(Some(description.as_str()).filter(|d| !d.is_empty()));
        }
        if set_clause.is_empty() {
            return Ok(self.select_by_id(id)?.is_some());
        }
        values.push(Some(id));

        let changed = self.conn.execute(
            &format!("UPDATE moments SET {} WHERE id = ?", set_clause.join(", ")),
            params_from_iter(values),
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM moments WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn search(&self, query: &str) -> Result<Vec<Moment>> {
        let pattern = format!("%{}%", escape_like(query));
        self.query_moments(
            &format!(
                "SELECT {MOMENT_COLUMNS} FROM moments \
                 WHERE name LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\' \
                 ORDER BY created_at DESC, id"
            ),
            &[&pattern],
        )
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM moments", [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM moments", [])?;
        Ok(())
    }
}

fn row_to_moment(r: &Row<'_>) -> rusqlite::Result<Moment> {
    let description: Option<String> = r.get(2)?;
    let created_at: String = r.get(7)?;
    Ok(Moment {
        id: r.get(0)?,
        name: r.get(1)?,
        description: description.unwrap_or_default(),
        original_uri: r.get(3)?,
        cropped_uri: r.get(4)?,
        start_time_secs: r.get(5)?,
        end_time_secs: r.get(6)?,
        created_at: parse_timestamp(&created_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?,
        thumbnail_uri: r.get(8)?,
    })
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn moment(id: &str, name: &str, secs: i64) -> Moment {
        Moment {
            id: id.into(),
            name: name.into(),
            description: format!("about {name}"),
            original_uri: "file:///videos/a.mp4".into(),
            cropped_uri: format!("file:///clips/{id}.mp4"),
            start_time_secs: 1.25,
            end_time_secs: 6.25,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 123_456_789).unwrap(),
            thumbnail_uri: Some(format!("file:///clips/{id}.jpg")),
        }
    }

    #[test]
    fn insert_and_select_round_trip() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        let m = moment("a", "Sunset", 0);
        db.insert(&m).unwrap();
        assert_eq!(db.select_by_id("a").unwrap(), Some(m));
        assert_eq!(db.select_by_id("missing").unwrap(), None);
    }

    #[test]
    fn timestamps_are_iso_8601_text() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        db.insert(&moment("a", "Sunset", 0)).unwrap();
        let raw: String = db
            .conn
            .query_row("SELECT created_at FROM moments WHERE id = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, "2023-11-14T22:13:20.123456789Z");
    }

    #[test]
    fn schema_has_no_foreign_keys() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        let enforced: i64 = db
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enforced, 0);
        let refs: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM pragma_foreign_key_list('moments')", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(refs, 0);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        db.insert(&moment("a", "One", 0)).unwrap();
        assert!(matches!(
            db.insert(&moment("a", "Two", 1)),
            Err(Error::DuplicateId(id)) if id == "a"
        ));
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn select_all_is_newest_first() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        db.insert(&moment("old", "Old", 0)).unwrap();
        db.insert(&moment("new", "New", 60)).unwrap();
        db.insert(&moment("mid", "Mid", 30)).unwrap();
        let ids: Vec<_> = db.select_all().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
    }

    #[test]
    fn equal_timestamps_are_ordered_by_id() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        for id in ["y", "x", "z"] {
            db.insert(&moment(id, "Same", 0)).unwrap();
        }
        let ids: Vec<_> = db.select_all().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["x", "y", "z"]);
        let found: Vec<_> = db.search("same").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(found, ids);
    }

    #[test]
    fn partial_update_and_delete() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        db.insert(&moment("a", "Sunset", 0)).unwrap();

        let patch = MomentPatch {
            name: Some("Dusk".into()),
            description: Some(String::new()),
        };
        assert!(db.update("a", &patch).unwrap());
        let updated = db.select_by_id("a").unwrap().unwrap();
        assert_eq!(updated.name, "Dusk");
        assert_eq!(updated.description, "");
        assert_eq!(updated.cropped_uri, "file:///clips/a.mp4");

        assert!(!db.update("zzz", &patch).unwrap());
        assert!(db.delete("a").unwrap());
        assert!(!db.delete("a").unwrap());
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn search_matches_name_or_description_literally() {
        let db = SqliteMomentStorage::open_in_memory().unwrap();
        db.insert(&moment("a", "Beach walk", 0)).unwrap();
        db.insert(&moment("b", "City 100%", 10)).unwrap();
        db.insert(&moment("c", "Forest", 20)).unwrap();

        let ids = |q: &str| -> Vec<String> {
            db.search(q).unwrap().into_iter().map(|m| m.id).collect()
        };
        assert_eq!(ids("beach"), ["a"]);
        assert_eq!(ids("about"), ["c", "b", "a"]);
        assert_eq!(ids("100%"), ["b"]);
        assert!(ids("%%").is_empty());

        db.clear().unwrap();
        assert!(db.select_all().unwrap().is_empty());
    }

    #[test]
    fn reopening_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("moments.db");
        {
            let db = SqliteMomentStorage::open(&path).unwrap();
            db.insert(&moment("a", "Sunset", 0)).unwrap();
        }
        let db = SqliteMomentStorage::open(&path).unwrap();
        assert_eq!(db.count().unwrap(), 1);
    }
}
