use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Entity key: a kind and name, optionally nested under a parent key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub kind: String,
    pub name: String,
    pub parent: Option<Box<Key>>,
}

impl Key {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            parent: None,
        }
    }

    pub fn child(&self, kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// `Act:A-1/ActVersion:2015-07-09`
    pub fn path(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}/{}:{}", parent.path(), self.kind, self.name),
            None => format!("{}:{}", self.kind, self.name),
        }
    }

    fn parent_path(&self) -> String {
        self.parent.as_ref().map(|p| p.path()).unwrap_or_default()
    }

    fn from_path(path: &str) -> Result<Self> {
        let mut key: Option<Key> = None;
        for segment in path.split('/') {
            let Some((kind, name)) = segment.split_once(':') else {
                bail!("Malformed key path {:?}", path);
            };
            key = Some(match key {
                Some(parent) => parent.child(kind, name),
                None => Key::new(kind, name),
            });
        }
        key.with_context(|| format!("Empty key path {:?}", path))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: Key,
    pub props: Map<String, Value>,
}

impl Entity {
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.props.get(field).and_then(Value::as_str)
    }
}

/// Document store over a single SQLite table; properties are JSON objects.
pub struct Datastore {
    conn: Connection,
}

impl Datastore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(connect(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entities (
                kind       TEXT NOT NULL,
                name       TEXT NOT NULL,
                parent     TEXT NOT NULL DEFAULT '',
                props      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (kind, parent, name)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(parent, kind);
            ",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &Key) -> Result<Option<Entity>> {
        let props: Option<String> = self
            .conn
            .query_row(
                "SELECT props FROM entities WHERE kind = ?1 AND parent = ?2 AND name = ?3",
                rusqlite::params![key.kind, key.parent_path(), key.name],
                |row| row.get(0),
            )
            .optional()?;
        props
            .map(|p| {
                Ok(Entity {
                    key: key.clone(),
                    props: parse_props(&p)?,
                })
            })
            .transpose()
    }

    /// Insert or fully replace the entity stored under `entity.key`.
    pub fn put(&self, entity: &Entity) -> Result<()> {
        let props = serde_json::to_string(&entity.props)?;
        self.conn.execute(
            "INSERT INTO entities (kind, name, parent, props) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, parent, name)
             DO UPDATE SET props = excluded.props, updated_at = datetime('now')",
            rusqlite::params![entity.key.kind, entity.key.name, entity.key.parent_path(), props],
        )?;
        Ok(())
    }

    /// All entities of `kind` whose string properties equal every filter value.
    pub fn query(&self, kind: &str, filters: &[(&str, &str)]) -> Result<Vec<Entity>> {
        let mut sql = String::from("SELECT name, parent, props FROM entities WHERE kind = ?1");
        let mut params: Vec<String> = vec![kind.to_string()];
        for (field, value) in filters {
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                bail!("Unsupported filter field {:?}", field);
            }
            params.push(value.to_string());
            sql.push_str(&format!(" AND json_extract(props, '$.{}') = ?{}", field, params.len()));
        }
        sql.push_str(" ORDER BY parent, name");
        self.collect(kind, &sql, &params)
    }

    /// Direct children of `parent` with the given kind, ordered by name.
    pub fn children(&self, kind: &str, parent: &Key) -> Result<Vec<Entity>> {
        self.collect(
            kind,
            "SELECT name, parent, props FROM entities WHERE kind = ?1 AND parent = ?2 ORDER BY name",
            &[kind.to_string(), parent.path()],
        )
    }

    pub fn count(&self, kind: &str) -> Result<usize> {
        let n: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            [kind],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn collect(&self, kind: &str, sql: &str, params: &[String]) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, parent, props)| {
                let key = if parent.is_empty() {
                    Key::new(kind, &name)
                } else {
                    Key::from_path(&parent)?.child(kind, &name)
                };
                Ok(Entity {
                    key,
                    props: parse_props(&props)?,
                })
            })
            .collect()
    }
}

fn parse_props(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("Corrupt entity properties")? {
        Value::Object(map) => Ok(map),
        other => bail!("Entity properties are not an object: {}", other),
    }
}
