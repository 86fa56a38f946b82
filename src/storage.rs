use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::blob::{Blob, BlobStore};
use crate::breadcrumb::ActItem;
use crate::db::{Datastore, Entity, Key};

pub const ACT_KIND: &str = "Act";
pub const VERSION_KIND: &str = "ActVersion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act {
    pub code: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActVersion {
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_blob: Option<String>,
}

impl ActVersion {
    fn has_blob(&self) -> bool {
        self.raw_blob.as_deref().is_some_and(|b| !b.is_empty())
    }
}

pub fn act_key(code: &str) -> Key {
    Key::new(ACT_KIND, code)
}

pub fn version_key(code: &str, start: &str) -> Key {
    act_key(code).child(VERSION_KIND, start)
}

pub fn raw_blob_path(code: &str, start: &str) -> String {
    format!("acts/raw/{}/{}", code, start)
}

/// Writes scraped acts into the metadata store and their bodies into blobs.
///
/// Every field is first-write-wins: a second sighting of the same code or
/// `(code, start)` never changes a stored title, end date or body. The only
/// update ever made is filling in a missing `raw_blob`.
pub struct ActsStorage<B: BlobStore> {
    datastore: Datastore,
    blobs: B,
}

impl<B: BlobStore> ActsStorage<B> {
    pub fn new(datastore: Datastore, blobs: B) -> Self {
        Self { datastore, blobs }
    }

    #[cfg(test)]
    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    #[cfg(test)]
    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn store(&self, item: &ActItem) -> Result<()> {
        self.act_in_datastore(item)?;
        let (key, mut version) = self.version_in_datastore(item)?;

        if version.has_blob() {
            debug!(code = %item.code, start = %item.start, "Version already stored");
            return Ok(());
        }

        let path = self.store_raw_in_blobs(item)?;
        version.raw_blob = Some(path);
        self.datastore
            .put(&to_entity(key, &version)?)
            .with_context(|| format!("Failed to record blob for {} {}", item.code, item.start))?;
        info!(code = %item.code, start = %item.start, "Stored act version");
        Ok(())
    }

    fn act_in_datastore(&self, item: &ActItem) -> Result<Act> {
        let key = act_key(&item.code);
        if let Some(entity) = self.datastore.get(&key)? {
            return from_entity(&entity);
        }
        let act = Act {
            code: item.code.clone(),
            title: item.title.clone(),
        };
        self.datastore.put(&to_entity(key, &act)?)?;
        info!(code = %act.code, title = %act.title, "New act");
        Ok(act)
    }

    fn version_in_datastore(&self, item: &ActItem) -> Result<(Key, ActVersion)> {
        let key = version_key(&item.code, &item.start);
        if let Some(entity) = self.datastore.get(&key)? {
            return Ok((key, from_entity(&entity)?));
        }
        let version = ActVersion {
            start: item.start.clone(),
            end: item.end.clone(),
            raw_blob: None,
        };
        self.datastore.put(&to_entity(key.clone(), &version)?)?;
        Ok((key, version))
    }

    fn store_raw_in_blobs(&self, item: &ActItem) -> Result<String> {
        let blob = self.blobs.get_blob(&raw_blob_path(&item.code, &item.start))?;
        blob.upload_from_string(&item.body)
            .with_context(|| format!("Failed to upload {}", blob.name()))?;
        Ok(blob.name().to_string())
    }

    // ── Reads ──

    /// Whether `(code, start)` is stored along with its body.
    pub fn has_version(&self, code: &str, start: &str) -> Result<bool> {
        match self.datastore.get(&version_key(code, start))? {
            Some(entity) => Ok(from_entity::<ActVersion>(&entity)?.has_blob()),
            None => Ok(false),
        }
    }

    pub fn act(&self, code: &str) -> Result<Option<Act>> {
        self.datastore
            .get(&act_key(code))?
            .map(|e| from_entity(&e))
            .transpose()
    }

    pub fn acts(&self) -> Result<Vec<Act>> {
        self.datastore
            .query(ACT_KIND, &[])?
            .iter()
            .map(from_entity)
            .collect()
    }

    /// Versions of one act, newest first.
    pub fn versions(&self, code: &str) -> Result<Vec<ActVersion>> {
        let mut versions = self
            .datastore
            .children(VERSION_KIND, &act_key(code))?
            .iter()
            .map(from_entity)
            .collect::<Result<Vec<ActVersion>>>()?;
        versions.sort_by(|a, b| b.start.cmp(&a.start));
        Ok(versions)
    }

    pub fn raw_body(&self, version: &ActVersion) -> Result<Option<String>> {
        let Some(path) = version.raw_blob.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        let blob = self.blobs.get_blob(path)?;
        if !blob.exists()? {
            return Ok(None);
        }
        Ok(Some(blob.download_to_string()?))
    }

    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            acts: self.datastore.count(ACT_KIND)?,
            versions: self.datastore.count(VERSION_KIND)?,
            open_versions: self.datastore.query(VERSION_KIND, &[("end", "")])?.len(),
            missing_blobs: self
                .datastore
                .query(VERSION_KIND, &[])?
                .iter()
                .filter(|e| e.get_str("raw_blob").map_or(true, str::is_empty))
                .count(),
        })
    }
}

pub struct StorageStats {
    pub acts: usize,
    pub versions: usize,
    pub open_versions: usize,
    pub missing_blobs: usize,
}

fn to_entity<T: Serialize>(key: Key, record: &T) -> Result<Entity> {
    match serde_json::to_value(record)? {
        Value::Object(props) => Ok(Entity { key, props }),
        other => anyhow::bail!("Record did not serialize to an object: {}", other),
    }
}

fn from_entity<T: DeserializeOwned>(entity: &Entity) -> Result<T> {
    serde_json::from_value(Value::Object(entity.props.clone()))
        .with_context(|| format!("Malformed entity {}", entity.key.path()))
}
