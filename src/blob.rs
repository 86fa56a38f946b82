use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Handle to one named object; it need not exist yet.
pub trait Blob {
    fn name(&self) -> &str;
    fn exists(&self) -> Result<bool>;
    fn upload_from_string(&self, data: &str) -> Result<()>;
    fn download_to_string(&self) -> Result<String>;
    #[allow(dead_code)]
    fn delete(&self) -> Result<()>;
}

pub trait BlobStore {
    type Blob: Blob;

    fn get_blob(&self, name: &str) -> Result<Self::Blob>;
}

/// Blob store laid out as plain files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for FsBlobStore {
    type Blob = FsBlob;

    fn get_blob(&self, name: &str) -> Result<FsBlob> {
        if name.is_empty()
            || name
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            bail!("Invalid blob name {:?}", name);
        }
        Ok(FsBlob {
            name: name.to_string(),
            path: self.root.join(name),
        })
    }
}

pub struct FsBlob {
    name: String,
    path: PathBuf,
}

impl Blob for FsBlob {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.is_file())
    }

    fn upload_from_string(&self, data: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        // Readers never see a half-written blob.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, data).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move blob into {:?}", self.path))?;
        Ok(())
    }

    fn download_to_string(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).with_context(|| format!("Failed to read blob {}", self.name))
    }

    fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.path).with_context(|| format!("Failed to delete blob {}", self.name))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let blob = store.get_blob("acts/raw/A-1/2016-01-01").unwrap();

        assert_eq!(blob.name(), "acts/raw/A-1/2016-01-01");
        assert!(!blob.exists().unwrap());

        blob.upload_from_string("Text of Act").unwrap();
        assert!(blob.exists().unwrap());
        assert!(dir.path().join("acts/raw/A-1/2016-01-01").is_file());
        assert_eq!(blob.download_to_string().unwrap(), "Text of Act");

        blob.upload_from_string("Text of Act, amended").unwrap();
        assert_eq!(
            store.get_blob("acts/raw/A-1/2016-01-01").unwrap().download_to_string().unwrap(),
            "Text of Act, amended"
        );

        blob.delete().unwrap();
        assert!(!blob.exists().unwrap());
        assert!(blob.download_to_string().is_err());
    }

    #[test]
    fn dotted_codes_are_plain_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let blob = store.get_blob("acts/raw/B-1.01/2017-04-01").unwrap();
        blob.upload_from_string("<div>Bank Act</div>").unwrap();
        assert!(dir.path().join("acts/raw/B-1.01/2017-04-01").is_file());
        assert!(!dir.path().join("acts/raw/B-1.01/2017-04-01.partial").exists());
    }

    #[test]
    fn names_cannot_escape_root() {
        let store = FsBlobStore::new("/tmp/acts-blobs");
        for bad in ["", "../etc/passwd", "acts//raw", "acts/./raw", "acts/raw/"] {
            assert!(store.get_blob(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
