//! Durable file-backed store
//!
//! One JSON document per store: `{ next_id, records }`. Every call opens the
//! file, does its work, and closes it again; writes go through a sibling
//! temporary file followed by a rename, so a failed write never leaves a
//! half-written document behind. This per-call open/close is coarse but keeps
//! resource acquisition scoped: an error on any path simply drops the handle.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::annotations::{check_annotations, Annotations, TRANSFORM_PREFIX};
use crate::error::{LineageError, Result};
use crate::store::{matches_query, split_annotations, split_metadata, Id, Record, SoundStore};
use crate::waveform::Waveform;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    next_id: u64,
    records: BTreeMap<u64, Record>,
}

/// JSON-on-disk implementation of [`SoundStore`].
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    read_only: bool,
    /// In-memory identity counter. Identities must stay unique within a
    /// session even when the store is read-only and the document's own
    /// counter cannot be written back.
    next_id: u64,
}

impl FileStore {
    /// Open (or lazily create) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, false)
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, true)
    }

    fn open_with<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let mut store = Self {
            path: path.as_ref().to_path_buf(),
            read_only,
            next_id: 0,
        };
        // Validate an existing document up front rather than on first use
        let doc = store.load()?;
        store.next_id = Self::id_floor(&doc);
        Ok(store)
    }

    fn id_floor(doc: &Document) -> u64 {
        let floor = doc
            .records
            .keys()
            .next_back()
            .map(|&k| k + 1)
            .unwrap_or(0);
        doc.next_id.max(floor)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Document::default()),
            Err(err) => Err(LineageError::Io(err)),
        }
    }

    fn save(&self, doc: &Document) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load, mutate, save. The mutation result decides whether anything is
    /// written back.
    fn update<T>(&self, apply: impl FnOnce(&mut Document) -> Result<(bool, T)>) -> Result<(bool, T)> {
        let mut doc = self.load()?;
        let (changed, value) = apply(&mut doc)?;
        if changed {
            self.save(&doc)?;
        }
        Ok((changed, value))
    }
}

impl SoundStore for FileStore {
    fn new_id(&mut self) -> Result<Id> {
        let mut doc = self.load()?;
        let id = Self::id_floor(&doc).max(self.next_id);
        self.next_id = id + 1;
        if !self.read_only {
            doc.next_id = id + 1;
            self.save(&doc)?;
        }
        Ok(Id(id))
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn contains(&self, id: Id) -> Result<bool> {
        Ok(self.load()?.records.contains_key(&id.0))
    }

    fn put_annotations(&mut self, id: Id, annotations: &Annotations) -> Result<bool> {
        check_annotations(annotations)?;
        if self.read_only {
            return Ok(false);
        }
        let (changed, _) = self.update(|doc| {
            let record = doc.records.entry(id.0).or_default();
            for (key, value) in annotations {
                record.attrs.insert(key.clone(), value.clone());
            }
            Ok((true, ()))
        })?;
        Ok(changed)
    }

    fn get_annotations(&self, id: Id) -> Result<Annotations> {
        Ok(self
            .load()?
            .records
            .get(&id.0)
            .map(|r| split_annotations(&r.attrs))
            .unwrap_or_default())
    }

    fn put_metadata(&mut self, id: Id, metadata: &Annotations) -> Result<bool> {
        for key in metadata.keys() {
            if !key.starts_with(TRANSFORM_PREFIX) {
                return Err(LineageError::Encoding(format!(
                    "transform metadata key {:?} lacks the {:?} prefix",
                    key, TRANSFORM_PREFIX
                )));
            }
        }
        if self.read_only {
            return Ok(false);
        }
        let (changed, _) = self.update(|doc| {
            let record = doc.records.entry(id.0).or_default();
            for (key, value) in metadata {
                record.attrs.insert(key.clone(), value.clone());
            }
            Ok((true, ()))
        })?;
        Ok(changed)
    }

    fn get_metadata(&self, id: Id) -> Result<Annotations> {
        Ok(self
            .load()?
            .records
            .get(&id.0)
            .map(|r| split_metadata(&r.attrs))
            .unwrap_or_default())
    }

    fn put_data(&mut self, id: Id, name: &str, wave: &Waveform, overwrite: bool) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }
        let (changed, _) = self.update(|doc| {
            let record = doc.records.entry(id.0).or_default();
            if !overwrite && record.data.contains_key(name) {
                return Ok((false, ()));
            }
            record.data.insert(name.to_string(), wave.clone());
            Ok((true, ()))
        })?;
        Ok(changed)
    }

    fn get_data(&self, id: Id, name: &str) -> Result<Option<Waveform>> {
        Ok(self
            .load()?
            .records
            .get(&id.0)
            .and_then(|r| r.data.get(name))
            .cloned())
    }

    fn filter_ids(&self, query: &Annotations, limit: Option<usize>) -> Result<Vec<Id>> {
        self.filter_ids_by(&|attrs| matches_query(attrs, query), limit)
    }

    fn filter_ids_by(
        &self,
        predicate: &dyn Fn(&Annotations) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Id>> {
        let doc = self.load()?;
        let mut matched = Vec::new();
        for (&id, record) in &doc.records {
            if predicate(&record.attrs) {
                matched.push(Id(id));
                if limit.is_some_and(|n| matched.len() >= n) {
                    break;
                }
            }
        }
        Ok(matched)
    }

    fn list_ids(&self) -> Result<Vec<Id>> {
        Ok(self.load()?.records.keys().map(|&k| Id(k)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationValue;
    use crate::store::WAVEFORM_DATA;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("lineage.json")
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let id;
        {
            let mut store = FileStore::open(&path).unwrap();
            id = store.new_id().unwrap();
            let mut anns = Annotations::new();
            anns.insert("samplerate".to_string(), AnnotationValue::Float(100.0));
            store.put_annotations(id, &anns).unwrap();
            let wave = Waveform::mono(vec![1.0, -1.0], 100.0).unwrap();
            store.put_data(id, WAVEFORM_DATA, &wave, true).unwrap();
        }

        let mut reopened = FileStore::open(&path).unwrap();
        let anns = reopened.get_annotations(id).unwrap();
        assert_eq!(anns["samplerate"], AnnotationValue::Float(100.0));
        let wave = reopened.get_data(id, WAVEFORM_DATA).unwrap().unwrap();
        assert_eq!(wave.data, vec![1.0, -1.0]);

        // Fresh ids never collide with persisted ones
        let next = reopened.new_id().unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_read_only_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let id;
        {
            let mut store = FileStore::open(&path).unwrap();
            id = store.new_id().unwrap();
            let mut anns = Annotations::new();
            anns.insert("keep".to_string(), "me".into());
            store.put_annotations(id, &anns).unwrap();
        }

        let mut store = FileStore::open_read_only(&path).unwrap();
        let mut anns = Annotations::new();
        anns.insert("extra".to_string(), "nope".into());
        assert!(!store.put_annotations(id, &anns).unwrap());
        let wave = Waveform::mono(vec![0.0], 100.0).unwrap();
        assert!(!store.put_data(id, WAVEFORM_DATA, &wave, true).unwrap());

        let readback = store.get_annotations(id).unwrap();
        assert_eq!(readback.len(), 1);
        assert_eq!(readback["keep"], AnnotationValue::Str("me".to_string()));
    }

    #[test]
    fn test_read_only_ids_stay_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        {
            let mut store = FileStore::open(&path).unwrap();
            store.new_id().unwrap();
        }
        let size_before = fs::metadata(&path).unwrap().len();

        let mut store = FileStore::open_read_only(&path).unwrap();
        let a = store.new_id().unwrap();
        let b = store.new_id().unwrap();
        let c = store.new_id().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a < b && b < c);
        // The document itself was never touched
        assert_eq!(fs::metadata(&path).unwrap().len(), size_before);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
