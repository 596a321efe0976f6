//! The identity manager and lineage engine
//!
//! `SoundManager` owns one value store and implements the graph walks: root
//! discovery, full reconstruction, single-component reconstruction, and
//! cross-store import. It is a cheap cloneable handle, so consumer objects
//! can carry one without a hidden global "last used store" anywhere.
//!
//! The engine works on raw buffers and the [`LineageNode`] capability only;
//! it never constructs the consumer-facing `Sound` type.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;

use tracing::debug;

use crate::annotations::{merge_annotations, AnnotationValue, Annotations};
use crate::error::{LineageError, Result};
use crate::store::{Id, MemoryStore, SoundStore, WAVEFORM_DATA};
use crate::transforms::{LineageNode, TransformKind, TransformMeta};
use crate::waveform::Waveform;

struct ManagerInner {
    store: Box<dyn SoundStore>,
    read_only: bool,
    /// Set while replaying history: the store path becomes a pure
    /// pass-through so reconstruction never grows the graph.
    reconstructing: bool,
}

/// Cloneable handle to one store plus the lineage engine. Single-threaded by
/// design; all walks are synchronous depth-first recursion.
#[derive(Clone)]
pub struct SoundManager {
    inner: Rc<RefCell<ManagerInner>>,
}

impl SoundManager {
    pub fn new(store: Box<dyn SoundStore>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManagerInner {
                store,
                read_only: false,
                reconstructing: false,
            })),
        }
    }

    /// A manager over a fresh ephemeral store.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    pub fn read_only(&self) -> bool {
        self.inner.borrow().read_only
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.borrow_mut().read_only = read_only;
    }

    pub fn is_reconstructing(&self) -> bool {
        self.inner.borrow().reconstructing
    }

    pub fn new_id(&self) -> Result<Id> {
        self.inner.borrow_mut().store.new_id()
    }

    /// The single write path. Resolves the metadata's kind to its registry
    /// entry and delegates; a read-only or reconstructing manager turns this
    /// into a pass-through that performs no store mutation. Returns whether
    /// anything was persisted.
    pub fn store(
        &self,
        node: &mut dyn LineageNode,
        meta: &TransformMeta,
        persist_data: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only || inner.reconstructing {
            debug!(id = %node.id(), kind = meta.kind.tag(), "store skipped (read-only/reconstructing)");
            return Ok(false);
        }
        meta.kind
            .store(inner.store.as_mut(), node, meta, persist_data)?;
        Ok(true)
    }

    /// Merge validated annotations onto an identity. Soft-fails under a
    /// read-only manager.
    pub fn annotate(&self, id: Id, annotations: &Annotations) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only || inner.reconstructing {
            return Ok(false);
        }
        inner.store.put_annotations(id, annotations)
    }

    pub fn annotations(&self, id: Id) -> Result<Annotations> {
        self.inner.borrow().store.get_annotations(id)
    }

    /// Raw prefixed metadata attributes, as persisted.
    pub fn metadata_attrs(&self, id: Id) -> Result<Annotations> {
        self.inner.borrow().store.get_metadata(id)
    }

    /// Decoded transform metadata; `None` when the identity has none.
    pub fn metadata(&self, id: Id) -> Result<Option<TransformMeta>> {
        TransformMeta::from_metadata_attrs(&self.metadata_attrs(id)?)
    }

    pub fn data(&self, id: Id) -> Result<Option<Waveform>> {
        self.inner.borrow().store.get_data(id, WAVEFORM_DATA)
    }

    /// Persist an identity's primary buffer. Soft-fails under a read-only
    /// manager.
    pub fn persist_data(&self, id: Id, wave: &Waveform) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only || inner.reconstructing {
            return Ok(false);
        }
        inner.store.put_data(id, WAVEFORM_DATA, wave, true)
    }

    /// Write raw prefixed metadata. Intended for import and tests; normal
    /// writes go through [`SoundManager::store`].
    pub fn put_metadata_attrs(&self, id: Id, attrs: &Annotations) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only || inner.reconstructing {
            return Ok(false);
        }
        inner.store.put_metadata(id, attrs)
    }

    pub fn filter_ids(&self, query: &Annotations, limit: Option<usize>) -> Result<Vec<Id>> {
        self.inner.borrow().store.filter_ids(query, limit)
    }

    pub fn list_ids(&self) -> Result<Vec<Id>> {
        self.inner.borrow().store.list_ids()
    }

    pub fn list_roots(&self) -> Result<Vec<Id>> {
        self.inner.borrow().store.list_roots()
    }

    /// The transitive roots of `id`, in depth-first discovery order with
    /// duplicates removed. An identity with no stored parents (including one
    /// the store has never seen) is its own root.
    pub fn roots(&self, id: Id) -> Result<Vec<Id>> {
        let mut roots = Vec::new();
        let mut path = HashSet::new();
        let mut seen = HashSet::new();
        self.collect_roots(id, &mut path, &mut seen, &mut roots)?;
        Ok(roots)
    }

    fn collect_roots(
        &self,
        id: Id,
        path: &mut HashSet<Id>,
        seen: &mut HashSet<Id>,
        roots: &mut Vec<Id>,
    ) -> Result<()> {
        if !path.insert(id) {
            return Err(LineageError::CorruptGraph(id));
        }
        // Diamonds are legal: a node reached twice off the active path is
        // simply skipped.
        if seen.insert(id) {
            match self.metadata(id)? {
                Some(meta) if !meta.parents.is_empty() => {
                    for parent in &meta.parents {
                        self.collect_roots(*parent, path, seen, roots)?;
                    }
                }
                _ => {
                    if !roots.contains(&id) {
                        roots.push(id);
                    }
                }
            }
        }
        path.remove(&id);
        Ok(())
    }

    /// Rebuild the buffer for `id` purely from stored metadata and ancestor
    /// data. The manager is in reconstruction mode for the duration, so
    /// nothing replayed along the way is written back as a new node.
    pub fn reconstruct(&self, id: Id) -> Result<Waveform> {
        let _guard = ReconstructionGuard::enter(self);
        let mut path = HashSet::new();
        self.rebuild(id, &mut path)
    }

    fn rebuild(&self, id: Id, path: &mut HashSet<Id>) -> Result<Waveform> {
        if !path.insert(id) {
            return Err(LineageError::CorruptGraph(id));
        }
        debug!(%id, "reconstructing");
        let result = self.rebuild_node(id, path);
        path.remove(&id);
        result
    }

    fn rebuild_node(&self, id: Id, path: &mut HashSet<Id>) -> Result<Waveform> {
        if let Some(wave) = self.data(id)? {
            debug!(%id, "found materialized data");
            return Ok(wave);
        }
        let meta = self.metadata(id)?.ok_or(LineageError::NotFound(id))?;
        if meta.kind == TransformKind::Component {
            // Delegate rather than reconstructing the composite parents
            return meta.kind.reconstruct(&[], &meta, false, self);
        }
        if meta.parents.is_empty() {
            if meta.kind == TransformKind::Init {
                // An externally supplied root with its data gone is a dead end
                return Err(LineageError::NotFound(id));
            }
            return meta.kind.reconstruct(&[], &meta, false, self);
        }
        debug!(%id, parents = meta.parents.len(), "reconstructing from parents");
        let parent_waves = meta
            .parents
            .iter()
            .map(|&parent| self.rebuild(parent, path))
            .collect::<Result<Vec<_>>>()?;
        meta.kind.reconstruct(&parent_waves, &meta, false, self)
    }

    /// Rebuild only the contribution of `root_id` within the subgraph rooted
    /// at `id`: leaves other than `root_id` are replaced by silence of
    /// matching shape, so timing alignment survives. The result is persisted
    /// eagerly as a Component node, making repeat lookups O(1).
    pub fn reconstruct_component(&self, id: Id, root_id: Id) -> Result<Waveform> {
        let roots = self.roots(id)?;
        if !roots.contains(&root_id) {
            return Err(LineageError::UnrelatedRoot { id, root_id });
        }

        if let Some(wave) = self.find_component(id, root_id)? {
            debug!(%id, %root_id, "component already materialized");
            return Ok(wave);
        }

        let wave = {
            let _guard = ReconstructionGuard::enter(self);
            let mut path = HashSet::new();
            self.rebuild_component(id, root_id, &mut path)?
        };

        // Eager memoization; a pass-through when this call is itself part of
        // a larger reconstruction
        let meta = TransformMeta::new(TransformKind::Component, vec![id, root_id])
            .with_param("id", id.0 as i64)
            .with_param("root_id", root_id.0 as i64);
        let mut node = BufferNode::new(self.new_id()?, wave.clone());
        node.annotations.insert(
            "samplerate".to_string(),
            AnnotationValue::Float(wave.sample_rate as f64),
        );
        self.store(&mut node, &meta, true)?;

        Ok(wave)
    }

    /// Memoized lookup: a prior Component record for this exact pair that
    /// still has its buffer.
    fn find_component(&self, id: Id, root_id: Id) -> Result<Option<Waveform>> {
        let mut query = Annotations::new();
        query.insert("transform_type".to_string(), "component".into());
        query.insert("transform_id".to_string(), AnnotationValue::Int(id.0 as i64));
        query.insert(
            "transform_root_id".to_string(),
            AnnotationValue::Int(root_id.0 as i64),
        );
        for candidate in self.filter_ids(&query, None)? {
            if let Some(wave) = self.data(candidate)? {
                return Ok(Some(wave));
            }
        }
        Ok(None)
    }

    fn rebuild_component(
        &self,
        id: Id,
        root_id: Id,
        path: &mut HashSet<Id>,
    ) -> Result<Waveform> {
        if !path.insert(id) {
            return Err(LineageError::CorruptGraph(id));
        }
        let result = self.rebuild_component_node(id, root_id, path);
        path.remove(&id);
        result
    }

    fn rebuild_component_node(
        &self,
        id: Id,
        root_id: Id,
        path: &mut HashSet<Id>,
    ) -> Result<Waveform> {
        let meta = self.metadata(id)?.ok_or(LineageError::NotFound(id))?;

        if meta.kind == TransformKind::Component {
            // A materialized component in the ancestry: keep it only if it
            // descends from the requested root
            let wave = meta.kind.reconstruct(&[], &meta, false, self)?;
            if self.roots(id)?.contains(&root_id) {
                return Ok(wave);
            }
            return Ok(wave.silence_like());
        }

        if !meta.parents.is_empty() {
            // Interior nodes always recurse: their materialized data would
            // carry the sibling branches' energy
            let parent_waves = meta
                .parents
                .iter()
                .map(|&parent| self.rebuild_component(parent, root_id, path))
                .collect::<Result<Vec<_>>>()?;
            return meta.kind.reconstruct(&parent_waves, &meta, false, self);
        }

        // Leaf: replay (or load) it, silenced unless it is the target root
        let silence = id != root_id;
        if silence {
            debug!(%id, %root_id, "silencing unrelated root");
        }
        let data: Vec<Waveform> = self.data(id)?.into_iter().collect();
        if data.is_empty() && meta.kind == TransformKind::Init {
            return Err(LineageError::NotFound(id));
        }
        meta.kind.reconstruct(&data, &meta, silence, self)
    }

    /// Copy nodes from another manager's store into this one, allocating
    /// fresh identities and rewriting the copied edges.
    ///
    /// With `recursive` set, all ancestors are imported too. Otherwise an
    /// ancestor outside the requested set is imported as a data-only node:
    /// its buffer is fully reconstructed by the source manager and its own
    /// parents are stripped, severing further upstream lineage at that point.
    ///
    /// `extra_annotations` are merged into every copied node's annotations
    /// under the standard merge policy.
    pub fn import_ids(
        &self,
        source: &SoundManager,
        ids: &[Id],
        recursive: bool,
        extra_annotations: &Annotations,
    ) -> Result<Vec<Id>> {
        if self.read_only() {
            return Err(LineageError::BadParameter(
                "cannot import into a read-only manager".to_string(),
            ));
        }

        let mut mapping: BTreeMap<Id, Id> = BTreeMap::new();
        let mut severed: HashSet<Id> = HashSet::new();
        let mut queue: VecDeque<Id> = ids.iter().copied().collect();

        while let Some(old) = queue.pop_front() {
            if mapping.contains_key(&old) {
                continue;
            }
            let new_id = self.new_id()?;
            debug!(%old, %new_id, "importing node");
            mapping.insert(old, new_id);

            let annotations = source.annotations(old)?;
            let merged = if extra_annotations.is_empty() {
                annotations
            } else {
                merge_annotations(&annotations, extra_annotations)?
            };
            if !merged.is_empty() {
                self.annotate(new_id, &merged)?;
            }

            let attrs = source.metadata_attrs(old)?;
            if !attrs.is_empty() {
                self.put_metadata_attrs(new_id, &attrs)?;
            }
            if let Some(wave) = source.data(old)? {
                self.persist_data(new_id, &wave)?;
            }

            if recursive {
                if let Some(meta) = TransformMeta::from_metadata_attrs(&attrs)? {
                    for parent in meta.parents {
                        queue.push_back(parent);
                    }
                }
            }
        }

        if !recursive {
            // Fill the gaps one level up: every referenced-but-uncopied
            // parent becomes a reconstructed, parentless node
            let copied: Vec<Id> = mapping.keys().copied().collect();
            for old in copied {
                let Some(meta) = source.metadata(old)? else {
                    continue;
                };
                for parent in meta.parents {
                    if mapping.contains_key(&parent) {
                        continue;
                    }
                    let new_id = self.new_id()?;
                    debug!(%parent, %new_id, "importing severed ancestor");
                    mapping.insert(parent, new_id);
                    severed.insert(parent);

                    let annotations = source.annotations(parent)?;
                    if !annotations.is_empty() {
                        self.annotate(new_id, &annotations)?;
                    }
                    let attrs = source.metadata_attrs(parent)?;
                    if !attrs.is_empty() {
                        self.put_metadata_attrs(new_id, &attrs)?;
                    }
                    let wave = source.reconstruct(parent)?;
                    self.persist_data(new_id, &wave)?;
                }
            }
        }

        // Rewrite every copied node's edges from old to new identities
        for (&old, &new_id) in &mapping {
            let attrs = self.metadata_attrs(new_id)?;
            let Some(mut meta) = TransformMeta::from_metadata_attrs(&attrs)? else {
                continue;
            };
            if severed.contains(&old) {
                meta.parents.clear();
            } else {
                meta.parents = meta
                    .parents
                    .iter()
                    .map(|p| {
                        mapping
                            .get(p)
                            .copied()
                            .ok_or(LineageError::NotFound(*p))
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
            meta.children = meta
                .children
                .iter()
                .filter_map(|c| mapping.get(c).copied())
                .collect();
            self.put_metadata_attrs(new_id, &meta.to_metadata_attrs())?;
        }

        Ok(ids.iter().map(|id| mapping[id]).collect())
    }
}

/// Minimal buffer-bound node used when the engine itself must persist
/// something (component memoization).
struct BufferNode {
    id: Id,
    wave: Waveform,
    annotations: Annotations,
}

impl BufferNode {
    fn new(id: Id, wave: Waveform) -> Self {
        Self {
            id,
            wave,
            annotations: Annotations::new(),
        }
    }
}

impl LineageNode for BufferNode {
    fn id(&self) -> Id {
        self.id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    fn waveform(&self) -> &Waveform {
        &self.wave
    }

    fn annotations(&self) -> &Annotations {
        &self.annotations
    }
}

/// RAII flag flip for reconstruction mode; restores the previous value so
/// nested walks stay in mode until the outermost one finishes.
struct ReconstructionGuard {
    manager: SoundManager,
    previous: bool,
}

impl ReconstructionGuard {
    fn enter(manager: &SoundManager) -> Self {
        let previous = {
            let mut inner = manager.inner.borrow_mut();
            std::mem::replace(&mut inner.reconstructing, true)
        };
        Self {
            manager: manager.clone(),
            previous,
        }
    }
}

impl Drop for ReconstructionGuard {
    fn drop(&mut self) {
        self.manager.inner.borrow_mut().reconstructing = self.previous;
    }
}
