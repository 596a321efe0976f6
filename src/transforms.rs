//! The transform registry: a closed set of transform kinds, each knowing how
//! to persist itself and how to replay itself from its parents' buffers
//!
//! The persisted `transform_type` attribute is a stable textual tag resolved
//! back through [`TransformKind::from_tag`] on read — a tagged enumeration,
//! exhaustively matchable, instead of type-name reflection. Metadata for a
//! node encodes as prefixed attributes: `transform_type`,
//! `transform_parents`, `transform_children`, and `transform_<param>` for
//! every stored parameter.

use tracing::debug;

use crate::annotations::{AnnotationValue, Annotations, TRANSFORM_PREFIX};
use crate::error::{LineageError, Result};
use crate::manager::SoundManager;
use crate::store::{Id, SoundStore, WAVEFORM_DATA};
use crate::waveform::{load_wav, Waveform};
use crate::{dsp, store};

/// Every operation the lineage engine can record and replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    /// Externally supplied buffer registered as a root.
    Init,
    /// Root loaded from an audio file (params: filename, samplerate).
    Load,
    /// Root produced by a generator factory (params: factory + its kwargs).
    Create,
    Mono,
    Filter,
    Pad,
    Clip,
    Slice,
    Multiply,
    Add,
    /// Replace a span of a base signal with another (parents: base, replacement).
    Set,
    Resample,
    Ramp,
    Channel,
    /// Materialized single-component reconstruction (params: id, root_id).
    Component,
}

impl TransformKind {
    /// Stable tag used in the persisted encoding.
    pub fn tag(&self) -> &'static str {
        match self {
            TransformKind::Init => "init",
            TransformKind::Load => "load",
            TransformKind::Create => "create",
            TransformKind::Mono => "mono",
            TransformKind::Filter => "filter",
            TransformKind::Pad => "pad",
            TransformKind::Clip => "clip",
            TransformKind::Slice => "slice",
            TransformKind::Multiply => "multiply",
            TransformKind::Add => "add",
            TransformKind::Set => "set",
            TransformKind::Resample => "resample",
            TransformKind::Ramp => "ramp",
            TransformKind::Channel => "channel",
            TransformKind::Component => "component",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "init" => Ok(TransformKind::Init),
            "load" => Ok(TransformKind::Load),
            "create" => Ok(TransformKind::Create),
            "mono" => Ok(TransformKind::Mono),
            "filter" => Ok(TransformKind::Filter),
            "pad" => Ok(TransformKind::Pad),
            "clip" => Ok(TransformKind::Clip),
            "slice" => Ok(TransformKind::Slice),
            "multiply" => Ok(TransformKind::Multiply),
            "add" => Ok(TransformKind::Add),
            "set" => Ok(TransformKind::Set),
            "resample" => Ok(TransformKind::Resample),
            "ramp" => Ok(TransformKind::Ramp),
            "channel" => Ok(TransformKind::Channel),
            "component" => Ok(TransformKind::Component),
            other => Err(LineageError::UnknownKind(other.to_string())),
        }
    }

    /// True for kinds whose nodes have no parents.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            TransformKind::Init | TransformKind::Load | TransformKind::Create
        )
    }

    /// Persist a freshly derived node: metadata and parent edges onto the
    /// node's identity, the two-way inverse (parent → child) onto every
    /// parent, annotations, and optionally the buffer itself.
    ///
    /// Every transform yields a new identity, even for operations whose
    /// in-memory object was produced by mutation; the caller allocates that
    /// identity before storing.
    pub fn store(
        &self,
        store: &mut dyn SoundStore,
        node: &mut dyn LineageNode,
        meta: &TransformMeta,
        persist_data: bool,
    ) -> Result<()> {
        let id = node.id();
        store.put_metadata(id, &meta.to_metadata_attrs())?;
        // A parent appearing twice (Component nodes over a root pair up the
        // same identity) still gets the child edge only once
        let mut appended: Vec<Id> = Vec::with_capacity(meta.parents.len());
        for &parent in &meta.parents {
            if appended.contains(&parent) {
                continue;
            }
            appended.push(parent);
            append_child(store, parent, id)?;
        }
        let annotations = node.annotations().clone();
        if !annotations.is_empty() {
            store.put_annotations(id, &annotations)?;
        }
        if persist_data {
            store.put_data(id, WAVEFORM_DATA, node.waveform(), true)?;
        }
        Ok(())
    }

    /// Rebuild the derived buffer from already-reconstructed parent buffers
    /// and the stored parameters. With `silence` set, a zero buffer of the
    /// same duration and shape is returned instead of the replayed result.
    pub fn reconstruct(
        &self,
        parents: &[Waveform],
        meta: &TransformMeta,
        silence: bool,
        manager: &SoundManager,
    ) -> Result<Waveform> {
        debug!(kind = self.tag(), silence, "replaying transform");
        let wave = match self {
            TransformKind::Init | TransformKind::Load | TransformKind::Create => {
                self.replay_root(parents, meta)?
            }
            TransformKind::Mono => Self::unary(parents)?.to_mono(),
            TransformKind::Filter => dsp::fir_filter(
                Self::unary(parents)?,
                meta.float("min_frequency")?,
                meta.float("max_frequency")?,
                meta.count("order")?,
            )?,
            TransformKind::Pad => Self::unary(parents)?
                .pad(meta.float("duration")?, meta.float("start_time")?)?,
            TransformKind::Clip => Self::unary(parents)?.clip(
                meta.float("min_value")? as f32,
                meta.float("max_value")? as f32,
            ),
            TransformKind::Slice => Self::unary(parents)?
                .slice_time(meta.float("start_time")?, meta.float("stop_time")?)?,
            TransformKind::Multiply => {
                Self::unary(parents)?.scale(meta.float("coefficient")? as f32)
            }
            TransformKind::Add => {
                let (a, b) = Self::binary(parents)?;
                a.add(b)?
            }
            TransformKind::Set => {
                let (base, replacement) = Self::binary(parents)?;
                base.replace_range(
                    meta.float("start_time")?,
                    meta.float("stop_time")?,
                    replacement,
                )?
            }
            TransformKind::Resample => {
                dsp::resample(Self::unary(parents)?, meta.float("new_samplerate")? as f32)?
            }
            TransformKind::Ramp => {
                let when = meta.string("when")?;
                dsp::ramp(
                    Self::unary(parents)?,
                    when == "onset" || when == "both",
                    when == "offset" || when == "both",
                    meta.float("duration")?,
                )
            }
            TransformKind::Channel => Self::unary(parents)?.channel(meta.count("channel")?)?,
            TransformKind::Component => {
                let id = Id(meta.int("id")? as u64);
                let root_id = Id(meta.int("root_id")? as u64);
                manager.reconstruct_component(id, root_id)?
            }
        };
        if silence {
            debug!(kind = self.tag(), "returning silence instead");
            Ok(wave.silence_like())
        } else {
            Ok(wave)
        }
    }

    /// Root kinds: a stored buffer handed in by the walk wins; otherwise
    /// Load re-reads the file and Create re-runs its seeded factory. Init has
    /// nothing to replay from.
    fn replay_root(&self, parents: &[Waveform], meta: &TransformMeta) -> Result<Waveform> {
        if let Some(wave) = parents.first() {
            return Ok(wave.clone());
        }
        match self {
            TransformKind::Load => {
                let filename = meta.string("filename")?;
                debug!(filename, "replaying load from file");
                load_wav(filename)
            }
            TransformKind::Create => replay_factory(meta),
            _ => Err(LineageError::BadParameter(
                "init node has no stored data to replay".to_string(),
            )),
        }
    }

    fn unary(parents: &[Waveform]) -> Result<&Waveform> {
        parents.first().ok_or_else(|| {
            LineageError::BadParameter("unary transform is missing its parent buffer".to_string())
        })
    }

    fn binary(parents: &[Waveform]) -> Result<(&Waveform, &Waveform)> {
        match parents {
            [a, b] => Ok((a, b)),
            other => Err(LineageError::BadParameter(format!(
                "binary transform expects 2 parent buffers, got {}",
                other.len()
            ))),
        }
    }
}

fn replay_factory(meta: &TransformMeta) -> Result<Waveform> {
    let factory = meta.string("factory")?;
    let duration = meta.float("duration")?;
    let samplerate = meta.float("samplerate")? as f32;
    let channels = meta.count("channels")?;
    match factory {
        "tone" => dsp::tone(meta.float("frequency")?, duration, samplerate, channels),
        "whitenoise" => dsp::white_noise(
            duration,
            samplerate,
            channels,
            meta.int("seed")? as u64,
        ),
        "silence" => Waveform::silence(duration, samplerate, channels),
        other => Err(LineageError::BadParameter(format!(
            "unknown create factory {:?}",
            other
        ))),
    }
}

/// A node as the lineage engine sees it: an identity, a buffer, and
/// annotations. The concrete consumer type lives elsewhere; the engine never
/// constructs one.
pub trait LineageNode {
    fn id(&self) -> Id;
    fn set_id(&mut self, id: Id);
    fn waveform(&self) -> &Waveform;
    fn annotations(&self) -> &Annotations;
}

/// Decoded transform metadata for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformMeta {
    pub kind: TransformKind,
    /// Stored parameters, unprefixed names. `Null` is the explicit sentinel
    /// for an intentionally absent optional parameter.
    pub params: Annotations,
    /// Ordered: 0 for roots, 1 for unary, 2 for binary transforms.
    pub parents: Vec<Id>,
    /// Unordered, append-only.
    pub children: Vec<Id>,
}

impl TransformMeta {
    pub fn new(kind: TransformKind, parents: Vec<Id>) -> Self {
        Self {
            kind,
            params: Annotations::new(),
            parents,
            children: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<AnnotationValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Encode to the prefixed attribute representation.
    pub fn to_metadata_attrs(&self) -> Annotations {
        let mut attrs = Annotations::new();
        attrs.insert(
            "transform_type".to_string(),
            AnnotationValue::Str(self.kind.tag().to_string()),
        );
        attrs.insert(store::PARENTS_KEY.to_string(), ids_to_value(&self.parents));
        attrs.insert(
            "transform_children".to_string(),
            ids_to_value(&self.children),
        );
        for (name, value) in &self.params {
            attrs.insert(format!("{}{}", TRANSFORM_PREFIX, name), value.clone());
        }
        attrs
    }

    /// Decode from prefixed attributes. `Ok(None)` when the attributes carry
    /// no transform record at all; `Err` when they carry a broken one.
    pub fn from_metadata_attrs(attrs: &Annotations) -> Result<Option<Self>> {
        if attrs.is_empty() {
            return Ok(None);
        }
        let tag = match attrs.get("transform_type") {
            Some(AnnotationValue::Str(tag)) => tag,
            Some(other) => {
                return Err(LineageError::Encoding(format!(
                    "transform_type must be a string tag, got {}",
                    other
                )))
            }
            None => return Err(LineageError::MissingKind),
        };
        let kind = TransformKind::from_tag(tag)?;
        let parents = match attrs.get(store::PARENTS_KEY) {
            Some(value) => ids_from_value(value)?,
            None => Vec::new(),
        };
        let children = match attrs.get("transform_children") {
            Some(value) => ids_from_value(value)?,
            None => Vec::new(),
        };
        let mut params = Annotations::new();
        for (key, value) in attrs {
            if let Some(name) = key.strip_prefix(TRANSFORM_PREFIX) {
                if name != "type" && name != "parents" && name != "children" {
                    params.insert(name.to_string(), value.clone());
                }
            }
        }
        Ok(Some(Self {
            kind,
            params,
            parents,
            children,
        }))
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.params
            .get(name)
            .and_then(|v| v.as_float())
            .ok_or_else(|| missing_param(self.kind, name))
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.params
            .get(name)
            .and_then(|v| v.as_int())
            .ok_or_else(|| missing_param(self.kind, name))
    }

    pub fn count(&self, name: &str) -> Result<usize> {
        let v = self.int(name)?;
        usize::try_from(v).map_err(|_| missing_param(self.kind, name))
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        self.params
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing_param(self.kind, name))
    }
}

fn missing_param(kind: TransformKind, name: &str) -> LineageError {
    LineageError::BadParameter(format!(
        "{} transform is missing parameter {:?}",
        kind.tag(),
        name
    ))
}

pub(crate) fn ids_to_value(ids: &[Id]) -> AnnotationValue {
    AnnotationValue::List(
        ids.iter()
            .map(|id| AnnotationValue::Int(id.0 as i64))
            .collect(),
    )
}

pub(crate) fn ids_from_value(value: &AnnotationValue) -> Result<Vec<Id>> {
    let list = value.as_list().ok_or_else(|| {
        LineageError::Encoding(format!("expected an identity list, got {}", value))
    })?;
    list.iter()
        .map(|v| {
            v.as_int()
                .and_then(|i| u64::try_from(i).ok())
                .map(Id)
                .ok_or_else(|| {
                    LineageError::Encoding(format!("expected an identity, got {}", v))
                })
        })
        .collect()
}

/// Append `child` to `parent`'s stored children list (the other half of the
/// two-way edge invariant).
fn append_child(store: &mut dyn SoundStore, parent: Id, child: Id) -> Result<()> {
    let attrs = store.get_metadata(parent)?;
    let mut children = match attrs.get("transform_children") {
        Some(value) => ids_from_value(value)?,
        None => Vec::new(),
    };
    children.push(child);
    let mut update = Annotations::new();
    update.insert("transform_children".to_string(), ids_to_value(&children));
    store.put_metadata(parent, &update)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for kind in [
            TransformKind::Init,
            TransformKind::Load,
            TransformKind::Create,
            TransformKind::Mono,
            TransformKind::Filter,
            TransformKind::Pad,
            TransformKind::Clip,
            TransformKind::Slice,
            TransformKind::Multiply,
            TransformKind::Add,
            TransformKind::Set,
            TransformKind::Resample,
            TransformKind::Ramp,
            TransformKind::Channel,
            TransformKind::Component,
        ] {
            assert_eq!(TransformKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(matches!(
            TransformKind::from_tag("telepathy"),
            Err(LineageError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_metadata_attr_round_trip() {
        let meta = TransformMeta::new(TransformKind::Slice, vec![Id(3)])
            .with_param("start_time", 0.5)
            .with_param("stop_time", 1.5)
            .with_param("note", AnnotationValue::Null);
        let attrs = meta.to_metadata_attrs();
        assert_eq!(
            attrs["transform_type"],
            AnnotationValue::Str("slice".to_string())
        );
        assert!(attrs.contains_key("transform_start_time"));
        // The null sentinel survives the encoding as a value, not an absence
        assert_eq!(attrs["transform_note"], AnnotationValue::Null);

        let decoded = TransformMeta::from_metadata_attrs(&attrs).unwrap().unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_decoding_errors() {
        assert!(TransformMeta::from_metadata_attrs(&Annotations::new())
            .unwrap()
            .is_none());

        let mut attrs = Annotations::new();
        attrs.insert("transform_parents".to_string(), ids_to_value(&[]));
        assert!(matches!(
            TransformMeta::from_metadata_attrs(&attrs),
            Err(LineageError::MissingKind)
        ));

        attrs.insert("transform_type".to_string(), "telepathy".into());
        assert!(matches!(
            TransformMeta::from_metadata_attrs(&attrs),
            Err(LineageError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_unary_replay_and_silence() {
        let manager = SoundManager::in_memory();
        let parent = Waveform::mono(vec![1.0, 2.0, 3.0, 4.0], 4.0).unwrap();
        let meta = TransformMeta::new(TransformKind::Slice, vec![Id(0)])
            .with_param("start_time", 0.25)
            .with_param("stop_time", 0.75);

        let sliced = TransformKind::Slice
            .reconstruct(std::slice::from_ref(&parent), &meta, false, &manager)
            .unwrap();
        assert_eq!(sliced.data, vec![2.0, 3.0]);

        let silent = TransformKind::Slice
            .reconstruct(std::slice::from_ref(&parent), &meta, true, &manager)
            .unwrap();
        assert!(silent.is_silent());
        assert_eq!(silent.nframes(), sliced.nframes());
    }

    #[test]
    fn test_factory_replay_is_deterministic() {
        let meta = TransformMeta::new(TransformKind::Create, vec![])
            .with_param("factory", "whitenoise")
            .with_param("duration", 0.1)
            .with_param("samplerate", 1000.0)
            .with_param("channels", 1i64)
            .with_param("seed", 99i64);
        let a = replay_factory(&meta).unwrap();
        let b = replay_factory(&meta).unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.nframes(), 100);
    }
}
