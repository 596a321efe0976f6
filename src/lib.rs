//! # Waveline - Sound Lineage Store
//!
//! Waveline tracks the full provenance of immutable sound objects. Every
//! operation on a [`Sound`] produces a new object under a fresh identity and
//! records the transform that made it, so any sound can later be rebuilt
//! purely from its history — including the isolated contribution of a single
//! source within a mixture.
//!
//! ## Core Features
//!
//! - **Copy-on-Write Sounds**: every transform yields a new identity; history
//!   is never rewritten
//! - **Replayable Transforms**: a closed registry of transform kinds, each
//!   knowing how to persist and replay itself
//! - **Full Reconstruction**: rebuild any sound from its ancestry, cutting
//!   the walk short wherever a buffer is still materialized
//! - **Component Isolation**: recover what a single root contributed to a
//!   mix, with every other source silenced but timing preserved
//! - **Pluggable Stores**: an ephemeral in-memory backend and a durable
//!   JSON-on-disk backend behind one capability trait
//! - **Cross-Store Import**: copy lineage subgraphs between stores, with or
//!   without their full ancestry
//!
//! ## Quick Start
//!
//! ```rust
//! use waveline::{Sound, SoundManager};
//!
//! let manager = SoundManager::in_memory();
//!
//! // Build a scene: seeded noise, band-limited, with a tone mixed in
//! let noise = Sound::whitenoise_seeded(&manager, 1.0, 4000.0, 1, 42).unwrap();
//! let tone = Sound::tone(&manager, 440.0, 1.0, 4000.0, 1).unwrap();
//! let scene = noise
//!     .filter(100.0, Some(1000.0), None)
//!     .unwrap()
//!     .combine(&tone)
//!     .unwrap();
//!
//! // Rebuild it later, purely from stored history
//! let rebuilt = Sound::reconstruct(&manager, scene.id()).unwrap();
//! assert_eq!(rebuilt.waveform().data, scene.waveform().data);
//!
//! // Or just the tone's contribution to the mix
//! let roots = scene.roots().unwrap();
//! assert_eq!(roots.len(), 2);
//! let component = scene.component(1).unwrap();
//! assert_eq!(component.nframes(), scene.nframes());
//! ```

pub mod annotations;
pub mod dsp;
pub mod error;
pub mod file_store;
pub mod manager;
pub mod sound;
pub mod store;
pub mod transforms;
pub mod waveform;

pub use annotations::{AnnotationValue, Annotations, TRANSFORM_PREFIX};
pub use error::{LineageError, Result};
pub use file_store::FileStore;
pub use manager::SoundManager;
pub use sound::Sound;
pub use store::{Id, MemoryStore, SoundStore, WAVEFORM_DATA};
pub use transforms::{LineageNode, TransformKind, TransformMeta};
pub use waveform::{load_wav, save_wav, Waveform, DB_REFERENCE};
