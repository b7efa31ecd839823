//! Persisted-state interface
//!
//! Persistence itself is an external collaborator: a [`SnapshotSource`]
//! supplies an initial snapshot per slice when the slice's reducer is
//! registered, and a [`SnapshotSink`] receives committed snapshots on the
//! cadence configured by [`StoreConfig::snapshot_every`]
//! (crate::config::StoreConfig::snapshot_every). Only slices registered
//! with a snapshot codec participate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_types::{SliceName, Version};

use crate::error::SnapshotError;

/// Supplies initial slice snapshots at registration time
pub trait SnapshotSource: Send {
    /// The stored snapshot for a slice, if one exists
    fn load(&mut self, slice: &SliceName) -> Result<Option<Value>, SnapshotError>;
}

/// Receives committed snapshots on the configured cadence
pub trait SnapshotSink: Send {
    fn persist(
        &mut self,
        version: Version,
        slices: &BTreeMap<SliceName, Value>,
    ) -> Result<(), SnapshotError>;
}

/// On-disk snapshot document shared by the file source and sink
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotDocument {
    version: Version,
    slices: BTreeMap<SliceName, Value>,
}

/// Writes every snapshot as a single JSON document
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write never leaves a torn document.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSink for JsonFileSink {
    fn persist(
        &mut self,
        version: Version,
        slices: &BTreeMap<SliceName, Value>,
    ) -> Result<(), SnapshotError> {
        let doc = SnapshotDocument {
            version,
            slices: slices.clone(),
        };
        let body = serde_json::to_vec_pretty(&doc).map_err(|e| SnapshotError::Codec {
            slice: SliceName::new("*"),
            direction: "encode",
            message: e.to_string(),
        })?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Reads slice snapshots back from a [`JsonFileSink`] document
#[derive(Debug)]
pub struct JsonFileSource {
    document: SnapshotDocument,
}

impl JsonFileSource {
    /// Load the document; a missing file behaves as an empty snapshot
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                document: SnapshotDocument::default(),
            });
        }
        let body = fs::read(path)?;
        let document: SnapshotDocument =
            serde_json::from_slice(&body).map_err(|e| SnapshotError::Codec {
                slice: SliceName::new("*"),
                direction: "decode",
                message: e.to_string(),
            })?;
        Ok(Self { document })
    }

    /// Version the loaded document was persisted at
    pub fn version(&self) -> Version {
        self.document.version
    }
}

impl SnapshotSource for JsonFileSource {
    fn load(&mut self, slice: &SliceName) -> Result<Option<Value>, SnapshotError> {
        Ok(self.document.slices.get(slice).cloned())
    }
}
