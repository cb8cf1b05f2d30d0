//! Tiles, tile addressing and payload decoding.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MeridianError;

pub mod cache;
pub mod grid;
pub mod manager;
pub mod source;

pub use cache::TileCache;
pub use grid::TileGrid;
pub use manager::TileManager;
pub use source::{SourceId, TileFormat, TileSource, TileSourceConfig};

/// Tile address in the web mercator tile pyramid.
///
/// The field order gives tiles their total order: `(z, x, y)` ascending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TileId {
    pub z: u8,
    pub x: i32,
    pub y: i32,
}

impl TileId {
    pub fn new(z: u8, x: i32, y: i32) -> Self {
        Self { z, x, y }
    }

    /// Wraps the x index into the `[0, 2^z)` range.
    pub fn wrapped(self) -> Self {
        let row_count = 1i64 << self.z;
        Self {
            z: self.z,
            x: (self.x as i64).rem_euclid(row_count) as i32,
            y: self.y,
        }
    }

    /// The tile one zoom level up that contains this tile.
    pub fn parent(self) -> Option<Self> {
        if self.z == 0 {
            return None;
        }

        Some(Self {
            z: self.z - 1,
            x: self.x.div_euclid(2),
            y: self.y.div_euclid(2),
        })
    }

    /// The four tiles one zoom level down contained in this tile.
    pub fn children(self) -> [Self; 4] {
        let z = self.z + 1;
        let x = self.x * 2;
        let y = self.y * 2;
        [
            Self::new(z, x, y),
            Self::new(z, x + 1, y),
            Self::new(z, x, y + 1),
            Self::new(z, x + 1, y + 1),
        ]
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A single mesh of a decoded tile. The contents are opaque to the pipeline and interpreted by
/// the renderer.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub layer: String,
    pub data: Bytes,
}

/// Geometry produced by a [`TileBuilder`] from a raw tile payload.
#[derive(Debug, Clone, Default)]
pub struct TileGeometry {
    pub meshes: Vec<Mesh>,
}

impl TileGeometry {
    pub fn memory_usage(&self) -> usize {
        const MESH_OVERHEAD: usize = 64;
        self.meshes
            .iter()
            .map(|mesh| mesh.data.len() + mesh.layer.len() + MESH_OVERHEAD)
            .sum()
    }
}

/// A decoded tile, shared between the cache and the active tile sets.
pub struct Tile {
    source: SourceId,
    id: TileId,
    geometry: TileGeometry,
    last_used_frame: AtomicU64,
}

impl Tile {
    pub fn new(source: SourceId, id: TileId, geometry: TileGeometry) -> Self {
        Self {
            source,
            id,
            geometry,
            last_used_frame: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn memory_usage(&self) -> usize {
        self.geometry.memory_usage()
    }

    pub fn mark_used(&self, frame: u64) {
        self.last_used_frame.store(frame, Ordering::Relaxed);
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("source", &self.source)
            .field("id", &self.id)
            .field("memory_usage", &self.memory_usage())
            .finish()
    }
}

/// Turns raw tile payloads into renderable geometry.
///
/// The renderer supplies its own implementation; [`RawTileBuilder`] validates the payload and
/// passes the bytes through unchanged.
pub trait TileBuilder: Send + Sync {
    fn build(
        &self,
        source: SourceId,
        id: TileId,
        format: TileFormat,
        bytes: Bytes,
    ) -> Result<TileGeometry, MeridianError>;
}

/// Default builder that wraps the validated payload into a single opaque mesh.
#[derive(Debug, Default)]
pub struct RawTileBuilder;

impl TileBuilder for RawTileBuilder {
    fn build(
        &self,
        _source: SourceId,
        id: TileId,
        format: TileFormat,
        bytes: Bytes,
    ) -> Result<TileGeometry, MeridianError> {
        match format {
            TileFormat::GeoJson | TileFormat::TopoJson => {
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).map_err(|_| MeridianError::TileDecode)?;
                if !value.is_object() {
                    return Err(MeridianError::TileDecode);
                }
            }
            TileFormat::Mvt | TileFormat::Raster => {
                if bytes.is_empty() {
                    return Err(MeridianError::TileDecode);
                }
            }
        }

        log::trace!("Tile {id} decoded. Byte size: {}", bytes.len());

        Ok(TileGeometry {
            meshes: vec![Mesh {
                layer: String::new(),
                data: bytes,
            }],
        })
    }
}
