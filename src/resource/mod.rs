//! Resource addressing and archive access.

pub mod archive;
pub mod url;

pub use archive::{ArchiveEntry, SceneArchive};
pub use url::ResourceUrl;
