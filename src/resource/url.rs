//! Canonical resource addressing, including the virtual `zip://` scheme for archive entries.

use std::fmt::{Display, Formatter};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::error::MeridianError;

/// Characters escaped when a whole URL is embedded into the net-location of another URL.
const RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// An absolute URL identifying a scene resource.
///
/// URLs compare and hash by their canonical string form. An entry of a zip archive located at
/// URL `A` is addressed as `zip://<A percent-encoded>/<entry path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUrl(url::Url);

impl ResourceUrl {
    /// Parses an absolute URL.
    pub fn parse(input: &str) -> Result<Self, MeridianError> {
        Ok(Self(url::Url::parse(input)?))
    }

    /// Resolves a reference against this URL.
    ///
    /// An absolute reference replaces this URL entirely, a relative one is resolved against it
    /// following RFC 3986.
    pub fn resolve(&self, reference: &str) -> Result<Self, MeridianError> {
        Ok(Self(self.0.join(reference)?))
    }

    /// Resolves a reference that may contain `{token}` placeholders, keeping the braces
    /// verbatim instead of percent-encoding them.
    pub fn resolve_template(&self, reference: &str) -> Result<String, MeridianError> {
        let resolved = self.resolve(reference)?;
        Ok(resolved.as_str().replace("%7B", "{").replace("%7D", "}"))
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn path(&self) -> &str {
        self.0.path()
    }

    pub fn net_location(&self) -> &str {
        self.0.host_str().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Extension of the last path segment, or an empty string if there is none.
    pub fn path_extension(&self) -> &str {
        path_extension(self.0.path())
    }

    /// Whether the URL points at a zip archive (by path extension).
    pub fn is_zip_archive(&self) -> bool {
        self.path_extension() == "zip"
    }

    /// Base URL against which entries of the archive at this URL are addressed.
    pub fn zip_base(&self) -> Result<Self, MeridianError> {
        let encoded = escape_reserved(self.0.as_str());
        Self::parse(&format!("zip://{encoded}/"))
    }

    /// Recovers the archive URL from a `zip://` entry URL.
    pub fn archive_url(&self) -> Result<Self, MeridianError> {
        Self::parse(&unescape_reserved(self.net_location()))
    }

    /// Path of the archive entry addressed by a `zip://` URL.
    pub fn entry_path(&self) -> &str {
        self.0.path().trim_start_matches('/')
    }

    pub fn to_file_path(&self) -> Result<std::path::PathBuf, MeridianError> {
        self.0
            .to_file_path()
            .map_err(|_| MeridianError::Generic(format!("not a file url: {}", self.0)))
    }
}

impl Display for ResourceUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ResourceUrl {
    type Error = url::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(url::Url::parse(&value)?))
    }
}

impl From<ResourceUrl> for String {
    fn from(value: ResourceUrl) -> Self {
        value.0.into()
    }
}

/// Percent-encodes every character outside the unreserved set.
pub fn escape_reserved(input: &str) -> String {
    utf8_percent_encode(input, RESERVED).to_string()
}

/// Reverses [`escape_reserved`].
pub fn unescape_reserved(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

fn path_extension(path: &str) -> &str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_references() {
        let base = ResourceUrl::parse("https://example.com/scenes/root.yaml").unwrap();

        assert_eq!(
            base.resolve("imports/a.yaml").unwrap().as_str(),
            "https://example.com/scenes/imports/a.yaml"
        );
        assert_eq!(
            base.resolve("../other.yaml").unwrap().as_str(),
            "https://example.com/other.yaml"
        );
        assert_eq!(
            base.resolve("https://other.org/x.yaml").unwrap().as_str(),
            "https://other.org/x.yaml"
        );
    }

    #[test]
    fn path_extensions() {
        let url = ResourceUrl::parse("https://example.com/scenes/bundle.zip?v=1").unwrap();
        assert_eq!(url.path_extension(), "zip");
        assert!(url.is_zip_archive());

        let url = ResourceUrl::parse("https://example.com/scenes/scene.yaml").unwrap();
        assert_eq!(url.path_extension(), "yaml");
        assert!(!url.is_zip_archive());

        let url = ResourceUrl::parse("https://example.com/scenes/").unwrap();
        assert_eq!(url.path_extension(), "");
    }

    #[test]
    fn zip_entry_addressing_round_trip() {
        let archive = ResourceUrl::parse("https://example.com/scenes/bundle.zip").unwrap();
        let base = archive.zip_base().unwrap();
        assert_eq!(base.scheme(), "zip");

        let entry = base.resolve("img/tex.png").unwrap();
        assert_eq!(entry.entry_path(), "img/tex.png");
        assert_eq!(entry.archive_url().unwrap(), archive);
    }

    #[test]
    fn zip_base_resolution_stays_in_archive() {
        let archive = ResourceUrl::parse("file:///home/user/bundle.zip").unwrap();
        let base = archive.zip_base().unwrap();
        let entry = base.resolve("scene.yaml").unwrap();
        assert_eq!(entry.scheme(), "zip");
        assert_eq!(entry.archive_url().unwrap(), archive);
    }

    #[test]
    fn template_references_keep_their_placeholders() {
        let base = ResourceUrl::parse("https://example.com/scenes/root.yaml").unwrap();
        assert_eq!(
            base.resolve_template("tiles/{z}/{x}/{y}.mvt").unwrap(),
            "https://example.com/scenes/tiles/{z}/{x}/{y}.mvt"
        );
        assert_eq!(
            base.resolve_template("https://other.org/{z}/{x}/{y}.json")
                .unwrap(),
            "https://other.org/{z}/{x}/{y}.json"
        );
    }

    #[test]
    fn escape_round_trip() {
        let input = "https://example.com/a b.zip?q=1&x=2";
        assert_eq!(unescape_reserved(&escape_reserved(input)), input);
    }
}
