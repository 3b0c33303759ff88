use std::fmt::{Display, Formatter};
use std::io::Write;

use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use strum_macros::{Display as EnumDisplay, EnumString};

use crate::store::consts::IDENTIFIER_MATCHER;
use crate::store::encoding::{base32_encode, hex_encode};
use crate::store::error::Error::InvalidIdentifier;
use crate::store::error::*;

/// Prefix of the legacy `sha1` format, which is accepted in identifiers
/// and envelopes but never produced.
pub const LEGACY_SHA1_PREFIX: &str = "sha1";

/// A manifest format ties together an identifier prefix, a separator, and
/// the hash algorithm used for both file contents and the manifest itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, EnumDisplay, EnumString)]
pub enum ManifestFormat {
    #[strum(serialize = "sha1new")]
    Sha1New,
    #[strum(serialize = "sha256")]
    Sha256,
    #[strum(serialize = "sha256new")]
    Sha256New,
}

impl ManifestFormat {
    pub fn prefix(&self) -> &'static str {
        match self {
            ManifestFormat::Sha1New => "sha1new",
            ManifestFormat::Sha256 => "sha256",
            ManifestFormat::Sha256New => "sha256new",
        }
    }

    pub fn separator(&self) -> char {
        match self {
            ManifestFormat::Sha1New | ManifestFormat::Sha256 => '=',
            ManifestFormat::Sha256New => '_',
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "sha1new" => Some(ManifestFormat::Sha1New),
            "sha256" => Some(ManifestFormat::Sha256),
            "sha256new" => Some(ManifestFormat::Sha256New),
            _ => None,
        }
    }

    /// Encodes raw digest bytes in the format's printable encoding.
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            ManifestFormat::Sha1New | ManifestFormat::Sha256 => hex_encode(bytes),
            ManifestFormat::Sha256New => base32_encode(bytes),
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            ManifestFormat::Sha1New => Hasher::Sha1(Sha1::new()),
            ManifestFormat::Sha256 | ManifestFormat::Sha256New => Hasher::Sha256(Sha256::new()),
        }
    }

    /// Hashes a complete byte buffer and returns the encoded digest.
    pub fn digest_bytes(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        self.encode(&hasher.finalize())
    }

    pub fn identifier(&self, encoded_digest: &str) -> String {
        format!("{}{}{}", self.prefix(), self.separator(), encoded_digest)
    }
}

/// Incremental hash state for one of the supported algorithms.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Writer that hashes everything passed through it while forwarding the
/// bytes to an inner writer, tracking the total size.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(format: ManifestFormat, inner: W) -> Self {
        Self {
            inner,
            hasher: format.hasher(),
            written: 0,
        }
    }

    /// Returns the raw digest bytes and the number of bytes written.
    pub fn finalize(self) -> (Vec<u8>, u64) {
        (self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A digest envelope carrying up to one encoded digest per known format.
/// Used as a lookup key that is robust to format upgrades.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ManifestDigest {
    pub sha1: Option<String>,
    pub sha1new: Option<String>,
    pub sha256: Option<String>,
    pub sha256new: Option<String>,
}

impl ManifestDigest {
    pub fn new_for(format: ManifestFormat, encoded_digest: &str) -> Self {
        let mut envelope = Self::default();
        envelope.set(format, encoded_digest);
        envelope
    }

    pub fn set(&mut self, format: ManifestFormat, encoded_digest: &str) {
        match format {
            ManifestFormat::Sha1New => self.sha1new = Some(encoded_digest.into()),
            ManifestFormat::Sha256 => self.sha256 = Some(encoded_digest.into()),
            ManifestFormat::Sha256New => self.sha256new = Some(encoded_digest.into()),
        }
    }

    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        match format {
            ManifestFormat::Sha1New => self.sha1new.as_deref(),
            ManifestFormat::Sha256 => self.sha256.as_deref(),
            ManifestFormat::Sha256New => self.sha256new.as_deref(),
        }
    }

    /// Parses an implementation identifier such as `sha1new=abc...` or
    /// `sha256new_ABC...` into a single-entry envelope.
    pub fn from_id(id: &str) -> Result<Self> {
        let captures = IDENTIFIER_MATCHER
            .captures(id)
            .ok_or_else(|| InvalidIdentifier { value: id.into() })?;

        let prefix = captures.get(1).unwrap().as_str();
        let separator = captures.get(2).unwrap().as_str();
        let encoded = captures.get(3).unwrap().as_str();

        match ManifestFormat::from_prefix(prefix) {
            Some(format) if format.separator().to_string() == separator => {
                Ok(Self::new_for(format, encoded))
            }
            None if prefix == LEGACY_SHA1_PREFIX && separator == "=" => Ok(Self {
                sha1: Some(encoded.into()),
                ..Self::default()
            }),
            _ => Err(InvalidIdentifier { value: id.into() }),
        }
    }

    /// The first non-empty digest, in the order sha256new, sha256,
    /// sha1new, sha1, as `(prefix, encoded_digest)`.
    pub fn best(&self) -> Option<(&'static str, &str)> {
        if let Some(d) = self.sha256new.as_deref() {
            Some(("sha256new", d))
        } else if let Some(d) = self.sha256.as_deref() {
            Some(("sha256", d))
        } else if let Some(d) = self.sha1new.as_deref() {
            Some(("sha1new", d))
        } else {
            self.sha1.as_deref().map(|d| (LEGACY_SHA1_PREFIX, d))
        }
    }

    /// The format of the best variant. The legacy `sha1` format is
    /// parse-only and yields `None`.
    pub fn best_format(&self) -> Option<ManifestFormat> {
        self.best()
            .and_then(|(prefix, _)| ManifestFormat::from_prefix(prefix))
    }

    /// The identifier of the best variant, e.g. `sha256new_ABC...`.
    pub fn best_id(&self) -> Option<String> {
        self.best().map(|(prefix, digest)| {
            let separator = ManifestFormat::from_prefix(prefix)
                .map(|f| f.separator())
                .unwrap_or('=');
            format!("{prefix}{separator}{digest}")
        })
    }

    /// All identifiers present in the envelope, best first.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(d) = &self.sha256new {
            ids.push(ManifestFormat::Sha256New.identifier(d));
        }
        if let Some(d) = &self.sha256 {
            ids.push(ManifestFormat::Sha256.identifier(d));
        }
        if let Some(d) = &self.sha1new {
            ids.push(ManifestFormat::Sha1New.identifier(d));
        }
        if let Some(d) = &self.sha1 {
            ids.push(format!("{LEGACY_SHA1_PREFIX}={d}"));
        }
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.sha1.is_none()
            && self.sha1new.is_none()
            && self.sha256.is_none()
            && self.sha256new.is_none()
    }

    /// Two envelopes are partially equal when they share at least one
    /// non-empty matching field.
    pub fn partial_eq(&self, other: &ManifestDigest) -> bool {
        fn matches(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }

        matches(&self.sha1, &other.sha1)
            || matches(&self.sha1new, &other.sha1new)
            || matches(&self.sha256, &other.sha256)
            || matches(&self.sha256new, &other.sha256new)
    }
}

impl Display for ManifestDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.best_id() {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "(empty digest)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1new_digest_of_hello() {
        assert_eq!(
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
            ManifestFormat::Sha1New.digest_bytes(b"hello")
        );
    }

    #[test]
    fn sha256new_uses_base32() {
        let encoded = ManifestFormat::Sha256New.digest_bytes(b"");
        // SHA-256 of the empty string, base32 upper, no padding
        assert_eq!("4OYMIQUY7QOBJGX36TEJS35ZEQT24QPEMSNZGTFESWMRW6CSXBKQ", encoded);
    }

    #[test]
    fn identifier_round_trip() {
        let digest = ManifestFormat::Sha256New.digest_bytes(b"abc");
        let id = ManifestFormat::Sha256New.identifier(&digest);
        let envelope = ManifestDigest::from_id(&id).unwrap();
        assert_eq!(Some(id.as_str()), envelope.best_id().as_deref());
        assert_eq!(Some(ManifestFormat::Sha256New), envelope.best_format());
    }

    #[test]
    fn legacy_sha1_parses_but_has_no_format() {
        let envelope = ManifestDigest::from_id("sha1=abc123").unwrap();
        assert_eq!(Some(("sha1", "abc123")), envelope.best());
        assert_eq!(None, envelope.best_format());
    }

    #[test]
    fn best_prefers_sha256new() {
        let envelope = ManifestDigest {
            sha1new: Some("a".into()),
            sha256: Some("b".into()),
            sha256new: Some("c".into()),
            ..ManifestDigest::default()
        };
        assert_eq!(Some(("sha256new", "c")), envelope.best());
    }

    #[test]
    fn partial_equality_requires_a_shared_field() {
        let left = ManifestDigest {
            sha1new: Some("a".into()),
            sha256: Some("b".into()),
            ..ManifestDigest::default()
        };
        let right = ManifestDigest {
            sha256: Some("b".into()),
            sha256new: Some("c".into()),
            ..ManifestDigest::default()
        };
        let unrelated = ManifestDigest {
            sha1new: Some("z".into()),
            ..ManifestDigest::default()
        };
        assert!(left.partial_eq(&right));
        assert!(!left.partial_eq(&unrelated));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(ManifestDigest::from_id("sha256new=abc").is_err());
        assert!(ManifestDigest::from_id("md5=abc").is_err());
        assert!(ManifestDigest::from_id("sha256").is_err());
    }

    #[test]
    fn digest_writer_tracks_size_and_digest() {
        let mut out = Vec::new();
        let mut writer = DigestWriter::new(ManifestFormat::Sha1New, &mut out);
        writer.write_all(b"hello").unwrap();
        let (digest, size) = writer.finalize();
        assert_eq!(5, size);
        assert_eq!(b"hello".as_slice(), out.as_slice());
        assert_eq!(
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
            ManifestFormat::Sha1New.encode(&digest)
        );
    }
}
