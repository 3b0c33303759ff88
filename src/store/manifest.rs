use std::collections::BTreeMap;

use chrono::Duration;
use snafu::ResultExt;

use crate::store::consts::{MANIFEST_FILE, SYMLINK_FILE, XBIT_FILE};
use crate::store::digest::{ManifestDigest, ManifestFormat};
use crate::store::error::Error::{InvalidManifestLine, InvalidPath, PathNotFound};
use crate::store::error::*;

/// A single node in a manifest: a file (normal or executable) or a
/// symlink. Directories are represented as buckets in the manifest map.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ManifestElement {
    File {
        digest: String,
        mtime: i64,
        size: u64,
        executable: bool,
    },
    Symlink {
        digest: String,
        size: u64,
    },
}

/// The canonical description of an implementation tree: a map from
/// directory path (`""` for the root) to an ordered map of name to
/// element. Both maps order byte-wise, which is exactly the order the
/// text serialization requires.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Manifest {
    format: ManifestFormat,
    dirs: BTreeMap<String, BTreeMap<String, ManifestElement>>,
}

impl Manifest {
    pub fn new(format: ManifestFormat) -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert(String::new(), BTreeMap::new());
        Self { format, dirs }
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// Creates an empty directory bucket, along with any missing
    /// ancestors. Idempotent.
    pub fn add_directory(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Ok(());
        }

        let mut current = String::new();
        for segment in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            self.dirs.entry(current.clone()).or_default();
        }

        Ok(())
    }

    pub fn add_file(
        &mut self,
        path: &str,
        digest: &str,
        mtime: i64,
        size: u64,
        executable: bool,
    ) -> Result<()> {
        self.insert(
            path,
            ManifestElement::File {
                digest: digest.into(),
                mtime,
                size,
                executable,
            },
        )
    }

    pub fn add_symlink(&mut self, path: &str, digest: &str, size: u64) -> Result<()> {
        self.insert(
            path,
            ManifestElement::Symlink {
                digest: digest.into(),
                size,
            },
        )
    }

    /// Removes a directory (and everything beneath it) or a single file.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(InvalidPath {
                path,
                details: "cannot remove the implementation root".into(),
            });
        }

        if self.dirs.contains_key(&path) {
            let descendant_prefix = format!("{path}/");
            self.dirs
                .retain(|key, _| key != &path && !key.starts_with(&descendant_prefix));
            return Ok(());
        }

        let (dir, name) = split_path(&path);
        match self.dirs.get_mut(dir) {
            Some(entries) if entries.contains_key(name) => {
                entries.remove(name);
                Ok(())
            }
            _ => Err(PathNotFound { path }),
        }
    }

    /// Renames a file within/between buckets, or a directory along with
    /// every bucket beneath it.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        if src.is_empty() || dst.is_empty() {
            return Err(InvalidPath {
                path: src,
                details: "cannot rename the implementation root".into(),
            });
        }

        if self.dirs.contains_key(&src) {
            let descendant_prefix = format!("{src}/");
            let keys: Vec<String> = self
                .dirs
                .keys()
                .filter(|key| *key == &src || key.starts_with(&descendant_prefix))
                .cloned()
                .collect();
            for key in keys {
                let entries = self.dirs.remove(&key).unwrap();
                let new_key = format!("{dst}{}", &key[src.len()..]);
                self.dirs.insert(new_key, entries);
            }
            return Ok(());
        }

        // the destination bucket must exist before the source entry is
        // detached, so a failed rename cannot drop the element
        let (dst_dir, _) = split_path(&dst);
        if !self.dirs.contains_key(dst_dir) {
            return Err(PathNotFound {
                path: dst_dir.into(),
            });
        }

        let (src_dir, src_name) = split_path(&src);
        let element = match self.dirs.get_mut(src_dir) {
            Some(entries) => entries.remove(src_name),
            None => None,
        };
        match element {
            Some(element) => self.insert_normalized(&dst, element),
            None => Err(PathNotFound { path: src }),
        }
    }

    /// Reuses the element at `src` under a new name without re-digesting.
    pub fn hardlink(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = normalize_path(src)?;
        let (dir, name) = split_path(&src);
        let element = self
            .dirs
            .get(dir)
            .and_then(|entries| entries.get(name))
            .cloned()
            .ok_or(PathNotFound { path: src })?;
        self.insert(dst, element)
    }

    /// Reclassifies a file as executable; digest, mtime and size are
    /// unchanged.
    pub fn mark_as_executable(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        match self.lookup_mut(&path) {
            Some(ManifestElement::File { executable, .. }) => {
                *executable = true;
                Ok(())
            }
            Some(_) => Err(InvalidPath {
                path,
                details: "only files can be marked as executable".into(),
            }),
            None => Err(PathNotFound { path }),
        }
    }

    /// Reclassifies a file as a symlink over the same bytes.
    pub fn turn_into_symlink(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        match self.lookup_mut(&path) {
            Some(element @ ManifestElement::File { .. }) => {
                if let ManifestElement::File { digest, size, .. } = element.clone() {
                    *element = ManifestElement::Symlink { digest, size };
                }
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(PathNotFound { path }),
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&ManifestElement> {
        let (dir, name) = split_path(path);
        self.dirs.get(dir).and_then(|entries| entries.get(name))
    }

    fn lookup_mut(&mut self, path: &str) -> Option<&mut ManifestElement> {
        let (dir, name) = split_path(path);
        self.dirs
            .get_mut(dir)
            .and_then(|entries| entries.get_mut(name))
    }

    pub fn contains_dir(&self, path: &str) -> bool {
        self.dirs.contains_key(path)
    }

    /// Every path recorded in the manifest: non-root directories and all
    /// files/symlinks, in byte-wise order.
    pub fn list_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for (dir, entries) in &self.dirs {
            if !dir.is_empty() {
                paths.push(dir.clone());
            }
            for name in entries.keys() {
                paths.push(join_path(dir, name));
            }
        }
        paths.sort();
        paths
    }

    /// A copy of this manifest with every file mtime rounded up to an
    /// even second and shifted by `offset`. Deployment targets with
    /// 2-second mtime granularity round-trip such manifests identically.
    pub fn with_offset(&self, offset: Duration) -> Manifest {
        let shift = offset.num_seconds();
        let mut copy = self.clone();
        for entries in copy.dirs.values_mut() {
            for element in entries.values_mut() {
                if let ManifestElement::File { mtime, .. } = element {
                    *mtime = ((*mtime + 1) / 2) * 2 + shift;
                }
            }
        }
        copy
    }

    /// Serializes to the canonical text form: one LF-terminated line per
    /// node, directories ordered byte-wise by path, children byte-wise by
    /// name. The root has no header line.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (dir, entries) in &self.dirs {
            if !dir.is_empty() {
                out.extend_from_slice(format!("D /{dir}\n").as_bytes());
            }
            for (name, element) in entries {
                let line = match element {
                    ManifestElement::File {
                        digest,
                        mtime,
                        size,
                        executable,
                    } => {
                        let kind = if *executable { 'X' } else { 'F' };
                        format!("{kind} {digest} {mtime} {size} {name}\n")
                    }
                    ManifestElement::Symlink { digest, size } => {
                        format!("S {digest} {size} {name}\n")
                    }
                };
                out.extend_from_slice(line.as_bytes());
            }
        }
        out
    }

    /// The encoded digest of the serialized manifest bytes.
    pub fn digest(&self) -> String {
        self.format.digest_bytes(&self.serialize())
    }

    /// The full implementation identifier, e.g. `sha256new_ABC...`.
    pub fn identifier(&self) -> String {
        self.format.identifier(&self.digest())
    }

    pub fn digest_envelope(&self) -> ManifestDigest {
        ManifestDigest::new_for(self.format, &self.digest())
    }

    /// Parses the canonical text form. Conformant input round-trips
    /// byte-for-byte through `serialize`.
    pub fn parse(format: ManifestFormat, bytes: &[u8]) -> Result<Manifest> {
        let mut manifest = Manifest::new(format);
        let mut current_dir = String::new();

        let text = String::from_utf8(bytes.to_vec()).context(InvalidStringSnafu)?;

        for (index, line) in text.split('\n').enumerate() {
            let num = index + 1;
            if line.is_empty() {
                continue;
            }

            let (kind, rest) = line.split_at_checked(2).ok_or_else(|| InvalidManifestLine {
                num,
                details: "line is too short".into(),
            })?;

            match kind {
                "D " => {
                    let path = rest.strip_prefix('/').ok_or_else(|| InvalidManifestLine {
                        num,
                        details: "directory path must start with '/'".into(),
                    })?;
                    manifest.add_directory(path)?;
                    current_dir = path.into();
                }
                "F " | "X " => {
                    let mut fields = rest.splitn(4, ' ');
                    let (digest, mtime, size, name) = match (
                        fields.next(),
                        fields.next(),
                        fields.next(),
                        fields.next(),
                    ) {
                        (Some(digest), Some(mtime), Some(size), Some(name)) => {
                            (digest, mtime, size, name)
                        }
                        _ => {
                            return Err(InvalidManifestLine {
                                num,
                                details: "expected digest, mtime, size, and name".into(),
                            })
                        }
                    };
                    let mtime = mtime.parse::<i64>().map_err(|_| InvalidManifestLine {
                        num,
                        details: format!("invalid mtime '{mtime}'"),
                    })?;
                    let size = size.parse::<u64>().map_err(|_| InvalidManifestLine {
                        num,
                        details: format!("invalid size '{size}'"),
                    })?;
                    let path = join_path(&current_dir, name);
                    manifest.add_file(&path, digest, mtime, size, kind == "X ")?;
                }
                "S " => {
                    let mut fields = rest.splitn(3, ' ');
                    let (digest, size, name) =
                        match (fields.next(), fields.next(), fields.next()) {
                            (Some(digest), Some(size), Some(name)) => (digest, size, name),
                            _ => {
                                return Err(InvalidManifestLine {
                                    num,
                                    details: "expected digest, size, and name".into(),
                                })
                            }
                        };
                    let size = size.parse::<u64>().map_err(|_| InvalidManifestLine {
                        num,
                        details: format!("invalid size '{size}'"),
                    })?;
                    let path = join_path(&current_dir, name);
                    manifest.add_symlink(&path, digest, size)?;
                }
                _ => {
                    return Err(InvalidManifestLine {
                        num,
                        details: format!("unknown node kind '{}'", line.chars().next().unwrap()),
                    })
                }
            }
        }

        Ok(manifest)
    }

    fn insert(&mut self, path: &str, element: ManifestElement) -> Result<()> {
        let path = normalize_path(path)?;
        self.insert_normalized(&path, element)
    }

    fn insert_normalized(&mut self, path: &str, element: ManifestElement) -> Result<()> {
        if path.is_empty() {
            return Err(InvalidPath {
                path: path.into(),
                details: "element path must not be empty".into(),
            });
        }
        let (dir, name) = split_path(path);
        match self.dirs.get_mut(dir) {
            Some(entries) => {
                entries.insert(name.into(), element);
                Ok(())
            }
            None => Err(PathNotFound { path: dir.into() }),
        }
    }
}

/// Splits a normalized path into its parent directory and final name.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.into()
    } else {
        format!("{dir}/{name}")
    }
}

/// Normalizes a path to POSIX form and rejects anything the manifest
/// must not describe: absolute paths, `.`/`..` segments, LF, and the
/// reserved names `.manifest`, `.xbit`, and `.symlink`.
pub fn normalize_path(path: &str) -> Result<String> {
    let normalized = path.replace('\\', "/");
    let trimmed = normalized.strip_suffix('/').unwrap_or(&normalized);

    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.starts_with('/') {
        return Err(InvalidPath {
            path: path.into(),
            details: "absolute paths are not allowed".into(),
        });
    }

    for segment in trimmed.split('/') {
        let details = match segment {
            "" => Some("empty path segment"),
            "." | ".." => Some("relative path segments are not allowed"),
            MANIFEST_FILE | XBIT_FILE | SYMLINK_FILE => Some("reserved file name"),
            _ if segment.contains('\n') => Some("line feeds are not allowed in paths"),
            _ => None,
        };
        if let Some(details) = details {
            return Err(InvalidPath {
                path: path.into(),
                details: details.into(),
            });
        }
    }

    Ok(trimmed.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::digest::ManifestFormat;

    fn sha(format: ManifestFormat, bytes: &[u8]) -> String {
        format.digest_bytes(bytes)
    }

    #[test]
    fn empty_manifest_serializes_to_nothing() {
        let manifest = Manifest::new(ManifestFormat::Sha256New);
        assert!(manifest.serialize().is_empty());
        assert_eq!(
            ManifestFormat::Sha256New.digest_bytes(b""),
            manifest.digest()
        );
    }

    #[test]
    fn single_executable_file_line() {
        let mut manifest = Manifest::new(ManifestFormat::Sha1New);
        let digest = sha(ManifestFormat::Sha1New, b"hello");
        manifest.add_file("run", &digest, 0, 5, true).unwrap();

        let expected = "X aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d 0 5 run\n";
        assert_eq!(expected.as_bytes(), manifest.serialize().as_slice());
        assert_eq!(
            format!(
                "sha1new={}",
                ManifestFormat::Sha1New.digest_bytes(expected.as_bytes())
            ),
            manifest.identifier()
        );
    }

    #[test]
    fn symlink_line_hashes_target_bytes() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256New);
        let target = "../target.bin";
        let digest = sha(ManifestFormat::Sha256New, target.as_bytes());
        manifest
            .add_symlink("link", &digest, target.len() as u64)
            .unwrap();

        let serialized = String::from_utf8(manifest.serialize()).unwrap();
        assert_eq!(format!("S {digest} 13 link\n"), serialized);
        assert!(serialized.starts_with('S'));
    }

    #[test]
    fn directory_headers_precede_their_children() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        manifest.add_directory("sub").unwrap();
        let digest = sha(ManifestFormat::Sha256, b"x");
        manifest.add_file("top", &digest, 2, 1, false).unwrap();
        manifest.add_file("sub/inner", &digest, 2, 1, false).unwrap();

        let serialized = String::from_utf8(manifest.serialize()).unwrap();
        assert_eq!(
            format!("F {digest} 2 1 top\nD /sub\nF {digest} 2 1 inner\n"),
            serialized
        );
    }

    #[test]
    fn serialization_ignores_insertion_order() {
        let digest = sha(ManifestFormat::Sha256, b"x");
        let mut first = Manifest::new(ManifestFormat::Sha256);
        first.add_file("b", &digest, 0, 1, false).unwrap();
        first.add_file("a", &digest, 0, 1, false).unwrap();

        let mut second = Manifest::new(ManifestFormat::Sha256);
        second.add_file("a", &digest, 0, 1, false).unwrap();
        second.add_file("b", &digest, 0, 1, false).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.serialize(), second.serialize());
    }

    #[test]
    fn parse_round_trips_serialization() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256New);
        manifest.add_directory("a/b").unwrap();
        let digest = sha(ManifestFormat::Sha256New, b"payload");
        manifest.add_file("a/b/f", &digest, 17, 7, false).unwrap();
        manifest.add_file("run me", &digest, 4, 7, true).unwrap();
        manifest.add_symlink("a/link", &digest, 7).unwrap();

        let serialized = manifest.serialize();
        let parsed = Manifest::parse(ManifestFormat::Sha256New, &serialized).unwrap();
        assert_eq!(manifest, parsed);
        assert_eq!(serialized, parsed.serialize());
    }

    #[test]
    fn rename_directory_moves_descendants() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        manifest.add_directory("a/b").unwrap();
        let digest = sha(ManifestFormat::Sha256, b"f");
        manifest.add_file("a/b/f", &digest, 0, 1, false).unwrap();

        manifest.rename("a", "c").unwrap();

        assert_eq!(vec!["c", "c/b", "c/b/f"], manifest.list_paths());
    }

    #[test]
    fn remove_directory_removes_descendants() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        manifest.add_directory("a/b").unwrap();
        let digest = sha(ManifestFormat::Sha256, b"f");
        manifest.add_file("a/b/f", &digest, 0, 1, false).unwrap();
        manifest.add_file("keep", &digest, 0, 1, false).unwrap();

        manifest.remove("a").unwrap();

        assert_eq!(vec!["keep"], manifest.list_paths());
        assert!(matches!(
            manifest.remove("a"),
            Err(Error::PathNotFound { .. })
        ));
    }

    #[test]
    fn executable_and_normal_files_digest_differently() {
        let digest = sha(ManifestFormat::Sha256, b"same");
        let mut normal = Manifest::new(ManifestFormat::Sha256);
        normal.add_file("f", &digest, 0, 4, false).unwrap();
        let mut executable = Manifest::new(ManifestFormat::Sha256);
        executable.add_file("f", &digest, 0, 4, true).unwrap();

        assert_ne!(normal.digest(), executable.digest());
    }

    #[test]
    fn mtime_changes_the_digest() {
        let digest = sha(ManifestFormat::Sha256, b"same");
        let mut early = Manifest::new(ManifestFormat::Sha256);
        early.add_file("f", &digest, 0, 4, false).unwrap();
        let mut late = Manifest::new(ManifestFormat::Sha256);
        late.add_file("f", &digest, 1, 4, false).unwrap();

        assert_ne!(early.digest(), late.digest());
    }

    #[test]
    fn non_ascii_names_are_preserved() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256New);
        let digest = sha(ManifestFormat::Sha256New, b"x");
        manifest.add_file("f\u{fc}r", &digest, 0, 1, false).unwrap();

        let parsed =
            Manifest::parse(ManifestFormat::Sha256New, &manifest.serialize()).unwrap();
        assert_eq!(vec!["f\u{fc}r"], parsed.list_paths());
    }

    #[test]
    fn with_offset_rounds_to_even_and_shifts() {
        let digest = sha(ManifestFormat::Sha256, b"x");
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        manifest.add_file("odd", &digest, 3, 1, false).unwrap();
        manifest.add_file("even", &digest, 4, 1, false).unwrap();

        let shifted = manifest.with_offset(Duration::seconds(10));
        match shifted.lookup("odd").unwrap() {
            ManifestElement::File { mtime, .. } => assert_eq!(14, *mtime),
            _ => panic!("expected file"),
        }
        match shifted.lookup("even").unwrap() {
            ManifestElement::File { mtime, .. } => assert_eq!(14, *mtime),
            _ => panic!("expected file"),
        }
    }

    #[test]
    fn with_offset_zero_on_even_mtimes_is_identity() {
        let digest = sha(ManifestFormat::Sha256, b"x");
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        manifest.add_file("f", &digest, 6, 1, false).unwrap();

        let shifted = manifest.with_offset(Duration::seconds(0));
        assert_eq!(manifest.serialize(), shifted.serialize());
    }

    #[test]
    fn add_file_requires_the_directory_to_exist() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        let digest = sha(ManifestFormat::Sha256, b"x");
        assert!(matches!(
            manifest.add_file("missing/f", &digest, 0, 1, false),
            Err(Error::PathNotFound { .. })
        ));
    }

    #[test]
    fn rejects_reserved_and_unsafe_paths() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        let digest = sha(ManifestFormat::Sha256, b"x");
        for path in ["/abs", "a/../b", "./a", ".manifest", ".xbit", ".symlink", "a\nb"] {
            assert!(
                matches!(
                    manifest.add_file(path, &digest, 0, 1, false),
                    Err(Error::InvalidPath { .. })
                ),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        let format = ManifestFormat::Sha256;
        for (input, reason) in [
            ("Q abc 0 1 f\n", "unknown node kind"),
            ("F abc 0 f\n", "missing field"),
            ("F abc zero 1 f\n", "bad mtime"),
            ("S abc big f extra garbage\n", "bad size"),
            ("D missing-slash\n", "directory without slash"),
            ("F\n", "truncated line"),
        ] {
            assert!(
                matches!(
                    Manifest::parse(format, input.as_bytes()),
                    Err(Error::InvalidManifestLine { .. })
                ),
                "input {input:?} should be rejected ({reason})"
            );
        }
    }

    #[test]
    fn parse_reports_the_failing_line_number() {
        let input = b"F aa 0 1 ok\nbroken\n";
        match Manifest::parse(ManifestFormat::Sha256, input) {
            Err(Error::InvalidManifestLine { num, .. }) => assert_eq!(2, num),
            other => panic!("expected InvalidManifestLine, got {other:?}"),
        }
    }

    #[test]
    fn hardlink_reuses_the_source_element() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        let digest = sha(ManifestFormat::Sha256, b"x");
        manifest.add_file("orig", &digest, 9, 1, true).unwrap();
        manifest.hardlink("orig", "copy").unwrap();

        assert_eq!(manifest.lookup("orig"), manifest.lookup("copy"));
    }

    #[test]
    fn turn_into_symlink_keeps_digest_and_size() {
        let mut manifest = Manifest::new(ManifestFormat::Sha256);
        let digest = sha(ManifestFormat::Sha256, b"target");
        manifest.add_file("link", &digest, 0, 6, false).unwrap();
        manifest.turn_into_symlink("link").unwrap();

        assert_eq!(
            Some(&ManifestElement::Symlink {
                digest,
                size: 6
            }),
            manifest.lookup("link")
        );
    }
}
