use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use snafu::ResultExt;
use walkdir::WalkDir;

use crate::store::builder::Builder;
use crate::store::cancel::CancelToken;
use crate::store::consts::*;
use crate::store::digest::{DigestWriter, ManifestDigest, ManifestFormat};
use crate::store::error::Error::{
    AccessDenied, AlreadyInStore, DigestMismatch, InvalidPath, NotFound, UnsupportedKind,
};
use crate::store::error::*;
use crate::store::fsutil;
use crate::store::handler::Handler;
use crate::store::lock::NamedLock;
use crate::store::manifest::Manifest;

/// The content-addressed implementation store: a root directory whose
/// children are digest-named, write-protected implementation trees plus
/// in-progress `0install-extract-*` / `0install-remove-*` temp
/// directories. Anything else in the root is foreign and ignored.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).context(IoCreateSnafu { path: root })?;
        Ok(Self { root: root.into() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock-free existence check across every digest variant in the
    /// envelope.
    pub fn contains(&self, digest: &ManifestDigest) -> bool {
        self.get_path(digest).is_some()
    }

    /// Absolute path of a stored implementation, if present under any of
    /// the envelope's identifiers.
    pub fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        digest
            .ids()
            .into_iter()
            .map(|id| self.root.join(id))
            .find(|path| path.is_dir())
    }

    /// Enumerates the store root, parsing identifier-shaped names into
    /// digest envelopes. Foreign names are ignored.
    pub fn list_all(&self) -> Result<Vec<ManifestDigest>> {
        let mut digests = Vec::new();
        for name in self.child_names()? {
            if let Ok(digest) = ManifestDigest::from_id(&name) {
                digests.push(digest);
            }
        }
        Ok(digests)
    }

    /// Enumerates in-progress temp directories, the recovery surface for
    /// crashed builds and deletions.
    pub fn list_temp(&self) -> Result<Vec<PathBuf>> {
        let mut temps = Vec::new();
        for name in self.child_names()? {
            if TEMP_DIR_MATCHER.is_match(&name) {
                temps.push(self.root.join(name));
            }
        }
        Ok(temps)
    }

    fn child_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).context(IoReadDirSnafu { path: &self.root })? {
            let entry = entry.context(IoReadDirSnafu { path: &self.root })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Atomically admits a new implementation. A builder bound to a
    /// fresh temp directory is handed to `build`; once it returns, the
    /// manifest is serialized, its digest checked against every expected
    /// variant, the tree write-protected, and the directory renamed to
    /// its identifier. Every failure path removes the temp directory.
    pub fn add<F>(
        &self,
        expected: &ManifestDigest,
        cancel: &CancelToken,
        build: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&mut Builder) -> Result<()>,
    {
        let format = expected.best_format().ok_or_else(|| UnsupportedKind {
            kind: format!("identifier format of {expected}"),
        })?;

        let temp = tempfile::Builder::new()
            .prefix(EXTRACT_TEMP_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| self.map_write_error(e, &self.root))?;
        info!("Building implementation in {}", temp.path().display());

        let mut builder = Builder::new(temp.path(), format, cancel.clone());
        build(&mut builder)?;
        cancel.check()?;

        let manifest = builder.into_manifest();
        let serialized = manifest.serialize();
        let manifest_path = temp.path().join(MANIFEST_FILE);
        fs::write(&manifest_path, &serialized).context(IoWriteSnafu {
            path: &manifest_path,
        })?;

        self.check_expected(expected, &manifest, temp.path())?;

        let id = format.identifier(&manifest.digest());
        let final_path = self.root.join(&id);

        if let Err(e) = fsutil::write_protect(temp.path(), true) {
            let temp_path = temp.into_path();
            discard_temp(&temp_path);
            return Err(e);
        }

        // from here the TempDir guard can no longer clean up on its own
        // because the tree is read-only
        let temp_path = temp.into_path();
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            discard_temp(&temp_path);
            return if final_path.is_dir() || e.kind() == ErrorKind::AlreadyExists {
                info!("Lost admission race for {id}");
                Err(AlreadyInStore { id })
            } else {
                Err(self.map_write_error(e, &final_path))
            };
        }

        fsutil::fsync_dir(&self.root)?;
        info!("Added implementation {id}");
        Ok(final_path)
    }

    /// Checks the built manifest against every non-empty variant of the
    /// expected envelope. Variants in other formats are re-derived from
    /// the tree so each is compared field-by-field.
    fn check_expected(
        &self,
        expected: &ManifestDigest,
        manifest: &Manifest,
        tree: &Path,
    ) -> Result<()> {
        let mut actual = ManifestDigest::default();
        actual.set(manifest.format(), &manifest.digest());

        for format in [
            ManifestFormat::Sha1New,
            ManifestFormat::Sha256,
            ManifestFormat::Sha256New,
        ] {
            if format != manifest.format() && expected.get(format).is_some() {
                let derived = manifest_from_dir(tree, format)?;
                actual.set(format, &derived.digest());
            }
        }
        if expected.sha1.is_some() {
            // legacy sha1 manifests use a serialization this store does
            // not produce; the variant cannot be checked
            warn!("Ignoring unverifiable legacy sha1 digest in {expected}");
        }

        for format in [
            ManifestFormat::Sha1New,
            ManifestFormat::Sha256,
            ManifestFormat::Sha256New,
        ] {
            if let (Some(want), Some(got)) = (expected.get(format), actual.get(format)) {
                if want != got {
                    error!(
                        "Digest mismatch: expected {}, computed {}",
                        format.identifier(want),
                        format.identifier(got)
                    );
                    return Err(DigestMismatch {
                        expected: format.identifier(want),
                        actual: format.identifier(got),
                    });
                }
            }
        }

        Ok(())
    }

    /// Best-effort atomic delete: the tree is renamed out of the lookup
    /// namespace first, then unprotected and removed. Returns `false`
    /// when the implementation is absent.
    pub fn remove(&self, digest: &ManifestDigest) -> Result<bool> {
        let path = match self.get_path(digest) {
            Some(path) => path,
            None => return Ok(false),
        };
        info!("Removing implementation {}", path.display());

        let grave = self.fresh_temp_name(REMOVE_TEMP_PREFIX);
        match fs::rename(&path, &grave) {
            Ok(()) => fsutil::remove_tree_forced(&grave)?,
            // rename-in-place unavailable: delete where it stands
            Err(_) => fsutil::remove_tree_forced(&path)?,
        }
        Ok(true)
    }

    /// Deletes an orphaned temp directory. Paths outside the store root
    /// (or not temp-named) are rejected.
    pub fn remove_temp(&self, path: &Path) -> Result<bool> {
        let name = match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
            (Some(parent), Some(name)) if parent == self.root => name,
            _ => {
                return Err(InvalidPath {
                    path: path.display().to_string(),
                    details: "not a temp directory inside the store".into(),
                })
            }
        };
        if !TEMP_DIR_MATCHER.is_match(name) {
            return Err(InvalidPath {
                path: path.display().to_string(),
                details: "not a temp directory inside the store".into(),
            });
        }
        if !path.is_dir() {
            return Ok(false);
        }
        fsutil::remove_tree_forced(path)?;
        Ok(true)
    }

    /// Removes every implementation and temp directory owned by the
    /// store. Foreign children are left alone.
    pub fn purge(&self) -> Result<()> {
        info!("Purging store {}", self.root.display());
        for name in self.child_names()? {
            let owned =
                ManifestDigest::from_id(&name).is_ok() || TEMP_DIR_MATCHER.is_match(&name);
            if owned {
                fsutil::remove_tree_forced(self.root.join(name))?;
            }
        }
        Ok(())
    }

    /// Re-derives the manifest from disk and compares it against both
    /// the persisted `.manifest` file and the identifier the directory
    /// is stored under. On mismatch the handler is asked whether to
    /// delete the implementation.
    pub fn verify(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<()> {
        let (id, path) = digest
            .ids()
            .into_iter()
            .map(|id| (id.clone(), self.root.join(id)))
            .find(|(_, path)| path.is_dir())
            .ok_or_else(|| NotFound {
                id: digest.to_string(),
            })?;

        let format = ManifestDigest::from_id(&id)?
            .best_format()
            .ok_or_else(|| UnsupportedKind {
                kind: format!("identifier format of {id}"),
            })?;

        let rebuilt = manifest_from_dir(&path, format)?;
        let computed_id = rebuilt.identifier();

        let manifest_path = path.join(MANIFEST_FILE);
        let stored = fs::read(&manifest_path).context(IoReadSnafu {
            path: &manifest_path,
        })?;

        if computed_id == id && stored == rebuilt.serialize() {
            info!("Implementation {id} verified");
            return Ok(());
        }

        error!("Implementation {id} is corrupt (computed {computed_id})");
        if handler.confirm(&format!(
            "The implementation {id} appears to be corrupt; delete it?"
        )) {
            self.remove(digest)?;
        }
        Err(DigestMismatch {
            expected: id,
            actual: computed_id,
        })
    }

    /// Hardlinks byte-identical files across implementations of the same
    /// format, returning the bytes reclaimed. Files are keyed by
    /// `(format, digest, mtime, size, executable)` from the trusted
    /// `.manifest` files; symlinks are skipped.
    #[cfg(unix)]
    pub fn optimise(&self) -> Result<u64> {
        use crate::store::manifest::ManifestElement;
        use std::collections::HashMap;
        use std::os::unix::fs::MetadataExt;

        let mut seen: HashMap<FileKey, FileIdentity> = HashMap::new();
        let mut saved = 0;

        for name in self.child_names()? {
            let format = match ManifestDigest::from_id(&name)
                .ok()
                .and_then(|digest| digest.best_format())
            {
                Some(format) => format,
                None => continue,
            };

            let impl_dir = self.root.join(&name);
            let manifest_path = impl_dir.join(MANIFEST_FILE);
            let bytes = match fs::read(&manifest_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping {name} during optimise: {e}");
                    continue;
                }
            };
            let manifest = Manifest::parse(format, &bytes)?;

            for path in manifest.list_paths() {
                let element = match manifest.lookup(&path) {
                    Some(element) => element,
                    None => continue, // a directory
                };
                let (digest, mtime, size, executable) = match element {
                    ManifestElement::File {
                        digest,
                        mtime,
                        size,
                        executable,
                    } => (digest.clone(), *mtime, *size, *executable),
                    ManifestElement::Symlink { .. } => continue,
                };

                let file = impl_dir.join(&path);
                let metadata = fs::metadata(&file).context(IoStatSnafu { path: &file })?;
                let identity = FileIdentity {
                    path: file,
                    dev: metadata.dev(),
                    ino: metadata.ino(),
                };

                let key = (format, digest, mtime, size, executable);
                match seen.get(&key) {
                    None => {
                        seen.insert(key, identity);
                    }
                    Some(first) if first.dev == identity.dev && first.ino == identity.ino => {}
                    Some(first) if first.dev != identity.dev => {}
                    Some(first) => {
                        relink(&first.path, &identity.path)?;
                        saved += size;
                    }
                }
            }
        }

        info!("Optimise reclaimed {saved} bytes");
        Ok(saved)
    }

    /// Hardlink deduplication needs stable file identity, which std only
    /// exposes on Unix.
    #[cfg(not(unix))]
    pub fn optimise(&self) -> Result<u64> {
        warn!("optimise is not supported on this platform");
        Ok(0)
    }

    /// Acquires the store's cross-process manager lock, serializing
    /// maintenance operations such as purge and optimise. The lock name
    /// is derived from the store root path so every process agrees on it.
    pub fn manager_lock(
        &self,
        handler: &dyn Handler,
        cancel: &CancelToken,
    ) -> Result<NamedLock> {
        use digest::Digest;
        let root_hash =
            hex::encode(&sha2::Sha256::digest(self.root.to_string_lossy().as_bytes())[..8]);
        NamedLock::acquire(
            &self.root,
            &format!("0install-store-{root_hash}"),
            handler,
            cancel,
        )
    }

    fn fresh_temp_name(&self, prefix: &str) -> PathBuf {
        let mut attempt = 0u32;
        loop {
            let candidate = self
                .root
                .join(format!("{prefix}{}-{attempt}", epoch_seconds()));
            if !candidate.exists() {
                return candidate;
            }
            attempt += 1;
        }
    }

    fn map_write_error(&self, e: std::io::Error, path: &Path) -> Error {
        if e.kind() == ErrorKind::PermissionDenied {
            AccessDenied { path: path.into() }
        } else {
            Error::IoCreate {
                source: e,
                path: path.into(),
            }
        }
    }
}

#[cfg(unix)]
type FileKey = (ManifestFormat, String, i64, u64, bool);

#[cfg(unix)]
struct FileIdentity {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

/// Atomically replaces `duplicate` with a hardlink to `original` via a
/// temp-rename dance inside the same (write-protected) directory.
#[cfg(unix)]
fn relink(original: &Path, duplicate: &Path) -> Result<()> {
    info!(
        "Linking {} to {}",
        duplicate.display(),
        original.display()
    );
    let parent = duplicate.parent().unwrap();
    fsutil::set_readonly(parent, false)?;

    let result = (|| {
        let tmp = parent.join(format!(".tmp-link-{}", epoch_seconds()));
        fs::hard_link(original, &tmp).context(IoCreateSnafu { path: &tmp })?;
        fs::rename(&tmp, duplicate).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::IoMove {
                source: e,
                from: tmp.clone(),
                to: duplicate.into(),
            }
        })
    })();

    fsutil::set_readonly(parent, true)?;
    result
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Failed to get system time")
        .as_secs()
}

/// Removes a temp directory that may already be write-protected,
/// logging rather than failing: the caller is reporting a more
/// interesting error.
fn discard_temp(path: &Path) {
    if let Err(e) = fsutil::remove_tree_forced(path) {
        warn!("Failed to clean up {}: {e}", path.display());
    }
}

/// Walks an on-disk tree in canonical order and rebuilds its manifest,
/// hashing every file and symlink target. The root-level `.manifest`
/// file is not part of the manifest itself.
pub fn manifest_from_dir<P: AsRef<Path>>(root: P, format: ManifestFormat) -> Result<Manifest> {
    let root = root.as_ref();
    let mut manifest = Manifest::new(format);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.context(WalkFileSnafu)?;
        if entry.depth() == 1 && entry.file_name() == MANIFEST_FILE {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_str()
            .ok_or_else(|| InvalidPath {
                path: entry.path().display().to_string(),
                details: "path is not valid UTF-8".into(),
            })?
            .replace('\\', "/");

        if let Some(target) = fsutil::read_symlink(entry.path())? {
            let digest = format.digest_bytes(target.as_bytes());
            manifest.add_symlink(&relative, &digest, target.len() as u64)?;
        } else if entry.file_type().is_dir() {
            manifest.add_directory(&relative)?;
        } else if entry.file_type().is_file() {
            let metadata = entry.metadata().context(WalkFileSnafu)?;
            let mut reader =
                File::open(entry.path()).context(IoReadSnafu { path: entry.path() })?;
            let mut writer = DigestWriter::new(format, std::io::sink());
            std::io::copy(&mut reader, &mut writer).context(IoReadSnafu { path: entry.path() })?;
            let (digest, size) = writer.finalize();
            manifest.add_file(
                &relative,
                &format.encode(&digest),
                fsutil::mtime_of(&metadata),
                size,
                fsutil::is_executable(&metadata),
            )?;
        } else {
            return Err(Error::UnsupportedKind {
                kind: format!("special file at {}", entry.path().display()),
            });
        }
    }

    Ok(manifest)
}
