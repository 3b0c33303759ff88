use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::info;
use snafu::ResultExt;

use crate::store::cancel::CancelToken;
use crate::store::consts::BUF_SIZE;
use crate::store::digest::{DigestWriter, ManifestFormat};
use crate::store::error::Error::InvalidPath;
use crate::store::error::*;
use crate::store::fsutil;
use crate::store::manifest::{normalize_path, split_path, Manifest, ManifestElement};

/// The capability set an archive extractor needs: it receives the
/// builder by reference and streams entries into it, never seeing the
/// destination directory or the manifest directly.
pub trait BuilderSink {
    fn add_directory(&mut self, path: &str) -> Result<()>;
    fn add_file(
        &mut self,
        path: &str,
        reader: &mut dyn Read,
        mtime: i64,
        executable: bool,
    ) -> Result<()>;
    fn add_hardlink(&mut self, path: &str, source: &str, executable: bool) -> Result<()>;
    fn add_symlink(&mut self, path: &str, target: &str) -> Result<()>;
}

/// Applies retrieval steps to a destination directory while mirroring
/// every change into a growing manifest. The directory is a temp
/// directory inside the store root; on success the store renames it to
/// its final digest-named location.
pub struct Builder {
    root: PathBuf,
    manifest: Manifest,
    cancel: CancelToken,
}

impl Builder {
    pub fn new<P: AsRef<Path>>(root: P, format: ManifestFormat, cancel: CancelToken) -> Self {
        Self {
            root: root.as_ref().into(),
            manifest: Manifest::new(format),
            cancel,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> ManifestFormat {
        self.manifest.format()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn target(&self, normalized: &str) -> PathBuf {
        self.root.join(normalized)
    }

    /// Errors unless the parent directory of `path` is already recorded.
    fn require_parent(&self, normalized: &str) -> Result<()> {
        let (dir, _) = split_path(normalized);
        if self.manifest.contains_dir(dir) {
            Ok(())
        } else {
            Err(Error::PathNotFound { path: dir.into() })
        }
    }

    /// Deletes a file or directory from disk and manifest.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        self.manifest.remove(&normalized)?;

        let target = self.target(&normalized);
        let metadata = fs::symlink_metadata(&target).context(IoStatSnafu { path: &target })?;
        if metadata.is_dir() {
            fs::remove_dir_all(&target).context(IoDeleteSnafu { path: &target })
        } else {
            fs::remove_file(&target).context(IoDeleteSnafu { path: &target })
        }
    }

    /// Renames a file or directory on disk and in the manifest.
    pub fn rename(&mut self, source: &str, destination: &str) -> Result<()> {
        self.cancel.check()?;
        let source = normalize_path(source)?;
        let destination = normalize_path(destination)?;
        self.manifest.rename(&source, &destination)?;

        let from = self.target(&source);
        let to = self.target(&destination);
        fs::rename(&from, &to).context(IoMoveSnafu { from, to })
    }

    /// Sets the executable bit on disk and reclassifies in the manifest.
    pub fn mark_as_executable(&mut self, path: &str) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        self.manifest.mark_as_executable(&normalized)?;
        fsutil::set_executable(self.target(&normalized), true)
    }

    /// Reads a file's bytes as a link target, replaces the file with a
    /// symlink to that target, and reclassifies the manifest entry. The
    /// content must be valid UTF-8.
    pub fn turn_into_symlink(&mut self, path: &str) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;

        match self.manifest.lookup(&normalized) {
            Some(ManifestElement::File { .. }) => {}
            Some(ManifestElement::Symlink { .. }) => return Ok(()),
            None => {
                return Err(Error::PathNotFound { path: normalized });
            }
        }

        let target_path = self.target(&normalized);
        let bytes = fs::read(&target_path).context(IoReadSnafu { path: &target_path })?;
        let link_target = String::from_utf8(bytes).map_err(|_| InvalidPath {
            path: normalized.clone(),
            details: "symlink target bytes are not valid UTF-8".into(),
        })?;

        fs::remove_file(&target_path).context(IoDeleteSnafu { path: &target_path })?;
        fsutil::symlink(&link_target, &target_path)?;
        self.manifest.turn_into_symlink(&normalized)
    }
}

impl BuilderSink for Builder {
    /// Creates the directory on disk (with any missing ancestors) and
    /// records it. Idempotent.
    fn add_directory(&mut self, path: &str) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        if normalized.is_empty() {
            return Ok(());
        }

        let target = self.target(&normalized);
        fs::create_dir_all(&target).context(IoCreateSnafu { path: &target })?;
        self.manifest.add_directory(&normalized)
    }

    /// Streams bytes to disk while hashing them, then records the
    /// resulting digest, size, mtime, and executability.
    fn add_file(
        &mut self,
        path: &str,
        reader: &mut dyn Read,
        mtime: i64,
        executable: bool,
    ) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        self.require_parent(&normalized)?;

        let target = self.target(&normalized);
        let file = File::create(&target).context(IoCreateSnafu { path: &target })?;
        let mut writer = DigestWriter::new(self.format(), file);

        let mut buf = [0u8; BUF_SIZE];
        loop {
            self.cancel.check()?;
            let read = reader.read(&mut buf).context(IoReadSnafu { path: &target })?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buf[..read])
                .context(IoWriteSnafu { path: &target })?;
        }
        writer.flush().context(IoWriteSnafu { path: &target })?;
        let (digest, size) = writer.finalize();
        let digest = self.format().encode(&digest);

        if executable {
            fsutil::set_executable(&target, true)?;
        }
        fsutil::set_mtime(&target, mtime)?;

        self.manifest
            .add_file(&normalized, &digest, mtime, size, executable)
    }

    /// Creates an OS hardlink to an earlier entry, reusing its recorded
    /// digest and size.
    fn add_hardlink(&mut self, path: &str, source: &str, executable: bool) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        let source = normalize_path(source)?;
        self.require_parent(&normalized)?;

        let from = self.target(&source);
        let to = self.target(&normalized);
        fs::hard_link(&from, &to).context(IoCreateSnafu { path: &to })?;
        self.manifest.hardlink(&source, &normalized)?;

        let plain_file = matches!(
            self.manifest.lookup(&normalized),
            Some(ManifestElement::File {
                executable: false,
                ..
            })
        );
        if executable && plain_file {
            // links share their inode's mode, so this also flips the source
            fsutil::set_executable(&to, true)?;
            self.manifest.mark_as_executable(&source)?;
            self.manifest.mark_as_executable(&normalized)?;
        }
        Ok(())
    }

    /// Creates a symlink (or a platform surrogate) and hashes the UTF-8
    /// target bytes.
    fn add_symlink(&mut self, path: &str, target: &str) -> Result<()> {
        self.cancel.check()?;
        let normalized = normalize_path(path)?;
        self.require_parent(&normalized)?;

        let link = self.target(&normalized);
        fsutil::symlink(target, &link)?;

        let digest = self.format().digest_bytes(target.as_bytes());
        self.manifest
            .add_symlink(&normalized, &digest, target.len() as u64)
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("root", &self.root)
            .field("format", &self.format())
            .finish()
    }
}

/// Copies an existing directory tree into the builder, re-hashing every
/// file and preserving mtimes. Used for directory admission and for
/// recipe copy-from steps.
pub fn copy_tree_into<P: AsRef<Path>>(
    builder: &mut Builder,
    source_root: P,
    source_sub: Option<&str>,
    destination: Option<&str>,
) -> Result<()> {
    let source_root = source_root.as_ref();
    let walk_root = match source_sub {
        Some(sub) => source_root.join(normalize_path(sub)?),
        None => source_root.into(),
    };
    let prefix = match destination {
        Some(dest) => {
            let normalized = normalize_path(dest)?;
            builder.add_directory(&normalized)?;
            normalized
        }
        None => String::new(),
    };

    info!(
        "Copying tree {} into {}",
        walk_root.display(),
        builder.dir().display()
    );

    for entry in walkdir::WalkDir::new(&walk_root).sort_by_file_name() {
        let entry = entry.context(WalkFileSnafu)?;
        let relative = entry
            .path()
            .strip_prefix(&walk_root)
            .unwrap()
            .to_str()
            .ok_or_else(|| InvalidPath {
                path: entry.path().display().to_string(),
                details: "path is not valid UTF-8".into(),
            })?
            .replace('\\', "/");
        if relative.is_empty() {
            continue;
        }
        // the source tree may itself be a stored implementation
        if relative == crate::store::consts::MANIFEST_FILE {
            continue;
        }

        let dest = if prefix.is_empty() {
            relative.clone()
        } else {
            format!("{prefix}/{relative}")
        };

        if let Some(target) = fsutil::read_symlink(entry.path())? {
            builder.add_symlink(&dest, &target)?;
        } else if entry.file_type().is_dir() {
            builder.add_directory(&dest)?;
        } else if entry.file_type().is_file() {
            let metadata = entry.metadata().context(WalkFileSnafu)?;
            let mut reader =
                File::open(entry.path()).context(IoReadSnafu { path: entry.path() })?;
            builder.add_file(
                &dest,
                &mut reader,
                fsutil::mtime_of(&metadata),
                fsutil::is_executable(&metadata),
            )?;
        } else {
            return Err(Error::UnsupportedKind {
                kind: format!("special file at {}", entry.path().display()),
            });
        }
    }

    Ok(())
}
