use std::fs;
use std::path::Path;

use filetime::FileTime;
use log::info;
use snafu::ResultExt;
use walkdir::WalkDir;

use crate::store::error::*;

/// Marker bytes at the start of a Cygwin-style symlink surrogate file:
/// the magic string followed by a UTF-16LE BOM, then the UTF-16LE target.
pub const SYMLINK_SURROGATE_MAGIC: &[u8] = b"!<symlink>\xff\xfe";

/// Seconds-resolution mtime of an already-fetched metadata record.
pub fn mtime_of(metadata: &fs::Metadata) -> i64 {
    FileTime::from_last_modification_time(metadata).unix_seconds()
}

pub fn set_mtime<P: AsRef<Path>>(path: P, mtime: i64) -> Result<()> {
    let path = path.as_ref();
    filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
        .context(IoWriteSnafu { path })
}

#[cfg(unix)]
pub fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Sets or clears the executable flag. On POSIX the owner-execute mode
/// bit is the source of truth; the file's last-write time is preserved.
#[cfg(unix)]
pub fn set_executable<P: AsRef<Path>>(path: P, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = path.as_ref();
    let metadata = fs::metadata(path).context(IoStatSnafu { path })?;
    let mut mode = metadata.permissions().mode();
    if executable {
        mode |= 0o111;
    } else {
        mode &= !0o111;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).context(IoWriteSnafu { path })
}

#[cfg(not(unix))]
pub fn set_executable<P: AsRef<Path>>(path: P, executable: bool) -> Result<()> {
    // The flag is carried by an `xbit` alternate data stream; writing it
    // must not disturb the file's last-write time, which the manifest
    // records.
    let path = path.as_ref();
    let metadata = fs::metadata(path).context(IoStatSnafu { path })?;
    let mtime = mtime_of(&metadata);

    let stream = xbit_stream_path(path);
    if executable {
        fs::write(&stream, b"").context(IoWriteSnafu { path })?;
    } else if let Err(e) = fs::remove_file(&stream) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(Error::IoDelete {
                source: e,
                path: path.into(),
            });
        }
    }

    set_mtime(path, mtime)
}

#[cfg(not(unix))]
fn xbit_stream_path(path: &Path) -> std::path::PathBuf {
    let mut stream = path.as_os_str().to_os_string();
    stream.push(":xbit");
    stream.into()
}

/// Creates a symlink pointing at `target`. Where the OS forbids native
/// symlinks a Cygwin-style surrogate file is written instead; manifest
/// hashing is over the UTF-8 target bytes either way.
#[cfg(unix)]
pub fn symlink<P: AsRef<Path>>(target: &str, link: P) -> Result<()> {
    let link = link.as_ref();
    std::os::unix::fs::symlink(target, link).context(IoCreateSnafu { path: link })
}

#[cfg(not(unix))]
pub fn symlink<P: AsRef<Path>>(target: &str, link: P) -> Result<()> {
    let link = link.as_ref();
    if std::os::windows::fs::symlink_file(target, link).is_ok() {
        return Ok(());
    }

    // No symlink privilege: fall back to the surrogate format.
    let mut content = Vec::with_capacity(SYMLINK_SURROGATE_MAGIC.len() + target.len() * 2);
    content.extend_from_slice(SYMLINK_SURROGATE_MAGIC);
    for unit in target.encode_utf16() {
        content.extend_from_slice(&unit.to_le_bytes());
    }
    fs::write(link, content).context(IoCreateSnafu { path: link })
}

/// Reads a symlink target, understanding both native links and surrogate
/// files. Returns `None` when the node is neither.
pub fn read_symlink<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    let path = path.as_ref();
    let metadata = fs::symlink_metadata(path).context(IoStatSnafu { path })?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path).context(IoReadSnafu { path })?;
        return match target.to_str() {
            Some(target) => Ok(Some(target.into())),
            None => Err(Error::InvalidPath {
                path: path.display().to_string(),
                details: "symlink target is not valid UTF-8".into(),
            }),
        };
    }

    // Surrogate files only exist on platforms that cannot create native
    // symlinks; elsewhere a file with the magic prefix is just a file.
    #[cfg(not(unix))]
    if metadata.is_file() && metadata.len() >= SYMLINK_SURROGATE_MAGIC.len() as u64 {
        let content = fs::read(path).context(IoReadSnafu { path })?;
        if content.starts_with(SYMLINK_SURROGATE_MAGIC) {
            let units: Vec<u16> = content[SYMLINK_SURROGATE_MAGIC.len()..]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            let target = String::from_utf16(&units).map_err(|_| Error::InvalidPath {
                path: path.display().to_string(),
                details: "surrogate symlink target is not valid UTF-16".into(),
            })?;
            return Ok(Some(target));
        }
    }

    Ok(None)
}

/// Recursively enables or disables write-protection on a finalized tree.
/// Symlinks are left untouched.
pub fn write_protect<P: AsRef<Path>>(root: P, protect: bool) -> Result<()> {
    let root = root.as_ref();
    info!(
        "{} write-protection on {}",
        if protect { "Enabling" } else { "Disabling" },
        root.display()
    );

    for entry in WalkDir::new(root) {
        let entry = entry.context(WalkFileSnafu)?;
        if entry.file_type().is_symlink() {
            continue;
        }
        set_readonly(entry.path(), protect)?;
    }

    Ok(())
}

#[cfg(unix)]
pub fn set_readonly(path: &Path, readonly: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::symlink_metadata(path).context(IoStatSnafu { path })?;
    let mut mode = metadata.permissions().mode();
    if readonly {
        mode &= !0o222;
    } else {
        mode |= 0o200;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).context(IoWriteSnafu { path })
}

#[cfg(not(unix))]
pub fn set_readonly(path: &Path, readonly: bool) -> Result<()> {
    let metadata = fs::symlink_metadata(path).context(IoStatSnafu { path })?;
    let mut permissions = metadata.permissions();
    permissions.set_readonly(readonly);
    fs::set_permissions(path, permissions).context(IoWriteSnafu { path })
}

/// Deletes a tree that may be write-protected.
pub fn remove_tree_forced<P: AsRef<Path>>(root: P) -> Result<()> {
    let root = root.as_ref();
    write_protect(root, false)?;
    fs::remove_dir_all(root).context(IoDeleteSnafu { path: root })
}

/// Flushes directory metadata where the platform supports it, so a
/// freshly renamed implementation survives power loss.
#[cfg(unix)]
pub fn fsync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    let handle = fs::File::open(dir).context(IoReadSnafu { path: dir })?;
    handle.sync_all().context(IoWriteSnafu { path: dir })
}

#[cfg(not(unix))]
pub fn fsync_dir<P: AsRef<Path>>(_dir: P) -> Result<()> {
    Ok(())
}
