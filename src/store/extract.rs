use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use log::warn;
use snafu::ResultExt;

use crate::store::builder::BuilderSink;
use crate::store::cancel::CancelToken;
use crate::store::consts::*;
use crate::store::error::Error::{InvalidPath, PathNotFound, UnsupportedKind};
use crate::store::error::*;
use crate::store::manifest::{normalize_path, split_path};

/// Options shared by every extractor invocation.
pub struct ExtractOptions<'a> {
    /// Only entries under this archive sub-path are emitted, prefix
    /// stripped.
    pub subdir: Option<&'a str>,
    /// Entries are re-rooted under this tree path.
    pub destination: Option<&'a str>,
    /// Bytes to skip before format parsing begins.
    pub start_offset: u64,
    pub cancel: &'a CancelToken,
}

impl<'a> ExtractOptions<'a> {
    pub fn new(cancel: &'a CancelToken) -> Self {
        Self {
            subdir: None,
            destination: None,
            start_offset: 0,
            cancel,
        }
    }
}

/// Streams archive entries, in their stored order, into a builder's
/// capability interface.
pub trait ArchiveExtractor {
    fn extract(
        &self,
        sink: &mut dyn BuilderSink,
        archive: &Path,
        options: &ExtractOptions,
    ) -> Result<()>;
}

/// All MIME types the table knows, whether or not an adapter exists.
const KNOWN_MIME_TYPES: [&str; 11] = [
    MIME_ZIP, MIME_TAR, MIME_TGZ, MIME_TBZ, MIME_TXZ, MIME_TLZMA, MIME_7Z, MIME_RPM, MIME_CAB,
    MIME_MSI, MIME_DEB,
];

/// Selects the extractor for a MIME type. Recognized types without a
/// native adapter still fail with `UnsupportedKind`, but the table keeps
/// URL inference working for them.
pub fn extractor_for_mime(mime: &str) -> Result<Box<dyn ArchiveExtractor>> {
    match mime {
        MIME_ZIP => Ok(Box::new(ZipExtractor)),
        MIME_TAR => Ok(Box::new(TarExtractor {
            compression: TarCompression::Plain,
        })),
        MIME_TGZ => Ok(Box::new(TarExtractor {
            compression: TarCompression::Gzip,
        })),
        _ => Err(UnsupportedKind {
            kind: format!("archive MIME type {mime}"),
        }),
    }
}

pub fn is_known_mime(mime: &str) -> bool {
    KNOWN_MIME_TYPES.contains(&mime)
}

/// Infers the archive MIME type from a URL's file extension.
pub fn mime_for_url(url: &str) -> Option<&'static str> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    EXTENSION_MIME_TYPES
        .iter()
        .find(|(extension, _)| path.ends_with(extension))
        .map(|(_, mime)| *mime)
}

/// Normalizes an archive entry path and applies the subdir filter and
/// destination re-rooting. `None` means the entry is filtered out.
fn map_entry_path(
    raw: &str,
    subdir: Option<&str>,
    destination: Option<&str>,
) -> Result<Option<String>> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(InvalidPath {
            path: raw.into(),
            details: "absolute archive entry".into(),
        });
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(InvalidPath {
                    path: raw.into(),
                    details: "archive entry escapes the extraction root".into(),
                })
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if joined.is_empty() {
        return Ok(None);
    }

    let stripped = match subdir {
        Some(prefix) => {
            if joined == prefix {
                return Ok(None);
            }
            match joined.strip_prefix(&format!("{prefix}/")) {
                Some(rest) => rest.to_string(),
                None => return Ok(None),
            }
        }
        None => joined,
    };

    let rooted = match destination {
        Some(dest) => format!("{dest}/{stripped}"),
        None => stripped,
    };

    normalize_path(&rooted).map(Some)
}

/// Ensures an entry's parent directory exists in the sink; archives may
/// omit directory entries entirely.
fn ensure_parent(sink: &mut dyn BuilderSink, path: &str) -> Result<()> {
    let (dir, _) = split_path(path);
    if dir.is_empty() {
        Ok(())
    } else {
        sink.add_directory(dir)
    }
}

#[derive(Debug, Copy, Clone)]
enum TarCompression {
    Plain,
    Gzip,
}

/// Adapter for tar archives, optionally gzip-compressed.
struct TarExtractor {
    compression: TarCompression,
}

impl ArchiveExtractor for TarExtractor {
    fn extract(
        &self,
        sink: &mut dyn BuilderSink,
        archive: &Path,
        options: &ExtractOptions,
    ) -> Result<()> {
        let mut file = File::open(archive).context(IoReadSnafu { path: archive })?;
        file.seek(SeekFrom::Start(options.start_offset))
            .context(IoReadSnafu { path: archive })?;

        if let Some(dest) = options.destination {
            sink.add_directory(dest)?;
        }

        match self.compression {
            TarCompression::Plain => extract_tar_entries(sink, tar::Archive::new(file), options),
            TarCompression::Gzip => {
                extract_tar_entries(sink, tar::Archive::new(GzDecoder::new(file)), options)
            }
        }
    }
}

fn extract_tar_entries<R: Read>(
    sink: &mut dyn BuilderSink,
    mut archive: tar::Archive<R>,
    options: &ExtractOptions,
) -> Result<()> {
    let entries = archive.entries().context(IoGeneralSnafu)?;

    for entry in entries {
        options.cancel.check()?;
        let mut entry = entry.context(IoGeneralSnafu)?;

        let raw = String::from_utf8(entry.path_bytes().to_vec()).context(InvalidStringSnafu)?;
        let path = match map_entry_path(&raw, options.subdir, options.destination)? {
            Some(path) => path,
            None => continue,
        };

        let header = entry.header();
        let mode = header.mode().context(IoGeneralSnafu)?;
        let mtime = header.mtime().context(IoGeneralSnafu)? as i64;
        let executable = mode & 0o111 != 0;

        match header.entry_type() {
            tar::EntryType::Directory => {
                sink.add_directory(&path)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                ensure_parent(sink, &path)?;
                sink.add_file(&path, &mut entry, mtime, executable)?;
            }
            tar::EntryType::Symlink => {
                let target = link_target(&entry, &raw)?;
                ensure_parent(sink, &path)?;
                sink.add_symlink(&path, &target)?;
            }
            tar::EntryType::Link => {
                let target = link_target(&entry, &raw)?;
                let source = map_entry_path(&target, options.subdir, options.destination)?
                    .ok_or(PathNotFound { path: target })?;
                ensure_parent(sink, &path)?;
                sink.add_hardlink(&path, &source, executable)?;
            }
            other => {
                warn!("Skipping unsupported tar entry {raw} of type {other:?}");
            }
        }
    }

    Ok(())
}

fn link_target<R: Read>(entry: &tar::Entry<R>, raw: &str) -> Result<String> {
    let target = entry
        .link_name()
        .context(IoGeneralSnafu)?
        .ok_or_else(|| InvalidPath {
            path: raw.into(),
            details: "link entry without a target".into(),
        })?;
    match target.to_str() {
        Some(target) => Ok(target.into()),
        None => Err(InvalidPath {
            path: raw.into(),
            details: "link target is not valid UTF-8".into(),
        }),
    }
}

/// Adapter for zip archives.
struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(
        &self,
        sink: &mut dyn BuilderSink,
        archive: &Path,
        options: &ExtractOptions,
    ) -> Result<()> {
        let file = File::open(archive).context(IoReadSnafu { path: archive })?;
        let slice = SeekSlice::new(file, options.start_offset)
            .context(IoReadSnafu { path: archive })?;
        let mut zip = zip::ZipArchive::new(slice).map_err(|e| Error::IoGeneral {
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        if let Some(dest) = options.destination {
            sink.add_directory(dest)?;
        }

        for index in 0..zip.len() {
            options.cancel.check()?;
            let mut entry = zip.by_index(index).map_err(|e| Error::IoGeneral {
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;

            let raw = entry.name().to_string();
            let path = match map_entry_path(&raw, options.subdir, options.destination)? {
                Some(path) => path,
                None => continue,
            };

            if entry.is_dir() {
                sink.add_directory(&path)?;
                continue;
            }

            let mode = entry.unix_mode().unwrap_or(0o644);
            if mode & 0o170000 == 0o120000 {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .context(IoGeneralSnafu)?;
                ensure_parent(sink, &path)?;
                sink.add_symlink(&path, &target)?;
                continue;
            }

            let mtime = zip_mtime(&entry);
            ensure_parent(sink, &path)?;
            sink.add_file(&path, &mut entry, mtime, mode & 0o111 != 0)?;
        }

        Ok(())
    }
}

fn zip_mtime(entry: &zip::read::ZipFile) -> i64 {
    let dt = entry.last_modified();
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)
        .and_then(|date| {
            date.and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
        })
        .map(|naive| naive.and_utc().timestamp())
        .unwrap_or(0)
}

/// A `Read + Seek` view of a file starting at a fixed offset, so archive
/// formats that seek (zip's end-of-file central directory) work with a
/// `start_offset`.
struct SeekSlice<R: Read + Seek> {
    inner: R,
    base: u64,
}

impl<R: Read + Seek> SeekSlice<R> {
    fn new(mut inner: R, base: u64) -> std::io::Result<Self> {
        inner.seek(SeekFrom::Start(base))?;
        Ok(Self { inner, base })
    }
}

impl<R: Read + Seek> Read for SeekSlice<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek> Seek for SeekSlice<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(offset) => self.inner.seek(SeekFrom::Start(self.base + offset))?,
            SeekFrom::Current(delta) => self.inner.seek(SeekFrom::Current(delta))?,
            SeekFrom::End(delta) => {
                let position = self.inner.seek(SeekFrom::End(delta))?;
                if position < self.base {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "seek before slice start",
                    ));
                }
                position
            }
        };
        Ok(absolute - self.base)
    }
}
