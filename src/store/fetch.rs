use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};
use snafu::ResultExt;
use tempfile::NamedTempFile;
use url::{Host, Url};

use crate::store::builder::{copy_tree_into, Builder, BuilderSink};
use crate::store::cancel::CancelToken;
use crate::store::config::Config;
use crate::store::consts::*;
use crate::store::digest::ManifestDigest;
use crate::store::engine::Store;
use crate::store::error::Error::{
    Cancelled, Http, InvalidPath, NotFound, Offline, UnsupportedKind,
};
use crate::store::error::*;
use crate::store::extract::{extractor_for_mime, mime_for_url, ExtractOptions};
use crate::store::handler::Handler;
use crate::store::lock::NamedLock;
use crate::store::retrieval::{
    ranked, ArchiveStep, ExternalMethod, FileStep, RecipeStep, RetrievalMethod,
};

/// Resolves retrieval methods for sibling implementations referenced by
/// recipe copy-from steps, so the fetcher can fetch them first.
pub trait RetrievalResolver {
    fn retrieval_methods(&self, digest: &ManifestDigest) -> Option<Vec<RetrievalMethod>>;
}

/// Runs native package-manager installations for external retrieval
/// methods; these bypass the store entirely.
pub trait ExternalInstaller {
    fn install(&self, method: &ExternalMethod, cancel: &CancelToken) -> Result<()>;
}

/// Retrieves implementations on behalf of a caller: ranks the available
/// retrieval methods, coordinates with other processes through a
/// per-digest named lock, downloads with mirror fallback, and admits the
/// result into the store.
pub struct Fetcher<'a> {
    store: &'a Store,
    config: &'a Config,
    handler: &'a dyn Handler,
    resolver: Option<&'a dyn RetrievalResolver>,
    installer: Option<&'a dyn ExternalInstaller>,
}

impl<'a> Fetcher<'a> {
    pub fn new(store: &'a Store, config: &'a Config, handler: &'a dyn Handler) -> Self {
        Self {
            store,
            config,
            handler,
            resolver: None,
            installer: None,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn RetrievalResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_installer(mut self, installer: &'a dyn ExternalInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Fetches the implementation identified by `expected`. Returns the
    /// stored path, or `None` when an external method installed it
    /// outside the store.
    pub fn fetch(
        &self,
        expected: &ManifestDigest,
        methods: &[RetrievalMethod],
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        let best_id = expected.best_id().ok_or_else(|| UnsupportedKind {
            kind: "empty digest envelope".into(),
        })?;

        let _lock = NamedLock::acquire(
            self.store.root(),
            &format!("{FETCHER_LOCK_PREFIX}{best_id}"),
            self.handler,
            cancel,
        )?;

        // another process may have fetched it while we waited
        if let Some(path) = self.store.get_path(expected) {
            info!("{best_id} is already in the store");
            return Ok(Some(path));
        }

        if let Some(external) = methods.iter().find_map(|method| match method {
            RetrievalMethod::External(external) => Some(external),
            _ => None,
        }) {
            return self.run_external(external, cancel).map(|()| None);
        }

        let mut last_error: Option<Error> = None;
        let mut skipped_offline = false;

        for method in ranked(methods) {
            cancel.check()?;

            if self.config.offline() && method.needs_network() {
                skipped_offline = true;
                continue;
            }

            match self.try_method(expected, method, cancel) {
                Ok(path) => return Ok(Some(path)),
                Err(Error::AlreadyInStore { id }) => {
                    // appeared concurrently; the winner's copy is ours too
                    info!("{id} appeared in the store while fetching");
                    return Ok(self.store.get_path(expected));
                }
                Err(e @ Error::DigestMismatch { .. }) => {
                    error!("Retrieval method produced the wrong digest: {e}");
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    warn!("Retrieval method failed, trying the next one: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None if skipped_offline => Err(Offline),
            None => Err(NotFound { id: best_id }),
        }
    }

    fn run_external(&self, external: &ExternalMethod, cancel: &CancelToken) -> Result<()> {
        let installer = self.installer.ok_or_else(|| UnsupportedKind {
            kind: format!("external retrieval of package {}", external.package),
        })?;
        if let Some(message) = &external.message {
            if !self.handler.confirm(message) {
                return Err(Cancelled);
            }
        }
        info!("Installing native package {}", external.package);
        installer.install(external, cancel)
    }

    fn try_method(
        &self,
        expected: &ManifestDigest,
        method: &RetrievalMethod,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        match method {
            RetrievalMethod::DownloadArchive(step) => {
                let mime = check_archive_step(step)?;
                let spool = self.download(&step.href, cancel)?;
                self.store.add(expected, cancel, |builder| {
                    apply_archive(builder, step, mime, spool.path().into(), cancel)
                })
            }
            RetrievalMethod::DownloadFile(step) => {
                check_file_destination(&step.destination)?;
                let spool = self.download(&step.href, cancel)?;
                self.store.add(expected, cancel, |builder| {
                    apply_file(builder, step, spool.path().into())
                })
            }
            RetrievalMethod::Recipe(steps) => self.try_recipe(expected, steps, cancel),
            RetrievalMethod::External(external) => Err(UnsupportedKind {
                kind: format!("external retrieval of package {}", external.package),
            }),
        }
    }

    fn try_recipe(
        &self,
        expected: &ManifestDigest,
        steps: &[RecipeStep],
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        // fail fast on steps that can never work before any download
        for step in steps {
            match step {
                RecipeStep::DownloadArchive(archive) => {
                    check_archive_step(archive)?;
                }
                RecipeStep::DownloadFile(file) => check_file_destination(&file.destination)?,
                _ => {}
            }
        }

        self.fetch_copy_from_dependencies(steps, cancel)?;
        let spools = self.spool_downloads(steps, cancel)?;

        let store = self.store;
        let result = store.add(expected, cancel, |builder| {
            for (index, step) in steps.iter().enumerate() {
                cancel.check()?;
                match step {
                    RecipeStep::DownloadArchive(archive) => {
                        let mime = resolve_mime(archive)?;
                        let spool = spools.get(&index).unwrap();
                        apply_archive(builder, archive, mime, spool.path().into(), cancel)?;
                    }
                    RecipeStep::DownloadFile(file) => {
                        let spool = spools.get(&index).unwrap();
                        apply_file(builder, file, spool.path().into())?;
                    }
                    RecipeStep::Remove { path } => builder.remove(path)?,
                    RecipeStep::Rename {
                        source,
                        destination,
                    } => builder.rename(source, destination)?,
                    RecipeStep::CopyFrom {
                        digest,
                        source,
                        destination,
                    } => {
                        let sibling = store.get_path(digest).ok_or_else(|| NotFound {
                            id: digest.to_string(),
                        })?;
                        copy_tree_into(
                            builder,
                            sibling,
                            source.as_deref(),
                            destination.as_deref(),
                        )?;
                    }
                }
            }
            Ok(())
        });

        if let Err(Error::DigestMismatch { expected, actual }) = &result {
            error!(
                "Recipe [{}] produced {actual}, expected {expected}",
                steps
                    .iter()
                    .map(RecipeStep::kind)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        result
    }

    /// Recursively fetches implementations referenced by copy-from steps
    /// before the recipe runs.
    fn fetch_copy_from_dependencies(
        &self,
        steps: &[RecipeStep],
        cancel: &CancelToken,
    ) -> Result<()> {
        for step in steps {
            let digest = match step {
                RecipeStep::CopyFrom { digest, .. } => digest,
                _ => continue,
            };
            if self.store.contains(digest) {
                continue;
            }
            let methods = self
                .resolver
                .and_then(|resolver| resolver.retrieval_methods(digest))
                .ok_or_else(|| NotFound {
                    id: digest.to_string(),
                })?;
            self.fetch(digest, &methods, cancel)?;
        }
        Ok(())
    }

    /// Downloads every download step to a spool file, in parallel up to
    /// the configured cap, keyed by step index.
    fn spool_downloads(
        &self,
        steps: &[RecipeStep],
        cancel: &CancelToken,
    ) -> Result<HashMap<usize, NamedTempFile>> {
        let downloads: Vec<(usize, &str)> = steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| match step {
                RecipeStep::DownloadArchive(archive) => Some((index, archive.href.as_str())),
                RecipeStep::DownloadFile(file) => Some((index, file.href.as_str())),
                _ => None,
            })
            .collect();

        let mut spools = HashMap::new();
        let parallel = self.config.max_parallel_downloads.max(1);
        let mirror = self.config.feed_mirror.clone();

        for chunk in downloads.chunks(parallel) {
            let results: Vec<(usize, Result<NamedTempFile>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(index, href)| {
                        let mirror = mirror.clone();
                        let cancel = cancel.clone();
                        scope.spawn(move || {
                            (*index, download_to_spool(href, mirror.as_ref(), &cancel))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().expect("download thread panicked"))
                    .collect()
            });

            for (index, result) in results {
                spools.insert(index, result?);
            }
        }

        Ok(spools)
    }

    fn download(&self, href: &str, cancel: &CancelToken) -> Result<NamedTempFile> {
        download_to_spool(href, self.config.feed_mirror.as_ref(), cancel)
    }
}

/// Resolves an archive step's MIME type, wrapping unknown types with the
/// archive's URL for context.
fn resolve_mime(step: &ArchiveStep) -> Result<&str> {
    match &step.mime_type {
        Some(mime) => Ok(mime.as_str()),
        None => mime_for_url(&step.href).ok_or_else(|| UnsupportedKind {
            kind: format!("archive type of {}", step.href),
        }),
    }
}

/// Resolves the MIME type and confirms an extractor exists for it, so
/// unsupported archives fail before any bytes are downloaded.
fn check_archive_step(step: &ArchiveStep) -> Result<&str> {
    let mime = resolve_mime(step)?;
    extractor_for_mime(mime).map_err(|_| UnsupportedKind {
        kind: format!("archive type {mime} of {}", step.href),
    })?;
    Ok(mime)
}

fn check_file_destination(destination: &str) -> Result<()> {
    if destination.is_empty() || destination.contains('/') || destination.contains('\\') {
        return Err(InvalidPath {
            path: destination.into(),
            details: "single-file destination must be a plain file name".into(),
        });
    }
    Ok(())
}

fn apply_archive(
    builder: &mut Builder,
    step: &ArchiveStep,
    mime: &str,
    spool: PathBuf,
    cancel: &CancelToken,
) -> Result<()> {
    let extractor = extractor_for_mime(mime).map_err(|_| UnsupportedKind {
        kind: format!("archive type {mime} of {}", step.href),
    })?;
    let options = ExtractOptions {
        subdir: step.extract.as_deref(),
        destination: step.destination.as_deref(),
        start_offset: step.start_offset,
        cancel,
    };
    info!("Extracting {} ({mime})", step.href);
    extractor.extract(builder, &spool, &options)
}

fn apply_file(builder: &mut Builder, step: &FileStep, spool: PathBuf) -> Result<()> {
    let mut reader = File::open(&spool).context(IoReadSnafu { path: &spool })?;
    builder.add_file(&step.destination, &mut reader, 0, false)
}

/// Downloads a URL into a spool file, retrying against the configured
/// mirror on transient failures. Loopback URLs never hit the mirror; if
/// the mirror fails too, the original error is returned.
fn download_to_spool(
    href: &str,
    mirror: Option<&Url>,
    cancel: &CancelToken,
) -> Result<NamedTempFile> {
    let url = Url::parse(href).map_err(|e| Http {
        url: href.into(),
        reason: e.to_string(),
    })?;

    match fetch_url(&url, cancel) {
        Ok(spool) => Ok(spool),
        Err(original) => {
            let mirror = match mirror {
                Some(mirror) if original.is_transient() && !is_loopback(&url) => mirror,
                _ => return Err(original),
            };
            let fallback = mirror_url(mirror, &url)?;
            warn!("Download of {url} failed, trying mirror {fallback}");
            match fetch_url(&fallback, cancel) {
                Ok(spool) => Ok(spool),
                Err(mirror_error) => {
                    warn!("Mirror download failed too: {mirror_error}");
                    Err(original)
                }
            }
        }
    }
}

fn fetch_url(url: &Url, cancel: &CancelToken) -> Result<NamedTempFile> {
    cancel.check()?;
    info!("Downloading {url}");

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(DISCOVERY_TIMEOUT_SECS))
        .build();
    let response = agent.get(url.as_str()).call().map_err(|e| Http {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut spool = NamedTempFile::new().context(IoGeneralSnafu)?;
    let mut reader = response.into_reader();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        cancel.check()?;
        let read = reader.read(&mut buf).map_err(|e| Http {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if read == 0 {
            break;
        }
        spool
            .write_all(&buf[..read])
            .context(IoWriteSnafu { path: spool.path() })?;
    }
    spool.flush().context(IoWriteSnafu { path: spool.path() })?;
    Ok(spool)
}

/// For `scheme://host/path`, the mirror URL is
/// `<mirror-root>/archive/<scheme>/<host>/<path>` with the path's inner
/// slashes replaced by `%23` and the leading slash removed.
fn mirror_url(mirror: &Url, original: &Url) -> Result<Url> {
    let host = original.host_str().ok_or_else(|| Http {
        url: original.to_string(),
        reason: "URL has no host".into(),
    })?;
    let path = original.path().trim_start_matches('/').replace('/', "%23");
    let combined = format!(
        "{}/archive/{}/{}/{}",
        mirror.as_str().trim_end_matches('/'),
        original.scheme(),
        host,
        path
    );
    Url::parse(&combined).map_err(|e| Http {
        url: combined,
        reason: e.to_string(),
    })
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::digest::ManifestFormat;
    use crate::store::handler::SilentHandler;

    fn empty_digest() -> ManifestDigest {
        let format = ManifestFormat::Sha256New;
        ManifestDigest::new_for(format, &format.digest_bytes(b""))
    }

    fn store_in(dir: &tempfile::TempDir) -> Store {
        Store::new(dir.path().join("store")).unwrap()
    }

    #[test]
    fn fetch_returns_existing_implementation_without_methods() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();
        store
            .add(&expected, &CancelToken::new(), |builder| {
                builder.add_directory("")
            })
            .unwrap();

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let path = fetcher
            .fetch(&expected, &[], &CancelToken::new())
            .unwrap();

        assert_eq!(store.get_path(&expected), path);
    }

    #[test]
    fn local_recipe_builds_an_empty_implementation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![RetrievalMethod::Recipe(Vec::new())];
        let path = fetcher
            .fetch(&expected, &methods, &CancelToken::new())
            .unwrap();

        assert!(path.is_some());
        assert!(store.contains(&expected));
    }

    #[test]
    fn digest_mismatch_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        // expected digest is for a non-empty tree; the recipe builds an
        // empty one
        let format = ManifestFormat::Sha256New;
        let expected = ManifestDigest::new_for(format, &format.digest_bytes(b"not a manifest"));

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![
            RetrievalMethod::Recipe(Vec::new()),
            RetrievalMethod::Recipe(Vec::new()),
        ];
        let result = fetcher.fetch(&expected, &methods, &CancelToken::new());

        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
        assert!(store.list_temp().unwrap().is_empty());
    }

    #[test]
    fn offline_blocks_network_methods() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();

        let config = Config {
            network_use: crate::store::config::NetworkUse::Offline,
            ..Config::default()
        };
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![RetrievalMethod::DownloadArchive(ArchiveStep {
            href: "http://example.com/a.tar.gz".into(),
            size: None,
            mime_type: None,
            extract: None,
            destination: None,
            start_offset: 0,
        })];
        let result = fetcher.fetch(&expected, &methods, &CancelToken::new());

        assert!(matches!(result, Err(Error::Offline)));
    }

    #[test]
    fn unknown_archive_type_fails_without_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![RetrievalMethod::DownloadArchive(ArchiveStep {
            href: "http://example.com/blob.unknown".into(),
            size: None,
            mime_type: None,
            extract: None,
            destination: None,
            start_offset: 0,
        })];
        let result = fetcher.fetch(&expected, &methods, &CancelToken::new());

        match result {
            Err(Error::UnsupportedKind { kind }) => {
                assert!(kind.contains("http://example.com/blob.unknown"))
            }
            other => panic!("expected UnsupportedKind, got {other:?}"),
        }
    }

    #[test]
    fn external_method_without_installer_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![RetrievalMethod::External(ExternalMethod {
            package: "nano".into(),
            message: None,
        })];
        let result = fetcher.fetch(&expected, &methods, &CancelToken::new());

        assert!(matches!(result, Err(Error::UnsupportedKind { .. })));
    }

    #[test]
    fn copy_from_reuses_a_stored_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        // sibling with one file
        let format = ManifestFormat::Sha256New;
        let mut sibling = crate::store::manifest::Manifest::new(format);
        sibling
            .add_file("payload", &format.digest_bytes(b"abc"), 100, 3, false)
            .unwrap();
        let sibling_digest = sibling.digest_envelope();
        store
            .add(&sibling_digest, &CancelToken::new(), |builder| {
                builder.add_file("payload", &mut "abc".as_bytes(), 100, false)
            })
            .unwrap();

        // target re-roots the sibling's content under sub/
        let mut target = crate::store::manifest::Manifest::new(format);
        target.add_directory("sub").unwrap();
        target
            .add_file("sub/payload", &format.digest_bytes(b"abc"), 100, 3, false)
            .unwrap();
        let target_digest = target.digest_envelope();
        let methods = vec![RetrievalMethod::Recipe(vec![RecipeStep::CopyFrom {
            digest: sibling_digest,
            source: None,
            destination: Some("sub".into()),
        }])];

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let path = fetcher
            .fetch(&target_digest, &methods, &CancelToken::new())
            .unwrap();

        assert!(path.is_some());
        assert!(store.contains(&target_digest));
        assert_eq!(
            b"abc".as_slice(),
            std::fs::read(path.unwrap().join("sub/payload"))
                .unwrap()
                .as_slice()
        );
    }

    #[test]
    fn mirror_url_follows_the_rehosting_scheme() {
        let mirror = Url::parse("https://mirror.example.net/0mirror").unwrap();
        let original = Url::parse("http://example.com/pub/app/app-1.0.tar.gz").unwrap();

        let rewritten = mirror_url(&mirror, &original).unwrap();
        assert_eq!(
            "https://mirror.example.net/0mirror/archive/http/example.com/pub%23app%23app-1.0.tar.gz",
            rewritten.as_str()
        );
    }

    #[test]
    fn loopback_urls_are_detected() {
        assert!(is_loopback(&Url::parse("http://127.0.0.1/x").unwrap()));
        assert!(is_loopback(&Url::parse("http://localhost:8000/x").unwrap()));
        assert!(!is_loopback(&Url::parse("http://example.com/x").unwrap()));
    }

    #[test]
    fn cancelled_fetch_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let expected = empty_digest();
        let cancel = CancelToken::new();
        cancel.cancel();

        let config = Config::default();
        let fetcher = Fetcher::new(&store, &config, &SilentHandler);
        let methods = vec![RetrievalMethod::Recipe(Vec::new())];
        let result = fetcher.fetch(&expected, &methods, &cancel);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(store.list_temp().unwrap().is_empty());
    }
}
