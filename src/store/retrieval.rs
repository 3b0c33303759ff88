use crate::store::digest::ManifestDigest;

/// A downloadable archive, unpacked into the tree through an extractor
/// chosen by MIME type.
#[derive(Debug, Clone)]
pub struct ArchiveStep {
    pub href: String,
    /// Declared download size, used for ranking.
    pub size: Option<u64>,
    /// Explicit MIME type; inferred from the URL when absent.
    pub mime_type: Option<String>,
    /// Only entries under this archive sub-path are emitted, with the
    /// prefix stripped.
    pub extract: Option<String>,
    /// Entries are re-rooted under this tree path.
    pub destination: Option<String>,
    /// Bytes skipped before format parsing begins.
    pub start_offset: u64,
}

/// A downloadable single file, stored under `destination` with a fixed
/// epoch mtime and no executable bit.
#[derive(Debug, Clone)]
pub struct FileStep {
    pub href: String,
    pub size: Option<u64>,
    pub destination: String,
}

/// One step of a recipe.
#[derive(Debug, Clone)]
pub enum RecipeStep {
    DownloadArchive(ArchiveStep),
    DownloadFile(FileStep),
    Remove {
        path: String,
    },
    Rename {
        source: String,
        destination: String,
    },
    /// Copies a sub-path of a sibling implementation, resolved through
    /// the store by digest, into the current tree.
    CopyFrom {
        digest: ManifestDigest,
        source: Option<String>,
        destination: Option<String>,
    },
}

impl RecipeStep {
    pub fn kind(&self) -> &'static str {
        match self {
            RecipeStep::DownloadArchive(_) => "archive",
            RecipeStep::DownloadFile(_) => "file",
            RecipeStep::Remove { .. } => "remove",
            RecipeStep::Rename { .. } => "rename",
            RecipeStep::CopyFrom { .. } => "copy-from",
        }
    }
}

/// A native package-manager installation that bypasses the store.
#[derive(Debug, Clone)]
pub struct ExternalMethod {
    pub package: String,
    /// Question put to the handler before installing; no question means
    /// no confirmation is required.
    pub message: Option<String>,
}

/// An instruction for obtaining an implementation.
#[derive(Debug, Clone)]
pub enum RetrievalMethod {
    DownloadArchive(ArchiveStep),
    DownloadFile(FileStep),
    Recipe(Vec<RecipeStep>),
    External(ExternalMethod),
}

impl RetrievalMethod {
    pub fn needs_network(&self) -> bool {
        match self {
            RetrievalMethod::DownloadArchive(_) | RetrievalMethod::DownloadFile(_) => true,
            RetrievalMethod::Recipe(steps) => steps.iter().any(|step| {
                matches!(
                    step,
                    RecipeStep::DownloadArchive(_) | RecipeStep::DownloadFile(_)
                )
            }),
            RetrievalMethod::External(_) => true,
        }
    }

    /// Sort key implementing the ranking order: downloads before
    /// recipes, smaller declared size first among downloads, fewer steps
    /// first among recipes. `Vec::sort_by_key` is stable, so original
    /// order breaks ties.
    fn rank(&self) -> (u8, u64) {
        match self {
            RetrievalMethod::DownloadArchive(step) => (0, step.size.unwrap_or(u64::MAX)),
            RetrievalMethod::DownloadFile(step) => (0, step.size.unwrap_or(u64::MAX)),
            RetrievalMethod::Recipe(steps) => (1, steps.len() as u64),
            RetrievalMethod::External(_) => (2, 0),
        }
    }
}

/// Orders retrieval methods from cheapest to most expensive.
pub fn ranked(methods: &[RetrievalMethod]) -> Vec<&RetrievalMethod> {
    let mut ordered: Vec<&RetrievalMethod> = methods.iter().collect();
    ordered.sort_by_key(|method| method.rank());
    ordered
}
