pub use crate::store::builder::{copy_tree_into, Builder, BuilderSink};
pub use crate::store::cancel::CancelToken;
pub use crate::store::config::{Config, NetworkUse};
pub use crate::store::digest::{DigestWriter, ManifestDigest, ManifestFormat};
pub use crate::store::engine::{manifest_from_dir, Store};
pub use crate::store::error::*;
pub use crate::store::extract::{
    extractor_for_mime, is_known_mime, mime_for_url, ArchiveExtractor, ExtractOptions,
};
pub use crate::store::fetch::{ExternalInstaller, Fetcher, RetrievalResolver};
pub use crate::store::handler::{AutoHandler, Handler, SilentHandler};
pub use crate::store::lock::NamedLock;
pub use crate::store::manifest::{Manifest, ManifestElement};
pub use crate::store::retrieval::{
    ranked, ArchiveStep, ExternalMethod, FileStep, RecipeStep, RetrievalMethod,
};

mod builder;
mod cancel;
mod config;
pub mod consts;
mod digest;
mod encoding;
mod engine;
mod error;
mod extract;
mod fetch;
mod fsutil;
mod handler;
mod lock;
mod manifest;
mod retrieval;
