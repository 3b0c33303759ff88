use once_cell::sync::Lazy;
use regex::Regex;

/// Matches in-progress temp directories owned by the store.
pub static TEMP_DIR_MATCHER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0install-(extract|remove)-").unwrap());

/// Matches implementation identifiers of every known format.
pub static IDENTIFIER_MATCHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(sha1new|sha256new|sha256|sha1)([=_])([a-fA-F0-9A-Z2-7]+)$").unwrap()
});

pub const EXTRACT_TEMP_PREFIX: &str = "0install-extract-";
pub const REMOVE_TEMP_PREFIX: &str = "0install-remove-";
pub const FETCHER_LOCK_PREFIX: &str = "0install-fetcher-";
pub const LOCK_DIR: &str = ".locks";

pub const MANIFEST_FILE: &str = ".manifest";
/// Legacy flag files rejected alongside the manifest name.
pub const XBIT_FILE: &str = ".xbit";
pub const SYMLINK_FILE: &str = ".symlink";

pub const BUF_SIZE: usize = 8 * 1024;

/// Interval at which blocking waits re-check cancellation.
pub const CANCEL_POLL_MILLIS: u64 = 100;

/// Default timeout for probing remote copies.
pub const DISCOVERY_TIMEOUT_SECS: u64 = 2;

// Archive MIME types
pub const MIME_ZIP: &str = "application/zip";
pub const MIME_TAR: &str = "application/x-tar";
pub const MIME_TGZ: &str = "application/x-compressed-tar";
pub const MIME_TBZ: &str = "application/x-bzip-compressed-tar";
pub const MIME_TXZ: &str = "application/x-xz-compressed-tar";
pub const MIME_TLZMA: &str = "application/x-lzma-compressed-tar";
pub const MIME_7Z: &str = "application/x-7z-compressed";
pub const MIME_RPM: &str = "application/x-rpm";
pub const MIME_CAB: &str = "application/vnd.ms-cab-compressed";
pub const MIME_MSI: &str = "application/x-msi";
pub const MIME_DEB: &str = "application/x-deb";

/// Extension → MIME table used to infer archive types from URLs. Longer
/// extensions are listed first so `.tar.gz` wins over `.gz`-less lookups.
pub const EXTENSION_MIME_TYPES: [(&str, &str); 14] = [
    (".tar.bz2", MIME_TBZ),
    (".tar.gz", MIME_TGZ),
    (".tar.lzma", MIME_TLZMA),
    (".tar.xz", MIME_TXZ),
    (".tbz2", MIME_TBZ),
    (".tgz", MIME_TGZ),
    (".txz", MIME_TXZ),
    (".tar", MIME_TAR),
    (".zip", MIME_ZIP),
    (".7z", MIME_7Z),
    (".rpm", MIME_RPM),
    (".cab", MIME_CAB),
    (".msi", MIME_MSI),
    (".deb", MIME_DEB),
];
