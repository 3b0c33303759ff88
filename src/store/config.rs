use strum_macros::{Display, EnumString};
use url::Url;

/// How much network access operations may use. `Offline` disables remote
/// downloads entirely; fetch attempts that need the network then fail
/// with `Offline`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum NetworkUse {
    Full,
    Minimal,
    Offline,
}

/// Configuration consumed by the store and fetcher.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root URL of a mirror that rehosts archives; no mirror fallback
    /// when absent.
    pub feed_mirror: Option<Url>,
    pub max_parallel_downloads: usize,
    pub network_use: NetworkUse,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_mirror: None,
            max_parallel_downloads: 2,
            network_use: NetworkUse::Full,
        }
    }
}

impl Config {
    pub fn offline(&self) -> bool {
        self.network_use == NetworkUse::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn defaults_match_the_contract() {
        let config = Config::default();
        assert!(config.feed_mirror.is_none());
        assert_eq!(2, config.max_parallel_downloads);
        assert_eq!(NetworkUse::Full, config.network_use);
    }

    #[test]
    fn network_use_parses_lowercase_names() {
        assert_eq!(NetworkUse::Offline, NetworkUse::from_str("offline").unwrap());
        assert_eq!(NetworkUse::Full, NetworkUse::from_str("full").unwrap());
        assert!(NetworkUse::from_str("sometimes").is_err());
    }
}
