//! A content-addressed implementation store: packaged software trees are
//! admitted under the digest of their canonical manifest, verified,
//! deduplicated, and served back by digest.

pub mod store;
