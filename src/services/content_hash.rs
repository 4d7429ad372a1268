//! Content digests computed while an artifact is assembled.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which value gets registered as an artifact's content hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentHashMode {
    /// The value the client supplied, unverified.
    #[default]
    Client,
    /// Hex SHA-256 of the assembled bytes.
    Sha256,
    /// Hex MD5 of the assembled bytes, for clients that hash with MD5.
    Md5,
}

impl ContentHashMode {
    /// Whether the registered hash is computed from the assembled bytes.
    /// Computed digests are lowercase hex.
    pub fn computes_digest(self) -> bool {
        !matches!(self, ContentHashMode::Client)
    }
}

/// Incremental hasher matching a [`ContentHashMode`].
pub enum ContentHasher {
    Sha256(Sha256),
    Md5(md5::Context),
    Passthrough,
}

impl ContentHasher {
    pub fn for_mode(mode: ContentHashMode) -> Self {
        match mode {
            ContentHashMode::Sha256 => ContentHasher::Sha256(Sha256::new()),
            ContentHashMode::Md5 => ContentHasher::Md5(md5::Context::new()),
            ContentHashMode::Client => ContentHasher::Passthrough,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            ContentHasher::Sha256(hasher) => hasher.update(bytes),
            ContentHasher::Md5(ctx) => ctx.consume(bytes),
            ContentHasher::Passthrough => {}
        }
    }

    /// Lowercase hex digest, or `None` in passthrough mode.
    pub fn finish(self) -> Option<String> {
        match self {
            ContentHasher::Sha256(hasher) => Some(format!("{:x}", hasher.finalize())),
            ContentHasher::Md5(ctx) => Some(format!("{:x}", ctx.compute())),
            ContentHasher::Passthrough => None,
        }
    }
}
