//! Build names.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

const PREFIX: &str = "build-";
const HASH_LEN: usize = 12;
/// Kubernetes object names used as DNS labels are capped at 63 characters.
const MAX_LEN: usize = 63;

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Unique name for the thing being built, derived from `(repo_url, ref)`.
///
/// The same pair always yields the same name, and the name is used verbatim
/// as the build pod's name. Two callers building the same pair therefore
/// race on a single cluster object, and the cluster's name uniqueness is what
/// keeps the build from running twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BuildName(String);

impl BuildName {
    pub fn new(repo_url: &str, git_ref: &str) -> Self {
        let digest = Sha256::new()
            .chain_update(repo_url.as_bytes())
            .chain_update([0u8])
            .chain_update(git_ref.as_bytes())
            .finalize();
        let hash = hex::encode(digest);
        let hash = &hash[..HASH_LEN];

        let lowered = repo_url.to_ascii_lowercase();
        let without_scheme = lowered
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&lowered);
        let without_suffix = without_scheme.trim_end_matches('/').trim_end_matches(".git");
        let slug = NON_ALNUM.replace_all(without_suffix, "-");
        let slug = slug.trim_matches('-');

        // Keep the tail of the slug: "org-repo" says more than "github-com".
        let budget = MAX_LEN - PREFIX.len() - HASH_LEN - 1;
        let slug = if slug.len() > budget {
            slug[slug.len() - budget..].trim_start_matches('-')
        } else {
            slug
        };

        if slug.is_empty() {
            Self(format!("{PREFIX}{hash}"))
        } else {
            Self(format!("{PREFIX}{slug}-{hash}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for BuildName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
