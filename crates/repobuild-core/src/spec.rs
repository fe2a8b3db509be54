//! Per-build configuration.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A number of bytes, parsed from specs like `512M` or `1.5G`.
///
/// Suffixes `K`, `M`, `G` and `T` are powers of 1024. A bare number is a
/// byte count.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || {
            Error::InvalidInput(format!(
                "{:?} is not a valid memory specification; expected a number with optional suffix K, M, G or T",
                s
            ))
        };

        let (number, multiplier) = match s.chars().last() {
            Some('K') => (&s[..s.len() - 1], 1u64 << 10),
            Some('M') => (&s[..s.len() - 1], 1u64 << 20),
            Some('G') => (&s[..s.len() - 1], 1u64 << 30),
            Some('T') => (&s[..s.len() - 1], 1u64 << 40),
            Some(_) => (s, 1),
            None => return Err(invalid()),
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(Self).ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        let bytes = value * multiplier as f64;
        if bytes > u64::MAX as f64 {
            return Err(invalid());
        }
        Ok(Self(bytes as u64))
    }
}

/// Resource reservations and limits for the build pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildResources {
    /// Memory limit for the build, also passed to the build tool.
    pub memory_limit: Option<ByteSize>,
    /// Memory reserved on the node for the build daemon's work.
    pub memory_request: Option<ByteSize>,
    /// CPU request (e.g. "500m" or "1").
    pub cpu_request: Option<String>,
}

/// Credentials handed to the build pod.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildCredentials {
    /// Output of a git credential helper, used when cloning.
    pub git: Option<String>,
    /// Name of a static secret holding a registry config for pushing.
    pub push_secret: Option<String>,
    /// Short-lived registry credentials. Take precedence over `push_secret`.
    pub registry: Option<BTreeMap<String, String>>,
}

impl BuildCredentials {
    /// Whether the built image should be pushed.
    pub fn can_push(&self) -> bool {
        self.push_secret.is_some() || self.registry.is_some()
    }

    /// The static push secret, unless dynamic credentials override it.
    pub fn static_push_secret(&self) -> Option<&str> {
        match self.registry {
            Some(_) => None,
            None => self.push_secret.as_deref(),
        }
    }
}

impl fmt::Debug for BuildCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCredentials")
            .field("git", &self.git.as_ref().map(|_| "<redacted>"))
            .field("push_secret", &self.push_secret)
            .field("registry", &self.registry.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything needed to build one `(repo_url, ref)` into an image.
///
/// Built once through [`BuildSpec::builder`], which validates it, and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Repository to build.
    pub repo_url: String,
    /// Ref of the repository to build.
    pub git_ref: String,
    /// Full name of the image to produce, including the tag.
    pub image_name: String,
    pub resources: BuildResources,
    pub credentials: BuildCredentials,
    /// Extra environment variables for the build container.
    pub extra_env: BTreeMap<String, String>,
    /// Extra arguments passed through to the build tool.
    pub extra_args: Vec<String>,
    /// Text appended to the generated Dockerfile.
    pub appendix: Option<String>,
}

impl BuildSpec {
    pub fn builder(
        repo_url: impl Into<String>,
        git_ref: impl Into<String>,
        image_name: impl Into<String>,
    ) -> BuildSpecBuilder {
        BuildSpecBuilder {
            spec: BuildSpec {
                repo_url: repo_url.into(),
                git_ref: git_ref.into(),
                image_name: image_name.into(),
                resources: BuildResources::default(),
                credentials: BuildCredentials::default(),
                extra_env: BTreeMap::new(),
                extra_args: Vec::new(),
                appendix: None,
            },
        }
    }
}

/// Builder for [`BuildSpec`].
#[derive(Debug, Clone)]
pub struct BuildSpecBuilder {
    spec: BuildSpec,
}

fn non_empty(value: impl Into<String>) -> Option<String> {
    Some(value.into()).filter(|v| !v.is_empty())
}

impl BuildSpecBuilder {
    pub fn memory_limit(mut self, limit: ByteSize) -> Self {
        self.spec.resources.memory_limit = Some(limit).filter(|l| !l.is_zero());
        self
    }

    pub fn memory_request(mut self, request: ByteSize) -> Self {
        self.spec.resources.memory_request = Some(request).filter(|r| !r.is_zero());
        self
    }

    pub fn cpu_request(mut self, request: impl Into<String>) -> Self {
        self.spec.resources.cpu_request = non_empty(request);
        self
    }

    pub fn git_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.spec.credentials.git = non_empty(credentials);
        self
    }

    pub fn push_secret(mut self, secret: impl Into<String>) -> Self {
        self.spec.credentials.push_secret = non_empty(secret);
        self
    }

    pub fn registry_credentials(mut self, credentials: BTreeMap<String, String>) -> Self {
        self.spec.credentials.registry = Some(credentials).filter(|c| !c.is_empty());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spec
            .extra_env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.extra_args.push(arg.into());
        self
    }

    pub fn appendix(mut self, appendix: impl Into<String>) -> Self {
        self.spec.appendix = non_empty(appendix);
        self
    }

    /// Validate and produce the spec.
    pub fn build(self) -> Result<BuildSpec> {
        let spec = self.spec;
        if spec.repo_url.trim().is_empty() {
            return Err(Error::InvalidInput("repo_url must not be empty".to_string()));
        }
        if spec.repo_url.starts_with('-') {
            return Err(Error::InvalidInput(format!(
                "repo_url {:?} would be parsed as an option",
                spec.repo_url
            )));
        }
        if spec.git_ref.trim().is_empty() {
            return Err(Error::InvalidInput("ref must not be empty".to_string()));
        }
        if spec.image_name.trim().is_empty() {
            return Err(Error::InvalidInput("image_name must not be empty".to_string()));
        }
        if let Some(key) = spec.extra_env.keys().find(|k| k.is_empty()) {
            return Err(Error::InvalidInput(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
        Ok(spec)
    }
}
