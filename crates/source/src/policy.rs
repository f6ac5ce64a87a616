//! Image signature policy in the `containers-policy.json` shape.
//!
//! Only the requirement types this puller can honour are accepted. Anything
//! that would need signature verification is refused at load time so a policy
//! never silently degrades to "accept".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use oci_distribution::Reference;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("error reading signature policy {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing signature policy: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported signature policy requirement type {0:?}")]
    Unsupported(String),
    #[error("no signature policy configured; provide a policy file or explicitly allow insecure acceptance")]
    NotConfigured,
    #[error("signature policy scope {scope:?} has no requirements")]
    Empty { scope: String },
    #[error("image {reference:?} rejected by signature policy scope {scope:?}")]
    Rejected { reference: String, scope: String },
}

impl PolicyError {
    /// A rejection or an unusable policy will not change by retrying the same pull.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PolicyError::Read { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    InsecureAcceptAnything,
    Reject,
}

#[derive(Debug, Deserialize)]
struct RawRequirement {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    default: Vec<RawRequirement>,
    #[serde(default)]
    transports: BTreeMap<String, BTreeMap<String, Vec<RawRequirement>>>,
}

/// Where the unpacker gets its policy from. There is deliberately no implicit default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    AllowInsecure,
    Unset,
}

impl PolicySource {
    pub fn load(&self) -> Result<Policy, PolicyError> {
        match self {
            PolicySource::File(path) => Policy::load(path),
            PolicySource::AllowInsecure => {
                warn!("no signature policy file configured; accepting any image as explicitly allowed");
                Ok(Policy::insecure_accept_anything())
            }
            PolicySource::Unset => Err(PolicyError::NotConfigured),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    default: Vec<Requirement>,
    /// Scopes for the `docker` transport, keyed by `registry[/namespace...]`.
    docker: BTreeMap<String, Vec<Requirement>>,
}

const DEFAULT_SCOPE: &str = "default";

impl Policy {
    /// `{"default":[{"type":"insecureAcceptAnything"}]}`
    pub fn insecure_accept_anything() -> Self {
        Self { default: vec![Requirement::InsecureAcceptAnything], docker: BTreeMap::new() }
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let raw: RawPolicy = serde_json::from_str(raw)?;
        let default = convert(raw.default)?;
        let mut docker = BTreeMap::new();
        for (transport, scopes) in raw.transports {
            if transport != "docker" {
                continue;
            }
            for (scope, reqs) in scopes {
                docker.insert(scope, convert(reqs)?);
            }
        }
        Ok(Self { default, docker })
    }

    /// Most specific scope first: `registry/repo`, its namespace prefixes, `registry`, then the default.
    fn requirements_for(&self, registry: &str, repository: &str) -> (String, &[Requirement]) {
        let mut scope = format!("{}/{}", registry, repository);
        loop {
            if let Some(reqs) = self.docker.get(&scope) {
                return (scope, reqs);
            }
            match scope.rfind('/') {
                Some(idx) => scope.truncate(idx),
                None => break,
            }
        }
        (DEFAULT_SCOPE.to_string(), &self.default)
    }

    pub fn evaluate(&self, reference: &Reference) -> Result<(), PolicyError> {
        let (scope, reqs) = self.requirements_for(reference.registry(), reference.repository());
        if reqs.is_empty() {
            return Err(PolicyError::Empty { scope });
        }
        for req in reqs {
            if *req == Requirement::Reject {
                return Err(PolicyError::Rejected { reference: reference.whole(), scope });
            }
        }
        Ok(())
    }
}

fn convert(reqs: Vec<RawRequirement>) -> Result<Vec<Requirement>, PolicyError> {
    reqs.into_iter()
        .map(|r| match r.kind.as_str() {
            "insecureAcceptAnything" => Ok(Requirement::InsecureAcceptAnything),
            "reject" => Ok(Requirement::Reject),
            other => Err(PolicyError::Unsupported(other.to_string())),
        })
        .collect()
}
