//! Audience parsing and matching.
//!
//! An audience spec is either a literal IAP resource identifier or a regular
//! expression wrapped in slashes:
//!
//! ```text
//! /projects/123/apps/my-project                              App Engine
//! /projects/123/global/backendServices/456                   global backend service
//! /projects/123/locations/europe-west1/backendServices/456   regional backend service
//! //projects/123/apps/.*/                                    pattern
//! ```
//!
//! All specs compile into one alternation matched against the whole `aud`
//! claim. Literals are escaped, so `/projects/1/...` never matches
//! `/projects/12/...`.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

/// Errors raised while compiling audience specs.
#[derive(Debug, thiserror::Error)]
pub enum AudienceError {
    /// No specs were given.
    #[error("no audiences configured")]
    Empty,

    /// A literal spec is not a well-formed IAP resource identifier.
    #[error("invalid audience {spec:?}: {reason}")]
    InvalidAudience {
        /// Offending spec.
        spec: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A `/…/` spec is empty or does not compile.
    #[error("invalid audiences regular expression {spec:?}: {reason}")]
    InvalidPattern {
        /// Offending spec.
        spec: String,
        /// Compiler message.
        reason: String,
    },
}

/// The resource an audience identifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudienceKind {
    /// `/projects/{number}/apps/{project_id}`
    AppEngine {
        /// Numeric project number.
        project_number: String,
        /// Project ID.
        project_id: String,
    },
    /// `/projects/{number}/global/backendServices/{id}` or
    /// `/projects/{number}/locations/{location}/backendServices/{id}`
    BackendService {
        /// Numeric project number.
        project_number: String,
        /// Region for regional backend services; `None` for global ones.
        location: Option<String>,
        /// Backend service ID.
        service_id: String,
    },
}

/// A well-formed IAP audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audience {
    raw: String,
    kind: AudienceKind,
}

impl Audience {
    /// Parse a literal audience.
    pub fn parse(spec: &str) -> Result<Self, AudienceError> {
        let invalid = |reason| AudienceError::InvalidAudience {
            spec: spec.to_string(),
            reason,
        };

        let rest = spec
            .strip_prefix("/projects/")
            .ok_or_else(|| invalid("must start with /projects/"))?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || s.chars().any(|c| c.is_whitespace() || c.is_control()))
        {
            return Err(invalid("contains an empty or blank path segment"));
        }

        let kind = match segments.as_slice() {
            [number, "apps", project_id] => AudienceKind::AppEngine {
                project_number: (*number).to_string(),
                project_id: (*project_id).to_string(),
            },
            [number, "global", "backendServices", service_id] => AudienceKind::BackendService {
                project_number: (*number).to_string(),
                location: None,
                service_id: (*service_id).to_string(),
            },
            [number, "locations", location, "backendServices", service_id] => {
                AudienceKind::BackendService {
                    project_number: (*number).to_string(),
                    location: Some((*location).to_string()),
                    service_id: (*service_id).to_string(),
                }
            }
            _ => {
                return Err(invalid(
                    "expected /projects/{number}/apps/{id} or \
                     /projects/{number}/(global|locations/{location})/backendServices/{id}",
                ));
            }
        };

        let project_number = match &kind {
            AudienceKind::AppEngine { project_number, .. }
            | AudienceKind::BackendService { project_number, .. } => project_number,
        };
        if !project_number.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("project number must be numeric"));
        }

        Ok(Self {
            raw: spec.to_string(),
            kind,
        })
    }

    /// The audience string as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed resource.
    #[must_use]
    pub fn kind(&self) -> &AudienceKind {
        &self.kind
    }
}

impl FromStr for Audience {
    type Err = AudienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Compiled audience matcher. Immutable once built.
#[derive(Debug, Clone)]
pub struct AudiencePolicy {
    pattern: Regex,
}

impl AudiencePolicy {
    /// Compile a comma-separated list of specs.
    pub fn parse(list: &str) -> Result<Self, AudienceError> {
        Self::compile(list.split(','))
    }

    /// Compile specs into a single anchored alternation.
    ///
    /// Surrounding whitespace on each spec is ignored.
    pub fn compile<I, S>(specs: I) -> Result<Self, AudienceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fragments = specs
            .into_iter()
            .map(|spec| spec_fragment(spec.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if fragments.is_empty() {
            return Err(AudienceError::Empty);
        }

        let source = format!("^(?:{})$", fragments.join("|"));
        let pattern = Regex::new(&source).map_err(|e| AudienceError::InvalidPattern {
            spec: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Whether `audience` matches any configured spec in full.
    #[must_use]
    pub fn matches(&self, audience: &str) -> bool {
        self.pattern.is_match(audience)
    }

    /// The compiled pattern, for startup logs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Turn one spec into a regex fragment.
fn spec_fragment(spec: &str) -> Result<String, AudienceError> {
    if spec.starts_with('/') && spec.ends_with('/') {
        let inner = spec
            .strip_prefix('/')
            .and_then(|s| s.strip_suffix('/'))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AudienceError::InvalidPattern {
                spec: spec.to_string(),
                reason: "pattern is empty".to_string(),
            })?;
        Regex::new(inner).map_err(|e| AudienceError::InvalidPattern {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(format!("(?:{inner})"));
    }

    let audience = Audience::parse(spec)?;
    Ok(regex::escape(audience.as_str()))
}
