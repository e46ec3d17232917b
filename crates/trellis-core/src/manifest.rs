//! Plugin manifests and the dependency declaration grammar.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced while validating a manifest or parsing a dependency
/// declaration. Discovery turns these into failed plugin records
/// instead of aborting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("plugin identifier must not be empty")]
    EmptyIdentifier,
    #[error("plugin identifier '{identifier}' contains invalid characters")]
    InvalidIdentifier { identifier: String },
    #[error("plugin '{identifier}' declares an empty version")]
    EmptyVersion { identifier: String },
    #[error("invalid dependency declaration '{declaration}': {reason}")]
    Dependency {
        declaration: String,
        reason: String,
    },
}

/// Whether a plugin contributes user-facing surface or only exists for
/// other plugins to depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Feature,
    Library,
}

/// Comparison operator in a dependency declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Comparator {
    fn matches(self, ordering: Ordering) -> bool {
        match self {
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ge => ordering != Ordering::Less,
            Comparator::Le => ordering != Ordering::Greater,
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Lt => ordering == Ordering::Less,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::Eq => "==",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
        };
        f.write_str(symbol)
    }
}

/// Splits a version string into its leading integer segments.
///
/// Segments are separated by `.` or `-`; parsing stops at the first
/// non-numeric segment, so `1.2.0-beta` compares as `[1, 2, 0]`.
fn version_parts(version: &str) -> Vec<u64> {
    let mut parts = Vec::new();
    for segment in version.split(['.', '-']) {
        match segment.parse::<u64>() {
            Ok(number) => parts.push(number),
            Err(_) => break,
        }
    }
    parts
}

/// Compares two version strings numerically, zero-padding the shorter
/// side so `1.2` and `1.2.0` are equal.
pub fn compare_versions(current: &str, expected: &str) -> Ordering {
    let mut left = version_parts(current);
    let mut right = version_parts(expected);
    let width = left.len().max(right.len());
    left.resize(width, 0);
    right.resize(width, 0);
    left.cmp(&right)
}

/// One parsed dependency declaration: a plugin identifier with an
/// optional version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub identifier: String,
    #[serde(skip)]
    pub comparator: Option<Comparator>,
    pub version: Option<String>,
}

impl DependencySpec {
    /// Parses a declaration of the form `name` or `name <cmp> version`,
    /// where `<cmp>` is one of `==`, `>=`, `<=`, `>`, `<`. Whitespace
    /// around the operator is ignored.
    pub fn parse(declaration: &str) -> Result<Self, ManifestError> {
        let trimmed = declaration.trim();
        if trimmed.is_empty() {
            return Err(ManifestError::Dependency {
                declaration: declaration.to_string(),
                reason: "declaration is empty".to_string(),
            });
        }

        let identifier: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            .collect();
        if identifier.is_empty() {
            return Err(ManifestError::Dependency {
                declaration: declaration.to_string(),
                reason: "missing plugin identifier".to_string(),
            });
        }

        let rest = trimmed[identifier.len()..].trim_start();
        if rest.is_empty() {
            return Ok(Self {
                identifier,
                comparator: None,
                version: None,
            });
        }

        let (comparator, rest) = if let Some(tail) = rest.strip_prefix("==") {
            (Comparator::Eq, tail)
        } else if let Some(tail) = rest.strip_prefix(">=") {
            (Comparator::Ge, tail)
        } else if let Some(tail) = rest.strip_prefix("<=") {
            (Comparator::Le, tail)
        } else if let Some(tail) = rest.strip_prefix('>') {
            (Comparator::Gt, tail)
        } else if let Some(tail) = rest.strip_prefix('<') {
            (Comparator::Lt, tail)
        } else {
            return Err(ManifestError::Dependency {
                declaration: declaration.to_string(),
                reason: format!("unrecognized version constraint '{rest}'"),
            });
        };

        let version = rest.trim();
        if version.is_empty() {
            return Err(ManifestError::Dependency {
                declaration: declaration.to_string(),
                reason: "constraint is missing a version".to_string(),
            });
        }
        if !version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(ManifestError::Dependency {
                declaration: declaration.to_string(),
                reason: format!("invalid version '{version}'"),
            });
        }

        Ok(Self {
            identifier,
            comparator: Some(comparator),
            version: Some(version.to_string()),
        })
    }

    /// Checks an installed version against the constraint. A bare
    /// declaration is satisfied by any installed version.
    pub fn is_satisfied_by(&self, installed: Option<&str>) -> bool {
        let Some(installed) = installed else {
            return false;
        };
        match (self.comparator, self.version.as_deref()) {
            (Some(comparator), Some(expected)) => {
                comparator.matches(compare_versions(installed, expected))
            }
            _ => true,
        }
    }

    /// Rendering used in dependency diagnostics, e.g. `a >= 1.2.0`.
    pub fn describe(&self) -> String {
        match (self.comparator, self.version.as_deref()) {
            (Some(comparator), Some(version)) => {
                format!("{} {} {}", self.identifier, comparator, version)
            }
            _ => self.identifier.clone(),
        }
    }
}

/// Static description a plugin publishes about itself.
///
/// Dependencies are kept as raw declarations and parsed on demand so a
/// malformed declaration surfaces as a discovery failure rather than a
/// construction panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub identifier: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub kind: PluginKind,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginManifest {
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            homepage: None,
            kind: PluginKind::default(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_kind(mut self, kind: PluginKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn with_dependency(mut self, declaration: impl Into<String>) -> Self {
        self.dependencies.push(declaration.into());
        self
    }

    /// Structural validation: identifier shape and a non-empty version.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.identifier.trim().is_empty() {
            return Err(ManifestError::EmptyIdentifier);
        }
        if !self
            .identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ManifestError::InvalidIdentifier {
                identifier: self.identifier.clone(),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::EmptyVersion {
                identifier: self.identifier.clone(),
            });
        }
        Ok(())
    }

    /// Parses every dependency declaration, failing on the first
    /// malformed one.
    pub fn dependency_specs(&self) -> Result<Vec<DependencySpec>, ManifestError> {
        self.dependencies
            .iter()
            .map(|declaration| DependencySpec::parse(declaration))
            .collect()
    }
}
