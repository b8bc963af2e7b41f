//! Path templates: `/parents/{pid}/items/{iid}` compiled once at
//! registration time into a segment matcher supporting both full-path and
//! path-prefix evaluation.

use serde_json::Value;

use manifold_core::error::DefinitionError;
use manifold_core::state::Params;

/// Errors from reverse URL generation.
#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("no route named {0:?}")]
    UnknownRoute(String),
    #[error("missing parameter {0:?}")]
    MissingParameter(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A route template compiled at registration time; immutable thereafter.
///
/// Prefix matching always stops at a segment boundary, so `/parents/{pid}`
/// leaves `/child` unmatched for `/parents/42/child` and rejects
/// `/parents/42child` outright.
#[derive(Clone, Debug)]
pub struct RouteTemplate {
    path: String,
    segments: Vec<Segment>,
}

/// Normalize a path: single leading slash, no trailing slash, `""` → `/`.
pub(crate) fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl RouteTemplate {
    /// Parse and validate a template. Empty parameter names, unbalanced
    /// braces, and duplicate parameter names are definition errors.
    pub fn parse(path: &str) -> Result<Self, DefinitionError> {
        let canonical = canonical_path(path);
        let mut segments = Vec::new();
        let mut seen_params: Vec<String> = Vec::new();

        for part in canonical.split('/').filter(|s| !s.is_empty()) {
            if part.starts_with('{') && part.ends_with('}') {
                let name = &part[1..part.len() - 1];
                if name.is_empty() {
                    return Err(DefinitionError::MalformedTemplate {
                        path: canonical.clone(),
                        reason: "empty parameter name".to_string(),
                    });
                }
                if name.contains('{') || name.contains('}') {
                    return Err(DefinitionError::MalformedTemplate {
                        path: canonical.clone(),
                        reason: format!("nested braces in parameter {name:?}"),
                    });
                }
                if seen_params.iter().any(|p| p == name) {
                    return Err(DefinitionError::DuplicateParameter {
                        path: canonical.clone(),
                        name: name.to_string(),
                    });
                }
                seen_params.push(name.to_string());
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains('{') || part.contains('}') {
                return Err(DefinitionError::MalformedTemplate {
                    path: canonical.clone(),
                    reason: format!("unbalanced braces in segment {part:?}"),
                });
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            path: canonical,
            segments,
        })
    }

    /// The canonical template path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Parameter names in template order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match the entire path against this template.
    pub fn match_full(&self, path: &str) -> Option<Params> {
        let parts: Vec<&str> = split_path(path);
        if parts.len() != self.segments.len() {
            return None;
        }
        self.capture(&parts)
    }

    /// Match a prefix of `path` at a segment boundary. Returns the captures
    /// and the unmatched remainder (`""` when fully consumed, otherwise a
    /// `/`-prefixed suffix).
    pub fn match_prefix(&self, path: &str) -> Option<(Params, String)> {
        let parts: Vec<&str> = split_path(path);
        if parts.len() < self.segments.len() {
            return None;
        }
        let params = self.capture(&parts[..self.segments.len()])?;
        let rest = &parts[self.segments.len()..];
        let remainder = if rest.is_empty() {
            String::new()
        } else {
            format!("/{}", rest.join("/"))
        };
        Some((params, remainder))
    }

    fn capture(&self, parts: &[&str]) -> Option<Params> {
        let mut params = Params::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), Value::String((*part).to_string()));
                }
            }
        }
        Some(params)
    }

    /// Fill parameters into the template (reverse routing).
    pub fn format(&self, params: &Params) -> Result<String, UrlError> {
        if self.segments.is_empty() {
            return Ok("/".to_string());
        }
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| UrlError::MissingParameter(name.clone()))?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
