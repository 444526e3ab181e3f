//! `{namespace.key}` substitution for stage commands.
//!
//! A placeholder is a brace pair around `namespace.key`, where the
//! namespace is a stage name or `self`. Braces around anything else (a
//! shell `${VAR}`, JSON) are left alone.

use crate::core::StageOutput;
use crate::errors::{TemplateError, UndeclaredDependencyError};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Namespace for a stage's own outputs.
pub const SELF_NAMESPACE: &str = "self";

/// A placeholder found in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder<'a> {
    /// Stage name or `self`.
    pub namespace: &'a str,
    /// Output key (may be empty for malformed placeholders).
    pub key: &'a str,
    start: usize,
    end: usize,
}

impl Placeholder<'_> {
    /// The placeholder text without braces.
    #[must_use]
    pub fn text(&self) -> String {
        format!("{}.{}", self.namespace, self.key)
    }
}

/// `{namespace.key}`; the key may be empty so it can be reported as malformed.
#[allow(clippy::expect_used)]
static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_-]+)\.([^\s{}]*)\}").expect("constant regex pattern is valid")
});

/// Returns the placeholders in `template`, in order.
#[must_use]
pub fn placeholders(template: &str) -> Vec<Placeholder<'_>> {
    PLACEHOLDER_PATTERN
        .captures_iter(template)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Placeholder {
                namespace: caps.get(1)?.as_str(),
                key: caps.get(2)?.as_str(),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Stage names referenced by `template` (excluding `self`).
#[must_use]
pub fn referenced_stages(template: &str) -> BTreeSet<&str> {
    placeholders(template)
        .into_iter()
        .map(|p| p.namespace)
        .filter(|ns| *ns != SELF_NAMESPACE)
        .collect()
}

/// What a stage's templates may read.
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    stage: &'a str,
    dependencies: &'a BTreeSet<String>,
    upstream: &'a BTreeMap<String, StageOutput>,
    own: Option<&'a StageOutput>,
}

impl<'a> TemplateScope<'a> {
    /// Creates a scope over the outputs collected so far.
    #[must_use]
    pub fn new(
        stage: &'a str,
        dependencies: &'a BTreeSet<String>,
        upstream: &'a BTreeMap<String, StageOutput>,
    ) -> Self {
        Self {
            stage,
            dependencies,
            upstream,
            own: None,
        }
    }

    /// Makes the stage's own outputs readable as `{self.key}`.
    #[must_use]
    pub fn with_own(mut self, own: &'a StageOutput) -> Self {
        self.own = Some(own);
        self
    }

    /// Substitutes every placeholder in `template`.
    ///
    /// # Errors
    ///
    /// Fails on references to undeclared dependencies, missing values and
    /// placeholders without a key.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;

        for placeholder in placeholders(template) {
            rendered.push_str(&template[last..placeholder.start]);
            rendered.push_str(self.lookup(&placeholder)?);
            last = placeholder.end;
        }
        rendered.push_str(&template[last..]);

        Ok(rendered)
    }

    fn lookup(&self, placeholder: &Placeholder<'_>) -> Result<&'a str, TemplateError> {
        if placeholder.key.is_empty() {
            return Err(TemplateError::Malformed {
                stage: self.stage.to_string(),
                placeholder: placeholder.text(),
            });
        }

        let source = if placeholder.namespace == SELF_NAMESPACE {
            self.own
        } else {
            if !self.dependencies.contains(placeholder.namespace) {
                return Err(UndeclaredDependencyError::new(self.stage, placeholder.namespace).into());
            }
            self.upstream.get(placeholder.namespace)
        };

        source
            .and_then(|output| output.get(placeholder.key))
            .ok_or_else(|| TemplateError::MissingValue {
                stage: self.stage.to_string(),
                placeholder: placeholder.text(),
            })
    }
}
