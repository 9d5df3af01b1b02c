// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Glob based metric selection and modification, configured per plugin.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regex::RegexSet;
use serde::Deserialize;

use crate::errors::AgentError;
use crate::metric::Metric;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub namepass: Vec<String>,
    pub namedrop: Vec<String>,
    pub fieldinclude: Vec<String>,
    pub fieldexclude: Vec<String>,
    pub tagpass: BTreeMap<String, Vec<String>>,
    pub tagdrop: BTreeMap<String, Vec<String>>,
    pub taginclude: Vec<String>,
    pub tagexclude: Vec<String>,
}

/// Compiled form of a [`FilterConfig`]. An empty config compiles to a filter that selects
/// everything and modifies nothing.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    namepass: Option<RegexSet>,
    namedrop: Option<RegexSet>,
    fieldinclude: Option<RegexSet>,
    fieldexclude: Option<RegexSet>,
    tagpass: Vec<(RegexSet, RegexSet)>,
    tagdrop: Vec<(RegexSet, RegexSet)>,
    taginclude: Option<RegexSet>,
    tagexclude: Option<RegexSet>,
}

fn glob_to_regex(glob: &str) -> Result<String, AgentError> {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                if !closed {
                    return Err(AgentError::Config(format!(
                        "unterminated character class in pattern {glob:?}"
                    )));
                }
                re.push('[');
                let class = match class.strip_prefix('!') {
                    Some(rest) => {
                        re.push('^');
                        rest
                    }
                    None => class.as_str(),
                };
                for c in class.chars() {
                    if matches!(c, '\\' | '[' | '&' | '~') {
                        re.push('\\');
                    }
                    re.push(c);
                }
                re.push(']');
            }
            other => {
                let mut buf = [0u8; 4];
                re.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    re.push('$');
    Ok(re)
}

fn compile_globs(globs: &[String]) -> Result<Option<RegexSet>, AgentError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let patterns = globs
        .iter()
        .map(|g| glob_to_regex(g))
        .collect::<Result<Vec<_>, _>>()?;
    RegexSet::new(patterns)
        .map(Some)
        .map_err(|e| AgentError::Config(format!("invalid filter pattern in {globs:?}: {e}")))
}

fn compile_tag_rules(
    rules: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<(RegexSet, RegexSet)>, AgentError> {
    let mut compiled = Vec::with_capacity(rules.len());
    for (key, values) in rules {
        let key = compile_globs(std::slice::from_ref(key))?;
        let values = compile_globs(values)?;
        if let (Some(key), Some(values)) = (key, values) {
            compiled.push((key, values));
        }
    }
    Ok(compiled)
}

fn tags_match(rules: &[(RegexSet, RegexSet)], metric: &Metric) -> bool {
    metric.tags().iter().any(|tag| {
        rules
            .iter()
            .any(|(key, values)| key.is_match(&tag.key) && values.is_match(&tag.value))
    })
}

impl Filter {
    pub fn compile(config: &FilterConfig) -> Result<Self, AgentError> {
        Ok(Self {
            namepass: compile_globs(&config.namepass)?,
            namedrop: compile_globs(&config.namedrop)?,
            fieldinclude: compile_globs(&config.fieldinclude)?,
            fieldexclude: compile_globs(&config.fieldexclude)?,
            tagpass: compile_tag_rules(&config.tagpass)?,
            tagdrop: compile_tag_rules(&config.tagdrop)?,
            taginclude: compile_globs(&config.taginclude)?,
            tagexclude: compile_globs(&config.tagexclude)?,
        })
    }

    /// Whether the name and tag rules let `metric` through.
    #[must_use]
    pub fn select(&self, metric: &Metric) -> bool {
        if let Some(pass) = &self.namepass {
            if !pass.is_match(metric.name()) {
                return false;
            }
        }
        if let Some(drop) = &self.namedrop {
            if drop.is_match(metric.name()) {
                return false;
            }
        }
        if !self.tagpass.is_empty() && !tags_match(&self.tagpass, metric) {
            return false;
        }
        if !self.tagdrop.is_empty() && tags_match(&self.tagdrop, metric) {
            return false;
        }
        true
    }

    /// Removes the fields and tags excluded by the include/exclude rules.
    pub fn modify(&self, metric: &mut Metric) {
        if self.fieldinclude.is_some() || self.fieldexclude.is_some() {
            metric.retain_fields(|field| {
                keep(&self.fieldinclude, &self.fieldexclude, &field.key)
            });
        }
        if self.taginclude.is_some() || self.tagexclude.is_some() {
            metric.retain_tags(|tag| keep(&self.taginclude, &self.tagexclude, &tag.key));
        }
    }
}

fn keep(include: &Option<RegexSet>, exclude: &Option<RegexSet>, key: &str) -> bool {
    include.as_ref().map_or(true, |set| set.is_match(key))
        && !exclude.as_ref().is_some_and(|set| set.is_match(key))
}

/// Shared handle to a processor's filter. The processing task reads it for every metric;
/// configuration can swap it while the pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct FilterHandle(Arc<Mutex<Filter>>);

impl FilterHandle {
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self(Arc::new(Mutex::new(filter)))
    }

    pub fn replace(&self, filter: Filter) {
        *self.lock() = filter;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Filter> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
