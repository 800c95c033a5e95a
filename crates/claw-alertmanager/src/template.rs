//! Message templates.
//!
//! Templates are Handlebars text rendered against [`TemplateData`]:
//!
//! - `{{ status }}`, `{{ receiver }}`, `{{ group_key }}`, `{{ num_firing }}`,
//!   `{{ num_resolved }}`
//! - `{{ group_labels.NAME }}`, `{{ common_labels.NAME }}`,
//!   `{{ common_annotations.NAME }}` (a missing name renders empty)
//! - `{{> NAME }}` includes another named template
//! - the built-in helpers (`#if`, `#unless`, `#each`, `#with`, `lookup`,
//!   comparisons)
//!
//! Every template is compiled and checked when the set is built, so an
//! unknown placeholder, a missing include, an include cycle or an include
//! chain deeper than [`MAX_INCLUDE_DEPTH`] is a configuration error rather
//! than a delivery error.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use handlebars::template::{Parameter, Template, TemplateElement};
use handlebars::{Handlebars, no_escape};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{AlertError, Result};
use crate::types::{Alert, AlertState, LabelSet};

static TEMPLATE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap_or_else(|_| unreachable!()));

/// Maximum include nesting accepted in a template set.
pub const MAX_INCLUDE_DEPTH: usize = 16;

const PLACEHOLDERS: &[&str] = &["status", "receiver", "group_key", "num_firing", "num_resolved"];

const LABEL_SCOPES: &[&str] = &["group_labels", "common_labels", "common_annotations"];

const HELPERS: &[&str] = &[
    "if", "unless", "each", "with", "lookup", "eq", "ne", "gt", "gte", "lt", "lte", "and", "or",
    "not", "len",
];

// Helpers whose body renders against a different context.
const SCOPED_HELPERS: &[&str] = &["each", "with"];

/// Values available to a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateData {
    /// `firing` if any alert is firing, else `resolved`.
    pub status: AlertState,
    /// Receiver name.
    pub receiver: String,
    /// Aggregation group key.
    pub group_key: String,
    /// The group's label values.
    pub group_labels: LabelSet,
    /// Labels shared by every alert.
    pub common_labels: LabelSet,
    /// Annotations shared by every alert.
    pub common_annotations: BTreeMap<String, String>,
    /// Number of firing alerts.
    pub num_firing: usize,
    /// Number of resolved alerts.
    pub num_resolved: usize,
}

impl TemplateData {
    /// Builds template data for a notification about `alerts`.
    #[must_use]
    pub fn new(
        receiver: impl Into<String>,
        group_key: impl Into<String>,
        group_labels: LabelSet,
        alerts: &[Alert],
        now: DateTime<Utc>,
    ) -> Self {
        let num_resolved = alerts.iter().filter(|a| a.resolved_at(now)).count();
        let num_firing = alerts.len() - num_resolved;
        Self {
            status: if num_firing > 0 {
                AlertState::Firing
            } else {
                AlertState::Resolved
            },
            receiver: receiver.into(),
            group_key: group_key.into(),
            group_labels,
            common_labels: common(alerts, |a| &a.labels),
            common_annotations: common(alerts, |a| &a.annotations),
            num_firing,
            num_resolved,
        }
    }
}

fn common<F>(alerts: &[Alert], map: F) -> BTreeMap<String, String>
where
    F: Fn(&Alert) -> &BTreeMap<String, String>,
{
    let Some((first, rest)) = alerts.split_first() else {
        return BTreeMap::new();
    };
    map(first)
        .iter()
        .filter(|(k, v)| rest.iter().all(|a| map(a).get(*k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn template_error(name: &str, reason: impl ToString) -> AlertError {
    AlertError::Template {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn known_placeholder(path: &str) -> bool {
    if PLACEHOLDERS.contains(&path) || LABEL_SCOPES.contains(&path) {
        return true;
    }
    path.split_once('.')
        .is_some_and(|(scope, name)| LABEL_SCOPES.contains(&scope) && !name.is_empty())
}

fn check_param(param: &Parameter) -> std::result::Result<(), String> {
    match param.as_name() {
        Some(name) if !known_placeholder(name) => Err(format!("unknown placeholder '{name}'")),
        _ => Ok(()),
    }
}

/// Walks a compiled template, checking placeholder names in the root
/// context and collecting the names of included templates.
fn scan(template: &Template, checked: bool, includes: &mut BTreeSet<String>) -> std::result::Result<(), String> {
    for element in &template.elements {
        match element {
            TemplateElement::Expression(expr) | TemplateElement::HtmlExpression(expr) => {
                let name = expr.name.as_name().ok_or("subexpressions are not supported")?;
                if expr.params.is_empty() {
                    if checked && !known_placeholder(name) {
                        return Err(format!("unknown placeholder '{name}'"));
                    }
                } else if !HELPERS.contains(&name) {
                    return Err(format!("unknown helper '{name}'"));
                } else if checked {
                    expr.params.iter().try_for_each(check_param)?;
                }
            }
            TemplateElement::HelperBlock(block) => {
                let name = block.name.as_name().ok_or("subexpressions are not supported")?;
                if !HELPERS.contains(&name) {
                    return Err(format!("unknown helper '{name}'"));
                }
                if checked {
                    block.params.iter().try_for_each(check_param)?;
                }
                let inner = checked && !SCOPED_HELPERS.contains(&name);
                for body in block.template.iter().chain(block.inverse.iter()) {
                    scan(body, inner, includes)?;
                }
            }
            TemplateElement::PartialExpression(partial) | TemplateElement::PartialBlock(partial) => {
                let name = partial.name.as_name().ok_or("dynamic includes are not supported")?;
                includes.insert(name.to_string());
                if let Some(body) = &partial.template {
                    scan(body, checked, includes)?;
                }
            }
            TemplateElement::DecoratorExpression(_) | TemplateElement::DecoratorBlock(_) => {
                return Err("decorators are not supported".to_string());
            }
            _ => {}
        }
    }
    Ok(())
}

/// Compiles `text` and returns the templates it includes.
fn compile(name: &str, text: &str) -> Result<(Template, BTreeSet<String>)> {
    let template = Template::compile(text).map_err(|e| template_error(name, e))?;
    let mut includes = BTreeSet::new();
    scan(&template, true, &mut includes).map_err(|reason| template_error(name, reason))?;
    Ok((template, includes))
}

/// Computes the include depth of `name`, memoizing finished templates so
/// shared includes are walked once.
fn include_depth(
    name: &str,
    graph: &BTreeMap<String, BTreeSet<String>>,
    depths: &mut BTreeMap<String, usize>,
    visiting: &mut BTreeSet<String>,
) -> Result<usize> {
    if let Some(depth) = depths.get(name) {
        return Ok(*depth);
    }
    if !visiting.insert(name.to_string()) {
        return Err(template_error(name, "include cycle"));
    }

    let mut depth = 0;
    for target in graph.get(name).into_iter().flatten() {
        if !graph.contains_key(target) {
            return Err(template_error(name, format!("includes undefined template '{target}'")));
        }
        depth = depth.max(include_depth(target, graph, depths, visiting)? + 1);
    }
    visiting.remove(name);

    if depth > MAX_INCLUDE_DEPTH {
        return Err(template_error(
            name,
            format!("includes nested deeper than {MAX_INCLUDE_DEPTH} levels"),
        ));
    }
    depths.insert(name.to_string(), depth);
    Ok(depth)
}

fn registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(no_escape);
    registry
}

/// A validated set of named templates backed by one Handlebars registry.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: BTreeMap<String, String>,
    depths: BTreeMap<String, usize>,
    registry: Handlebars<'static>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            templates: BTreeMap::new(),
            depths: BTreeMap::new(),
            registry: registry(),
        }
    }
}

impl TemplateSet {
    /// Builds and validates a template set.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` for an invalid name, a parse error, an
    /// unknown placeholder or helper, an include of a missing template, an
    /// include cycle, or includes nested deeper than [`MAX_INCLUDE_DEPTH`].
    pub fn new(templates: BTreeMap<String, String>) -> Result<Self> {
        let mut registry = registry();
        let mut graph = BTreeMap::new();
        for (name, text) in &templates {
            if !TEMPLATE_NAME.is_match(name) {
                return Err(template_error(
                    name,
                    "template names may only contain letters, digits, '_', '-' and '.'",
                ));
            }
            let (compiled, includes) = compile(name, text)?;
            registry.register_template(name, compiled);
            graph.insert(name.clone(), includes);
        }

        let mut depths = BTreeMap::new();
        for name in graph.keys() {
            include_depth(name, &graph, &mut depths, &mut BTreeSet::new())?;
        }

        Ok(Self {
            templates,
            depths,
            registry,
        })
    }

    /// Returns an empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the raw templates.
    #[must_use]
    pub const fn templates(&self) -> &BTreeMap<String, String> {
        &self.templates
    }

    /// Checks an inline template against this set.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` for a parse error, an unknown
    /// placeholder, an include of a missing template, or an include that
    /// would nest too deeply.
    pub fn check(&self, name: &str, text: &str) -> Result<()> {
        let (_, includes) = compile(name, text)?;
        for target in &includes {
            let Some(depth) = self.depths.get(target) else {
                return Err(template_error(name, format!("includes undefined template '{target}'")));
            };
            if depth + 1 > MAX_INCLUDE_DEPTH {
                return Err(template_error(
                    name,
                    format!("includes nested deeper than {MAX_INCLUDE_DEPTH} levels"),
                ));
            }
        }
        Ok(())
    }

    /// Renders a named template.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if the template does not exist or
    /// fails to render.
    pub fn render(&self, name: &str, data: &TemplateData) -> Result<String> {
        if !self.registry.has_template(name) {
            return Err(template_error(name, "template not defined"));
        }
        self.registry.render(name, data).map_err(|e| template_error(name, e))
    }

    /// Renders an inline template.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if the text fails to parse or render.
    pub fn render_text(&self, text: &str, data: &TemplateData) -> Result<String> {
        self.registry
            .render_template(text, data)
            .map_err(|e| template_error("inline", e))
    }
}
