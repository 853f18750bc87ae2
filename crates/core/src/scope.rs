//! Rendering scopes: which scripts a tab needs and which function renders.
//!
//! A scope describes one rendering target (a charting library, a diagram
//! library). Before a job can be invoked its tab must have run every
//! script of the job's scope, in order; the job is then rendered by
//! calling `kaleido_scopes.<name>(figure, ...extra_args)` in the page.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::error::CoreError;

/// Maximum length of a scope name.
const MAX_NAME_LEN: usize = 64;

/// Name of the built-in plotly scope.
pub const PLOTLY: &str = "plotly";

/// Name of the built-in mermaid scope.
pub const MERMAID: &str = "mermaid";

/// Resolves a scope by name.
///
/// The dispatch core only ever sees scopes through this trait, so the
/// set of available scopes is decided by whoever builds the provider.
pub trait ScopeProvider: Send + Sync {
    fn scope(&self, name: &str) -> Option<Arc<Scope>>;
}

/// One rendering target.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    name: String,
    scripts: Vec<PathBuf>,
    extra_args: Vec<Value>,
}

impl Scope {
    /// Create an empty scope.
    ///
    /// The name becomes part of a JavaScript property access, so it must
    /// be a plain identifier: ASCII alphanumerics and underscores, not
    /// starting with a digit.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        validate_scope_name(&name)?;
        Ok(Self {
            name,
            scripts: Vec::new(),
            extra_args: Vec::new(),
        })
    }

    /// Append a local script file to the injection list.
    pub fn with_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.scripts.push(path.into());
        self
    }

    /// Append a fixed argument passed after the request payload.
    pub fn with_arg(mut self, value: Value) -> Self {
        self.extra_args.push(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered local scripts to inject into a tab.
    pub fn scripts(&self) -> &[PathBuf] {
        &self.scripts
    }

    /// Ordered fixed arguments appended after the payload.
    pub fn extra_args(&self) -> &[Value] {
        &self.extra_args
    }

    /// The in-page function that renders a figure for this scope.
    pub fn function_name(&self) -> String {
        format!("kaleido_scopes.{}", self.name)
    }

    /// Function declaration handed to `Runtime.callFunctionOn`.
    ///
    /// The scope function returns a promise; its value is serialised to
    /// a JSON string in the page so it survives the protocol unchanged.
    pub fn function_declaration(&self) -> String {
        format!(
            "function(figure, ...args) {{ return {}(figure, ...args).then(JSON.stringify); }}",
            self.function_name()
        )
    }
}

fn validate_scope_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Scope name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Scope name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    let starts_with_digit = name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if starts_with_digit || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoreError::Validation(format!(
            "Scope name \"{name}\" must be an identifier (letters, digits, underscore)"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in scopes
// ---------------------------------------------------------------------------

/// Settings for the plotly scope.
#[derive(Debug, Clone, Default)]
pub struct PlotlyOptions {
    /// Local scripts, injected in order (plotly.js bundle, MathJax, ...).
    pub scripts: Vec<PathBuf>,
    /// Mapbox access token handed to every render.
    pub mapbox_token: Option<String>,
    /// Base URL of the topojson files used by geo traces.
    pub topojson: Option<String>,
}

/// Build the plotly scope.
///
/// Extra arguments are always `[mapbox_token, topojson]`, with `null`
/// for whichever is unset, so the in-page function sees fixed positions.
pub fn plotly(options: &PlotlyOptions) -> Result<Scope, CoreError> {
    if let Some(url) = &options.topojson {
        if !looks_like_url(url) {
            return Err(CoreError::Validation(format!(
                "topojson argument is not a valid URL: {url}"
            )));
        }
    }
    let mut scope = Scope::new(PLOTLY)?;
    for path in &options.scripts {
        scope = scope.with_script(checked_script(path)?);
    }
    Ok(scope
        .with_arg(options.mapbox_token.clone().map_or(Value::Null, Value::String))
        .with_arg(options.topojson.clone().map_or(Value::Null, Value::String)))
}

/// Build the mermaid scope. It takes no extra arguments.
pub fn mermaid(scripts: &[PathBuf]) -> Result<Scope, CoreError> {
    let mut scope = Scope::new(MERMAID)?;
    for path in scripts {
        scope = scope.with_script(checked_script(path)?);
    }
    Ok(scope)
}

fn checked_script(path: &Path) -> Result<PathBuf, CoreError> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(CoreError::Validation(format!(
            "Script is not a readable file: {}",
            path.display()
        )))
    }
}

fn looks_like_url(value: &str) -> bool {
    ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A fixed set of scopes, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, Arc<Scope>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope, replacing any previous scope of the same name.
    pub fn insert(&mut self, scope: Scope) {
        self.scopes
            .insert(scope.name().to_ascii_lowercase(), Arc::new(scope));
    }

    /// Registered scope names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look a scope up, failing with a not-found error.
    pub fn resolve(&self, name: &str) -> Result<Arc<Scope>, CoreError> {
        self.scope(name).ok_or_else(|| CoreError::NotFound {
            entity: "scope",
            name: name.to_string(),
        })
    }
}

impl ScopeProvider for ScopeRegistry {
    fn scope(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.get(&name.to_ascii_lowercase()).cloned()
    }
}
