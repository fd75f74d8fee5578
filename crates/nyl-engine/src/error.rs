//! Engine error types

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::suggestions::{
    extract_quoted_name, suggest_undefined_variable, suggest_unknown_filter,
    suggest_unknown_function,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Template error")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Core(#[from] nyl_core::CoreError),

    #[error("Secret store '{store}': {message}")]
    SecretStore { store: String, message: String },

    #[error("Helm render failed for {chart}: {message}")]
    Helm { chart: String, message: String },

    #[error("Git checkout of {url} failed: {message}")]
    Git { url: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    TypeError,
    InvalidOperation,
    YamlParseError,
    Other,
}

impl TemplateErrorKind {
    pub fn to_code_string(&self) -> &'static str {
        match self {
            Self::UndefinedVariable => "undefined_variable",
            Self::UnknownFilter => "unknown_filter",
            Self::UnknownFunction => "unknown_function",
            Self::SyntaxError => "syntax",
            Self::TypeError => "type",
            Self::InvalidOperation => "invalid_operation",
            Self::YamlParseError => "yaml_parse",
            Self::Other => "render",
        }
    }
}

/// Template error with the source it occurred in
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{message}")]
#[diagnostic(code(nyl::template::render))]
pub struct TemplateError {
    pub message: String,

    pub kind: TemplateErrorKind,

    #[source_code]
    pub src: NamedSource<String>,

    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub suggestion: Option<String>,

    /// 1-based line, if known
    pub line: Option<usize>,
}

impl TemplateError {
    /// Convert a MiniJinja error, attaching a suggestion based on the instance values
    pub fn from_minijinja(
        err: minijinja::Error,
        template_name: &str,
        template_source: &str,
        values: Option<&serde_json::Value>,
    ) -> Self {
        let kind = categorize(&err);
        let line = err.line();
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", kind_label(kind), detail),
            None => err.to_string(),
        };

        let detailed = format!("{:#}", err);
        let suggestion = match kind {
            TemplateErrorKind::UndefinedVariable => extract_expression(&detailed)
                .and_then(|expr| suggest_undefined_variable(&expr, values)),
            TemplateErrorKind::UnknownFilter => extract_quoted_name(&err.to_string())
                .map(|name| suggest_unknown_filter(&name)),
            TemplateErrorKind::UnknownFunction => extract_quoted_name(&err.to_string())
                .map(|name| suggest_unknown_function(&name)),
            TemplateErrorKind::SyntaxError => Some(
                "Check bracket matching: `{{ }}` for expressions, `{% %}` for statements"
                    .to_string(),
            ),
            _ => None,
        };

        Self {
            message,
            kind,
            src: NamedSource::new(template_name, template_source.to_string()),
            span: line.and_then(|l| calculate_span(template_source, l)),
            suggestion,
            line,
        }
    }

    /// YAML error in an expanded document
    pub fn yaml(err: &serde_yaml::Error, template_name: &str, expanded: &str) -> Self {
        let line = err.location().map(|l| l.line());
        Self {
            message: format!("invalid YAML after expansion: {}", err),
            kind: TemplateErrorKind::YamlParseError,
            src: NamedSource::new(template_name, expanded.to_string()),
            span: line.and_then(|l| calculate_span(expanded, l)),
            suggestion: Some(
                "Check indentation of expanded values; `toyaml | nindent(n)` helps".into(),
            ),
            line,
        }
    }

    pub fn simple(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TemplateErrorKind::Other,
            src: NamedSource::new("<unknown>", String::new()),
            span: None,
            suggestion: None,
            line: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

fn kind_label(kind: TemplateErrorKind) -> &'static str {
    match kind {
        TemplateErrorKind::UndefinedVariable => "undefined variable",
        TemplateErrorKind::UnknownFilter => "unknown filter",
        TemplateErrorKind::UnknownFunction => "unknown function",
        TemplateErrorKind::SyntaxError => "syntax error",
        TemplateErrorKind::TypeError => "type error",
        TemplateErrorKind::InvalidOperation => "invalid operation",
        TemplateErrorKind::YamlParseError => "yaml error",
        TemplateErrorKind::Other => "render error",
    }
}

fn categorize(err: &minijinja::Error) -> TemplateErrorKind {
    match err.kind() {
        minijinja::ErrorKind::UndefinedError => TemplateErrorKind::UndefinedVariable,
        minijinja::ErrorKind::UnknownFilter => TemplateErrorKind::UnknownFilter,
        minijinja::ErrorKind::UnknownFunction => TemplateErrorKind::UnknownFunction,
        minijinja::ErrorKind::SyntaxError => TemplateErrorKind::SyntaxError,
        minijinja::ErrorKind::InvalidOperation => TemplateErrorKind::InvalidOperation,
        minijinja::ErrorKind::NonPrimitive | minijinja::ErrorKind::NonKey => {
            TemplateErrorKind::TypeError
        }
        _ => TemplateErrorKind::Other,
    }
}

/// Pull the `{{ ... }}` expression from the error line of MiniJinja's detailed display:
///
/// ```text
///    8 >   typo: {{ value.app.name }}
///      i            ^^^^^^^^^ undefined value
/// ```
fn extract_expression(display: &str) -> Option<String> {
    display
        .lines()
        .filter(|line| line.trim_start().contains(" > ") || line.trim_start().starts_with("> "))
        .find_map(|line| {
            let start = line.find("{{")?;
            let end = line[start..].find("}}")?;
            let expr = line[start + 2..start + end].trim();
            let expr = expr.split('|').next().unwrap_or(expr).trim();
            (!expr.is_empty()).then(|| expr.to_string())
        })
}

/// Span covering the whole of a 1-based line
fn calculate_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (idx, line) in source.lines().enumerate() {
        if idx + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

pub type Result<T> = std::result::Result<T, EngineError>;
