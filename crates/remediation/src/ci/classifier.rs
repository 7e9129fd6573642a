//! Build error classification.
//!
//! Maps an error message to a category label using an ordered table of
//! case-insensitive regular expressions. The first matching rule wins, so
//! more specific categories are listed before broader ones.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Classification rule as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Category label reported on match (e.g. `compilation_error`)
    pub label: String,
    /// Regular expression, matched case-insensitively
    pub pattern: String,
}

impl PatternConfig {
    fn new(label: &str, pattern: &str) -> Self {
        Self {
            label: label.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// Built-in rule table, in priority order.
#[must_use]
pub fn default_patterns() -> Vec<PatternConfig> {
    vec![
        PatternConfig::new(
            "compilation_error",
            r"error\s+(CS|TS|C|BC)\d{3,5}|error\[E\d{4}\]|compilation (failed|error)|could not compile|cannot find symbol|undefined reference to|build failed with \d+ error",
        ),
        PatternConfig::new(
            "test_failure",
            r"tests? (failed|failure)|test result: FAILED|assertion ?(error|failed)|assert(ionerror|_eq!?|\.equal)|expected .+ but (was|got|received)|failing tests?",
        ),
        PatternConfig::new(
            "lint_error",
            r"\b(eslint|clippy|pylint|flake8|rubocop|golangci-lint|stylecop|ktlint)\b|lint(ing)? (error|failed)|warnings? (being )?treated as errors?",
        ),
        PatternConfig::new(
            "missing_dependency",
            r"(module|package|assembly|crate|dependency) .*not found|cannot find (module|package)|no matching (package|version)|could not resolve (dependency|dependencies|package)|ModuleNotFoundError|unresolved import|missing dependency|NU1101",
        ),
        PatternConfig::new(
            "syntax_error",
            r"syntax ?error|unexpected token|parse error|unexpected end of (file|input)|invalid syntax",
        ),
        PatternConfig::new(
            "null_reference_error",
            r"null ?reference|NullPointerException|nil pointer dereference|cannot read propert(y|ies) of (null|undefined)|'NoneType' object|object reference not set",
        ),
        PatternConfig::new(
            "timeout",
            r"timed? ?out\b|deadline exceeded|exceeded the maximum execution time",
        ),
    ]
}

static DEFAULT_CLASSIFIER: LazyLock<ErrorClassifier> = LazyLock::new(|| {
    ErrorClassifier::from_config(&default_patterns()).unwrap()
});

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    label: String,
    regex: Regex,
}

impl ErrorPattern {
    /// Compile a rule. Matching is always case-insensitive.
    pub fn compile(label: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            label: label.into(),
            regex: RegexBuilder::new(pattern).case_insensitive(true).build()?,
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn matches(&self, message: &str) -> bool {
        self.regex.is_match(message)
    }
}

/// Ordered pattern table. Immutable once built, so one instance is shared
/// across concurrent handlers.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<ErrorPattern>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_default_patterns()
    }
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(patterns: Vec<ErrorPattern>) -> Self {
        Self { patterns }
    }

    /// Compile a configured rule table, preserving its order.
    pub fn from_config(rules: &[PatternConfig]) -> Result<Self, regex::Error> {
        let patterns = rules
            .iter()
            .map(|rule| ErrorPattern::compile(rule.label.clone(), &rule.pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    /// Classifier over the built-in rule table.
    #[must_use]
    pub fn with_default_patterns() -> Self {
        DEFAULT_CLASSIFIER.clone()
    }

    /// Label of the first matching rule.
    #[must_use]
    pub fn classify(&self, message: &str) -> Option<&str> {
        if message.trim().is_empty() {
            return None;
        }
        self.patterns
            .iter()
            .find(|p| p.matches(message))
            .map(ErrorPattern::label)
    }

    /// Owned label of the first matching rule.
    #[must_use]
    pub fn extract_error_pattern(&self, message: &str) -> Option<String> {
        self.classify(message).map(str::to_string)
    }

    /// A fix is attempted only for recognized categories.
    #[must_use]
    pub fn should_attempt_fix(&self, message: &str) -> bool {
        self.classify(message).is_some()
    }

    /// Labels in priority order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(ErrorPattern::label)
    }
}
