//! Host-based routing rules
//!
//! A [`RoutingTable`] is an ordered list of [`Rule`]s. Each rule pairs a
//! compiled hostname [`Pattern`] with a binding template and an optional
//! outbound scheme. Resolution is a linear scan: the first rule whose pattern
//! matches the hostname wins, regardless of how specific later rules are.

use regex::Regex;
use serde::Deserialize;
use std::fmt;

/// How the configured pattern text is interpreted
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Regular expression, unanchored unless the pattern anchors itself (default)
    #[default]
    Regex,
    /// Literal hostname, matched exactly
    Exact,
    /// Literal suffix such as `.example.com`
    Suffix,
}

/// Outbound scheme for a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// Parse a configured scheme. Empty text means "not set".
    pub fn parse(text: &str) -> Result<Option<Self>, String> {
        match text {
            "" => Ok(None),
            "http" => Ok(Some(Scheme::Http)),
            "https" => Ok(Some(Scheme::Https)),
            other => Err(format!("unsupported scheme '{}' (expected http or https)", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled hostname matcher
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a regular expression pattern
    pub fn compile(text: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: text.to_string(),
            regex: Regex::new(text)?,
        })
    }

    /// Compile pattern text according to its match kind.
    ///
    /// Literal kinds are escaped and anchored so that every pattern ends up
    /// as one regex with the same rewrite semantics.
    pub fn compile_kind(text: &str, kind: MatchKind) -> Result<Self, regex::Error> {
        let expr = match kind {
            MatchKind::Regex => return Self::compile(text),
            MatchKind::Exact => format!("^{}$", regex::escape(text)),
            MatchKind::Suffix => format!("^(.*){}$", regex::escape(text)),
        };
        Ok(Self {
            source: text.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    /// The pattern text as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname)
    }

    /// Expand `template` against the first match of this pattern in `hostname`.
    ///
    /// `$1`, `${1}` and `${name}` refer to capture groups; everything else is
    /// copied verbatim. Returns `None` when the hostname does not match.
    pub fn rewrite(&self, hostname: &str, template: &str) -> Option<String> {
        let captures = self.regex.captures(hostname)?;
        let mut out = String::with_capacity(template.len() + hostname.len());
        captures.expand(template, &mut out);
        Some(out)
    }
}

/// One routing decision: pattern, binding template, optional scheme
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Pattern,
    binding: String,
    scheme: Option<Scheme>,
}

/// The resolved outbound target for a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Index of the matching rule in its table
    pub rule: usize,
    /// Rewritten authority (host, optionally with port)
    pub host: String,
    pub scheme: Scheme,
}

impl Rule {
    pub fn new(pattern: Pattern, binding: impl Into<String>, scheme: Option<Scheme>) -> Self {
        Self {
            pattern,
            binding: binding.into(),
            scheme,
        }
    }

    /// Build a rule from configuration text, adapting the binding for literal kinds.
    ///
    /// For suffix rules a binding starting with `.` keeps the matched prefix
    /// (`www.example.com` with `.example.com` → `.example` yields `www.example`);
    /// any other binding is used as-is.
    pub fn from_parts(
        pattern: &str,
        kind: MatchKind,
        binding: &str,
        scheme: Option<Scheme>,
    ) -> Result<Self, regex::Error> {
        let compiled = Pattern::compile_kind(pattern, kind)?;
        let binding = match kind {
            MatchKind::Regex => binding.to_string(),
            MatchKind::Exact => binding.replace('$', "$$"),
            MatchKind::Suffix if binding.starts_with('.') => {
                format!("${{1}}{}", binding.replace('$', "$$"))
            }
            MatchKind::Suffix => binding.replace('$', "$$"),
        };
        Ok(Self::new(compiled, binding, scheme))
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Outbound scheme, defaulting to `http` when none was configured
    pub fn scheme(&self) -> Scheme {
        self.scheme.unwrap_or_default()
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.pattern.matches(hostname)
    }

    /// Rewritten outbound host for `hostname`, if this rule matches it
    pub fn rewrite(&self, hostname: &str) -> Option<String> {
        self.pattern.rewrite(hostname, &self.binding)
    }
}

/// Ordered rules belonging to one listener
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<Rule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule, in configured order, whose pattern matches `hostname`
    pub fn find_match(&self, hostname: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(hostname))
    }

    /// Resolve `hostname` to its outbound host and scheme.
    ///
    /// Runs the regex once per candidate rule; the first rule that produces
    /// captures wins.
    pub fn route(&self, hostname: &str) -> Option<Route> {
        self.rules.iter().enumerate().find_map(|(index, rule)| {
            rule.rewrite(hostname).map(|host| Route {
                rule: index,
                host,
                scheme: rule.scheme(),
            })
        })
    }
}
