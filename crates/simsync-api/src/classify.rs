// ── Provider error-text classification ──
//
// The provisioning backend reports failures as free text. Callers depend on
// a stable classification, so the mapping lives in one ordered rule table:
// every exact rule is evaluated before any substring rule, and the first
// match wins within each pass.

use std::fmt;

/// Typed classification of a provider error message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum ProviderErrorKind {
    NotFound,
    AmbiguousMatch,
    ProviderSearchError,
    UserDataLoadError,
    DeviceLoadError,
    GenericLoadError,
    /// No rule matched; carries the provider text verbatim.
    ProviderUnknownError { raw: String },
}

impl ProviderErrorKind {
    /// Load/search failures on the provider side. Retrying later is
    /// reasonable; nothing about the request itself was wrong.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderSearchError
                | Self::UserDataLoadError
                | Self::DeviceLoadError
                | Self::GenericLoadError
        )
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

/// How a rule matches provider text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Exact(&'static str),
    Contains(&'static str),
}

#[derive(Debug)]
pub struct ErrorRule {
    pub pattern: Pattern,
    pub kind: ProviderErrorKind,
}

/// The ordered classification table.
pub const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule {
        pattern: Pattern::Exact("SIM number not found."),
        kind: ProviderErrorKind::NotFound,
    },
    ErrorRule {
        pattern: Pattern::Exact("No devices found for this user."),
        kind: ProviderErrorKind::NotFound,
    },
    ErrorRule {
        pattern: Pattern::Exact(
            "Multiple SIM numbers found - please provide more specific SIM number.",
        ),
        kind: ProviderErrorKind::AmbiguousMatch,
    },
    ErrorRule {
        pattern: Pattern::Exact("Error searching for user data."),
        kind: ProviderErrorKind::ProviderSearchError,
    },
    ErrorRule {
        pattern: Pattern::Contains("Error loading user data"),
        kind: ProviderErrorKind::UserDataLoadError,
    },
    ErrorRule {
        pattern: Pattern::Contains("Error loading device"),
        kind: ProviderErrorKind::DeviceLoadError,
    },
    ErrorRule {
        pattern: Pattern::Contains("Failed to load"),
        kind: ProviderErrorKind::GenericLoadError,
    },
];

/// Classify provider error text against [`ERROR_RULES`].
pub fn classify(text: &str) -> ProviderErrorKind {
    let exact = ERROR_RULES.iter().find(|rule| match rule.pattern {
        Pattern::Exact(expected) => text == expected,
        Pattern::Contains(_) => false,
    });
    let matched = exact.or_else(|| {
        ERROR_RULES.iter().find(|rule| match rule.pattern {
            Pattern::Contains(needle) => text.contains(needle),
            Pattern::Exact(_) => false,
        })
    });

    matched.map_or_else(
        || ProviderErrorKind::ProviderUnknownError {
            raw: text.to_owned(),
        },
        |rule| rule.kind.clone(),
    )
}
