use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrincipalError {
    #[error("expected name@domain, got {0:?}")]
    MissingDomain(String),
    #[error("empty user name in {0:?}")]
    EmptyName(String),
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
}

/// A user identity of the form `name@domain`.
///
/// The domain is normalized to lowercase; the name is kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId {
    name: String,
    domain: String,
}

impl UserId {
    pub fn new(name: &str, domain: &str) -> Result<Self, PrincipalError> {
        format!("{name}@{domain}").parse()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True when this user is hosted by `domain`.
    pub fn is_hosted_by(&self, domain: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain)
    }
}

impl FromStr for UserId {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, domain) = s
            .rsplit_once('@')
            .ok_or_else(|| PrincipalError::MissingDomain(s.to_string()))?;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(PrincipalError::EmptyName(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            domain: normalize_domain(domain)?,
        })
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)
    }
}

/// Validate and lowercase a DNS-style domain name.
pub fn normalize_domain(domain: &str) -> Result<String, PrincipalError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if !valid {
        return Err(PrincipalError::InvalidDomain(domain.to_string()));
    }
    Ok(domain.to_ascii_lowercase())
}

/// An authenticated identity: a user, or a peer server acting for its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(UserId),
    Server(String),
}

impl Principal {
    /// The domain that owns this principal; decides local vs. federated routing.
    pub fn domain(&self) -> &str {
        match self {
            Principal::User(user) => user.domain(),
            Principal::Server(domain) => domain,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(user) => fmt::Display::fmt(user, f),
            Principal::Server(domain) => write!(f, "server:{domain}"),
        }
    }
}
