//! Registry credential records and providers.
//!
//! Credentials are pulled on demand so embedders can rotate tokens without
//! rebuilding clients. Secret material is wrapped in [`SecretString`] and
//! never appears in `Debug` output or logs.

use secrecy::SecretString;

/// A credential for a registry host.
///
/// Either a user/password pair (used for Basic auth and for token exchange)
/// or a pre-issued identity token, or both.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    /// Account name; empty for anonymous access
    pub user: String,

    /// Account password or personal access token
    pub password: Option<SecretString>,

    /// Pre-issued identity token (used directly as a bearer token)
    pub token: Option<SecretString>,
}

impl Credential {
    /// Create an anonymous credential.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create a user/password credential.
    #[must_use]
    pub fn user_pass(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(SecretString::from(password.into())),
            token: None,
        }
    }

    /// Create a token credential.
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            user: String::new(),
            password: None,
            token: Some(SecretString::from(token.into())),
        }
    }

    /// Returns true when no authentication material is present.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.user.is_empty() && self.password.is_none() && self.token.is_none()
    }
}

/// Source of credentials for a registry host.
///
/// Queried at signing time; implementations may consult a credential helper,
/// a keychain, or static configuration.
pub trait CredentialSource: Send + Sync {
    /// Return the current credential for the host.
    fn credential(&self) -> Credential;
}

impl CredentialSource for Credential {
    fn credential(&self) -> Credential {
        self.clone()
    }
}

/// Adapter turning a closure into a [`CredentialSource`].
pub struct CredentialFn<F>(
    /// Closure returning the current credential.
    pub F,
);

impl<F> CredentialSource for CredentialFn<F>
where
    F: Fn() -> Credential + Send + Sync,
{
    fn credential(&self) -> Credential {
        (self.0)()
    }
}
