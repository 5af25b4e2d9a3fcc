/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

/// Credentials carried on the connection handshake.
///
/// Neither value is refreshed by the client: an expired token has to be replaced by the
/// caller, for example through [`crate::realtime::ConnectionManager::authenticate`].
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub(crate) api_key: Option<SecretString>,
    pub(crate) token: Option<SecretString>,
}

impl Credentials {
    #[must_use]
    pub fn new(api_key: Option<String>, token: Option<String>) -> Self {
        Self {
            api_key: api_key.map(SecretString::from),
            token: token.map(SecretString::from),
        }
    }

    /// Credentials with only an API key.
    #[must_use]
    pub fn api_key(key: String) -> Self {
        Self::new(Some(key), None)
    }

    /// Credentials with only a bearer token.
    #[must_use]
    pub fn bearer(token: String) -> Self {
        Self::new(None, Some(token))
    }

    /// Returns the API key.
    #[must_use]
    pub fn key(&self) -> Option<&SecretString> {
        self.api_key.as_ref()
    }

    /// Returns the bearer token.
    #[must_use]
    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }
}
