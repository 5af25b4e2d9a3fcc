use bon::Builder;
use secrecy::ExposeSecret as _;
use url::Url;

use super::topic;
use crate::Result;
use crate::auth::Credentials;
use crate::error::Error;

const API_KEY_PARAM: &str = "apiKey";
const PROJECT_ID_PARAM: &str = "projectId";
const USER_ID_PARAM: &str = "userId";
const TOKEN_PARAM: &str = "token";

/// Identity of a realtime client: where it connects and who it is.
///
/// # Example
///
/// ```
/// use realtime_link::realtime::ClientOptions;
/// use url::Url;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = ClientOptions::builder()
///     .base_url(Url::parse("wss://realtime.example.com/ws")?)
///     .project_id("proj1")
///     .user_id("user-42")
///     .build();
///
/// let url = options.handshake_url()?;
/// assert_eq!(url.as_str(), "wss://realtime.example.com/ws?projectId=proj1&userId=user-42");
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct ClientOptions {
    /// Server endpoint; `http`/`https` are mapped to `ws`/`wss`
    pub base_url: Url,
    /// Project the topics belong to
    #[builder(into)]
    pub project_id: String,
    /// Optional user identity forwarded on the handshake
    #[builder(into)]
    pub user_id: Option<String>,
    /// API key and bearer token
    #[builder(default)]
    pub credentials: Credentials,
}

impl ClientOptions {
    /// URL used to open the connection.
    ///
    /// Carries `apiKey` when an API key is configured and `projectId` otherwise, plus
    /// `userId` and `token` when present.
    pub fn handshake_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            "ws" | "wss" => None,
            other => {
                return Err(Error::validation(format!(
                    "unsupported URL scheme `{other}`, expected ws, wss, http or https"
                )));
            }
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|()| Error::validation(format!("unable to switch URL to {scheme}")))?;
        }

        {
            let mut query = url.query_pairs_mut();
            match &self.credentials.api_key {
                Some(key) => query.append_pair(API_KEY_PARAM, key.expose_secret()),
                None => query.append_pair(PROJECT_ID_PARAM, &self.project_id),
            };
            if let Some(user_id) = &self.user_id {
                query.append_pair(USER_ID_PARAM, user_id);
            }
            if let Some(token) = &self.credentials.token {
                query.append_pair(TOKEN_PARAM, token.expose_secret());
            }
        }

        Ok(url)
    }

    /// Fully-qualified topic for a table name.
    #[must_use]
    pub fn table_topic(&self, name: &str) -> String {
        topic::table(name, &self.project_id)
    }

    /// Fully-qualified topic for a chat room.
    #[must_use]
    pub fn chat_topic(&self, room_id: &str) -> String {
        topic::chat(room_id, &self.project_id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::validation("project_id must not be empty"));
        }
        self.handshake_url().map(drop)
    }
}
