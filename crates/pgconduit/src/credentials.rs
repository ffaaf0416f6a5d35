use std::fmt;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Freshness of an OAuth2 access token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
	/// Valid and not close to expiring.
	Fresh,
	/// Close to expiring; still usable but should be refreshed.
	Stale,
	/// Expired or never obtained.
	Invalid,
}

/// Capability supplying OAuth2 credentials to the connector.
///
/// The connector checks [`token_state`](Credentials::token_state) before
/// every control-plane request and before each metadata exchange, and calls
/// [`refresh`](Credentials::refresh) whenever the state is anything but
/// [`TokenState::Fresh`] — a `Stale` token is refreshed, not merely used.
/// Implementations are expected to carry the cloud-platform scope required by
/// the control plane and must tolerate concurrent refreshes.
#[async_trait]
pub trait Credentials: Send + Sync + fmt::Debug {
	fn token_state(&self) -> TokenState;

	/// The current access token, if one has been obtained.
	fn token(&self) -> Option<SecretString>;

	async fn refresh(&self) -> Result<(), BoxError>;
}

/// Refresh the credentials when needed and return a token that was fresh at
/// the time of the check.
pub(crate) async fn fresh_token(credentials: &dyn Credentials) -> Result<SecretString, Error> {
	if credentials.token_state() != TokenState::Fresh {
		credentials
			.refresh()
			.await
			.map_err(|e| Error::Upstream(format!("credential refresh failed: {e}")))?;
	}
	credentials
		.token()
		.ok_or_else(|| Error::Upstream("credentials did not yield an access token".to_string()))
}

/// A fixed, never-expiring token. Useful for development setups and tests;
/// production callers plug in a real OAuth2 implementation.
pub struct StaticCredentials {
	token: SecretString,
}

impl StaticCredentials {
	pub fn new(token: impl Into<String>) -> Self {
		StaticCredentials {
			token: SecretString::from(token.into()),
		}
	}
}

impl fmt::Debug for StaticCredentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StaticCredentials").finish_non_exhaustive()
	}
}

#[async_trait]
impl Credentials for StaticCredentials {
	fn token_state(&self) -> TokenState {
		TokenState::Fresh
	}

	fn token(&self) -> Option<SecretString> {
		Some(self.token.clone())
	}

	async fn refresh(&self) -> Result<(), BoxError> {
		Ok(())
	}
}
