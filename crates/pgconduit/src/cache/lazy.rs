use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::refresh::REFRESH_BUFFER;
use crate::conninfo::ConnectionInfo;
use crate::control::ControlPlaneClient;
use crate::errors::Error;
use crate::keys::SharedKeys;
use crate::types::InstanceUri;

#[derive(Debug)]
struct LazyState {
	cached: Option<Arc<ConnectionInfo>>,
	needs_refresh: bool,
}

/// Cache that refreshes only when a connection is requested and the cached
/// certificate is stale, close to expiring, or already expired.
///
/// Suited to serverless hosts that may be suspended between calls, where
/// background tasks are discouraged. The mutex serialises every
/// `connect_info` call, so at most one refresh is in flight and concurrent
/// callers observe the refreshed value without issuing their own.
#[derive(Debug)]
pub(crate) struct LazyRefreshCache {
	uri: InstanceUri,
	client: Arc<ControlPlaneClient>,
	keys: SharedKeys,
	state: Mutex<LazyState>,
}

impl LazyRefreshCache {
	pub(crate) fn new(uri: InstanceUri, client: Arc<ControlPlaneClient>, keys: SharedKeys) -> Self {
		LazyRefreshCache {
			uri,
			client,
			keys,
			state: Mutex::new(LazyState {
				cached: None,
				needs_refresh: false,
			}),
		}
	}

	pub(crate) async fn connect_info(&self) -> Result<Arc<ConnectionInfo>, Error> {
		let mut state = self.state.lock().await;

		// Pad expiration with the refresh buffer so the caller has plenty of
		// time to establish a connection with the certificate.
		if let Some(cached) = &state.cached
			&& !state.needs_refresh
			&& SystemTime::now() < cached.expiration() - REFRESH_BUFFER
		{
			debug!(instance = %self.uri, "connection info is still valid, using cached info");
			return Ok(cached.clone());
		}

		debug!(instance = %self.uri, "connection info refresh operation started");
		let info = self
			.client
			.get_connection_info(&self.uri, self.keys.clone())
			.await?;
		state.cached = Some(info.clone());
		state.needs_refresh = false;
		Ok(info)
	}

	/// Invalidate the cache; the next `connect_info` call fetches fresh data.
	pub(crate) async fn force_refresh(&self) {
		let mut state = self.state.lock().await;
		state.needs_refresh = true;
	}
}
