//! Per-instance connection-info caches.
//!
//! Three interchangeable strategies: refresh-ahead (background tasks keep a
//! valid snapshot available at all times), lazy (refresh on demand under a
//! mutex), and static (dev-only preloaded data, no refresh at all).

use std::sync::Arc;

use crate::conninfo::ConnectionInfo;
use crate::errors::Error;

pub(crate) mod lazy;
pub(crate) mod refresh;
pub(crate) mod static_info;

pub(crate) use lazy::LazyRefreshCache;
pub(crate) use refresh::RefreshAheadCache;
pub(crate) use static_info::{StaticConnectionInfo, StaticConnectionInfoCache};

#[derive(Debug)]
pub(crate) enum ConnectionInfoCache {
	RefreshAhead(RefreshAheadCache),
	Lazy(LazyRefreshCache),
	Static(StaticConnectionInfoCache),
}

impl ConnectionInfoCache {
	/// A valid snapshot for establishing a connection, blocking on or
	/// triggering a refresh as the strategy dictates.
	pub(crate) async fn connect_info(&self) -> Result<Arc<ConnectionInfo>, Error> {
		match self {
			ConnectionInfoCache::RefreshAhead(cache) => cache.connect_info().await,
			ConnectionInfoCache::Lazy(cache) => cache.connect_info().await,
			ConnectionInfoCache::Static(cache) => Ok(cache.connect_info()),
		}
	}

	/// Arrange for future connection attempts to use fresh data.
	pub(crate) async fn force_refresh(&self) {
		match self {
			ConnectionInfoCache::RefreshAhead(cache) => cache.force_refresh(),
			ConnectionInfoCache::Lazy(cache) => cache.force_refresh().await,
			ConnectionInfoCache::Static(_) => {},
		}
	}

	pub(crate) async fn close(&self) {
		match self {
			ConnectionInfoCache::RefreshAhead(cache) => cache.close().await,
			ConnectionInfoCache::Lazy(_) | ConnectionInfoCache::Static(_) => {},
		}
	}
}
