use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cache::{
	ConnectionInfoCache, LazyRefreshCache, RefreshAheadCache, StaticConnectionInfo,
	StaticConnectionInfoCache,
};
use crate::control::ControlPlaneClient;
use crate::credentials::{Credentials, fresh_token};
use crate::errors::Error;
use crate::exchange::{self, MetadataExchangeRequest, SERVER_PROXY_PORT};
use crate::keys::{self, SharedKeys};
use crate::types::{Driver, InstanceUri, IpType, RefreshStrategy};

/// Default control-plane endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "pgconduit.googleapis.com";

/// Per-call overrides for [`Connector::connect`].
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
	/// Override the connector's default IP type for this call.
	pub ip_type: Option<IpType>,
	/// Override the connector's default IAM-auth setting for this call.
	pub enable_iam_auth: Option<bool>,
}

/// Everything a driver needs to reach an instance: the resolved address and
/// a client-authenticated TLS config. Produced by [`Connector::prepare`] for
/// drivers that dial on their own.
#[derive(Debug)]
pub struct PreparedConnect {
	pub ip_address: String,
	pub tls_config: Arc<ClientConfig>,
	/// Whether the server proxy expects the metadata exchange on this
	/// connection.
	pub metadata_exchange: bool,
	pub(crate) enable_iam_auth: bool,
}

/// The established data-plane stream for the synchronous driver family.
pub type ConnectedStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Configures and creates secure connections to managed database instances.
///
/// One connector owns one RSA key pair, one control-plane client, and one
/// connection-info cache per instance URI. Certificate rotation and endpoint
/// churn are invisible to callers: `connect` either returns a ready stream or
/// fails atomically.
#[derive(Debug)]
pub struct Connector {
	credentials: Arc<dyn Credentials>,
	quota_project: Option<String>,
	api_endpoint: String,
	enable_iam_auth: bool,
	ip_type: IpType,
	refresh_strategy: RefreshStrategy,
	user_agent: Option<String>,
	static_info: Option<StaticConnectionInfo>,
	keys: OnceCell<SharedKeys>,
	/// Built on first use; the first connect's driver decides whether issued
	/// certificates are flagged for the metadata exchange.
	client: OnceCell<Arc<ControlPlaneClient>>,
	caches: Mutex<HashMap<InstanceUri, Arc<ConnectionInfoCache>>>,
	closed: AtomicBool,
}

impl Connector {
	pub fn builder() -> ConnectorBuilder {
		ConnectorBuilder::new()
	}

	/// Prepare and return an established, secured stream to the instance.
	///
	/// Looks up or creates the per-instance cache, resolves the address for
	/// the requested IP type, opens a TCP connection to the server proxy,
	/// completes the TLS handshake, and — for the synchronous driver family —
	/// performs the metadata exchange. Any failure after the cache lookup
	/// forces a refresh before the error is re-raised.
	pub async fn connect(
		&self,
		instance_uri: &str,
		driver: Driver,
		options: ConnectOptions,
	) -> Result<ConnectedStream, Error> {
		let prepared = self.prepare(instance_uri, driver, options).await?;
		match self.dial(&prepared).await {
			Ok(stream) => Ok(stream),
			Err(e) => {
				let _ = self.force_refresh(instance_uri).await;
				Err(e)
			},
		}
	}

	/// Resolve the materials for a connection without dialing. Drivers that
	/// manage their own sockets (the async family) consume this directly; on
	/// a later connection failure they should call
	/// [`force_refresh`](Connector::force_refresh).
	pub async fn prepare(
		&self,
		instance_uri: &str,
		driver: Driver,
		options: ConnectOptions,
	) -> Result<PreparedConnect, Error> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::ClosedConnector);
		}

		let uri: InstanceUri = instance_uri.parse()?;
		let keys = self.ensure_keys();
		let client = self.client(Some(driver))?;

		let ip_type = options.ip_type.unwrap_or(self.ip_type);
		let enable_iam_auth = options.enable_iam_auth.unwrap_or(self.enable_iam_auth);

		let cache = self.cache_entry(&uri, client, keys)?;
		let resolve = async {
			let info = cache.connect_info().await?;
			let ip_address = info.preferred_ip(ip_type)?.to_string();
			let tls_config = info.tls_config()?;
			Ok::<_, Error>((ip_address, tls_config))
		};
		let (ip_address, tls_config) = match resolve.await {
			Ok(resolved) => resolved,
			Err(e) => {
				// A control-plane failure or missing IP type invalidates the
				// cache entry entirely.
				self.remove_cached(&uri).await;
				return Err(e);
			},
		};

		debug!(instance = %uri, "connecting to {ip_address}:{SERVER_PROXY_PORT}");
		Ok(PreparedConnect {
			ip_address,
			tls_config,
			metadata_exchange: driver.requires_metadata_exchange(),
			enable_iam_auth,
		})
	}

	async fn dial(&self, prepared: &PreparedConnect) -> Result<ConnectedStream, Error> {
		let address = (prepared.ip_address.as_str(), SERVER_PROXY_PORT);
		let tcp = TcpStream::connect(address).await.map_err(|e| {
			Error::Handshake(format!(
				"failed to connect to {}:{SERVER_PROXY_PORT}: {e}",
				prepared.ip_address
			))
		})?;

		let server_name = server_name(&prepared.ip_address)?;
		let mut stream = TlsConnector::from(prepared.tls_config.clone())
			.connect(server_name, tcp)
			.await
			.map_err(|e| {
				Error::Handshake(format!(
					"TLS handshake with {} failed: {e}",
					prepared.ip_address
				))
			})?;

		if prepared.metadata_exchange {
			let request = self.exchange_request(prepared.enable_iam_auth).await?;
			// A failed exchange drops the stream, closing the socket.
			exchange::exchange_async(&mut stream, &request).await?;
		}
		Ok(stream)
	}

	/// A currently-valid OAuth2 access token, refreshed if needed. Drivers
	/// use this as the database password when IAM authentication is enabled.
	pub async fn auth_token(&self) -> Result<SecretString, Error> {
		fresh_token(&*self.credentials).await
	}

	/// Arrange for the next connection attempt to the instance to use fresh
	/// certificates and metadata.
	pub async fn force_refresh(&self, instance_uri: &str) -> Result<(), Error> {
		let uri: InstanceUri = instance_uri.parse()?;
		let cache = {
			let caches = self.caches.lock().unwrap();
			caches.get(&uri).cloned()
		};
		if let Some(cache) = cache {
			cache.force_refresh().await;
		}
		Ok(())
	}

	/// Close the connector: stop every cache's refresh tasks and drop the
	/// cache map. Idempotent; later `connect` calls fail with
	/// [`Error::ClosedConnector`].
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let caches: Vec<_> = {
			let mut map = self.caches.lock().unwrap();
			map.drain().map(|(_, cache)| cache).collect()
		};
		for cache in caches {
			cache.close().await;
		}
	}

	pub(crate) fn ensure_keys(&self) -> SharedKeys {
		self.keys.get_or_init(keys::spawn_generate).clone()
	}

	fn client(&self, driver: Option<Driver>) -> Result<Arc<ControlPlaneClient>, Error> {
		self.client
			.get_or_try_init(|| {
				ControlPlaneClient::new(
					&self.api_endpoint,
					self.quota_project.clone(),
					self.credentials.clone(),
					driver,
					self.user_agent.as_deref(),
				)
				.map(Arc::new)
			})
			.cloned()
	}

	pub(crate) async fn exchange_request(
		&self,
		enable_iam_auth: bool,
	) -> Result<MetadataExchangeRequest, Error> {
		let token = fresh_token(&*self.credentials).await?;
		let user_agent = self
			.client
			.get()
			.map(|c| c.user_agent().to_string())
			.unwrap_or_else(|| crate::control::DEFAULT_USER_AGENT.to_string());
		Ok(exchange::request(&user_agent, enable_iam_auth, &token))
	}

	fn cache_entry(
		&self,
		uri: &InstanceUri,
		client: Arc<ControlPlaneClient>,
		keys: SharedKeys,
	) -> Result<Arc<ConnectionInfoCache>, Error> {
		let mut caches = self.caches.lock().unwrap();
		if let Some(cache) = caches.get(uri) {
			return Ok(cache.clone());
		}

		let cache = if let Some(static_info) = &self.static_info {
			debug!(instance = %uri, "using static connection info");
			ConnectionInfoCache::Static(StaticConnectionInfoCache::new(uri, static_info)?)
		} else {
			match self.refresh_strategy {
				RefreshStrategy::Background => {
					debug!(instance = %uri, "refresh strategy is set to background refresh");
					ConnectionInfoCache::RefreshAhead(RefreshAheadCache::new(
						uri.clone(),
						client,
						keys,
					))
				},
				RefreshStrategy::Lazy => {
					debug!(instance = %uri, "refresh strategy is set to lazy refresh");
					ConnectionInfoCache::Lazy(LazyRefreshCache::new(uri.clone(), client, keys))
				},
			}
		};
		let cache = Arc::new(cache);
		caches.insert(uri.clone(), cache.clone());
		debug!(instance = %uri, "connection info added to cache");
		Ok(cache)
	}

	/// Stop the instance's refreshes and drop its cache entry.
	async fn remove_cached(&self, uri: &InstanceUri) {
		let cache = {
			let mut caches = self.caches.lock().unwrap();
			caches.remove(uri)
		};
		if let Some(cache) = cache {
			debug!(instance = %uri, "removing connection info from cache");
			cache.close().await;
		}
	}
}

pub(crate) fn server_name(ip_address: &str) -> Result<ServerName<'static>, Error> {
	ServerName::try_from(ip_address.to_string())
		.map_err(|e| Error::Handshake(format!("invalid server name '{ip_address}': {e}")))
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
	credentials: Option<Arc<dyn Credentials>>,
	quota_project: Option<String>,
	api_endpoint: String,
	enable_iam_auth: bool,
	ip_type: IpType,
	refresh_strategy: RefreshStrategy,
	user_agent: Option<String>,
	static_info: Option<StaticConnectionInfo>,
}

impl ConnectorBuilder {
	fn new() -> Self {
		ConnectorBuilder {
			credentials: None,
			quota_project: None,
			api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
			enable_iam_auth: false,
			ip_type: IpType::Private,
			refresh_strategy: RefreshStrategy::Background,
			user_agent: None,
			static_info: None,
		}
	}

	/// Credentials used for control-plane calls and, with IAM auth, as the
	/// database password. Required.
	pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
		self.credentials = Some(credentials);
		self
	}

	/// Project to attribute quota and billing to, when different from the
	/// instance's project.
	pub fn quota_project(mut self, project: impl Into<String>) -> Self {
		self.quota_project = Some(project.into());
		self
	}

	pub fn api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.api_endpoint = endpoint.into();
		self
	}

	/// Enable automatic IAM database authentication.
	pub fn enable_iam_auth(mut self, enable: bool) -> Self {
		self.enable_iam_auth = enable;
		self
	}

	/// Default IP type for all connections.
	pub fn ip_type(mut self, ip_type: IpType) -> Self {
		self.ip_type = ip_type;
		self
	}

	pub fn refresh_strategy(mut self, strategy: RefreshStrategy) -> Self {
		self.refresh_strategy = strategy;
		self
	}

	/// Custom string appended to the default user-agent.
	pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());
		self
	}

	/// Dev-only: preload connection info from a static JSON document instead
	/// of the control plane. Connections fail once the baked-in certificate
	/// expires; never use this in production.
	pub fn static_connection_info(mut self, mut reader: impl std::io::Read) -> Result<Self, Error> {
		let mut json = String::new();
		reader
			.read_to_string(&mut json)
			.map_err(|e| Error::Config(format!("failed to read static connection info: {e}")))?;
		self.static_info = Some(StaticConnectionInfo::from_json(&json)?);
		Ok(self)
	}

	pub fn build(self) -> Result<Connector, Error> {
		let credentials = self.credentials.ok_or_else(|| {
			Error::Config("credentials are required; supply a Credentials implementation".to_string())
		})?;
		Ok(Connector {
			credentials,
			quota_project: self.quota_project,
			api_endpoint: self.api_endpoint,
			enable_iam_auth: self.enable_iam_auth,
			ip_type: self.ip_type,
			refresh_strategy: self.refresh_strategy,
			user_agent: self.user_agent,
			static_info: self.static_info,
			keys: OnceCell::new(),
			client: OnceCell::new(),
			caches: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		})
	}
}
