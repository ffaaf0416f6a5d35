//! Synchronous facade over the async connector.
//!
//! Owns a dedicated background tokio runtime that hosts all async machinery —
//! refresh tasks, control-plane calls, key generation. Public methods submit
//! work to that runtime and block on the result; the data-plane socket itself
//! is a plain blocking `TcpStream` wrapped in rustls, which is what the
//! synchronous driver family consumes.

use std::net::TcpStream;
use std::time::Duration;

use rustls::{ClientConnection, StreamOwned};
use tracing::warn;

use crate::connector::{ConnectOptions, PreparedConnect, server_name};
use crate::errors::Error;
use crate::exchange::{self, IO_TIMEOUT, SERVER_PROXY_PORT};
use crate::types::Driver;

/// How long `close` waits for refresh tasks to settle.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// The established data-plane stream for synchronous drivers.
pub type ConnectedStream = StreamOwned<ClientConnection, TcpStream>;

/// Blocking connector for synchronous applications.
///
/// Must not be created or used from within an async runtime; async callers
/// use [`crate::Connector`] directly.
pub struct Connector {
	inner: crate::Connector,
	runtime: Option<tokio::runtime::Runtime>,
}

impl Connector {
	/// Wrap an async connector. Key-pair generation starts immediately on
	/// the background runtime.
	pub fn new(inner: crate::Connector) -> Result<Self, Error> {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.thread_name("pgconduit-worker")
			.enable_all()
			.build()
			.map_err(|e| Error::Config(format!("failed to start background runtime: {e}")))?;
		{
			let _guard = runtime.enter();
			inner.ensure_keys();
		}
		Ok(Connector {
			inner,
			runtime: Some(runtime),
		})
	}

	fn runtime(&self) -> Result<&tokio::runtime::Runtime, Error> {
		self.runtime.as_ref().ok_or(Error::ClosedConnector)
	}

	/// Prepare and return an established, secured stream to the instance.
	/// See [`crate::Connector::connect`].
	pub fn connect(
		&self,
		instance_uri: &str,
		driver: Driver,
		options: ConnectOptions,
	) -> Result<ConnectedStream, Error> {
		let runtime = self.runtime()?;
		let prepared = runtime.block_on(self.inner.prepare(instance_uri, driver, options))?;
		match self.dial(&prepared) {
			Ok(stream) => Ok(stream),
			Err(e) => {
				let _ = runtime.block_on(self.inner.force_refresh(instance_uri));
				Err(e)
			},
		}
	}

	fn dial(&self, prepared: &PreparedConnect) -> Result<ConnectedStream, Error> {
		let runtime = self.runtime()?;
		let address = (prepared.ip_address.as_str(), SERVER_PROXY_PORT);
		let tcp = TcpStream::connect(address).map_err(|e| {
			Error::Handshake(format!(
				"failed to connect to {}:{SERVER_PROXY_PORT}: {e}",
				prepared.ip_address
			))
		})?;

		let connection = ClientConnection::new(
			prepared.tls_config.clone(),
			server_name(&prepared.ip_address)?,
		)?;
		let mut stream = StreamOwned::new(connection, tcp);

		// Drive the handshake to completion so TLS failures surface here
		// rather than on the driver's first read.
		while stream.conn.is_handshaking() {
			stream.conn.complete_io(&mut stream.sock).map_err(|e| {
				Error::Handshake(format!(
					"TLS handshake with {} failed: {e}",
					prepared.ip_address
				))
			})?;
		}

		if prepared.metadata_exchange {
			let request = runtime.block_on(self.inner.exchange_request(prepared.enable_iam_auth))?;

			// Bound the exchange, then put the socket back in blocking mode
			// for the driver.
			set_socket_timeouts(&stream.sock, Some(IO_TIMEOUT))?;
			let result = exchange::exchange_blocking(&mut stream, &request);
			set_socket_timeouts(&stream.sock, None)?;
			result?;
		}
		Ok(stream)
	}

	/// See [`crate::Connector::auth_token`].
	pub fn auth_token(&self) -> Result<secrecy::SecretString, Error> {
		self.runtime()?.block_on(self.inner.auth_token())
	}

	/// See [`crate::Connector::force_refresh`].
	pub fn force_refresh(&self, instance_uri: &str) -> Result<(), Error> {
		self.runtime()?.block_on(self.inner.force_refresh(instance_uri))
	}

	/// Close the connector and shut the background runtime down. Idempotent.
	pub fn close(&mut self) {
		let Some(runtime) = self.runtime.take() else {
			return;
		};
		let closed = runtime.block_on(async {
			tokio::time::timeout(CLOSE_TIMEOUT, self.inner.close()).await
		});
		if closed.is_err() {
			warn!("connector close timed out; abandoning outstanding refresh tasks");
		}
		runtime.shutdown_background();
	}
}

impl Drop for Connector {
	fn drop(&mut self) {
		self.close();
	}
}

fn set_socket_timeouts(sock: &TcpStream, timeout: Option<Duration>) -> Result<(), Error> {
	sock.set_read_timeout(timeout)
		.and_then(|()| sock.set_write_timeout(timeout))
		.map_err(|e| Error::Handshake(format!("failed to set socket timeout: {e}")))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::ConnectOptions;
	use crate::credentials::StaticCredentials;

	fn test_connector() -> Connector {
		let inner = crate::Connector::builder()
			.credentials(Arc::new(StaticCredentials::new("token")))
			.build()
			.unwrap();
		Connector::new(inner).unwrap()
	}

	#[test]
	fn connect_after_close_fails() {
		let mut connector = test_connector();
		connector.close();
		let err = connector
			.connect(
				"projects/p/locations/l/clusters/c/instances/i",
				Driver::Postgres,
				ConnectOptions::default(),
			)
			.unwrap_err();
		assert_eq!(
			err.to_string(),
			"Connection attempt failed because the connector has already been closed."
		);
	}

	#[test]
	fn close_twice_is_a_no_op() {
		let mut connector = test_connector();
		connector.close();
		connector.close();
	}
}
