use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use rustls::{ClientConfig, RootCertStore};
use tracing::warn;

use crate::errors::Error;
use crate::keys::KeyPair;
use crate::tls;
use crate::types::IpType;

/// Immutable result of one refresh operation.
///
/// Holds the issued certificate chain, the instance CA, the connector's
/// private key, and the instance's addresses. Snapshots are never mutated
/// after publication; a replaced snapshot stays alive for any in-flight
/// connection attempt that already picked it up.
pub struct ConnectionInfo {
	/// PEM certificates, client certificate first.
	cert_chain: Vec<String>,
	/// PEM CA certificate used to verify the server.
	ca_cert: String,
	key: Arc<KeyPair>,
	ip_addrs: HashMap<IpType, String>,
	/// `notAfter` of the client certificate.
	expiration: SystemTime,
	tls: OnceCell<Arc<ClientConfig>>,
}

impl fmt::Debug for ConnectionInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionInfo")
			.field("ip_addrs", &self.ip_addrs)
			.field("expiration", &self.expiration)
			.finish_non_exhaustive()
	}
}

impl ConnectionInfo {
	pub(crate) fn new(
		cert_chain: Vec<String>,
		ca_cert: String,
		key: Arc<KeyPair>,
		ip_addrs: HashMap<IpType, String>,
		expiration: SystemTime,
	) -> Self {
		ConnectionInfo {
			cert_chain,
			ca_cert,
			key,
			ip_addrs,
			expiration,
			tls: OnceCell::new(),
		}
	}

	pub fn expiration(&self) -> SystemTime {
		self.expiration
	}

	pub(crate) fn is_valid(&self) -> bool {
		SystemTime::now() < self.expiration
	}

	/// The address for the requested IP type. A missing entry and an empty
	/// string both mean the instance does not expose that endpoint.
	pub fn preferred_ip(&self, ip_type: IpType) -> Result<&str, Error> {
		match self.ip_addrs.get(&ip_type) {
			Some(addr) if !addr.is_empty() => Ok(addr),
			_ => Err(Error::IpTypeNotFound(ip_type)),
		}
	}

	/// The TLS client config for this snapshot, built on first use and cached
	/// after; every caller gets a clone of the same `Arc`.
	pub fn tls_config(&self) -> Result<Arc<ClientConfig>, Error> {
		self.tls
			.get_or_try_init(|| self.build_tls_config().map(Arc::new))
			.cloned()
	}

	fn build_tls_config(&self) -> Result<ClientConfig, Error> {
		let mut roots = RootCertStore::empty();
		let (added, ignored) = roots.add_parsable_certificates(tls::parse_certs(&self.ca_cert)?);
		if added == 0 {
			return Err(Error::CertificateParse(
				"CA certificate is not usable as a trust root".to_string(),
			));
		}
		if ignored > 0 {
			warn!("found {ignored} invalid CA certs");
		}

		let mut chain = Vec::with_capacity(self.cert_chain.len());
		for pem in &self.cert_chain {
			chain.extend(tls::parse_certs(pem)?);
		}

		tls::client_config(chain, self.key.private_key_der(), Arc::new(roots))
	}
}

/// Extract `notAfter` from the first certificate in a PEM string.
pub(crate) fn cert_not_after(pem: &str) -> Result<SystemTime, Error> {
	let der = tls::parse_certs(pem)?
		.into_iter()
		.next()
		.expect("parse_certs yields at least one certificate");
	let (_, cert) = x509_parser::parse_x509_certificate(&der)
		.map_err(|e| Error::CertificateParse(e.to_string()))?;
	let not_after = cert.validity().not_after.timestamp();
	Ok(UNIX_EPOCH + Duration::from_secs(u64::try_from(not_after).unwrap_or_default()))
}
