use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::conninfo::ConnectionInfo;
use crate::errors::Error;
use crate::keys::KeyPair;
use crate::types::{InstanceUri, IpType};

/// Parsed static connection info document.
///
/// Dev-only: a JSON object holding one shared key pair and, per instance URI,
/// the addresses and certificates that would otherwise come from the control
/// plane. Connections start failing once the baked-in client certificate
/// expires; nothing refreshes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StaticConnectionInfo {
	private_key: String,
	/// Present in the document; the certificate chain already embeds it.
	#[serde(rename = "publicKey", default)]
	_public_key: String,
	#[serde(flatten)]
	instances: HashMap<String, StaticInstanceInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticInstanceInfo {
	#[serde(default)]
	ip_address: String,
	#[serde(default)]
	public_ip_address: String,
	#[serde(default)]
	psc_instance_config: Option<PscInstanceConfig>,
	pem_certificate_chain: Vec<String>,
	ca_cert: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PscInstanceConfig {
	#[serde(default)]
	psc_dns_name: String,
}

impl StaticConnectionInfo {
	pub(crate) fn from_json(json: &str) -> Result<Self, Error> {
		serde_json::from_str(json)
			.map_err(|e| Error::Config(format!("invalid static connection info: {e}")))
	}
}

/// Cache that always returns one preloaded [`ConnectionInfo`].
#[derive(Debug)]
pub(crate) struct StaticConnectionInfoCache {
	info: Arc<ConnectionInfo>,
}

impl StaticConnectionInfoCache {
	pub(crate) fn new(uri: &InstanceUri, doc: &StaticConnectionInfo) -> Result<Self, Error> {
		let entry = doc.instances.get(&uri.to_string()).ok_or_else(|| {
			Error::Config(format!("no static connection info for instance '{uri}'"))
		})?;

		let key = Arc::new(KeyPair::from_private_key_pem(&doc.private_key)?);
		let psc_dns = entry
			.psc_instance_config
			.as_ref()
			.map(|psc| psc.psc_dns_name.trim_end_matches('.').to_string())
			.unwrap_or_default();
		let ip_addrs = HashMap::from([
			(IpType::Private, entry.ip_address.clone()),
			(IpType::Public, entry.public_ip_address.clone()),
			(IpType::Psc, psc_dns),
		]);

		Ok(StaticConnectionInfoCache {
			info: Arc::new(ConnectionInfo::new(
				entry.pem_certificate_chain.clone(),
				entry.ca_cert.clone(),
				key,
				ip_addrs,
				SystemTime::now() + Duration::from_secs(3600),
			)),
		})
	}

	pub(crate) fn connect_info(&self) -> Arc<ConnectionInfo> {
		self.info.clone()
	}
}
