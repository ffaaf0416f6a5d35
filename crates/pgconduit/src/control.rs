use std::collections::HashMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conninfo::{ConnectionInfo, cert_not_after};
use crate::credentials::{Credentials, fresh_token};
use crate::errors::Error;
use crate::keys::SharedKeys;
use crate::types::{Driver, InstanceUri, IpType};

pub(crate) const API_VERSION: &str = "v1beta";
pub(crate) const DEFAULT_USER_AGENT: &str = concat!("pgconduit/", env!("CARGO_PKG_VERSION"));

/// Requested validity for issued client certificates.
const CERT_DURATION: &str = "3600s";

/// `<product>/<version>`, optionally `+<driver>`, optionally ` <custom>`.
pub(crate) fn format_user_agent(driver: Option<Driver>, custom: Option<&str>) -> String {
	let mut agent = match driver {
		Some(driver) => format!("{DEFAULT_USER_AGENT}+{driver}"),
		None => DEFAULT_USER_AGENT.to_string(),
	};
	if let Some(custom) = custom {
		agent.push(' ');
		agent.push_str(custom);
	}
	agent
}

/// Normalize the configured API endpoint into a base URL.
///
/// A bare host gets the `https://` scheme; an explicit scheme is kept so that
/// development setups can point at a plaintext control plane.
fn base_url(endpoint: &str) -> String {
	let endpoint = endpoint.trim_end_matches('/');
	if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
		endpoint.to_string()
	} else {
		format!("https://{endpoint}")
	}
}

/// Client for the two control-plane calls: instance metadata lookup and
/// client-certificate issuance.
///
/// One client is shared by every cache a connector owns; the underlying
/// `reqwest` session pools connections internally.
#[derive(Debug)]
pub(crate) struct ControlPlaneClient {
	http: reqwest::Client,
	base_url: String,
	quota_project: Option<String>,
	credentials: Arc<dyn Credentials>,
	/// Whether issued certificates should be flagged for the server proxy's
	/// metadata exchange. True iff the configured driver requires it.
	use_metadata_exchange: bool,
	user_agent: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConnectionInfoResponse {
	ip_address: Option<String>,
	public_ip_address: Option<String>,
	psc_dns_name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateCertificateRequest<'a> {
	public_key: &'a str,
	cert_duration: &'a str,
	use_metadata_exchange: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateCertificateResponse {
	#[serde(default)]
	ca_cert: String,
	#[serde(default)]
	pem_certificate_chain: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
	error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
	message: Option<String>,
}

impl ControlPlaneClient {
	pub(crate) fn new(
		api_endpoint: &str,
		quota_project: Option<String>,
		credentials: Arc<dyn Credentials>,
		driver: Option<Driver>,
		custom_user_agent: Option<&str>,
	) -> Result<Self, Error> {
		let http = reqwest::Client::builder()
			.build()
			.map_err(|e| Error::Upstream(format!("failed to build HTTP client: {e}")))?;
		Ok(ControlPlaneClient {
			http,
			base_url: base_url(api_endpoint),
			quota_project,
			credentials,
			use_metadata_exchange: driver.is_some_and(|d| d.requires_metadata_exchange()),
			user_agent: format_user_agent(driver, custom_user_agent),
		})
	}

	pub(crate) fn user_agent(&self) -> &str {
		&self.user_agent
	}

	fn apply_headers(
		&self,
		request: reqwest::RequestBuilder,
		token: &SecretString,
	) -> reqwest::RequestBuilder {
		let request = request
			.bearer_auth(token.expose_secret())
			.header("User-Agent", &self.user_agent)
			.header("x-goog-api-client", &self.user_agent);
		match &self.quota_project {
			Some(project) => request.header("x-goog-user-project", project),
			None => request,
		}
	}

	async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
		let response = request
			.send()
			.await
			.map_err(|e| Error::Upstream(e.to_string()))?;
		if response.status().is_success() {
			return Ok(response);
		}
		let status = response.status();
		let body = response.text().await.unwrap_or_default();
		// Surface the server's structured message when the body carries one.
		let message = serde_json::from_str::<ErrorBody>(&body)
			.ok()
			.and_then(|b| b.error)
			.and_then(|e| e.message)
			.unwrap_or(body);
		Err(Error::Upstream(format!("{status}: {message}")))
	}

	/// Fetch the instance's addresses. An instance exposes any subset of the
	/// three endpoint types; absent entries come back as empty strings.
	pub(crate) async fn get_metadata(
		&self,
		uri: &InstanceUri,
	) -> Result<HashMap<IpType, String>, Error> {
		let token = fresh_token(&*self.credentials).await?;
		let url = format!(
			"{}/{API_VERSION}/projects/{}/locations/{}/clusters/{}/instances/{}/connectionInfo",
			self.base_url,
			uri.project(),
			uri.location(),
			uri.cluster(),
			uri.instance(),
		);
		let response = self.send(self.apply_headers(self.http.get(url), &token)).await?;
		let info: ConnectionInfoResponse = response
			.json()
			.await
			.map_err(|e| Error::Upstream(format!("invalid connectionInfo response: {e}")))?;

		// PSC endpoints are DNS names; strip any trailing root-label dot.
		let psc_dns = info
			.psc_dns_name
			.unwrap_or_default()
			.trim_end_matches('.')
			.to_string();

		Ok(HashMap::from([
			(IpType::Private, info.ip_address.unwrap_or_default()),
			(IpType::Public, info.public_ip_address.unwrap_or_default()),
			(IpType::Psc, psc_dns),
		]))
	}

	/// Submit the connector's public key and get back the instance CA plus a
	/// signed chain `[client, intermediate, root]`.
	pub(crate) async fn generate_client_certificate(
		&self,
		uri: &InstanceUri,
		public_key_pem: &str,
	) -> Result<(String, Vec<String>), Error> {
		let token = fresh_token(&*self.credentials).await?;
		let url = format!(
			"{}/{API_VERSION}/projects/{}/locations/{}/clusters/{}:generateClientCertificate",
			self.base_url,
			uri.project(),
			uri.location(),
			uri.cluster(),
		);
		let body = GenerateCertificateRequest {
			public_key: public_key_pem,
			cert_duration: CERT_DURATION,
			use_metadata_exchange: self.use_metadata_exchange,
		};
		let response = self
			.send(self.apply_headers(self.http.post(url).json(&body), &token))
			.await?;
		let certs: GenerateCertificateResponse = response
			.json()
			.await
			.map_err(|e| Error::Upstream(format!("invalid generateClientCertificate response: {e}")))?;
		Ok((certs.ca_cert, certs.pem_certificate_chain))
	}

	/// Perform one full refresh: make sure the credentials are fresh, fetch
	/// metadata and a signed certificate concurrently, and assemble the
	/// resulting snapshot.
	pub(crate) async fn get_connection_info(
		&self,
		uri: &InstanceUri,
		keys: SharedKeys,
	) -> Result<Arc<ConnectionInfo>, Error> {
		let keys = keys.await?;

		// Refresh credentials up front so the two concurrent calls below both
		// see a fresh token.
		fresh_token(&*self.credentials).await?;

		let (ip_addrs, (ca_cert, cert_chain)) = tokio::try_join!(
			self.get_metadata(uri),
			self.generate_client_certificate(uri, keys.public_key_pem()),
		)?;

		let leaf = cert_chain
			.first()
			.ok_or_else(|| Error::CertificateParse("empty certificate chain".to_string()))?;
		let expiration = cert_not_after(leaf)?;
		debug!(instance = %uri, ?expiration, "connection info refreshed");

		Ok(Arc::new(ConnectionInfo::new(
			cert_chain, ca_cert, keys, ip_addrs, expiration,
		)))
	}
}
