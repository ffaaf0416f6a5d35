// Wiremock control plane serving the two calls the connector issues:
// `connectionInfo` and `:generateClientCertificate`. The certificate
// responder parses the submitted public key and signs a real chain for it.

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::ca::get_shared_ca;

pub struct MockControlPlane {
	pub server: MockServer,
}

/// Addresses returned by the metadata call.
#[derive(Clone)]
pub struct InstanceAddresses {
	pub ip_address: String,
	pub public_ip_address: String,
	pub psc_dns_name: String,
}

impl InstanceAddresses {
	pub fn private_only(ip: &str) -> Self {
		InstanceAddresses {
			ip_address: ip.to_string(),
			public_ip_address: String::new(),
			psc_dns_name: String::new(),
		}
	}
}

struct CertificateIssuer {
	/// Client certificate validity; negative mints an already-expired cert.
	ttl_secs: i64,
}

impl Respond for CertificateIssuer {
	fn respond(&self, request: &Request) -> ResponseTemplate {
		let body: serde_json::Value =
			serde_json::from_slice(&request.body).expect("JSON request body");
		let spki_pem = body["publicKey"].as_str().expect("publicKey field");
		assert_eq!(body["certDuration"], "3600s");

		let ca = get_shared_ca();
		let chain = ca.issue_client_chain(spki_pem, self.ttl_secs);
		ResponseTemplate::new(200).set_body_json(json!({
			"caCert": ca.root_pem(),
			"pemCertificateChain": chain,
		}))
	}
}

impl MockControlPlane {
	/// Serve one instance with certificates valid for `cert_ttl_secs`.
	pub async fn start(token: &str, addrs: InstanceAddresses, cert_ttl_secs: i64) -> Self {
		let server = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path(
				"/v1beta/projects/test-project/locations/test-region/clusters/test-cluster/instances/test-instance/connectionInfo",
			))
			.and(header("Authorization", format!("Bearer {token}").as_str()))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"ipAddress": addrs.ip_address,
				"publicIpAddress": addrs.public_ip_address,
				"pscDnsName": addrs.psc_dns_name,
			})))
			.mount(&server)
			.await;

		Mock::given(method("POST"))
			.and(path(
				"/v1beta/projects/test-project/locations/test-region/clusters/test-cluster:generateClientCertificate",
			))
			.and(header("Authorization", format!("Bearer {token}").as_str()))
			.respond_with(CertificateIssuer {
				ttl_secs: cert_ttl_secs,
			})
			.mount(&server)
			.await;

		MockControlPlane { server }
	}

	/// How many metadata + certificate pairs the connector has issued.
	pub async fn refresh_pairs(&self) -> (usize, usize) {
		let requests = self.server.received_requests().await.unwrap_or_default();
		let metadata = requests
			.iter()
			.filter(|r| r.url.path().ends_with("/connectionInfo"))
			.count();
		let certificates = requests
			.iter()
			.filter(|r| r.url.path().ends_with(":generateClientCertificate"))
			.count();
		(metadata, certificates)
	}

	/// Poll until at least `n` certificate requests have been observed.
	pub async fn wait_for_certificate_requests(&self, n: usize) {
		for _ in 0..100 {
			let (_, certs) = self.refresh_pairs().await;
			if certs >= n {
				return;
			}
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		}
		let (_, certs) = self.refresh_pairs().await;
		panic!("expected at least {n} certificate requests, saw {certs}");
	}
}
