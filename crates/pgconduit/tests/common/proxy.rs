// Mock server-side proxy: terminates mTLS on an ephemeral port, optionally
// performs the metadata exchange, then echoes whatever the client sends (a
// stand-in for the database protocol).

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use pgconduit::exchange::{MetadataExchangeRequest, MetadataExchangeResponse, ResponseCode};

use super::ca::get_shared_ca;

#[derive(Clone)]
pub enum ExchangeBehavior {
	/// Complete the exchange with an OK response.
	Ok,
	/// Complete the exchange with an ERROR response carrying this message.
	Error(String),
	/// Close the connection without answering the exchange.
	CloseBeforeResponse,
	/// Skip the exchange entirely (async driver family).
	None,
}

/// The last exchange request the proxy observed, for assertions.
pub type SeenRequest = Arc<std::sync::Mutex<Option<MetadataExchangeRequest>>>;

pub struct MockProxy {
	pub addr: SocketAddr,
	pub seen: SeenRequest,
}

fn server_tls_config() -> Arc<rustls::ServerConfig> {
	let ca = get_shared_ca();
	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

	let mut roots = rustls::RootCertStore::empty();
	let root_der: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(ca.root_pem().into_bytes()))
		.collect::<Result<_, _>>()
		.unwrap();
	roots.add_parsable_certificates(root_der);

	let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
		Arc::new(roots),
		provider.clone(),
	)
	.build()
	.unwrap();

	let (chain_pem, key_pem) = ca.issue_server_identity();
	let chain: Vec<_> = chain_pem
		.iter()
		.flat_map(|pem| {
			rustls_pemfile::certs(&mut Cursor::new(pem.clone().into_bytes()))
				.collect::<Result<Vec<_>, _>>()
				.unwrap()
		})
		.collect();
	let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem.into_bytes()))
		.unwrap()
		.unwrap();

	let config = rustls::ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()
		.unwrap()
		.with_client_cert_verifier(verifier)
		.with_single_cert(chain, key)
		.unwrap();
	Arc::new(config)
}

/// A server config whose certificate does not chain to the shared test CA.
/// Used to prove the connector rejects servers the instance CA never issued.
pub fn foreign_tls_config() -> Arc<rustls::ServerConfig> {
	use openssl::asn1::Asn1Time;
	use openssl::hash::MessageDigest;
	use openssl::pkey::PKey;
	use openssl::rsa::Rsa;
	use openssl::x509::{X509Builder, X509NameBuilder};

	let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
	let mut name = X509NameBuilder::new().unwrap();
	name.append_entry_by_text("CN", "foreign server").unwrap();
	let name = name.build();

	let mut builder = X509Builder::new().unwrap();
	builder.set_version(2).unwrap();
	builder.set_subject_name(&name).unwrap();
	builder.set_issuer_name(&name).unwrap();
	builder
		.set_not_before(&Asn1Time::days_from_now(0).unwrap())
		.unwrap();
	builder
		.set_not_after(&Asn1Time::days_from_now(1).unwrap())
		.unwrap();
	builder.set_pubkey(&key).unwrap();
	builder.sign(&key, MessageDigest::sha256()).unwrap();
	let cert_pem = builder.build().to_pem().unwrap();

	let chain: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
		.collect::<Result<_, _>>()
		.unwrap();
	let key = rustls_pemfile::private_key(&mut Cursor::new(
		key.private_key_to_pem_pkcs8().unwrap(),
	))
	.unwrap()
	.unwrap();

	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let config = rustls::ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(chain, key)
		.unwrap();
	Arc::new(config)
}

/// Bind a proxy on `ip` at the fixed server-proxy port and serve connections
/// until the test's runtime shuts down. Each test passes a distinct loopback
/// address (`127.0.0.2`, `127.0.0.3`, ...) so suites can run concurrently
/// even though the port is fixed.
pub async fn start(behavior: ExchangeBehavior, ip: &str) -> MockProxy {
	let listener = tokio::net::TcpListener::bind((ip, pgconduit::exchange::SERVER_PROXY_PORT))
		.await
		.unwrap();
	let addr = listener.local_addr().unwrap();
	let acceptor = TlsAcceptor::from(server_tls_config());
	let seen: SeenRequest = Arc::default();

	let seen_handle = seen.clone();
	tokio::spawn(async move {
		loop {
			let Ok((tcp, _)) = listener.accept().await else {
				return;
			};
			let acceptor = acceptor.clone();
			let behavior = behavior.clone();
			let seen = seen_handle.clone();
			tokio::spawn(async move {
				let Ok(mut stream) = acceptor.accept(tcp).await else {
					return;
				};
				match behavior {
					ExchangeBehavior::Ok => {
						if handle_exchange(&mut stream, &seen, ResponseCode::Ok, "").await.is_err() {
							return;
						}
					},
					ExchangeBehavior::Error(message) => {
						let _ =
							handle_exchange(&mut stream, &seen, ResponseCode::Error, &message).await;
						return;
					},
					ExchangeBehavior::CloseBeforeResponse => {
						let _ = read_exchange_request(&mut stream, &seen).await;
						return;
					},
					ExchangeBehavior::None => {},
				}
				echo(&mut stream).await;
			});
		}
	});

	MockProxy { addr, seen }
}

async fn read_exchange_request<S>(stream: &mut S, seen: &SeenRequest) -> std::io::Result<()>
where
	S: tokio::io::AsyncRead + Unpin,
{
	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf).await?;
	let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
	stream.read_exact(&mut body).await?;
	let request = MetadataExchangeRequest::decode(body.as_slice())
		.map_err(|e| std::io::Error::other(e.to_string()))?;
	*seen.lock().unwrap() = Some(request);
	Ok(())
}

async fn handle_exchange<S>(
	stream: &mut S,
	seen: &SeenRequest,
	code: ResponseCode,
	error: &str,
) -> std::io::Result<()>
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	read_exchange_request(stream, seen).await?;

	let response = MetadataExchangeResponse {
		response_code: code as i32,
		error: error.to_string(),
	};
	let mut buf = (response.encoded_len() as u32).to_be_bytes().to_vec();
	response.encode(&mut buf).unwrap();
	stream.write_all(&buf).await?;
	stream.flush().await
}

async fn echo<S>(stream: &mut S)
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let mut buf = [0u8; 1024];
	loop {
		match stream.read(&mut buf).await {
			Ok(0) | Err(_) => return,
			Ok(n) => {
				if stream.write_all(&buf[..n]).await.is_err() {
					return;
				}
				let _ = stream.flush().await;
			},
		}
	}
}
