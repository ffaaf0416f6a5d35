use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::errors::Error;

/// RSA key pair shared by every cache a connector owns.
///
/// The private key stays in memory as PKCS#8 DER (handed to rustls for client
/// authentication); the public key is materialised as a PEM-encoded
/// SubjectPublicKeyInfo string, which is what the control plane signs.
pub struct KeyPair {
	private_der: PrivatePkcs8KeyDer<'static>,
	public_pem: String,
}

impl fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyPair").finish_non_exhaustive()
	}
}

impl KeyPair {
	/// Generate a fresh RSA-2048 key pair (public exponent 65537).
	///
	/// This is CPU-bound; callers on an async runtime should wrap it in
	/// [`spawn_generate`].
	pub fn generate() -> Result<Self, Error> {
		let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
			.map_err(|e| Error::Keys(e.to_string()))?;
		Self::from_private_key(key)
	}

	/// Load a key pair from a PEM-encoded private key (PKCS#8 or PKCS#1).
	pub fn from_private_key_pem(pem: &str) -> Result<Self, Error> {
		let key = RsaPrivateKey::from_pkcs8_pem(pem)
			.or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
			.map_err(|e| Error::Keys(format!("invalid private key PEM: {e}")))?;
		Self::from_private_key(key)
	}

	fn from_private_key(key: RsaPrivateKey) -> Result<Self, Error> {
		let public_pem = key
			.to_public_key()
			.to_public_key_pem(LineEnding::LF)
			.map_err(|e| Error::Keys(e.to_string()))?;
		let private_der = key
			.to_pkcs8_der()
			.map_err(|e| Error::Keys(e.to_string()))?;
		Ok(KeyPair {
			private_der: PrivatePkcs8KeyDer::from(private_der.as_bytes().to_vec()),
			public_pem,
		})
	}

	pub fn public_key_pem(&self) -> &str {
		&self.public_pem
	}

	pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
		PrivateKeyDer::Pkcs8(self.private_der.clone_key())
	}
}

/// A key-pair generation started once and awaited by every cache.
pub(crate) type SharedKeys = Shared<BoxFuture<'static, Result<Arc<KeyPair>, Error>>>;

/// Kick off key generation on the blocking pool and return a future that any
/// number of callers can await.
pub(crate) fn spawn_generate() -> SharedKeys {
	tokio::task::spawn_blocking(KeyPair::generate)
		.map(|join| match join {
			Ok(result) => result.map(Arc::new),
			Err(e) => Err(Error::Keys(format!("key generation task failed: {e}"))),
		})
		.boxed()
		.shared()
}
