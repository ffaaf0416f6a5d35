// Test CA hierarchy: a root, an intermediate, and helpers that mint leaf
// certificates for arbitrary public keys (the control-plane mock signs
// whatever SPKI the connector submits, exactly like the real service).

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509, X509Builder, X509NameBuilder};

static SHARED_CA: OnceLock<SharedCa> = OnceLock::new();

pub struct SharedCa {
	pub root_key: Arc<PKey<Private>>,
	pub root_cert: Arc<X509>,
	pub inter_key: Arc<PKey<Private>>,
	pub inter_cert: Arc<X509>,
}

pub fn get_shared_ca() -> &'static SharedCa {
	SHARED_CA.get_or_init(|| SharedCa::new().expect("failed to create shared CA"))
}

fn random_serial() -> openssl::asn1::Asn1Integer {
	let mut serial = BigNum::new().unwrap();
	serial
		.rand(159, openssl::bn::MsbOption::MAYBE_ZERO, false)
		.unwrap();
	serial.to_asn1_integer().unwrap()
}

fn name(common_name: &str) -> openssl::x509::X509Name {
	let mut builder = X509NameBuilder::new().unwrap();
	builder
		.append_entry_by_nid(Nid::COMMONNAME, common_name)
		.unwrap();
	builder
		.append_entry_by_nid(Nid::ORGANIZATIONNAME, "pgconduit test")
		.unwrap();
	builder.build()
}

impl SharedCa {
	fn new() -> Result<Self, openssl::error::ErrorStack> {
		let root_key = PKey::from_rsa(Rsa::generate(2048)?)?;
		let root_name = name("pgconduit test root");

		let mut root = X509Builder::new()?;
		root.set_version(2)?;
		root.set_serial_number(&random_serial())?;
		root.set_subject_name(&root_name)?;
		root.set_issuer_name(&root_name)?;
		let root_not_before = Asn1Time::days_from_now(0)?;
		root.set_not_before(&root_not_before)?;
		let root_not_after = Asn1Time::days_from_now(365)?;
		root.set_not_after(&root_not_after)?;
		root.set_pubkey(&root_key)?;
		root.append_extension(BasicConstraints::new().critical().ca().build()?)?;
		root.sign(&root_key, MessageDigest::sha256())?;
		let root_cert = root.build();

		let inter_key = PKey::from_rsa(Rsa::generate(2048)?)?;
		let mut inter = X509Builder::new()?;
		inter.set_version(2)?;
		inter.set_serial_number(&random_serial())?;
		inter.set_subject_name(&name("pgconduit test intermediate"))?;
		inter.set_issuer_name(root_cert.subject_name())?;
		let inter_not_before = Asn1Time::days_from_now(0)?;
		inter.set_not_before(&inter_not_before)?;
		let inter_not_after = Asn1Time::days_from_now(365)?;
		inter.set_not_after(&inter_not_after)?;
		inter.set_pubkey(&inter_key)?;
		inter.append_extension(BasicConstraints::new().critical().ca().build()?)?;
		inter.sign(&root_key, MessageDigest::sha256())?;
		let inter_cert = inter.build();

		Ok(SharedCa {
			root_key: Arc::new(root_key),
			root_cert: Arc::new(root_cert),
			inter_key: Arc::new(inter_key),
			inter_cert: Arc::new(inter_cert),
		})
	}

	fn issue_leaf<T: HasPublic>(
		&self,
		common_name: &str,
		public_key: &PKeyRef<T>,
		ttl_secs: i64,
	) -> X509 {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs() as i64;
		let mut leaf = X509Builder::new().unwrap();
		leaf.set_version(2).unwrap();
		leaf.set_serial_number(&random_serial()).unwrap();
		leaf.set_subject_name(&name(common_name)).unwrap();
		leaf.set_issuer_name(self.inter_cert.subject_name()).unwrap();
		leaf.set_not_before(&Asn1Time::from_unix(now - 60).unwrap())
			.unwrap();
		leaf.set_not_after(&Asn1Time::from_unix(now + ttl_secs).unwrap())
			.unwrap();
		leaf.set_pubkey(public_key).unwrap();
		leaf.sign(&self.inter_key, MessageDigest::sha256()).unwrap();
		leaf.build()
	}

	/// Sign a client certificate for a PEM-encoded SubjectPublicKeyInfo, as
	/// the control plane does for the connector's submitted key. Returns the
	/// chain `[client, intermediate, root]`.
	pub fn issue_client_chain(&self, spki_pem: &str, ttl_secs: i64) -> Vec<String> {
		let public_key =
			PKey::public_key_from_pem(spki_pem.as_bytes()).expect("client public key PEM");
		let client = self.issue_leaf("pgconduit test client", &public_key, ttl_secs);
		vec![
			pem(&client),
			pem(&self.inter_cert),
			pem(&self.root_cert),
		]
	}

	pub fn root_pem(&self) -> String {
		pem(&self.root_cert)
	}

	/// Mint a server identity (certificate + PKCS#8 key PEM) chaining to the
	/// intermediate, for the mock server-side proxy.
	pub fn issue_server_identity(&self) -> (Vec<String>, String) {
		let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
		let cert = self.issue_leaf("pgconduit test server", &key, 3600);
		let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
		(vec![pem(&cert), pem(&self.inter_cert)], key_pem)
	}
}

pub fn pem(cert: &X509) -> String {
	String::from_utf8(cert.to_pem().unwrap()).unwrap()
}
