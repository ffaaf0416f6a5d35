// Shared harness for connector integration tests: an openssl-backed test CA,
// a wiremock control plane, and a TLS server standing in for the server-side
// proxy.
#![allow(dead_code)]

pub mod ca;
pub mod control_plane;
pub mod proxy;

pub const INSTANCE_URI: &str =
	"projects/test-project/locations/test-region/clusters/test-cluster/instances/test-instance";

/// Install a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
	use std::sync::Once;
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}
