//! Client-side connector for managed, PostgreSQL-compatible database
//! instances sitting behind an administrative control plane.
//!
//! The connector does not speak the database wire protocol. It obtains,
//! caches, and refreshes the materials a driver needs to open a secure
//! connection — a resolved instance address, a short-lived client certificate
//! chain, and a TLS config pinned to the instance CA — and, for the
//! synchronous driver family, performs the server proxy's metadata exchange
//! on the established mTLS stream before handing it off.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pgconduit::{ConnectOptions, Connector, Driver, StaticCredentials};
//!
//! # async fn run() -> Result<(), pgconduit::Error> {
//! let connector = Connector::builder()
//! 	.credentials(Arc::new(StaticCredentials::new("oauth2-token")))
//! 	.build()?;
//!
//! let stream = connector
//! 	.connect(
//! 		"projects/my-project/locations/us-central1/clusters/my-cluster/instances/my-instance",
//! 		Driver::Postgres,
//! 		ConnectOptions::default(),
//! 	)
//! 	.await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

mod cache;
mod conninfo;
mod connector;
mod control;
mod credentials;
mod errors;
mod keys;
mod ratelimit;
mod tls;
mod types;

pub mod blocking;
pub mod exchange;

pub use conninfo::ConnectionInfo;
pub use connector::{
	ConnectOptions, ConnectedStream, Connector, ConnectorBuilder, DEFAULT_API_ENDPOINT,
	PreparedConnect,
};
pub use credentials::{BoxError, Credentials, StaticCredentials, TokenState};
pub use errors::Error;
pub use keys::KeyPair;
pub use types::{Driver, InstanceUri, IpType, RefreshStrategy};
