use crate::types::IpType;

/// Crate-wide error type.
///
/// The enum is `Clone` because refresh results are fanned out to every caller
/// awaiting the same in-flight refresh through a shared future; sources that
/// do not implement `Clone` are rendered to strings at the point of capture.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	/// Invalid configuration: malformed instance URI, unknown IP type or
	/// refresh strategy, unsupported driver. Raised before any I/O.
	#[error("{0}")]
	Config(String),

	/// A control-plane call failed, either at the transport level or with a
	/// non-2xx status. Carries the server's structured message when one could
	/// be parsed out of the response body.
	#[error("control plane error: {0}")]
	Upstream(String),

	/// A refresh completed but the returned certificate was already expired.
	#[error("Invalid refresh operation. Certificate appears to be expired.")]
	Refresh,

	/// The resolved connection info has no usable address for the requested
	/// IP type.
	#[error("instance does not have an IP address matching type: '{0}'")]
	IpTypeNotFound(IpType),

	/// `connect` was called after `close`.
	#[error("Connection attempt failed because the connector has already been closed.")]
	ClosedConnector,

	/// TLS or metadata-exchange failure on the data plane, including a socket
	/// closed mid-exchange and a non-OK exchange response.
	#[error("{0}")]
	Handshake(String),

	/// A scheduled refresh task was cancelled before it produced a result.
	#[error("refresh operation cancelled")]
	Cancelled,

	#[error("certificate: {0}")]
	CertificateParse(String),

	#[error("key pair: {0}")]
	Keys(String),

	#[error("rustls: {0}")]
	Tls(#[from] rustls::Error),

	#[error("rustls verifier: {0}")]
	Verifier(#[from] rustls::server::VerifierBuilderError),
}
