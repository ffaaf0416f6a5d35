//! Metadata exchange with the server-side proxy.
//!
//! Runs on the freshly established mTLS stream before any database protocol
//! bytes flow, conveying the caller's identity: user-agent, auth-type
//! selection, and a fresh OAuth2 token. Both directions are framed as a
//! big-endian 4-byte length prefix (not counting itself) followed by exactly
//! that many bytes of serialised message.

use std::io;
use std::time::Duration;

use prost::Message;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::Error;

/// The port the server-side proxy receives connections on.
pub const SERVER_PROXY_PORT: u16 = 5433;

/// The maximum amount of time to wait before aborting a metadata exchange.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

const CLOSED_DURING_LENGTH: &str = "Connection closed while getting metadata exchange length!";
const CLOSED_DURING_BODY: &str = "Connection closed while performing metadata exchange!";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetadataExchangeRequest {
	#[prost(string, tag = "1")]
	pub user_agent: String,
	#[prost(enumeration = "AuthType", tag = "2")]
	pub auth_type: i32,
	#[prost(string, tag = "3")]
	pub oauth2_token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthType {
	Unspecified = 0,
	DbNative = 1,
	AutoIam = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetadataExchangeResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub response_code: i32,
	#[prost(string, tag = "2")]
	pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
	Unspecified = 0,
	Ok = 1,
	Error = 2,
}

pub(crate) fn request(
	user_agent: &str,
	enable_iam_auth: bool,
	token: &SecretString,
) -> MetadataExchangeRequest {
	let auth_type = if enable_iam_auth {
		AuthType::AutoIam
	} else {
		AuthType::DbNative
	};
	MetadataExchangeRequest {
		user_agent: user_agent.to_string(),
		auth_type: auth_type as i32,
		oauth2_token: token.expose_secret().to_string(),
	}
}

fn frame(request: &MetadataExchangeRequest) -> Vec<u8> {
	let len = request.encoded_len();
	let mut buf = Vec::with_capacity(4 + len);
	buf.extend_from_slice(&(len as u32).to_be_bytes());
	request
		.encode(&mut buf)
		.expect("Vec<u8> has unbounded capacity");
	buf
}

fn check_response(response: MetadataExchangeResponse) -> Result<(), Error> {
	if ResponseCode::try_from(response.response_code) != Ok(ResponseCode::Ok) {
		return Err(Error::Handshake(format!(
			"Metadata Exchange request has failed with error: {}",
			response.error
		)));
	}
	Ok(())
}

fn map_read_err(e: io::Error, closed_message: &str) -> Error {
	if e.kind() == io::ErrorKind::UnexpectedEof {
		Error::Handshake(closed_message.to_string())
	} else {
		Error::Handshake(format!("metadata exchange failed: {e}"))
	}
}

/// Perform the exchange on an async stream, bounded by [`IO_TIMEOUT`].
pub(crate) async fn exchange_async<S>(
	stream: &mut S,
	request: &MetadataExchangeRequest,
) -> Result<(), Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	tokio::time::timeout(IO_TIMEOUT, async {
		stream
			.write_all(&frame(request))
			.await
			.map_err(|e| Error::Handshake(format!("metadata exchange failed: {e}")))?;
		stream
			.flush()
			.await
			.map_err(|e| Error::Handshake(format!("metadata exchange failed: {e}")))?;

		let mut len_buf = [0u8; 4];
		stream
			.read_exact(&mut len_buf)
			.await
			.map_err(|e| map_read_err(e, CLOSED_DURING_LENGTH))?;
		let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
		stream
			.read_exact(&mut body)
			.await
			.map_err(|e| map_read_err(e, CLOSED_DURING_BODY))?;

		let response = MetadataExchangeResponse::decode(body.as_slice())
			.map_err(|e| Error::Handshake(format!("invalid metadata exchange response: {e}")))?;
		check_response(response)
	})
	.await
	.map_err(|_| Error::Handshake("metadata exchange timed out".to_string()))?
}

/// Blocking flavor for the synchronous facade. The caller owns the I/O
/// deadline (socket read/write timeouts around this call).
pub(crate) fn exchange_blocking<S>(
	stream: &mut S,
	request: &MetadataExchangeRequest,
) -> Result<(), Error>
where
	S: io::Read + io::Write,
{
	stream
		.write_all(&frame(request))
		.and_then(|()| stream.flush())
		.map_err(|e| Error::Handshake(format!("metadata exchange failed: {e}")))?;

	let mut len_buf = [0u8; 4];
	stream
		.read_exact(&mut len_buf)
		.map_err(|e| map_read_err(e, CLOSED_DURING_LENGTH))?;
	let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
	stream
		.read_exact(&mut body)
		.map_err(|e| map_read_err(e, CLOSED_DURING_BODY))?;

	let response = MetadataExchangeResponse::decode(body.as_slice())
		.map_err(|e| Error::Handshake(format!("invalid metadata exchange response: {e}")))?;
	check_response(response)
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;
