use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Canonical identifier of one database instance:
/// `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`.
///
/// The project segment may carry a domain-scoped prefix
/// (`<DOMAIN>:<PROJECT>`); no other segment may contain a colon.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceUri {
	project: String,
	location: String,
	cluster: String,
	instance: String,
}

impl InstanceUri {
	pub fn project(&self) -> &str {
		&self.project
	}

	pub fn location(&self) -> &str {
		&self.location
	}

	pub fn cluster(&self) -> &str {
		&self.cluster
	}

	pub fn instance(&self) -> &str {
		&self.instance
	}
}

impl FromStr for InstanceUri {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		let invalid = || {
			Error::Config(format!(
				"instance URI must have format: \
				 projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE> or \
				 projects/<DOMAIN>:<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>, \
				 got '{s}'."
			))
		};

		let parts: Vec<&str> = s.split('/').collect();
		let ["projects", project, "locations", location, "clusters", cluster, "instances", instance] =
			parts.as_slice()
		else {
			return Err(invalid());
		};

		// One embedded colon is allowed in the project segment only
		// (domain-scoped projects).
		if project.split(':').count() > 2 || project.split(':').any(str::is_empty) {
			return Err(invalid());
		}
		for segment in [location, cluster, instance] {
			if segment.is_empty() || segment.contains(':') {
				return Err(invalid());
			}
		}

		Ok(InstanceUri {
			project: project.to_string(),
			location: location.to_string(),
			cluster: cluster.to_string(),
			instance: instance.to_string(),
		})
	}
}

impl fmt::Display for InstanceUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"projects/{}/locations/{}/clusters/{}/instances/{}",
			self.project, self.location, self.cluster, self.instance
		)
	}
}

/// The kind of endpoint to connect to on an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpType {
	Public,
	Private,
	/// A managed-network endpoint exposing a DNS name instead of a raw IP.
	Psc,
}

impl IpType {
	pub fn as_str(&self) -> &'static str {
		match self {
			IpType::Public => "PUBLIC",
			IpType::Private => "PRIVATE",
			IpType::Psc => "PSC",
		}
	}
}

impl fmt::Display for IpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for IpType {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s.to_ascii_uppercase().as_str() {
			"PUBLIC" => Ok(IpType::Public),
			"PRIVATE" => Ok(IpType::Private),
			"PSC" => Ok(IpType::Psc),
			_ => Err(Error::Config(format!(
				"Incorrect value for ip_type, got '{s}'. Want one of: 'PUBLIC', 'PRIVATE', 'PSC'."
			))),
		}
	}
}

/// How a per-instance cache keeps its certificate and metadata fresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshStrategy {
	/// Refresh ahead of expiration from a background task; connection
	/// requests are non-blocking in steady state.
	#[default]
	Background,
	/// Refresh on demand when a connection is requested and the cached
	/// certificate is close to expiring. Suited to serverless hosts where
	/// background tasks may be suspended between calls.
	Lazy,
}

impl FromStr for RefreshStrategy {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s.to_ascii_uppercase().as_str() {
			"BACKGROUND" => Ok(RefreshStrategy::Background),
			"LAZY" => Ok(RefreshStrategy::Lazy),
			_ => Err(Error::Config(format!(
				"Incorrect value for refresh_strategy, got '{s}'. Want one of: 'LAZY', 'BACKGROUND'."
			))),
		}
	}
}

/// The database driver family the connection is being prepared for.
///
/// The synchronous family performs the server proxy's metadata exchange on
/// the established TLS stream before the database protocol starts; the async
/// family receives the prepared materials and dials on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driver {
	Postgres,
	TokioPostgres,
}

impl Driver {
	pub fn as_str(&self) -> &'static str {
		match self {
			Driver::Postgres => "postgres",
			Driver::TokioPostgres => "tokio-postgres",
		}
	}

	pub(crate) fn requires_metadata_exchange(&self) -> bool {
		matches!(self, Driver::Postgres)
	}
}

impl fmt::Display for Driver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Driver {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s {
			"postgres" => Ok(Driver::Postgres),
			"tokio-postgres" => Ok(Driver::TokioPostgres),
			_ => Err(Error::Config(format!(
				"Driver '{s}' is not a supported database driver."
			))),
		}
	}
}
