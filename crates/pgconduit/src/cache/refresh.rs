use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, BoxFuture, Shared};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::conninfo::ConnectionInfo;
use crate::control::ControlPlaneClient;
use crate::errors::Error;
use crate::keys::SharedKeys;
use crate::ratelimit::AsyncRateLimiter;
use crate::types::InstanceUri;

/// Safety margin between a scheduled refresh and certificate expiration.
pub(crate) const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);

/// How long to wait before the next refresh: half the remaining certificate
/// lifetime when there is plenty, otherwise up to the buffer before expiry,
/// otherwise now.
pub(crate) fn seconds_until_refresh(expiration: SystemTime, now: SystemTime) -> Duration {
	let remaining = expiration
		.duration_since(now)
		.unwrap_or(Duration::ZERO)
		.as_secs();
	let delay = if remaining < 3600 {
		remaining.saturating_sub(REFRESH_BUFFER.as_secs())
	} else {
		remaining / 2
	};
	Duration::from_secs(delay)
}

type RefreshResult = Result<Arc<ConnectionInfo>, Error>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// One scheduled refresh: a result any number of callers can await, plus the
/// handle that cancels the task producing it.
#[derive(Clone)]
struct RefreshTask {
	result: SharedRefresh,
	abort: AbortHandle,
}

impl std::fmt::Debug for RefreshTask {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RefreshTask").finish_non_exhaustive()
	}
}

impl RefreshTask {
	/// Settled with an unexpired snapshot.
	fn has_valid_result(&self) -> bool {
		matches!(self.result.peek(), Some(Ok(info)) if info.is_valid())
	}

	/// Settled with an error or an expired snapshot. An unresolved task is
	/// neither valid nor failed; a pending result is left in place rather
	/// than discarded.
	fn has_failed_or_expired(&self) -> bool {
		match self.result.peek() {
			Some(Ok(info)) => !info.is_valid(),
			Some(Err(_)) => true,
			None => false,
		}
	}
}

#[derive(Debug)]
struct CacheState {
	/// The newest successful refresh, or the refresh callers should block on.
	current: RefreshTask,
	/// The scheduled upcoming refresh.
	next: RefreshTask,
}

struct CacheShared {
	uri: InstanceUri,
	client: Arc<ControlPlaneClient>,
	keys: SharedKeys,
	limiter: AsyncRateLimiter,
	refresh_in_progress: AtomicBool,
	/// `None` only while the constructor is installing the first refresh; the
	/// constructor holds the lock across that window.
	state: Mutex<Option<CacheState>>,
}

impl std::fmt::Debug for CacheShared {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheShared")
			.field("uri", &self.uri)
			.field("client", &self.client)
			.field("limiter", &self.limiter)
			.field("refresh_in_progress", &self.refresh_in_progress)
			.field("state", &self.state)
			.finish_non_exhaustive()
	}
}

/// Clears the in-progress flag on every exit path, including task abort.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Cache that keeps a valid [`ConnectionInfo`] available at all times by
/// refreshing ahead of certificate expiration from background tasks.
///
/// Two tasks are tracked: `current`, which callers await, and `next`, the
/// scheduled upcoming refresh. A successful refresh installs itself as
/// `current` and schedules its successor; a failed one reschedules
/// immediately and only replaces `current` when the existing result is
/// itself unusable, so a still-valid certificate is never discarded for a
/// transient control-plane failure.
#[derive(Debug)]
pub(crate) struct RefreshAheadCache {
	shared: Arc<CacheShared>,
}

impl RefreshAheadCache {
	/// Must be called from within a tokio runtime; the first refresh is
	/// scheduled immediately and callers block on it until it completes.
	pub(crate) fn new(uri: InstanceUri, client: Arc<ControlPlaneClient>, keys: SharedKeys) -> Self {
		let shared = Arc::new(CacheShared {
			uri,
			client,
			keys,
			limiter: AsyncRateLimiter::new(2, 1.0 / 30.0),
			refresh_in_progress: AtomicBool::new(false),
			state: Mutex::new(None),
		});
		{
			// Hold the lock while spawning so the task cannot observe the
			// uninitialized state.
			let mut state = shared.state.lock().unwrap();
			let first = CacheShared::schedule(&shared, Duration::ZERO);
			*state = Some(CacheState {
				current: first.clone(),
				next: first,
			});
		}
		RefreshAheadCache { shared }
	}

	/// Await the newest refresh result, returning its snapshot or re-raising
	/// its error. Non-blocking in steady state.
	pub(crate) async fn connect_info(&self) -> RefreshResult {
		let current = {
			let state = self.shared.state.lock().unwrap();
			state.as_ref().expect("cache state is initialized").current.result.clone()
		};
		current.await
	}

	/// Cancel the scheduled refresh and replace it with an immediate one.
	///
	/// An in-progress refresh is never cancelled; it runs to completion. When
	/// the existing `current` has failed or expired, callers are pointed at
	/// the new refresh so they block on fresh data instead of seeing stale
	/// results.
	pub(crate) fn force_refresh(&self) {
		let mut state = self.shared.state.lock().unwrap();
		let state = state.as_mut().expect("cache state is initialized");
		if !self.shared.refresh_in_progress.load(Ordering::SeqCst) {
			let cancelled = state.next.clone();
			cancelled.abort.abort();
			state.next = CacheShared::schedule(&self.shared, Duration::ZERO);
			// Before the first refresh completes, `current` and `next` are the
			// same task; cancelling it must repoint callers at the new one.
			if state.current.result.ptr_eq(&cancelled.result) {
				state.current = state.next.clone();
			}
		}
		if state.current.has_failed_or_expired() {
			state.current = state.next.clone();
		}
	}

	/// Cancel both refresh tasks and wait up to two seconds for them to
	/// settle.
	pub(crate) async fn close(&self) {
		debug!(instance = %self.shared.uri, "canceling refresh tasks");
		let (current, next) = {
			let state = self.shared.state.lock().unwrap();
			let state = state.as_ref().expect("cache state is initialized");
			(state.current.clone(), state.next.clone())
		};
		current.abort.abort();
		next.abort.abort();
		let _ = tokio::time::timeout(Duration::from_secs(2), async {
			let _ = current.result.await;
			let _ = next.result.await;
		})
		.await;
	}
}

impl Drop for RefreshAheadCache {
	fn drop(&mut self) {
		if let Ok(state) = self.shared.state.lock()
			&& let Some(state) = state.as_ref()
		{
			state.current.abort.abort();
			state.next.abort.abort();
		}
	}
}

impl CacheShared {
	fn schedule(shared: &Arc<CacheShared>, delay: Duration) -> RefreshTask {
		let (tx, rx) = oneshot::channel();
		let result: SharedRefresh = rx
			.map(|received: Result<RefreshResult, _>| {
				received.unwrap_or(Err(Error::Cancelled))
			})
			.boxed()
			.shared();
		let (abort, registration) = AbortHandle::new_pair();
		let task = RefreshTask {
			result: result.clone(),
			abort,
		};
		tokio::spawn(Abortable::new(
			CacheShared::run_refresh(shared.clone(), delay, task.clone(), tx),
			registration,
		));
		task
	}

	async fn run_refresh(
		shared: Arc<CacheShared>,
		delay: Duration,
		me: RefreshTask,
		tx: oneshot::Sender<RefreshResult>,
	) {
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let result = {
			let _guard = InProgressGuard(&shared.refresh_in_progress);
			shared.refresh_in_progress.store(true, Ordering::SeqCst);
			shared.perform_refresh().await
		};

		{
			let mut state = shared.state.lock().unwrap();
			let state = state.as_mut().expect("cache state is initialized");
			match &result {
				Ok(info) => {
					let delay = seconds_until_refresh(info.expiration(), SystemTime::now());
					debug!(
						instance = %shared.uri,
						delay_secs = delay.as_secs(),
						"refresh complete, next refresh scheduled"
					);
					state.current = me.clone();
					state.next = CacheShared::schedule(&shared, delay);
				},
				Err(e) => {
					info!(
						instance = %shared.uri,
						error = %e,
						"refresh failed, scheduling another attempt immediately"
					);
					// Keep a still-valid current; never replace good data
					// with a failure.
					if !state.current.has_valid_result() {
						state.current = me.clone();
					}
					state.next = CacheShared::schedule(&shared, Duration::ZERO);
				},
			}
		}

		// Publish after the state swap so a woken caller re-reading `current`
		// sees the new arrangement.
		let _ = tx.send(result);
	}

	async fn perform_refresh(&self) -> RefreshResult {
		debug!(instance = %self.uri, "refresh operation started");
		self.limiter.acquire().await;
		let info = self
			.client
			.get_connection_info(&self.uri, self.keys.clone())
			.await?;
		if !info.is_valid() {
			return Err(Error::Refresh);
		}
		Ok(info)
	}
}
