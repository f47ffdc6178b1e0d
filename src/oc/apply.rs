//! Executes a changeset against the platform in a safe order: deletions
//! first, then the delete phase of recreations, creations, the create phase
//! of recreations, and updates last so they see freshly created dependencies.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::output::Renderer;
use super::{Platform, PlatformError};
use crate::changeset::{Change, Changeset};
use crate::resource::Resource;

/// How long to wait for a deleted resource to disappear before giving up
/// on recreating it.
const RECREATE_DEADLINE: Duration = Duration::from_secs(60);
const RECREATE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("recreating {key}: resource still present after {seconds}s")]
	RecreateTimedOut { key: String, seconds: u64 },

	#[error(transparent)]
	Platform(#[from] PlatformError),
}

/// One item that failed; the driver keeps going and reports these at the end.
#[derive(Debug)]
pub struct ItemFailure {
	pub key: String,
	pub error: ApplyError,
}

/// What happened across the whole changeset.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
	pub applied: usize,
	pub failures: Vec<ItemFailure>,
}

impl ApplyOutcome {
	pub fn failed(&self) -> bool {
		!self.failures.is_empty()
	}
}

/// Drives a changeset through the platform. No rollback: failures are
/// collected per item and independent items keep going.
pub struct ApplyEngine<'a> {
	platform: &'a dyn Platform,
	recreate_deadline: Duration,
	recreate_poll: Duration,
}

impl<'a> ApplyEngine<'a> {
	pub fn new(platform: &'a dyn Platform) -> Self {
		Self {
			platform,
			recreate_deadline: RECREATE_DEADLINE,
			recreate_poll: RECREATE_POLL,
		}
	}

	/// Shorten the recreate poll loop; tests use this to avoid waiting.
	pub fn with_deadline(mut self, deadline: Duration, poll: Duration) -> Self {
		self.recreate_deadline = deadline;
		self.recreate_poll = poll;
		self
	}

	/// Apply every mutation bucket in order. Returns `Err` only on
	/// interruption; per-item errors land in the outcome.
	#[instrument(skip_all)]
	pub async fn apply(
		&self,
		changeset: &Changeset,
		renderer: &mut dyn Renderer,
	) -> Result<ApplyOutcome, PlatformError> {
		let mut outcome = ApplyOutcome::default();

		for change in &changeset.delete {
			let key = change.item_name();
			match self.delete(change).await {
				Ok(()) => {
					renderer.info(&format!("Deleted {}", key));
					outcome.applied += 1;
				}
				Err(e) => self.record(&mut outcome, renderer, key, e)?,
			}
		}

		// Recreation frees names before anything is created.
		let mut recreate_ready = Vec::with_capacity(changeset.recreate.len());
		for change in &changeset.recreate {
			let key = change.item_name();
			match self.delete(change).await {
				Ok(()) => recreate_ready.push(true),
				Err(e) => {
					recreate_ready.push(false);
					self.record(&mut outcome, renderer, key, e)?;
				}
			}
		}
		for (change, ready) in changeset.recreate.iter().zip(recreate_ready.iter_mut()) {
			if !*ready {
				continue;
			}
			let key = change.item_name();
			if let Err(e) = self.wait_absent(change).await {
				*ready = false;
				self.record(&mut outcome, renderer, key, e)?;
			}
		}

		for change in &changeset.create {
			let key = change.item_name();
			match self.create(change).await {
				Ok(()) => {
					renderer.info(&format!("Created {}", key));
					outcome.applied += 1;
				}
				Err(e) => self.record(&mut outcome, renderer, key, e)?,
			}
		}

		for (change, ready) in changeset.recreate.iter().zip(&recreate_ready) {
			if !*ready {
				continue;
			}
			let key = change.item_name();
			match self.create(change).await {
				Ok(()) => {
					renderer.info(&format!("Recreated {}", key));
					outcome.applied += 1;
				}
				Err(e) => self.record(&mut outcome, renderer, key, e)?,
			}
		}

		for change in &changeset.update {
			let key = change.item_name();
			match self.update(change).await {
				Ok(()) => {
					renderer.info(&format!("Updated {}", key));
					outcome.applied += 1;
				}
				Err(e) => self.record(&mut outcome, renderer, key, e)?,
			}
		}

		Ok(outcome)
	}

	/// Collect one failure, or abort everything on interruption.
	fn record(
		&self,
		outcome: &mut ApplyOutcome,
		renderer: &mut dyn Renderer,
		key: String,
		error: ApplyError,
	) -> Result<(), PlatformError> {
		if matches!(error, ApplyError::Platform(PlatformError::Interrupted)) {
			return Err(PlatformError::Interrupted);
		}
		warn!(key = %key, error = %error, "item failed");
		renderer.error(&format!("Failed {}: {}", key, error));
		outcome.failures.push(ItemFailure { key, error });
		Ok(())
	}

	async fn delete(&self, change: &Change) -> Result<(), ApplyError> {
		let current = side(&change.current);
		self.platform.delete(&current.kind, &current.name).await?;
		Ok(())
	}

	async fn create(&self, change: &Change) -> Result<(), ApplyError> {
		let desired = side(&change.desired);
		let yaml = serde_yaml::to_string(&desired.payload)
			.map_err(|e| PlatformError::Adapter {
				bin: String::new(),
				args: "create".to_string(),
				stderr: e.to_string(),
			})?;
		self.platform.create(&yaml).await?;
		Ok(())
	}

	async fn update(&self, change: &Change) -> Result<(), ApplyError> {
		let desired = side(&change.desired);
		self.platform
			.patch(&desired.kind, &desired.name, &change.patches)
			.await?;
		Ok(())
	}

	/// Poll until the platform reports the old object gone.
	async fn wait_absent(&self, change: &Change) -> Result<(), ApplyError> {
		let current = side(&change.current);
		let deadline = Instant::now() + self.recreate_deadline;
		loop {
			if self
				.platform
				.get(&current.kind, &current.name)
				.await?
				.is_none()
			{
				info!(key = %change.item_name(), "old resource gone");
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(ApplyError::RecreateTimedOut {
					key: change.item_name(),
					seconds: self.recreate_deadline.as_secs(),
				});
			}
			tokio::time::sleep(self.recreate_poll).await;
		}
	}
}

fn side(resource: &Option<Resource>) -> &Resource {
	resource
		.as_ref()
		.expect("changeset invariant: required side present")
}
