//! Classifies current vs desired resources into ordered mutation buckets.

use json_patch::Patch;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::patch::{self, PreservedPaths};
use crate::resource::{Resource, ResourceList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Noop,
	Create,
	Update,
	Delete,
	Recreate,
}

/// One classified difference between desired and current state.
#[derive(Debug, Clone)]
pub struct Change {
	pub action: Action,
	pub current: Option<Resource>,
	pub desired: Option<Resource>,
	/// Operations left after preserve-path filtering. Empty for
	/// `Create`/`Delete`/`Noop`.
	pub patches: Patch,
}

impl Change {
	/// `Kind/Name` of the item this change concerns.
	pub fn item_name(&self) -> String {
		self.desired
			.as_ref()
			.or(self.current.as_ref())
			.map(Resource::key)
			.unwrap_or_default()
	}

	fn sort_key(&self) -> (String, String) {
		let r = self
			.desired
			.as_ref()
			.or(self.current.as_ref())
			.expect("change carries at least one side");
		(r.kind.clone(), r.name.clone())
	}
}

#[derive(Debug, Error)]
pub enum ChangesetError {
	#[error(
		"update to {key} would change immutable path {path}; \
		 pass --allow-recreate to delete and recreate the resource"
	)]
	ImmutableFieldChanged { key: String, path: String },
}

/// Flags steering classification.
#[derive(Debug, Clone, Default)]
pub struct CompareOpts {
	pub upsert_only: bool,
	pub allow_recreate: bool,
	pub force: bool,
	pub preserved: PreservedPaths,
}

/// The classified drift between two resource inventories. Buckets are sorted
/// by `(Kind, Name)`; application order is delete, recreate, create, update.
#[derive(Debug, Default)]
pub struct Changeset {
	pub noop: Vec<Change>,
	pub create: Vec<Change>,
	pub update: Vec<Change>,
	pub delete: Vec<Change>,
	pub recreate: Vec<Change>,
}

impl Changeset {
	/// True iff no mutation bucket holds anything.
	pub fn blank(&self) -> bool {
		self.create.is_empty()
			&& self.update.is_empty()
			&& self.delete.is_empty()
			&& self.recreate.is_empty()
	}
}

/// Pair up the two inventories and classify every identity.
#[instrument(skip_all, fields(current = current.len(), desired = desired.len()))]
pub fn compare(
	current: &ResourceList,
	desired: &ResourceList,
	opts: &CompareOpts,
) -> Result<Changeset, ChangesetError> {
	// An empty desired state usually means a broken or empty template
	// directory; without --force no deletions are emitted for it.
	let suppress_deletes = desired.is_empty() && !current.is_empty() && !opts.force;
	if suppress_deletes && !opts.upsert_only {
		warn!(
			count = current.len(),
			"desired state is empty, suppressing deletions without --force"
		);
	}

	let mut changeset = Changeset::default();

	for key in desired.keys() {
		let desired_resource = desired.get(&key).expect("key comes from the list");
		let Some(current_resource) = current.get(&key) else {
			changeset.create.push(Change {
				action: Action::Create,
				current: None,
				desired: Some(desired_resource.clone()),
				patches: Patch(Vec::new()),
			});
			continue;
		};

		let full = patch::diff(&current_resource.payload, &desired_resource.payload);
		let kept: Vec<_> = full
			.0
			.into_iter()
			.filter(|op| {
				let path = patch::op_path(op);
				let preserved = opts.preserved.covers(
					&desired_resource.kind,
					&desired_resource.name,
					&path,
				);
				if preserved {
					debug!(key = %key, path = %path, "ignoring preserved path");
				}
				!preserved
			})
			.collect();
		let patches = Patch(kept);

		if patches.0.is_empty() {
			changeset.noop.push(Change {
				action: Action::Noop,
				current: Some(current_resource.clone()),
				desired: Some(desired_resource.clone()),
				patches,
			});
			continue;
		}

		if let Some((path, _)) = patch::immutable_conflict(&desired_resource.kind, &patches) {
			if !opts.allow_recreate {
				return Err(ChangesetError::ImmutableFieldChanged { key, path });
			}
			changeset.recreate.push(Change {
				action: Action::Recreate,
				current: Some(current_resource.clone()),
				desired: Some(desired_resource.clone()),
				patches,
			});
			continue;
		}

		changeset.update.push(Change {
			action: Action::Update,
			current: Some(current_resource.clone()),
			desired: Some(desired_resource.clone()),
			patches,
		});
	}

	if !opts.upsert_only && !suppress_deletes {
		for key in current.keys() {
			if desired.get(&key).is_none() {
				changeset.delete.push(Change {
					action: Action::Delete,
					current: current.get(&key).cloned(),
					desired: None,
					patches: Patch(Vec::new()),
				});
			}
		}
	}

	for bucket in [
		&mut changeset.noop,
		&mut changeset.create,
		&mut changeset.update,
		&mut changeset.delete,
		&mut changeset.recreate,
	] {
		bucket.sort_by_key(Change::sort_key);
	}

	Ok(changeset)
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::filter::ResourceFilter;
	use crate::patch::PreservedPaths;
	use crate::resource::{NormalizeOpts, Resource, Source};

	fn list(source: Source, manifests: &[serde_json::Value]) -> ResourceList {
		let mut list = ResourceList::new(ResourceFilter::default());
		for manifest in manifests {
			list.append(
				Resource::from_value(manifest.clone(), source, &NormalizeOpts::default()).unwrap(),
			)
			.unwrap();
		}
		list
	}

	fn service(name: &str, port: u16) -> serde_json::Value {
		json!({
			"apiVersion": "v1",
			"kind": "Service",
			"metadata": { "name": name },
			"spec": { "ports": [ { "port": port } ] },
		})
	}

	#[test]
	fn identical_inventories_are_blank() {
		let current = list(Source::Current, &[service("pi", 80)]);
		let desired = list(Source::Desired, &[service("pi", 80)]);
		let cs = compare(&current, &desired, &CompareOpts::default()).unwrap();
		assert!(cs.blank());
		assert_eq!(cs.noop.len(), 1);
		assert_eq!(cs.noop[0].item_name(), "Service/pi");
	}

	#[test]
	fn port_change_is_one_update() {
		let current = list(Source::Current, &[service("pi", 80)]);
		let desired = list(Source::Desired, &[service("pi", 8080)]);
		let cs = compare(&current, &desired, &CompareOpts::default()).unwrap();
		assert_eq!(cs.update.len(), 1);
		let change = &cs.update[0];
		assert_eq!(change.patches.0.len(), 1);
		assert_eq!(crate::patch::op_path(&change.patches.0[0]), "/spec/ports/0/port");
	}

	#[test]
	fn every_key_lands_in_exactly_one_bucket() {
		let current = list(
			Source::Current,
			&[service("keep", 80), service("drop", 80), service("change", 80)],
		);
		let desired = list(
			Source::Desired,
			&[service("keep", 80), service("change", 81), service("new", 80)],
		);
		let cs = compare(&current, &desired, &CompareOpts::default()).unwrap();
		let mut seen: Vec<String> = [&cs.noop, &cs.create, &cs.update, &cs.delete, &cs.recreate]
			.iter()
			.flat_map(|bucket| bucket.iter().map(Change::item_name))
			.collect();
		seen.sort();
		assert_eq!(
			seen,
			vec!["Service/change", "Service/drop", "Service/keep", "Service/new"]
		);
	}

	#[test]
	fn upsert_only_suppresses_deletes() {
		let current = list(
			Source::Current,
			&[service("pi", 80), json!({
				"apiVersion": "v1",
				"kind": "ConfigMap",
				"metadata": { "name": "extra" },
				"data": {},
			})],
		);
		let desired = list(Source::Desired, &[service("pi", 80)]);
		let opts = CompareOpts {
			upsert_only: true,
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		assert!(cs.delete.is_empty());
		assert!(cs.blank());
		// The extra resource appears in no bucket at all.
		let all: Vec<String> = [&cs.noop, &cs.create, &cs.update, &cs.delete, &cs.recreate]
			.iter()
			.flat_map(|bucket| bucket.iter().map(Change::item_name))
			.collect();
		assert!(!all.contains(&"ConfigMap/extra".to_string()));
	}

	#[test]
	fn preserved_path_turns_update_into_noop() {
		let current = list(
			Source::Current,
			&[json!({
				"kind": "BuildConfig",
				"metadata": { "name": "bar" },
				"spec": { "output": { "to": { "name": "bar:v2" } } },
			})],
		);
		let desired = list(
			Source::Desired,
			&[json!({
				"kind": "BuildConfig",
				"metadata": { "name": "bar" },
				"spec": { "output": { "to": { "name": "bar:latest" } } },
			})],
		);
		let opts = CompareOpts {
			preserved: PreservedPaths::parse(&["bc:bar:/spec/output/to/name".to_string()]).unwrap(),
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		assert!(cs.blank());
		assert_eq!(cs.noop.len(), 1);
	}

	#[test]
	fn no_emitted_patch_targets_a_preserved_path() {
		let current = list(
			Source::Current,
			&[json!({
				"kind": "DeploymentConfig",
				"metadata": { "name": "app" },
				"spec": { "replicas": 3, "paused": false },
			})],
		);
		let desired = list(
			Source::Desired,
			&[json!({
				"kind": "DeploymentConfig",
				"metadata": { "name": "app" },
				"spec": { "replicas": 1, "paused": true },
			})],
		);
		let opts = CompareOpts {
			preserved: PreservedPaths::parse(&["dc:*:/spec/replicas".to_string()]).unwrap(),
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		assert_eq!(cs.update.len(), 1);
		for op in &cs.update[0].patches.0 {
			assert!(!opts.preserved.covers("DeploymentConfig", "app", &crate::patch::op_path(op)));
		}
	}

	#[test]
	fn immutable_change_fails_without_allow_recreate() {
		let pvc_current = json!({
			"kind": "PersistentVolumeClaim",
			"metadata": { "name": "data" },
			"spec": { "resources": { "requests": { "storage": "1Gi" } } },
		});
		let pvc_desired = json!({
			"kind": "PersistentVolumeClaim",
			"metadata": { "name": "data" },
			"spec": { "resources": { "requests": { "storage": "2Gi" } } },
		});
		let current = list(Source::Current, &[pvc_current.clone()]);
		let desired = list(Source::Desired, &[pvc_desired.clone()]);

		assert_matches!(
			compare(&current, &desired, &CompareOpts::default()),
			Err(ChangesetError::ImmutableFieldChanged { key, .. }) if key == "PersistentVolumeClaim/data"
		);

		let opts = CompareOpts {
			allow_recreate: true,
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		assert_eq!(cs.recreate.len(), 1);
		assert!(cs.update.is_empty());
	}

	#[test]
	fn empty_desired_state_suppresses_deletes_without_force() {
		let current = list(Source::Current, &[service("pi", 80)]);
		let desired = list(Source::Desired, &[]);

		// Without --force nothing is deleted; the run is a graceful no-op.
		let cs = compare(&current, &desired, &CompareOpts::default()).unwrap();
		assert!(cs.delete.is_empty());
		assert!(cs.blank());

		let opts = CompareOpts {
			force: true,
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		assert_eq!(cs.delete.len(), 1);

		// Upsert-only never deletes either way.
		let opts = CompareOpts {
			upsert_only: true,
			..CompareOpts::default()
		};
		assert!(compare(&current, &desired, &opts).unwrap().blank());
	}

	#[test]
	fn buckets_are_sorted_by_kind_then_name() {
		let current = list(Source::Current, &[]);
		let desired = list(
			Source::Desired,
			&[
				service("zeta", 80),
				service("alpha", 80),
				json!({"kind": "ConfigMap", "metadata": {"name": "zz"}, "data": {}}),
			],
		);
		let opts = CompareOpts {
			force: true,
			..CompareOpts::default()
		};
		let cs = compare(&current, &desired, &opts).unwrap();
		let names: Vec<_> = cs.create.iter().map(Change::item_name).collect();
		assert_eq!(names, vec!["ConfigMap/zz", "Service/alpha", "Service/zeta"]);
	}
}
