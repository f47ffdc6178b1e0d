//! Normalized in-memory representation of API objects and lists thereof.
//!
//! Payloads are held as canonical `serde_json` trees: mapping keys are kept
//! sorted (the default map representation is ordered), server-populated
//! fields are stripped at well-known paths, and platform-internal
//! annotations are dropped on export.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::filter::ResourceFilter;

/// Provenance of a resource: expanded from local templates, or exported
/// from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
	Desired,
	Current,
}

impl Source {
	fn describe(self) -> &'static str {
		match self {
			Source::Desired => "desired",
			Source::Current => "current",
		}
	}
}

/// Errors from parsing or normalizing manifests.
#[derive(Debug, Error)]
pub enum ResourceError {
	#[error("manifest missing kind")]
	MissingKind,

	#[error("manifest missing metadata.name")]
	MissingName,

	#[error("duplicate resource {key} in {state} state")]
	Duplicate { key: String, state: &'static str },

	#[error("parsing YAML manifest")]
	Yaml(#[from] serde_yaml::Error),

	#[error("converting manifest to JSON")]
	Json(#[from] serde_json::Error),
}

/// Server-populated fields stripped during normalization. The list is
/// configurable per run; these are the seed defaults.
pub const DEFAULT_STRIPPED_PATHS: &[&str] = &[
	"/metadata/creationTimestamp",
	"/metadata/generation",
	"/metadata/resourceVersion",
	"/metadata/selfLink",
	"/metadata/uid",
	"/status",
];

/// Annotation prefixes owned by the platform itself. Dropped on export
/// unless `--with-annotations` is given.
pub const PLATFORM_ANNOTATION_PREFIXES: &[&str] =
	&["openshift.io/", "kubernetes.io/", "kubectl.kubernetes.io/"];

/// Controls normalization of ingested manifests.
#[derive(Debug, Clone)]
pub struct NormalizeOpts {
	pub stripped_paths: Vec<String>,
	pub drop_platform_annotations: bool,
}

impl Default for NormalizeOpts {
	fn default() -> Self {
		Self {
			stripped_paths: DEFAULT_STRIPPED_PATHS
				.iter()
				.map(|p| p.to_string())
				.collect(),
			drop_platform_annotations: false,
		}
	}
}

/// One API object in canonical form. `(kind, name)` is the identity.
#[derive(Debug, Clone)]
pub struct Resource {
	pub kind: String,
	pub name: String,
	pub payload: Value,
	pub source: Source,
}

impl Resource {
	/// Normalize a parsed manifest into a resource.
	pub fn from_value(
		mut payload: Value,
		source: Source,
		opts: &NormalizeOpts,
	) -> Result<Self, ResourceError> {
		let kind = payload
			.get("kind")
			.and_then(Value::as_str)
			.ok_or(ResourceError::MissingKind)?
			.to_string();
		let name = payload
			.pointer("/metadata/name")
			.and_then(Value::as_str)
			.ok_or(ResourceError::MissingName)?
			.to_string();

		for path in &opts.stripped_paths {
			remove_at_pointer(&mut payload, path);
		}
		if opts.drop_platform_annotations {
			drop_platform_annotations(&mut payload);
		}
		prune_empty_metadata_maps(&mut payload);

		Ok(Self {
			kind,
			name,
			payload,
			source,
		})
	}

	/// Parse a single YAML manifest.
	pub fn from_yaml(yaml: &str, source: Source, opts: &NormalizeOpts) -> Result<Self, ResourceError> {
		let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
		Self::from_value(serde_json::to_value(value)?, source, opts)
	}

	/// `Kind/Name`, the identity used throughout drift reports.
	pub fn key(&self) -> String {
		format!("{}/{}", self.kind, self.name)
	}

	pub fn labels(&self) -> BTreeMap<String, String> {
		string_map_at(&self.payload, "/metadata/labels")
	}

	pub fn annotations(&self) -> BTreeMap<String, String> {
		string_map_at(&self.payload, "/metadata/annotations")
	}

	pub fn is_secret(&self) -> bool {
		self.kind == "Secret"
	}

	/// Canonical YAML rendering of the payload, used for human diffs.
	pub fn to_yaml(&self) -> String {
		serde_yaml::to_string(&self.payload).unwrap_or_default()
	}
}

fn string_map_at(payload: &Value, pointer: &str) -> BTreeMap<String, String> {
	payload
		.pointer(pointer)
		.and_then(Value::as_object)
		.map(|m| {
			m.iter()
				.filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
				.collect()
		})
		.unwrap_or_default()
}

/// Remove the value at a JSON pointer, if present.
fn remove_at_pointer(root: &mut Value, pointer: &str) {
	let Some((parent, leaf)) = pointer.rsplit_once('/') else {
		return;
	};
	let parent = if parent.is_empty() {
		Some(root)
	} else {
		root.pointer_mut(parent)
	};
	if let Some(Value::Object(map)) = parent {
		map.remove(leaf);
	}
}

fn drop_platform_annotations(root: &mut Value) {
	if let Some(Value::Object(annotations)) = root.pointer_mut("/metadata/annotations") {
		annotations.retain(|k, _| {
			!PLATFORM_ANNOTATION_PREFIXES
				.iter()
				.any(|prefix| k.starts_with(prefix))
		});
	}
}

/// Stripping can leave empty `annotations`/`labels` maps behind; one side
/// having `{}` where the other omits the key entirely would show up as
/// drift, so drop them.
fn prune_empty_metadata_maps(root: &mut Value) {
	if let Some(Value::Object(metadata)) = root.pointer_mut("/metadata") {
		for key in ["annotations", "labels"] {
			if metadata.get(key).and_then(Value::as_object).is_some_and(|m| m.is_empty()) {
				metadata.remove(key);
			}
		}
	}
}

/// An ordered collection of resources addressable by `Kind/Name`, built once
/// per reconcile from adapter output and immutable thereafter.
#[derive(Debug)]
pub struct ResourceList {
	filter: ResourceFilter,
	items: Vec<Resource>,
}

impl ResourceList {
	pub fn new(filter: ResourceFilter) -> Self {
		Self {
			filter,
			items: Vec::new(),
		}
	}

	/// Append every manifest found in `yaml`, which may be a single manifest,
	/// a `List` (`items`) or a processed `Template` (`objects`). Resources
	/// rejected by the filter are skipped; duplicate identities are an error.
	pub fn append_yaml(
		&mut self,
		yaml: &str,
		source: Source,
		opts: &NormalizeOpts,
	) -> Result<(), ResourceError> {
		if yaml.trim().is_empty() {
			return Ok(());
		}
		let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
		let value = serde_json::to_value(value)?;
		if value.is_null() {
			return Ok(());
		}
		let manifests = match (value.get("items"), value.get("objects")) {
			(Some(Value::Array(items)), _) => items.clone(),
			(_, Some(Value::Array(objects))) => objects.clone(),
			_ => vec![value],
		};
		for manifest in manifests {
			self.append(Resource::from_value(manifest, source, opts)?)?;
		}
		Ok(())
	}

	pub fn append(&mut self, resource: Resource) -> Result<(), ResourceError> {
		if !self.filter.accepts(&resource) {
			return Ok(());
		}
		let key = resource.key();
		if self.items.iter().any(|r| r.key() == key) {
			return Err(ResourceError::Duplicate {
				key,
				state: resource.source.describe(),
			});
		}
		self.items.push(resource);
		Ok(())
	}

	pub fn get(&self, key: &str) -> Option<&Resource> {
		self.items.iter().find(|r| r.key() == key)
	}

	/// All identities, sorted by `(Kind, Name)`.
	pub fn keys(&self) -> Vec<String> {
		let mut keys: Vec<_> = self.items.iter().map(Resource::key).collect();
		keys.sort();
		keys
	}

	pub fn resources(&self) -> &[Resource] {
		&self.items
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}
}
