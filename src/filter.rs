//! Resource selection: which kinds, names and labels participate in a reconcile.

use thiserror::Error;

use crate::resource::Resource;

/// Kinds the tool manages by default. Other kinds pass through untouched when
/// they show up in template output, but are never exported on their own.
pub const KNOWN_KINDS: &[&str] = &[
	"BuildConfig",
	"ConfigMap",
	"DeploymentConfig",
	"ImageStream",
	"PersistentVolumeClaim",
	"RoleBinding",
	"Route",
	"Secret",
	"Service",
	"ServiceAccount",
	"Template",
];

const KIND_ALIASES: &[(&str, &str)] = &[
	("bc", "BuildConfig"),
	("buildconfig", "BuildConfig"),
	("cm", "ConfigMap"),
	("configmap", "ConfigMap"),
	("dc", "DeploymentConfig"),
	("deploymentconfig", "DeploymentConfig"),
	("is", "ImageStream"),
	("imagestream", "ImageStream"),
	("pvc", "PersistentVolumeClaim"),
	("persistentvolumeclaim", "PersistentVolumeClaim"),
	("rb", "RoleBinding"),
	("rolebinding", "RoleBinding"),
	("route", "Route"),
	("sa", "ServiceAccount"),
	("secret", "Secret"),
	("service", "Service"),
	("serviceaccount", "ServiceAccount"),
	("svc", "Service"),
	("template", "Template"),
];

/// Errors produced while building a filter from user input.
#[derive(Debug, Error)]
pub enum FilterError {
	#[error("unknown resource kinds: {0}")]
	UnknownKinds(String),

	#[error("cannot target more than one resource name")]
	MultipleNames,

	#[error("invalid label selector '{0}': expected k=v[,k=v]")]
	InvalidSelector(String),

	#[error("invalid exclude entry '{0}': expected Kind, Kind/Name or k=v")]
	InvalidExclude(String),
}

/// Resolve a user-supplied kind token (alias or long form) to its canonical kind.
pub fn canonical_kind(token: &str) -> Option<&'static str> {
	let lower = token.to_lowercase();
	KIND_ALIASES
		.iter()
		.find(|(alias, _)| *alias == lower)
		.map(|(_, kind)| *kind)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExcludeRule {
	Kind(String),
	Item(String),
	Label(String, String),
}

/// Selects which resources participate in a reconcile. All conditions are ANDed;
/// a fully empty filter matches everything the tool knows about.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
	/// Canonical kinds, sorted. Empty means the default set.
	pub kinds: Vec<String>,
	/// Exact `Kind/Name` target. Takes precedence over `kinds`.
	pub name: Option<String>,
	/// Label selector, `k=v[,k=v]`.
	labels: Vec<(String, String)>,
	exclude: Vec<ExcludeRule>,
}

impl ResourceFilter {
	/// Build a filter from the `resource` argument (blank, a kind list like
	/// `pvc,dc`, or a `dc/foo` target), a label selector and exclude entries.
	pub fn new(
		resource: Option<&str>,
		selector: Option<&str>,
		excludes: &[String],
	) -> Result<Self, FilterError> {
		let mut filter = ResourceFilter {
			labels: parse_selector(selector)?,
			exclude: excludes
				.iter()
				.map(|e| parse_exclude(e))
				.collect::<Result<_, _>>()?,
			..ResourceFilter::default()
		};

		let Some(resource) = resource.filter(|r| !r.is_empty()) else {
			return Ok(filter);
		};

		if resource.contains('/') {
			if resource.contains(',') {
				return Err(FilterError::MultipleNames);
			}
			let (kind_token, name) = resource.split_once('/').unwrap_or((resource, ""));
			let kind = canonical_kind(kind_token)
				.ok_or_else(|| FilterError::UnknownKinds(kind_token.to_string()))?;
			filter.name = Some(format!("{}/{}", kind, name));
			return Ok(filter);
		}

		let mut kinds = Vec::new();
		let mut unknown = Vec::new();
		for token in resource.split(',') {
			match canonical_kind(token) {
				Some(kind) => {
					if !kinds.contains(&kind.to_string()) {
						kinds.push(kind.to_string());
					}
				}
				None => unknown.push(token.to_string()),
			}
		}
		if !unknown.is_empty() {
			return Err(FilterError::UnknownKinds(unknown.join(",")));
		}
		kinds.sort();
		filter.kinds = kinds;
		Ok(filter)
	}

	/// Whether `r` participates in the reconcile.
	pub fn accepts(&self, r: &Resource) -> bool {
		if let Some(name) = &self.name {
			if r.key() != *name {
				return false;
			}
		} else if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == &r.kind) {
			return false;
		}

		let labels = r.labels();
		for (k, v) in &self.labels {
			if labels.get(k) != Some(v) {
				return false;
			}
		}

		for rule in &self.exclude {
			let hit = match rule {
				ExcludeRule::Kind(kind) => *kind == r.kind,
				ExcludeRule::Item(key) => *key == r.key(),
				ExcludeRule::Label(k, v) => labels.get(k) == Some(v),
			};
			if hit {
				return false;
			}
		}

		true
	}

	/// Kinds to ask the platform for: the targeted kinds, or the default set.
	pub fn export_kinds(&self) -> Vec<String> {
		if let Some(name) = &self.name {
			let kind = name.split('/').next().unwrap_or_default();
			return vec![kind.to_string()];
		}
		if !self.kinds.is_empty() {
			return self.kinds.clone();
		}
		KNOWN_KINDS.iter().map(|k| k.to_string()).collect()
	}

	/// Raw selector string to hand to the platform CLI, if any.
	pub fn selector(&self) -> Option<String> {
		if self.labels.is_empty() {
			return None;
		}
		Some(
			self.labels
				.iter()
				.map(|(k, v)| format!("{}={}", k, v))
				.collect::<Vec<_>>()
				.join(","),
		)
	}
}

fn parse_selector(selector: Option<&str>) -> Result<Vec<(String, String)>, FilterError> {
	let Some(selector) = selector.filter(|s| !s.is_empty()) else {
		return Ok(Vec::new());
	};
	selector
		.split(',')
		.map(|pair| {
			pair.split_once('=')
				.filter(|(k, v)| !k.is_empty() && !v.is_empty())
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.ok_or_else(|| FilterError::InvalidSelector(selector.to_string()))
		})
		.collect()
}

fn parse_exclude(entry: &str) -> Result<ExcludeRule, FilterError> {
	if let Some((kind_token, name)) = entry.split_once('/') {
		let kind = canonical_kind(kind_token)
			.ok_or_else(|| FilterError::UnknownKinds(kind_token.to_string()))?;
		if name.is_empty() {
			return Err(FilterError::InvalidExclude(entry.to_string()));
		}
		return Ok(ExcludeRule::Item(format!("{}/{}", kind, name)));
	}
	if let Some((k, v)) = entry.split_once('=') {
		if k.is_empty() || v.is_empty() {
			return Err(FilterError::InvalidExclude(entry.to_string()));
		}
		return Ok(ExcludeRule::Label(k.to_string(), v.to_string()));
	}
	match canonical_kind(entry) {
		Some(kind) => Ok(ExcludeRule::Kind(kind.to_string())),
		None => Err(FilterError::UnknownKinds(entry.to_string())),
	}
}
