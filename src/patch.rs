//! Structural diffing between canonical payloads, expressed as RFC 6902
//! operations, plus the pointer machinery for preserved and immutable paths.
//!
//! Map keys turn into `add`/`remove`/`replace`; sequences are diffed with a
//! longest-common-subsequence match so that inserting or dropping one element
//! does not rewrite the whole tail. Operation paths account for sequential
//! application: indices are emitted against the evolving array.

use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde_json::Value;
use thiserror::Error;

use crate::filter::canonical_kind;

#[derive(Debug, Error)]
pub enum PatchError {
	#[error("invalid ignored path '{0}': expected [Kind:Name:]/json/pointer")]
	InvalidPreservePath(String),

	#[error("unknown kind in ignored path '{0}'")]
	UnknownKind(String),
}

/// Compute the RFC 6902 operations that transform `current` into `desired`.
pub fn diff(current: &Value, desired: &Value) -> Patch {
	let mut ops = Vec::new();
	let mut tokens: Vec<String> = Vec::new();
	diff_values(&mut tokens, current, desired, &mut ops);
	Patch(ops)
}

fn pointer(tokens: &[String]) -> PointerBuf {
	PointerBuf::from_tokens(tokens.iter().map(String::as_str))
}

fn diff_values(tokens: &mut Vec<String>, current: &Value, desired: &Value, ops: &mut Vec<PatchOperation>) {
	match (current, desired) {
		(Value::Object(cur), Value::Object(des)) => {
			for key in cur.keys() {
				if !des.contains_key(key) {
					tokens.push(key.clone());
					ops.push(PatchOperation::Remove(RemoveOperation {
						path: pointer(tokens),
					}));
					tokens.pop();
				}
			}
			for (key, desired_value) in des {
				tokens.push(key.clone());
				match cur.get(key) {
					None => ops.push(PatchOperation::Add(AddOperation {
						path: pointer(tokens),
						value: desired_value.clone(),
					})),
					Some(current_value) if current_value != desired_value => {
						diff_values(tokens, current_value, desired_value, ops);
					}
					Some(_) => {}
				}
				tokens.pop();
			}
		}
		(Value::Array(cur), Value::Array(des)) => diff_sequences(tokens, cur, des, ops),
		_ if current != desired => ops.push(PatchOperation::Replace(ReplaceOperation {
			path: pointer(tokens),
			value: desired.clone(),
		})),
		_ => {}
	}
}

enum Edit {
	Keep,
	Remove,
	Insert(usize),
	Change(usize, usize),
}

fn diff_sequences(tokens: &mut Vec<String>, current: &[Value], desired: &[Value], ops: &mut Vec<PatchOperation>) {
	// Working index into the array as it evolves while operations apply.
	let mut working = 0usize;
	for edit in edit_script(current, desired) {
		match edit {
			Edit::Keep => working += 1,
			Edit::Remove => {
				tokens.push(working.to_string());
				ops.push(PatchOperation::Remove(RemoveOperation {
					path: pointer(tokens),
				}));
				tokens.pop();
			}
			Edit::Insert(j) => {
				tokens.push(working.to_string());
				ops.push(PatchOperation::Add(AddOperation {
					path: pointer(tokens),
					value: desired[j].clone(),
				}));
				tokens.pop();
				working += 1;
			}
			Edit::Change(i, j) => {
				tokens.push(working.to_string());
				diff_values(tokens, &current[i], &desired[j], ops);
				tokens.pop();
				working += 1;
			}
		}
	}
}

/// Longest-common-subsequence edit script. Runs of removals followed by
/// insertions are paired into changes so nested containers diff recursively
/// instead of being rewritten.
fn edit_script(current: &[Value], desired: &[Value]) -> Vec<Edit> {
	let m = current.len();
	let n = desired.len();
	// lcs[i][j] = LCS length of current[i..] and desired[j..]
	let mut lcs = vec![vec![0usize; n + 1]; m + 1];
	for i in (0..m).rev() {
		for j in (0..n).rev() {
			lcs[i][j] = if current[i] == desired[j] {
				lcs[i + 1][j + 1] + 1
			} else {
				lcs[i + 1][j].max(lcs[i][j + 1])
			};
		}
	}

	enum Raw {
		Keep,
		Remove(usize),
		Insert(usize),
	}

	let mut raw = Vec::new();
	let (mut i, mut j) = (0usize, 0usize);
	while i < m && j < n {
		if current[i] == desired[j] {
			raw.push(Raw::Keep);
			i += 1;
			j += 1;
		} else if lcs[i + 1][j] >= lcs[i][j + 1] {
			raw.push(Raw::Remove(i));
			i += 1;
		} else {
			raw.push(Raw::Insert(j));
			j += 1;
		}
	}
	raw.extend((i..m).map(Raw::Remove));
	raw.extend((j..n).map(Raw::Insert));

	// Pair each run of removals with the insertions that follow it.
	let mut edits = Vec::with_capacity(raw.len());
	let mut idx = 0;
	while idx < raw.len() {
		match raw[idx] {
			Raw::Keep => {
				edits.push(Edit::Keep);
				idx += 1;
			}
			Raw::Insert(j) => {
				edits.push(Edit::Insert(j));
				idx += 1;
			}
			Raw::Remove(_) => {
				let mut removed = Vec::new();
				while let Some(Raw::Remove(i)) = raw.get(idx) {
					removed.push(*i);
					idx += 1;
				}
				let mut inserted = Vec::new();
				while let Some(Raw::Insert(j)) = raw.get(idx) {
					inserted.push(*j);
					idx += 1;
				}
				let paired = removed.len().min(inserted.len());
				for k in 0..paired {
					edits.push(Edit::Change(removed[k], inserted[k]));
				}
				for _ in paired..removed.len() {
					edits.push(Edit::Remove);
				}
				for j in inserted.into_iter().skip(paired) {
					edits.push(Edit::Insert(j));
				}
			}
		}
	}
	edits
}

/// The RFC 6901 path an operation targets.
pub fn op_path(op: &PatchOperation) -> String {
	match op {
		PatchOperation::Add(o) => o.path.to_string(),
		PatchOperation::Remove(o) => o.path.to_string(),
		PatchOperation::Replace(o) => o.path.to_string(),
		PatchOperation::Move(o) => o.path.to_string(),
		PatchOperation::Copy(o) => o.path.to_string(),
		PatchOperation::Test(o) => o.path.to_string(),
	}
}

/// True when `path` equals `prefix` or lies underneath it.
pub fn pointer_covers(prefix: &str, path: &str) -> bool {
	path == prefix
		|| path
			.strip_prefix(prefix)
			.is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone)]
struct PreservedPath {
	kind: Option<String>,
	name: Option<String>,
	pointer: String,
}

/// Paths whose value differences are intentionally ignored because another
/// controller owns them. Entries are `/ptr` (global), `Kind:Name:/ptr`,
/// `Kind:*:/ptr` or `*:*:/ptr`; kind tokens may use the usual short aliases.
#[derive(Debug, Clone, Default)]
pub struct PreservedPaths {
	entries: Vec<PreservedPath>,
}

impl PreservedPaths {
	pub fn parse(specs: &[String]) -> Result<Self, PatchError> {
		let mut entries = Vec::new();
		for spec in specs {
			if spec.starts_with('/') {
				entries.push(PreservedPath {
					kind: None,
					name: None,
					pointer: spec.clone(),
				});
				continue;
			}
			let mut parts = spec.splitn(3, ':');
			let (kind_token, name_token, ptr) = match (parts.next(), parts.next(), parts.next()) {
				(Some(k), Some(n), Some(p)) if p.starts_with('/') => (k, n, p),
				_ => return Err(PatchError::InvalidPreservePath(spec.clone())),
			};
			let kind = match kind_token {
				"*" => None,
				token => Some(
					canonical_kind(token)
						.ok_or_else(|| PatchError::UnknownKind(spec.clone()))?
						.to_string(),
				),
			};
			let name = match name_token {
				"*" => None,
				token => Some(token.to_string()),
			};
			entries.push(PreservedPath {
				kind,
				name,
				pointer: ptr.to_string(),
			});
		}
		Ok(Self { entries })
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Whether an operation on `path` of resource `kind`/`name` is preserved.
	pub fn covers(&self, kind: &str, name: &str, path: &str) -> bool {
		self.entries.iter().any(|entry| {
			entry.kind.as_deref().is_none_or(|k| k == kind)
				&& entry.name.as_deref().is_none_or(|n| n == name)
				&& pointer_covers(&entry.pointer, path)
		})
	}
}

/// Paths the platform refuses to mutate in place, per kind. A `*` token
/// matches any single path segment.
const IMMUTABLE_PATHS: &[(&str, &[&str])] = &[
	("BuildConfig", &["/spec/source/type"]),
	(
		"DeploymentConfig",
		&["/spec/selector", "/spec/triggers/*/imageChangeParams/from"],
	),
	("PersistentVolumeClaim", &["/spec"]),
	("Route", &["/spec/host"]),
	("Service", &["/spec/clusterIP"]),
];

/// Find the first operation in `patch` that targets an immutable path of
/// `kind`. Returns the operation path and the matching pattern.
pub fn immutable_conflict(kind: &str, patch: &Patch) -> Option<(String, &'static str)> {
	let patterns = IMMUTABLE_PATHS
		.iter()
		.find(|(k, _)| *k == kind)
		.map(|(_, p)| *p)?;
	for op in &patch.0 {
		let path = op_path(op);
		for pattern in patterns {
			if pattern_covers(pattern, &path) {
				return Some((path, pattern));
			}
		}
	}
	None
}

fn pattern_covers(pattern: &str, path: &str) -> bool {
	let pattern_tokens: Vec<&str> = pattern.split('/').skip(1).collect();
	let path_tokens: Vec<&str> = path.split('/').skip(1).collect();
	if path_tokens.len() < pattern_tokens.len() {
		return false;
	}
	pattern_tokens
		.iter()
		.zip(&path_tokens)
		.all(|(p, t)| *p == "*" || p == t)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn equal_values_produce_no_ops() {
		let v = json!({"spec": {"ports": [{"port": 80}]}});
		assert!(diff(&v, &v).0.is_empty());
	}

	#[test]
	fn scalar_change_is_a_replace() {
		let current = json!({"spec": {"ports": [{"port": 80}]}});
		let desired = json!({"spec": {"ports": [{"port": 8080}]}});
		let patch = diff(&current, &desired);
		assert_eq!(patch.0.len(), 1);
		assert_eq!(op_path(&patch.0[0]), "/spec/ports/0/port");
		assert!(matches!(&patch.0[0], PatchOperation::Replace(r) if r.value == json!(8080)));
	}

	#[test]
	fn added_and_removed_keys() {
		let current = json!({"a": 1, "b": 2});
		let desired = json!({"b": 2, "c": 3});
		let patch = diff(&current, &desired);
		let paths: Vec<_> = patch.0.iter().map(op_path).collect();
		assert_eq!(paths, vec!["/a", "/c"]);
		assert!(matches!(&patch.0[0], PatchOperation::Remove(_)));
		assert!(matches!(&patch.0[1], PatchOperation::Add(_)));
	}

	#[test]
	fn sequence_insert_does_not_rewrite_tail() {
		let current = json!(["a", "c", "d"]);
		let desired = json!(["a", "b", "c", "d"]);
		let patch = diff(&current, &desired);
		assert_eq!(patch.0.len(), 1);
		assert_eq!(op_path(&patch.0[0]), "/1");
		assert!(matches!(&patch.0[0], PatchOperation::Add(a) if a.value == json!("b")));
	}

	#[test]
	fn sequence_removal_uses_working_indices() {
		let current = json!(["a", "b", "c"]);
		let desired = json!(["c"]);
		let patch = diff(&current, &desired);
		let paths: Vec<_> = patch.0.iter().map(op_path).collect();
		// After removing index 0 twice, "c" has shifted into place.
		assert_eq!(paths, vec!["/0", "/0"]);
	}

	#[test]
	fn changed_sequence_element_recurses() {
		let current = json!({"containers": [{"name": "app", "image": "v1"}]});
		let desired = json!({"containers": [{"name": "app", "image": "v2"}]});
		let patch = diff(&current, &desired);
		assert_eq!(patch.0.len(), 1);
		assert_eq!(op_path(&patch.0[0]), "/containers/0/image");
	}

	#[test]
	fn roundtrip_applies_cleanly() {
		let cases = [
			(json!({"a": 1}), json!({"a": 2, "b": [1, 2, 3]})),
			(json!({"x": [1, 2, 3], "y": {"k": "v"}}), json!({"x": [2, 3, 4]})),
			(json!(["a", "b", "c"]), json!(["b", "z", "c", "d"])),
			(json!({"deep": {"list": [{"n": 1}, {"n": 2}]}}), json!({"deep": {"list": [{"n": 2}]}})),
			(json!({"t": "string"}), json!({"t": {"now": "object"}})),
		];
		for (current, desired) in cases {
			let patch = diff(&current, &desired);
			let mut doc = current.clone();
			json_patch::patch(&mut doc, &patch).expect("patch applies");
			assert_eq!(doc, desired, "roundtrip for {current} -> {desired}");
		}
	}

	#[test]
	fn preserved_paths_match_by_kind_name_and_prefix() {
		let preserved = PreservedPaths::parse(&[
			"bc:bar:/spec/output/to/name".to_string(),
			"dc:*:/spec/replicas".to_string(),
			"*:*:/metadata/annotations".to_string(),
		])
		.unwrap();
		assert!(preserved.covers("BuildConfig", "bar", "/spec/output/to/name"));
		assert!(!preserved.covers("BuildConfig", "other", "/spec/output/to/name"));
		assert!(preserved.covers("DeploymentConfig", "any", "/spec/replicas"));
		// Prefix match: a deeper path under the pointer is still covered.
		assert!(preserved.covers("Service", "pi", "/metadata/annotations/owner"));
		assert!(!preserved.covers("Service", "pi", "/metadata/annotationsx"));
	}

	#[test]
	fn global_pointer_form_is_accepted() {
		let preserved = PreservedPaths::parse(&["/spec/clusterIP".to_string()]).unwrap();
		assert!(preserved.covers("Service", "pi", "/spec/clusterIP"));
	}

	#[test]
	fn malformed_preserve_specs_are_rejected() {
		assert!(PreservedPaths::parse(&["spec/clusterIP".to_string()]).is_err());
		assert!(PreservedPaths::parse(&["nosuchkind:x:/spec".to_string()]).is_err());
	}

	#[test]
	fn immutable_table_matches_wildcards_and_subtrees() {
		let patch = Patch(vec![PatchOperation::Replace(ReplaceOperation {
			path: PointerBuf::from_tokens(["spec", "triggers", "2", "imageChangeParams", "from", "name"]),
			value: json!("x"),
		})]);
		let hit = immutable_conflict("DeploymentConfig", &patch).unwrap();
		assert_eq!(hit.1, "/spec/triggers/*/imageChangeParams/from");

		let patch = Patch(vec![PatchOperation::Replace(ReplaceOperation {
			path: PointerBuf::from_tokens(["spec", "resources", "requests", "storage"]),
			value: json!("2Gi"),
		})]);
		assert!(immutable_conflict("PersistentVolumeClaim", &patch).is_some());
		assert!(immutable_conflict("ConfigMap", &patch).is_none());
	}
}
