//! The validated option set for one run. Built once from CLI flags and the
//! optional Stitchfile, then handed around read-only; downstream components
//! never see raw flag values.

use std::path::PathBuf;

use thiserror::Error;

use crate::patch::{PatchError, PreservedPaths};
use crate::resource::{NormalizeOpts, DEFAULT_STRIPPED_PATHS};

#[derive(Debug, Error)]
pub enum OptionsError {
	#[error(
		"--param-dir must be given once or once per --template-dir \
		 ({templates} template dirs, {params} param dirs)"
	)]
	MismatchedDirs { templates: usize, params: usize },

	#[error("invalid --param '{0}': expected KEY=VALUE")]
	InvalidParam(String),

	#[error(transparent)]
	Preserve(#[from] PatchError),
}

/// One template/param directory pair; each pair is reconciled independently.
#[derive(Debug, Clone)]
pub struct ContextDirs {
	pub template_dir: PathBuf,
	pub param_dir: PathBuf,
}

/// Everything a reconcile needs to know, validated up front.
#[derive(Debug, Clone)]
pub struct Options {
	pub namespace: Option<String>,
	pub selector: Option<String>,
	pub excludes: Vec<String>,
	pub contexts: Vec<ContextDirs>,
	pub public_key_dir: PathBuf,
	pub private_key: PathBuf,
	pub passphrase: Option<String>,
	pub non_interactive: bool,

	pub labels: Option<String>,
	/// `KEY=VALUE` template parameter overrides.
	pub params: Vec<String>,
	pub param_file: Option<PathBuf>,
	pub ignore_unknown_parameters: bool,
	pub upsert_only: bool,
	pub allow_recreate: bool,
	pub force: bool,
	pub reveal_secrets: bool,
	pub preserved: PreservedPaths,
	pub resource: Option<String>,

	/// Server-populated paths stripped during normalization.
	pub stripped_paths: Vec<String>,
	/// Keep platform-internal annotations when exporting.
	pub with_annotations: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			namespace: None,
			selector: None,
			excludes: Vec::new(),
			contexts: vec![ContextDirs {
				template_dir: PathBuf::from("."),
				param_dir: PathBuf::from("."),
			}],
			public_key_dir: PathBuf::from("."),
			private_key: PathBuf::from("private.key"),
			passphrase: None,
			non_interactive: false,
			labels: None,
			params: Vec::new(),
			param_file: None,
			ignore_unknown_parameters: false,
			upsert_only: false,
			allow_recreate: false,
			force: false,
			reveal_secrets: false,
			preserved: PreservedPaths::default(),
			resource: None,
			stripped_paths: DEFAULT_STRIPPED_PATHS
				.iter()
				.map(|p| p.to_string())
				.collect(),
			with_annotations: false,
		}
	}
}

impl Options {
	/// Pair up template and param directories. A single param directory is
	/// shared across all template directories; otherwise they match 1:1.
	pub fn pair_contexts(
		template_dirs: &[PathBuf],
		param_dirs: &[PathBuf],
	) -> Result<Vec<ContextDirs>, OptionsError> {
		let default_dirs = [PathBuf::from(".")];
		let template_dirs: &[PathBuf] = if template_dirs.is_empty() {
			&default_dirs
		} else {
			template_dirs
		};
		let param_dirs: &[PathBuf] = if param_dirs.is_empty() {
			&default_dirs
		} else {
			param_dirs
		};

		if param_dirs.len() != 1 && param_dirs.len() != template_dirs.len() {
			return Err(OptionsError::MismatchedDirs {
				templates: template_dirs.len(),
				params: param_dirs.len(),
			});
		}

		Ok(template_dirs
			.iter()
			.enumerate()
			.map(|(i, template_dir)| ContextDirs {
				template_dir: template_dir.clone(),
				param_dir: param_dirs
					.get(i)
					.unwrap_or(&param_dirs[0])
					.clone(),
			})
			.collect())
	}

	pub fn validate_params(params: &[String]) -> Result<(), OptionsError> {
		for param in params {
			if !param
				.split_once('=')
				.is_some_and(|(k, _)| !k.is_empty())
			{
				return Err(OptionsError::InvalidParam(param.clone()));
			}
		}
		Ok(())
	}

	/// Normalization settings for template-derived resources.
	pub fn normalize_desired(&self) -> NormalizeOpts {
		NormalizeOpts {
			stripped_paths: self.stripped_paths.clone(),
			drop_platform_annotations: false,
		}
	}

	/// Normalization settings for cluster-derived resources.
	pub fn normalize_current(&self) -> NormalizeOpts {
		NormalizeOpts {
			stripped_paths: self.stripped_paths.clone(),
			drop_platform_annotations: !self.with_annotations,
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn one_param_dir_is_shared() {
		let contexts = Options::pair_contexts(
			&[PathBuf::from("a"), PathBuf::from("b")],
			&[PathBuf::from("params")],
		)
		.unwrap();
		assert_eq!(contexts.len(), 2);
		assert_eq!(contexts[0].param_dir, PathBuf::from("params"));
		assert_eq!(contexts[1].param_dir, PathBuf::from("params"));
	}

	#[test]
	fn paired_dirs_match_one_to_one() {
		let contexts = Options::pair_contexts(
			&[PathBuf::from("a"), PathBuf::from("b")],
			&[PathBuf::from("pa"), PathBuf::from("pb")],
		)
		.unwrap();
		assert_eq!(contexts[1].template_dir, PathBuf::from("b"));
		assert_eq!(contexts[1].param_dir, PathBuf::from("pb"));
	}

	#[test]
	fn mismatched_dir_counts_are_rejected() {
		assert_matches!(
			Options::pair_contexts(
				&[PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")],
				&[PathBuf::from("pa"), PathBuf::from("pb")],
			),
			Err(OptionsError::MismatchedDirs { templates: 3, params: 2 })
		);
	}

	#[test]
	fn params_must_be_key_value() {
		assert!(Options::validate_params(&["FOO=bar".to_string()]).is_ok());
		assert_matches!(
			Options::validate_params(&["NOEQUALS".to_string()]),
			Err(OptionsError::InvalidParam(_))
		);
	}

	#[test]
	fn export_normalization_drops_annotations_by_default() {
		let options = Options::default();
		assert!(options.normalize_current().drop_platform_annotations);
		assert!(!options.normalize_desired().drop_platform_annotations);

		let options = Options {
			with_annotations: true,
			..Options::default()
		};
		assert!(!options.normalize_current().drop_platform_annotations);
	}
}
