//! Desired-state assembly: expand every local template through the
//! platform's template processor and collect the results into one list.
//!
//! Parameter files are decrypted into a temp file first so the platform CLI
//! never sees ciphertext. Processor output is cached per template file, so
//! a template referenced by several contexts is only expanded once.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::filter::ResourceFilter;
use crate::oc::{Platform, PlatformError, ProcessRequest};
use crate::options::{ContextDirs, Options};
use crate::resource::{ResourceError, ResourceList, Source};
use crate::secrets::keyring::Keyring;
use crate::secrets::{ParamFile, SecretsError};

/// Template parameter the tool fills with the target namespace, when the
/// template declares it.
pub const NAMESPACE_PARAM: &str = "STITCH_NAMESPACE";

#[derive(Debug, Error)]
pub enum TemplateError {
	#[error("reading template directory {dir}")]
	ReadDir {
		dir: String,
		#[source]
		source: std::io::Error,
	},

	#[error("reading template {file}")]
	ReadTemplate {
		file: String,
		#[source]
		source: std::io::Error,
	},

	#[error("writing decrypted parameter file for {file}")]
	ParamSpool {
		file: String,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Platform(#[from] PlatformError),

	#[error(transparent)]
	Resource(#[from] ResourceError),

	#[error(transparent)]
	Secrets(#[from] SecretsError),
}

/// Expands templates and caches per-file processor output.
pub struct TemplateProcessor<'a> {
	platform: &'a dyn Platform,
	cache: HashMap<PathBuf, String>,
}

impl<'a> TemplateProcessor<'a> {
	pub fn new(platform: &'a dyn Platform) -> Self {
		Self {
			platform,
			cache: HashMap::new(),
		}
	}

	/// Build the desired-state list for one context directory pair.
	#[instrument(skip_all, fields(dir = %context.template_dir.display()))]
	pub async fn assemble(
		&mut self,
		context: &ContextDirs,
		options: &Options,
		filter: &ResourceFilter,
		keyring: Option<&Keyring>,
	) -> Result<ResourceList, TemplateError> {
		let mut list = ResourceList::new(filter.clone());
		for template in template_files(&context.template_dir)? {
			let output = self
				.process_file(&template, &context.param_dir, options, keyring)
				.await?;
			list.append_yaml(&output, Source::Desired, &options.normalize_desired())?;
		}
		Ok(list)
	}

	async fn process_file(
		&mut self,
		template: &Path,
		param_dir: &Path,
		options: &Options,
		keyring: Option<&Keyring>,
	) -> Result<String, TemplateError> {
		if let Some(cached) = self.cache.get(template) {
			debug!(file = %template.display(), "template output cached");
			return Ok(cached.clone());
		}

		// Pair the template with `<basename>.env` from the param directory.
		let mut spooled = None;
		let param_file = match env_file_for(template, param_dir) {
			Some(env_path) => {
				let params = ParamFile::load(&env_path, keyring)?;
				let mut tmp = tempfile::NamedTempFile::new().map_err(|source| {
					TemplateError::ParamSpool {
						file: template.display().to_string(),
						source,
					}
				})?;
				tmp.write_all(params.for_template().as_bytes()).map_err(|source| {
					TemplateError::ParamSpool {
						file: template.display().to_string(),
						source,
					}
				})?;
				let path = tmp.path().to_path_buf();
				spooled = Some(tmp);
				Some(path)
			}
			None => options.param_file.clone(),
		};

		let mut params = options.params.clone();
		if let Some(namespace) = &options.namespace {
			if declares_parameter(template, NAMESPACE_PARAM)? {
				params.push(format!("{}={}", NAMESPACE_PARAM, namespace));
			}
		}

		let request = ProcessRequest {
			template: template.to_path_buf(),
			param_file,
			params,
			labels: options.labels.clone(),
			ignore_unknown_parameters: options.ignore_unknown_parameters,
		};
		let output = self.platform.process(&request).await?;
		drop(spooled);

		self.cache.insert(template.to_path_buf(), output.clone());
		Ok(output)
	}
}

/// All `*.yml`/`*.yaml` files directly under `dir`, sorted by name.
fn template_files(dir: &Path) -> Result<Vec<PathBuf>, TemplateError> {
	let entries = fs::read_dir(dir).map_err(|source| TemplateError::ReadDir {
		dir: dir.display().to_string(),
		source,
	})?;
	let mut files: Vec<PathBuf> = entries
		.filter_map(|e| e.ok().map(|e| e.path()))
		.filter(|p| {
			p.is_file()
				&& p.extension()
					.and_then(|ext| ext.to_str())
					.is_some_and(|ext| ext == "yml" || ext == "yaml")
		})
		.collect();
	files.sort();
	Ok(files)
}

fn env_file_for(template: &Path, param_dir: &Path) -> Option<PathBuf> {
	let stem = template.file_stem()?;
	let candidate = param_dir.join(format!("{}.env", stem.to_string_lossy()));
	candidate.is_file().then_some(candidate)
}

/// Whether the template's `parameters` block declares `name`. The platform
/// CLI rejects undeclared parameters, so injection is conditional.
fn declares_parameter(template: &Path, name: &str) -> Result<bool, TemplateError> {
	let content = fs::read_to_string(template).map_err(|source| TemplateError::ReadTemplate {
		file: template.display().to_string(),
		source,
	})?;
	let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(&content) else {
		return Ok(false);
	};
	let Ok(value) = serde_json::to_value(value) else {
		return Ok(false);
	};
	Ok(value
		.get("parameters")
		.and_then(Value::as_array)
		.is_some_and(|params| {
			params
				.iter()
				.any(|p| p.get("name").and_then(Value::as_str) == Some(name))
		}))
}
