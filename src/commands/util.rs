//! Shared pieces of the command handlers: flag groups, Stitchfile merging,
//! the confirmation prompt and a broken-pipe-safe writer.

use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{FileFlags, STITCHFILE};
use crate::oc::output::ColorMode;
use crate::options::Options;
use crate::patch::PreservedPaths;

/// Flags every subcommand carries.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
	/// Namespace (omit to use the current context's)
	#[arg(short = 'n', long)]
	pub namespace: Option<String>,

	/// Label selector to filter on, k=v[,k=v]
	#[arg(short = 'l', long)]
	pub selector: Option<String>,

	/// Exclude resources by Kind, Kind/Name or label k=v
	#[arg(short = 'e', long = "exclude")]
	pub excludes: Vec<String>,

	/// Path to local templates
	#[arg(short = 't', long = "template-dir")]
	pub template_dirs: Vec<PathBuf>,

	/// Path to parameter files for the templates
	#[arg(short = 'p', long = "param-dir")]
	pub param_dirs: Vec<PathBuf>,

	/// Path to public key files
	#[arg(long)]
	pub public_key_dir: Option<PathBuf>,

	/// Path to the private key file
	#[arg(long)]
	pub private_key: Option<PathBuf>,

	/// Passphrase unlocking the private key
	#[arg(long)]
	pub passphrase: Option<String>,

	/// Disable interactive mode
	#[arg(long)]
	pub non_interactive: bool,

	/// Stitchfile with flag defaults
	#[arg(short = 'f', long = "file", default_value = STITCHFILE)]
	pub file: PathBuf,

	/// Controls ANSI color in output
	#[arg(long, value_enum, default_value_t = ColorMode::Auto)]
	pub color: ColorMode,
}

/// Flags shared by `diff` and `apply`.
#[derive(Args, Debug, Clone, Default)]
pub struct CompareArgs {
	/// Label to set in all resources of the processed templates
	#[arg(long)]
	pub labels: Option<String>,

	/// Set or override a template parameter (KEY=VALUE)
	#[arg(long = "param")]
	pub params: Vec<String>,

	/// File with template parameter values to set/override
	#[arg(long)]
	pub param_file: Option<PathBuf>,

	/// Keep going when a provided parameter does not exist in the template
	#[arg(long)]
	pub ignore_unknown_parameters: bool,

	/// Do not delete resources, only create and update
	#[arg(short = 'u', long)]
	pub upsert_only: bool,

	/// Delete and recreate resources whose immutable fields changed
	#[arg(long)]
	pub allow_recreate: bool,

	/// Proceed even when the desired state is empty
	#[arg(long)]
	pub force: bool,

	/// Show secret values in diffs instead of redacting them
	#[arg(long)]
	pub reveal_secrets: bool,

	/// Ignore differences at a path ([Kind:Name:]/json/pointer)
	#[arg(long = "ignore-path")]
	pub ignore_paths: Vec<String>,
}

/// Build the validated option set from flags and the Stitchfile. CLI flags
/// win; the file fills the gaps.
pub fn options_from(
	global: &GlobalArgs,
	compare: Option<&CompareArgs>,
	resource: Option<String>,
) -> Result<Options> {
	let file = FileFlags::load(&global.file).context("loading Stitchfile")?;

	let template_dirs = prefer_list(&global.template_dirs, &file, "template-dir");
	let param_dirs = prefer_list(&global.param_dirs, &file, "param-dir");
	let contexts = Options::pair_contexts(&template_dirs, &param_dirs)?;

	let compare_defaults = CompareArgs::default();
	let compare = compare.unwrap_or(&compare_defaults);

	let params: Vec<String> = if compare.params.is_empty() {
		file.list("param")
	} else {
		compare.params.clone()
	};
	Options::validate_params(&params)?;

	let ignore_paths: Vec<String> = if compare.ignore_paths.is_empty() {
		file.list("ignore-path")
	} else {
		compare.ignore_paths.clone()
	};

	Ok(Options {
		namespace: global
			.namespace
			.clone()
			.or_else(|| file.value("namespace").map(String::from)),
		selector: global
			.selector
			.clone()
			.or_else(|| file.value("selector").map(String::from)),
		excludes: if global.excludes.is_empty() {
			file.list("exclude")
		} else {
			global.excludes.clone()
		},
		contexts,
		public_key_dir: global
			.public_key_dir
			.clone()
			.or_else(|| file.value("public-key-dir").map(PathBuf::from))
			.unwrap_or_else(|| PathBuf::from(".")),
		private_key: global
			.private_key
			.clone()
			.or_else(|| file.value("private-key").map(PathBuf::from))
			.unwrap_or_else(|| PathBuf::from("private.key")),
		passphrase: global.passphrase.clone(),
		non_interactive: global.non_interactive || file.enabled("non-interactive"),
		labels: compare
			.labels
			.clone()
			.or_else(|| file.value("labels").map(String::from)),
		params,
		param_file: compare
			.param_file
			.clone()
			.or_else(|| file.value("param-file").map(PathBuf::from)),
		ignore_unknown_parameters: compare.ignore_unknown_parameters
			|| file.enabled("ignore-unknown-parameters"),
		upsert_only: compare.upsert_only || file.enabled("upsert-only"),
		allow_recreate: compare.allow_recreate || file.enabled("allow-recreate"),
		force: compare.force || file.enabled("force"),
		reveal_secrets: compare.reveal_secrets || file.enabled("reveal-secrets"),
		preserved: PreservedPaths::parse(&ignore_paths)?,
		resource,
		..Options::default()
	})
}

fn prefer_list(cli: &[PathBuf], file: &FileFlags, flag: &str) -> Vec<PathBuf> {
	if !cli.is_empty() {
		return cli.to_vec();
	}
	file.list(flag).into_iter().map(PathBuf::from).collect()
}

/// A multi-thread runtime for the async platform client.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")
}

/// Ask the user to confirm. Only an affirmative `y`/`yes` proceeds.
pub fn prompt_confirmation(question: &str) -> Result<bool> {
	eprint!("{} [y/N]: ", question);
	io::stderr().flush()?;
	let mut answer = String::new();
	io::stdin().read_line(&mut answer)?;
	Ok(matches!(
		answer.trim().to_lowercase().as_str(),
		"y" | "yes"
	))
}

/// A writer wrapper that silently swallows broken pipe errors, so piping
/// output into `head` does not turn into a crash.
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn global() -> GlobalArgs {
		GlobalArgs {
			namespace: None,
			selector: None,
			excludes: vec![],
			template_dirs: vec![],
			param_dirs: vec![],
			public_key_dir: None,
			private_key: None,
			passphrase: None,
			non_interactive: false,
			file: PathBuf::from("/does/not/exist/Stitchfile"),
			color: ColorMode::Never,
		}
	}

	#[test]
	fn cli_flags_win_over_stitchfile() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("Stitchfile");
		std::fs::write(&file, "namespace from-file\nupsert-only\n").unwrap();

		let mut args = global();
		args.file = file;
		args.namespace = Some("from-cli".to_string());
		let options = options_from(&args, None, None).unwrap();
		assert_eq!(options.namespace.as_deref(), Some("from-cli"));
		// Booleans from the file still apply.
		assert!(options.upsert_only);
	}

	#[test]
	fn defaults_without_stitchfile() {
		let options = options_from(&global(), None, None).unwrap();
		assert_eq!(options.contexts.len(), 1);
		assert_eq!(options.private_key, PathBuf::from("private.key"));
		assert!(!options.upsert_only);
	}

	#[test]
	fn broken_pipe_is_swallowed() {
		struct Broken;
		impl Write for Broken {
			fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
				Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
			}
			fn flush(&mut self) -> io::Result<()> {
				Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
			}
		}
		let mut guard = BrokenPipeGuard::new(Broken);
		assert_eq!(guard.write(b"data").unwrap(), 4);
		guard.flush().unwrap();
	}
}
