//! Secrets command handlers: edit, re-encrypt and reveal parameter files,
//! and generate keypairs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use super::util::{self, GlobalArgs};
use crate::options::Options;
use crate::secrets::keyring::{self, Keyring};
use crate::secrets::ParamFile;

#[derive(Args)]
pub struct SecretsArgs {
	#[command(flatten)]
	pub global: GlobalArgs,

	#[command(subcommand)]
	pub command: SecretsCommands,
}

#[derive(Subcommand)]
pub enum SecretsCommands {
	/// Edit a parameter file, transparently decrypting and re-encrypting
	Edit { file: PathBuf },

	/// Re-encrypt parameter file(s) with the current public key set
	ReEncrypt { file: Option<PathBuf> },

	/// Print a parameter file with secrets revealed
	Reveal { file: PathBuf },

	/// Generate a new keypair
	GenerateKey {
		/// Email address identifying the keypair
		email: String,

		/// Name for the keypair (defaults to the email's local part)
		#[arg(long)]
		name: Option<String>,
	},
}

/// Run a secrets subcommand.
pub fn run<W: Write>(args: SecretsArgs, mut writer: W) -> Result<()> {
	let options = util::options_from(&args.global, None, None)?;
	match args.command {
		SecretsCommands::Edit { file } => edit(&file, &options),
		SecretsCommands::ReEncrypt { file } => re_encrypt(file.as_deref(), &options),
		SecretsCommands::Reveal { file } => reveal(&file, &options, &mut writer),
		SecretsCommands::GenerateKey { email, name } => {
			generate_key(&email, name.as_deref(), &options, &mut writer)
		}
	}
}

fn required_keyring(options: &Options) -> Result<Keyring> {
	Keyring::load(&options.private_key, options.passphrase.clone()).with_context(|| {
		format!(
			"loading private key {} (generate one with 'secrets generate-key')",
			options.private_key.display()
		)
	})
}

fn edit(file: &Path, options: &Options) -> Result<()> {
	let keyring = required_keyring(options)?;
	let original = ParamFile::load(file, Some(&keyring))
		.with_context(|| format!("reading {}", file.display()))?;

	let edited_content = edit_in_editor(&original.plaintext())?;
	let edited = ParamFile::from_plaintext(&edited_content).context("parsing edited content")?;

	let recipients = keyring::load_public_keys(&options.public_key_dir)?;
	let rendered = edited
		.render(&recipients, Some(&original))
		.context("re-encrypting edited values")?;
	ParamFile::persist(file, &rendered)?;
	Ok(())
}

fn re_encrypt(file: Option<&Path>, options: &Options) -> Result<()> {
	let keyring = required_keyring(options)?;
	let recipients = keyring::load_public_keys(&options.public_key_dir)?;

	let files = match file {
		Some(file) => vec![file.to_path_buf()],
		None => {
			let mut files = Vec::new();
			for context in &options.contexts {
				let entries = fs::read_dir(&context.param_dir).with_context(|| {
					format!("reading param dir {}", context.param_dir.display())
				})?;
				files.extend(
					entries
						.filter_map(|e| e.ok().map(|e| e.path()))
						.filter(|p| p.extension().is_some_and(|ext| ext == "env")),
				);
			}
			files.sort();
			files
		}
	};

	for file in files {
		let params = ParamFile::load(&file, Some(&keyring))
			.with_context(|| format!("reading {}", file.display()))?;
		// No previous file: every envelope is regenerated.
		let rendered = params
			.render(&recipients, None)
			.with_context(|| format!("re-encrypting {}", file.display()))?;
		ParamFile::persist(&file, &rendered)?;
	}
	Ok(())
}

fn reveal<W: Write>(file: &Path, options: &Options, writer: &mut W) -> Result<()> {
	if !file.is_file() {
		bail!("'{}' does not exist", file.display());
	}
	let keyring = required_keyring(options)?;
	let params = ParamFile::load(file, Some(&keyring))
		.with_context(|| format!("reading {}", file.display()))?;
	writer.write_all(params.plaintext().as_bytes())?;
	Ok(())
}

fn generate_key<W: Write>(
	email: &str,
	name: Option<&str>,
	options: &Options,
	writer: &mut W,
) -> Result<()> {
	let local_part = email.split('@').next().unwrap_or(email);
	let name = name.filter(|n| !n.is_empty()).unwrap_or(local_part);

	let pair = keyring::generate(name, email).context("generating keypair")?;

	let public_path = PathBuf::from(format!("{}.key", local_part.replace('.', "-")));
	fs::write(&public_path, &pair.public)
		.with_context(|| format!("writing {}", public_path.display()))?;
	writeln!(
		writer,
		"Public key written to {}. This file can be committed.",
		public_path.display()
	)?;

	fs::write(&options.private_key, &pair.private)
		.with_context(|| format!("writing {}", options.private_key.display()))?;
	writeln!(
		writer,
		"Private key written to {}. This file MUST NOT be committed.",
		options.private_key.display()
	)?;
	Ok(())
}

/// Hand the buffer to the user's `$EDITOR` (default `vi`) and return what
/// they saved. The editor runs without a deadline.
fn edit_in_editor(content: &str) -> Result<String> {
	let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
	let mut parts = editor.split_whitespace();
	let program = parts.next().unwrap_or("vi");
	let editor_args: Vec<&str> = parts.collect();

	let mut buffer = tempfile::Builder::new()
		.suffix(".env")
		.tempfile()
		.context("creating editor buffer")?;
	buffer
		.write_all(content.as_bytes())
		.context("writing editor buffer")?;
	buffer.flush().context("flushing editor buffer")?;

	let status = Command::new(program)
		.args(&editor_args)
		.arg(buffer.path())
		.status()
		.with_context(|| format!("launching editor '{}'", editor))?;
	if !status.success() {
		bail!("editor '{}' exited with {}", editor, status);
	}

	fs::read_to_string(buffer.path()).context("reading edited buffer")
}

#[cfg(test)]
mod tests {
	use super::*;

	// `true` stands in for an editor that exits without touching the buffer.
	#[test]
	fn editor_roundtrip_with_true_editor() {
		std::env::set_var("EDITOR", "true");
		let content = "KEY=value\n";
		let out = edit_in_editor(content).unwrap();
		assert_eq!(out, content);
	}
}
