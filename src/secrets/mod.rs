//! Parameter files with per-value encrypted envelopes.
//!
//! ```text
//! KEY=plain-value
//! KEY.ENC=base64(envelope)
//! #public-key-fingerprints: <hex>[,<hex>]*
//! ```
//!
//! Blank lines and comments survive round-trips; the fingerprint block is
//! regenerated on every render. Envelopes whose plaintext did not change
//! are carried over byte-for-byte so that re-saving an unedited file is a
//! no-op on disk.

pub mod keyring;

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pgp::composed::SignedPublicKey;
use thiserror::Error;

use keyring::Keyring;

/// Suffix marking a parameter whose value is stored encrypted.
pub const ENC_SUFFIX: &str = ".ENC";

const FINGERPRINT_PREFIX: &str = "#public-key-fingerprints:";

#[derive(Debug, Error)]
pub enum SecretsError {
	#[error("cannot decrypt value of '{key}': it was not encrypted for the configured private key")]
	KeyMismatch { key: String },

	#[error("'{key}' is encrypted but no private key is available")]
	MissingPrivateKey { key: String },

	#[error("malformed parameter line {lineno}: '{line}'")]
	Malformed { lineno: usize, line: String },

	#[error("no public keys found in {dir}")]
	NoPublicKeys { dir: String },

	#[error("reading {path}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("loading key {path}: {reason}")]
	Key { path: String, reason: String },

	#[error("openpgp envelope: {0}")]
	Envelope(String),

	#[error("generating keypair: {0}")]
	Keygen(String),
}

/// One `KEY=value` pair. `value` always holds the plaintext; for encrypted
/// parameters the envelope it was read from (if any) rides along so a
/// render can keep it stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
	pub key: String,
	pub value: String,
	pub encrypted: bool,
	ciphertext: Option<String>,
}

#[derive(Debug, Clone)]
enum Entry {
	Blank,
	Comment(String),
	Param(Param),
}

/// An ordered parameter file; see the module docs for the grammar.
#[derive(Debug, Clone, Default)]
pub struct ParamFile {
	entries: Vec<Entry>,
}

impl ParamFile {
	/// Parse stored file content, opening every envelope. `keyring` may be
	/// omitted only for files without encrypted values.
	pub fn parse(content: &str, keyring: Option<&Keyring>) -> Result<Self, SecretsError> {
		Self::parse_inner(content, keyring, true)
	}

	/// Parse an editor buffer: encrypted parameters appear as
	/// `KEY.ENC=plaintext`, so no decryption happens.
	pub fn from_plaintext(content: &str) -> Result<Self, SecretsError> {
		Self::parse_inner(content, None, false)
	}

	fn parse_inner(
		content: &str,
		keyring: Option<&Keyring>,
		decrypting: bool,
	) -> Result<Self, SecretsError> {
		let mut entries = Vec::new();
		for (lineno, raw) in content.lines().enumerate() {
			let line = raw.trim_end();
			if line.is_empty() {
				entries.push(Entry::Blank);
				continue;
			}
			if line.starts_with(FINGERPRINT_PREFIX) {
				// Regenerated on render.
				continue;
			}
			if line.starts_with('#') {
				entries.push(Entry::Comment(line.to_string()));
				continue;
			}
			let Some((key, value)) = line.split_once('=') else {
				return Err(SecretsError::Malformed {
					lineno: lineno + 1,
					line: line.to_string(),
				});
			};
			let (key, value) = (key.to_string(), value.to_string());
			let enc_base = key.strip_suffix(ENC_SUFFIX).map(str::to_string);
			let param = match enc_base {
				Some(base) if decrypting => {
					let keyring = keyring.ok_or_else(|| SecretsError::MissingPrivateKey {
						key: base.clone(),
					})?;
					let raw = BASE64.decode(value.as_bytes()).map_err(|_| {
						SecretsError::KeyMismatch { key: base.clone() }
					})?;
					let plaintext = keyring
						.open(&raw)
						.map_err(|_| SecretsError::KeyMismatch { key: base.clone() })?;
					Param {
						key: base,
						value: plaintext,
						encrypted: true,
						ciphertext: Some(value),
					}
				}
				Some(base) => Param {
					key: base,
					value,
					encrypted: true,
					ciphertext: None,
				},
				None => Param {
					key,
					value,
					encrypted: false,
					ciphertext: None,
				},
			};
			entries.push(Entry::Param(param));
		}
		Ok(Self { entries })
	}

	pub fn load(path: &Path, keyring: Option<&Keyring>) -> Result<Self, SecretsError> {
		let content = fs::read_to_string(path).map_err(|source| SecretsError::Io {
			path: path.display().to_string(),
			source,
		})?;
		Self::parse(&content, keyring)
	}

	pub fn params(&self) -> impl Iterator<Item = &Param> {
		self.entries.iter().filter_map(|e| match e {
			Entry::Param(p) => Some(p),
			_ => None,
		})
	}

	pub fn get(&self, key: &str) -> Option<&Param> {
		self.params().find(|p| p.key == key)
	}

	/// Decrypted view with `.ENC` suffixes kept: the editor buffer and the
	/// `reveal` output.
	pub fn plaintext(&self) -> String {
		let mut out = String::new();
		for entry in &self.entries {
			match entry {
				Entry::Blank => out.push('\n'),
				Entry::Comment(c) => {
					out.push_str(c);
					out.push('\n');
				}
				Entry::Param(p) => {
					let suffix = if p.encrypted { ENC_SUFFIX } else { "" };
					out.push_str(&format!("{}{}={}\n", p.key, suffix, p.value));
				}
			}
		}
		out
	}

	/// Plain `KEY=value` lines for the platform's template processor.
	pub fn for_template(&self) -> String {
		self.params()
			.map(|p| format!("{}={}\n", p.key, p.value))
			.collect()
	}

	/// Render stored file content. Encrypted values are sealed for every
	/// recipient; a parameter whose plaintext matches `previous` keeps its
	/// previous envelope byte-for-byte. Ends with the fingerprint block.
	pub fn render(
		&self,
		recipients: &[SignedPublicKey],
		previous: Option<&ParamFile>,
	) -> Result<String, SecretsError> {
		let mut out = String::new();
		for entry in &self.entries {
			match entry {
				Entry::Blank => out.push('\n'),
				Entry::Comment(c) => {
					out.push_str(c);
					out.push('\n');
				}
				Entry::Param(p) if p.encrypted => {
					let reused = previous
						.and_then(|prev| prev.get(&p.key))
						.filter(|prev| prev.encrypted && prev.value == p.value)
						.and_then(|prev| prev.ciphertext.clone());
					let envelope = match reused {
						Some(envelope) => envelope,
						None => BASE64.encode(keyring::seal(&p.value, recipients)?),
					};
					out.push_str(&format!("{}{}={}\n", p.key, ENC_SUFFIX, envelope));
				}
				Entry::Param(p) => {
					out.push_str(&format!("{}={}\n", p.key, p.value));
				}
			}
		}
		out.push_str(&format!(
			"{} {}\n",
			FINGERPRINT_PREFIX,
			keyring::fingerprints(recipients)
		));
		Ok(out)
	}

	/// Write rendered content through a temp file in the target directory,
	/// then rename into place. A crash never leaves a partial file behind.
	pub fn persist(path: &Path, content: &str) -> Result<(), SecretsError> {
		let dir = path.parent().unwrap_or_else(|| Path::new("."));
		let io = |source| SecretsError::Io {
			path: path.display().to_string(),
			source,
		};
		let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io)?;
		use std::io::Write;
		tmp.write_all(content.as_bytes()).map_err(io)?;
		tmp.persist(path).map_err(|e| io(e.error))?;
		Ok(())
	}
}
