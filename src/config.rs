//! Stitchfile support: per-directory defaults for CLI flags.
//!
//! A Stitchfile holds one flag per line, `<flag> <value...>`, with `#`
//! comments. Flags given on the command line always win; repeating a flag
//! in the file accumulates values for list-valued flags.
//!
//! ```text
//! namespace pi-prod
//! template-dir templates
//! param-dir params/prod
//! upsert-only
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

/// Default Stitchfile name, looked up in the working directory.
pub const STITCHFILE: &str = "Stitchfile";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("reading {path}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

/// Parsed Stitchfile content.
#[derive(Debug, Clone, Default)]
pub struct FileFlags {
	values: BTreeMap<String, Vec<String>>,
}

impl FileFlags {
	/// Load the file at `path`. A missing file is not an error — it simply
	/// contributes nothing.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		if !path.is_file() {
			return Ok(Self::default());
		}
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.display().to_string(),
			source,
		})?;
		Ok(Self::parse(&content))
	}

	pub fn parse(content: &str) -> Self {
		let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
		for line in content.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let (flag, value) = match line.split_once(char::is_whitespace) {
				Some((flag, value)) => (flag, value.trim().to_string()),
				None => (line, String::new()),
			};
			values.entry(flag.to_string()).or_default().push(value);
		}
		Self { values }
	}

	/// First value of `flag`, if present and non-empty.
	pub fn value(&self, flag: &str) -> Option<&str> {
		self.values
			.get(flag)
			.and_then(|v| v.first())
			.map(String::as_str)
			.filter(|v| !v.is_empty())
	}

	/// All values of `flag`.
	pub fn list(&self, flag: &str) -> Vec<String> {
		self.values
			.get(flag)
			.map(|v| v.iter().filter(|s| !s.is_empty()).cloned().collect())
			.unwrap_or_default()
	}

	/// Whether the bare flag was set (`upsert-only` on its own line).
	pub fn enabled(&self, flag: &str) -> bool {
		self.values
			.get(flag)
			.is_some_and(|v| v.iter().any(|s| s.is_empty() || s == "true"))
	}
}

#[cfg(test)]
mod tests {
	use indoc::indoc;

	use super::*;

	#[test]
	fn parses_flags_values_and_booleans() {
		let flags = FileFlags::parse(indoc! {"
			# production context
			namespace pi-prod
			template-dir templates
			template-dir more-templates
			upsert-only
		"});
		assert_eq!(flags.value("namespace"), Some("pi-prod"));
		assert_eq!(flags.list("template-dir"), vec!["templates", "more-templates"]);
		assert!(flags.enabled("upsert-only"));
		assert!(!flags.enabled("force"));
		assert_eq!(flags.value("selector"), None);
	}

	#[test]
	fn missing_file_contributes_nothing() {
		let flags = FileFlags::load(Path::new("/does/not/exist/Stitchfile")).unwrap();
		assert_eq!(flags.value("namespace"), None);
	}

	#[test]
	fn file_is_loaded_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(STITCHFILE);
		fs::write(&path, "selector app=pi\n").unwrap();
		let flags = FileFlags::load(&path).unwrap();
		assert_eq!(flags.value("selector"), Some("app=pi"));
	}
}
