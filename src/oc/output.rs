//! Drift reporting: a small renderer abstraction plus human and JSON diff
//! output. The engine only ever talks to the `Renderer` trait so tests can
//! record what would have been shown.

use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use nu_ansi_term::Color;
use serde_json::Value;
use similar::TextDiff;

use crate::changeset::{Change, Changeset};
use crate::resource::Resource;

/// Controls ANSI color in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
	#[default]
	Auto,
	Always,
	Never,
}

impl ColorMode {
	pub fn should_colorize(&self) -> bool {
		match self {
			ColorMode::Always => true,
			ColorMode::Never => false,
			ColorMode::Auto => std::io::stdout().is_terminal(),
		}
	}
}

/// Output format for per-item diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DiffFormat {
	/// Unified diff of canonical YAML.
	#[default]
	Text,
	/// The raw RFC 6902 patch array.
	Json,
}

/// Where report lines go. `info` is neutral narration; `diff` carries
/// preformatted diff text.
pub trait Renderer {
	fn info(&mut self, msg: &str);
	fn warn(&mut self, msg: &str);
	fn error(&mut self, msg: &str);
	fn diff(&mut self, text: &str);
}

/// Renderer writing colored lines to a terminal (or plain ones to a pipe).
pub struct ColorRenderer<W: Write> {
	writer: W,
	use_color: bool,
}

impl<W: Write> ColorRenderer<W> {
	pub fn new(writer: W, mode: ColorMode) -> Self {
		Self {
			writer,
			use_color: mode.should_colorize(),
		}
	}

	fn paint(&mut self, color: Color, msg: &str) {
		if self.use_color {
			let _ = writeln!(self.writer, "{}", color.paint(msg));
		} else {
			let _ = writeln!(self.writer, "{}", msg);
		}
	}
}

impl<W: Write> Renderer for ColorRenderer<W> {
	fn info(&mut self, msg: &str) {
		let _ = writeln!(self.writer, "{}", msg);
	}

	fn warn(&mut self, msg: &str) {
		self.paint(Color::Yellow, msg);
	}

	fn error(&mut self, msg: &str) {
		self.paint(Color::Red, msg);
	}

	fn diff(&mut self, text: &str) {
		if !self.use_color {
			let _ = write!(self.writer, "{}", text);
			return;
		}
		for line in text.lines() {
			let painted = match line.as_bytes().first() {
				Some(b'+') => Color::Green.paint(line).to_string(),
				Some(b'-') => Color::Red.paint(line).to_string(),
				Some(b'@') => Color::Cyan.paint(line).to_string(),
				_ => line.to_string(),
			};
			let _ = writeln!(self.writer, "{}", painted);
		}
	}
}

/// Options for presenting a changeset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOpts {
	pub reveal_secrets: bool,
	pub format: DiffFormat,
}

/// Print the classified drift the way the drift report reads: in-sync items
/// first, then deletions, creations, updates and recreations, each followed
/// by its diff, and a closing count summary.
pub fn render_changeset(changeset: &Changeset, opts: ReportOpts, renderer: &mut dyn Renderer) {
	for change in &changeset.noop {
		renderer.info(&format!("* {} is in sync", change.item_name()));
	}
	for change in &changeset.delete {
		renderer.error(&format!("- {} to delete", change.item_name()));
		renderer.diff(&render_change(change, opts));
	}
	for change in &changeset.create {
		renderer.info(&format!("+ {} to create", change.item_name()));
		renderer.diff(&render_change(change, opts));
	}
	for change in &changeset.update {
		renderer.warn(&format!("~ {} to update", change.item_name()));
		renderer.diff(&render_change(change, opts));
	}
	for change in &changeset.recreate {
		renderer.error(&format!("! {} to recreate (immutable fields changed)", change.item_name()));
		renderer.diff(&render_change(change, opts));
	}

	let mut summary = format!(
		"\nSummary: {} in sync, {} to create, {} to update, {} to delete",
		changeset.noop.len(),
		changeset.create.len(),
		changeset.update.len(),
		changeset.delete.len(),
	);
	if !changeset.recreate.is_empty() {
		summary.push_str(&format!(", {} to recreate", changeset.recreate.len()));
	}
	summary.push('\n');
	renderer.info(&summary);
}

/// Render one change in the requested format.
pub fn render_change(change: &Change, opts: ReportOpts) -> String {
	let is_secret = change
		.desired
		.as_ref()
		.or(change.current.as_ref())
		.is_some_and(Resource::is_secret);
	match opts.format {
		DiffFormat::Json => {
			let patches = if is_secret && !opts.reveal_secrets {
				redact_patch(&change.patches)
			} else {
				change.patches.clone()
			};
			serde_json::to_string_pretty(&patches).unwrap_or_default() + "\n"
		}
		DiffFormat::Text => {
			let current = change
				.current
				.as_ref()
				.map(|r| display_yaml(r, opts.reveal_secrets))
				.unwrap_or_default();
			let desired = change
				.desired
				.as_ref()
				.map(|r| display_yaml(r, opts.reveal_secrets))
				.unwrap_or_default();
			let name = change.item_name();
			let (old_header, new_header) = match (&change.current, &change.desired) {
				(None, Some(_)) => ("/dev/null".to_string(), format!("b/{}", name)),
				(Some(_), None) => (format!("a/{}", name), "/dev/null".to_string()),
				_ => (format!("a/{}", name), format!("b/{}", name)),
			};
			TextDiff::from_lines(&current, &desired)
				.unified_diff()
				.context_radius(3)
				.header(&old_header, &new_header)
				.to_string()
		}
	}
}

/// Canonical YAML for display, with secret values redacted (or revealed).
fn display_yaml(resource: &Resource, reveal: bool) -> String {
	if !resource.is_secret() {
		return resource.to_yaml();
	}
	let mut payload = resource.payload.clone();
	if reveal {
		reveal_secret_data(&mut payload);
	} else {
		redact_secret_data(&mut payload);
	}
	serde_yaml::to_string(&payload).unwrap_or_default()
}

/// Redact the operation values of a patch against a secret.
fn redact_patch(patch: &json_patch::Patch) -> json_patch::Patch {
	use json_patch::PatchOperation;

	let mut redacted = patch.clone();
	for op in &mut redacted.0 {
		let value = match op {
			PatchOperation::Add(o) => &mut o.value,
			PatchOperation::Replace(o) => &mut o.value,
			_ => continue,
		};
		redact_value(value);
	}
	redacted
}

fn redact_value(value: &mut Value) {
	match value {
		Value::String(s) => *value = Value::String("*".repeat(s.chars().count())),
		Value::Object(map) => map.values_mut().for_each(redact_value),
		Value::Array(items) => items.iter_mut().for_each(redact_value),
		_ => {}
	}
}

/// Replace every secret value character-for-character with `*`, so length
/// drift stays visible without leaking content.
fn redact_secret_data(payload: &mut Value) {
	for field in ["data", "stringData"] {
		if let Some(Value::Object(map)) = payload.get_mut(field) {
			for value in map.values_mut() {
				if let Value::String(s) = value {
					*value = Value::String("*".repeat(s.chars().count()));
				}
			}
		}
	}
}

/// Decode base64 `data` entries into `stringData` for display.
fn reveal_secret_data(payload: &mut Value) {
	use base64::engine::general_purpose::STANDARD as BASE64;
	use base64::Engine;

	let Some(Value::Object(data)) = payload.get("data").cloned() else {
		return;
	};
	let decoded: serde_json::Map<String, Value> = data
		.into_iter()
		.map(|(k, v)| {
			let plain = v
				.as_str()
				.and_then(|s| BASE64.decode(s.as_bytes()).ok())
				.and_then(|bytes| String::from_utf8(bytes).ok())
				.map(Value::String)
				.unwrap_or(v);
			(k, plain)
		})
		.collect();
	if let Some(root) = payload.as_object_mut() {
		root.remove("data");
		let string_data = root
			.entry("stringData")
			.or_insert_with(|| Value::Object(serde_json::Map::new()));
		if let Value::Object(map) = string_data {
			for (k, v) in decoded {
				map.insert(k, v);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::changeset::Action;
	use crate::resource::{NormalizeOpts, Resource, Source};
	use crate::test_utils::RecordingRenderer;

	fn secret() -> Resource {
		Resource::from_value(
			json!({
				"kind": "Secret",
				"metadata": { "name": "creds" },
				"data": { "password": "aHVudGVyMg==" },
			}),
			Source::Current,
			&NormalizeOpts::default(),
		)
		.unwrap()
	}

	#[test]
	fn redaction_preserves_length() {
		let mut payload = secret().payload;
		redact_secret_data(&mut payload);
		let value = payload.pointer("/data/password").unwrap().as_str().unwrap();
		assert_eq!(value, "************");
		assert_eq!(value.len(), "aHVudGVyMg==".len());
	}

	#[test]
	fn reveal_decodes_into_string_data() {
		let mut payload = secret().payload;
		reveal_secret_data(&mut payload);
		assert!(payload.get("data").is_none());
		assert_eq!(
			payload.pointer("/stringData/password").unwrap().as_str().unwrap(),
			"hunter2"
		);
	}

	#[test]
	fn secret_diff_never_contains_plaintext() {
		let current = secret();
		let mut desired = secret();
		desired.payload["data"]["password"] = json!("b3RoZXJwYXNz");
		let change = Change {
			action: Action::Update,
			current: Some(current),
			desired: Some(desired),
			patches: json_patch::Patch(vec![]),
		};
		let text = render_change(&change, ReportOpts::default());
		assert!(!text.contains("aHVudGVyMg=="));
		assert!(!text.contains("b3RoZXJwYXNz"));
		assert!(text.contains('*'));
	}

	#[test]
	fn json_patches_for_secrets_are_redacted() {
		let current = secret();
		let mut desired = secret();
		desired.payload["data"]["password"] = json!("b3RoZXJwYXNz");
		let patches = crate::patch::diff(&current.payload, &desired.payload);
		let change = Change {
			action: Action::Update,
			current: Some(current),
			desired: Some(desired),
			patches,
		};
		let text = render_change(
			&change,
			ReportOpts {
				reveal_secrets: false,
				format: DiffFormat::Json,
			},
		);
		assert!(!text.contains("b3RoZXJwYXNz"));
		assert!(text.contains("\"op\": \"replace\""));
	}

	#[test]
	fn unified_diff_uses_dev_null_for_creates() {
		let change = Change {
			action: Action::Create,
			current: None,
			desired: Some(secret()),
			patches: json_patch::Patch(vec![]),
		};
		let text = render_change(&change, ReportOpts::default());
		assert!(text.starts_with("--- /dev/null"));
		assert!(text.contains("+++ b/Secret/creds"));
	}

	#[test]
	fn report_reads_like_the_drift_summary() {
		let mut changeset = crate::changeset::Changeset::default();
		changeset.noop.push(Change {
			action: Action::Noop,
			current: Some(secret()),
			desired: Some(secret()),
			patches: json_patch::Patch(vec![]),
		});
		let mut renderer = RecordingRenderer::default();
		render_changeset(&changeset, ReportOpts::default(), &mut renderer);
		assert!(renderer.contains("* Secret/creds is in sync"));
		assert!(renderer.contains("0 to delete"));
	}
}
