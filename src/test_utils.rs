//! Test doubles: a scripted platform standing in for the `oc` binary and a
//! renderer that records what would have been shown.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::oc::output::Renderer;
use crate::oc::{ExportQuery, Platform, PlatformError, ProcessRequest};

/// A `Platform` whose answers are scripted up front. Every invocation is
/// recorded so tests can assert on order and argument shape.
pub struct ScriptedPlatform {
	calls: Mutex<Vec<String>>,
	/// What `export` returns.
	pub export_yaml: Mutex<String>,
	/// Per-template-file-name output of `process`.
	pub process_outputs: Mutex<HashMap<String, String>>,
	/// Scripted answers for `get` (present?); once drained, absent.
	get_responses: Mutex<VecDeque<bool>>,
	get_default_present: Mutex<bool>,
	patch_error: Mutex<Option<String>>,
}

impl ScriptedPlatform {
	pub fn with_export(self, yaml: &str) -> Self {
		*self.export_yaml.lock().unwrap() = yaml.to_string();
		self
	}

	pub fn with_process_output(self, template_file_name: &str, yaml: &str) -> Self {
		self.process_outputs
			.lock()
			.unwrap()
			.insert(template_file_name.to_string(), yaml.to_string());
		self
	}

	/// Script `get` answers; when the script is exhausted the object is
	/// reported absent. Without a script, it is always present.
	pub fn with_get_responses(self, present: &[bool]) -> Self {
		*self.get_responses.lock().unwrap() = present.iter().copied().collect();
		*self.get_default_present.lock().unwrap() = false;
		self
	}

	pub fn with_patch_error(self, stderr: &str) -> Self {
		*self.patch_error.lock().unwrap() = Some(stderr.to_string());
		self
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}

	fn record(&self, call: String) {
		self.calls.lock().unwrap().push(call);
	}
}

impl Default for ScriptedPlatform {
	fn default() -> Self {
		Self {
			calls: Mutex::new(Vec::new()),
			export_yaml: Mutex::new(String::new()),
			process_outputs: Mutex::new(HashMap::new()),
			get_responses: Mutex::new(VecDeque::new()),
			get_default_present: Mutex::new(true),
			patch_error: Mutex::new(None),
		}
	}
}

#[async_trait]
impl Platform for ScriptedPlatform {
	async fn whoami(&self) -> Result<(), PlatformError> {
		self.record("whoami".to_string());
		Ok(())
	}

	async fn process(&self, req: &ProcessRequest) -> Result<String, PlatformError> {
		let file_name = req
			.template
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		self.record(format!("process {}", file_name));
		self.process_outputs
			.lock()
			.unwrap()
			.get(&file_name)
			.cloned()
			.ok_or_else(|| PlatformError::Template {
				file: file_name,
				stderr: "no scripted output".to_string(),
			})
	}

	async fn export(&self, query: &ExportQuery) -> Result<String, PlatformError> {
		self.record(format!(
			"export {}{}",
			query.kinds.join(","),
			query
				.selector
				.as_deref()
				.map(|s| format!(" -l {}", s))
				.unwrap_or_default()
		));
		Ok(self.export_yaml.lock().unwrap().clone())
	}

	async fn get(&self, kind: &str, name: &str) -> Result<Option<String>, PlatformError> {
		let present = self
			.get_responses
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or(*self.get_default_present.lock().unwrap());
		self.record(format!("get {} {} -> present={}", kind, name, present));
		Ok(present.then(|| format!("kind: {}\nmetadata:\n  name: {}\n", kind, name)))
	}

	async fn create(&self, manifest_yaml: &str) -> Result<(), PlatformError> {
		self.record(format!("create {}", manifest_yaml));
		Ok(())
	}

	async fn delete(&self, kind: &str, name: &str) -> Result<(), PlatformError> {
		self.record(format!("delete {} {}", kind, name));
		Ok(())
	}

	async fn patch(
		&self,
		kind: &str,
		name: &str,
		patch: &json_patch::Patch,
	) -> Result<(), PlatformError> {
		let payload = serde_json::to_string(patch).unwrap_or_default();
		self.record(format!("patch {} {} {}", kind, name, payload));
		if let Some(stderr) = self.patch_error.lock().unwrap().clone() {
			return Err(PlatformError::Adapter {
				bin: "oc".to_string(),
				args: format!("patch {} {}", kind, name),
				stderr,
			});
		}
		Ok(())
	}
}

/// Renderer that records every line, for asserting on report content.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
	pub lines: Vec<(&'static str, String)>,
}

impl RecordingRenderer {
	pub fn contains(&self, needle: &str) -> bool {
		self.lines.iter().any(|(_, line)| line.contains(needle))
	}

	pub fn text(&self) -> String {
		self.lines
			.iter()
			.map(|(_, line)| line.as_str())
			.collect::<Vec<_>>()
			.join("\n")
	}
}

impl Renderer for RecordingRenderer {
	fn info(&mut self, msg: &str) {
		self.lines.push(("info", msg.to_string()));
	}

	fn warn(&mut self, msg: &str) {
		self.lines.push(("warn", msg.to_string()));
	}

	fn error(&mut self, msg: &str) {
		self.lines.push(("error", msg.to_string()));
	}

	fn diff(&mut self, text: &str) {
		self.lines.push(("diff", text.to_string()));
	}
}
