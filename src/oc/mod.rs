//! Platform transport. Every cluster interaction goes through the platform
//! CLI (`oc` by default); the capability surface is a trait so tests can
//! substitute a scripted fake.

pub mod apply;
pub mod output;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Default deadline for one platform CLI invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL when cancelling a subprocess.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("you need to log in with '{bin} login' first")]
	NotLoggedIn { bin: String },

	#[error("processing template {file}: {stderr}")]
	Template { file: String, stderr: String },

	#[error("exporting current state: {stderr}")]
	Export { stderr: String },

	#[error("'{bin} {args}' failed: {stderr}")]
	Adapter {
		bin: String,
		args: String,
		stderr: String,
	},

	#[error("'{bin} {args}' did not finish within {seconds}s")]
	TimedOut {
		bin: String,
		args: String,
		seconds: u64,
	},

	#[error("interrupted")]
	Interrupted,

	#[error("spawning {bin}")]
	Spawn {
		bin: String,
		#[source]
		source: std::io::Error,
	},
}

/// A template expansion request for the platform's `process` verb.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
	pub template: PathBuf,
	pub param_file: Option<PathBuf>,
	/// `KEY=VALUE` overrides.
	pub params: Vec<String>,
	pub labels: Option<String>,
	pub ignore_unknown_parameters: bool,
}

/// A current-state export request for the platform's `get` verb.
#[derive(Debug, Clone, Default)]
pub struct ExportQuery {
	pub kinds: Vec<String>,
	pub selector: Option<String>,
	/// Ask the platform to strip cluster-specific fields.
	pub export_mode: bool,
}

/// The capability surface of the orchestration platform.
#[async_trait]
pub trait Platform: Send + Sync {
	/// Succeeds iff a session is established.
	async fn whoami(&self) -> Result<(), PlatformError>;

	/// Expand a local template into a YAML list of concrete resources.
	async fn process(&self, req: &ProcessRequest) -> Result<String, PlatformError>;

	/// Dump the current state of the given kinds as a YAML list.
	async fn export(&self, query: &ExportQuery) -> Result<String, PlatformError>;

	/// Fetch a single object; `None` when it does not exist.
	async fn get(&self, kind: &str, name: &str) -> Result<Option<String>, PlatformError>;

	async fn create(&self, manifest_yaml: &str) -> Result<(), PlatformError>;

	/// Succeeds when the object is gone, including when it already was.
	async fn delete(&self, kind: &str, name: &str) -> Result<(), PlatformError>;

	async fn patch(
		&self,
		kind: &str,
		name: &str,
		patch: &json_patch::Patch,
	) -> Result<(), PlatformError>;
}

/// The real platform client: shells out to the `oc` binary.
pub struct OcClient {
	bin: String,
	namespace: Option<String>,
	timeout: Duration,
}

struct CliOutput {
	stdout: String,
	stderr: String,
	success: bool,
}

impl OcClient {
	pub fn new(namespace: Option<String>) -> Self {
		let timeout = std::env::var("KUBECTL_TIMEOUT")
			.ok()
			.and_then(|s| s.parse::<u64>().ok())
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_TIMEOUT);
		Self {
			bin: std::env::var("STITCH_OC_BIN").unwrap_or_else(|_| "oc".to_string()),
			namespace,
			timeout,
		}
	}

	fn namespace_args(&self) -> Vec<String> {
		match &self.namespace {
			Some(ns) => vec!["-n".to_string(), ns.clone()],
			None => Vec::new(),
		}
	}

	/// Run one invocation with the configured deadline. On timeout or
	/// interrupt the child gets SIGTERM, then SIGKILL after a grace period.
	#[instrument(skip(self, stdin), fields(bin = %self.bin))]
	async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<CliOutput, PlatformError> {
		debug!(args = %args.join(" "), "invoking platform CLI");
		let spawn_err = |source| PlatformError::Spawn {
			bin: self.bin.clone(),
			source,
		};

		let mut command = Command::new(&self.bin);
		command
			.args(args)
			.stdin(if stdin.is_some() {
				Stdio::piped()
			} else {
				Stdio::null()
			})
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let mut child = command.spawn().map_err(spawn_err)?;

		if let Some(input) = stdin {
			let mut handle = child.stdin.take().ok_or_else(|| {
				spawn_err(std::io::Error::other("stdin pipe missing"))
			})?;
			handle
				.write_all(input.as_bytes())
				.await
				.map_err(spawn_err)?;
			drop(handle);
		}

		let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
			spawn_err(std::io::Error::other("stdout pipe missing"))
		})?;
		let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
			spawn_err(std::io::Error::other("stderr pipe missing"))
		})?;
		let stdout_task = tokio::spawn(async move {
			use tokio::io::AsyncReadExt;
			let mut buf = Vec::new();
			let _ = stdout_pipe.read_to_end(&mut buf).await;
			buf
		});
		let stderr_task = tokio::spawn(async move {
			use tokio::io::AsyncReadExt;
			let mut buf = Vec::new();
			let _ = stderr_pipe.read_to_end(&mut buf).await;
			buf
		});

		enum Abort {
			Timeout,
			Interrupt,
		}
		let waited = tokio::select! {
			status = child.wait() => Ok(status.map_err(spawn_err)?),
			_ = tokio::time::sleep(self.timeout) => Err(Abort::Timeout),
			_ = tokio::signal::ctrl_c() => Err(Abort::Interrupt),
		};
		let status = match waited {
			Ok(status) => status,
			Err(abort) => {
				warn!(args = %args.join(" "), "terminating platform CLI");
				terminate(&mut child).await;
				return Err(match abort {
					Abort::Timeout => PlatformError::TimedOut {
						bin: self.bin.clone(),
						args: args.join(" "),
						seconds: self.timeout.as_secs(),
					},
					Abort::Interrupt => PlatformError::Interrupted,
				});
			}
		};

		let stdout = stdout_task.await.unwrap_or_default();
		let stderr = stderr_task.await.unwrap_or_default();
		Ok(CliOutput {
			stdout: String::from_utf8_lossy(&stdout).into_owned(),
			stderr: String::from_utf8_lossy(&stderr).into_owned(),
			success: status.success(),
		})
	}

	fn adapter_error(&self, args: &[String], stderr: String) -> PlatformError {
		PlatformError::Adapter {
			bin: self.bin.clone(),
			args: args.join(" "),
			stderr,
		}
	}
}

/// SIGTERM first; SIGKILL once the grace period runs out.
async fn terminate(child: &mut tokio::process::Child) {
	if let Some(pid) = child.id() {
		let _ = nix::sys::signal::kill(
			nix::unistd::Pid::from_raw(pid as i32),
			nix::sys::signal::Signal::SIGTERM,
		);
	}
	if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
		let _ = child.kill().await;
	}
}

fn is_not_found(stderr: &str) -> bool {
	let lower = stderr.to_lowercase();
	lower.contains("notfound") || lower.contains("not found")
}

#[async_trait]
impl Platform for OcClient {
	async fn whoami(&self) -> Result<(), PlatformError> {
		let args = vec!["whoami".to_string()];
		let out = self.run(&args, None).await?;
		if out.success {
			Ok(())
		} else {
			Err(PlatformError::NotLoggedIn {
				bin: self.bin.clone(),
			})
		}
	}

	async fn process(&self, req: &ProcessRequest) -> Result<String, PlatformError> {
		let mut args = vec![
			"process".to_string(),
			"-f".to_string(),
			req.template.display().to_string(),
		];
		if let Some(param_file) = &req.param_file {
			args.push("--param-file".to_string());
			args.push(param_file.display().to_string());
		}
		if req.ignore_unknown_parameters {
			args.push("--ignore-unknown-parameters".to_string());
		}
		if let Some(labels) = &req.labels {
			args.push("-l".to_string());
			args.push(labels.clone());
		}
		for param in &req.params {
			args.push("-p".to_string());
			args.push(param.clone());
		}
		args.push("-o".to_string());
		args.push("yaml".to_string());

		let out = self.run(&args, None).await?;
		if out.success {
			Ok(out.stdout)
		} else {
			Err(PlatformError::Template {
				file: req.template.display().to_string(),
				stderr: out.stderr,
			})
		}
	}

	async fn export(&self, query: &ExportQuery) -> Result<String, PlatformError> {
		let mut args = vec!["get".to_string(), query.kinds.join(",")];
		if let Some(selector) = &query.selector {
			args.push("-l".to_string());
			args.push(selector.clone());
		}
		args.push("-o".to_string());
		args.push("yaml".to_string());
		if query.export_mode {
			args.push("--export".to_string());
		}
		args.extend(self.namespace_args());

		let out = self.run(&args, None).await?;
		if out.success {
			Ok(out.stdout)
		} else {
			Err(PlatformError::Export { stderr: out.stderr })
		}
	}

	async fn get(&self, kind: &str, name: &str) -> Result<Option<String>, PlatformError> {
		let mut args = vec![
			"get".to_string(),
			kind.to_string(),
			name.to_string(),
			"-o".to_string(),
			"yaml".to_string(),
		];
		args.extend(self.namespace_args());

		let out = self.run(&args, None).await?;
		if out.success {
			Ok(Some(out.stdout))
		} else if is_not_found(&out.stderr) {
			Ok(None)
		} else {
			Err(self.adapter_error(&args, out.stderr))
		}
	}

	async fn create(&self, manifest_yaml: &str) -> Result<(), PlatformError> {
		let mut args = vec!["create".to_string(), "-f".to_string(), "-".to_string()];
		args.extend(self.namespace_args());

		let out = self.run(&args, Some(manifest_yaml)).await?;
		if out.success {
			Ok(())
		} else {
			Err(self.adapter_error(&args, out.stderr))
		}
	}

	async fn delete(&self, kind: &str, name: &str) -> Result<(), PlatformError> {
		let mut args = vec!["delete".to_string(), kind.to_string(), name.to_string()];
		args.extend(self.namespace_args());

		let out = self.run(&args, None).await?;
		if out.success || is_not_found(&out.stderr) {
			Ok(())
		} else {
			Err(self.adapter_error(&args, out.stderr))
		}
	}

	async fn patch(
		&self,
		kind: &str,
		name: &str,
		patch: &json_patch::Patch,
	) -> Result<(), PlatformError> {
		let payload = serde_json::to_string(patch).unwrap_or_else(|_| "[]".to_string());
		let mut args = vec![
			"patch".to_string(),
			kind.to_string(),
			name.to_string(),
			"--type=json".to_string(),
			"-p".to_string(),
			payload,
		];
		args.extend(self.namespace_args());

		let out = self.run(&args, None).await?;
		if out.success {
			Ok(())
		} else {
			Err(self.adapter_error(&args, out.stderr))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_found_detection() {
		assert!(is_not_found("Error from server (NotFound): services \"pi\" not found"));
		assert!(!is_not_found("Error from server (Forbidden): access denied"));
	}
}
