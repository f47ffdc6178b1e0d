//! Diff command handler: computes and prints the drift between desired and
//! current state. Exits with 3 when drift was detected.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;

use super::util::{self, CompareArgs, GlobalArgs};
use crate::changeset::{self, Changeset, CompareOpts};
use crate::filter::ResourceFilter;
use crate::oc::output::{render_changeset, ColorRenderer, DiffFormat, Renderer, ReportOpts};
use crate::oc::{ExportQuery, OcClient, Platform};
use crate::options::{ContextDirs, Options};
use crate::resource::{ResourceList, Source};
use crate::secrets::keyring::Keyring;
use crate::template::TemplateProcessor;

#[derive(Args)]
pub struct DiffArgs {
	#[command(flatten)]
	pub global: GlobalArgs,

	#[command(flatten)]
	pub compare: CompareArgs,

	/// Diff output format
	#[arg(long = "output", short = 'o', value_enum, default_value_t = DiffFormat::Text)]
	pub format: DiffFormat,

	/// Target resources: a kind list like `pvc,dc` or a single `dc/foo`
	pub resource: Option<String>,
}

/// Run the diff command. Returns whether drift was detected.
pub fn run<W: Write>(args: DiffArgs, writer: W) -> Result<bool> {
	let runtime = util::runtime()?;
	runtime.block_on(run_async(args, writer))
}

async fn run_async<W: Write>(args: DiffArgs, writer: W) -> Result<bool> {
	let options = util::options_from(&args.global, Some(&args.compare), args.resource.clone())?;
	let mut renderer = ColorRenderer::new(writer, args.global.color);
	let report = ReportOpts {
		reveal_secrets: options.reveal_secrets,
		format: args.format,
	};

	let platform = OcClient::new(options.namespace.clone());
	platform
		.whoami()
		.await
		.context("checking platform session")?;

	let mut drift = false;
	let mut processor = TemplateProcessor::new(&platform);
	for context in options.contexts.clone() {
		let changeset =
			changeset_for_context(&mut processor, &platform, &context, &options, &mut renderer)
				.await?;
		render_changeset(&changeset, report, &mut renderer);
		drift |= !changeset.blank();
	}
	Ok(drift)
}

/// Assemble both inventories for one context directory pair and classify
/// them. Shared between `diff` and `apply`.
#[instrument(skip_all, fields(dir = %context.template_dir.display()))]
pub(crate) async fn changeset_for_context(
	processor: &mut TemplateProcessor<'_>,
	platform: &dyn Platform,
	context: &ContextDirs,
	options: &Options,
	renderer: &mut dyn Renderer,
) -> Result<Changeset> {
	renderer.info(&format!(
		"Comparing templates in {} with namespace {}.",
		context.template_dir.display(),
		options.namespace.as_deref().unwrap_or("(current)"),
	));

	let filter = ResourceFilter::new(
		options.resource.as_deref(),
		options.selector.as_deref(),
		&options.excludes,
	)?;

	let keyring = load_keyring(options)?;
	let desired = processor
		.assemble(context, options, &filter, keyring.as_ref())
		.await
		.context("assembling desired state from templates")?;
	let current = current_list(platform, options, &filter)
		.await
		.context("exporting current state")?;

	renderer.info(&format!(
		"Found {} {} in cluster (current state) and {} {} in processed templates (desired state).\n",
		current.len(),
		plural(current.len(), "resource"),
		desired.len(),
		plural(desired.len(), "resource"),
	));

	if desired.is_empty() && !current.is_empty() && !options.force && !options.upsert_only {
		renderer.warn(
			"No resources found in desired state. Refusing to delete anything without --force.",
		);
	}

	let compare_opts = CompareOpts {
		upsert_only: options.upsert_only,
		allow_recreate: options.allow_recreate,
		force: options.force,
		preserved: options.preserved.clone(),
	};
	Ok(changeset::compare(&current, &desired, &compare_opts)?)
}

/// Export the filtered current state into a normalized list.
pub(crate) async fn current_list(
	platform: &dyn Platform,
	options: &Options,
	filter: &ResourceFilter,
) -> Result<ResourceList> {
	let query = ExportQuery {
		kinds: filter.export_kinds(),
		selector: filter.selector(),
		export_mode: true,
	};
	let yaml = platform.export(&query).await?;
	let mut list = ResourceList::new(filter.clone());
	list.append_yaml(&yaml, Source::Current, &options.normalize_current())?;
	Ok(list)
}

/// The private key is only needed once an encrypted parameter shows up, so
/// a missing key file is fine until then.
pub(crate) fn load_keyring(options: &Options) -> Result<Option<Keyring>> {
	if !options.private_key.is_file() {
		return Ok(None);
	}
	Keyring::load(&options.private_key, options.passphrase.clone())
		.map(Some)
		.context("loading private key")
}

fn plural(count: usize, word: &str) -> String {
	if count == 1 {
		word.to_string()
	} else {
		format!("{}s", word)
	}
}

#[cfg(test)]
mod tests {
	use indoc::indoc;

	use super::*;
	use crate::test_utils::{RecordingRenderer, ScriptedPlatform};

	const SERVICE_LIST: &str = indoc! {"
		apiVersion: v1
		kind: List
		items:
		  - apiVersion: v1
		    kind: Service
		    metadata:
		      name: pi
		    spec:
		      ports:
		        - port: 80
	"};

	#[tokio::test]
	async fn no_drift_reports_in_sync() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("app.yml"), "kind: Template\nobjects: []\n").unwrap();

		let platform = ScriptedPlatform::default()
			.with_process_output("app.yml", SERVICE_LIST)
			.with_export(SERVICE_LIST);
		let options = Options {
			contexts: vec![ContextDirs {
				template_dir: dir.path().to_path_buf(),
				param_dir: dir.path().to_path_buf(),
			}],
			..Options::default()
		};
		let context = options.contexts[0].clone();
		let mut processor = TemplateProcessor::new(&platform);
		let mut renderer = RecordingRenderer::default();
		let changeset =
			changeset_for_context(&mut processor, &platform, &context, &options, &mut renderer)
				.await
				.unwrap();
		assert!(changeset.blank());
		assert!(renderer.contains("Found 1 resource in cluster"));
	}

	#[tokio::test]
	async fn current_list_is_filtered_and_normalized() {
		let exported = indoc! {"
			apiVersion: v1
			kind: List
			items:
			  - apiVersion: v1
			    kind: Service
			    metadata:
			      name: pi
			      resourceVersion: '42'
			  - apiVersion: v1
			    kind: ConfigMap
			    metadata:
			      name: other
		"};
		let platform = ScriptedPlatform::default().with_export(exported);
		let options = Options::default();
		let filter = ResourceFilter::new(Some("svc"), None, &[]).unwrap();
		let list = current_list(&platform, &options, &filter).await.unwrap();
		assert_eq!(list.keys(), vec!["Service/pi"]);
		let pi = list.get("Service/pi").unwrap();
		assert!(pi.payload.pointer("/metadata/resourceVersion").is_none());
	}
}
