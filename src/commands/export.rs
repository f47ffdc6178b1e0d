//! Export command handler: dumps the filtered current state as a template
//! that could serve as a starting point for local files.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use super::diff::current_list;
use super::util::{self, GlobalArgs};
use crate::filter::ResourceFilter;
use crate::oc::{OcClient, Platform};
use crate::options::Options;

#[derive(Args)]
pub struct ExportArgs {
	#[command(flatten)]
	pub global: GlobalArgs,

	/// Keep platform-internal annotations
	#[arg(long)]
	pub with_annotations: bool,

	/// Target resources: a kind list like `pvc,dc` or a single `dc/foo`
	pub resource: Option<String>,
}

/// Run the export command.
pub fn run<W: Write>(args: ExportArgs, writer: W) -> Result<()> {
	let runtime = util::runtime()?;
	runtime.block_on(run_async(args, writer))
}

async fn run_async<W: Write>(args: ExportArgs, mut writer: W) -> Result<()> {
	let options = Options {
		with_annotations: args.with_annotations,
		..util::options_from(&args.global, None, args.resource.clone())?
	};

	let platform = OcClient::new(options.namespace.clone());
	platform
		.whoami()
		.await
		.context("checking platform session")?;

	let filter = ResourceFilter::new(
		options.resource.as_deref(),
		options.selector.as_deref(),
		&options.excludes,
	)?;
	let current = current_list(&platform, &options, &filter).await?;
	if current.is_empty() {
		return Ok(());
	}

	let mut objects: Vec<serde_json::Value> = current
		.resources()
		.iter()
		.map(|r| r.payload.clone())
		.collect();
	objects.sort_by_key(|o| {
		(
			o.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
			o.pointer("/metadata/name")
				.and_then(|v| v.as_str())
				.unwrap_or_default()
				.to_string(),
		)
	});

	let template = json!({
		"apiVersion": "template.openshift.io/v1",
		"kind": "Template",
		"metadata": { "name": template_name(&filter) },
		"objects": objects,
	});
	let yaml = serde_yaml::to_string(&template).context("rendering template")?;
	writer.write_all(yaml.as_bytes())?;
	Ok(())
}

/// Derive a template name from what was selected.
fn template_name(filter: &ResourceFilter) -> String {
	if let Some(name) = &filter.name {
		return name.replace('/', "-").to_lowercase();
	}
	if let Some(selector) = filter.selector() {
		if let Some((_, value)) = selector.split_once('=') {
			return value.split(',').next().unwrap_or(value).to_string();
		}
	}
	if !filter.kinds.is_empty() {
		return filter.kinds.join("-").to_lowercase();
	}
	"all".to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn template_name_prefers_name_then_selector_then_kinds() {
		let by_name = ResourceFilter::new(Some("dc/foo"), None, &[]).unwrap();
		assert_eq!(template_name(&by_name), "deploymentconfig-foo");

		let by_selector = ResourceFilter::new(None, Some("app=pi"), &[]).unwrap();
		assert_eq!(template_name(&by_selector), "pi");

		let by_kinds = ResourceFilter::new(Some("svc,cm"), None, &[]).unwrap();
		assert_eq!(template_name(&by_kinds), "configmap-service");

		let all = ResourceFilter::new(None, None, &[]).unwrap();
		assert_eq!(template_name(&all), "all");
	}
}
