//! Apply command handler: shows the drift report, asks for confirmation
//! unless running non-interactively, then drives the apply engine.

use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::Args;

use super::diff::changeset_for_context;
use super::util::{self, CompareArgs, GlobalArgs};
use crate::oc::apply::ApplyEngine;
use crate::oc::output::{render_changeset, ColorRenderer, DiffFormat, Renderer, ReportOpts};
use crate::oc::{OcClient, Platform};
use crate::template::TemplateProcessor;

#[derive(Args)]
pub struct ApplyArgs {
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

/// Run the apply command.
pub fn run<W: Write>(args: ApplyArgs, writer: W) -> Result<()> {
	let runtime = util::runtime()?;
	runtime.block_on(run_async(args, writer))
}

async fn run_async<W: Write>(args: ApplyArgs, writer: W) -> Result<()> {
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

	let mut processor = TemplateProcessor::new(&platform);
	let mut failures = Vec::new();
	let mut applied = 0usize;

	for context in options.contexts.clone() {
		let changeset =
			changeset_for_context(&mut processor, &platform, &context, &options, &mut renderer)
				.await?;
		render_changeset(&changeset, report, &mut renderer);

		if changeset.blank() {
			continue;
		}

		if !options.non_interactive {
			if !util::prompt_confirmation("Apply changes?")? {
				renderer.info("Apply cancelled.");
				return Ok(());
			}
		}

		let engine = ApplyEngine::new(&platform);
		let outcome = engine.apply(&changeset, &mut renderer).await?;
		applied += outcome.applied;
		failures.extend(outcome.failures);
	}

	if !failures.is_empty() {
		let summary: Vec<String> = failures
			.iter()
			.map(|f| format!("  {}: {}", f.key, f.error))
			.collect();
		bail!(
			"{} of {} item(s) failed to apply:\n{}",
			failures.len(),
			applied + failures.len(),
			summary.join("\n")
		);
	}

	renderer.info(&format!("\nApply complete, {} item(s) changed.", applied));
	Ok(())
}
