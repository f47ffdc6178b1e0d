use std::str::FromStr;

use clap::{Parser, Subcommand};
use stitch::commands::{self, util::BrokenPipeGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stitch")]
#[command(about = "Infrastructure as Code for OpenShift-style clusters", long_about = None)]
#[command(version)]
struct Cli {
	/// Log level (error, warn, info, debug, trace)
	#[arg(long, global = true, default_value = "warn")]
	log_level: String,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Show drift between the remote state and local templates
	#[command(alias = "status")]
	Diff(commands::diff::DiffArgs),

	/// Converge the remote state toward local templates
	#[command(alias = "update")]
	Apply(commands::apply::ApplyArgs),

	/// Export remote state as a template
	Export(commands::export::ExportArgs),

	/// Work with encrypted parameter files
	Secrets(commands::secrets::SecretsArgs),

	/// Show version
	Version,
}

/// Initialize tracing with logfmt output.
fn init_logger(level: &str) {
	let filter =
		EnvFilter::from_str(level).unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_logfmt::layer())
		.init();
}

fn main() {
	let cli = Cli::parse();
	init_logger(&cli.log_level);

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	// Exit codes: 0 success and no drift, 3 drift detected, 1 any error.
	let code = match cli.command {
		Commands::Diff(args) => match commands::diff::run(args, stdout) {
			Ok(false) => 0,
			Ok(true) => 3,
			Err(e) => fail(e),
		},
		Commands::Apply(args) => match commands::apply::run(args, stdout) {
			Ok(()) => 0,
			Err(e) => fail(e),
		},
		Commands::Export(args) => match commands::export::run(args, stdout) {
			Ok(()) => 0,
			Err(e) => fail(e),
		},
		Commands::Secrets(args) => match commands::secrets::run(args, stdout) {
			Ok(()) => 0,
			Err(e) => fail(e),
		},
		Commands::Version => {
			println!("{}", env!("CARGO_PKG_VERSION"));
			0
		}
	};
	std::process::exit(code);
}

fn fail(error: anyhow::Error) -> i32 {
	eprintln!("Error: {:#}", error);
	1
}
