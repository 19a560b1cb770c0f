mod cli;
mod output;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dns_loader::{DnsCaller, LoadGenerator};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_logging(cli.verbose);

	let job = cli.job_config()?;
	job.validate()?;
	let target = job.target()?;
	output::print_job_summary(&job, target);

	let caller = DnsCaller::connect(job.caller_options()?)
		.await
		.with_context(|| format!("failed to connect to {}", target))?;
	let generator = LoadGenerator::new(job.run_spec(Arc::new(caller)));
	if !generator.start() {
		bail!("load generator refused to start");
	}

	// Ctrl-C stops early; the report covers whatever was issued
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			warn!("interrupted, stopping run");
			if !generator.stop().await {
				generator.wait().await;
			}
		}
		_ = generator.wait() => {}
	}

	let report = generator.report().context("run finished without a report")?;
	output::print_report(&report);

	if let Some(path) = &cli.output {
		output::write_csv(path, &report)?;
	}
	if let Some(path) = &cli.json {
		output::write_json(path, &job, &report)?;
	}

	Ok(())
}

/// Log to stderr at info, or debug with `-v`. `RUST_LOG` takes precedence.
fn init_logging(verbose: bool) {
	let default_level = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}
