//! Run command implementation

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::time::Duration;

use mountns_core::exit_code;
use mountns_driver::{HarnessConfig, Suite, TestContext, select_cases};

use crate::cli::RunArgs;
use crate::sink::{ConsoleSink, JsonSink};

pub fn execute(args: &RunArgs) -> Result<i32> {
    let cases = select_cases(&args.cases).context("Invalid case selection")?;
    let config = build_config(args)?;

    tracing::info!(
        cases = cases.len(),
        workdir = %config.workdir.display(),
        timeout = ?config.timeout,
        peer_unmount = %config.peer_unmount,
        "Starting run"
    );

    let mut suite = Suite::new(config, cases).context("Invalid harness configuration")?;
    if args.pause {
        suite = suite.with_pre_run_hook(Box::new(pause));
    }

    let reports = if args.json {
        let mut sink = JsonSink::new(io::stdout());
        suite.run(&mut sink)
    } else {
        let mut sink = ConsoleSink::new(io::stdout());
        suite.run(&mut sink)
    };

    let code = exit_code(&reports);
    tracing::debug!(code, "Run finished");
    Ok(code)
}

fn build_config(args: &RunArgs) -> Result<HarnessConfig> {
    let timeout = if args.pause || args.timeout == 0 {
        None
    } else {
        Some(Duration::from_secs(args.timeout))
    };

    let mut config = HarnessConfig::new()
        .with_timeout(timeout)
        .with_peer_unmount(args.peer_unmount);

    if let Some(dir) = &args.workdir {
        let dir = std::path::absolute(dir)
            .with_context(|| format!("Failed to resolve work directory {}", dir.display()))?;
        config = config.with_workdir(dir);
    }

    Ok(config)
}

/// Hold the case until the operator presses Enter
fn pause(ctx: &TestContext) -> mountns_core::Result<()> {
    let mut stderr = io::stderr();
    writeln!(
        stderr,
        "{}: namespaces ready in pid {} (A = {}), press Enter to continue",
        ctx.case_id(),
        std::process::id(),
        ctx.dir_a().display()
    )?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
