//! List command implementation

use anyhow::{Context, Result};

use mountns_driver::builtin_cases;

pub fn execute() -> Result<()> {
    let cases = builtin_cases().context("Failed to load built-in cases")?;

    println!("{:<16} {:<11} {:<7} {:<8} DESCRIPTION", "CASE", "PROPAGATION", "ACTOR", "VISIBLE");
    for case in &cases {
        println!(
            "{:<16} {:<11} {:<7} {:<8} {}",
            case.name.as_str(),
            case.propagation.as_str(),
            case.initiator.to_string(),
            if case.expect_visible { "yes" } else { "no" },
            case.description
        );
    }

    Ok(())
}
