//! Namespaces command implementation

use anyhow::{Context, Result};

use mountns_namespace::{NamespaceManager, mountinfo};

pub fn execute(pid: Option<u32>) -> Result<()> {
    let target_pid = pid.unwrap_or_else(std::process::id);

    println!("Namespace information for PID {target_pid}");
    println!("{:-<60}", "");

    let ns_info = NamespaceManager::namespaces_for_pid(target_pid)
        .context("Failed to get namespace information")?;

    print!("{ns_info}");

    match ns_info.is_isolated() {
        Ok(true) => println!("\nProcess is in isolated namespaces"),
        Ok(false) => println!("\nProcess is in host namespaces"),
        Err(e) => println!("\nFailed to check isolation: {e}"),
    }

    let path = format!("/proc/{target_pid}/mountinfo");
    let mounts = mountinfo::read_mountinfo_from(std::path::Path::new(&path))
        .with_context(|| format!("Failed to read {path}"))?;
    let shared = mounts.iter().filter(|m| m.tags.iter().any(|t| t.starts_with("shared:"))).count();
    println!("Mounts: {} ({shared} shared)", mounts.len());

    Ok(())
}
