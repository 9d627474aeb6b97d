//! Integration tests for the propagation driver
//!
//! Privileged tests run the driver inside a child that already has its own
//! mount namespace, so nothing reaches the host mount table.

use std::path::Path;
use std::time::Duration;

use mountns_core::{CollectingSink, Error, Side, Verdict};
use mountns_driver::{
    DriverState, HarnessConfig, PeerUnmount, PropagationDriver, Suite, TestContext,
    builtin_cases, select_cases,
};
use mountns_namespace::{DEFAULT_STACK_SIZE, NamespaceConfig, clone_into_namespaces, mountinfo};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

fn in_private_namespace<F: FnOnce() -> i32>(f: F) -> i32 {
    let handle =
        clone_into_namespaces(&NamespaceConfig::mount_only(), DEFAULT_STACK_SIZE, f).unwrap();
    handle.join().unwrap().code()
}

fn config_for(workdir: &Path) -> HarnessConfig {
    HarnessConfig::new()
        .with_workdir(workdir)
        .with_timeout(Some(Duration::from_secs(10)))
        .with_unshare_parent(false)
}

fn mounts_left(workdir: &Path) -> usize {
    let entries = mountinfo::read_mountinfo().unwrap();
    mountinfo::mounts_under(&entries, workdir).len()
}

fn kill_children() {
    let pid = std::process::id();
    let children = std::fs::read_to_string(format!("/proc/self/task/{pid}/children")).unwrap();
    for child in children.split_whitespace() {
        let child: i32 = child.parse().unwrap();
        let _ = kill(Pid::from_raw(child), Signal::SIGKILL);
    }
}

#[test]
fn test_catalogue_covers_every_propagation_type() {
    let cases = builtin_cases().unwrap();
    for name in [
        "shared-parent",
        "shared-child",
        "private-parent",
        "private-child",
        "slave-parent",
        "slave-child",
        "unbindable",
    ] {
        assert!(cases.iter().any(|c| c.name.as_str() == name), "missing {name}");
    }
}

#[test]
fn test_each_case_gets_its_own_directory() {
    let config = HarnessConfig::new().with_workdir("/tmp/mountns-test");
    let contexts: Vec<TestContext> = builtin_cases()
        .unwrap()
        .iter()
        .map(|c| TestContext::new(&config, c).unwrap())
        .collect();

    for (i, a) in contexts.iter().enumerate() {
        for b in &contexts[i + 1..] {
            assert_ne!(a.workdir(), b.workdir());
        }
    }
}

#[test]
#[ignore] // Requires root
fn test_every_builtin_case_passes() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let mut suite = Suite::new(config_for(&workdir), builtin_cases().unwrap()).unwrap();
        let mut sink = CollectingSink::new();
        suite.run(&mut sink);

        for report in sink.reports() {
            assert_eq!(report.verdict, Verdict::Pass, "{report}");
            assert_eq!(report.phases.len(), 2, "{report}");
        }
        assert_eq!(mounts_left(&workdir), 0);
        sink.exit_code()
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_idempotent_peer_unmount_passes() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let config = config_for(&workdir).with_peer_unmount(PeerUnmount::Idempotent);
        let mut suite = Suite::new(config, builtin_cases().unwrap()).unwrap();
        let mut sink = CollectingSink::new();
        suite.run(&mut sink);

        assert_eq!(mounts_left(&workdir), 0);
        sink.exit_code()
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_driver_visits_every_state() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let case = select_cases(&["shared-parent".to_string()]).unwrap().remove(0);
        let ctx = TestContext::new(&config_for(&workdir), &case).unwrap();

        let mut driver = PropagationDriver::new();
        let report = driver.run(&ctx);

        assert_eq!(report.verdict, Verdict::Pass, "{report}");
        assert_eq!(
            driver.history(),
            &[
                DriverState::Init,
                DriverState::NamespaceSetup,
                DriverState::Phase1,
                DriverState::Phase1Assert,
                DriverState::Phase2,
                DriverState::Phase2Assert,
                DriverState::Teardown,
                DriverState::Done,
            ]
        );
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_killed_child_is_broken_without_leaks() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let config = config_for(&workdir).with_timeout(Some(Duration::from_secs(2)));
        let cases = select_cases(&["shared-parent".to_string(), "shared-child".to_string()]).unwrap();

        let mut suite = Suite::new(config, cases)
            .unwrap()
            .with_pre_run_hook(Box::new(|_ctx: &TestContext| {
                kill_children();
                Ok(())
            }));
        let mut sink = CollectingSink::new();
        suite.run(&mut sink);

        for report in sink.reports() {
            assert_eq!(report.verdict, Verdict::Broken, "{report}");
            assert!(report.message.contains("killed by signal SIGKILL"), "{report}");
        }
        assert_eq!(mounts_left(&workdir), 0);
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_killed_child_ends_case_without_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let config = config_for(&workdir).with_timeout(None);
        let cases = select_cases(&["shared-parent".to_string(), "private-child".to_string()]).unwrap();

        let mut suite = Suite::new(config, cases)
            .unwrap()
            .with_pre_run_hook(Box::new(|_ctx: &TestContext| {
                kill_children();
                Ok(())
            }));
        let mut sink = CollectingSink::new();
        suite.run(&mut sink);

        assert_eq!(sink.reports().len(), 2);
        for report in sink.reports() {
            assert_eq!(report.verdict, Verdict::Broken, "{report}");
            assert!(report.message.contains("killed by signal"), "{report}");
        }
        assert_eq!(mounts_left(&workdir), 0);
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_failed_parent_bind_still_completes_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let case = select_cases(&["shared-parent".to_string()]).unwrap().remove(0);
        let ctx = TestContext::new(&config_for(&workdir), &case).unwrap();

        // Without B the parent's bind fails with ENOENT.
        let mut driver = PropagationDriver::new().with_pre_run_hook(Box::new(|ctx: &TestContext| {
            std::fs::remove_dir_all(ctx.dir_b())?;
            Ok(())
        }));
        let report = driver.run(&ctx);

        assert_eq!(report.verdict, Verdict::Broken, "{report}");
        assert!(report.message.starts_with("Mount error"), "{report}");
        // The child observed both phases and exited normally.
        assert_eq!(report.phases.len(), 2, "{report}");
        assert!(report.phases.iter().all(|p| p.observer == Side::Child));
        assert!(!report.phases[0].passed);
        assert!(report.phases[1].passed);
        assert!(driver.history().contains(&DriverState::Phase2Assert));
        assert_eq!(mounts_left(&workdir), 0);
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_failed_child_bind_still_completes_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let case = select_cases(&["shared-child".to_string()]).unwrap().remove(0);
        let ctx = TestContext::new(&config_for(&workdir), &case).unwrap();

        let mut driver = PropagationDriver::new().with_pre_run_hook(Box::new(|ctx: &TestContext| {
            std::fs::remove_dir_all(ctx.dir_b())?;
            Ok(())
        }));
        let report = driver.run(&ctx);

        assert_eq!(report.verdict, Verdict::Broken, "{report}");
        assert!(report.message.contains("mutation failed"), "{report}");
        // The parent observed both phases before the child was joined.
        assert_eq!(report.phases.len(), 2, "{report}");
        assert!(report.phases.iter().all(|p| p.observer == Side::Parent));
        assert!(driver.history().contains(&DriverState::Phase2Assert));
        assert_eq!(mounts_left(&workdir), 0);
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_hook_error_still_reaches_done() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().to_path_buf();

    let code = in_private_namespace(move || {
        let case = select_cases(&["private-child".to_string()]).unwrap().remove(0);
        let ctx = TestContext::new(&config_for(&workdir), &case).unwrap();

        let mut driver = PropagationDriver::new().with_pre_run_hook(Box::new(|_ctx: &TestContext| {
            Err(Error::Protocol {
                message: "aborted by hook".to_string(),
            })
        }));
        let report = driver.run(&ctx);

        assert_eq!(report.verdict, Verdict::Broken);
        assert!(report.message.contains("aborted by hook"));
        assert_eq!(driver.state(), DriverState::Done);
        assert!(driver.history().contains(&DriverState::Teardown));
        assert!(!driver.history().contains(&DriverState::Phase1));
        assert_eq!(mounts_left(&workdir), 0);
        0
    });

    assert_eq!(code, 0);
}
