use mountns_checkpoint::Checkpoint;
use mountns_namespace::*;
use std::fs;
use std::path::Path;
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Run `body` in a child with a private mount namespace and return its exit code
fn in_mount_namespace(body: impl FnOnce() -> i32) -> i32 {
    clone_into_namespaces(&NamespaceConfig::mount_only(), DEFAULT_STACK_SIZE, body)
        .unwrap()
        .join()
        .unwrap()
        .code()
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(std::result::Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn test_namespace_config_mount_only() {
    let config = NamespaceConfig::mount_only();
    assert!(config.has_any());
    assert_eq!(config.enabled_namespaces(), vec!["mnt"]);
    assert_eq!(config.flags(), NamespaceFlags::MNT);
}

#[test]
fn test_namespace_config_from_flags() {
    let config = NamespaceConfig::from(NamespaceFlags::MNT | NamespaceFlags::UTS);
    assert!(config.enables(NamespaceFlags::UTS));
    assert!(!config.enables(NamespaceFlags::PID));
    assert!(config.to_clone_flags().contains(nix::sched::CloneFlags::CLONE_NEWUTS));
}

#[test]
fn test_child_released_by_checkpoint() {
    let checkpoint = Checkpoint::create(1).unwrap();

    let handle = clone_into_namespaces(&NamespaceConfig::none(), DEFAULT_STACK_SIZE, || {
        match checkpoint.wait(TIMEOUT) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    })
    .unwrap();

    checkpoint.wake(1, TIMEOUT).unwrap();
    assert!(handle.join().unwrap().success());
}

#[test]
fn test_dropped_handle_reaps_child() {
    let checkpoint = Checkpoint::create(1).unwrap();

    let handle = clone_into_namespaces(&NamespaceConfig::none(), DEFAULT_STACK_SIZE, || {
        // Never woken; the drop below kills it first.
        i32::from(checkpoint.wait(TIMEOUT).is_err())
    })
    .unwrap();
    let pid = handle.pid();
    drop(handle);

    assert!(NamespaceManager::namespaces_for_pid(pid.as_raw().unsigned_abs()).is_err());
}

#[test]
#[ignore] // Requires root
fn test_child_gets_new_mount_namespace() {
    let parent = NamespaceManager::with_defaults().current_namespaces().unwrap();

    let code = in_mount_namespace(|| {
        let Ok(child) = NamespaceManager::with_defaults().current_namespaces() else {
            return 2;
        };
        i32::from(child.shares_mount_namespace(&parent))
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_bind_unbind_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");
    let b = dir.path().join("B");
    MountFixture::write_marker(&a, "A").unwrap();
    MountFixture::write_marker(&b, "B").unwrap();

    let code = in_mount_namespace(|| {
        let mut fixture = MountFixture::new(dir.path());
        if fixture.build(&[MountSpec::dir(&a), MountSpec::dir(&b)]).is_err() {
            return 1;
        }

        let before = listing(&a);
        if fixture.bind(&b, &a).is_err() || fixture.active_mounts() != 1 {
            return 2;
        }
        if listing(&a) != vec!["B".to_string()] {
            return 3;
        }
        if !matches!(fixture.unbind(&a), Ok(true)) || fixture.active_mounts() != 0 {
            return 4;
        }
        if listing(&a) != before {
            return 5;
        }
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_mount_count_matches_binds_minus_unbinds() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");
    let b = dir.path().join("B");
    let c = dir.path().join("C");

    let code = in_mount_namespace(|| {
        for propagation in [
            Propagation::Private,
            Propagation::Shared,
            Propagation::Slave,
        ] {
            let mut fixture = MountFixture::new(dir.path());
            let layout = [
                MountSpec::dir(&a).self_bind().propagation(Propagation::Shared),
                MountSpec::dir(&b),
                MountSpec::dir(&c).self_bind().propagation(propagation),
            ];
            if fixture.build(&layout).is_err() {
                return 1;
            }

            let (mut binds, mut unbinds) = (2usize, 0usize);
            for _ in 0..3 {
                if fixture.bind(&b, &c).is_err() {
                    return 2;
                }
                binds += 1;
            }
            if !matches!(fixture.unbind(&c), Ok(true)) {
                return 3;
            }
            unbinds += 1;

            if fixture.active_mounts() != binds - unbinds {
                return 4;
            }
            match fixture.leaked_mounts() {
                Ok(mounts) if mounts.len() == binds - unbinds => {}
                _ => return 5,
            }

            if fixture.teardown().is_err() {
                return 6;
            }
            if !matches!(fixture.leaked_mounts(), Ok(m) if m.is_empty()) {
                return 7;
            }
        }
        0
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_build_marks_propagation() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");

    let code = in_mount_namespace(|| {
        let mut fixture = MountFixture::new(dir.path());
        let layout = [MountSpec::dir(&a).self_bind().propagation(Propagation::Shared)];
        if fixture.build(&layout).is_err() {
            return 1;
        }

        let Ok(entries) = mountinfo::read_mountinfo() else {
            return 2;
        };
        match mountinfo::mount_at(&entries, &a) {
            Some(entry) if entry.propagation() == Propagation::Shared => 0,
            _ => 3,
        }
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_failed_step_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");
    let missing = dir.path().join("missing");

    let code = in_mount_namespace(|| {
        let mut fixture = MountFixture::new(dir.path());
        // Step 1 isolates "/", step 2 is the failing bind.
        match fixture.build(&[MountSpec::dir(&a).bind_from(&missing)]) {
            Err(mountns_core::Error::Mount { step: 2, .. }) if fixture.active_mounts() == 0 => 0,
            _ => 1,
        }
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_sweep_removes_untracked_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");
    let b = dir.path().join("B");

    let code = in_mount_namespace(|| {
        let mut fixture = MountFixture::new(dir.path());
        if fixture.build(&[MountSpec::dir(&a).self_bind(), MountSpec::dir(&b)]).is_err() {
            return 1;
        }
        // Stacked on A behind the fixture's back
        if fixture::bind_mount(&b, &a).is_err() {
            return 2;
        }

        if fixture.teardown().is_err() {
            return 3;
        }
        // Teardown removed the topmost mount at A; the self-bind is left.
        if !matches!(fixture.sweep(), Ok(1)) {
            return 4;
        }
        match fixture.leaked_mounts() {
            Ok(m) if m.is_empty() => 0,
            _ => 5,
        }
    });

    assert_eq!(code, 0);
}

#[test]
#[ignore] // Requires root
fn test_unbind_of_stacked_mount_keeps_tracked_record() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("A");
    let b = dir.path().join("B");
    MountFixture::write_marker(&a, "A").unwrap();
    MountFixture::write_marker(&b, "B").unwrap();

    let code = in_mount_namespace(|| {
        let mut fixture = MountFixture::new(dir.path());
        if fixture.build(&[MountSpec::dir(&a).self_bind(), MountSpec::dir(&b)]).is_err() {
            return 1;
        }
        // Untracked mount on top of the tracked self-bind
        if fixture::bind_mount(&b, &a).is_err() {
            return 2;
        }

        if !matches!(fixture.unbind(&a), Ok(true)) {
            return 3;
        }
        if fixture.active_mounts() != 1 {
            return 4;
        }
        // The self-bind is still mounted and shows A's own marker.
        let still_mounted = mountinfo::read_mountinfo()
            .map(|entries| mountinfo::mount_at(&entries, &a).is_some())
            .unwrap_or(false);
        if !still_mounted || listing(&a) != vec!["A".to_string()] {
            return 5;
        }

        if fixture.teardown().is_err() || fixture.active_mounts() != 0 {
            return 6;
        }
        match fixture.leaked_mounts() {
            Ok(m) if m.is_empty() => 0,
            _ => 7,
        }
    });

    assert_eq!(code, 0);
}
