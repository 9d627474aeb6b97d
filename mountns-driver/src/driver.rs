//! Parent/child propagation protocol
//!
//! One case runs through
//! `Init → NamespaceSetup → Phase1 → Phase1Assert → Phase2 → Phase2Assert → Teardown → Done`.
//! The actor mutates `A` and hands over with `wake_and_wait`, so the
//! observer only looks at `A/B` after the mount syscall has returned.
//!
//! Before phase 1 the child finishes its own setup (e.g. demoting `A` to a
//! slave) and wakes the parent once, so no mutation races the setup.

use nix::errno::Errno;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mountns_checkpoint::Checkpoint;
use mountns_core::{CaseReport, Error, PhaseResult, Result, Side, Verdict};
use mountns_namespace::fixture::{bind_mount, change_propagation, unmount};
use mountns_namespace::{
    MountFixture, NamespaceConfig, NamespaceHandle, NamespaceManager, Propagation,
    clone_into_namespaces,
};

use crate::config::PeerUnmount;
use crate::context::TestContext;
use crate::outcome::ChildOutcome;

/// Parent/child pair: every wake releases one waiter
const RELEASE_COUNT: u32 = 1;

/// Protocol state of the running case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    /// Nothing done yet
    Init,
    /// Fixture built, child cloned
    NamespaceSetup,
    /// Actor mounts `B` onto `A`
    Phase1,
    /// Observer checks `A/B`
    Phase1Assert,
    /// Actor unmounts `A`
    Phase2,
    /// Observer checks `A/B` is gone
    Phase2Assert,
    /// Mounts removed, child reaped
    Teardown,
    /// Verdict available
    Done,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::NamespaceSetup => "namespace_setup",
            Self::Phase1 => "phase1",
            Self::Phase1Assert => "phase1_assert",
            Self::Phase2 => "phase2",
            Self::Phase2Assert => "phase2_assert",
            Self::Teardown => "teardown",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Hook run after namespace setup and before phase 1
pub type PreRunHook = Box<dyn FnMut(&TestContext) -> Result<()>>;

/// Drives one case at a time through the protocol
#[derive(Default)]
pub struct PropagationDriver {
    state: Option<DriverState>,
    history: Vec<DriverState>,
    pre_run: Option<PreRunHook>,
}

impl fmt::Debug for PropagationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationDriver")
            .field("state", &self.state())
            .field("history", &self.history)
            .field("pre_run", &self.pre_run.is_some())
            .finish()
    }
}

impl PropagationDriver {
    /// Create a driver without a pre-run hook
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook run before phase 1 of every case
    #[must_use]
    pub fn with_pre_run_hook(mut self, hook: PreRunHook) -> Self {
        self.pre_run = Some(hook);
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state.unwrap_or(DriverState::Init)
    }

    /// States visited by the last case, in order
    #[must_use]
    pub fn history(&self) -> &[DriverState] {
        &self.history
    }

    /// Run one case to completion
    ///
    /// Always reaches `Teardown` and `Done`, whatever happens in between,
    /// and returns exactly one verdict. Teardown problems are logged; they
    /// only decide the verdict when the case itself passed.
    pub fn run(&mut self, ctx: &TestContext) -> CaseReport {
        let start = Instant::now();
        self.history.clear();
        self.state = None;
        self.transition(ctx, DriverState::Init);

        let span = tracing::info_span!("case", case = %ctx.case_id());
        let _guard = span.enter();

        let mut fixture =
            MountFixture::new(ctx.workdir()).with_root_isolation(ctx.isolate_root());
        let mut phases = Vec::new();

        let outcome = self
            .execute(ctx, &mut fixture, &mut phases)
            .and_then(|()| check_phases(&phases));

        self.transition(ctx, DriverState::Teardown);
        let cleanup = cleanup(&mut fixture);
        self.transition(ctx, DriverState::Done);

        let result = match (outcome, cleanup) {
            (Err(e), Err(cleanup_error)) => {
                tracing::warn!(error = %cleanup_error, "Cleanup failed after case error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), cleanup) => cleanup,
        };

        let report = match result {
            Ok(()) => CaseReport::new(
                ctx.case_id().clone(),
                Verdict::Pass,
                ctx.case().description.clone(),
            ),
            Err(e) => CaseReport::new(ctx.case_id().clone(), e.verdict(), e.to_string()),
        };

        report.with_phases(phases).with_duration(start.elapsed())
    }

    fn transition(&mut self, ctx: &TestContext, next: DriverState) {
        tracing::debug!(case = %ctx.case_id(), from = %self.state(), to = %next, "State transition");
        self.state = Some(next);
        self.history.push(next);
    }

    fn execute(
        &mut self,
        ctx: &TestContext,
        fixture: &mut MountFixture,
        phases: &mut Vec<PhaseResult>,
    ) -> Result<()> {
        self.transition(ctx, DriverState::NamespaceSetup);

        if ctx.unshare_parent() {
            NamespaceManager::new(NamespaceConfig::mount_only()).create()?;
        }

        prepare_fixture(ctx, fixture)?;

        if !ctx.case().needs_child() {
            self.pre_run(ctx)?;
            return self.run_unbindable(ctx, phases);
        }

        // A timed-out checkpoint keeps stale tickets, so each case gets its own.
        let checkpoint = Checkpoint::create(RELEASE_COUNT)?;
        let plan = ChildPlan::new(ctx);
        let timeout = ctx.timeout();

        let mut handle = {
            let checkpoint = &checkpoint;
            clone_into_namespaces(&NamespaceConfig::mount_only(), ctx.stack_size(), move || {
                run_child(&plan, checkpoint)
            })?
        };

        // Child setup done
        checkpoint.wait_guarded(timeout, &mut || child_alive(&mut handle))?;

        self.pre_run(ctx)?;

        let mutation = match ctx.case().initiator {
            Side::Parent => self.parent_acts(ctx, fixture, &checkpoint, &mut handle)?,
            Side::Child => {
                self.parent_observes(ctx, &checkpoint, &mut handle, phases)?;
                Ok(())
            }
        };

        collect_child(ctx, handle, phases)?;
        mutation
    }

    fn pre_run(&mut self, ctx: &TestContext) -> Result<()> {
        if let Some(hook) = self.pre_run.as_mut() {
            tracing::debug!(case = %ctx.case_id(), "Running pre-run hook");
            hook(ctx)?;
        }
        Ok(())
    }

    /// Parent side when the parent mutates
    ///
    /// A failed mount or unmount does not stop the protocol: the child
    /// still gets both hand-overs and the failure is returned as the inner
    /// result once the checkpoints are done.
    fn parent_acts(
        &mut self,
        ctx: &TestContext,
        fixture: &mut MountFixture,
        checkpoint: &Checkpoint,
        handle: &mut NamespaceHandle,
    ) -> Result<Result<()>> {
        let timeout = ctx.timeout();
        let mut alive = || child_alive(handle);

        self.transition(ctx, DriverState::Phase1);
        let bound = fixture.bind(ctx.dir_b(), ctx.dir_a());
        if let Err(e) = &bound {
            tracing::error!(target = %ctx.dir_a().display(), error = %e, "Parent bind failed");
        }
        checkpoint.wake_and_wait_guarded(RELEASE_COUNT, timeout, &mut alive)?;

        self.transition(ctx, DriverState::Phase1Assert);

        self.transition(ctx, DriverState::Phase2);
        let unbound = match &bound {
            Ok(()) => fixture.unbind(ctx.dir_a()).map(|_| ()),
            Err(_) => Ok(()),
        };
        if let Err(e) = &unbound {
            tracing::error!(target = %ctx.dir_a().display(), error = %e, "Parent unmount failed");
        }
        checkpoint.wake_and_wait_guarded(RELEASE_COUNT, timeout, &mut alive)?;

        self.transition(ctx, DriverState::Phase2Assert);
        Ok(bound.and(unbound))
    }

    fn parent_observes(
        &mut self,
        ctx: &TestContext,
        checkpoint: &Checkpoint,
        handle: &mut NamespaceHandle,
        phases: &mut Vec<PhaseResult>,
    ) -> Result<()> {
        let timeout = ctx.timeout();
        let probe = ctx.probe();
        let expect_visible = ctx.case().expect_visible;
        let mut alive = || child_alive(handle);

        self.transition(ctx, DriverState::Phase1);
        checkpoint.wait_guarded(timeout, &mut alive)?;

        self.transition(ctx, DriverState::Phase1Assert);
        let visible = probe_visible(&probe);
        phases.push(phase_result(1, Side::Parent, expect_visible, visible));
        checkpoint.wake_and_wait_guarded(RELEASE_COUNT, timeout, &mut alive)?;

        self.transition(ctx, DriverState::Phase2);

        self.transition(ctx, DriverState::Phase2Assert);
        let visible = probe_visible(&probe);
        phases.push(phase_result(2, Side::Parent, false, visible));

        if visible && ctx.peer_unmount() == PeerUnmount::Idempotent {
            peer_unmount(ctx.dir_a());
        }

        checkpoint.wake_guarded(RELEASE_COUNT, timeout, &mut alive)
    }

    /// Single-process case: `A` is unbindable, so binding it onto `B` must
    /// fail with `EINVAL` and leave `B` untouched.
    fn run_unbindable(&mut self, ctx: &TestContext, phases: &mut Vec<PhaseResult>) -> Result<()> {
        self.transition(ctx, DriverState::Phase1);
        let attempt = bind_mount(ctx.dir_a(), ctx.dir_b());

        self.transition(ctx, DriverState::Phase1Assert);
        let refused = match attempt {
            Ok(()) => {
                tracing::error!(source = %ctx.dir_a().display(), "Unbindable mount was bound");
                if let Err(errno) = unmount(ctx.dir_b()) {
                    tracing::warn!(target = %ctx.dir_b().display(), error = %errno, "Failed to undo bind");
                }
                false
            }
            Err(Errno::EINVAL) => true,
            Err(Errno::EPERM) => {
                return Err(Error::PermissionDenied {
                    operation: format!("bind {}", ctx.dir_a().display()),
                });
            }
            Err(errno) => {
                tracing::error!(error = %errno, "Bind refused with unexpected errno");
                false
            }
        };
        phases.push(phase_result(1, Side::Parent, false, !refused));

        self.transition(ctx, DriverState::Phase2);

        self.transition(ctx, DriverState::Phase2Assert);
        let leaked = probe_visible(&ctx.dir_b().join("A"));
        phases.push(phase_result(2, Side::Parent, false, leaked));

        Ok(())
    }
}

/// Markers and mounts shared by every case
fn prepare_fixture(ctx: &TestContext, fixture: &mut MountFixture) -> Result<()> {
    let swept = fixture.sweep()?;
    if swept > 0 {
        tracing::warn!(swept, workdir = %ctx.workdir().display(), "Removed stale mounts");
    }

    MountFixture::write_marker(ctx.dir_a(), "A")?;
    MountFixture::write_marker(ctx.dir_b(), "B")?;

    fixture.build(&ctx.case().layout(ctx.dir_a(), ctx.dir_b()))
}

/// Everything the child needs, copied into it at clone time
#[derive(Debug, Clone)]
struct ChildPlan {
    acts: bool,
    dir_a: PathBuf,
    dir_b: PathBuf,
    probe: PathBuf,
    expect_visible: bool,
    demote_to_slave: bool,
    peer_unmount: PeerUnmount,
    timeout: Option<Duration>,
}

impl ChildPlan {
    fn new(ctx: &TestContext) -> Self {
        let case = ctx.case();
        Self {
            acts: case.initiator == Side::Child,
            dir_a: ctx.dir_a().to_path_buf(),
            dir_b: ctx.dir_b().to_path_buf(),
            probe: ctx.probe(),
            expect_visible: case.expect_visible,
            demote_to_slave: case.propagation == Propagation::Slave,
            peer_unmount: ctx.peer_unmount(),
            timeout: ctx.timeout(),
        }
    }
}

/// Child side of the protocol; the return value is its exit code
fn run_child(plan: &ChildPlan, checkpoint: &Checkpoint) -> i32 {
    let mut outcome = ChildOutcome::OK;

    if plan.demote_to_slave {
        if let Err(errno) = change_propagation(&plan.dir_a, Propagation::Slave, false) {
            tracing::error!(target = %plan.dir_a.display(), error = %errno, "Child could not become slave");
            outcome.insert(ChildOutcome::SETUP_FAILED);
        }
    }

    if let Err(e) = checkpoint.wake(RELEASE_COUNT, plan.timeout) {
        tracing::error!(error = %e, "Child setup handshake failed");
        outcome.insert(ChildOutcome::CHECKPOINT_FAILED);
        return outcome.exit_code();
    }

    let result = if plan.acts {
        child_acts(plan, checkpoint, &mut outcome)
    } else {
        child_observes(plan, checkpoint, &mut outcome)
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Child checkpoint failed");
        outcome.insert(ChildOutcome::CHECKPOINT_FAILED);
    }

    tracing::debug!(%outcome, "Child done");
    outcome.exit_code()
}

fn child_acts(plan: &ChildPlan, checkpoint: &Checkpoint, outcome: &mut ChildOutcome) -> Result<()> {
    let bound = match bind_mount(&plan.dir_b, &plan.dir_a) {
        Ok(()) => true,
        Err(errno) => {
            tracing::error!(target = %plan.dir_a.display(), error = %errno, "Child bind failed");
            outcome.insert(ChildOutcome::MUTATION_FAILED);
            false
        }
    };
    checkpoint.wake_and_wait(RELEASE_COUNT, plan.timeout)?;

    if bound {
        if let Err(errno) = unmount(&plan.dir_a) {
            tracing::error!(target = %plan.dir_a.display(), error = %errno, "Child unmount failed");
            outcome.insert(ChildOutcome::MUTATION_FAILED);
        }
    }
    checkpoint.wake_and_wait(RELEASE_COUNT, plan.timeout)
}

fn child_observes(
    plan: &ChildPlan,
    checkpoint: &Checkpoint,
    outcome: &mut ChildOutcome,
) -> Result<()> {
    checkpoint.wait(plan.timeout)?;

    if probe_visible(&plan.probe) != plan.expect_visible {
        outcome.insert(ChildOutcome::PHASE1_MISMATCH);
    }
    checkpoint.wake_and_wait(RELEASE_COUNT, plan.timeout)?;

    let visible = probe_visible(&plan.probe);
    if visible {
        outcome.insert(ChildOutcome::PHASE2_MISMATCH);
        if plan.peer_unmount == PeerUnmount::Idempotent {
            peer_unmount(&plan.dir_a);
        }
    }

    checkpoint.wake(RELEASE_COUNT, plan.timeout)
}

/// Observer-side removal of a mount the actor may already have removed
fn peer_unmount(target: &Path) {
    match unmount(target) {
        Ok(()) => tracing::debug!(target = %target.display(), "Peer unmounted"),
        Err(Errno::EINVAL | Errno::ENOENT) => {
            tracing::debug!(target = %target.display(), "Peer unmount: already gone");
        }
        Err(errno) => {
            tracing::warn!(target = %target.display(), error = %errno, "Peer unmount failed");
        }
    }
}

/// Guard for parent-side checkpoints: fails once the child is gone
///
/// A child killed by a signal surfaces as `Fatal`; one that exited
/// without finishing its part of the protocol as `Protocol`.
fn child_alive(handle: &mut NamespaceHandle) -> Result<()> {
    match handle.try_join()? {
        None => Ok(()),
        Some(status) => Err(Error::Protocol {
            message: format!(
                "child {} exited with {status} before the protocol finished",
                handle.pid()
            ),
        }),
    }
}

/// Join the child and turn its exit code into phase results
fn collect_child(
    ctx: &TestContext,
    handle: NamespaceHandle,
    phases: &mut Vec<PhaseResult>,
) -> Result<()> {
    let pid = handle.pid();
    let status = handle.join()?;

    let outcome = ChildOutcome::from_exit_code(status.code()).ok_or_else(|| Error::Protocol {
        message: format!("child {pid} exited with unexpected {status}"),
    })?;

    if outcome.is_broken() {
        return Err(Error::Protocol {
            message: format!("child {pid} reported: {outcome}"),
        });
    }

    match ctx.case().observer() {
        Side::Child => {
            let expect_visible = ctx.case().expect_visible;
            phases.push(PhaseResult {
                phase: 1,
                observer: Side::Child,
                expected_visible: expect_visible,
                passed: !outcome.contains(ChildOutcome::PHASE1_MISMATCH),
            });
            phases.push(PhaseResult {
                phase: 2,
                observer: Side::Child,
                expected_visible: false,
                passed: !outcome.contains(ChildOutcome::PHASE2_MISMATCH),
            });
        }
        Side::Parent if !outcome.is_ok() => {
            return Err(Error::Protocol {
                message: format!("acting child {pid} reported: {outcome}"),
            });
        }
        Side::Parent => {}
    }

    tracing::debug!(pid = %pid, %outcome, "Child collected");
    Ok(())
}

fn probe_visible(probe: &Path) -> bool {
    let visible = probe.exists();
    tracing::debug!(probe = %probe.display(), visible, "Probe checked");
    visible
}

fn phase_result(phase: u8, observer: Side, expected_visible: bool, visible: bool) -> PhaseResult {
    PhaseResult {
        phase,
        observer,
        expected_visible,
        passed: visible == expected_visible,
    }
}

/// Turn the first failed phase into an assertion error
fn check_phases(phases: &[PhaseResult]) -> Result<()> {
    match phases.iter().find(|p| !p.passed) {
        None => Ok(()),
        Some(failed) => {
            let expectation = if failed.expected_visible {
                "visible"
            } else {
                "absent"
            };
            Err(Error::Assertion {
                phase: format!("phase {}", failed.phase),
                message: format!("{} expected A/B {expectation}", failed.observer),
            })
        }
    }
}

/// Teardown, sweep of untracked mounts, then a leak check
fn cleanup(fixture: &mut MountFixture) -> Result<()> {
    let teardown = fixture.teardown();
    if let Err(e) = &teardown {
        tracing::warn!(error = %e, "Teardown failed");
    }

    let swept = fixture.sweep()?;
    if swept > 0 {
        tracing::debug!(swept, "Removed untracked mounts");
    }

    let leaked = fixture.leaked_mounts()?;
    if !leaked.is_empty() {
        let points: Vec<String> = leaked
            .iter()
            .map(|m| m.mount_point.display().to_string())
            .collect();
        return Err(Error::Namespace {
            message: format!("{} mounts leaked: {}", leaked.len(), points.join(", ")),
        });
    }

    teardown
}
