//! Directory and bind-mount topology under test
//!
//! [`MountFixture`] records every bind mount it makes and undoes them in
//! reverse order on [`teardown`](MountFixture::teardown), which also runs on
//! drop. Leaked mounts would corrupt later cases, so every exit path of a
//! case goes through it.

use nix::errno::Errno;
use nix::mount::{MsFlags, mount, umount};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use mountns_core::{Error, Result};

use crate::mountinfo::{self, MountEntry};

/// Mount propagation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Events neither leave nor reach the mount
    Private,
    /// Events replicate to and from every peer
    Shared,
    /// Events arrive from the master but do not flow back
    Slave,
    /// Private, and the mount cannot be bind-mounted
    Unbindable,
}

impl Propagation {
    /// Flag passed to mount(2) to switch to this type
    #[must_use]
    pub const fn ms_flag(self) -> MsFlags {
        match self {
            Self::Private => MsFlags::MS_PRIVATE,
            Self::Shared => MsFlags::MS_SHARED,
            Self::Slave => MsFlags::MS_SLAVE,
            Self::Unbindable => MsFlags::MS_UNBINDABLE,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Slave => "slave",
            Self::Unbindable => "unbindable",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "shared" => Ok(Self::Shared),
            "slave" => Ok(Self::Slave),
            "unbindable" => Ok(Self::Unbindable),
            other => Err(Error::InvalidConfig {
                message: format!("Unknown propagation type: {other}"),
            }),
        }
    }
}

/// One entry of a fixture layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Directory to create
    pub path: PathBuf,
    /// Propagation type applied after the optional bind
    pub propagation: Option<Propagation>,
    /// Directory bind-mounted onto `path`
    pub bind_source: Option<PathBuf>,
}

impl MountSpec {
    /// A plain directory
    #[must_use]
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            propagation: None,
            bind_source: None,
        }
    }

    /// Bind `source` onto this directory
    #[must_use]
    pub fn bind_from(mut self, source: impl Into<PathBuf>) -> Self {
        self.bind_source = Some(source.into());
        self
    }

    /// Bind the directory onto itself, turning it into a mount point
    #[must_use]
    pub fn self_bind(self) -> Self {
        let path = self.path.clone();
        self.bind_from(path)
    }

    /// Set the propagation type
    #[must_use]
    pub const fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = Some(propagation);
        self
    }
}

#[derive(Debug, Clone)]
struct MountRecord {
    source: PathBuf,
    target: PathBuf,
    /// mountinfo ID of the mount this bind created, if it could be read
    mount_id: Option<u32>,
}

impl MountRecord {
    /// Whether the mount `top` (topmost at `target`) is this record's
    fn is_topmost(&self, top: Option<u32>) -> bool {
        match (self.mount_id, top) {
            (Some(own), Some(top)) => own == top,
            _ => true,
        }
    }
}

/// Builds a mount topology and guarantees its removal
#[derive(Debug)]
pub struct MountFixture {
    workdir: PathBuf,
    isolate_root: bool,
    mounts: Vec<MountRecord>,
    step: usize,
}

impl MountFixture {
    /// Create an empty fixture rooted at `workdir`
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            isolate_root: true,
            mounts: Vec::new(),
            step: 0,
        }
    }

    /// Whether `build` first makes `/` recursively private
    #[must_use]
    pub const fn with_root_isolation(mut self, enable: bool) -> Self {
        self.isolate_root = enable;
        self
    }

    /// Directory the fixture lives in
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Number of bind mounts currently tracked
    #[must_use]
    pub fn active_mounts(&self) -> usize {
        self.mounts.len()
    }

    /// Create the layout
    ///
    /// Directories are created first, then `/` is made recursively private
    /// (if enabled) so nothing reaches the host, then binds and propagation
    /// changes run in layout order. The first failing step aborts the rest.
    ///
    /// # Errors
    /// Returns `Mount { step, .. }` for the failing step or `Io` when a
    /// directory cannot be created.
    pub fn build(&mut self, layout: &[MountSpec]) -> Result<()> {
        for spec in layout {
            fs::create_dir_all(&spec.path)?;
        }

        if self.isolate_root {
            self.set_propagation(Path::new("/"), Propagation::Private, true)?;
        }

        for spec in layout {
            if let Some(source) = &spec.bind_source {
                self.bind(source, &spec.path)?;
            }
            if let Some(propagation) = spec.propagation {
                self.set_propagation(&spec.path, propagation, false)?;
            }
        }

        tracing::debug!(
            workdir = %self.workdir.display(),
            entries = layout.len(),
            mounts = self.mounts.len(),
            "Fixture built"
        );

        Ok(())
    }

    /// Bind-mount `source` onto `target` and track it
    ///
    /// # Errors
    /// Returns `Mount` if mount(2) fails
    pub fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        let step = self.next_step();
        bind_mount(source, target).map_err(|errno| mount_error(step, target, errno))?;

        let mount_id = topmost_mount_id(target);
        tracing::debug!(
            step,
            source = %source.display(),
            target = %target.display(),
            ?mount_id,
            "Bind mounted"
        );
        self.mounts.push(MountRecord {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            mount_id,
        });

        Ok(())
    }

    /// Unmount the topmost mount at `target`
    ///
    /// Returns `false` when nothing was mounted there any more (for instance
    /// because the counterpart's unmount propagated here), which is not an
    /// error. A tracked record is only dropped when the removed mount is the
    /// one it tracks; an untracked mount stacked on top leaves it in place.
    ///
    /// # Errors
    /// Returns `Mount` for any other umount(2) failure
    pub fn unbind(&mut self, target: &Path) -> Result<bool> {
        let step = self.next_step();
        let record = self.mounts.iter().rposition(|m| m.target == target);
        let top = topmost_mount_id(target);

        match unmount(target) {
            Ok(()) => {
                match record {
                    Some(index) if self.mounts[index].is_topmost(top) => {
                        self.mounts.remove(index);
                        tracing::debug!(step, target = %target.display(), "Unmounted");
                    }
                    _ => {
                        tracing::debug!(
                            step,
                            target = %target.display(),
                            mount_id = ?top,
                            "Unmounted untracked mount"
                        );
                    }
                }
                Ok(true)
            }
            Err(Errno::EINVAL | Errno::ENOENT) => {
                if let Some(index) = record {
                    self.mounts.remove(index);
                }
                tracing::debug!(step, target = %target.display(), "Already unmounted");
                Ok(false)
            }
            Err(errno) => Err(mount_error(step, target, errno)),
        }
    }

    /// Change the propagation type of the mount at `path`
    ///
    /// # Errors
    /// Returns `Mount` if mount(2) fails
    pub fn set_propagation(
        &mut self,
        path: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> Result<()> {
        let step = self.next_step();
        change_propagation(path, propagation, recursive)
            .map_err(|errno| mount_error(step, path, errno))?;

        tracing::debug!(
            step,
            path = %path.display(),
            %propagation,
            recursive,
            "Propagation changed"
        );
        Ok(())
    }

    /// Unmount everything in strict reverse creation order
    ///
    /// Failures are logged and the walk continues; the first one is
    /// returned after every mount has been attempted.
    ///
    /// # Errors
    /// Returns the first unmount failure
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(record) = self.mounts.pop() {
            let step = self.next_step();
            match unmount(&record.target) {
                Ok(()) => {
                    tracing::debug!(
                        step,
                        source = %record.source.display(),
                        target = %record.target.display(),
                        "Teardown unmounted"
                    );
                }
                Err(Errno::EINVAL | Errno::ENOENT) => {
                    tracing::debug!(step, target = %record.target.display(), "Teardown: already gone");
                }
                Err(errno) => {
                    tracing::warn!(
                        step,
                        target = %record.target.display(),
                        error = %errno,
                        "Teardown failed to unmount"
                    );
                    first_error.get_or_insert_with(|| mount_error(step, &record.target, errno));
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Mounts under the work directory still present in the mount table
    ///
    /// # Errors
    /// Returns error if the mount table cannot be read
    pub fn leaked_mounts(&self) -> Result<Vec<MountEntry>> {
        let entries = mountinfo::read_mountinfo()?;
        Ok(mountinfo::mounts_under(&entries, &self.workdir)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Unmount anything left under the work directory, newest first
    ///
    /// Catches mounts the fixture never tracked, such as a counterpart's
    /// mount that propagated into this namespace. Returns how many mounts
    /// were removed.
    ///
    /// # Errors
    /// Returns `Mount` if a leftover mount cannot be removed
    pub fn sweep(&mut self) -> Result<usize> {
        let mut removed = 0;

        for entry in self.leaked_mounts()?.iter().rev() {
            let step = self.next_step();
            match unmount(&entry.mount_point) {
                Ok(()) => {
                    tracing::debug!(
                        step,
                        mount_id = entry.mount_id,
                        target = %entry.mount_point.display(),
                        "Swept untracked mount"
                    );
                    removed += 1;
                }
                Err(Errno::EINVAL | Errno::ENOENT) => {}
                Err(errno) => return Err(mount_error(step, &entry.mount_point, errno)),
            }
        }

        Ok(removed)
    }

    /// Create a marker file `dir/name` used as an existence probe
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be written
    pub fn write_marker(dir: &Path, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        fs::write(&path, name)?;
        Ok(path)
    }

    fn next_step(&mut self) -> usize {
        self.step += 1;
        self.step
    }
}

impl Drop for MountFixture {
    fn drop(&mut self) {
        if self.mounts.is_empty() {
            return;
        }

        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "Fixture teardown on drop failed");
        }
    }
}

/// ID of the topmost mount at `target`, `None` if it cannot be determined
fn topmost_mount_id(target: &Path) -> Option<u32> {
    let entries = mountinfo::read_mountinfo().ok()?;
    mountinfo::mount_at(&entries, target).map(|m| m.mount_id)
}

/// Bind-mount without touching any fixture state
///
/// Used by the child side of a case, which must not own fixture
/// bookkeeping.
///
/// # Errors
/// Returns the errno of mount(2)
pub fn bind_mount(source: &Path, target: &Path) -> std::result::Result<(), Errno> {
    mount(
        Some(source),
        target,
        Some("none"),
        MsFlags::MS_BIND,
        None::<&str>,
    )
}

/// Change propagation without touching any fixture state
///
/// # Errors
/// Returns the errno of mount(2)
pub fn change_propagation(
    path: &Path,
    propagation: Propagation,
    recursive: bool,
) -> std::result::Result<(), Errno> {
    let mut flags = propagation.ms_flag();
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some("none"), path, Some("none"), flags, None::<&str>)
}

/// Unmount without touching any fixture state
///
/// # Errors
/// Returns the errno of umount(2)
pub fn unmount(target: &Path) -> std::result::Result<(), Errno> {
    umount(target)
}

fn mount_error(step: usize, target: &Path, errno: Errno) -> Error {
    tracing::error!(step, target = %target.display(), error = %errno, "Mount step failed");
    if errno == Errno::EPERM {
        return Error::PermissionDenied {
            operation: format!("mount step {step} on {}", target.display()),
        };
    }
    Error::Mount {
        step,
        target: target.display().to_string(),
        errno,
    }
}
