//! Built-in propagation cases

use serde::{Deserialize, Serialize};
use std::path::Path;

use mountns_core::{CaseId, Error, Result, Side};
use mountns_namespace::{MountSpec, Propagation};

/// One propagation scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSpec {
    /// Case name
    pub name: CaseId,
    /// Propagation type under test
    pub propagation: Propagation,
    /// Side that mounts and unmounts
    pub initiator: Side,
    /// Whether the observer should see the actor's mount
    pub expect_visible: bool,
    /// One line description
    pub description: String,
}

impl CaseSpec {
    /// Create a case
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an invalid name
    pub fn new(
        name: &str,
        propagation: Propagation,
        initiator: Side,
        expect_visible: bool,
        description: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            name: CaseId::new(name)?,
            propagation,
            initiator,
            expect_visible,
            description: description.into(),
        })
    }

    /// Side that checks visibility
    #[must_use]
    pub const fn observer(&self) -> Side {
        self.initiator.peer()
    }

    /// Whether the case needs a cloned child
    #[must_use]
    pub const fn needs_child(&self) -> bool {
        !matches!(self.propagation, Propagation::Unbindable)
    }

    /// Parent-side layout for the given `A`/`B` directories
    ///
    /// `A` is bind-mounted onto itself so it can carry a propagation type.
    /// Slave cases start shared; the child demotes its copy to a slave.
    #[must_use]
    pub fn layout(&self, dir_a: &Path, dir_b: &Path) -> Vec<MountSpec> {
        let parent_type = match self.propagation {
            Propagation::Slave => Propagation::Shared,
            other => other,
        };

        vec![
            MountSpec::dir(dir_a).self_bind().propagation(parent_type),
            MountSpec::dir(dir_b),
        ]
    }
}

fn case(
    name: &str,
    propagation: Propagation,
    initiator: Side,
    expect_visible: bool,
    description: &str,
) -> Result<CaseSpec> {
    CaseSpec::new(name, propagation, initiator, expect_visible, description)
}

/// Every built-in case, in run order
///
/// # Errors
/// Never fails for the built-in names; the `Result` comes from name validation
pub fn builtin_cases() -> Result<Vec<CaseSpec>> {
    use Propagation::{Private, Shared, Slave, Unbindable};
    use Side::{Child, Parent};

    Ok(vec![
        case("shared-parent", Shared, Parent, true, "parent mount on shared A shows up in child")?,
        case("shared-child", Shared, Child, true, "child mount on shared A shows up in parent")?,
        case("private-parent", Private, Parent, false, "parent mount on private A stays in parent")?,
        case("private-child", Private, Child, false, "child mount on private A stays in child")?,
        case("slave-parent", Slave, Parent, true, "master mount reaches the slave copy in child")?,
        case("slave-child", Slave, Child, false, "slave mount in child does not reach master")?,
        case("unbindable", Unbindable, Parent, false, "unbindable A refuses to be bind-mounted")?,
    ])
}

/// Look up built-in cases by name, keeping the requested order
///
/// An empty selection returns every case.
///
/// # Errors
/// Returns `InvalidConfig` for an unknown name
pub fn select_cases(names: &[String]) -> Result<Vec<CaseSpec>> {
    let all = builtin_cases()?;
    if names.is_empty() {
        return Ok(all);
    }

    names
        .iter()
        .map(|name| {
            all.iter()
                .find(|c| c.name.as_str() == name)
                .cloned()
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("Unknown case: {name}"),
                })
        })
        .collect()
}
