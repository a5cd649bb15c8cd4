//! Kernel-state probe
//!
//! Whether the engine is started is never read from disk. It is computed on
//! every invocation from what the kernel currently holds; any single engine
//! artifact is enough to count as started, so a half-applied start from a
//! crashed run is still stopped properly.

use std::fmt;

use serde::Serialize;

use crate::compiler::{RuleApplier, ENGINE_CHAINS};
use crate::kernel::Kernel;
use crate::routing::{FwMark, PolicyRouting};

/// Lifecycle state derived from [`RuntimeFacts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No engine artifact present
    Stopped,
    /// At least one engine artifact present
    Started,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Started => f.write_str("started"),
        }
    }
}

/// Observable engine artifacts in the live kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeFacts {
    /// Any engine chain, either table, either family
    pub chains: bool,
    /// The fwmark policy rule, either family
    pub policy_rule: bool,
    /// Routes in the dedicated table, either family
    pub table_routes: bool,
}

impl RuntimeFacts {
    /// Probe the kernel
    pub fn probe(kernel: &dyn Kernel, fwmark: FwMark) -> Self {
        let routing = PolicyRouting::new(kernel, fwmark);
        Self {
            chains: RuleApplier::new(kernel).present(&ENGINE_CHAINS),
            policy_rule: routing.rule_present(),
            table_routes: routing.routes_present(),
        }
    }

    /// Any artifact means started
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.chains || self.policy_rule || self.table_routes
    }

    /// State implied by the facts
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        if self.is_started() {
            LifecycleState::Started
        } else {
            LifecycleState::Stopped
        }
    }
}
