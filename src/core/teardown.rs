//! SH-012: Teardown with fallback.
//!
//! ```text
//! NormalDestroy --ok--> Done
//! NormalDestroy --fail--> StateRecoveryAttempt   (recovery budget left)
//! NormalDestroy --fail--> ManualTagBasedCleanup  (budget spent)
//! StateRecoveryAttempt --ok--> NormalDestroy
//! StateRecoveryAttempt --fail--> ManualTagBasedCleanup
//! ManualTagBasedCleanup --> Done
//! ```
//!
//! Every path ends in `Done`: recovery is bounded by
//! `teardown.max_recovery_attempts` and cleanup never fails the machine.

use super::cleanup::{cleanup, CleanupOptions, CleanupReport};
use super::error::StackError;
use super::hygiene;
use super::keys::EphemeralKey;
use super::provision::engine_variables;
use super::retry::Sleeper;
use super::types::{Settings, WorkflowEvent};
use crate::console;
use crate::engine::{BackendConfig, ConvergenceEngine, Variables};
use crate::journal::Journal;
use crate::provider::CloudProvider;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    NormalDestroy,
    StateRecoveryAttempt,
    ManualTagBasedCleanup,
    Done,
}

impl fmt::Display for TeardownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NormalDestroy => "normal-destroy",
            Self::StateRecoveryAttempt => "state-recovery-attempt",
            Self::ManualTagBasedCleanup => "manual-tag-based-cleanup",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TeardownOptions {
    pub dry_run: bool,
    /// Start directly in tag-based cleanup
    pub skip_engine: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TeardownOutcome {
    pub transitions: Vec<(TeardownState, TeardownState)>,
    /// The engine's own destroy succeeded
    pub destroyed_by_engine: bool,
    pub recovery_attempts: u32,
    pub cleanup: Option<CleanupReport>,
    /// Errors that caused fallbacks, in order
    pub errors: Vec<String>,
    /// Addresses the engine tracks (dry run only)
    pub planned_addresses: Vec<String>,
}

impl TeardownOutcome {
    /// The engine destroyed everything, or cleanup left nothing behind.
    pub fn is_clean(&self) -> bool {
        self.destroyed_by_engine || self.cleanup.as_ref().is_some_and(|c| c.is_complete())
    }
}

struct Machine<'a> {
    settings: &'a Settings,
    engine: &'a dyn ConvergenceEngine,
    provider: &'a dyn CloudProvider,
    sleeper: &'a dyn Sleeper,
    journal: &'a Journal,
    options: TeardownOptions,
    vars: Variables,
    outcome: TeardownOutcome,
}

impl Machine<'_> {
    fn step(&mut self, state: TeardownState) -> TeardownState {
        match state {
            TeardownState::NormalDestroy => self.normal_destroy(),
            TeardownState::StateRecoveryAttempt => self.recover(),
            TeardownState::ManualTagBasedCleanup => self.tag_cleanup(),
            TeardownState::Done => TeardownState::Done,
        }
    }

    fn fail(&mut self, context: &str, e: &StackError) {
        console::fail(&format!("{}: {}", context, e));
        self.outcome.errors.push(format!("{}: {}", context, e));
    }

    fn normal_destroy(&mut self) -> TeardownState {
        console::info("running terraform destroy");
        let result = self
            .engine
            .init(&BackendConfig::from_settings(self.settings))
            .and_then(|_| self.engine.destroy(&self.vars));
        match result {
            Ok(()) => {
                console::ok("terraform destroy completed");
                self.outcome.destroyed_by_engine = true;
                TeardownState::Done
            }
            Err(e) => {
                self.fail("destroy failed", &e);
                if self.outcome.recovery_attempts < self.settings.teardown.max_recovery_attempts {
                    TeardownState::StateRecoveryAttempt
                } else {
                    TeardownState::ManualTagBasedCleanup
                }
            }
        }
    }

    fn recover(&mut self) -> TeardownState {
        self.outcome.recovery_attempts += 1;
        console::info(&format!(
            "state recovery attempt {}/{}",
            self.outcome.recovery_attempts, self.settings.teardown.max_recovery_attempts
        ));
        if self.settings.state_file.exists() {
            if let Err(e) = hygiene::backup_state(self.settings, self.journal) {
                console::warn(&format!("state backup failed: {}", e));
            }
        }
        let result = self
            .engine
            .init(&BackendConfig::from_settings(self.settings))
            .and_then(|_| self.engine.refresh(&self.vars));
        match result {
            Ok(()) => {
                console::ok("state refreshed; retrying destroy");
                TeardownState::NormalDestroy
            }
            Err(e) => {
                self.fail("state recovery failed", &e);
                TeardownState::ManualTagBasedCleanup
            }
        }
    }

    fn tag_cleanup(&mut self) -> TeardownState {
        let options = CleanupOptions {
            dry_run: self.options.dry_run,
        };
        match cleanup(self.settings, self.provider, self.sleeper, self.journal, options) {
            Ok(report) => self.outcome.cleanup = Some(report),
            Err(e) => self.fail("tag-based cleanup could not list resources", &e),
        }
        TeardownState::Done
    }
}

/// Drive the teardown machine to `Done`.
pub fn teardown(
    settings: &Settings,
    engine: &dyn ConvergenceEngine,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    journal: &Journal,
    options: TeardownOptions,
) -> TeardownOutcome {
    let mut outcome = TeardownOutcome::default();
    if options.dry_run && !options.skip_engine {
        match engine.state_list() {
            Ok(addresses) => {
                for a in &addresses {
                    console::info(&format!("terraform would destroy {}", a));
                }
                outcome.planned_addresses = addresses;
            }
            Err(e) => console::warn(&format!("cannot read engine state: {}", e)),
        }
    }

    // Destroy needs the same variable set as apply; the key value is irrelevant
    let key = if settings.ssh_key.enabled && !options.skip_engine && !options.dry_run {
        match EphemeralKey::generate(&format!("stackhand-{}", settings.project)) {
            Ok(k) => Some(k),
            Err(e) => {
                console::warn(&format!("no ephemeral key for destroy: {}", e));
                None
            }
        }
    } else {
        None
    };

    let mut machine = Machine {
        settings,
        engine,
        provider,
        sleeper,
        journal,
        options,
        vars: engine_variables(settings, key.as_ref()),
        outcome,
    };

    let mut state = if options.skip_engine || options.dry_run {
        TeardownState::ManualTagBasedCleanup
    } else {
        TeardownState::NormalDestroy
    };
    while state != TeardownState::Done {
        let next = machine.step(state);
        console::info(&format!("teardown: {} -> {}", state, next));
        journal.record(WorkflowEvent::TeardownTransition {
            from: state.to_string(),
            to: next.to_string(),
        });
        machine.outcome.transitions.push((state, next));
        state = next;
    }
    machine.outcome
}
