use mage_synth::{RepairRequest, RepairService};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PRESENTATION_DELAY: Duration = Duration::from_millis(2_500);

/// Seam for the presentation pause so tests run without sleeping.
pub trait Delay {
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealState {
    Idle,
    Analyzing,
    Presenting,
    Applying,
}

/// Attempt budgets are keyed by the (error, program-snapshot) pair, so a
/// recurring error on unchanged code exhausts, while the same error text
/// against changed code gets a fresh budget. The snapshot is content-hashed
/// to keep the map bounded across long edit sessions.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HealKey {
    error: String,
    snapshot_hash: String,
}

impl HealKey {
    pub fn new(error: &str, program: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(program.as_bytes());
        Self {
            error: error.to_string(),
            snapshot_hash: format!("{:x}", hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// A healing cycle is already in flight; the new signal is dropped.
    Busy,
    /// The error key is already tracked (a prior cycle failed or exhausted
    /// on it); it will not retrigger until the program text changes.
    Suppressed,
    /// The attempt budget for this key is spent. Terminal until the program
    /// text changes.
    Exhausted { attempts: u32, notice: String },
    /// The repair service produced a fix; the caller owns applying it.
    Repaired {
        fixed_code: String,
        explanation: String,
    },
    /// The repair call failed (transport, malformed, or empty fix). The key
    /// stays tracked so the same error does not immediately loop.
    Failed { reason: String },
}

pub struct HealController<R: RepairService, D: Delay> {
    repair: R,
    delay: D,
    presentation_delay: Duration,
    max_attempts: u32,
    attempts: HashMap<HealKey, u32>,
    tracked: Option<HealKey>,
    state: HealState,
}

impl<R: RepairService> HealController<R, ThreadDelay> {
    pub fn new(repair: R) -> Self {
        Self::with_delay(repair, ThreadDelay)
    }
}

impl<R: RepairService, D: Delay> HealController<R, D> {
    pub fn with_delay(repair: R, delay: D) -> Self {
        Self {
            repair,
            delay,
            presentation_delay: DEFAULT_PRESENTATION_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempts: HashMap::new(),
            tracked: None,
            state: HealState::Idle,
        }
    }

    pub fn with_presentation_delay(mut self, delay: Duration) -> Self {
        self.presentation_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn state(&self) -> HealState {
        self.state
    }

    pub fn attempts_for(&self, error: &str, program: &str) -> u32 {
        self.attempts
            .get(&HealKey::new(error, program))
            .copied()
            .unwrap_or(0)
    }

    /// Runs one healing cycle for a runtime error against the current
    /// program snapshot. The controller never writes program text; it
    /// returns a proposed replacement for the single-writer caller to apply.
    pub fn handle(&mut self, error: &str, program: &str) -> HealOutcome {
        if self.state != HealState::Idle {
            return HealOutcome::Busy;
        }

        let key = HealKey::new(error, program);
        if self.tracked.as_ref() == Some(&key) {
            tracing::debug!("suppressing recurring error on unchanged program: {error:?}");
            return HealOutcome::Suppressed;
        }

        let spent = self.attempts.get(&key).copied().unwrap_or(0);
        if spent >= self.max_attempts {
            tracing::warn!("healing budget exhausted for {error:?} after {spent} attempts");
            self.tracked = Some(key);
            return HealOutcome::Exhausted {
                attempts: spent,
                notice: format!(
                    "automatic repair gave up after {spent} attempts on: {error}. Edit the program to try again."
                ),
            };
        }

        // Counted before the call so a crash mid-repair still spends budget.
        self.attempts.insert(key.clone(), spent + 1);
        self.tracked = Some(key);
        self.state = HealState::Analyzing;
        tracing::debug!("healing attempt {} for {error:?}", spent + 1);

        let outcome = self.repair.repair(&RepairRequest {
            error: error.to_string(),
            code: program.to_string(),
        });

        match outcome {
            Ok(repaired) if !repaired.fixed_code.trim().is_empty() => {
                // Hold the explanation long enough for any narration to play.
                self.state = HealState::Presenting;
                self.delay.pause(self.presentation_delay);

                self.state = HealState::Applying;
                self.tracked = None;
                self.state = HealState::Idle;
                HealOutcome::Repaired {
                    fixed_code: repaired.fixed_code,
                    explanation: repaired.explanation,
                }
            }
            Ok(_) => {
                self.state = HealState::Idle;
                HealOutcome::Failed {
                    reason: "repair service returned an empty fix".to_string(),
                }
            }
            Err(err) => {
                self.state = HealState::Idle;
                HealOutcome::Failed {
                    reason: format!("{err:#}"),
                }
            }
        }
    }

    #[cfg(test)]
    fn force_state(&mut self, state: HealState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_MAX_ATTEMPTS, Delay, HealController, HealKey, HealOutcome, HealState};
    use anyhow::{Result, anyhow};
    use mage_synth::{RepairOutcome, RepairRequest, RepairService};
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    struct StubRepair {
        fail: bool,
        fixed_code: String,
        calls: Cell<u32>,
    }

    impl StubRepair {
        fn succeeding(fixed_code: &str) -> Self {
            Self {
                fail: false,
                fixed_code: fixed_code.to_string(),
                calls: Cell::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                fixed_code: String::new(),
                calls: Cell::new(0),
            }
        }
    }

    impl RepairService for StubRepair {
        fn repair(&self, _req: &RepairRequest) -> Result<RepairOutcome> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(anyhow!("repair endpoint unreachable"));
            }
            Ok(RepairOutcome {
                fixed_code: self.fixed_code.clone(),
                explanation: "swapped the broken call".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingDelay {
        pauses: RefCell<Vec<Duration>>,
    }

    impl Delay for &RecordingDelay {
        fn pause(&self, duration: Duration) {
            self.pauses.borrow_mut().push(duration);
        }
    }

    fn controller(repair: StubRepair) -> HealController<StubRepair, NoDelay> {
        HealController::with_delay(repair, NoDelay)
    }

    struct NoDelay;

    impl Delay for NoDelay {
        fn pause(&self, _duration: Duration) {}
    }

    #[test]
    fn successful_cycle_returns_the_fix_and_clears_tracking() {
        let mut heal = controller(StubRepair::succeeding("fixed();"));
        let outcome = heal.handle("boom", "broken();");
        assert_eq!(
            outcome,
            HealOutcome::Repaired {
                fixed_code: "fixed();".to_string(),
                explanation: "swapped the broken call".to_string(),
            }
        );
        assert_eq!(heal.state(), HealState::Idle);

        // same key may heal again after a success
        let again = heal.handle("boom", "broken();");
        assert!(matches!(again, HealOutcome::Repaired { .. }));
    }

    #[test]
    fn budget_never_exceeds_three_for_one_key() {
        let mut heal = controller(StubRepair::succeeding("same();"));
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            assert!(matches!(
                heal.handle("boom", "same();"),
                HealOutcome::Repaired { .. }
            ));
        }

        let calls_before = heal.repair.calls.get();
        let outcome = heal.handle("boom", "same();");
        assert!(matches!(outcome, HealOutcome::Exhausted { attempts: 3, .. }));
        // exhaustion short-circuits: the repair service is not called
        assert_eq!(heal.repair.calls.get(), calls_before);
    }

    #[test]
    fn changed_snapshot_resets_the_budget() {
        let mut heal = controller(StubRepair::succeeding("same();"));
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            heal.handle("boom", "v1();");
        }
        assert!(matches!(
            heal.handle("boom", "v1();"),
            HealOutcome::Exhausted { .. }
        ));

        let fresh = heal.handle("boom", "v2();");
        assert!(matches!(fresh, HealOutcome::Repaired { .. }));
        assert_eq!(heal.attempts_for("boom", "v2();"), 1);
    }

    #[test]
    fn failed_repair_keeps_the_key_tracked() {
        let mut heal = controller(StubRepair::failing());
        let first = heal.handle("boom", "broken();");
        assert!(matches!(first, HealOutcome::Failed { .. }));

        let second = heal.handle("boom", "broken();");
        assert_eq!(second, HealOutcome::Suppressed);
        assert_eq!(heal.repair.calls.get(), 1);
    }

    #[test]
    fn distinct_error_is_not_suppressed() {
        let mut heal = controller(StubRepair::failing());
        assert!(matches!(
            heal.handle("boom", "broken();"),
            HealOutcome::Failed { .. }
        ));
        assert!(matches!(
            heal.handle("crash", "broken();"),
            HealOutcome::Failed { .. }
        ));
        assert_eq!(heal.repair.calls.get(), 2);
    }

    #[test]
    fn exhausted_key_stays_terminal_until_text_changes() {
        let mut heal = controller(StubRepair::succeeding("same();"));
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            heal.handle("boom", "same();");
        }
        assert!(matches!(
            heal.handle("boom", "same();"),
            HealOutcome::Exhausted { .. }
        ));
        // now tracked: the very same signal is suppressed outright
        assert_eq!(heal.handle("boom", "same();"), HealOutcome::Suppressed);
    }

    #[test]
    fn empty_fix_is_a_soft_failure() {
        let mut heal = controller(StubRepair::succeeding("   "));
        let outcome = heal.handle("boom", "broken();");
        assert_eq!(
            outcome,
            HealOutcome::Failed {
                reason: "repair service returned an empty fix".to_string(),
            }
        );
    }

    #[test]
    fn busy_controller_drops_new_signals() {
        let mut heal = controller(StubRepair::succeeding("fixed();"));
        heal.force_state(HealState::Presenting);
        assert_eq!(heal.handle("boom", "broken();"), HealOutcome::Busy);
        assert_eq!(heal.repair.calls.get(), 0);
    }

    #[test]
    fn presentation_delay_runs_only_on_success() {
        let delay = RecordingDelay::default();
        let mut heal = HealController::with_delay(StubRepair::succeeding("fixed();"), &delay)
            .with_presentation_delay(Duration::from_millis(75));
        heal.handle("boom", "broken();");
        assert_eq!(delay.pauses.borrow().as_slice(), &[Duration::from_millis(75)]);

        let delay = RecordingDelay::default();
        let mut heal = HealController::with_delay(StubRepair::failing(), &delay);
        heal.handle("boom", "broken();");
        assert!(delay.pauses.borrow().is_empty());
    }

    #[test]
    fn keys_separate_by_error_and_snapshot() {
        assert_eq!(HealKey::new("e", "p"), HealKey::new("e", "p"));
        assert_ne!(HealKey::new("e", "p1"), HealKey::new("e", "p2"));
        assert_ne!(HealKey::new("e1", "p"), HealKey::new("e2", "p"));
    }

    #[test]
    fn exhaustion_notice_is_actionable() {
        let mut heal = controller(StubRepair::succeeding("same();")).with_max_attempts(1);
        heal.handle("boom", "same();");
        let HealOutcome::Exhausted { notice, .. } = heal.handle("boom", "same();") else {
            panic!("expected exhaustion");
        };
        insta::assert_snapshot!(
            notice,
            @"automatic repair gave up after 1 attempts on: boom. Edit the program to try again."
        );
    }
}
