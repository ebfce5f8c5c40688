//! Debounced single-slot plan mailbox

use std::time::Duration;

use tokio::time::Instant;

/// A pending request to recompute the cluster-wide assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReschedulePlan {
    /// Also ask other members to reschedule when the plan runs
    pub remote: bool,
    pub last_trigger: Instant,
}

impl ReschedulePlan {
    pub fn new(remote: bool) -> Self {
        Self {
            remote,
            last_trigger: Instant::now(),
        }
    }
}

/// What an offer did to the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEffect {
    Queued,
    /// A pending local plan became remote
    Upgraded,
    /// Only the trigger time of the pending plan changed
    Refreshed,
}

impl OfferEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Upgraded => "upgraded",
            Self::Refreshed => "refreshed",
        }
    }
}

/// Holds at most one plan. A remote offer replaces the pending plan; a local
/// offer only refreshes the trigger time of a pending plan, so an upgrade to
/// remote is never lost.
#[derive(Debug, Default)]
pub struct PlanMailbox {
    slot: Option<ReschedulePlan>,
}

impl PlanMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, remote: bool, now: Instant) -> OfferEffect {
        match self.slot.as_mut() {
            None => {
                self.slot = Some(ReschedulePlan {
                    remote,
                    last_trigger: now,
                });
                OfferEffect::Queued
            }
            Some(plan) if remote => {
                let upgraded = !plan.remote;
                *plan = ReschedulePlan {
                    remote: true,
                    last_trigger: now,
                };
                if upgraded {
                    OfferEffect::Upgraded
                } else {
                    OfferEffect::Refreshed
                }
            }
            Some(plan) => {
                plan.last_trigger = now;
                OfferEffect::Refreshed
            }
        }
    }

    /// Take the plan if `delay` has passed since its last trigger
    pub fn poll_eligible(&mut self, now: Instant, delay: Duration) -> Option<ReschedulePlan> {
        let plan = self.slot?;
        if now.saturating_duration_since(plan.last_trigger) >= delay {
            self.slot = None;
            Some(plan)
        } else {
            None
        }
    }

    pub fn peek(&self) -> Option<&ReschedulePlan> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
