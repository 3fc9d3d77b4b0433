//! Capacity gate audit: compares the gate against the occupancy counter.

/// One reading of the gate and the value the occupancy counter implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateAudit {
    pub observed: i32,
    pub expected: i32,
}

impl GateAudit {
    /// Positive when permits are missing from the gate.
    #[must_use]
    pub const fn drift(&self) -> i32 {
        self.expected - self.observed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Balanced,
    /// The gate holds fewer permits than free places. `correct` is set when
    /// the guardrail should reset the gate now.
    MissingPermits { drift: i32, correct: bool },
    /// The gate holds more permits than free places. Never corrected.
    ExcessPermits { drift: i32 },
}

/// Tracks drift between audits.
///
/// With the guardrail on, a correction is only ordered after the same
/// positive drift shows up on two consecutive audits. A single reading can
/// catch a unit between taking its permits and updating the counter.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    guardrail: bool,
    last_positive: Option<i32>,
}

impl Reconciler {
    #[must_use]
    pub fn new(guardrail: bool) -> Self {
        Self {
            guardrail,
            last_positive: None,
        }
    }

    #[must_use]
    pub fn guardrail(&self) -> bool {
        self.guardrail
    }

    pub fn assess(&mut self, audit: GateAudit) -> AuditOutcome {
        let drift = audit.drift();
        if drift > 0 {
            let repeated = self.last_positive == Some(drift);
            let correct = self.guardrail && repeated;
            self.last_positive = if correct { None } else { Some(drift) };
            AuditOutcome::MissingPermits { drift, correct }
        } else {
            self.last_positive = None;
            if drift < 0 {
                AuditOutcome::ExcessPermits { drift }
            } else {
                AuditOutcome::Balanced
            }
        }
    }
}
