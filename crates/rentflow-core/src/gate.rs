use crate::config::GateConfig;
use crate::types::{ObligationState, PaymentObligation};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Payer trust derived from terminal obligations inside the lookback window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReliabilityProfile {
    pub payer_id: String,
    pub settled: u32,
    pub attempted: u32,
    pub window_days: i64,
}

impl ReliabilityProfile {
    /// Only `settled` and `failed` rows count as attempts; in-flight rows are
    /// not yet evidence either way.
    pub fn from_history(payer_id: &str, history: &[PaymentObligation], window_days: i64) -> Self {
        let mut settled = 0_u32;
        let mut attempted = 0_u32;
        for obligation in history.iter().filter(|o| o.payer_id == payer_id) {
            match obligation.state {
                ObligationState::Settled => {
                    settled += 1;
                    attempted += 1;
                }
                ObligationState::Failed => attempted += 1,
                _ => {}
            }
        }
        Self {
            payer_id: payer_id.to_string(),
            settled,
            attempted,
            window_days,
        }
    }

    /// `None` when the payer has no terminal history.
    pub fn reliability(&self) -> Option<f64> {
        (self.attempted > 0).then(|| f64::from(self.settled) / f64::from(self.attempted))
    }
}

/// Auditable autonomous-settlement decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateDecision {
    pub obligation_id: String,
    pub payer_id: String,
    pub approve: bool,
    /// 0..=100
    pub confidence: u8,
    pub reasoning: Vec<String>,
    pub reliability: Option<f64>,
    pub sample_size: u32,
    pub threshold: f64,
    pub decided_at: DateTime<Utc>,
}

/// Deterministic eligibility policy for settling without a human present.
///
/// The same obligation and profile always yield the same decision.
#[derive(Debug, Clone)]
pub struct AutonomousDecisionGate {
    config: GateConfig,
}

impl AutonomousDecisionGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Start of the history window relative to `now`.
    pub fn history_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.history_window_days)
    }

    pub fn authorize(
        &self,
        obligation: &PaymentObligation,
        profile: &ReliabilityProfile,
    ) -> GateDecision {
        let mut reasons = Vec::new();
        let threshold = self.config.reliability_threshold;
        let reliability = profile.reliability();

        let (mut approve, mut confidence) = match reliability {
            None => {
                reasons.push(format!(
                    "no settled or failed payments in the last {} days; approving with moderate confidence",
                    profile.window_days
                ));
                (true, self.config.no_history_confidence)
            }
            Some(score) if score >= threshold => {
                reasons.push(format!(
                    "reliability {:.2} ({}/{}) meets threshold {:.2}",
                    score, profile.settled, profile.attempted, threshold
                ));
                (true, to_percent(score))
            }
            Some(score) => {
                reasons.push(format!(
                    "reliability {:.2} ({}/{}) below threshold {:.2}",
                    score, profile.settled, profile.attempted, threshold
                ));
                (false, to_percent(1.0 - score))
            }
        };

        if obligation.amount_minor <= 0 {
            approve = false;
            confidence = 100;
            reasons.push("non-positive amount cannot be settled".to_string());
        } else if let Some(cap) = self.config.autonomous_max_amount_minor {
            if obligation.amount_minor.unsigned_abs() > cap {
                approve = false;
                confidence = 100;
                reasons.push(format!(
                    "amount {} exceeds autonomous cap {}",
                    obligation.amount_minor, cap
                ));
            }
        }

        GateDecision {
            obligation_id: obligation.obligation_id.clone(),
            payer_id: obligation.payer_id.clone(),
            approve,
            confidence,
            reasoning: reasons,
            reliability,
            sample_size: profile.attempted,
            threshold,
            decided_at: Utc::now(),
        }
    }
}

fn to_percent(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{obligation, ObligationSeed};
    use crate::types::ObligationKind;

    fn history(settled: usize, failed: usize) -> Vec<PaymentObligation> {
        let mut rows = Vec::new();
        for i in 0..settled + failed {
            let mut row = obligation(ObligationSeed::new(
                &format!("lease-h{i}"),
                ObligationKind::FirstPeriodRent,
            ));
            row.state = if i < settled {
                ObligationState::Settled
            } else {
                ObligationState::Failed
            };
            rows.push(row);
        }
        rows
    }

    fn target() -> PaymentObligation {
        obligation(ObligationSeed::new("lease-new", ObligationKind::Deposit))
    }

    #[test]
    fn no_history_approves_with_moderate_confidence() {
        let gate = AutonomousDecisionGate::new(GateConfig::default());
        let profile = ReliabilityProfile::from_history("tenant-1", &[], 180);
        let decision = gate.authorize(&target(), &profile);

        assert!(decision.approve);
        assert_eq!(decision.confidence, 60);
        assert!(decision.confidence < 100);
        assert!(decision.reliability.is_none());
        assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn reliability_below_threshold_rejects() {
        let gate = AutonomousDecisionGate::new(GateConfig::default());
        let profile = ReliabilityProfile::from_history("tenant-1", &history(3, 2), 180);
        let decision = gate.authorize(&target(), &profile);

        assert!(!decision.approve);
        assert_eq!(decision.reliability, Some(0.6));
        assert_eq!(decision.sample_size, 5);
    }

    #[test]
    fn reliability_at_threshold_approves() {
        let gate = AutonomousDecisionGate::new(GateConfig::default());
        let profile = ReliabilityProfile::from_history("tenant-1", &history(4, 1), 180);
        let decision = gate.authorize(&target(), &profile);

        assert!(decision.approve);
        assert_eq!(decision.confidence, 80);
    }

    #[test]
    fn in_flight_rows_are_not_attempts() {
        let mut rows = history(1, 0);
        let mut in_flight = obligation(ObligationSeed::new("lease-x", ObligationKind::Deposit));
        in_flight.state = ObligationState::Submitted;
        rows.push(in_flight);

        let profile = ReliabilityProfile::from_history("tenant-1", &rows, 180);
        assert_eq!(profile.attempted, 1);
        assert_eq!(profile.reliability(), Some(1.0));
    }

    #[test]
    fn autonomous_cap_declines_large_amounts() {
        let gate = AutonomousDecisionGate::new(GateConfig {
            autonomous_max_amount_minor: Some(1_000),
            ..GateConfig::default()
        });
        let profile = ReliabilityProfile::from_history("tenant-1", &history(10, 0), 180);
        let decision = gate.authorize(&target(), &profile);

        assert!(!decision.approve);
        assert!(decision.reasoning.iter().any(|r| r.contains("autonomous cap")));
    }

    #[test]
    fn configured_threshold_is_honored() {
        let gate = AutonomousDecisionGate::new(GateConfig {
            reliability_threshold: 0.5,
            ..GateConfig::default()
        });
        let profile = ReliabilityProfile::from_history("tenant-1", &history(3, 2), 180);
        assert!(gate.authorize(&target(), &profile).approve);
    }
}
