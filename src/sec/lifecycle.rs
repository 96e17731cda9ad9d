//! Investigation lifecycle: open → active → charged → trial → resolution.
//!
//! Transitions fire on elapsed ticks since the investigation opened; the
//! trial outcome is drawn from the deterministic per-tick stream. Fines and
//! sentences scale with accumulated evidence.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::EngineConfig;
use crate::models::{
    AgentInvestigationStatus, CrimeType, Investigation, InvestigationAlert, InvestigationStage,
};

/// Base fine per count of evidence, by crime severity.
fn base_fine(crime_type: CrimeType) -> f64 {
    match crime_type {
        CrimeType::InsiderTrading => 250_000.0,
        CrimeType::MarketManipulation => 500_000.0,
        CrimeType::AccountingFraud => 1_000_000.0,
        CrimeType::WashTrading => 100_000.0,
        CrimeType::Bribery => 150_000.0,
    }
}

/// One lifecycle advancement for a single investigation.
#[derive(Debug, Clone)]
pub struct StageTransition {
    pub investigation: Investigation,
    pub alert: InvestigationAlert,
    /// Agent-side status implied by the new stage, if it changes.
    pub agent_status: Option<AgentInvestigationStatus>,
    /// Set on conviction: (fine, sentence_years).
    pub conviction: Option<(f64, f64)>,
    /// Set on settlement: fine paid without prison.
    pub settlement_fine: Option<f64>,
    /// Acquittal or settlement restores the agent to active.
    pub restores_agent: bool,
}

pub struct SecLifecycle {
    pub activate_ticks: i64,
    pub charge_ticks: i64,
    pub trial_ticks: i64,
    pub resolve_ticks: i64,
    pub conviction_prob: f64,
    pub settle_prob: f64,
}

impl SecLifecycle {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            activate_ticks: config.sec_activate_ticks,
            charge_ticks: config.sec_charge_ticks,
            trial_ticks: config.sec_trial_ticks,
            resolve_ticks: config.sec_resolve_ticks,
            conviction_prob: config.sec_conviction_prob,
            settle_prob: config.sec_settle_prob,
        }
    }

    fn alert_message(stage: InvestigationStage, crime: CrimeType) -> String {
        let crime = crime.as_str().replace('_', " ");
        match stage {
            InvestigationStage::Open => format!("An inquiry into suspected {crime} has been opened"),
            InvestigationStage::Active => {
                format!("The {crime} inquiry has escalated to a formal investigation")
            }
            InvestigationStage::Charged => format!("Formal {crime} charges have been filed"),
            InvestigationStage::Trial => format!("The {crime} case has gone to trial"),
            InvestigationStage::Convicted => format!("Conviction entered on {crime} charges"),
            InvestigationStage::Acquitted => format!("Acquitted of all {crime} charges"),
            InvestigationStage::Settled => format!("The {crime} case was settled out of court"),
        }
    }

    fn build_alert(inv: &Investigation, tick: i64) -> InvestigationAlert {
        InvestigationAlert {
            investigation_id: inv.id.clone(),
            agent_id: inv.agent_id.clone(),
            crime_type: inv.crime_type,
            stage: inv.stage,
            message: Self::alert_message(inv.stage, inv.crime_type),
            tick,
        }
    }

    /// Alert for a freshly opened investigation (the open "transition").
    pub fn opening_alert(inv: &Investigation, tick: i64) -> InvestigationAlert {
        Self::build_alert(inv, tick)
    }

    /// Advance one unresolved investigation if its threshold has elapsed.
    /// Returns None when nothing fires this tick.
    pub fn advance(
        &self,
        inv: &Investigation,
        tick: i64,
        rng: &mut ChaCha8Rng,
    ) -> Option<StageTransition> {
        let elapsed = tick - inv.tick_opened;
        let mut next = inv.clone();

        let (agent_status, conviction, settlement_fine, restores_agent) = match inv.stage {
            InvestigationStage::Open if elapsed >= self.activate_ticks => {
                next.stage = InvestigationStage::Active;
                next.tick_activated = Some(tick);
                (Some(AgentInvestigationStatus::UnderInvestigation), None, None, false)
            }
            InvestigationStage::Active if elapsed >= self.charge_ticks => {
                next.stage = InvestigationStage::Charged;
                next.tick_charged = Some(tick);
                (Some(AgentInvestigationStatus::Charged), None, None, false)
            }
            InvestigationStage::Charged if elapsed >= self.trial_ticks => {
                next.stage = InvestigationStage::Trial;
                next.tick_trial = Some(tick);
                (None, None, None, false)
            }
            InvestigationStage::Trial if elapsed >= self.resolve_ticks => {
                let roll: f64 = rng.gen();
                if roll < self.conviction_prob {
                    next.stage = InvestigationStage::Convicted;
                    next.tick_resolved = Some(tick);
                    let severity = 1.0 + (inv.evidence_count.min(10) - 1) as f64 * 0.5;
                    let fine = base_fine(inv.crime_type) * severity;
                    let sentence_years =
                        (1.0 + rng.gen_range(0.0..4.0)) * severity.min(3.0);
                    next.fine = fine;
                    next.sentence_years = sentence_years;
                    (
                        Some(AgentInvestigationStatus::Convicted),
                        Some((fine, sentence_years)),
                        None,
                        false,
                    )
                } else if roll < self.conviction_prob + self.settle_prob {
                    next.stage = InvestigationStage::Settled;
                    next.tick_resolved = Some(tick);
                    let fine = base_fine(inv.crime_type) * 0.5;
                    next.fine = fine;
                    (Some(AgentInvestigationStatus::None), None, Some(fine), true)
                } else {
                    next.stage = InvestigationStage::Acquitted;
                    next.tick_resolved = Some(tick);
                    (Some(AgentInvestigationStatus::Acquitted), None, None, true)
                }
            }
            _ => return None,
        };

        debug_assert!(inv.stage.can_transition_to(next.stage));
        let alert = Self::build_alert(&next, tick);
        Some(StageTransition {
            investigation: next,
            alert,
            agent_status,
            conviction,
            settlement_fine,
            restores_agent,
        })
    }
}
