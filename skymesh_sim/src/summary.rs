//! Run summary: progress, degraded machines and diagnostic outcomes.

use serde::Serialize;
use skymesh_core::orchestrator::LinkFailure;
use skymesh_core::ApplyReport;
use skymesh_env::MachineId;

use crate::error::RunError;

/// A machine that did not acknowledge a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissedAck {
    pub step: usize,
    pub machine: MachineId,
    pub unreachable: bool,
    pub error: String,
}

/// A step that took longer than its interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overrun {
    pub step: usize,
    pub elapsed_ms: u64,
    pub budget_ms: u64,
}

/// A link operation that failed on some machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLinkFailure {
    pub step: usize,
    pub machine: MachineId,
    #[serde(flatten)]
    pub failure: LinkFailure,
}

/// A damage or recovery event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub step: usize,
    pub kind: &'static str,

    /// Satellites damaged or recovered
    pub nodes: usize,

    /// Machines the instruction did not reach
    pub failed_machines: Vec<MachineId>,
}

/// A finished diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub step: usize,
    pub kind: &'static str,

    /// Output file under the run directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything that happened during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Steps after the initial one
    pub steps: usize,

    /// Steps whose fan-out completed (acknowledged or not)
    pub completed_steps: usize,

    pub deleted: usize,
    pub updated: usize,
    pub added: usize,
    pub reshaped: usize,

    pub link_failures: Vec<StepLinkFailure>,
    pub missed_acks: Vec<MissedAck>,
    pub overruns: Vec<Overrun>,
    pub faults: Vec<FaultRecord>,
    pub diagnostics: Vec<DiagnosticRecord>,

    /// Events scheduled past the end of the run
    pub events_skipped: usize,

    pub wall_time_ms: u64,
}

impl RunSummary {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// True if every machine acknowledged every step without link failures.
    pub fn is_healthy(&self) -> bool {
        self.missed_acks.is_empty() && self.link_failures.is_empty()
    }

    /// Folds one machine's report into the totals.
    pub fn record_report(&mut self, step: usize, machine: MachineId, report: ApplyReport) {
        self.deleted += report.deleted;
        self.updated += report.updated;
        self.added += report.added;
        self.reshaped += report.reshaped;
        self.link_failures
            .extend(report.failures.into_iter().map(|failure| StepLinkFailure {
                step,
                machine,
                failure,
            }));
    }

    pub fn record_missed_ack(&mut self, step: usize, machine: MachineId, error: &RunError) {
        self.missed_acks.push(MissedAck {
            step,
            machine,
            unreachable: error.is_unreachable(),
            error: error.to_string(),
        });
    }

    /// Steps in which at least one machine missed its acknowledgement.
    pub fn degraded_steps(&self) -> Vec<usize> {
        let mut steps: Vec<usize> = self.missed_acks.iter().map(|m| m.step).collect();
        steps.dedup();
        steps
    }

    pub fn failed_diagnostics(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.error.is_some()).count()
    }
}
