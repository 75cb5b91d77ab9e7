use serde::Serialize;

use crate::engine::{CatchallReason, Decision, Plan};
use crate::topic::Absorption;

/// Stats from one clustering pass over a CTM.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub headlines_loaded: u32,
    pub headlines_linked: u32,
    pub topics_created: u32,
    pub joins: u32,
    pub catchall_topics_created: u32,
    pub catchall_no_signals: u32,
    pub catchall_not_distinctive: u32,
    pub vetoes: u32,
    pub anchors_locked: u32,
    pub duplicates_skipped: u32,
}

impl PassStats {
    /// Count a plan that made it into the partition's state.
    pub fn record(&mut self, plan: &Plan) {
        self.headlines_linked += 1;
        if plan.verdict.veto.is_some() {
            self.vetoes += 1;
        }
        match plan.verdict.decision {
            Decision::Join { .. } => self.joins += 1,
            Decision::Seed => self.topics_created += 1,
            Decision::Catchall(reason) => {
                if plan.is_new_topic() {
                    self.catchall_topics_created += 1;
                }
                match reason {
                    CatchallReason::NoSignals => self.catchall_no_signals += 1,
                    CatchallReason::NotDistinctive => self.catchall_not_distinctive += 1,
                }
            }
        }
        if matches!(plan.absorption, Absorption::Locked { .. }) {
            self.anchors_locked += 1;
        }
    }

    pub fn catchall_total(&self) -> u32 {
        self.catchall_no_signals + self.catchall_not_distinctive
    }

    pub fn merge(&mut self, other: &PassStats) {
        self.headlines_loaded += other.headlines_loaded;
        self.headlines_linked += other.headlines_linked;
        self.topics_created += other.topics_created;
        self.joins += other.joins;
        self.catchall_topics_created += other.catchall_topics_created;
        self.catchall_no_signals += other.catchall_no_signals;
        self.catchall_not_distinctive += other.catchall_not_distinctive;
        self.vetoes += other.vetoes;
        self.anchors_locked += other.anchors_locked;
        self.duplicates_skipped += other.duplicates_skipped;
    }
}

impl std::fmt::Display for PassStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Clustering Pass Complete ===")?;
        writeln!(f, "Headlines loaded:   {}", self.headlines_loaded)?;
        writeln!(f, "Headlines linked:   {}", self.headlines_linked)?;
        writeln!(f, "Duplicates skipped: {}", self.duplicates_skipped)?;
        writeln!(f, "Topics created:     {}", self.topics_created)?;
        writeln!(f, "Joins:              {}", self.joins)?;
        writeln!(f, "Anchors locked:     {}", self.anchors_locked)?;
        writeln!(f, "Vetoes:             {}", self.vetoes)?;
        let total = self.headlines_linked.max(1);
        writeln!(f, "\nCatchall:")?;
        writeln!(
            f,
            "  Routed:          {} ({:.0}%)",
            self.catchall_total(),
            self.catchall_total() as f64 / total as f64 * 100.0
        )?;
        writeln!(f, "  No signals:      {}", self.catchall_no_signals)?;
        writeln!(f, "  Not distinctive: {}", self.catchall_not_distinctive)?;
        writeln!(f, "  Topics created:  {}", self.catchall_topics_created)?;
        Ok(())
    }
}
