use anyhow::Result;
use memory_engine_schemas::{
    AliasProposal, AssignmentSource, CategoryDecision, MemoryCategory, RelatedLinkProposal,
    RunStatus,
};
use tracing::{debug, info, warn};

use crate::database::Database;

const DEFAULT_RELATION_TYPE: &str = "related";

/// Applies secondary-pass decisions on top of extraction output.
///
/// The organizer and consolidator only ever add rows under their own
/// assignment source or into the alias table; extractor-owned fields are
/// never rewritten here.
pub struct MemoryOrganizer;

#[derive(Debug, Clone, Copy, Default)]
pub struct OrganizerOutcome {
    pub assignments_applied: usize,
    pub links_applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AliasOutcome {
    pub proposals_applied: usize,
    pub rejected: usize,
}

impl Default for MemoryOrganizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrganizer {
    pub fn new() -> Self {
        Self
    }

    /// Apply category reassignments and related-link proposals from an
    /// organizer pass, scoped to the given assignment source.
    pub fn apply_decisions(
        &self,
        db: &Database,
        decisions: &[CategoryDecision],
        links: &[RelatedLinkProposal],
        assignment_source: AssignmentSource,
    ) -> Result<OrganizerOutcome> {
        let run_id = db.begin_job_run("organizer")?;

        let result = self.apply_decisions_inner(db, decisions, links, assignment_source);

        match &result {
            Ok(outcome) => {
                db.finish_job_run(
                    &run_id,
                    RunStatus::Success,
                    (outcome.assignments_applied + outcome.links_applied) as u32,
                    None,
                )?;
            }
            Err(e) => {
                db.finish_job_run(&run_id, RunStatus::Failed, 0, Some(&e.to_string()))?;
            }
        }

        result
    }

    fn apply_decisions_inner(
        &self,
        db: &Database,
        decisions: &[CategoryDecision],
        links: &[RelatedLinkProposal],
        assignment_source: AssignmentSource,
    ) -> Result<OrganizerOutcome> {
        let mut outcome = OrganizerOutcome::default();

        for decision in decisions {
            if db.get_memory(&decision.memory_id.0)?.is_none() {
                debug!(
                    "Skipping category decision for unknown memory {}",
                    decision.memory_id
                );
                outcome.skipped += 1;
                continue;
            }

            let category_id = MemoryCategory::from_kind(&decision.bucket).category_id();
            db.replace_category_assignments(
                &decision.memory_id.0,
                &[category_id],
                assignment_source,
            )?;
            outcome.assignments_applied += 1;
        }

        for link in links {
            if link.memory_id == link.related_memory_id {
                debug!("Skipping self-link for memory {}", link.memory_id);
                outcome.skipped += 1;
                continue;
            }

            let relation_type = link
                .relation_type
                .as_deref()
                .unwrap_or(DEFAULT_RELATION_TYPE);

            // Symmetric relation: both directions share confidence/reason.
            db.upsert_related_link(
                &link.memory_id.0,
                &link.related_memory_id.0,
                relation_type,
                link.confidence,
                link.reason.as_deref(),
            )?;
            db.upsert_related_link(
                &link.related_memory_id.0,
                &link.memory_id.0,
                relation_type,
                link.confidence,
                link.reason.as_deref(),
            )?;
            outcome.links_applied += 1;
        }

        info!(
            "Organizer pass applied {} assignments, {} links ({} skipped)",
            outcome.assignments_applied, outcome.links_applied, outcome.skipped
        );
        Ok(outcome)
    }

    /// Record consolidator duplicate-source proposals as review-first alias
    /// rows. Nothing here merges or deletes memory data; an alias stays
    /// inactive until explicitly promoted.
    pub fn apply_alias_proposals(
        &self,
        db: &Database,
        proposals: &[AliasProposal],
        proposal_source: &str,
        default_is_active: bool,
    ) -> Result<AliasOutcome> {
        let run_id = db.begin_job_run("consolidator")?;

        let result =
            self.apply_alias_proposals_inner(db, proposals, proposal_source, default_is_active);

        match &result {
            Ok(outcome) => {
                db.finish_job_run(
                    &run_id,
                    RunStatus::Success,
                    outcome.proposals_applied as u32,
                    None,
                )?;
            }
            Err(e) => {
                db.finish_job_run(&run_id, RunStatus::Failed, 0, Some(&e.to_string()))?;
            }
        }

        result
    }

    fn apply_alias_proposals_inner(
        &self,
        db: &Database,
        proposals: &[AliasProposal],
        proposal_source: &str,
        default_is_active: bool,
    ) -> Result<AliasOutcome> {
        let mut outcome = AliasOutcome::default();

        for proposal in proposals {
            let alias_source = db.source_id_for_memory(&proposal.duplicate_memory_id.0)?;
            let canonical_source = db.source_id_for_memory(&proposal.memory_id.0)?;

            let (alias_source, canonical_source) = match (alias_source, canonical_source) {
                (Some(a), Some(c)) => (a, c),
                _ => {
                    warn!(
                        "Alias proposal references unknown memories: {} / {}",
                        proposal.duplicate_memory_id, proposal.memory_id
                    );
                    outcome.rejected += 1;
                    continue;
                }
            };

            if alias_source == canonical_source {
                debug!("Skipping self-alias for source {}", alias_source);
                outcome.rejected += 1;
                continue;
            }

            let is_active = proposal.is_active || default_is_active;
            db.upsert_source_alias(
                &alias_source,
                &canonical_source,
                proposal.confidence,
                proposal.reason.as_deref(),
                proposal_source,
                is_active,
            )?;
            outcome.proposals_applied += 1;
        }

        info!(
            "Consolidator pass recorded {} alias proposals ({} rejected)",
            outcome.proposals_applied, outcome.rejected
        );
        Ok(outcome)
    }
}
