use std::collections::HashMap;

/// One row streamed from the driving-dataset query, in
/// (participant, chronological visit) order. Continuous studies carry no
/// visit axis: `visit_row_id` is None and rows arrive in participant
/// order only.
#[derive(Debug, Clone)]
pub struct CohortObservation {
    pub participant_id: String,
    pub visit_row_id: Option<i64>,
    /// Label from the driving dataset column; None inherits the previous
    /// observation's cohort for the same participant.
    pub cohort_label: Option<String>,
    /// Cohort currently stored on this participant/visit row.
    pub stored_cohort_id: Option<i64>,
}

/// Cohort columns currently stored on a participant row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredCohorts {
    pub initial_cohort_id: Option<i64>,
    pub current_cohort_id: Option<i64>,
}

/// Update for a single participant/visit pair (advanced cohorts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerVisitCohortUpdate {
    pub cohort_id: Option<i64>,
    pub participant_id: String,
    pub visit_row_id: i64,
}

/// Uniform update of all of a participant's visit rows (simple cohorts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformCohortUpdate {
    pub cohort_id: Option<i64>,
    pub participant_id: String,
}

/// Update for a participant's initial/current cohort columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantCohortUpdate {
    pub initial_cohort_id: Option<i64>,
    pub current_cohort_id: Option<i64>,
    pub participant_id: String,
}

/// Participant/visit-level updates, shaped by the assignment mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantVisitUpdates {
    /// Advanced cohorts: each (participant, visit) pair may diverge.
    PerVisit(Vec<PerVisitCohortUpdate>),
    /// Simple cohorts: one cohort per participant across all visits.
    PerParticipant(Vec<UniformCohortUpdate>),
    /// Continuous studies: no visit axis to update.
    None,
}

impl ParticipantVisitUpdates {
    pub fn is_empty(&self) -> bool {
        match self {
            ParticipantVisitUpdates::PerVisit(v) => v.is_empty(),
            ParticipantVisitUpdates::PerParticipant(v) => v.is_empty(),
            ParticipantVisitUpdates::None => true,
        }
    }
}

/// The batched parameter sets produced by one reconciliation pass. Empty
/// sets mean the stored assignments already match the source data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortReassignment {
    pub participant_visit_updates: ParticipantVisitUpdates,
    pub participant_updates: Vec<ParticipantCohortUpdate>,
}

impl CohortReassignment {
    pub fn is_empty(&self) -> bool {
        self.participant_visit_updates.is_empty() && self.participant_updates.is_empty()
    }
}

#[derive(Debug, Default)]
struct TrackedParticipant {
    initial: Option<i64>,
    current: Option<i64>,
    // (visit_row_id, stored) buffered for the simple-mode uniform pass
    visit_rows: Vec<(Option<i64>, Option<i64>)>,
}

/// Reconcile streamed observations against stored assignments.
///
/// Tracks a running cohort per participant: an explicit label becomes
/// (and persists as) the running cohort, a missing label inherits it, and
/// the tracking resets at each participant boundary. The first explicit
/// assignment is the participant's initial cohort, the last one its
/// current cohort. Only rows whose stored value differs from the computed
/// one produce update parameters, so an unchanged source yields an empty
/// reassignment.
///
/// `observations` must arrive ordered by participant and, within a
/// participant, by chronological visit order.
pub fn reconcile_cohorts(
    observations: impl IntoIterator<Item = CohortObservation>,
    cohorts_by_label: &HashMap<String, i64>,
    stored_participants: &HashMap<String, StoredCohorts>,
    advanced: bool,
    has_visit_axis: bool,
) -> CohortReassignment {
    let mut order: Vec<String> = Vec::new();
    let mut tracked: HashMap<String, TrackedParticipant> = HashMap::new();

    let mut per_visit_updates: Vec<PerVisitCohortUpdate> = Vec::new();

    let mut active_participant: Option<String> = None;
    let mut running_cohort: Option<i64> = None;

    for obs in observations {
        if active_participant.as_deref() != Some(obs.participant_id.as_str()) {
            active_participant = Some(obs.participant_id.clone());
            running_cohort = None;
        }

        if let Some(label) = &obs.cohort_label {
            if let Some(&cohort_id) = cohorts_by_label.get(label) {
                running_cohort = Some(cohort_id);
            }
        }

        let entry = tracked.entry(obs.participant_id.clone()).or_insert_with(|| {
            order.push(obs.participant_id.clone());
            TrackedParticipant::default()
        });

        if entry.initial.is_none() {
            entry.initial = running_cohort;
        }
        entry.current = running_cohort;
        entry.visit_rows.push((obs.visit_row_id, obs.stored_cohort_id));

        if advanced && has_visit_axis {
            if let Some(visit_row_id) = obs.visit_row_id {
                if obs.stored_cohort_id != running_cohort {
                    per_visit_updates.push(PerVisitCohortUpdate {
                        cohort_id: running_cohort,
                        participant_id: obs.participant_id.clone(),
                        visit_row_id,
                    });
                }
            }
        }
    }

    let participant_visit_updates = if !has_visit_axis {
        ParticipantVisitUpdates::None
    } else if advanced {
        ParticipantVisitUpdates::PerVisit(per_visit_updates)
    } else {
        // Simple mode: every visit row carries the participant's final
        // cohort; one uniform update per participant that diverges.
        let mut uniform = Vec::new();
        for participant_id in &order {
            let entry = &tracked[participant_id];
            if entry
                .visit_rows
                .iter()
                .any(|(_, stored)| *stored != entry.current)
            {
                uniform.push(UniformCohortUpdate {
                    cohort_id: entry.current,
                    participant_id: participant_id.clone(),
                });
            }
        }
        ParticipantVisitUpdates::PerParticipant(uniform)
    };

    let mut participant_updates = Vec::new();
    for participant_id in &order {
        let entry = &tracked[participant_id];
        let initial = if advanced { entry.initial } else { entry.current };
        let computed = StoredCohorts {
            initial_cohort_id: initial,
            current_cohort_id: entry.current,
        };
        let stored = stored_participants
            .get(participant_id)
            .copied()
            .unwrap_or_default();
        if computed != stored {
            participant_updates.push(ParticipantCohortUpdate {
                initial_cohort_id: computed.initial_cohort_id,
                current_cohort_id: computed.current_cohort_id,
                participant_id: participant_id.clone(),
            });
        }
    }

    CohortReassignment {
        participant_visit_updates,
        participant_updates,
    }
}
