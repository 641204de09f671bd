//! The coordinator: the authoritative owner of the global model.
//!
//! The [`Coordinator`] holds the [`GlobalState`] and the cohort registry, which maps every
//! participant to its private sample count `n_c`. The total sample count `N = Σ n_c` is fixed
//! when the coordinator is initialized. Aggregating a round computes `Σ (n_c / N) * params_c`;
//! the only way to change the global state is [`Coordinator::commit()`].

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    common::ParticipantId,
    message::RoundMessage,
    model::{ParameterSet, ShapeMismatch},
};

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors which can occur when initializing a [`Coordinator`].
pub enum CoordinatorError {
    #[error("the cohort is empty")]
    EmptyCohort,
    #[error("the participants hold no samples")]
    NoSamples,
    #[error("participant {0} is registered more than once")]
    DuplicateParticipant(ParticipantId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors which can occur when aggregating the local updates of a round.
pub enum AggregationError {
    #[error("incomplete cohort: {received} of {expected} updates received, missing {missing:?}")]
    IncompleteCohort {
        expected: usize,
        received: usize,
        missing: Vec<ParticipantId>,
    },
    #[error("update of participant {participant} doesn't match the global model: {source}")]
    ParticipantMismatch {
        participant: ParticipantId,
        source: ShapeMismatch,
    },
    #[error("participant {0} is not part of the cohort")]
    UnknownParticipant(ParticipantId),
    #[error("participant {0} sent more than one update")]
    DuplicateUpdate(ParticipantId),
    #[error("participant {participant} sent an update for round {found} during round {expected}")]
    RoundMismatch {
        participant: ParticipantId,
        expected: u64,
        found: u64,
    },
    #[error("participant {participant} reported {reported} samples instead of {registered}")]
    SampleCountMismatch {
        participant: ParticipantId,
        registered: u64,
        reported: u64,
    },
}

impl AggregationError {
    /// The participant at fault, if there is a single one.
    pub fn participant(&self) -> Option<ParticipantId> {
        match self {
            AggregationError::IncompleteCohort { missing, .. } => missing.first().copied(),
            AggregationError::ParticipantMismatch { participant, .. }
            | AggregationError::RoundMismatch { participant, .. }
            | AggregationError::SampleCountMismatch { participant, .. } => Some(*participant),
            AggregationError::UnknownParticipant(participant)
            | AggregationError::DuplicateUpdate(participant) => Some(*participant),
        }
    }
}

/// The state owned by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalState {
    /// The committed global parameters.
    pub params: ParameterSet,
    /// The number of committed rounds.
    pub round: u64,
    /// The total number of samples of the cohort, `N = Σ n_c`.
    pub total_samples: u64,
}

/// The authoritative holder of the global model.
#[derive(Debug, Clone)]
pub struct Coordinator {
    state: GlobalState,
    cohort: BTreeMap<ParticipantId, u64>,
}

impl Coordinator {
    /// Initializes the global state with the initial parameters and the sample count of every
    /// participant of the cohort.
    ///
    /// # Errors
    /// Fails if the cohort is empty, lists a participant twice or holds no samples at all.
    pub fn initialize<I>(initial: ParameterSet, sample_counts: I) -> Result<Self, CoordinatorError>
    where
        I: IntoIterator<Item = (ParticipantId, u64)>,
    {
        let mut cohort = BTreeMap::new();
        for (participant, sample_count) in sample_counts {
            if cohort.insert(participant, sample_count).is_some() {
                return Err(CoordinatorError::DuplicateParticipant(participant));
            }
        }
        if cohort.is_empty() {
            return Err(CoordinatorError::EmptyCohort);
        }
        let total_samples = cohort.values().sum();
        if total_samples == 0 {
            return Err(CoordinatorError::NoSamples);
        }
        info!(
            "initialized coordinator with {} participants holding {} samples",
            cohort.len(),
            total_samples
        );

        Ok(Self {
            state: GlobalState {
                params: initial,
                round: 0,
                total_samples,
            },
            cohort,
        })
    }

    /// Returns a copy of the global parameters for broadcasting.
    pub fn distribute(&self) -> ParameterSet {
        self.state.params.clone()
    }

    /// Computes the weighted average of the local updates of the current round.
    ///
    /// The updates are summed in ascending participant order, whatever order they arrived in.
    /// The global state is not modified.
    pub fn aggregate(&self, updates: &[RoundMessage]) -> Result<ParameterSet, AggregationError> {
        let mut by_sender = BTreeMap::new();
        for update in updates {
            let registered = *self
                .cohort
                .get(&update.sender)
                .ok_or(AggregationError::UnknownParticipant(update.sender))?;
            if update.round != self.state.round {
                return Err(AggregationError::RoundMismatch {
                    participant: update.sender,
                    expected: self.state.round,
                    found: update.round,
                });
            }
            if update.sample_count != registered {
                return Err(AggregationError::SampleCountMismatch {
                    participant: update.sender,
                    registered,
                    reported: update.sample_count,
                });
            }
            self.state
                .params
                .check_compatible(&update.params)
                .map_err(|source| AggregationError::ParticipantMismatch {
                    participant: update.sender,
                    source,
                })?;
            if by_sender.insert(update.sender, update).is_some() {
                return Err(AggregationError::DuplicateUpdate(update.sender));
            }
        }

        if by_sender.len() < self.cohort.len() {
            let received: BTreeSet<_> = by_sender.keys().collect();
            let missing = self
                .cohort
                .keys()
                .filter(|id| !received.contains(id))
                .copied()
                .collect();
            return Err(AggregationError::IncompleteCohort {
                expected: self.cohort.len(),
                received: by_sender.len(),
                missing,
            });
        }

        let mut global = self.state.params.zeros_like();
        for (sender, update) in by_sender {
            let weight = self.weight(sender).unwrap_or_default();
            debug!("adding update of participant {} with weight {}", sender, weight);
            // compatibility has been checked above
            global
                .scaled_add(weight, &update.params)
                .map_err(|source| AggregationError::ParticipantMismatch {
                    participant: sender,
                    source,
                })?;
        }
        Ok(global)
    }

    /// Installs new global parameters and moves on to the next round.
    ///
    /// # Errors
    /// Fails if the parameters don't describe the global model, in which case nothing changes.
    pub fn commit(&mut self, params: ParameterSet) -> Result<(), ShapeMismatch> {
        self.state.params.check_compatible(&params)?;
        self.state.params = params;
        self.state.round += 1;
        info!("committed global model of round {}", self.state.round - 1);
        Ok(())
    }

    /// The committed global parameters.
    pub fn global(&self) -> &ParameterSet {
        &self.state.params
    }

    /// The number of committed rounds.
    pub fn round(&self) -> u64 {
        self.state.round
    }

    /// The total number of samples `N`.
    pub fn total_samples(&self) -> u64 {
        self.state.total_samples
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn into_state(self) -> GlobalState {
        self.state
    }

    /// The participants of the cohort, in ascending order.
    pub fn cohort(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.cohort.keys().copied()
    }

    /// The number of participants of the cohort.
    pub fn cohort_size(&self) -> usize {
        self.cohort.len()
    }

    /// The sample count `n_c` of a participant.
    pub fn sample_count(&self, participant: ParticipantId) -> Option<u64> {
        self.cohort.get(&participant).copied()
    }

    /// The aggregation weight `n_c / N` of a participant.
    pub fn weight(&self, participant: ParticipantId) -> Option<f64> {
        self.sample_count(participant)
            .map(|n_c| n_c as f64 / self.state.total_samples as f64)
    }
}

#[cfg(test)]
mod tests {
    use rand::{seq::SliceRandom, thread_rng};

    use super::*;
    use crate::model::tests::{dense, vector};

    fn id(id: u64) -> ParticipantId {
        ParticipantId::new(id)
    }

    fn update(sender: u64, round: u64, sample_count: u64, params: ParameterSet) -> RoundMessage {
        RoundMessage {
            sender: id(sender),
            round,
            sample_count,
            params,
        }
    }

    #[test]
    fn test_initialize_empty_cohort() {
        assert_eq!(
            Coordinator::initialize(vector(&[0.0]), Vec::new()).unwrap_err(),
            CoordinatorError::EmptyCohort
        );
    }

    #[test]
    fn test_initialize_without_samples() {
        assert_eq!(
            Coordinator::initialize(vector(&[0.0]), vec![(id(1), 0), (id(2), 0)]).unwrap_err(),
            CoordinatorError::NoSamples
        );
    }

    #[test]
    fn test_initialize_rejects_duplicate_participants() {
        assert_eq!(
            Coordinator::initialize(vector(&[0.0]), vec![(id(1), 10), (id(2), 5), (id(1), 20)])
                .unwrap_err(),
            CoordinatorError::DuplicateParticipant(id(1))
        );
    }

    #[test]
    fn test_weights_sum_to_one() {
        let counts = vec![(id(1), 3), (id(2), 17), (id(3), 1), (id(4), 79), (id(5), 1000)];
        let coordinator = Coordinator::initialize(vector(&[0.0]), counts).unwrap();
        assert_eq!(coordinator.total_samples(), 1100);
        let sum: f64 = coordinator
            .cohort()
            .map(|p| coordinator.weight(p).unwrap())
            .sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_distribute_is_idempotent() {
        let coordinator =
            Coordinator::initialize(dense(0.5, 1.5), vec![(id(1), 1), (id(2), 1)]).unwrap();
        let first = coordinator.distribute();
        let second = coordinator.distribute();
        assert_eq!(first, second);
        assert_eq!(first, dense(0.5, 1.5));
        assert_eq!(coordinator.round(), 0);
    }

    #[test]
    fn test_aggregate_equal_weights() {
        let coordinator =
            Coordinator::initialize(vector(&[0.0]), vec![(id(1), 1), (id(2), 1)]).unwrap();
        let updates = vec![
            update(1, 0, 1, vector(&[2.0])),
            update(2, 0, 1, vector(&[4.0])),
        ];
        assert_eq!(coordinator.aggregate(&updates).unwrap(), vector(&[3.0]));
    }

    #[test]
    fn test_aggregate_single_participant_is_exact() {
        let coordinator = Coordinator::initialize(vector(&[0.0]), vec![(id(1), 10)]).unwrap();
        let updates = vec![update(1, 0, 10, vector(&[5.0]))];
        assert_eq!(coordinator.aggregate(&updates).unwrap(), vector(&[5.0]));
    }

    #[test]
    fn test_aggregate_is_weighted_sum() {
        let coordinator = Coordinator::initialize(
            dense(0.0, 0.0),
            vec![(id(1), 1), (id(2), 3), (id(3), 6)],
        )
        .unwrap();
        let updates = vec![
            update(1, 0, 1, dense(10.0, 1.0)),
            update(2, 0, 3, dense(0.0, 2.0)),
            update(3, 0, 6, dense(5.0, -1.0)),
        ];
        let global = coordinator.aggregate(&updates).unwrap();
        let expected = dense(0.1 * 10.0 + 0.6 * 5.0, 0.1 * 1.0 + 0.3 * 2.0 - 0.6);
        for (ours, theirs) in global.iter().zip(expected.iter()) {
            for (a, b) in ours.data().iter().zip(theirs.data().iter()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let counts: Vec<_> = (1..=8).map(|p| (id(p), p * 7 % 5 + 1)).collect();
        let coordinator = Coordinator::initialize(dense(0.0, 0.0), counts.clone()).unwrap();
        let mut updates: Vec<_> = counts
            .iter()
            .map(|(p, n)| {
                let p = u64::from(*p);
                update(p, 0, *n, dense(0.1 * p as f64 + 1e-9, 1.0 / p as f64))
            })
            .collect();
        let reference = coordinator.aggregate(&updates).unwrap();

        let mut rng = thread_rng();
        for _ in 0..20 {
            updates.shuffle(&mut rng);
            // bit identical: the summation order is fixed by the participant ids
            assert_eq!(coordinator.aggregate(&updates).unwrap(), reference);
        }
    }

    #[test]
    fn test_aggregate_incomplete_cohort() {
        let coordinator = Coordinator::initialize(
            vector(&[0.0]),
            vec![(id(1), 1), (id(2), 1), (id(3), 1)],
        )
        .unwrap();
        let updates = vec![
            update(3, 0, 1, vector(&[2.0])),
            update(1, 0, 1, vector(&[4.0])),
        ];
        let err = coordinator.aggregate(&updates).unwrap_err();
        assert_eq!(
            err,
            AggregationError::IncompleteCohort {
                expected: 3,
                received: 2,
                missing: vec![id(2)],
            }
        );
        assert_eq!(err.participant(), Some(id(2)));
    }

    #[test]
    fn test_aggregate_rejects_mismatching_shapes() {
        let coordinator =
            Coordinator::initialize(vector(&[0.0]), vec![(id(1), 1), (id(2), 1)]).unwrap();
        let updates = vec![
            update(1, 0, 1, vector(&[2.0])),
            update(2, 0, 1, vector(&[4.0, 1.0])),
        ];
        assert!(matches!(
            coordinator.aggregate(&updates),
            Err(AggregationError::ParticipantMismatch { participant, .. }) if participant == id(2)
        ));
    }

    #[test]
    fn test_aggregate_rejects_invalid_updates() {
        let coordinator =
            Coordinator::initialize(vector(&[0.0]), vec![(id(1), 1), (id(2), 1)]).unwrap();

        let unknown = vec![update(9, 0, 1, vector(&[2.0]))];
        assert_eq!(
            coordinator.aggregate(&unknown),
            Err(AggregationError::UnknownParticipant(id(9)))
        );

        let duplicate = vec![
            update(1, 0, 1, vector(&[2.0])),
            update(1, 0, 1, vector(&[2.0])),
        ];
        assert_eq!(
            coordinator.aggregate(&duplicate),
            Err(AggregationError::DuplicateUpdate(id(1)))
        );

        let stale = vec![update(1, 4, 1, vector(&[2.0]))];
        assert_eq!(
            coordinator.aggregate(&stale),
            Err(AggregationError::RoundMismatch {
                participant: id(1),
                expected: 0,
                found: 4,
            })
        );

        let lying = vec![update(2, 0, 100, vector(&[2.0]))];
        assert_eq!(
            coordinator.aggregate(&lying),
            Err(AggregationError::SampleCountMismatch {
                participant: id(2),
                registered: 1,
                reported: 100,
            })
        );
    }

    #[test]
    fn test_commit() {
        let mut coordinator = Coordinator::initialize(vector(&[0.0]), vec![(id(1), 1)]).unwrap();
        coordinator.commit(vector(&[1.0])).unwrap();
        assert_eq!(coordinator.round(), 1);
        assert_eq!(coordinator.distribute(), vector(&[1.0]));

        assert!(coordinator.commit(vector(&[1.0, 2.0])).is_err());
        assert_eq!(coordinator.round(), 1);
        assert_eq!(coordinator.global(), &vector(&[1.0]));
    }
}
