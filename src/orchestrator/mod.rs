//! Pass orchestration.
//!
//! Drives batches up the refinement ladder. Each pass claims its batch,
//! releases the store while the scanning collaborator runs, then merges
//! the results and advances the batch. Passes on one batch are strictly
//! serialized; distinct batches may run concurrently.

use crate::analysis::{AnomalyEvent, MergeEngine, MergeReport, PassConfiguration, PassLadder};
use crate::models::{Batch, BatchState, DiagnosisKey, RawExposure};
use crate::scanner::{ExposureScanner, ScannerError};
use crate::store::{BatchStore, StoreError};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

/// Errors that stop a pass. The batch stays at its last completed pass.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("scanning collaborator failed on pass {pass}: {source}")]
    Collaborator {
        pass: usize,
        #[source]
        source: ScannerError,
    },

    #[error("scanning collaborator returned nothing on pass {pass}")]
    EmptyResult { pass: usize },

    #[error("pass {pass} was cancelled")]
    Cancelled { pass: usize },

    #[error("pass {pass} timed out after {:.1}s", .timeout.as_secs_f64())]
    TimedOut { pass: usize, timeout: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of running one pass on one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The pass was merged and the batch advanced.
    Advanced { pass: usize, report: MergeReport },
    /// The batch had already merged every pass.
    Complete,
}

/// One round over the work-list of batches at the lowest pass.
#[derive(Debug)]
pub struct Round {
    /// Pass that ran, or `None` when every batch was complete.
    pub pass: Option<usize>,
    pub results: Vec<(String, Result<PassOutcome, AnalysisError>)>,
}

impl Round {
    pub fn is_complete(&self) -> bool {
        self.pass.is_none()
    }

    /// Number of batches that advanced this round.
    pub fn advanced(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(PassOutcome::Advanced { .. })))
            .count()
    }
}

/// An anomaly attributed to the batch it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedAnomaly {
    pub user_name: String,
    #[serde(flatten)]
    pub event: AnomalyEvent,
}

/// Shared record of every anomaly found by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct AnomalyLog {
    events: Arc<Mutex<Vec<LoggedAnomaly>>>,
}

impl AnomalyLog {
    fn extend(&self, user_name: &str, events: &[AnomalyEvent]) {
        if events.is_empty() {
            return;
        }
        let mut log = self.events.lock().unwrap_or_else(|p| p.into_inner());
        log.extend(events.iter().map(|event| LoggedAnomaly {
            user_name: user_name.to_string(),
            event: event.clone(),
        }));
    }

    pub fn entries(&self) -> Vec<LoggedAnomaly> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drives batches through the pass ladder.
pub struct AnalysisOrchestrator<S: ExposureScanner> {
    scanner: Arc<S>,
    store: Arc<BatchStore>,
    ladder: PassLadder,
    pass_timeout: Option<Duration>,
    anomalies: AnomalyLog,
}

impl<S: ExposureScanner> AnalysisOrchestrator<S> {
    pub fn new(scanner: Arc<S>, store: Arc<BatchStore>, ladder: PassLadder) -> Self {
        Self {
            scanner,
            store,
            ladder,
            pass_timeout: None,
            anomalies: AnomalyLog::default(),
        }
    }

    /// Abandon a pass when the collaborator takes longer than `timeout`.
    pub fn with_pass_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pass_timeout = timeout;
        self
    }

    pub fn ladder(&self) -> &PassLadder {
        &self.ladder
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }

    /// Current state of a batch.
    pub fn state(&self, user_name: &str) -> Option<BatchState> {
        self.store
            .batch(user_name)
            .map(|b| b.state(self.ladder.len()))
    }

    /// Run the next pass for one batch.
    ///
    /// On any error the batch keeps its pass count and can be retried. A
    /// result that arrives after `cancel` fires is discarded.
    pub async fn run_next_pass(
        &self,
        user_name: &str,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, AnalysisError> {
        let claim = self.store.claim(user_name)?;
        let batch = claim.batch();

        let Some((pass, config)) = batch
            .next_pass(self.ladder.len())
            .and_then(|p| self.ladder.get(p).map(|c| (p, *c)))
        else {
            debug!("{} has completed all passes", user_name);
            return Ok(PassOutcome::Complete);
        };

        info!(
            "Running pass {}/{} for {} ({} keys, cutoffs {}/{})",
            pass + 1,
            Batch::required_passes(self.ladder.len()),
            user_name,
            batch.keys.len(),
            config.low_cutoff,
            config.high_cutoff
        );

        let measurements = self.evaluate(&batch.keys, &config, pass, cancel).await?;

        if cancel.is_cancelled() {
            warn!("Discarding late results of pass {} for {}", pass, user_name);
            return Err(AnalysisError::Cancelled { pass });
        }

        let relevant = measurements
            .iter()
            .filter(|m| m.transmission_risk_level == batch.transmission_risk_level)
            .count();
        if relevant == 0 && !batch.exposures.is_empty() {
            warn!("Pass {} returned no measurements for {}", pass, user_name);
            return Err(AnalysisError::EmptyResult { pass });
        }

        let report = self.store.update(&claim, |b| {
            let report = info_span!("merge", user = %user_name, pass).in_scope(|| {
                MergeEngine::new(&self.ladder).merge_batch(
                    &mut b.exposures,
                    &measurements,
                    b.transmission_risk_level,
                    pass,
                )
            });
            b.analysis_passes = pass + 1;
            report
        })?;

        info!(
            "Pass {} for {}: {} created, {} refined, {} untouched, {} unmatched, {} anomalies",
            pass,
            user_name,
            report.created,
            report.refined,
            report.untouched,
            report.unmatched,
            report.anomalies.len()
        );
        self.anomalies.extend(user_name, &report.anomalies);

        Ok(PassOutcome::Advanced { pass, report })
    }

    /// Run passes for one batch until it completes or a pass fails.
    pub async fn run_to_completion(
        &self,
        user_name: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchState, AnalysisError> {
        while let PassOutcome::Advanced { .. } = self.run_next_pass(user_name, cancel).await? {}
        Ok(self.state(user_name).unwrap_or(BatchState::Complete))
    }

    /// Run one round: every batch at the lowest pass advances by one pass.
    ///
    /// Batches that are already further along are not part of the round.
    pub async fn run_round(&self, cancel: &CancellationToken) -> Round {
        let len = self.ladder.len();
        let batches = self.store.snapshot();

        let Some(lowest) = batches
            .iter()
            .filter(|b| b.next_pass(len).is_some())
            .map(|b| b.last_pass())
            .min()
        else {
            return Round {
                pass: None,
                results: Vec::new(),
            };
        };

        let work_list: Vec<String> = batches
            .into_iter()
            .filter(|b| b.last_pass() == lowest)
            .map(|b| b.user_name)
            .collect();
        let pass = lowest.map_or(0, |p| p + 1);
        debug!("Round for pass {}: {:?}", pass, work_list);

        let results = join_all(work_list.iter().map(|user| async move {
            (user.clone(), self.run_next_pass(user, cancel).await)
        }))
        .await;

        for (user, result) in &results {
            if let Err(e) = result {
                warn!("Pass {} for {} did not complete: {}", pass, user, e);
            }
        }

        Round {
            pass: Some(pass),
            results,
        }
    }

    /// Run rounds until every batch completes, a round makes no progress,
    /// `max_rounds` is reached, or `cancel` fires.
    pub async fn analyze_all(
        &self,
        cancel: &CancellationToken,
        max_rounds: Option<usize>,
    ) -> Vec<Round> {
        let mut rounds = Vec::new();

        while max_rounds.map_or(true, |max| rounds.len() < max) && !cancel.is_cancelled() {
            let round = self.run_round(cancel).await;
            let stop = round.is_complete() || round.advanced() == 0;
            rounds.push(round);
            if stop {
                break;
            }
        }

        rounds
    }

    async fn evaluate(
        &self,
        keys: &[DiagnosisKey],
        config: &PassConfiguration,
        pass: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawExposure>, AnalysisError> {
        let call = self.scanner.evaluate(keys, config);
        let bounded = async {
            let result = match self.pass_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => return Err(AnalysisError::TimedOut { pass, timeout: limit }),
                },
                None => call.await,
            };
            result.map_err(|source| AnalysisError::Collaborator { pass, source })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AnalysisError::Cancelled { pass }),
            result = bounded => result,
        }
    }
}
