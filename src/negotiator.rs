//! Path negotiation.
//!
//! Walks a [`NegotiationPlan`]: the primary candidate first, then the
//! alternatives (raced in parallel or tried one by one), then the relay. Every
//! target gets [`RetryPolicy::max_attempts`] attempts, each bounded by
//! [`RetryPolicy::attempt_timeout`], with exponential backoff in between.

use std::sync::Arc;
use std::time::Duration;

use callcore::{CallError, NegotiationPlan, PathKind, PathTarget, RetryPolicy};
use log::{debug, info, warn};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::CallConfig;
use crate::transport::{MediaTransport, PathConnector, TransportParams};

/// The winning path of a negotiation run.
#[derive(Clone)]
pub struct NegotiatedPath {
    pub transport: Arc<dyn MediaTransport>,
    pub path: PathKind,
    pub rtt: Duration,
    /// Protocol layer agreed with the peer on this path.
    pub max_layer: i32,
}

impl std::fmt::Debug for NegotiatedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedPath")
            .field("path", &self.path)
            .field("rtt", &self.rtt)
            .field("max_layer", &self.max_layer)
            .finish()
    }
}

#[derive(Clone)]
pub struct TransportNegotiator {
    connector: Arc<dyn PathConnector>,
    policy: RetryPolicy,
    parallel_alternatives: bool,
    selection_window: Duration,
}

impl TransportNegotiator {
    pub fn new(connector: Arc<dyn PathConnector>, config: &CallConfig) -> Self {
        Self {
            connector,
            policy: config.retry_policy(),
            parallel_alternatives: config.parallel_alternatives,
            selection_window: config.selection_window(),
        }
    }

    /// Run the plan to completion.
    ///
    /// Returns the first usable path in plan order, or
    /// [`CallError::NegotiationFailed`] once every target is exhausted.
    pub async fn negotiate(
        &self,
        plan: NegotiationPlan,
        params: TransportParams,
    ) -> Result<NegotiatedPath, CallError> {
        if plan.is_empty() {
            warn!(target: "Call/Negotiator", "Nothing to negotiate: no direct paths allowed and no relay configured");
            return Err(CallError::NegotiationFailed);
        }

        if let Some(primary) = &plan.primary {
            match attempt_with_retries(&*self.connector, self.policy, primary, &params).await {
                Ok(path) => return Ok(path),
                Err(e) => info!(target: "Call/Negotiator", "Primary path {} failed: {}", primary, e),
            }
        }

        if !plan.alternatives.is_empty() {
            let outcome = if self.parallel_alternatives {
                self.race(&plan.alternatives, &params).await
            } else {
                self.in_order(&plan.alternatives, &params).await
            };
            if let Some(path) = outcome {
                return Ok(path);
            }
            info!(target: "Call/Negotiator", "All {} alternative paths failed", plan.alternatives.len());
        }

        if let Some(relay) = &plan.relay {
            match attempt_with_retries(&*self.connector, self.policy, relay, &params).await {
                Ok(path) => return Ok(path),
                Err(e) => warn!(target: "Call/Negotiator", "Relay path {} failed: {}", relay, e),
            }
        }

        Err(CallError::NegotiationFailed)
    }

    async fn in_order(
        &self,
        targets: &[PathTarget],
        params: &TransportParams,
    ) -> Option<NegotiatedPath> {
        for target in targets {
            match attempt_with_retries(&*self.connector, self.policy, target, params).await {
                Ok(path) => return Some(path),
                Err(e) => debug!(target: "Call/Negotiator", "Alternative {} failed: {}", target, e),
            }
        }
        None
    }

    /// Attempt all targets at once. The first success opens the selection
    /// window; the lowest RTT inside it wins and every other path is closed.
    async fn race(&self, targets: &[PathTarget], params: &TransportParams) -> Option<NegotiatedPath> {
        let mut join_set = JoinSet::new();
        for target in targets {
            let connector = self.connector.clone();
            let policy = self.policy;
            let target = target.clone();
            let params = params.clone();
            join_set.spawn(async move {
                let result = attempt_with_retries(&*connector, policy, &target, &params).await;
                (target, result)
            });
        }

        let mut winners: Vec<NegotiatedPath> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => join_set.join_next().await,
            };
            let Some(joined) = next else {
                break;
            };

            match joined {
                Ok((_, Ok(path))) => {
                    debug!(target: "Call/Negotiator", "Alternative {:?} answered (RTT: {:?})", path.path, path.rtt);
                    deadline.get_or_insert_with(|| Instant::now() + self.selection_window);
                    winners.push(path);
                }
                Ok((target, Err(e))) => {
                    debug!(target: "Call/Negotiator", "Alternative {} failed: {}", target, e)
                }
                Err(e) => warn!(target: "Call/Negotiator", "Alternative attempt task failed: {}", e),
            }
        }

        // Stragglers that finish while being cancelled still get closed.
        join_set.abort_all();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((_, Ok(path))) = joined {
                path.transport.close();
            }
        }

        let best = winners
            .iter()
            .enumerate()
            .min_by_key(|(_, path)| path.rtt)
            .map(|(i, _)| i)?;
        let chosen = winners.swap_remove(best);
        for loser in winners {
            debug!(target: "Call/Negotiator", "Closing slower alternative {:?} ({:?})", loser.path, loser.rtt);
            loser.transport.close();
        }
        info!(target: "Call/Negotiator", "Selected alternative {:?} (RTT: {:?})", chosen.path, chosen.rtt);
        Some(chosen)
    }
}

async fn attempt_with_retries(
    connector: &dyn PathConnector,
    policy: RetryPolicy,
    target: &PathTarget,
    params: &TransportParams,
) -> Result<NegotiatedPath, CallError> {
    let mut last_error = CallError::NegotiationFailed;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let backoff = policy.backoff(attempt - 1);
            debug!(target: "Call/Negotiator", "Retrying {} in {:?}", target, backoff);
            tokio::time::sleep(backoff).await;
        }

        match tokio::time::timeout(policy.attempt_timeout, connector.connect(target, params)).await
        {
            Ok(Ok(transport)) => {
                let path = NegotiatedPath {
                    path: transport.path(),
                    rtt: transport.rtt(),
                    max_layer: transport.max_layer(),
                    transport,
                };
                info!(target: "Call/Negotiator", "Connected via {} on attempt {}", target, attempt + 1);
                return Ok(path);
            }
            Ok(Err(e)) => {
                warn!(
                    target: "Call/Negotiator",
                    "Attempt {}/{} on {} failed: {}",
                    attempt + 1,
                    policy.max_attempts,
                    target,
                    e
                );
                last_error = CallError::TransportLost(e.to_string());
            }
            Err(_) => {
                warn!(
                    target: "Call/Negotiator",
                    "Attempt {}/{} on {} timed out after {:?}",
                    attempt + 1,
                    policy.max_attempts,
                    target,
                    policy.attempt_timeout
                );
                last_error = CallError::NegotiationTimeout(target.to_string());
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportStats};
    use async_trait::async_trait;
    use callcore::{CallDirection, CallKey, CandidateSet, ConnectionCandidate, NetworkProfile};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedTransport {
        path: PathKind,
        rtt: Duration,
        max_layer: i32,
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaTransport for FixedTransport {
        fn path(&self) -> PathKind {
            self.path
        }
        fn rtt(&self) -> Duration {
            self.rtt
        }
        fn max_layer(&self) -> i32 {
            self.max_layer
        }
        fn is_viable(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
        fn set_muted(&self, _muted: bool) {}
        fn apply_profile(&self, _profile: NetworkProfile) {}
        fn send_frame(&self, _frame: &[u8]) -> Result<bool, TransportError> {
            Ok(true)
        }
        async fn closed(&self) {
            std::future::pending::<()>().await
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    /// Answers each target after a fixed delay with a fixed RTT; targets
    /// without an entry never answer.
    #[derive(Default)]
    struct DelayConnector {
        answers: HashMap<PathKind, (Duration, Duration)>,
        attempts: Mutex<Vec<PathKind>>,
        opened: Mutex<Vec<Arc<FixedTransport>>>,
    }

    #[async_trait]
    impl PathConnector for DelayConnector {
        async fn connect(
            &self,
            target: &PathTarget,
            params: &TransportParams,
        ) -> Result<Arc<dyn MediaTransport>, TransportError> {
            self.attempts.lock().unwrap().push(target.kind());
            let Some((delay, rtt)) = self.answers.get(&target.kind()).copied() else {
                return std::future::pending().await;
            };
            tokio::time::sleep(delay).await;
            let transport = Arc::new(FixedTransport {
                path: target.kind(),
                rtt,
                max_layer: params.max_layer.min(PEER_LAYER),
                closed: AtomicBool::new(false),
            });
            self.opened.lock().unwrap().push(transport.clone());
            Ok(transport as Arc<dyn MediaTransport>)
        }
    }

    const PEER_LAYER: i32 = 80;

    fn params() -> TransportParams {
        TransportParams {
            key: CallKey::new(vec![1u8; 32]).unwrap(),
            direction: CallDirection::Outgoing,
            max_layer: 92,
            profile: NetworkProfile::default(),
            muted: false,
        }
    }

    fn plan() -> NegotiationPlan {
        let candidates = CandidateSet::new(
            ConnectionCandidate::new(1, "10.0.0.1", "", 3478, &b"tag"[..]),
            vec![
                ConnectionCandidate::new(2, "10.0.0.2", "", 3478, &b"tag"[..]),
                ConnectionCandidate::new(3, "10.0.0.3", "", 3478, &b"tag"[..]),
            ],
        )
        .unwrap();
        NegotiationPlan::build(&candidates, None, true)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_fails_immediately() {
        let connector = Arc::new(DelayConnector::default());
        let negotiator = TransportNegotiator::new(connector.clone(), &CallConfig::default());

        let result = negotiator.negotiate(NegotiationPlan::default(), params()).await;
        assert!(matches!(result, Err(CallError::NegotiationFailed)));
        assert!(connector.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_is_retried_up_to_the_ceiling() {
        let connector = Arc::new(DelayConnector::default());
        let config = CallConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let negotiator = TransportNegotiator::new(connector.clone(), &config);

        let mut plan = plan();
        plan.alternatives.clear();
        let result = negotiator.negotiate(plan, params()).await;

        assert!(matches!(result, Err(CallError::NegotiationFailed)));
        assert_eq!(
            *connector.attempts.lock().unwrap(),
            vec![PathKind::Direct { candidate_id: 1 }; 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_picks_lowest_rtt_inside_window() {
        let mut connector = DelayConnector::default();
        connector
            .answers
            .insert(PathKind::Direct { candidate_id: 2 }, (ms(10), ms(90)));
        connector
            .answers
            .insert(PathKind::Direct { candidate_id: 3 }, (ms(40), ms(20)));
        let connector = Arc::new(connector);
        let negotiator = TransportNegotiator::new(connector.clone(), &CallConfig::default());

        let chosen = negotiator.negotiate(plan(), params()).await.unwrap();
        assert_eq!(chosen.path, PathKind::Direct { candidate_id: 3 });
        assert_eq!(chosen.max_layer, PEER_LAYER);

        let opened = connector.opened.lock().unwrap();
        let loser = opened
            .iter()
            .find(|t| t.path == PathKind::Direct { candidate_id: 2 })
            .unwrap();
        assert!(!loser.is_viable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_ignores_answers_after_window() {
        let mut connector = DelayConnector::default();
        connector
            .answers
            .insert(PathKind::Direct { candidate_id: 2 }, (ms(10), ms(90)));
        connector
            .answers
            .insert(PathKind::Direct { candidate_id: 3 }, (ms(500), ms(5)));
        let negotiator = TransportNegotiator::new(Arc::new(connector), &CallConfig::default());

        let chosen = negotiator.negotiate(plan(), params()).await.unwrap();
        assert_eq!(chosen.path, PathKind::Direct { candidate_id: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_alternatives_keep_plan_order() {
        let mut connector = DelayConnector::default();
        connector
            .answers
            .insert(PathKind::Direct { candidate_id: 3 }, (ms(1), ms(5)));
        let connector = Arc::new(connector);
        let config = CallConfig {
            max_attempts: 1,
            parallel_alternatives: false,
            ..Default::default()
        };
        let negotiator = TransportNegotiator::new(connector.clone(), &config);

        let chosen = negotiator.negotiate(plan(), params()).await.unwrap();
        assert_eq!(chosen.path, PathKind::Direct { candidate_id: 3 });
        assert_eq!(
            *connector.attempts.lock().unwrap(),
            vec![
                PathKind::Direct { candidate_id: 1 },
                PathKind::Direct { candidate_id: 2 },
                PathKind::Direct { candidate_id: 3 },
            ]
        );
    }
}
