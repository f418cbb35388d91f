use crate::{Candidate, Endpoint, Error, Instance, SelectionQuery, WorkloadSource};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// What to do when a query without an exact name matches more than one workload.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum AmbiguityPolicy {
    /// Take the first workload in server order, warning about the others.
    #[default]
    FirstMatch,
    /// Refuse to pick one.
    Reject,
}

/// Bounded exponential backoff used while waiting for an attachable instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
}
impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(2),
        }
    }
}
impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Stands in for a deadline which cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Turns a `SelectionQuery` into one reachable `Endpoint`.
#[derive(Clone)]
pub struct Resolver {
    source: Arc<dyn WorkloadSource>,
    policy: AmbiguityPolicy,
    backoff: Backoff,
}

impl Resolver {
    /// Return a new `Self` listing from the given source.
    pub fn new(source: Arc<dyn WorkloadSource>) -> Self {
        Self {
            source,
            policy: AmbiguityPolicy::default(),
            backoff: Backoff::default(),
        }
    }
    /// Modify and return `Self` with the given ambiguity policy.
    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }
    /// The source candidates are listed from.
    pub fn source(&self) -> &Arc<dyn WorkloadSource> {
        &self.source
    }

    /// Resolves the query into an endpoint on the given remote port.
    /// Waits up to `timeout` for the selected workload to have an attachable instance.
    pub async fn resolve(
        &self,
        query: &SelectionQuery,
        port: u16,
        timeout: Duration,
    ) -> Result<Endpoint, Error> {
        let candidate = self.candidate(query).await?;
        let instance = self.resolve_attachable(&candidate, timeout).await?;
        let endpoint = Endpoint::new(instance, port);
        tracing::info!(workload = candidate.name(), %endpoint, "resolved endpoint");
        Ok(endpoint)
    }

    /// Lists the candidates of the query and selects one of them.
    pub async fn candidate(&self, query: &SelectionQuery) -> Result<Candidate, Error> {
        let candidates = self.source.list_candidates(query).await?;
        select_candidate(candidates, query.name(), self.policy)
    }

    /// Polls the candidate until it has an attachable instance or `timeout` elapses.
    pub async fn resolve_attachable(
        &self,
        candidate: &Candidate,
        timeout: Duration,
    ) -> Result<Instance, Error> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let mut delay = self.backoff.initial;
        loop {
            let instances = self.source.attachable_instances(candidate).await?;
            if let Some(instance) = instances.into_iter().next() {
                return Ok(instance);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::not_found(format!(
                    "timed out after {timeout:?} waiting for an attachable pod of '{}'",
                    candidate.name()
                )));
            }
            tracing::debug!(
                workload = candidate.name(),
                retry_in = ?delay,
                "waiting for an attachable pod"
            );
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = self.backoff.next(delay);
        }
    }
}

/// Reported when no workload matches at all.
const NO_WORKLOAD: &str = "no active workload found for the given name or selector";

/// Picks the candidate: the exact name match if a name is given, otherwise the first one.
fn select_candidate(
    candidates: Vec<Candidate>,
    name: Option<&str>,
    policy: AmbiguityPolicy,
) -> Result<Candidate, Error> {
    if candidates.is_empty() {
        return Err(Error::not_found(NO_WORKLOAD));
    }

    if let Some(name) = name {
        return candidates
            .into_iter()
            .find(|candidate| candidate.name() == name)
            .ok_or_else(|| {
                Error::not_found(format!("no active workload named '{name}' matches the selector"))
            });
    }

    if candidates.len() > 1 {
        let names = candidates
            .iter()
            .map(Candidate::name)
            .collect::<Vec<_>>()
            .join(", ");
        match policy {
            AmbiguityPolicy::Reject => {
                return Err(Error::validation(format!(
                    "the selector matches more than one workload: {names}"
                )));
            }
            AmbiguityPolicy::FirstMatch => {
                tracing::warn!(%names, "selector matches more than one workload, using the first");
            }
        }
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(NO_WORKLOAD))
}
