//! Iterative parallel lookup.
//!
//! A single coordinator future owns all lookup state: the candidate set
//! ordered by distance to the target, the set of queried peers and the set
//! of peers that answered. Outstanding RPCs live in a [`FuturesUnordered`]
//! and only hand their replies back; nothing else mutates the state. Dropping
//! the coordinator (value hit, deadline, shutdown) cancels every RPC still in
//! flight.
//!
//! The same loop serves three call sites:
//!
//! - [`LookupKind::Peer`]: FIND_NODE until the k closest peers have answered.
//! - [`LookupKind::Value`]: FIND_VALUE, returning as soon as any peer holds the value.
//! - [`LookupKind::Providers`]: GET_PROVIDERS, collecting providers from every responder.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::key::{short_hex, xor_distance, Distance, Key, NodeId};
use crate::node::NodeState;
use crate::routing::{Contact, RoutingHandle};
use crate::rpc::{with_timeout, DhtNetwork};

/// Which RPC a lookup issues and how it terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Peer,
    Value,
    Providers,
}

/// A value returned by a FIND_VALUE lookup, and the peer that held it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundValue {
    pub value: Vec<u8>,
    pub from: Contact,
}

/// Result of an iterative lookup.
#[derive(Clone, Debug, Default)]
pub struct LookupOutcome {
    /// Peers that answered, closest to the target first, at most k.
    pub closest: Vec<Contact>,
    /// Set by value lookups that hit.
    pub value: Option<FoundValue>,
    /// Providers gathered by provider lookups, deduplicated by ID.
    pub providers: Vec<Contact>,
    /// Number of peers an RPC was sent to.
    pub queried: usize,
    /// Number of peers that answered.
    pub responded: usize,
    /// The lookup deadline passed and the results are partial.
    pub timed_out: bool,
}

/// What a single peer told us.
struct QueryReply {
    closer: Vec<Contact>,
    value: Option<Vec<u8>>,
    providers: Vec<Contact>,
}

/// Candidate and result bookkeeping for one lookup.
struct LookupState {
    target: Key,
    local_id: NodeId,
    k: usize,
    candidates: BTreeSet<(Distance, NodeId)>,
    contacts: HashMap<NodeId, Contact>,
    queried: HashSet<NodeId>,
    results: BTreeSet<(Distance, NodeId)>,
    providers: Vec<Contact>,
    provider_ids: HashSet<NodeId>,
    responded: usize,
    timed_out: bool,
}

impl LookupState {
    fn new(target: Key, local_id: NodeId, k: usize, initial: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            local_id,
            k: k.max(1),
            candidates: BTreeSet::new(),
            contacts: HashMap::new(),
            queried: HashSet::new(),
            results: BTreeSet::new(),
            providers: Vec::new(),
            provider_ids: HashSet::new(),
            responded: 0,
            timed_out: false,
        };
        for contact in initial {
            state.offer(contact);
        }
        state
    }

    /// Whether `id` has been seen at all during this lookup.
    fn knows(&self, id: &NodeId) -> bool {
        id == &self.local_id || self.contacts.contains_key(id)
    }

    /// Add a contact to the candidate set unless it is us or already known.
    fn offer(&mut self, contact: Contact) {
        if self.knows(&contact.id) {
            return;
        }
        self.candidates
            .insert((xor_distance(&contact.id, &self.target), contact.id));
        self.contacts.insert(contact.id, contact);
    }

    /// Pop up to `alpha` of the closest unqueried candidates.
    fn next_round(&mut self, alpha: usize) -> Vec<Contact> {
        let mut round = Vec::with_capacity(alpha);
        while round.len() < alpha {
            let Some((_, id)) = self.candidates.pop_first() else {
                break;
            };
            if !self.queried.insert(id) {
                continue;
            }
            if let Some(contact) = self.contacts.get(&id) {
                round.push(contact.clone());
            }
        }
        round
    }

    fn record_response(&mut self, from: &Contact, reply: QueryReply) {
        self.responded += 1;
        self.results
            .insert((xor_distance(&from.id, &self.target), from.id));
        while self.results.len() > self.k {
            self.results.pop_last();
        }
        for provider in reply.providers {
            if self.provider_ids.insert(provider.id) {
                self.providers.push(provider);
            }
        }
        for contact in reply.closer {
            self.offer(contact);
        }
    }

    /// True while some candidate is closer than the k-th best answer so far.
    fn has_closer_candidates(&self) -> bool {
        let Some((closest_candidate, _)) = self.candidates.first() else {
            return false;
        };
        if self.results.len() < self.k {
            return true;
        }
        match self.results.iter().nth(self.k - 1) {
            Some((kth_best, _)) => closest_candidate < kth_best,
            None => true,
        }
    }

    fn finish(self, value: Option<FoundValue>) -> LookupOutcome {
        let closest = self
            .results
            .iter()
            .filter_map(|(_, id)| self.contacts.get(id).cloned())
            .collect();
        LookupOutcome {
            closest,
            value,
            providers: self.providers,
            queried: self.queried.len(),
            responded: self.responded,
            timed_out: self.timed_out,
        }
    }
}

/// Runs iterative lookups against the routing table and the network.
pub struct LookupEngine<N: DhtNetwork> {
    local_id: NodeId,
    routing: Arc<RoutingHandle<N>>,
    network: Arc<N>,
    k: usize,
    alpha: usize,
    rpc_timeout: Duration,
    lookup_timeout: Duration,
    state: watch::Receiver<NodeState>,
}

impl<N: DhtNetwork> LookupEngine<N> {
    pub fn new(
        local_id: NodeId,
        routing: Arc<RoutingHandle<N>>,
        network: Arc<N>,
        config: &DhtConfig,
        state: watch::Receiver<NodeState>,
    ) -> Self {
        Self {
            local_id,
            routing,
            network,
            k: config.k.max(1),
            alpha: config.alpha.max(1),
            rpc_timeout: config.rpc_timeout,
            lookup_timeout: config.lookup_timeout,
            state,
        }
    }

    /// Find the k closest reachable peers to `target`.
    pub async fn lookup_peer(&self, target: NodeId) -> Result<Vec<Contact>> {
        Ok(self.lookup(target, LookupKind::Peer).await?.closest)
    }

    /// Look for a value; the outcome carries it if any peer had it.
    pub async fn lookup_value(&self, key: Key) -> Result<LookupOutcome> {
        self.lookup(key, LookupKind::Value).await
    }

    /// Collect provider records for `key` from every peer on the path.
    pub async fn lookup_providers(&self, key: Key) -> Result<LookupOutcome> {
        self.lookup(key, LookupKind::Providers).await
    }

    /// Perform an iterative lookup of the given kind.
    ///
    /// The lookup process:
    /// 1. Seed candidates with the k closest contacts from the routing table
    /// 2. Query up to alpha unqueried candidates concurrently, merging replies as they arrive
    /// 3. Observe every responder and every contact it returns
    /// 4. Repeat while a candidate is closer than the k-th best responder
    ///
    /// Per-peer failures drop that peer from this lookup only. When the
    /// deadline passes the partial results are returned. The only errors are
    /// [`DhtError::NoReachablePeers`] and [`DhtError::ShuttingDown`].
    pub async fn lookup(&self, target: Key, kind: LookupKind) -> Result<LookupOutcome> {
        let initial = self.routing.closest(&target, self.k).await;
        if initial.is_empty() {
            return Err(DhtError::NoReachablePeers);
        }

        // Any move into Stopping or Stopped after this point cancels the lookup,
        // even if both transitions land before we are polled again.
        let mut state_rx = self.state.clone();
        state_rx.borrow_and_update();
        let cancelled = async move {
            loop {
                if state_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
                let state = *state_rx.borrow_and_update();
                if matches!(state, NodeState::Stopping | NodeState::Stopped) {
                    return;
                }
            }
        };
        tokio::pin!(cancelled);

        let deadline = Instant::now() + self.lookup_timeout;
        let mut state = LookupState::new(target, self.local_id, self.k, initial);
        let mut in_flight = FuturesUnordered::new();

        'rounds: loop {
            for contact in state.next_round(self.alpha) {
                in_flight.push(self.query(contact, target, kind));
            }
            if in_flight.is_empty() {
                break;
            }

            loop {
                let next = tokio::select! {
                    _ = &mut cancelled => return Err(DhtError::ShuttingDown),
                    next = tokio::time::timeout_at(deadline, in_flight.next()) => next,
                };
                let (contact, result) = match next {
                    Err(_) => {
                        state.timed_out = true;
                        break 'rounds;
                    }
                    Ok(None) => break,
                    Ok(Some(reply)) => reply,
                };

                let reply = match result {
                    Ok(reply) => reply,
                    Err(err) if err.is_peer_failure() => {
                        trace!(
                            peer = %short_hex(&contact.id),
                            "lookup query failed: {err}"
                        );
                        continue;
                    }
                    Err(err) => {
                        debug!(peer = %short_hex(&contact.id), "lookup query aborted: {err}");
                        continue;
                    }
                };

                // Does not wait on the network; eviction probes run in the background.
                self.routing.observe(contact.clone()).await;
                for discovered in &reply.closer {
                    if !state.knows(&discovered.id) {
                        self.routing.observe(discovered.clone()).await;
                    }
                }

                if kind == LookupKind::Value {
                    if let Some(value) = reply.value.clone() {
                        state.record_response(&contact, reply);
                        debug!(
                            target = %short_hex(&target),
                            holder = %short_hex(&contact.id),
                            queried = state.queried.len(),
                            "value lookup hit"
                        );
                        return Ok(state.finish(Some(FoundValue {
                            value,
                            from: contact,
                        })));
                    }
                }
                state.record_response(&contact, reply);
            }

            if !state.has_closer_candidates() {
                break;
            }
        }

        debug!(
            target = %short_hex(&target),
            kind = ?kind,
            queried = state.queried.len(),
            responded = state.responded,
            timed_out = state.timed_out,
            "iterative lookup completed"
        );

        if state.responded == 0 {
            return Err(DhtError::NoReachablePeers);
        }
        Ok(state.finish(None))
    }

    /// Issue one lookup RPC under the per-RPC timeout.
    async fn query(
        &self,
        contact: Contact,
        target: Key,
        kind: LookupKind,
    ) -> (Contact, Result<QueryReply>) {
        let network = &self.network;
        let to = &contact;
        let result = with_timeout(self.rpc_timeout, async move {
            match kind {
                LookupKind::Peer => {
                    let closer = network.find_node(to, target).await?;
                    Ok(QueryReply {
                        closer,
                        value: None,
                        providers: Vec::new(),
                    })
                }
                LookupKind::Value => {
                    let (value, closer) = network.find_value(to, target).await?;
                    Ok(QueryReply {
                        closer,
                        value,
                        providers: Vec::new(),
                    })
                }
                LookupKind::Providers => {
                    let (providers, closer) = network.get_providers(to, target).await?;
                    Ok(QueryReply {
                        closer,
                        value: None,
                        providers,
                    })
                }
            }
        })
        .await;
        (contact, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(byte: u8) -> Contact {
        let mut id = [0u8; 32];
        id[0] = byte;
        Contact::with_addr(id, format!("node-{byte}"))
    }

    fn reply(closer: Vec<Contact>) -> QueryReply {
        QueryReply {
            closer,
            value: None,
            providers: Vec::new(),
        }
    }

    #[test]
    fn rounds_pick_closest_unqueried_candidates() {
        let target = [0u8; 32];
        let mut state = LookupState::new(
            target,
            [0xffu8; 32],
            2,
            vec![contact(0x40), contact(0x10), contact(0x20)],
        );
        let round: Vec<u8> = state.next_round(2).iter().map(|c| c.id[0]).collect();
        assert_eq!(round, vec![0x10, 0x20]);
        let round: Vec<u8> = state.next_round(2).iter().map(|c| c.id[0]).collect();
        assert_eq!(round, vec![0x40]);
        assert!(state.next_round(2).is_empty());
    }

    #[test]
    fn local_id_and_duplicates_are_never_candidates() {
        let local = contact(0x01);
        let mut state = LookupState::new([0u8; 32], local.id, 4, vec![local.clone()]);
        state.offer(contact(0x02));
        state.offer(contact(0x02));
        assert_eq!(state.candidates.len(), 1);
    }

    #[test]
    fn terminates_once_k_closest_have_answered() {
        let target = [0u8; 32];
        let mut state = LookupState::new(target, [0xffu8; 32], 2, vec![contact(0x10), contact(0x20)]);
        for peer in state.next_round(2) {
            state.record_response(&peer, reply(vec![contact(0x80)]));
        }
        // 0x80 is further than both answers, so there is nothing left to gain.
        assert!(!state.has_closer_candidates());

        let outcome = state.finish(None);
        let ids: Vec<u8> = outcome.closest.iter().map(|c| c.id[0]).collect();
        assert_eq!(ids, vec![0x10, 0x20]);
        assert_eq!(outcome.responded, 2);
    }

    #[test]
    fn continues_while_closer_candidates_exist() {
        let target = [0u8; 32];
        let mut state = LookupState::new(target, [0xffu8; 32], 2, vec![contact(0x40), contact(0x80)]);
        for peer in state.next_round(2) {
            state.record_response(&peer, reply(vec![contact(0x08)]));
        }
        assert!(state.has_closer_candidates());
    }

    #[test]
    fn providers_are_deduplicated() {
        let mut state = LookupState::new([0u8; 32], [0xffu8; 32], 4, vec![contact(0x10), contact(0x20)]);
        for peer in state.next_round(2) {
            state.record_response(
                &peer,
                QueryReply {
                    closer: Vec::new(),
                    value: None,
                    providers: vec![contact(0x55)],
                },
            );
        }
        assert_eq!(state.finish(None).providers.len(), 1);
    }
}
