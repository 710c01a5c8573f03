//! Proportional weighted allocation of node demand.
//!
//! One allocation pass divides each label's requested node count across the
//! providers able to supply it (in proportion to remaining capacity), then
//! divides each provider's integer grants across delivery targets (in
//! proportion to per-target weight).
//!
//! The pass is pure: no I/O, deterministic for fixed inputs. Build an
//! [`Allocation`], register providers and requests, then call
//! [`Allocation::make_grants`] once per provider:
//!
//! ```
//! use fleet_allocation::Allocation;
//!
//! let mut pass = Allocation::new();
//! let p1 = pass.add_provider("provider1", 10.0);
//! let r1 = pass.add_request("label1", 4.0);
//! pass.add_target(r1, "target1", 1.0);
//! pass.register(r1, p1);
//! pass.make_grants(p1);
//! assert_eq!(pass.provider_grants(p1), vec![(r1, 4)]);
//! ```
//!
//! # Invariants
//!
//! - The sum of grants for a request never exceeds its requested amount
//! - A zero total (capacity, demand, or target weight) yields a zero ratio,
//!   never a division by zero
//! - Sub-requests servable by fewer providers are granted first

/// Handle to a provider registered in an [`Allocation`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(usize);

/// Handle to a request registered in an [`Allocation`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(usize);

/// Final integer allocation for one (request, target) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAllocation {
    pub target: String,
    pub weight: f64,
    pub allocated: u64,
}

#[derive(Debug)]
struct ProviderState {
    name: String,
    available: f64,
    subs: Vec<usize>,
    grants: Vec<(RequestId, u64)>,
}

#[derive(Debug)]
struct RequestState {
    name: String,
    amount: f64,
    subs: Vec<usize>,
    targets: Vec<TargetAllocation>,
}

/// The portion of a request currently assigned to one provider.
#[derive(Debug)]
struct SubRequest {
    request: usize,
    provider: usize,
    amount: f64,
    satisfied: bool,
}

/// One allocation pass over a set of providers and requests.
///
/// Created per planning pass, mutated while grants are made, discarded
/// afterwards.
#[derive(Debug, Default)]
pub struct Allocation {
    providers: Vec<ProviderState>,
    requests: Vec<RequestState>,
    subs: Vec<SubRequest>,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider with its remaining capacity.
    pub fn add_provider(&mut self, name: &str, available: f64) -> ProviderId {
        self.providers.push(ProviderState {
            name: name.to_string(),
            available,
            subs: Vec::new(),
            grants: Vec::new(),
        });
        ProviderId(self.providers.len() - 1)
    }

    /// Register a label's demand.
    pub fn add_request(&mut self, label: &str, amount: f64) -> RequestId {
        self.requests.push(RequestState {
            name: label.to_string(),
            amount,
            subs: Vec::new(),
            targets: Vec::new(),
        });
        RequestId(self.requests.len() - 1)
    }

    /// Register a delivery target for a request with its weight.
    ///
    /// Grants to the request are split across its targets in proportion to
    /// weight; a target with weight <= 0 receives nothing.
    pub fn add_target(&mut self, request: RequestId, target: &str, weight: f64) {
        self.requests[request.0].targets.push(TargetAllocation {
            target: target.to_string(),
            weight,
            allocated: 0,
        });
    }

    /// Declare that `provider` can supply `request`'s label.
    ///
    /// Creates the provider-local sub-request and redistributes the
    /// request's demand across all of its providers.
    pub fn register(&mut self, request: RequestId, provider: ProviderId) {
        let idx = self.subs.len();
        self.subs.push(SubRequest {
            request: request.0,
            provider: provider.0,
            amount: 0.0,
            satisfied: false,
        });
        self.requests[request.0].subs.push(idx);
        self.providers[provider.0].subs.push(idx);
        self.redistribute(request);
    }

    /// Re-split a request's remaining demand across the providers of its
    /// unsatisfied sub-requests, in proportion to current capacity.
    ///
    /// Must run again after every grant because capacity changes.
    fn redistribute(&mut self, request: RequestId) {
        let pending: Vec<usize> = self.requests[request.0]
            .subs
            .iter()
            .copied()
            .filter(|&s| !self.subs[s].satisfied)
            .collect();

        let total_available: f64 = pending
            .iter()
            .map(|&s| self.providers[self.subs[s].provider].available)
            .sum();

        let amount = self.requests[request.0].amount;
        for s in pending {
            let available = self.providers[self.subs[s].provider].available;
            let ratio = if total_available > 0.0 {
                available / total_available
            } else {
                0.0
            };
            self.subs[s].amount = amount * ratio;
        }
    }

    /// Number of providers still competing for a sub-request's request.
    ///
    /// Fewer competitors means higher priority: a sub-request only this
    /// provider can service is filled before one shared by many.
    fn priority(&self, sub: usize) -> usize {
        self.requests[self.subs[sub].request]
            .subs
            .iter()
            .filter(|&&s| !self.subs[s].satisfied)
            .count()
    }

    /// Grant this provider's pending sub-requests, most constrained first.
    ///
    /// Each grant is the sub-request's proportional share of the demand
    /// still competing for this provider, rounded half-to-even and capped
    /// by remaining capacity. Granting removes the sub-request from
    /// consideration and redistributes the request's remainder so other
    /// providers see the updated demand.
    pub fn make_grants(&mut self, provider: ProviderId) {
        loop {
            let mut pending: Vec<usize> = self.providers[provider.0]
                .subs
                .iter()
                .copied()
                .filter(|&s| !self.subs[s].satisfied)
                .collect();
            if pending.is_empty() {
                break;
            }
            // Stable order within a priority tier: registration order.
            pending.sort_by_key(|&s| self.priority(s));
            let head = pending[0];

            let total_demand: f64 = pending
                .iter()
                .map(|&s| self.requests[self.subs[s].request].amount)
                .sum();
            let request = self.subs[head].request;
            let ratio = if total_demand > 0.0 {
                self.requests[request].amount / total_demand
            } else {
                0.0
            };

            let mut grant = round_half_even(self.subs[head].amount * ratio);
            grant = grant.min(self.providers[provider.0].available.max(0.0).floor() as u64);
            grant = grant.min(self.requests[request].amount.max(0.0).floor() as u64);

            self.subs[head].satisfied = true;
            if grant > 0 {
                self.providers[provider.0].available -= grant as f64;
                self.requests[request].amount -= grant as f64;
                self.providers[provider.0]
                    .grants
                    .push((RequestId(request), grant));
                self.allocate_to_targets(request, grant);
            }
            self.redistribute(RequestId(request));
        }
    }

    /// Split an integer grant across the request's targets by weight.
    ///
    /// Targets are processed in registration order with the running amount
    /// and running weight decremented after each allocation, so rounding
    /// error lands on later targets instead of accumulating.
    fn allocate_to_targets(&mut self, request: usize, grant: u64) {
        let targets = &mut self.requests[request].targets;
        let mut remaining = grant as f64;
        let mut total_weight: f64 = targets.iter().map(|t| t.weight.max(0.0)).sum();

        for target in targets.iter_mut() {
            let weight = target.weight.max(0.0);
            let ratio = if total_weight > 0.0 {
                weight / total_weight
            } else {
                0.0
            };
            let allocated = round_half_even(remaining * ratio).min(remaining.floor() as u64);
            target.allocated += allocated;
            remaining -= allocated as f64;
            total_weight -= weight;
        }
    }

    /// Grants made by a provider, in grant order.
    pub fn provider_grants(&self, provider: ProviderId) -> Vec<(RequestId, u64)> {
        self.providers[provider.0].grants.clone()
    }

    /// Total granted to a request across all providers.
    pub fn granted(&self, request: RequestId) -> u64 {
        self.providers
            .iter()
            .flat_map(|p| p.grants.iter())
            .filter(|(r, _)| *r == request)
            .map(|(_, amount)| amount)
            .sum()
    }

    /// A request's remaining (ungranted) demand.
    pub fn remaining(&self, request: RequestId) -> f64 {
        self.requests[request.0].amount
    }

    /// A provider's remaining capacity.
    pub fn available(&self, provider: ProviderId) -> f64 {
        self.providers[provider.0].available
    }

    /// Per-target allocations for a request.
    pub fn target_allocations(&self, request: RequestId) -> &[TargetAllocation] {
        &self.requests[request.0].targets
    }

    pub fn provider_name(&self, provider: ProviderId) -> &str {
        &self.providers[provider.0].name
    }

    pub fn request_label(&self, request: RequestId) -> &str {
        &self.requests[request.0].name
    }
}

/// Round half-to-even, clamped at zero.
fn round_half_even(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else {
        value.round_ties_even() as u64
    }
}
