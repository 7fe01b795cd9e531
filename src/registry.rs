//! Stub registry.
//!
//! Holds the registered stubs as an immutable, priority-ordered snapshot.
//! Mutations build a new snapshot and swap it in under the write lock;
//! readers clone the current snapshot under a short read lock and match
//! against it with no lock held, so a reader sees the state either before
//! or after any single mutation.

use crate::config::StubDefinition;
use crate::error::StubError;
use crate::matcher::{CompiledMatcher, MatchRequest};
use crate::synthesizer::CompiledResponse;
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default bound on delays and timeout faults a stub may configure.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Opaque stub identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StubId(String);

impl StubId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StubId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A registered, compiled stub. Never mutated after insertion.
#[derive(Debug)]
pub struct StubRule {
    id: StubId,
    sequence: u64,
    definition: StubDefinition,
    matcher: CompiledMatcher,
    response: CompiledResponse,
}

impl StubRule {
    pub fn id(&self) -> &StubId {
        &self.id
    }

    /// Registration sequence number; higher is more recent.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn priority(&self) -> Option<i32> {
        self.definition.priority
    }

    /// The definition as registered, with its id filled in.
    pub fn definition(&self) -> &StubDefinition {
        &self.definition
    }

    pub fn response(&self) -> &CompiledResponse {
        &self.response
    }

    /// Does this stub accept the request?
    pub fn matches(&self, request: &MatchRequest) -> bool {
        self.matcher.matches(request)
    }

    /// Resolution order key: lower priority first (unset last), then most
    /// recent registration first.
    fn precedence(&self) -> (i64, Reverse<u64>) {
        let priority = self.definition.priority.map(i64::from).unwrap_or(i64::MAX);
        (priority, Reverse(self.sequence))
    }
}

/// Serializable view of a stub, as listed by the admin API.
#[derive(Debug, Serialize)]
pub struct StubMapping<'a> {
    pub sequence: u64,
    #[serde(flatten)]
    pub definition: &'a StubDefinition,
}

impl<'a> From<&'a StubRule> for StubMapping<'a> {
    fn from(rule: &'a StubRule) -> Self {
        Self {
            sequence: rule.sequence,
            definition: &rule.definition,
        }
    }
}

/// Ordered, immutable view of the registry.
pub type Snapshot = Arc<Vec<Arc<StubRule>>>;

struct RegistryState {
    snapshot: Snapshot,
    /// Caller-chosen ids ever registered; generated ids are never stored
    explicit: HashSet<StubId>,
    next_sequence: u64,
}

/// Concurrency-safe collection of stubs.
///
/// Generated ids are UUIDs built from a per-registry namespace and the
/// stub's sequence number, so they never repeat. Caller-chosen ids inside
/// that namespace are refused.
pub struct StubRegistry {
    state: RwLock<RegistryState>,
    max_delay: Duration,
    id_namespace: u64,
}

impl StubRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_max_delay(DEFAULT_MAX_DELAY)
    }

    /// Create an empty registry that rejects stubs suspending longer than `max_delay`.
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                snapshot: Arc::new(Vec::new()),
                explicit: HashSet::new(),
                next_sequence: 0,
            }),
            max_delay,
            id_namespace: rand::random(),
        }
    }

    fn generated_id(&self, sequence: u64) -> StubId {
        StubId(uuid::Uuid::from_u64_pair(self.id_namespace, sequence).to_string())
    }

    fn is_generated(&self, id: &StubId) -> bool {
        uuid::Uuid::parse_str(id.as_str())
            .map(|u| u.as_u64_pair().0 == self.id_namespace)
            .unwrap_or(false)
    }

    /// Register a stub and return its id.
    ///
    /// The definition is compiled before the lock is taken; an invalid
    /// definition leaves the registry untouched.
    pub fn register(&self, mut definition: StubDefinition) -> Result<StubId, StubError> {
        let label = definition.label().to_string();
        definition.validate_id()?;
        let matcher = CompiledMatcher::compile(&definition.request)
            .map_err(|reason| StubError::invalid(&label, reason))?;
        let response = CompiledResponse::compile(&definition.response, &label)?;
        if response.max_suspension() > self.max_delay {
            return Err(StubError::invalid(
                &label,
                format!(
                    "delay of {}ms exceeds the maximum of {}ms",
                    response.max_suspension().as_millis(),
                    self.max_delay.as_millis()
                ),
            ));
        }

        let requested = definition.id.as_deref().map(StubId::new);

        if let Some(id) = &requested {
            if self.is_generated(id) {
                return Err(StubError::DuplicateId(id.to_string()));
            }
        }

        let mut state = self.state.write();
        let sequence = state.next_sequence;
        let id = match requested {
            Some(id) => {
                if !state.explicit.insert(id.clone()) {
                    return Err(StubError::DuplicateId(id.to_string()));
                }
                id
            }
            None => self.generated_id(sequence),
        };
        state.next_sequence += 1;
        definition.id = Some(id.to_string());

        let rule = Arc::new(StubRule {
            id: id.clone(),
            sequence,
            definition,
            matcher,
            response,
        });

        let mut rules: Vec<Arc<StubRule>> = state.snapshot.as_ref().clone();
        let position = rules.partition_point(|existing| existing.precedence() < rule.precedence());
        rules.insert(position, rule);
        state.snapshot = Arc::new(rules);
        let total = state.snapshot.len();
        drop(state);

        info!(stub_id = %id, sequence, total, "Stub registered");
        Ok(id)
    }

    /// Register a stub that is removed again when the returned guard drops.
    pub fn register_scoped(&self, definition: StubDefinition) -> Result<ScopedStub<'_>, StubError> {
        let id = self.register(definition)?;
        Ok(ScopedStub { registry: self, id })
    }

    /// Remove a stub by id. Unknown or already removed ids are a no-op.
    pub fn remove(&self, id: &StubId) -> bool {
        let mut state = self.state.write();
        if !state.snapshot.iter().any(|rule| &rule.id == id) {
            debug!(stub_id = %id, "Remove of unknown stub ignored");
            return false;
        }
        let rules: Vec<Arc<StubRule>> = state
            .snapshot
            .iter()
            .filter(|rule| &rule.id != id)
            .cloned()
            .collect();
        state.snapshot = Arc::new(rules);
        let total = state.snapshot.len();
        drop(state);

        info!(stub_id = %id, total, "Stub removed");
        true
    }

    /// Remove every stub. Issued ids stay retired.
    pub fn clear(&self) {
        let mut state = self.state.write();
        let removed = state.snapshot.len();
        state.snapshot = Arc::new(Vec::new());
        drop(state);
        info!(removed, "Stub registry cleared");
    }

    /// All stubs in resolution order.
    pub fn find_all_mapped(&self) -> Snapshot {
        Arc::clone(&self.state.read().snapshot)
    }

    pub fn get(&self, id: &StubId) -> Option<Arc<StubRule>> {
        self.find_all_mapped()
            .iter()
            .find(|rule| &rule.id == id)
            .cloned()
    }

    /// Highest-precedence stub accepting the request, if any.
    pub fn resolve(&self, request: &MatchRequest) -> Option<Arc<StubRule>> {
        let snapshot = self.find_all_mapped();
        snapshot.iter().find(|rule| rule.matches(request)).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for StubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its stub from the registry when dropped.
pub struct ScopedStub<'a> {
    registry: &'a StubRegistry,
    id: StubId,
}

impl ScopedStub<'_> {
    pub fn id(&self) -> &StubId {
        &self.id
    }
}

impl Drop for ScopedStub<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BodyPattern, FaultConfig, RequestMatcher, ResponseDefinition, UrlPattern};
    use std::thread;
    use tokio_test::assert_err;

    fn client_stub(orders: u32) -> StubDefinition {
        StubDefinition::new(
            RequestMatcher::get(UrlPattern::exact("/client/123")),
            ResponseDefinition::json(serde_json::json!({ "orderHistory": orders })),
        )
    }

    fn resolved_orders(registry: &StubRegistry) -> Option<u64> {
        let rule = registry.resolve(&MatchRequest::get("/client/123"))?;
        match rule.definition().response.body.as_ref()? {
            crate::config::ResponseBody::Json { content } => content["orderHistory"].as_u64(),
            _ => None,
        }
    }

    #[test]
    fn test_lowest_priority_number_wins() {
        let registry = StubRegistry::new();
        registry.register(client_stub(6).at_priority(1000)).unwrap();
        registry.register(client_stub(1).at_priority(1)).unwrap();
        registry.register(client_stub(3).at_priority(50)).unwrap();

        assert_eq!(resolved_orders(&registry), Some(1));
    }

    #[test]
    fn test_equal_priority_prefers_most_recent() {
        let registry = StubRegistry::new();
        registry.register(client_stub(10).at_priority(10)).unwrap();
        let newer = registry.register(client_stub(1).at_priority(10)).unwrap();

        assert_eq!(resolved_orders(&registry), Some(1));
        assert_eq!(registry.find_all_mapped()[0].id(), &newer);
    }

    #[test]
    fn test_unset_priority_is_matched_last() {
        let registry = StubRegistry::new();
        registry.register(client_stub(2).at_priority(i32::MAX)).unwrap();
        registry.register(client_stub(9)).unwrap();

        assert_eq!(resolved_orders(&registry), Some(2));
        let all = registry.find_all_mapped();
        assert_eq!(all[1].priority(), None);
    }

    #[test]
    fn test_override_then_remove_falls_back() {
        let registry = StubRegistry::new();
        registry.register(client_stub(6).at_priority(1000)).unwrap();
        assert_eq!(resolved_orders(&registry), Some(6));

        let override_id = registry.register(client_stub(1).at_priority(1)).unwrap();
        assert_eq!(resolved_orders(&registry), Some(1));

        assert!(registry.remove(&override_id));
        assert_eq!(resolved_orders(&registry), Some(6));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = StubRegistry::new();
        let keep = registry.register(client_stub(6)).unwrap();
        let gone = registry.register(client_stub(1).at_priority(1)).unwrap();

        assert!(registry.remove(&gone));
        assert!(!registry.remove(&gone));
        assert!(!registry.remove(&StubId::new("never-registered")));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(&MatchRequest::get("/client/123")).unwrap().id(), &keep);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = StubRegistry::new();
        let id = registry.register(client_stub(6).with_id("client")).unwrap();
        assert_eq!(id.as_str(), "client");

        assert!(matches!(
            registry.register(client_stub(1).with_id("client")),
            Err(StubError::DuplicateId(_))
        ));

        registry.remove(&id);
        assert!(matches!(
            registry.register(client_stub(1).with_id("client")),
            Err(StubError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_generated_ids_cannot_be_claimed() {
        let registry = StubRegistry::new();
        let generated = registry.register(client_stub(6)).unwrap();
        registry.remove(&generated);

        assert!(matches!(
            registry.register(client_stub(1).with_id(generated.as_str())),
            Err(StubError::DuplicateId(_))
        ));
        let next = registry.register(client_stub(1)).unwrap();
        assert_ne!(next, generated);

        // Ids from another registry's namespace are ordinary explicit ids.
        let foreign = StubRegistry::new().register(client_stub(1)).unwrap();
        assert_eq!(registry.register(client_stub(1).with_id(foreign.as_str())).unwrap(), foreign);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let registry = StubRegistry::new();
        let ids: HashSet<StubId> = (0..100)
            .map(|_| registry.register(client_stub(1)).unwrap())
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_invalid_definition_leaves_state_unchanged() {
        let registry = StubRegistry::new();
        registry.register(client_stub(6)).unwrap();
        let before = registry.find_all_mapped();

        let invalid = StubDefinition::new(
            RequestMatcher::get(UrlPattern::regex("/client/(")),
            ResponseDefinition::default(),
        )
        .with_id("broken");
        assert_err!(registry.register(invalid));

        let after = registry.find_all_mapped();
        assert!(Arc::ptr_eq(&before, &after));

        // The rejected id was never issued.
        assert!(registry.register(client_stub(1).with_id("broken")).is_ok());
    }

    #[test]
    fn test_delay_above_maximum_rejected() {
        let registry = StubRegistry::with_max_delay(Duration::from_millis(500));
        let slow = StubDefinition::new(
            RequestMatcher::url(UrlPattern::Any),
            ResponseDefinition::default().with_fixed_delay(1000),
        );
        assert!(matches!(
            registry.register(slow),
            Err(StubError::InvalidRuleDefinition { .. })
        ));

        let hanging = StubDefinition::new(
            RequestMatcher::url(UrlPattern::Any),
            ResponseDefinition::default().with_fault(FaultConfig::Timeout { duration_ms: 501 }),
        );
        assert_err!(registry.register(hanging));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overflowing_delay_rejected() {
        let registry = StubRegistry::with_max_delay(Duration::from_millis(500));
        let mut endless = ResponseDefinition::default().with_fault(FaultConfig::Timeout { duration_ms: 1 });
        endless.delay = Some(crate::config::DelayConfig::fixed(u64::MAX));

        assert!(matches!(
            registry.register(StubDefinition::new(RequestMatcher::url(UrlPattern::Any), endless)),
            Err(StubError::InvalidRuleDefinition { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_body_skips_only_the_json_rule() {
        let registry = StubRegistry::new();
        registry
            .register(
                StubDefinition::new(
                    RequestMatcher::post(UrlPattern::exact("/student"))
                        .with_body(BodyPattern::json_path_equals("$.secondName", serde_json::json!("Orlova"))),
                    ResponseDefinition::status(201),
                )
                .with_id("json-rule")
                .at_priority(1),
            )
            .unwrap();
        registry
            .register(
                StubDefinition::new(
                    RequestMatcher::post(UrlPattern::exact("/student")),
                    ResponseDefinition::status(400),
                )
                .with_id("catch-all")
                .at_priority(100),
            )
            .unwrap();

        let plain = MatchRequest::post("/student").with_body("secondName=Orlova");
        assert_eq!(registry.resolve(&plain).unwrap().id().as_str(), "catch-all");

        let json = MatchRequest::post("/student").with_body(r#"{"secondName":"Orlova"}"#);
        assert_eq!(registry.resolve(&json).unwrap().id().as_str(), "json-rule");
    }

    #[test]
    fn test_scoped_stub_removed_on_drop() {
        let registry = StubRegistry::new();
        registry.register(client_stub(6).at_priority(1000)).unwrap();
        {
            let scoped = registry.register_scoped(client_stub(1).at_priority(1)).unwrap();
            assert!(registry.get(scoped.id()).is_some());
            assert_eq!(resolved_orders(&registry), Some(1));
        }
        assert_eq!(resolved_orders(&registry), Some(6));
    }

    #[test]
    fn test_clear_keeps_ids_retired() {
        let registry = StubRegistry::new();
        registry.register(client_stub(1).with_id("a")).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_err!(registry.register(client_stub(1).with_id("a")));
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_mutation() {
        let registry = StubRegistry::new();
        let id = registry.register(client_stub(6)).unwrap();
        let snapshot = registry.find_all_mapped();

        registry.remove(&id);
        registry.register(client_stub(1)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), &id);
    }

    #[test]
    fn test_concurrent_resolve_during_mutation() {
        let registry = Arc::new(StubRegistry::new());
        registry.register(client_stub(6).at_priority(1000)).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let orders = resolved_orders(&registry);
                        assert!(orders == Some(6) || orders == Some(1), "saw {orders:?}");
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let id = registry.register(client_stub(1).at_priority(1)).unwrap();
            registry.remove(&id);
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(resolved_orders(&registry), Some(6));
    }
}
