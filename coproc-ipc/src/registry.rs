//! Service Registry
//!
//! Pairs discovered services with the consumers that registered interest in
//! them and tracks at most one claimant per service.
//!
//! Consumers register a pattern: an exact service name, or a glob. An exact
//! consumer always wins over a glob consumer; among glob consumers the one
//! registered first wins. Binding work (attach/detach callbacks) is planned
//! under the state lock and executed after it is dropped, so callbacks are
//! free to call back into the registry.

use crate::channel::ServiceChannel;
use crate::table::ServiceDescriptor;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("a consumer for \"{0}\" is already registered")]
    DuplicateConsumer(String),

    #[error("empty consumer pattern")]
    EmptyPattern,

    #[error("invalid consumer pattern \"{0}\": {1}")]
    BadPattern(String, String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("no service named \"{0}\"")]
    NotFound(String),

    #[error("coprocessor is not online")]
    NotYetOnline,

    #[error("service \"{0}\" is already claimed")]
    AlreadyClaimed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("service \"{0}\" is not claimed")]
    NotClaimed(String),

    #[error("handle for \"{0}\" no longer holds the claim")]
    Stale(String),
}

/// Callbacks a consumer supplies when it registers.
pub trait ServiceDriver: Send + Sync {
    /// Offer a matching service. Returning `Err` refuses it; the service then
    /// stays unbound.
    fn attach(&self, service: &ServiceDescriptor) -> Result<(), String>;

    /// The service is going away, or is being handed to another consumer.
    fn detach(&self, _service: &ServiceDescriptor) {}
}

/// Which service names a consumer wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    Glob(Pattern),
}

impl NamePattern {
    /// Any pattern containing `*`, `?` or `[` is a glob.
    pub fn parse(pattern: &str) -> Result<Self, RegisterError> {
        if pattern.is_empty() {
            return Err(RegisterError::EmptyPattern);
        }
        if !pattern.contains(['*', '?', '[']) {
            return Ok(NamePattern::Exact(pattern.to_string()));
        }
        Pattern::new(pattern)
            .map(NamePattern::Glob)
            .map_err(|e| RegisterError::BadPattern(pattern.to_string(), e.msg.to_string()))
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, NamePattern::Exact(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            NamePattern::Exact(s) => s,
            NamePattern::Glob(g) => g.as_str(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(s) => s == name,
            NamePattern::Glob(g) => g.matches(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(u64);

/// A claim on one service, returned by [`Registry::acquire`].
#[derive(Clone)]
pub struct ServiceHandle {
    index: usize,
    name: String,
    generation: u64,
    claim: u64,
    channel: Arc<ServiceChannel>,
}

impl ServiceHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<ServiceChannel> {
        &self.channel
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-service bookkeeping, as exposed to snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub descriptor: ServiceDescriptor,
    pub claim_count: u32,
    /// Pattern of the bound consumer, if any.
    pub consumer: Option<String>,
}

struct Consumer {
    id: ConsumerId,
    pattern: NamePattern,
    driver: Arc<dyn ServiceDriver>,
}

struct ServiceEntry {
    channel: Arc<ServiceChannel>,
    claim_count: u32,
    /// Id of the current claim; only a handle carrying it may release.
    claim: u64,
    bound: Option<ConsumerId>,
}

struct RegistryState {
    consumers: Vec<Consumer>,
    /// `None` until a table is published, and again after retraction.
    services: Option<Vec<ServiceEntry>>,
    generation: u64,
    next_id: u64,
    next_claim: u64,
}

impl RegistryState {
    /// Exact match first, then the earliest-registered glob.
    fn best_consumer(&self, name: &str) -> Option<&Consumer> {
        self.consumers
            .iter()
            .find(|c| c.pattern.is_exact() && c.pattern.matches(name))
            .or_else(|| {
                self.consumers
                    .iter()
                    .find(|c| !c.pattern.is_exact() && c.pattern.matches(name))
            })
    }

    fn consumer(&self, id: ConsumerId) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.id == id)
    }
}

/// Deferred callback, executed without the state lock.
enum Binding {
    Detach {
        driver: Arc<dyn ServiceDriver>,
        service: ServiceDescriptor,
    },
    Attach {
        id: ConsumerId,
        driver: Arc<dyn ServiceDriver>,
        service: ServiceDescriptor,
    },
}

pub struct Registry {
    state: Mutex<RegistryState>,
    /// Serializes planning and execution of binding work.
    binding: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                consumers: Vec::new(),
                services: None,
                generation: 0,
                next_id: 1,
                next_claim: 1,
            }),
            binding: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_binding(&self) -> MutexGuard<'_, ()> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plan attaches for unbound services whose best consumer passes `want`.
    fn plan_unbound(
        state: &RegistryState,
        want: impl Fn(usize, ConsumerId) -> bool,
    ) -> Vec<Binding> {
        let Some(services) = &state.services else {
            return Vec::new();
        };
        services
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.bound.is_none())
            .filter_map(|(index, entry)| {
                let desc = entry.channel.descriptor();
                let consumer = state.best_consumer(&desc.name)?;
                want(index, consumer.id).then(|| Binding::Attach {
                    id: consumer.id,
                    driver: consumer.driver.clone(),
                    service: desc.clone(),
                })
            })
            .collect()
    }

    fn set_bound(&self, generation: u64, index: usize, id: Option<ConsumerId>) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(entry) = state.services.as_mut().and_then(|s| s.get_mut(index)) {
            entry.bound = id;
        }
    }

    /// Run planned callbacks in order. Must hold the binding lock.
    fn execute(&self, generation: u64, plan: Vec<Binding>) {
        for binding in plan {
            match binding {
                Binding::Detach { driver, service } => {
                    log::debug!("detaching service {}", service.name);
                    driver.detach(&service);
                    self.set_bound(generation, service.index, None);
                }
                Binding::Attach { id, driver, service } => match driver.attach(&service) {
                    Ok(()) => {
                        log::debug!("service {} bound to consumer {:?}", service.name, id);
                        self.set_bound(generation, service.index, Some(id));
                    }
                    Err(reason) => {
                        log::warn!("consumer refused service {}: {}", service.name, reason);
                    }
                },
            }
        }
    }

    // ========== CONSUMERS ==========

    /// Register a consumer. If services are already published, matching
    /// unbound services are offered to it before this returns, and an exact
    /// consumer takes its service over from a glob consumer.
    pub fn register_consumer(
        &self,
        pattern: &str,
        driver: Arc<dyn ServiceDriver>,
    ) -> Result<ConsumerId, RegisterError> {
        let pattern = NamePattern::parse(pattern)?;
        let _binding = self.lock_binding();
        let (id, generation, plan) = {
            let mut state = self.lock();
            if pattern.is_exact() && state.consumers.iter().any(|c| c.pattern == pattern) {
                return Err(RegisterError::DuplicateConsumer(pattern.as_str().to_string()));
            }
            let id = ConsumerId(state.next_id);
            state.next_id += 1;
            log::debug!("registered consumer {:?} for {:?}", id, pattern);

            // An exact consumer takes its service from whichever glob holds it.
            let mut plan = Vec::new();
            let mut taken = Vec::new();
            if pattern.is_exact() {
                for (index, entry) in state.services.iter().flatten().enumerate() {
                    let desc = entry.channel.descriptor();
                    if !pattern.matches(&desc.name) {
                        continue;
                    }
                    if let Some(prev) = entry.bound.and_then(|b| state.consumer(b)) {
                        plan.push(Binding::Detach {
                            driver: prev.driver.clone(),
                            service: desc.clone(),
                        });
                        taken.push(index);
                    }
                }
            }
            for index in taken {
                if let Some(entry) = state.services.as_mut().and_then(|s| s.get_mut(index)) {
                    entry.bound = None;
                }
            }

            state.consumers.push(Consumer {
                id,
                pattern,
                driver,
            });
            plan.extend(Self::plan_unbound(&state, |_, best| best == id));
            (id, state.generation, plan)
        };
        self.execute(generation, plan);
        Ok(id)
    }

    /// Remove a consumer, detaching its services and offering them to the
    /// remaining consumers. Unknown ids are ignored.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        let _binding = self.lock_binding();
        let (generation, plan) = {
            let mut state = self.lock();
            let Some(pos) = state.consumers.iter().position(|c| c.id == id) else {
                return;
            };
            let consumer = state.consumers.remove(pos);
            log::debug!("unregistered consumer {:?}", id);
            let mut plan = Vec::new();
            let mut released = Vec::new();
            for (index, entry) in state.services.iter_mut().flatten().enumerate() {
                if entry.bound == Some(id) {
                    entry.bound = None;
                    released.push(index);
                    plan.push(Binding::Detach {
                        driver: consumer.driver.clone(),
                        service: entry.channel.descriptor().clone(),
                    });
                }
            }
            plan.extend(Self::plan_unbound(&state, |index, _| released.contains(&index)));
            (state.generation, plan)
        };
        self.execute(generation, plan);
    }

    // ========== TABLE LIFECYCLE ==========

    /// Install a freshly validated table and offer every service to its best
    /// consumer. Replaces any previous table without detaching it; callers
    /// retract first.
    pub fn publish(&self, channels: Vec<Arc<ServiceChannel>>) -> u64 {
        let _binding = self.lock_binding();
        let (generation, plan) = {
            let mut state = self.lock();
            state.generation += 1;
            state.services = Some(
                channels
                    .into_iter()
                    .map(|channel| ServiceEntry {
                        channel,
                        claim_count: 0,
                        claim: 0,
                        bound: None,
                    })
                    .collect(),
            );
            log::info!(
                "published {} services (generation {})",
                state.services.as_ref().map_or(0, Vec::len),
                state.generation
            );
            (state.generation, Self::plan_unbound(&state, |_, _| true))
        };
        self.execute(generation, plan);
        generation
    }

    /// Tear down the table: fail every channel, then detach bound consumers.
    /// Outstanding handles become stale. Returns the number of services
    /// retracted.
    pub fn retract_all(&self) -> usize {
        let _binding = self.lock_binding();
        let (services, plan) = {
            let mut state = self.lock();
            let Some(services) = state.services.take() else {
                return 0;
            };
            state.generation += 1;
            let plan: Vec<_> = services
                .iter()
                .filter_map(|entry| {
                    let consumer = state.consumer(entry.bound?)?;
                    Some((consumer.driver.clone(), entry.channel.descriptor().clone()))
                })
                .collect();
            (services, plan)
        };
        for entry in &services {
            entry.channel.disconnect();
        }
        for (driver, service) in plan {
            log::debug!("detaching service {}", service.name);
            driver.detach(&service);
        }
        log::info!("retracted {} services", services.len());
        services.len()
    }

    // ========== CLAIMS ==========

    pub fn acquire(&self, name: &str) -> Result<ServiceHandle, AcquireError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let generation = state.generation;
        let services = state.services.as_mut().ok_or(AcquireError::NotYetOnline)?;
        let entry = services
            .iter_mut()
            .find(|e| e.channel.name() == name)
            .ok_or_else(|| AcquireError::NotFound(name.to_string()))?;
        if entry.claim_count > 0 {
            return Err(AcquireError::AlreadyClaimed(name.to_string()));
        }
        let claim = state.next_claim;
        state.next_claim += 1;
        entry.claim_count = 1;
        entry.claim = claim;
        log::debug!("service {} acquired (claim {})", name, claim);
        Ok(ServiceHandle {
            index: entry.channel.index(),
            name: name.to_string(),
            generation,
            claim,
            channel: entry.channel.clone(),
        })
    }

    /// Drop the claim `handle` holds. A handle from a retracted table, or one
    /// whose claim was already released and re-acquired, is `Stale`.
    pub fn release(&self, handle: &ServiceHandle) -> Result<(), ReleaseError> {
        let mut state = self.lock();
        let generation = state.generation;
        let entry = state
            .services
            .as_mut()
            .filter(|_| generation == handle.generation)
            .and_then(|s| s.get_mut(handle.index));
        let Some(entry) = entry else {
            log::error!("release of stale handle for {}", handle.name);
            return Err(ReleaseError::Stale(handle.name.clone()));
        };
        if entry.claim_count == 0 {
            log::error!("release of unclaimed service {}", handle.name);
            return Err(ReleaseError::NotClaimed(handle.name.clone()));
        }
        if entry.claim != handle.claim {
            log::error!(
                "release of {} by claim {} while claim {} holds it",
                handle.name,
                handle.claim,
                entry.claim
            );
            return Err(ReleaseError::Stale(handle.name.clone()));
        }
        entry.claim_count -= 1;
        log::debug!("service {} released", handle.name);
        Ok(())
    }

    // ========== QUERIES ==========

    /// Number of services in the current table (0 when none is published).
    pub fn service_count(&self) -> usize {
        self.lock().services.as_ref().map_or(0, Vec::len)
    }

    pub fn is_published(&self) -> bool {
        self.lock().services.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn channel(&self, name: &str) -> Option<Arc<ServiceChannel>> {
        self.lock()
            .services
            .as_ref()?
            .iter()
            .find(|e| e.channel.name() == name)
            .map(|e| e.channel.clone())
    }

    pub fn channels(&self) -> Vec<Arc<ServiceChannel>> {
        self.lock()
            .services
            .iter()
            .flatten()
            .map(|e| e.channel.clone())
            .collect()
    }

    /// Consumer currently bound to `name`.
    pub fn bound_consumer(&self, name: &str) -> Option<ConsumerId> {
        self.lock()
            .services
            .as_ref()?
            .iter()
            .find(|e| e.channel.name() == name)?
            .bound
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        let state = self.lock();
        state
            .services
            .iter()
            .flatten()
            .map(|entry| ServiceInfo {
                descriptor: entry.channel.descriptor().clone(),
                claim_count: entry.claim_count,
                consumer: entry
                    .bound
                    .and_then(|id| state.consumer(id))
                    .map(|c| c.pattern.as_str().to_string()),
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::{Doorbell, Mailbox};
    use crate::region::SharedRegion;
    use crate::table::Region;

    #[derive(Default)]
    struct RecordingDriver {
        tag: &'static str,
        refuse: bool,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingDriver {
        fn new(tag: &'static str, events: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                refuse: false,
                events: events.clone(),
            })
        }
    }

    impl ServiceDriver for RecordingDriver {
        fn attach(&self, service: &ServiceDescriptor) -> Result<(), String> {
            if self.refuse {
                return Err("not interested".to_string());
            }
            self.events
                .lock()
                .unwrap()
                .push(format!("{}+{}", self.tag, service.name));
            Ok(())
        }

        fn detach(&self, service: &ServiceDescriptor) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}-{}", self.tag, service.name));
        }
    }

    fn channels(names: &[&str]) -> Vec<Arc<ServiceChannel>> {
        let bulk = Arc::new(SharedRegion::new("bulk", 0x1000));
        let doorbell: Arc<dyn Doorbell> = Arc::new(Mailbox::new());
        names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let desc = ServiceDescriptor {
                    index,
                    name: name.to_string(),
                    up: Region {
                        offset: 0x100,
                        slots: 1,
                        slot_size: 16,
                        ..Region::default()
                    },
                    down: Region::default(),
                };
                Arc::new(ServiceChannel::new(desc, bulk.clone(), doorbell.clone()))
            })
            .collect()
    }

    fn events(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_glob_matching() {
        let glob = |p: &str, n: &str| NamePattern::parse(p).unwrap().matches(n);
        assert!(glob("audio_*", "audio_output_control"));
        assert!(glob("*", ""));
        assert!(glob("a?c", "abc"));
        assert!(!glob("a?c", "ac"));
        assert!(glob("*_control", "audio_output_control"));
        assert!(glob("a*b*c", "axxbyyc"));
        assert!(!glob("a*b*c", "axxbyy"));
        assert!(glob("svc[0-9]", "svc7"));
        assert!(!glob("svc[!0-9]", "svc7"));
        assert!(glob("svc[!0-9]", "svcx"));
        assert!(glob("[]x]", "]"));
        assert!(glob("log/*", "log/a/b"));
        assert!(!glob("audio_*", "video_out"));
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(NamePattern::parse(""), Err(RegisterError::EmptyPattern));
        assert!(NamePattern::parse("audio_output_control").unwrap().is_exact());
        assert!(!NamePattern::parse("audio_*").unwrap().is_exact());
        assert!(!NamePattern::parse("svc[12]").unwrap().is_exact());
        assert_eq!(NamePattern::parse("svc[12]").unwrap().as_str(), "svc[12]");
        assert!(matches!(
            NamePattern::parse("a[b"),
            Err(RegisterError::BadPattern(p, _)) if p == "a[b"
        ));
    }

    #[test]
    fn test_bad_pattern_not_registered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry.publish(channels(&["a[b"]));
        assert!(matches!(
            registry.register_consumer("a[b", RecordingDriver::new("bad", &log)),
            Err(RegisterError::BadPattern(..))
        ));
        assert!(events(&log).is_empty());
        assert_eq!(registry.bound_consumer("a[b"), None);
    }

    #[test]
    fn test_acquire_release_cycle() {
        let registry = Registry::new();
        assert_eq!(
            registry.acquire("sensor").unwrap_err(),
            AcquireError::NotYetOnline
        );
        registry.publish(channels(&["sensor"]));
        let handle = registry.acquire("sensor").unwrap();
        assert_eq!(
            registry.acquire("sensor").unwrap_err(),
            AcquireError::AlreadyClaimed("sensor".into())
        );
        registry.release(&handle).unwrap();
        assert_eq!(
            registry.release(&handle),
            Err(ReleaseError::NotClaimed("sensor".into()))
        );
        let again = registry.acquire("sensor").unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(registry.release(&handle), Err(ReleaseError::Stale("sensor".into())));
        assert_eq!(
            registry.acquire("missing").unwrap_err(),
            AcquireError::NotFound("missing".into())
        );
    }

    #[test]
    fn test_released_handle_cannot_drop_new_claim() {
        let registry = Registry::new();
        registry.publish(channels(&["modem"]));
        let first = registry.acquire("modem").unwrap();
        let copy = first.clone();
        registry.release(&first).unwrap();
        let second = registry.acquire("modem").unwrap();

        assert_eq!(registry.release(&first), Err(ReleaseError::Stale("modem".into())));
        assert_eq!(registry.release(&copy), Err(ReleaseError::Stale("modem".into())));
        assert_eq!(
            registry.acquire("modem").unwrap_err(),
            AcquireError::AlreadyClaimed("modem".into())
        );
        assert_eq!(registry.services()[0].claim_count, 1);

        registry.release(&second).unwrap();
        assert!(registry.acquire("modem").is_ok());
    }

    #[test]
    fn test_exact_consumer_registered_after_glob_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register_consumer("audio_*", RecordingDriver::new("glob", &log))
            .unwrap();
        let exact = registry
            .register_consumer("audio_output_control", RecordingDriver::new("exact", &log))
            .unwrap();
        registry.publish(channels(&["audio_output_control"]));
        assert_eq!(events(&log), vec!["exact+audio_output_control"]);
        assert_eq!(registry.bound_consumer("audio_output_control"), Some(exact));
    }

    #[test]
    fn test_exact_consumer_takes_over_bound_service() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register_consumer("audio_*", RecordingDriver::new("glob", &log))
            .unwrap();
        registry.publish(channels(&["audio_output_control", "audio_input"]));
        let exact = registry
            .register_consumer("audio_output_control", RecordingDriver::new("exact", &log))
            .unwrap();
        assert_eq!(
            events(&log),
            vec![
                "glob+audio_output_control",
                "glob+audio_input",
                "glob-audio_output_control",
                "exact+audio_output_control",
            ]
        );
        assert_eq!(registry.bound_consumer("audio_output_control"), Some(exact));
    }

    #[test]
    fn test_first_glob_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        let first = registry
            .register_consumer("audio_*", RecordingDriver::new("first", &log))
            .unwrap();
        registry
            .register_consumer("*", RecordingDriver::new("second", &log))
            .unwrap();
        registry.publish(channels(&["audio_in", "modem"]));
        assert_eq!(events(&log), vec!["first+audio_in", "second+modem"]);
        assert_eq!(registry.bound_consumer("audio_in"), Some(first));
    }

    #[test]
    fn test_duplicate_exact_consumer_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register_consumer("modem", RecordingDriver::new("a", &log))
            .unwrap();
        assert_eq!(
            registry
                .register_consumer("modem", RecordingDriver::new("b", &log))
                .unwrap_err(),
            RegisterError::DuplicateConsumer("modem".into())
        );
        registry
            .register_consumer("mod*", RecordingDriver::new("c", &log))
            .unwrap();
        registry
            .register_consumer("mod*", RecordingDriver::new("d", &log))
            .unwrap();
    }

    #[test]
    fn test_refused_service_stays_unbound() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        let driver = Arc::new(RecordingDriver {
            tag: "picky",
            refuse: true,
            events: log.clone(),
        });
        registry.register_consumer("modem", driver).unwrap();
        registry.publish(channels(&["modem"]));
        assert_eq!(registry.bound_consumer("modem"), None);
        assert!(events(&log).is_empty());
    }

    #[test]
    fn test_unregister_rebinds_to_remaining_consumer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        let exact = registry
            .register_consumer("modem", RecordingDriver::new("exact", &log))
            .unwrap();
        let glob = registry
            .register_consumer("*", RecordingDriver::new("glob", &log))
            .unwrap();
        registry.publish(channels(&["modem"]));
        registry.unregister_consumer(exact);
        assert_eq!(
            events(&log),
            vec!["exact+modem", "exact-modem", "glob+modem"]
        );
        assert_eq!(registry.bound_consumer("modem"), Some(glob));
    }

    #[test]
    fn test_retract_all_detaches_and_invalidates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry
            .register_consumer("*", RecordingDriver::new("glob", &log))
            .unwrap();
        let chans = channels(&["a", "b"]);
        registry.publish(chans.clone());
        let handle = registry.acquire("a").unwrap();
        assert_eq!(registry.retract_all(), 2);
        assert_eq!(registry.service_count(), 0);
        assert!(chans.iter().all(|c| c.is_disconnected()));
        assert_eq!(
            events(&log),
            vec!["glob+a", "glob+b", "glob-a", "glob-b"]
        );
        assert_eq!(registry.release(&handle), Err(ReleaseError::Stale("a".into())));
        assert_eq!(registry.acquire("a").unwrap_err(), AcquireError::NotYetOnline);
        assert_eq!(registry.retract_all(), 0);
    }

    #[test]
    fn test_late_consumer_offered_existing_services() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new();
        registry.publish(channels(&["gps", "modem"]));
        registry
            .register_consumer("gps", RecordingDriver::new("late", &log))
            .unwrap();
        assert_eq!(events(&log), vec!["late+gps"]);
        let info = registry.services();
        assert_eq!(info[0].consumer.as_deref(), Some("gps"));
        assert_eq!(info[1].consumer, None);
    }

    struct Reentrant {
        registry: Arc<Registry>,
        claimed: Mutex<Option<ServiceHandle>>,
    }

    impl ServiceDriver for Reentrant {
        fn attach(&self, service: &ServiceDescriptor) -> Result<(), String> {
            let handle = self
                .registry
                .acquire(&service.name)
                .map_err(|e| e.to_string())?;
            *self.claimed.lock().unwrap() = Some(handle);
            Ok(())
        }
    }

    #[test]
    fn test_attach_may_acquire() {
        let registry = Arc::new(Registry::new());
        let driver = Arc::new(Reentrant {
            registry: registry.clone(),
            claimed: Mutex::new(None),
        });
        registry.register_consumer("modem", driver.clone()).unwrap();
        registry.publish(channels(&["modem"]));
        assert!(driver.claimed.lock().unwrap().is_some());
        assert_eq!(registry.services()[0].claim_count, 1);
    }
}
