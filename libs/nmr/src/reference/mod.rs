//! # References
//!
//! A [`Reference`] names "the endpoints matching some criterion" without
//! pinning concrete endpoints. It is stored as an exchange's target and
//! resolved by the flow registry at dispatch time.
//!
//! The matching variants ([`PropertyMatchingReference`],
//! [`FilterMatchingReference`], [`DynamicReference`]) scan the registry once,
//! memoize the result per registry instance and keep serving it until
//! [`CacheableReference::set_dirty`] is called. Membership is therefore stale
//! after registration changes unless the caller invalidates the reference,
//! e.g. from an [`EndpointListener`](crate::EndpointListener).
//!
//! Endpoints registered with `untargetable = true` are never chosen.

pub mod filter;

use crate::endpoint::{is_untargetable, InternalEndpoint};
use crate::endpoint_registry::EndpointRegistry;
use crate::service_registry::Properties;
use crate::NmrResult;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

pub use filter::Filter;

/// Resolved candidate set
pub type Candidates = Arc<Vec<Arc<InternalEndpoint>>>;

/// Resolves to the endpoints an exchange may be dispatched to
pub trait Reference: Send + Sync + fmt::Debug {
    fn choose(&self, registry: &EndpointRegistry) -> NmrResult<Candidates>;
}

/// Reference whose result is memoized until invalidated
pub trait CacheableReference: Reference {
    /// Drop the memoized result; the next `choose` rescans the registry
    fn set_dirty(&self);
}

#[derive(Default)]
struct MatchCache {
    cached: Mutex<Option<(Uuid, Candidates)>>,
}

impl MatchCache {
    fn get_or_scan<F>(&self, registry: &EndpointRegistry, matches: F) -> Candidates
    where
        F: Fn(&Arc<InternalEndpoint>, &Properties) -> bool,
    {
        let mut cached = self.cached.lock();
        if let Some((registry_id, candidates)) = cached.as_ref() {
            if *registry_id == registry.id() {
                return candidates.clone();
            }
        }

        let candidates: Candidates = Arc::new(
            registry
                .entries()
                .into_iter()
                .filter(|(endpoint, properties)| {
                    !is_untargetable(properties) && matches(endpoint, &**properties)
                })
                .map(|(endpoint, _)| endpoint)
                .collect(),
        );
        *cached = Some((registry.id(), candidates.clone()));
        candidates
    }

    fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

/// Every key of `wanted` equals the candidate's value for it
pub(crate) fn properties_match(wanted: &Properties, properties: &Properties) -> bool {
    wanted
        .iter()
        .all(|(key, value)| properties.get(key) == Some(value))
}

/// Matches endpoints whose metadata contains a fixed set of key/values
pub struct PropertyMatchingReference {
    properties: Properties,
    cache: MatchCache,
}

impl PropertyMatchingReference {
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            cache: MatchCache::default(),
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl Reference for PropertyMatchingReference {
    fn choose(&self, registry: &EndpointRegistry) -> NmrResult<Candidates> {
        Ok(self
            .cache
            .get_or_scan(registry, |_, props| properties_match(&self.properties, props)))
    }
}

impl CacheableReference for PropertyMatchingReference {
    fn set_dirty(&self) {
        self.cache.invalidate();
    }
}

impl fmt::Debug for PropertyMatchingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyMatchingReference")
            .field("properties", &self.properties)
            .finish()
    }
}

/// Matches endpoints whose metadata satisfies a filter expression
///
/// The expression is parsed on first use; a malformed expression fails every
/// `choose` with [`NmrError::InvalidFilter`](crate::NmrError::InvalidFilter).
pub struct FilterMatchingReference {
    expression: String,
    filter: OnceLock<NmrResult<Filter>>,
    cache: MatchCache,
}

impl FilterMatchingReference {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            filter: OnceLock::new(),
            cache: MatchCache::default(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn filter(&self) -> NmrResult<&Filter> {
        self.filter
            .get_or_init(|| Filter::parse(&self.expression))
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl Reference for FilterMatchingReference {
    fn choose(&self, registry: &EndpointRegistry) -> NmrResult<Candidates> {
        let filter = self.filter()?;
        Ok(self.cache.get_or_scan(registry, |_, props| filter.matches(props)))
    }
}

impl CacheableReference for FilterMatchingReference {
    fn set_dirty(&self) {
        self.cache.invalidate();
    }
}

impl fmt::Debug for FilterMatchingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterMatchingReference")
            .field("expression", &self.expression)
            .finish()
    }
}

type Predicate = dyn Fn(&InternalEndpoint, &Properties) -> bool + Send + Sync;

/// Matches endpoints accepted by a caller-supplied predicate
pub struct DynamicReference {
    predicate: Box<Predicate>,
    cache: MatchCache,
}

impl DynamicReference {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&InternalEndpoint, &Properties) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            cache: MatchCache::default(),
        }
    }
}

impl Reference for DynamicReference {
    fn choose(&self, registry: &EndpointRegistry) -> NmrResult<Candidates> {
        Ok(self
            .cache
            .get_or_scan(registry, |endpoint, props| (self.predicate)(&**endpoint, props)))
    }
}

impl CacheableReference for DynamicReference {
    fn set_dirty(&self) {
        self.cache.invalidate();
    }
}

impl fmt::Debug for DynamicReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicReference").finish_non_exhaustive()
    }
}

/// Fixed endpoint set, as returned by
/// [`EndpointRegistry::lookup`](crate::EndpointRegistry::lookup)
#[derive(Debug)]
pub struct EndpointsReference {
    endpoints: Candidates,
}

impl EndpointsReference {
    pub fn new(endpoints: Vec<Arc<InternalEndpoint>>) -> Self {
        Self {
            endpoints: Arc::new(endpoints),
        }
    }
}

impl Reference for EndpointsReference {
    fn choose(&self, _registry: &EndpointRegistry) -> NmrResult<Candidates> {
        Ok(self.endpoints.clone())
    }
}
