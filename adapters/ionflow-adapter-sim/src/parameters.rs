//! In-memory parameter store with history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ionflow_hal::{HalResult, ParameterMap, ParameterSource, ParameterValue};
use rustc_hash::FxHashMap;

/// One recorded value.
#[derive(Debug, Clone)]
struct Entry {
    timestamp: DateTime<Utc>,
    key: String,
    value: ParameterValue,
}

/// Latest value per key among entries at or before `until`.
fn resolve(entries: &[Entry], until: Option<DateTime<Utc>>) -> ParameterMap {
    let mut visible: Vec<&Entry> = entries
        .iter()
        .filter(|e| until.is_none_or(|until| e.timestamp <= until))
        .collect();
    visible.sort_by_key(|e| e.timestamp);

    let mut map = ParameterMap::new();
    for entry in visible {
        map.insert(entry.key.clone(), entry.value.clone());
    }
    map
}

/// Parameter store keeping every value ever set, so queries can be bounded
/// by a timestamp.
#[derive(Debug, Default)]
pub struct InMemoryParameterSource {
    globals: Mutex<Vec<Entry>>,
    locals: Mutex<FxHashMap<String, Vec<Entry>>>,
    global_queries: AtomicUsize,
    local_queries: AtomicUsize,
}

impl InMemoryParameterSource {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a global parameter now.
    pub fn set_global(&self, key: impl Into<String>, value: impl Into<ParameterValue>) {
        self.set_global_at(key, value, Utc::now());
    }

    /// Set a global parameter with an explicit timestamp.
    pub fn set_global_at(
        &self,
        key: impl Into<String>,
        value: impl Into<ParameterValue>,
        timestamp: DateTime<Utc>,
    ) {
        self.globals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Entry {
                timestamp,
                key: key.into(),
                value: value.into(),
            });
    }

    /// Set a parameter local to `namespace` now.
    pub fn set_local(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) {
        self.set_local_at(namespace, key, value, Utc::now());
    }

    /// Set a parameter local to `namespace` with an explicit timestamp.
    pub fn set_local_at(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<ParameterValue>,
        timestamp: DateTime<Utc>,
    ) {
        self.locals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(namespace.into())
            .or_default()
            .push(Entry {
                timestamp,
                key: key.into(),
                value: value.into(),
            });
    }

    /// Latest value of a global parameter.
    pub fn global(&self, key: &str) -> Option<ParameterValue> {
        let globals = self
            .globals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        resolve(&globals, None).remove(key)
    }

    /// Number of global queries served.
    pub fn global_query_count(&self) -> usize {
        self.global_queries.load(Ordering::SeqCst)
    }

    /// Number of local queries served.
    pub fn local_query_count(&self) -> usize {
        self.local_queries.load(Ordering::SeqCst)
    }

    /// Total queries served.
    pub fn query_count(&self) -> usize {
        self.global_query_count() + self.local_query_count()
    }
}

#[async_trait]
impl ParameterSource for InMemoryParameterSource {
    async fn global_parameters(&self, until: Option<DateTime<Utc>>) -> HalResult<ParameterMap> {
        self.global_queries.fetch_add(1, Ordering::SeqCst);
        let globals = self
            .globals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(resolve(&globals, until))
    }

    async fn local_parameters(
        &self,
        namespace: &str,
        until: Option<DateTime<Utc>>,
    ) -> HalResult<ParameterMap> {
        self.local_queries.fetch_add(1, Ordering::SeqCst);
        let locals = self
            .locals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(locals
            .get(namespace)
            .map(|entries| resolve(entries, until))
            .unwrap_or_default())
    }

    async fn set_shared(&self, id: &str, value: &ParameterValue) -> HalResult<()> {
        tracing::debug!(id, %value, "Set shared parameter");
        self.set_global(id, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_history_bounded_queries() {
        let source = InMemoryParameterSource::new();
        let t0 = Utc::now() - Duration::seconds(10);
        source.set_global_at("detuning", 1.0, t0);
        source.set_global_at("detuning", 2.0, t0 + Duration::seconds(5));

        let old = source
            .global_parameters(Some(t0 + Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(old["detuning"], ParameterValue::Float(1.0));

        let latest = source.global_parameters(None).await.unwrap();
        assert_eq!(latest["detuning"], ParameterValue::Float(2.0));

        let before = source
            .global_parameters(Some(t0 - Duration::seconds(1)))
            .await
            .unwrap();
        assert!(before.is_empty());
        assert_eq!(source.global_query_count(), 3);
    }

    #[tokio::test]
    async fn test_locals_are_namespaced() {
        let source = InMemoryParameterSource::new();
        source.set_local("experiments.Rabi", "amp", 0.3);
        source.set_local("experiments.Ramsey", "amp", 0.7);

        let rabi = source.local_parameters("experiments.Rabi", None).await.unwrap();
        assert_eq!(rabi["amp"], ParameterValue::Float(0.3));
        let other = source.local_parameters("experiments.Other", None).await.unwrap();
        assert!(other.is_empty());
        assert_eq!(source.local_query_count(), 2);
    }

    #[tokio::test]
    async fn test_set_shared_is_visible_as_global() {
        let source = InMemoryParameterSource::new();
        source
            .set_shared("mode", &ParameterValue::Text("fast".into()))
            .await
            .unwrap();
        assert_eq!(source.global("mode"), Some(ParameterValue::Text("fast".into())));
        assert_eq!(source.query_count(), 0);
    }
}
