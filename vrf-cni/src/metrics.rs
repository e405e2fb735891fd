use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("vrf_cni")));

#[derive(Clone, Debug, Default)]
pub struct PodMetrics {
    pub pod_adds: Counter,
    pub pod_dels: Counter,
    pub pod_add_failures: Counter,
    pub active_pods: Gauge,
}

impl PodMetrics {
    /// Register pod metrics in `r` to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("pod_adds", "Number of pods wired", self.pod_adds.clone());
        r.register("pod_dels", "Number of pods removed", self.pod_dels.clone());
        r.register(
            "pod_add_failures",
            "Number of pod adds rolled back",
            self.pod_add_failures.clone(),
        );
        r.register(
            "active_pods",
            "Number of pods currently wired",
            self.active_pods.clone(),
        );
        self
    }

    /// Pod metrics registered in the global [`REGISTRY`].
    pub fn global() -> Self {
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        Self::default().register(&mut registry)
    }
}

pub fn encode_text() -> String {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(_) => buffer,
        Err(_) => "".into(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registered_counters_are_encoded() {
        let mut registry = Registry::with_prefix("vrf_cni");
        let metrics = PodMetrics::default().register(&mut registry);
        metrics.pod_adds.inc();
        metrics.active_pods.set(3);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("vrf_cni_pod_adds_total 1"));
        assert!(out.contains("vrf_cni_active_pods 3"));
    }
}
