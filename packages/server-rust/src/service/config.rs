/// Default RPC namespace: exchange name and leading routing-key segment.
pub const DEFAULT_NAMESPACE: &str = "fpp";

/// Configuration for a [`Service`](super::Service).
///
/// The namespace names the topic exchange and prefixes every routing key,
/// so two namespaces on one broker never see each other's traffic.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// RPC namespace, e.g. `fpp` in `fpp.math.add`.
    pub namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_namespace_is_fpp() {
        assert_eq!(ServiceConfig::default().namespace, "fpp");
    }
}
