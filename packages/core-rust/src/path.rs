//! Dispatch-path parsing for `namespace.service.function` routing keys.
//!
//! The routing key convention is `<namespace>.<serviceName>.<function path>`
//! where the function path may itself contain dots. The leading namespace
//! segment is an addressing concern only and is stripped before resolution;
//! the service name selects a top-level subtree and the remaining segments
//! locate a callable within it.

/// A parsed dispatch path, split into its addressing components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPath {
    service_name: String,
    function_path: String,
}

impl DispatchPath {
    /// Parses a full routing key, stripping the leading namespace segment.
    ///
    /// `fpp.math.vector.add` parses to service `math`, function
    /// `vector.add`. Degenerate keys parse to empty components rather than
    /// panicking; resolution rejects them downstream.
    #[must_use]
    pub fn parse(routing_key: &str) -> Self {
        let stripped = match routing_key.split_once('.') {
            Some((_namespace, rest)) => rest,
            None => "",
        };

        let (service_name, function_path) = match stripped.split_once('.') {
            Some((service, function)) => (service, function),
            None => (stripped, ""),
        };

        Self {
            service_name: service_name.to_string(),
            function_path: function_path.to_string(),
        }
    }

    /// The service name: the first segment after the namespace.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The dot-separated path to a callable within the service subtree.
    #[must_use]
    pub fn function_path(&self) -> &str {
        &self.function_path
    }

    /// Iterates the function path's segments. Empty paths yield nothing.
    pub fn function_segments(&self) -> impl Iterator<Item = &str> {
        self.function_path.split('.').filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_service_function() {
        let path = DispatchPath::parse("fpp.math.add");
        assert_eq!(path.service_name(), "math");
        assert_eq!(path.function_path(), "add");
    }

    #[test]
    fn function_path_keeps_inner_dots() {
        let path = DispatchPath::parse("fpp.math.vector.add");
        assert_eq!(path.service_name(), "math");
        assert_eq!(path.function_path(), "vector.add");
        assert_eq!(
            path.function_segments().collect::<Vec<_>>(),
            vec!["vector", "add"]
        );
    }

    #[test]
    fn missing_function_path_is_empty() {
        let path = DispatchPath::parse("fpp.math");
        assert_eq!(path.service_name(), "math");
        assert_eq!(path.function_path(), "");
        assert_eq!(path.function_segments().count(), 0);
    }

    #[test]
    fn bare_namespace_parses_to_empty_components() {
        let path = DispatchPath::parse("fpp");
        assert_eq!(path.service_name(), "");
        assert_eq!(path.function_path(), "");
    }

    #[test]
    fn empty_key_parses_to_empty_components() {
        let path = DispatchPath::parse("");
        assert_eq!(path.service_name(), "");
        assert_eq!(path.function_path(), "");
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn segment() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9_]{0,8}"
        }

        proptest! {
            /// Parsing recovers the exact service/function split for any
            /// well-formed routing key.
            #[test]
            fn parse_recovers_segments(
                namespace in segment(),
                service in segment(),
                function in prop::collection::vec(segment(), 1..4),
            ) {
                let key = format!("{namespace}.{service}.{}", function.join("."));
                let path = DispatchPath::parse(&key);

                prop_assert_eq!(path.service_name(), service.as_str());
                let joined_function = function.join(".");
                prop_assert_eq!(path.function_path(), joined_function.as_str());
            }
        }
    }
}
