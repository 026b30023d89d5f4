//! Path resolution: locating a callable in the flattened handler tree.

use busrpc_core::DispatchPath;

use super::tree::{HandlerFn, HandlerNode, HandlerTree};

/// Resolution failure: the dot-path does not name a callable.
///
/// Raised whether an intermediate segment is missing, the terminal node is a
/// namespace rather than a callable, or the path tries to descend into a
/// callable. Carries both path halves for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("function {function_name} does not exist in service {service_name}")]
pub struct HandlerNotFound {
    /// First segment of the dispatch path (after the namespace).
    pub service_name: String,
    /// Remaining dot-separated function path.
    pub function_name: String,
}

/// Finds the callable the dispatch path points at.
///
/// The service name selects a top-level entry; the function segments walk
/// down from there. A top-level callable with an empty function path is a
/// valid target.
///
/// # Errors
///
/// Returns [`HandlerNotFound`] when the walk ends anywhere but a callable.
pub fn resolve<'a>(
    tree: &'a HandlerTree,
    path: &DispatchPath,
) -> Result<&'a HandlerFn, HandlerNotFound> {
    let mut node = tree.get(path.service_name());

    for segment in path.function_segments() {
        node = match node {
            Some(HandlerNode::Tree(sub)) => sub.get(segment),
            // Missing node, or an attempt to descend into a callable.
            _ => None,
        };
    }

    match node {
        Some(HandlerNode::Callable(f)) => Ok(f),
        _ => Err(HandlerNotFound {
            service_name: path.service_name().to_string(),
            function_name: path.function_path().to_string(),
        }),
    }
}
