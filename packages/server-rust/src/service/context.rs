//! Ambient transaction context, scoped per invocation.
//!
//! Each inbound call executes inside a task-local scope carrying its
//! transaction id, so deeply nested handler code can read the ambient id
//! without it being threaded through every signature. Task-locals follow
//! control flow through asynchronous continuations, so two interleaved
//! invocations never observe each other's id — isolation holds across
//! await points, not just across threads. This is deliberately not a
//! global: the scope exists only for the lifetime of one invocation.

use std::future::Future;

tokio::task_local! {
    static TRANSACTION_ID: Option<String>;
}

/// Runs `fut` inside a scope where [`current_transaction_id`] yields `id`.
///
/// Scopes are re-entrant: a nested call shadows the outer id for the inner
/// future's duration only.
pub async fn with_transaction<F>(id: Option<String>, fut: F) -> F::Output
where
    F: Future,
{
    TRANSACTION_ID.scope(id, fut).await
}

/// Reads the ambient transaction id, if the caller is inside a scope.
#[must_use]
pub fn current_transaction_id() -> Option<String> {
    TRANSACTION_ID.try_with(Clone::clone).ok().flatten()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unscoped_code_sees_no_transaction() {
        assert_eq!(current_transaction_id(), None);
    }

    #[tokio::test]
    async fn scope_exposes_the_id() {
        let seen = with_transaction(Some("txn-1".to_string()), async {
            current_transaction_id()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("txn-1"));
    }

    #[tokio::test]
    async fn id_survives_await_points() {
        let seen = with_transaction(Some("txn-2".to_string()), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mid = current_transaction_id();
            tokio::time::sleep(Duration::from_millis(5)).await;
            (mid, current_transaction_id())
        })
        .await;

        assert_eq!(seen.0.as_deref(), Some("txn-2"));
        assert_eq!(seen.1.as_deref(), Some("txn-2"));
    }

    #[tokio::test]
    async fn nested_scopes_shadow_and_restore() {
        with_transaction(Some("outer".to_string()), async {
            assert_eq!(current_transaction_id().as_deref(), Some("outer"));

            with_transaction(Some("inner".to_string()), async {
                assert_eq!(current_transaction_id().as_deref(), Some("inner"));
            })
            .await;

            assert_eq!(current_transaction_id().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_scopes_never_cross_contaminate() {
        // Two invocations that read their ambient id after artificial
        // delays arranged so their executions interleave.
        let a = tokio::spawn(with_transaction(Some("txn-a".to_string()), async {
            let mut seen = Vec::new();
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(3)).await;
                seen.push(current_transaction_id());
            }
            seen
        }));
        let b = tokio::spawn(with_transaction(Some("txn-b".to_string()), async {
            let mut seen = Vec::new();
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                seen.push(current_transaction_id());
            }
            seen
        }));

        let (seen_a, seen_b) = (a.await.unwrap(), b.await.unwrap());
        assert!(seen_a.iter().all(|id| id.as_deref() == Some("txn-a")));
        assert!(seen_b.iter().all(|id| id.as_deref() == Some("txn-b")));
    }

    #[tokio::test]
    async fn absent_id_is_scoped_as_none() {
        let seen = with_transaction(None, async { current_transaction_id() }).await;
        assert_eq!(seen, None);
    }
}
