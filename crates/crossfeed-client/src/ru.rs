//! Request unit accounting for one logical operation

use tokio::sync::Mutex;

/// Running total of request units consumed by one operation
///
/// Partition tasks add their page charges concurrently. Every addition is
/// serialized so no increment is lost. The cap itself is enforced by the
/// caller, which compares [`RuConsumedManager::current`] with its budget.
#[derive(Debug, Default)]
pub struct RuConsumedManager {
    total: Mutex<f64>,
}

impl RuConsumedManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> f64 {
        *self.total.lock().await
    }

    /// Add `amount` and return the new total
    ///
    /// Negative or non-finite amounts are ignored so the total never
    /// decreases.
    pub async fn add(&self, amount: f64) -> f64 {
        let mut total = self.total.lock().await;
        if amount.is_finite() && amount >= 0.0 {
            *total += amount;
        } else {
            tracing::warn!(amount, "Ignoring invalid request charge");
        }
        *total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_accumulates() {
        let ru = RuConsumedManager::new();
        assert_eq!(ru.current().await, 0.0);
        assert_eq!(ru.add(2.5).await, 2.5);
        assert_eq!(ru.add(4.0).await, 6.5);
        assert_eq!(ru.current().await, 6.5);
    }

    #[tokio::test]
    async fn test_invalid_amounts_ignored() {
        let ru = RuConsumedManager::new();
        ru.add(10.0).await;
        ru.add(-3.0).await;
        ru.add(f64::NAN).await;
        ru.add(f64::INFINITY).await;
        assert_eq!(ru.current().await, 10.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_are_not_lost() {
        let ru = Arc::new(RuConsumedManager::new());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let ru = ru.clone();
            tasks.spawn(async move {
                ru.add(1.0).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert_eq!(ru.current().await, 100.0);
    }
}
