use crate::domain::errors::StoreError;
use crate::domain::events::EngineEvent;
use crate::domain::portfolio::Portfolio;
use crate::domain::repositories::{PortfolioMutator, PortfolioStore};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory [`PortfolioStore`] for tests and hedger fleets that need no
/// durability. Same contract as the file store, including event emission.
pub struct InMemoryPortfolioStore {
    portfolios: Mutex<HashMap<String, Portfolio>>,
    bus: EventBus,
}

impl InMemoryPortfolioStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            portfolios: Mutex::new(HashMap::new()),
            bus,
        }
    }
}

#[async_trait]
impl PortfolioStore for InMemoryPortfolioStore {
    async fn load(&self, id: &str) -> Result<Portfolio, StoreError> {
        self.portfolios
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn list(&self) -> Result<Vec<Portfolio>, StoreError> {
        let mut portfolios: Vec<Portfolio> =
            self.portfolios.lock().await.values().cloned().collect();
        portfolios.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(portfolios)
    }

    async fn create(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError> {
        let mut portfolios = self.portfolios.lock().await;
        if portfolios.contains_key(&portfolio.id) {
            return Err(StoreError::Conflict {
                id: portfolio.id.clone(),
            });
        }
        portfolios.insert(portfolio.id.clone(), portfolio.clone());
        drop(portfolios);
        self.bus.publish(EngineEvent::PortfolioUpdated {
            id: portfolio.id.clone(),
            portfolio: Box::new(portfolio.clone()),
        });
        Ok(portfolio)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.portfolios.lock().await.remove(id);
        if removed.is_none() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        self.bus
            .publish(EngineEvent::PortfolioDeleted { id: id.to_string() });
        Ok(())
    }

    async fn save(&self, id: &str, mutator: PortfolioMutator) -> Result<Portfolio, StoreError> {
        let mut portfolios = self.portfolios.lock().await;
        let portfolio = portfolios
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        mutator(portfolio);

        let now = Utc::now();
        portfolio.updated_at = if now > portfolio.updated_at {
            now
        } else {
            portfolio.updated_at + chrono::Duration::milliseconds(1)
        };

        let snapshot = portfolio.clone();
        drop(portfolios);
        self.bus.publish(EngineEvent::PortfolioUpdated {
            id: id.to_string(),
            portfolio: Box::new(snapshot.clone()),
        });
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn save_on_missing_portfolio_is_not_found() {
        let store = InMemoryPortfolioStore::new(EventBus::new());
        let err = store.save("nope", Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn every_mutation_emits_exactly_one_event() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let store = InMemoryPortfolioStore::new(bus.clone());

        store
            .create(Portfolio::new("p1", "ETH", dec!(10)))
            .await
            .unwrap();
        store
            .save("p1", Box::new(|p| p.balance = dec!(11)))
            .await
            .unwrap();
        store.delete("p1").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortfolioUpdated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortfolioUpdated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortfolioDeleted { .. }
        ));
        assert!(events.try_recv().is_err());
    }
}
