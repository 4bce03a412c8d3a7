use crate::domain::errors::StoreError;
use crate::domain::portfolio::Portfolio;
use async_trait::async_trait;

/// A mutation applied to a portfolio under the store's per-id lock.
pub type PortfolioMutator = Box<dyn FnOnce(&mut Portfolio) + Send>;

/// Authoritative portfolio state. Transactional single-writer per portfolio:
/// every mutation goes through [`PortfolioStore::save`], which serializes
/// per id, bumps `updated_at` monotonically, persists, and emits
/// `portfolio_updated` on the engine bus.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Portfolio, StoreError>;

    async fn list(&self) -> Result<Vec<Portfolio>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the id already exists.
    async fn create(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Apply `mutator` under an exclusive per-portfolio lock and persist the
    /// result. Returns the new state.
    async fn save(&self, id: &str, mutator: PortfolioMutator) -> Result<Portfolio, StoreError>;
}
