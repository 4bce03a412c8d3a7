use crate::domain::errors::StoreError;
use crate::domain::events::EngineEvent;
use crate::domain::portfolio::Portfolio;
use crate::domain::repositories::{PortfolioMutator, PortfolioStore};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema: u32,
    portfolio: Portfolio,
}

/// Reference [`PortfolioStore`]: one JSON file per portfolio keyed by id,
/// versioned snapshots, atomic rename on save, and an exclusive per-id lock
/// serializing writers.
pub struct FilePortfolioStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bus: EventBus,
}

impl FilePortfolioStore {
    pub async fn open(dir: impl Into<PathBuf>, bus: EventBus) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!("portfolio store at {:?}", dir);
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
            bus,
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    async fn read_snapshot(&self, id: &str) -> Result<Portfolio, StoreError> {
        let path = self.path_for(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.schema > SCHEMA_VERSION {
            return Err(StoreError::Corrupt {
                reason: format!("unsupported schema {} in {path:?}", snapshot.schema),
            });
        }
        Ok(snapshot.portfolio)
    }

    async fn write_snapshot(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            schema: SCHEMA_VERSION,
            portfolio: portfolio.clone(),
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        let path = self.path_for(&portfolio.id);
        // Atomic save: write a sibling temp file, then rename over.
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }
}

/// Portfolio ids become file names; restrict them accordingly.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::Corrupt {
            reason: format!("invalid portfolio id: '{id}'"),
        })
    }
}

#[async_trait]
impl PortfolioStore for FilePortfolioStore {
    async fn load(&self, id: &str) -> Result<Portfolio, StoreError> {
        validate_id(id)?;
        self.read_snapshot(id).await
    }

    async fn list(&self) -> Result<Vec<Portfolio>, StoreError> {
        let mut portfolios = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_snapshot(id).await {
                Ok(portfolio) => portfolios.push(portfolio),
                // A bad file must not take down listing for the rest.
                Err(e) => warn!("skipping unreadable portfolio {id}: {e}"),
            }
        }
        portfolios.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(portfolios)
    }

    async fn create(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError> {
        validate_id(&portfolio.id)?;
        let lock = self.lock_for(&portfolio.id).await;
        let _guard = lock.lock().await;

        if exists(&self.path_for(&portfolio.id)).await {
            return Err(StoreError::Conflict {
                id: portfolio.id.clone(),
            });
        }
        self.write_snapshot(&portfolio).await?;
        self.bus.publish(EngineEvent::PortfolioUpdated {
            id: portfolio.id.clone(),
            portfolio: Box::new(portfolio.clone()),
        });
        Ok(portfolio)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => {
                self.bus
                    .publish(EngineEvent::PortfolioDeleted { id: id.to_string() });
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, id: &str, mutator: PortfolioMutator) -> Result<Portfolio, StoreError> {
        validate_id(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut portfolio = self.read_snapshot(id).await?;
        mutator(&mut portfolio);

        // `updated_at` must be strictly monotonic even under bursts of saves
        // within one clock millisecond.
        let now = Utc::now();
        portfolio.updated_at = if now > portfolio.updated_at {
            now
        } else {
            portfolio.updated_at + chrono::Duration::milliseconds(1)
        };

        self.write_snapshot(&portfolio).await?;
        self.bus.publish(EngineEvent::PortfolioUpdated {
            id: id.to_string(),
            portfolio: Box::new(portfolio.clone()),
        });
        Ok(portfolio)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
