use crate::error::AppError;
use crate::options::WriteOptions;
use crate::schema::TableSchema;
use crate::settings::StoreSettings;
use crate::table::Table;
use crate::transaction::Transaction;
use crate::{debug, info};
use redb::Database;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::{env, fs};

struct StoreInner {
    db: Arc<Database>,
    catalog: RwLock<HashMap<String, Arc<TableSchema>>>,
    settings: StoreSettings,
    next_tx: AtomicU64,
}

/// A redb database plus the catalog of tables defined on it.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(settings: &StoreSettings) -> Result<Store, AppError> {
        let path = PathBuf::from(&settings.db_path);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let db = Database::builder()
            .set_cache_size(settings.db_cache_size_mb * 1024 * 1024)
            .create(&path)?;
        info!("Opened store {} with {}MB cache, batch policy {}", path.display(), settings.db_cache_size_mb, settings.batch_policy);
        Ok(Store {
            inner: Arc::new(StoreInner {
                db: Arc::new(db),
                catalog: RwLock::new(HashMap::new()),
                settings: settings.clone(),
                next_tx: AtomicU64::new(1),
            }),
        })
    }

    /// Fresh store under the system temp dir, named `name` plus a random suffix.
    pub fn temp(name: &str) -> Result<Store, AppError> {
        let db_dir = env::temp_dir().join("redupsert").join(format!("{}_{}", name, rand::random::<u64>()));
        if db_dir.exists() {
            fs::remove_dir_all(&db_dir)?;
        }
        let settings = StoreSettings {
            db_path: db_dir.join("store.redb").to_string_lossy().into_owned(),
            ..StoreSettings::default()
        };
        Self::open(&settings)
    }

    pub fn settings(&self) -> &StoreSettings { &self.inner.settings }

    pub(crate) fn db(&self) -> &Database { &self.inner.db }

    pub fn schema(&self, table: &str) -> Result<Option<Arc<TableSchema>>, AppError> {
        Ok(self.inner.catalog.read()?.get(table).cloned())
    }

    /// Registers a table. Tables referenced by foreign keys must be defined first.
    pub fn define(&self, schema: TableSchema) -> Result<Table, AppError> {
        let mut catalog = self.inner.catalog.write()?;
        if catalog.contains_key(schema.name()) {
            return Err(AppError::schema(schema.name(), "table is already defined"));
        }
        for (col, target) in schema.foreign_keys() {
            let pk_len = if target == schema.name() {
                schema.primary_key().columns().len()
            } else {
                match catalog.get(target) {
                    Some(referenced) => referenced.primary_key().columns().len(),
                    None => return Err(AppError::schema(schema.name(), format!("`{}` references undefined table `{}`", col.name(), target))),
                }
            };
            if pk_len != 1 {
                return Err(AppError::schema(schema.name(), format!("`{}` references `{}` which has a composite primary key", col.name(), target)));
            }
        }
        let schema = Arc::new(schema);
        catalog.insert(schema.name().to_string(), schema.clone());
        debug!("Defined table {} with {} columns", schema.name(), schema.columns().len());
        Ok(Table::new(self.clone(), schema))
    }

    pub async fn begin(&self) -> Result<Transaction, AppError> {
        self.begin_with(WriteOptions::default()).await
    }

    /// Opens a write transaction off the async threads, redb allows one writer at a time.
    pub async fn begin_with(&self, options: WriteOptions) -> Result<Transaction, AppError> {
        let db = Arc::clone(&self.inner.db);
        let tx = tokio::task::spawn_blocking(move || -> Result<redb::WriteTransaction, AppError> {
            let mut tx = db.begin_write()?;
            if let Some(durability) = options.durability {
                tx.set_durability(durability).map_err(|e| AppError::Custom(e.to_string()))?;
            }
            Ok(tx)
        })
        .await??;
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        debug!("transaction {} started", id);
        Ok(Transaction::new(id, tx))
    }

    /// Runs `f` in a new transaction, committing on `Ok` and rolling back on `Err`.
    pub async fn run_in_transaction<F, Fut, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let tx = self.begin().await?;
        match f(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    crate::warn!("rollback of transaction {} failed: {}", tx.id(), rollback_err);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use crate::test_utils;

    #[test]
    fn foreign_keys_need_defined_single_column_targets() {
        let store = test_utils::temp_store("define");
        let orphan = TableSchema::builder("bar")
            .column(ColumnDef::new("id", ColumnType::Text).primary_key())
            .column(ColumnDef::new("foo_id", ColumnType::Text).references("foo"))
            .build()
            .unwrap();
        assert!(matches!(store.define(orphan), Err(AppError::SchemaMismatch { .. })));

        let composite = TableSchema::builder("foo")
            .column(ColumnDef::new("a", ColumnType::Text).primary_key())
            .column(ColumnDef::new("b", ColumnType::Text).primary_key())
            .build()
            .unwrap();
        store.define(composite).unwrap();
        let bar = TableSchema::builder("bar")
            .column(ColumnDef::new("id", ColumnType::Text).primary_key())
            .column(ColumnDef::new("foo_id", ColumnType::Text).references("foo"))
            .build()
            .unwrap();
        assert!(matches!(store.define(bar), Err(AppError::SchemaMismatch { .. })));
        assert!(store.schema("foo").unwrap().is_some());
    }

    #[test]
    fn tables_are_defined_once() {
        let store = test_utils::temp_store("define_twice");
        store.define(test_utils::foo_schema()).unwrap();
        assert!(matches!(store.define(test_utils::foo_schema()), Err(AppError::SchemaMismatch { .. })));
    }

    #[tokio::test]
    async fn run_in_transaction_commits_or_rolls_back() {
        let store = test_utils::temp_store("run_in_tx");
        let value = store.run_in_transaction(|tx| async move { Ok(tx.id()) }).await.unwrap();
        assert!(value > 0);

        let leaked = std::sync::Arc::new(std::sync::Mutex::new(None));
        let slot = leaked.clone();
        let result: Result<(), AppError> = store
            .run_in_transaction(|tx| async move {
                *slot.lock().unwrap() = Some(tx);
                Err(AppError::Custom("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        let tx = leaked.lock().unwrap().take().unwrap();
        assert!(!tx.is_active());
    }
}
