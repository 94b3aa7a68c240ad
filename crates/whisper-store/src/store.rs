//! The encrypted KV store interface (§4.8) and a filesystem-backed
//! reference implementation.
//!
//! The core only specifies this as an interface — `whisper-core` never
//! depends on this crate. [`FsStore`] is the reference implementation an
//! embedding application can use as-is or replace entirely, in the same
//! spirit as `connection::channel`'s loopback test doubles standing in for
//! a real peer connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::kdf;
use crate::record::Record;

/// The five tables §4.8 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Check,
    Keys,
    Connections,
    History,
    Cache,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Check => "check",
            Table::Keys => "keys",
            Table::Connections => "connections",
            Table::History => "history",
            Table::Cache => "cache",
        }
    }

    const ALL: [Table; 5] = [Table::Check, Table::Keys, Table::Connections, Table::History, Table::Cache];
}

/// A verbatim dump of every table's encrypted records, keyed by table hash
/// (§4.8 `{ table_hash: [records] }`). `restore` accepts this unchanged.
pub type Dump = HashMap<String, Vec<Record>>;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn set(&self, table: Table, id: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, table: Table, id: &str) -> Result<Option<Vec<u8>>>;
    async fn get_all(&self, table: Table) -> Result<Vec<Vec<u8>>>;
    async fn delete(&self, table: Table, id: &str) -> Result<()>;
    async fn clear(&self, table: Table) -> Result<()>;
    async fn dump(&self) -> Result<Dump>;
    async fn restore(&self, dump: Dump) -> Result<()>;
}

const CHECK_RECORD_ID: &str = "check";
const CHECK_RECORD_VALUE: &[u8] = b"whisper-store-password-check";

type TableMap = HashMap<String, Record>;

/// A directory of `<table_hash>.json` files, one per table, each holding
/// its records as a JSON array.
pub struct FsStore {
    dir: PathBuf,
    password: String,
    tables: Mutex<HashMap<Table, TableMap>>,
}

impl FsStore {
    /// Load (or initialize) the store at `dir` under `password`. Fails with
    /// [`Error::StoreLocked`] if a prior `check` record exists and doesn't
    /// open under this password (§4.8, §7 `StoreLocked`).
    pub async fn open(dir: impl AsRef<Path>, password: impl Into<String>) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let password = password.into();

        let mut tables = HashMap::new();
        for table in Table::ALL {
            tables.insert(table, load_table(&dir, table).await?);
        }

        let store = Arc::new(Self { dir, password, tables: Mutex::new(tables) });
        store.verify_or_establish_check_record().await?;
        Ok(store)
    }

    async fn verify_or_establish_check_record(&self) -> Result<()> {
        match self.get(Table::Check, CHECK_RECORD_ID).await {
            Ok(Some(value)) => {
                if value != CHECK_RECORD_VALUE {
                    return Err(Error::StoreCorrupt);
                }
                Ok(())
            }
            Ok(None) => self.set(Table::Check, CHECK_RECORD_ID, CHECK_RECORD_VALUE).await,
            Err(err) => Err(err),
        }
    }

    async fn persist(&self, table: Table) -> Result<()> {
        let tables = self.tables.lock().await;
        let records: Vec<&Record> = tables.get(&table).map(|t| t.values().collect()).unwrap_or_default();
        let json = serde_json::to_vec_pretty(&records)?;
        fs::write(table_path(&self.dir, table), json).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn set(&self, table: Table, id: &str, value: &[u8]) -> Result<()> {
        let record = Record::seal(kdf::hash_id(id), value, &self.password)?;
        {
            let mut tables = self.tables.lock().await;
            tables.entry(table).or_default().insert(record.id_hash.clone(), record);
        }
        self.persist(table).await
    }

    async fn get(&self, table: Table, id: &str) -> Result<Option<Vec<u8>>> {
        let id_hash = kdf::hash_id(id);
        let record = {
            let tables = self.tables.lock().await;
            tables.get(&table).and_then(|t| t.get(&id_hash)).cloned()
        };
        match record {
            Some(record) => Ok(Some(record.open(&self.password)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self, table: Table) -> Result<Vec<Vec<u8>>> {
        let records: Vec<Record> = {
            let tables = self.tables.lock().await;
            tables.get(&table).map(|t| t.values().cloned().collect()).unwrap_or_default()
        };
        records.iter().map(|record| record.open(&self.password)).collect()
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let id_hash = kdf::hash_id(id);
        {
            let mut tables = self.tables.lock().await;
            if let Some(t) = tables.get_mut(&table) {
                t.remove(&id_hash);
            }
        }
        self.persist(table).await
    }

    async fn clear(&self, table: Table) -> Result<()> {
        {
            let mut tables = self.tables.lock().await;
            tables.entry(table).or_default().clear();
        }
        self.persist(table).await
    }

    async fn dump(&self) -> Result<Dump> {
        let tables = self.tables.lock().await;
        Ok(Table::ALL
            .into_iter()
            .map(|table| (kdf::hash_id(table.name()), tables.get(&table).map(|t| t.values().cloned().collect()).unwrap_or_default()))
            .collect())
    }

    /// Move the dumped records back in verbatim — no decryption, no
    /// re-encryption (§8 invariant 8: `restore(dump(kv)) == kv` bytewise).
    async fn restore(&self, dump: Dump) -> Result<()> {
        let mut tables = HashMap::new();
        for table in Table::ALL {
            let records = dump.get(&kdf::hash_id(table.name())).cloned().unwrap_or_default();
            tables.insert(table, records.into_iter().map(|r| (r.id_hash.clone(), r)).collect());
        }
        *self.tables.lock().await = tables;
        for table in Table::ALL {
            self.persist(table).await?;
        }
        Ok(())
    }
}

fn table_path(dir: &Path, table: Table) -> PathBuf {
    dir.join(format!("{}.json", kdf::hash_id(table.name())))
}

async fn load_table(dir: &Path, table: Table) -> Result<TableMap> {
    let path = table_path(dir, table);
    match fs::read(&path).await {
        Ok(bytes) => {
            let records: Vec<Record> = serde_json::from_slice(&bytes)?;
            Ok(records.into_iter().map(|r| (r.id_hash.clone(), r)).collect())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TableMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store(password: &str) -> Arc<FsStore> {
        let dir = tempfile::tempdir().unwrap().keep();
        FsStore::open(dir, password).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_plaintext() {
        let store = temp_store("pw").await;
        store.set(Table::History, "msg-1", b"hello").await.unwrap();
        let value = store.get(Table::History, "msg-1").await.unwrap().unwrap();
        assert_eq!(value, b"hello");
    }

    #[tokio::test]
    async fn get_all_returns_every_record_in_a_table() {
        let store = temp_store("pw").await;
        store.set(Table::Cache, "a", b"1").await.unwrap();
        store.set(Table::Cache, "b", b"2").await.unwrap();
        let mut values = store.get_all(Table::Cache).await.unwrap();
        values.sort();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn delete_removes_a_single_record() {
        let store = temp_store("pw").await;
        store.set(Table::Connections, "peer", b"state").await.unwrap();
        store.delete(Table::Connections, "peer").await.unwrap();
        assert!(store.get(Table::Connections, "peer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_empties_a_table_without_touching_others() {
        let store = temp_store("pw").await;
        store.set(Table::Cache, "a", b"1").await.unwrap();
        store.set(Table::Keys, "identity", b"secret").await.unwrap();
        store.clear(Table::Cache).await.unwrap();
        assert!(store.get_all(Table::Cache).await.unwrap().is_empty());
        assert!(store.get(Table::Keys, "identity").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dump_then_restore_is_bytewise_identical() {
        let store = temp_store("pw").await;
        store.set(Table::History, "msg-1", b"hello").await.unwrap();
        store.set(Table::Keys, "identity", b"secret").await.unwrap();
        let dump = store.dump().await.unwrap();

        let other_dir = tempfile::tempdir().unwrap().keep();
        let restored = FsStore::open(&other_dir, "pw").await.unwrap();
        restored.restore(dump.clone()).await.unwrap();
        assert_eq!(restored.dump().await.unwrap(), dump);
    }

    #[tokio::test]
    async fn reopening_with_the_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap().keep();
        FsStore::open(&dir, "right").await.unwrap();
        let err = FsStore::open(&dir, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::StoreLocked));
    }
}
