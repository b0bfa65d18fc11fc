use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

/// One ordered map per column, so prefix scans are range queries.
pub struct MemoryStore {
    columns: RwLock<Vec<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![BTreeMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> Result<usize, StoreError> {
        let guard = self
            .columns
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        Ok(guard[column.index()].len())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self
            .columns
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        Ok(guard[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self
            .columns
            .write()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        guard[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self
            .columns
            .write()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        guard[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self
            .columns
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        Ok(guard[column.index()]
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self
            .columns
            .write()
            .map_err(|_| StoreError::Poisoned("memory store"))?;
        for op in batch.iter() {
            let map = &mut guard[op.column().index()];
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.to_vec(), value.clone());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
