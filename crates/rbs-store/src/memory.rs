use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rbs_types::{capabilities, BlobId, CapabilitySet, StoreId, TransactionId, Vote};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{BlobReader, BlobStore, BlobStoreConnection, Transaction, TxResource};

/// Transaction behaviour of an [`InMemoryBlobStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InMemoryStoreConfig {
    /// Connections may be opened inside a transaction.
    pub supports_transactions: bool,
    /// Connections must be opened inside a transaction.
    pub require_transactions: bool,
}

impl InMemoryStoreConfig {
    pub fn non_transactional() -> Self {
        Self::default()
    }

    pub fn transactional() -> Self {
        Self {
            supports_transactions: true,
            require_transactions: false,
        }
    }

    pub fn transactions_required() -> Self {
        Self {
            supports_transactions: true,
            require_transactions: true,
        }
    }
}

type BlobMap = BTreeMap<BlobId, Arc<Vec<u8>>>;

struct Shared {
    blobs: RwLock<BlobMap>,
    quiescent: AtomicBool,
}

impl Shared {
    fn check_writable(&self) -> StoreResult<()> {
        if self.quiescent.load(Ordering::Acquire) {
            return Err(StoreError::Quiescent);
        }
        Ok(())
    }
}

/// In-memory, `BTreeMap`-based blob store.
///
/// Intended for tests and embedding. Blob bodies are shared between the map
/// and open readers, so reads never copy. Connections opened inside a
/// transaction buffer their writes until the transaction commits.
pub struct InMemoryBlobStore {
    id: StoreId,
    config: InMemoryStoreConfig,
    shared: Arc<Shared>,
}

impl InMemoryBlobStore {
    /// Create a new empty store.
    pub fn new(id: StoreId, config: InMemoryStoreConfig) -> Self {
        Self {
            id,
            config,
            shared: Arc::new(Shared {
                blobs: RwLock::new(BTreeMap::new()),
                quiescent: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> InMemoryStoreConfig {
        self.config
    }

    /// Number of committed blobs.
    pub fn len(&self) -> usize {
        self.shared.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.blobs.read().is_empty()
    }

    pub fn is_quiescent(&self) -> bool {
        self.shared.quiescent.load(Ordering::Acquire)
    }
}

impl BlobStore for InMemoryBlobStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    fn open_connection(
        &self,
        txn: Option<Arc<dyn Transaction>>,
    ) -> StoreResult<Arc<dyn BlobStoreConnection>> {
        let pending = match txn {
            None if self.config.require_transactions => {
                return Err(StoreError::Unsupported(format!(
                    "{} requires a transaction",
                    self.id
                )));
            }
            None => None,
            Some(_) if !self.config.supports_transactions => {
                return Err(StoreError::Unsupported(format!(
                    "{} does not support transactions",
                    self.id
                )));
            }
            Some(txn) => {
                let pending = Arc::new(PendingWrites {
                    shared: Arc::clone(&self.shared),
                    changes: Mutex::new(BTreeMap::new()),
                });
                txn.enlist(Arc::clone(&pending) as Arc<dyn TxResource>)?;
                debug!(store = %self.id, txn = %txn.id(), "opened transactional connection");
                Some(pending)
            }
        };

        Ok(Arc::new(InMemoryConnection {
            store_id: self.id.clone(),
            shared: Arc::clone(&self.shared),
            pending,
            closed: AtomicBool::new(false),
        }))
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps: CapabilitySet = [capabilities::GENERATE_ID, capabilities::ACCEPT_APP_ID]
            .into_iter()
            .collect();
        if self.config.supports_transactions {
            caps.insert(capabilities::TXN);
        }
        caps
    }

    fn set_quiescent(&self, quiescent: bool) -> StoreResult<bool> {
        let previous = self.shared.quiescent.swap(quiescent, Ordering::AcqRel);
        debug!(store = %self.id, previous, quiescent, "quiescent mode toggled");
        Ok(previous)
    }
}

impl std::fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("id", &self.id)
            .field("blob_count", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Buffered writes of one transactional connection.
///
/// `None` marks a pending delete.
struct PendingWrites {
    shared: Arc<Shared>,
    changes: Mutex<BTreeMap<BlobId, Option<Arc<Vec<u8>>>>>,
}

impl TxResource for PendingWrites {
    fn prepare(&self, _txn: TransactionId) -> StoreResult<Vote> {
        if self.changes.lock().is_empty() {
            return Ok(Vote::ReadOnly);
        }
        self.shared.check_writable()?;
        Ok(Vote::Commit)
    }

    fn commit(&self, txn: TransactionId, _one_phase: bool) -> StoreResult<()> {
        let changes = {
            let mut staged = self.changes.lock();
            if staged.is_empty() {
                return Ok(());
            }
            // Keep the prepared writes if the store went quiescent since prepare.
            self.shared.check_writable()?;
            std::mem::take(&mut *staged)
        };
        let mut blobs = self.shared.blobs.write();
        let count = changes.len();
        for (id, change) in changes {
            match change {
                Some(data) => {
                    blobs.insert(id, data);
                }
                None => {
                    blobs.remove(&id);
                }
            }
        }
        debug!(%txn, changes = count, "applied transactional writes");
        Ok(())
    }

    fn rollback(&self, _txn: TransactionId) -> StoreResult<()> {
        self.changes.lock().clear();
        Ok(())
    }
}

struct InMemoryConnection {
    store_id: StoreId,
    shared: Arc<Shared>,
    pending: Option<Arc<PendingWrites>>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Current content of `id` as seen by this connection.
    fn lookup(&self, id: &BlobId) -> Option<Arc<Vec<u8>>> {
        if let Some(pending) = &self.pending {
            if let Some(change) = pending.changes.lock().get(id) {
                return change.clone();
            }
        }
        self.shared.blobs.read().get(id).cloned()
    }

    fn stage(&self, id: BlobId, change: Option<Arc<Vec<u8>>>) {
        match &self.pending {
            Some(pending) => {
                pending.changes.lock().insert(id, change);
            }
            None => {
                let mut blobs = self.shared.blobs.write();
                match change {
                    Some(data) => {
                        blobs.insert(id, data);
                    }
                    None => {
                        blobs.remove(&id);
                    }
                }
            }
        }
    }
}

impl BlobStoreConnection for InMemoryConnection {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    fn exists(&self, id: &BlobId) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.lookup(id).is_some())
    }

    fn size(&self, id: &BlobId) -> StoreResult<Option<u64>> {
        self.ensure_open()?;
        Ok(self.lookup(id).map(|data| data.len() as u64))
    }

    fn open_reader(&self, id: &BlobId) -> StoreResult<Box<dyn BlobReader>> {
        self.ensure_open()?;
        let data = self
            .lookup(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(Box::new(MemoryReader {
            data,
            pos: 0,
            closed: false,
        }))
    }

    fn put(&self, id: Option<&BlobId>, data: &[u8], overwrite: bool) -> StoreResult<BlobId> {
        self.ensure_open()?;
        self.shared.check_writable()?;
        let id = match id {
            Some(id) => id.clone(),
            None => BlobId::from_content(data),
        };
        if !overwrite && self.lookup(&id).is_some() {
            return Err(StoreError::AlreadyExists(id));
        }
        self.stage(id.clone(), Some(Arc::new(data.to_vec())));
        Ok(id)
    }

    fn delete(&self, id: &BlobId) -> StoreResult<bool> {
        self.ensure_open()?;
        self.shared.check_writable()?;
        if self.lookup(id).is_none() {
            return Ok(false);
        }
        self.stage(id.clone(), None);
        Ok(true)
    }

    fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<BlobId>> {
        self.ensure_open()?;
        let mut visible: BTreeMap<BlobId, bool> = self
            .shared
            .blobs
            .read()
            .keys()
            .map(|id| (id.clone(), true))
            .collect();
        if let Some(pending) = &self.pending {
            for (id, change) in pending.changes.lock().iter() {
                visible.insert(id.clone(), change.is_some());
            }
        }
        Ok(visible
            .into_iter()
            .filter(|(id, present)| *present && prefix.map_or(true, |p| id.starts_with(p)))
            .map(|(id, _)| id)
            .collect())
    }

    fn sync(&self) -> StoreResult<()> {
        self.ensure_open()
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    pos: usize,
    closed: bool,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("reader is closed"));
        }
        let remaining = &self.data[self.pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl BlobReader for MemoryReader {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::LocalTransaction;

    fn store(config: InMemoryStoreConfig) -> InMemoryBlobStore {
        InMemoryBlobStore::new(StoreId::parse("urn:test:mem").unwrap(), config)
    }

    fn blob(s: &str) -> BlobId {
        BlobId::parse(format!("urn:blob:{s}")).unwrap()
    }

    fn read_all(con: &dyn BlobStoreConnection, id: &BlobId) -> Vec<u8> {
        let mut reader = con.open_reader(id).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        reader.close().unwrap();
        out
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn put_and_read_back() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        let id = con.put(Some(&blob("a")), b"hello", false).unwrap();
        assert_eq!(id, blob("a"));
        assert!(con.exists(&id).unwrap());
        assert_eq!(con.size(&id).unwrap(), Some(5));
        assert_eq!(read_all(con.as_ref(), &id), b"hello");
    }

    #[test]
    fn generated_ids_are_content_addressed() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        let id = con.put(None, b"same", false).unwrap();
        assert_eq!(id, BlobId::from_content(b"same"));
        assert!(matches!(
            con.put(None, b"same", false),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn overwrite_flag_is_honoured() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        con.put(Some(&blob("a")), b"one", false).unwrap();
        assert!(matches!(
            con.put(Some(&blob("a")), b"two", false),
            Err(StoreError::AlreadyExists(_))
        ));
        con.put(Some(&blob("a")), b"two", true).unwrap();
        assert_eq!(read_all(con.as_ref(), &blob("a")), b"two");
    }

    #[test]
    fn delete_and_missing() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        con.put(Some(&blob("a")), b"x", false).unwrap();
        assert!(con.delete(&blob("a")).unwrap());
        assert!(!con.delete(&blob("a")).unwrap());
        assert_eq!(con.size(&blob("a")).unwrap(), None);
        assert!(matches!(
            con.open_reader(&blob("a")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn list_filters_by_prefix() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        for name in ["apple", "apricot", "banana"] {
            con.put(Some(&blob(name)), name.as_bytes(), false).unwrap();
        }
        assert_eq!(con.list(None).unwrap().len(), 3);
        let ap = con.list(Some("urn:blob:ap")).unwrap();
        assert_eq!(ap, vec![blob("apple"), blob("apricot")]);
    }

    #[test]
    fn closed_connection_rejects_operations() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        con.close().unwrap();
        assert!(con.is_closed());
        assert!(matches!(con.exists(&blob("a")), Err(StoreError::Closed)));
        assert!(matches!(con.sync(), Err(StoreError::Closed)));
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    #[test]
    fn transaction_required_without_one_is_unsupported() {
        let store = store(InMemoryStoreConfig::transactions_required());
        let Err(err) = store.open_connection(None) else {
            panic!("opened without a transaction");
        };
        assert!(err.is_unsupported());
    }

    #[test]
    fn transaction_on_non_transactional_store_is_unsupported() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let txn = LocalTransaction::begin();
        let Err(err) = store.open_connection(Some(txn)) else {
            panic!("opened a transactional connection");
        };
        assert!(err.is_unsupported());
    }

    #[test]
    fn writes_become_visible_on_commit() {
        let store = store(InMemoryStoreConfig::transactional());
        let txn = LocalTransaction::begin();
        let con = store.open_connection(Some(txn.clone())).unwrap();
        con.put(Some(&blob("a")), b"pending", false).unwrap();

        assert!(con.exists(&blob("a")).unwrap());
        assert!(store.is_empty());

        txn.commit().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn writes_discarded_on_rollback() {
        let store = store(InMemoryStoreConfig::transactional());
        let plain = store.open_connection(None).unwrap();
        plain.put(Some(&blob("keep")), b"k", false).unwrap();

        let txn = LocalTransaction::begin();
        let con = store.open_connection(Some(txn.clone())).unwrap();
        con.put(Some(&blob("a")), b"x", false).unwrap();
        con.delete(&blob("keep")).unwrap();
        assert_eq!(con.list(None).unwrap(), vec![blob("a")]);

        txn.rollback().unwrap();
        assert_eq!(plain.list(None).unwrap(), vec![blob("keep")]);
    }

    #[test]
    fn commit_on_quiescent_store_keeps_prepared_writes() {
        let store = store(InMemoryStoreConfig::transactional());
        let pending = PendingWrites {
            shared: Arc::clone(&store.shared),
            changes: Mutex::new(BTreeMap::new()),
        };
        pending
            .changes
            .lock()
            .insert(blob("a"), Some(Arc::new(b"x".to_vec())));
        let txn = TransactionId::new();
        assert_eq!(pending.prepare(txn).unwrap(), Vote::Commit);

        store.set_quiescent(true).unwrap();
        assert!(matches!(pending.commit(txn, false), Err(StoreError::Quiescent)));
        assert!(store.is_empty());

        store.set_quiescent(false).unwrap();
        pending.commit(txn, false).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capabilities_reflect_config() {
        let plain = store(InMemoryStoreConfig::non_transactional()).capabilities();
        assert!(plain.supports(capabilities::GENERATE_ID));
        assert!(!plain.supports(capabilities::TXN));

        let txn = store(InMemoryStoreConfig::transactional()).capabilities();
        assert!(txn.supports(capabilities::TXN));
    }

    // -----------------------------------------------------------------------
    // Quiescent mode
    // -----------------------------------------------------------------------

    #[test]
    fn set_quiescent_returns_previous() {
        let store = store(InMemoryStoreConfig::non_transactional());
        assert!(!store.set_quiescent(true).unwrap());
        assert!(store.set_quiescent(false).unwrap());
        assert!(!store.set_quiescent(false).unwrap());
    }

    #[test]
    fn quiescent_store_rejects_writes_but_serves_reads() {
        let store = store(InMemoryStoreConfig::non_transactional());
        let con = store.open_connection(None).unwrap();
        con.put(Some(&blob("a")), b"x", false).unwrap();
        store.set_quiescent(true).unwrap();

        assert!(matches!(
            con.put(Some(&blob("b")), b"y", false),
            Err(StoreError::Quiescent)
        ));
        assert!(matches!(con.delete(&blob("a")), Err(StoreError::Quiescent)));
        assert_eq!(read_all(con.as_ref(), &blob("a")), b"x");
    }

    #[test]
    fn debug_format() {
        let store = store(InMemoryStoreConfig::transactional());
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryBlobStore"));
        assert!(debug.contains("blob_count"));
    }
}
