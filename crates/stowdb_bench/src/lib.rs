//! Benchmark utilities.

use rand::Rng;
use stowdb_core::{LogEntry, LogManager, TransactionId};
use stowdb_storage::MemoryStore;

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Builds an in-memory log of `txns` committed transactions with
/// `ops_per_txn` inserts each over `keys` distinct keys. Every fourth
/// transaction is aborted instead and every tenth insert is followed by a
/// delete of the same pair, so replay does some cancelling.
pub fn build_log(txns: usize, ops_per_txn: usize, keys: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let log = LogManager::open(Box::new(store.clone())).expect("open log");
    let mut rng = rand::thread_rng();

    for t in 0..txns {
        let txid = TransactionId::new(t as u64 + 1);
        for i in 0..ops_per_txn {
            let key = format!("key_{}", rng.gen_range(0..keys.max(1)));
            let value = random_data(32);
            log.append(&LogEntry::txn_put(txid, key.as_str(), value.clone()))
                .expect("append put");
            if i % 10 == 9 {
                log.append(&LogEntry::txn_delete(txid, key.as_str(), Some(value)))
                    .expect("append delete");
            }
        }
        let end = if t % 4 == 3 {
            LogEntry::abort(txid)
        } else {
            LogEntry::commit(txid)
        };
        log.append(&end).expect("append resolution");
    }
    store
}
