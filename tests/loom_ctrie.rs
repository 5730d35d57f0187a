//! Exhaustive interleaving check over a small bounded instance. Only built
//! under `--cfg loom`; a plain `cargo test` never compiles this file's body.
#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;

use ctrie::{Ctrie, Registry};

#[test]
fn two_threads_insert_and_lookup_disjoint_keys() {
    loom::model(|| {
        let registry = Arc::new(Registry::new(2));
        let trie: Arc<Ctrie> = Arc::new(Ctrie::new());

        let r1 = Arc::clone(&registry);
        let t1 = Arc::clone(&trie);
        let h1 = thread::spawn(move || {
            let mut ctx = r1.thread_ctx(0).unwrap();
            t1.insert(1, 10, &mut ctx).unwrap();
            assert_eq!(t1.lookup(1, &mut ctx).unwrap(), Some(10));
        });

        let r2 = Arc::clone(&registry);
        let t2 = Arc::clone(&trie);
        let h2 = thread::spawn(move || {
            let mut ctx = r2.thread_ctx(1).unwrap();
            t2.insert(33, 20, &mut ctx).unwrap();
            assert_eq!(t2.lookup(33, &mut ctx).unwrap(), Some(20));
        });

        h1.join().unwrap();
        h2.join().unwrap();
    });
}

#[test]
fn insert_racing_remove_on_the_same_key_is_linearizable() {
    loom::model(|| {
        let registry = Arc::new(Registry::new(2));
        let trie: Arc<Ctrie> = Arc::new(Ctrie::new());

        let mut warm = registry.thread_ctx(0).unwrap();
        trie.insert(5, 1, &mut warm).unwrap();
        drop(warm);

        let r1 = Arc::clone(&registry);
        let t1 = Arc::clone(&trie);
        let h1 = thread::spawn(move || {
            let mut ctx = r1.thread_ctx(0).unwrap();
            let _ = t1.remove(5, &mut ctx);
        });

        let r2 = Arc::clone(&registry);
        let t2 = Arc::clone(&trie);
        let h2 = thread::spawn(move || {
            let mut ctx = r2.thread_ctx(1).unwrap();
            let _ = t2.lookup(5, &mut ctx);
        });

        h1.join().unwrap();
        h2.join().unwrap();
    });
}
