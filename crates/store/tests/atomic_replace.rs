#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kmirror_core::{namespace_key_func, Indexers, Record};
use kmirror_store::Store;

#[derive(Debug, Clone)]
struct Obj {
    name: String,
    generation: u32,
}

impl Record for Obj {
    fn namespace(&self) -> Option<&str> { None }
    fn name(&self) -> &str { &self.name }
    fn resource_version(&self) -> Option<&str> { None }
    fn label(&self, _key: &str) -> Option<&str> { None }
}

fn generation(g: u32) -> Vec<Obj> {
    (0..64).map(|i| Obj { name: format!("g{}-{}", g, i), generation: g }).collect()
}

#[test]
fn readers_never_observe_a_partial_replace() {
    let store = Arc::new(Store::new(namespace_key_func::<Obj>(), Indexers::default()));
    store.replace(generation(0), "0".into());

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut checked = 0u64;
                loop {
                    let snap = store.snapshot();
                    let items = snap.list();
                    assert_eq!(items.len(), 64, "snapshot must be a full generation");
                    let g = items[0].generation;
                    assert!(items.iter().all(|o| o.generation == g), "mixed generations in one snapshot");
                    checked += 1;
                    if done.load(Ordering::Relaxed) {
                        break;
                    }
                }
                checked
            })
        })
        .collect();

    for g in 1..200 {
        store.replace(generation(g), g.to_string());
    }
    done.store(true, Ordering::Relaxed);
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    assert_eq!(store.resource_version().as_deref(), Some("199"));
}
