//! Handle registry integration tests: lifecycle, locking, and shutdown
//! ordering across concurrent sessions.

use std::sync::Arc;
use std::thread;

use bramble::btree::{TreeConfig, TreeKind};
use bramble::handle::{HandleFlags, OpenFlags, METADATA_NAME};
use bramble::meta::{Catalog, LIVE_CHECKPOINT};
use bramble::{Config, Engine};

fn engine_with_table(name: &str) -> Engine {
    let engine = Engine::open_in_memory(Config::default());
    engine
        .create_table(name, engine.config().tree_defaults())
        .unwrap();
    engine
}

#[test]
fn missing_table_maps_to_not_found() {
    let engine = Engine::open_in_memory(Config::default());
    let err = engine
        .registry()
        .get("absent", None, OpenFlags::empty())
        .unwrap_err();
    assert!(err.is_not_found());
    // Nothing was allocated for the failed lookup.
    assert!(engine.registry().is_empty());
}

#[test]
fn non_exclusive_get_is_open_and_shared() {
    let engine = engine_with_table("t");
    let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    assert!(h.flags().contains(HandleFlags::OPEN));
    assert!(!h.flags().contains(HandleFlags::EXCLUSIVE));
    assert!(!h.is_exclusive());
    assert_eq!(h.refcnt(), 1);
    engine.registry().release(h).unwrap();
}

#[test]
fn exclusive_get_reports_exclusive() {
    let engine = engine_with_table("t");
    let h = engine
        .registry()
        .get("t", None, OpenFlags::EXCLUSIVE)
        .unwrap();
    assert!(h.flags().contains(HandleFlags::EXCLUSIVE));
    assert!(h.is_exclusive());
    engine.registry().release(h).unwrap();
    // Released: a later shared get works and the bit is clear.
    let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    assert!(!h.flags().contains(HandleFlags::EXCLUSIVE));
    engine.registry().release(h).unwrap();
}

#[test]
fn concurrent_opens_share_one_handle() {
    let engine = Arc::new(engine_with_table("t"));
    let h1 = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    let h2 = {
        let engine = engine.clone();
        thread::spawn(move || {
            let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
            let same = Arc::strong_count(h.handle()) > 1;
            (h, same)
        })
        .join()
        .unwrap()
    };
    let (h2, _) = h2;
    // One registry entry, one handle, two references.
    assert_eq!(engine.registry().len(), 1);
    assert!(Arc::ptr_eq(h1.handle(), h2.handle()));
    assert_eq!(h1.refcnt(), 2);

    // A third session asking for exclusive use fails busy immediately.
    let err = engine
        .registry()
        .get("t", None, OpenFlags::EXCLUSIVE)
        .unwrap_err();
    assert!(err.is_busy());

    engine.registry().release(h1).unwrap();
    engine.registry().release(h2).unwrap();
}

#[test]
fn checkpoint_handle_is_distinct_from_live() {
    let engine = engine_with_table("t");
    {
        let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
        h.tree().unwrap().root().unwrap().row_insert(b"k", b"v");
        engine.registry().release(h).unwrap();
    }
    engine.registry().close_all("t").unwrap();
    // Name the checkpoint after the fact by copying the live cookie.
    let cookie = engine
        .catalog()
        .checkpoint_addr("t", LIVE_CHECKPOINT)
        .unwrap();
    engine
        .catalog()
        .set_checkpoint_addr("t", "snap", cookie)
        .unwrap();

    let live = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    let snap = engine
        .registry()
        .get("t", Some("snap"), OpenFlags::empty())
        .unwrap();
    assert!(!Arc::ptr_eq(live.handle(), snap.handle()));
    assert_eq!(engine.registry().len(), 2);
    assert!(snap.tree().unwrap().is_readonly());
    engine.registry().release(live).unwrap();
    engine.registry().release(snap).unwrap();
}

#[test]
fn close_all_rolls_back_when_handle_in_use() {
    let engine = engine_with_table("t");
    let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    h.tree().unwrap().root().unwrap().row_insert(b"k", b"v");

    // The open cursor holds a read lock; close-all must not touch any
    // handle.
    let err = engine.registry().close_all("t").unwrap_err();
    assert!(err.is_busy());
    assert!(h.flags().contains(HandleFlags::OPEN));
    assert_eq!(h.refcnt(), 1);

    engine.registry().release(h).unwrap();
    engine.registry().close_all("t").unwrap();
    // Handle is closed but stays registered until shutdown.
    assert_eq!(engine.registry().len(), 1);
    assert!(engine
        .catalog()
        .checkpoint_addr("t", LIVE_CHECKPOINT)
        .unwrap()
        .is_valid());
}

#[test]
fn close_all_covers_checkpoint_handles() {
    let engine = engine_with_table("t");
    {
        let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
        h.tree().unwrap().root().unwrap().row_insert(b"a", b"1");
        engine.registry().release(h).unwrap();
    }
    engine.registry().close_all("t").unwrap();
    let cookie = engine
        .catalog()
        .checkpoint_addr("t", LIVE_CHECKPOINT)
        .unwrap();
    engine
        .catalog()
        .set_checkpoint_addr("t", "snap", cookie)
        .unwrap();
    let snap = engine
        .registry()
        .get("t", Some("snap"), OpenFlags::empty())
        .unwrap();
    engine.registry().release(snap).unwrap();

    engine.registry().close_all("t").unwrap();
    let reopened = engine
        .registry()
        .get("t", Some("snap"), OpenFlags::empty())
        .unwrap();
    assert!(reopened.flags().contains(HandleFlags::OPEN));
    engine.registry().release(reopened).unwrap();
}

#[test]
fn special_mode_requires_exclusive_use() {
    let engine = engine_with_table("t");
    let v = engine
        .registry()
        .get("t", None, OpenFlags::VERIFY)
        .unwrap();
    assert!(v.flags().contains(HandleFlags::VERIFY));
    assert!(v.is_exclusive());
    engine.registry().release(v).unwrap();

    // Handle retains no special flag once released and reopened normally.
    let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    assert!(!h.flags().intersects(HandleFlags::special()));
    engine.registry().release(h).unwrap();
}

#[test]
fn apply_skips_exclusive_and_metadata() {
    let engine = engine_with_table("t");
    engine
        .create_table("u", engine.config().tree_defaults())
        .unwrap();
    engine
        .create_table(METADATA_NAME, engine.config().tree_defaults())
        .unwrap();
    let a = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    let b = engine
        .registry()
        .get("u", None, OpenFlags::EXCLUSIVE)
        .unwrap();
    let m = engine
        .registry()
        .get(METADATA_NAME, None, OpenFlags::empty())
        .unwrap();

    let mut seen = Vec::new();
    engine
        .registry()
        .apply(&mut |dh| {
            seen.push(dh.name().to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, vec!["t".to_string()]);

    engine.registry().release(a).unwrap();
    engine.registry().release(b).unwrap();
    engine.registry().release(m).unwrap();
}

#[test]
fn sweep_closes_idle_handles_only() {
    let engine = engine_with_table("t");
    engine
        .create_table("u", engine.config().tree_defaults())
        .unwrap();
    let held = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
    {
        let idle = engine.registry().get("u", None, OpenFlags::empty()).unwrap();
        engine.registry().release(idle).unwrap();
    }
    engine.registry().sweep().unwrap();
    assert!(held.flags().contains(HandleFlags::OPEN));
    let stats = engine.registry().stats();
    assert_eq!(stats.sweeps, 1);
    engine.registry().release(held).unwrap();
}

#[test]
fn shutdown_closes_user_tables_then_metadata() {
    let engine = engine_with_table("t");
    engine
        .create_table(METADATA_NAME, engine.config().tree_defaults())
        .unwrap();
    {
        let h = engine.registry().get("t", None, OpenFlags::empty()).unwrap();
        h.tree().unwrap().root().unwrap().row_insert(b"k", b"v");
        engine.registry().release(h).unwrap();
        let m = engine
            .registry()
            .get(METADATA_NAME, None, OpenFlags::empty())
            .unwrap();
        engine.registry().release(m).unwrap();
    }
    engine.shutdown().unwrap();
    assert!(engine.registry().is_empty());
    // The user table's checkpoint landed before shutdown completed.
    assert!(engine
        .catalog()
        .checkpoint_addr("t", LIVE_CHECKPOINT)
        .unwrap()
        .is_valid());
}

#[test]
fn lock_only_get_skips_open() {
    let engine = engine_with_table("t");
    let h = engine
        .registry()
        .get("t", None, OpenFlags::LOCK_ONLY)
        .unwrap();
    assert!(!h.flags().contains(HandleFlags::OPEN));
    assert!(h.flags().contains(HandleFlags::LOCK_ONLY));
    assert!(h.tree().is_err());
    engine.registry().release(h).unwrap();
}

#[test]
fn column_tables_open_through_registry() {
    let engine = Engine::open_in_memory(Config::default());
    let cfg = TreeConfig {
        kind: TreeKind::ColVar,
        ..engine.config().tree_defaults()
    };
    engine.create_table("c", cfg).unwrap();
    let h = engine.registry().get("c", None, OpenFlags::empty()).unwrap();
    let root = h.tree().unwrap().root().unwrap();
    assert_eq!(root.col_append(b"x"), 1);
    engine.registry().release(h).unwrap();
    engine.shutdown().unwrap();
}
