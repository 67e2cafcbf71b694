//! Shared helpers for tourist-core integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::mpsc;

use tourist_core::{Context, ObjectId, Stack, StackConfig};

/// Lake Eola, Orlando
pub const P1: (f64, f64) = (28.497529, -81.368113);

/// Open a file-backed stack in `dir` with autosave left unarmed.
pub fn open_stack(dir: &Path) -> Stack {
    let mut config = StackConfig::in_dir(dir);
    config.autosave_interval_secs = 0;
    Stack::open(config).unwrap()
}

/// Submit `unit` and wait until its changes are in the store.
pub fn run_batch<R, F>(stack: &Stack, unit: F) -> R
where
    F: FnOnce(&mut Context) -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    stack
        .scheduler()
        .submit_then_with(unit, move |output| {
            let _ = tx.send(output);
        })
        .unwrap();
    rx.recv().unwrap()
}

/// `(provider id, url)` records as a photo search would return them.
pub fn photo_records(count: i64, first_id: i64) -> Vec<(i64, String)> {
    (0..count)
        .map(|i| {
            let id = first_id + i;
            (id, format!("https://farm66.staticflickr.com/65535/{id}_z.jpg"))
        })
        .collect()
}

/// Create P1 with `photos` photos and wait for it to be stored.
pub fn pin_with_photos(stack: &Stack, photos: i64) -> ObjectId {
    run_batch(stack, move |context| {
        let pin = context.insert_pin(P1.0, P1.1).unwrap();
        context
            .insert_photos(pin.object_id, photo_records(photos, 1000))
            .unwrap();
        pin.object_id
    })
}
