//! Album workflows against an in-process photo source

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use tourist_core::{ContextError, EntityKind, ObjectId, Photo, Stack, StackConfig};
use tourist_flickr::{
    Album, AlbumError, FetchError, PhotoRecord, PhotoSource, PopulateReport, SearchError,
};

#[derive(Default)]
struct FakeSource {
    pages: HashMap<u32, Vec<PhotoRecord>>,
    broken: Mutex<HashSet<String>>,
    searches: Mutex<Vec<Option<u32>>>,
}

impl FakeSource {
    fn with_pages(pages: &[(u32, i64, i64)]) -> Self {
        let pages = pages
            .iter()
            .map(|&(page, first, count)| {
                let records = (first..first + count)
                    .map(|id| PhotoRecord {
                        id,
                        url: format!("https://farm.example/{id}_z.jpg"),
                    })
                    .collect();
                (page, records)
            })
            .collect();
        Self {
            pages,
            ..Self::default()
        }
    }

    fn break_image(&self, id: i64) {
        self.broken
            .lock()
            .unwrap()
            .insert(format!("https://farm.example/{id}_z.jpg"));
    }

    fn repair_images(&self) {
        self.broken.lock().unwrap().clear();
    }

    fn searches(&self) -> Vec<Option<u32>> {
        self.searches.lock().unwrap().clone()
    }
}

impl PhotoSource for FakeSource {
    async fn search(
        &self,
        _latitude: &str,
        _longitude: &str,
        page: Option<u32>,
    ) -> Result<Vec<PhotoRecord>, SearchError> {
        self.searches.lock().unwrap().push(page);
        match self.pages.get(&page.unwrap_or(1)) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => Err(SearchError::NoPhotosAvailable),
        }
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if self.broken.lock().unwrap().contains(url) {
            return Err(FetchError::Status(404));
        }
        Ok(url.as_bytes().to_vec())
    }
}

fn open_stack(dir: &Path) -> Stack {
    let mut config = StackConfig::in_dir(dir);
    config.autosave_interval_secs = 0;
    Stack::open(config).unwrap()
}

fn new_pin(stack: &Stack) -> ObjectId {
    let (tx, rx) = std::sync::mpsc::channel();
    stack
        .scheduler()
        .submit_then_with(
            |context| context.insert_pin(28.497529, -81.368113).unwrap().object_id,
            move |id| tx.send(id).unwrap(),
        )
        .unwrap();
    rx.recv().unwrap()
}

fn photos(stack: &Stack, pin: ObjectId) -> Vec<Photo> {
    stack.main().read(move |context| context.photos_of(pin)).unwrap()
}

#[tokio::test]
async fn test_populate_creates_indexed_photos_with_images() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 500, 24)]), &stack);

    let report = album.populate(pin, None).await.unwrap();
    assert_eq!(
        report,
        PopulateReport {
            page: 1,
            created: 24,
            images_loaded: 24,
            images_skipped: 0,
            images_failed: 0,
        }
    );

    let photos = photos(&stack, pin);
    let ids: Vec<i64> = photos.iter().map(|p| p.id).collect();
    let indexes: Vec<i64> = photos.iter().map(|p| p.index).collect();
    assert_eq!(ids, (500..524).collect::<Vec<_>>());
    assert_eq!(indexes, (0..24).collect::<Vec<_>>());
    assert!(photos.iter().all(Photo::has_image));
    assert_eq!(stack.store_count(EntityKind::Photo).unwrap(), 24);
}

#[tokio::test]
async fn test_failed_downloads_are_counted_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let source = FakeSource::with_pages(&[(1, 10, 5)]);
    source.break_image(12);
    let album = Album::for_stack(source, &stack).with_concurrency(2);

    let report = album.populate(pin, None).await.unwrap();
    assert_eq!(report.images_loaded, 4);
    assert_eq!(report.images_failed, 1);
    let missing: Vec<i64> = photos(&stack, pin)
        .into_iter()
        .filter(|p| !p.has_image())
        .map(|p| p.id)
        .collect();
    assert_eq!(missing, vec![12]);

    album.source().repair_images();
    let report = album.load_missing_images(pin).await.unwrap();
    assert_eq!(report.images_loaded, 1);
    assert!(photos(&stack, pin).iter().all(Photo::has_image));
}

#[tokio::test]
async fn test_reads_wait_for_a_busy_main_context_without_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 1, 3)]), &stack);

    // Main stays busy until the task below releases it, on the same thread.
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    stack
        .main()
        .perform(move |_| {
            let _ = release_rx.recv();
        })
        .unwrap();
    let release = async move {
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();
    };

    let (report, ()) = tokio::join!(album.populate(pin, None), release);
    assert_eq!(report.unwrap().created, 3);
    assert_eq!(photos(&stack, pin).len(), 3);
}

#[tokio::test]
async fn test_search_failure_leaves_the_stack_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::default(), &stack);

    let err = album.populate(pin, None).await.unwrap_err();
    assert!(matches!(
        err,
        AlbumError::Search(SearchError::NoPhotosAvailable)
    ));
    assert_eq!(album.current_page(pin), None);
    assert_eq!(stack.store_count(EntityKind::Photo).unwrap(), 0);
}

#[tokio::test]
async fn test_refresh_replaces_with_next_page() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 1, 6), (2, 100, 4)]), &stack);

    album.populate(pin, None).await.unwrap();
    let report = album.refresh(pin).await.unwrap();
    assert_eq!(report.page, 2);
    assert_eq!(report.created, 4);

    let photos = photos(&stack, pin);
    let ids: Vec<i64> = photos.iter().map(|p| p.id).collect();
    let indexes: Vec<i64> = photos.iter().map(|p| p.index).collect();
    assert_eq!(ids, vec![100, 101, 102, 103]);
    assert_eq!(indexes, vec![0, 1, 2, 3]);
    assert_eq!(stack.store_count(EntityKind::Photo).unwrap(), 4);
    assert_eq!(album.source().searches(), vec![None, Some(2)]);
}

#[tokio::test]
async fn test_refresh_starts_over_when_pages_run_out() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 1, 3)]), &stack);

    album.populate(pin, None).await.unwrap();
    let report = album.refresh(pin).await.unwrap();
    assert_eq!(report.page, 1);
    assert_eq!(album.current_page(pin), Some(1));
    assert_eq!(album.source().searches(), vec![None, Some(2), Some(1)]);
    assert_eq!(photos(&stack, pin).len(), 3);
}

#[tokio::test]
async fn test_remove_photo() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let pin = new_pin(&stack);
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 1, 3)]), &stack);
    album.populate(pin, None).await.unwrap();

    let victim = photos(&stack, pin)[1].object_id;
    album.remove_photo(victim).await.unwrap();
    let remaining: Vec<i64> = photos(&stack, pin).iter().map(|p| p.index).collect();
    assert_eq!(remaining, vec![0, 2]);

    let err = album.remove_photo(victim).await.unwrap_err();
    assert!(matches!(
        err,
        AlbumError::Context(ContextError::ObjectNotFound(id)) if id == victim
    ));
}

#[tokio::test]
async fn test_unknown_pin_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let stack = open_stack(dir.path());
    let album = Album::for_stack(FakeSource::with_pages(&[(1, 1, 3)]), &stack);
    let missing = deleted_pin(&stack);

    let err = album.populate(missing, None).await.unwrap_err();
    assert!(matches!(err, AlbumError::Context(ContextError::ObjectNotFound(_))));
    assert!(album.source().searches().is_empty());
}

/// A pin id that was stored once and then deleted.
fn deleted_pin(stack: &Stack) -> ObjectId {
    let pin = new_pin(stack);
    stack
        .perform_background_batch(move |context| {
            context.delete_pin(pin).unwrap();
        })
        .unwrap();
    stack.flush().unwrap();
    pin
}
