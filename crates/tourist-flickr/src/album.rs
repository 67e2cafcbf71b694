//! Album workflows: fill, refresh and prune the photos of a pin.
//!
//! Everything here reaches the stack through the batch scheduler and object
//! ids only. Network calls happen before any unit is submitted, so a failed
//! search leaves the stack untouched.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use tourist_core::{BatchScheduler, Context, ContextError, MainContext, ObjectId, Stack};

use crate::error::{AlbumError, SearchError};
use crate::source::PhotoSource;

/// Image downloads kept in flight at once
pub const DEFAULT_IMAGE_CONCURRENCY: usize = 4;

/// What one populate or refresh did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateReport {
    /// Search page the photos came from
    pub page: u32,
    pub created: usize,
    pub images_loaded: usize,
    /// Photos deleted before their image arrived
    pub images_skipped: usize,
    pub images_failed: usize,
}

enum ImageOutcome {
    Loaded,
    Skipped,
    Failed,
}

/// Photo collections of pins, filled from a [`PhotoSource`]
pub struct Album<S> {
    source: S,
    scheduler: BatchScheduler,
    main: MainContext,
    /// Last search page used per pin
    pages: Mutex<HashMap<ObjectId, u32>>,
    concurrency: usize,
}

impl<S: PhotoSource> Album<S> {
    pub fn new(source: S, scheduler: BatchScheduler, main: MainContext) -> Self {
        Self {
            source,
            scheduler,
            main,
            pages: Mutex::new(HashMap::new()),
            concurrency: DEFAULT_IMAGE_CONCURRENCY,
        }
    }

    pub fn for_stack(source: S, stack: &Stack) -> Self {
        Self::new(source, stack.scheduler(), stack.main())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Search page the pin's photos were last taken from
    pub fn current_page(&self, pin: ObjectId) -> Option<u32> {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
    }

    /// Search around `pin`, create one photo per result and download the
    /// images.
    pub async fn populate(&self, pin: ObjectId, page: Option<u32>) -> Result<PopulateReport, AlbumError> {
        let (latitude, longitude) = self.coordinates(pin).await?;
        let records = self.source.search(&latitude, &longitude, page).await?;
        let page = page.unwrap_or(1);

        let photos = self
            .run(move |context| {
                context.insert_photos(pin, records.into_iter().map(|record| (record.id, record.url)))
            })
            .await??;
        self.remember_page(pin, page);
        info!(%pin, page, count = photos.len(), "album populated");

        let created = photos.len();
        let targets = photos
            .into_iter()
            .map(|photo| (photo.object_id, photo.url))
            .collect();
        let mut report = self.load_images(targets).await;
        report.page = page;
        report.created = created;
        Ok(report)
    }

    /// Replace the pin's photos with the next search page, starting over at
    /// the first page once the results run out.
    pub async fn refresh(&self, pin: ObjectId) -> Result<PopulateReport, AlbumError> {
        let (latitude, longitude) = self.coordinates(pin).await?;
        let mut page = self.current_page(pin).map_or(2, |page| page + 1);

        let records = match self.source.search(&latitude, &longitude, Some(page)).await {
            Err(SearchError::NoPhotosAvailable) if page > 1 => {
                debug!(%pin, page, "no more pages, starting over");
                page = 1;
                self.source.search(&latitude, &longitude, Some(page)).await?
            }
            result => result?,
        };

        // Two units: observers see the removal and the new set as one batch
        // when both commit before they look.
        self.scheduler.submit(move |context| {
            if let Err(err) = context.delete_photos_of(pin) {
                warn!(%pin, error = %err, "could not clear album");
            }
        })?;
        let photos = self
            .run(move |context| {
                context.insert_photos(pin, records.into_iter().map(|record| (record.id, record.url)))
            })
            .await??;
        self.remember_page(pin, page);
        info!(%pin, page, count = photos.len(), "album refreshed");

        let created = photos.len();
        let targets = photos
            .into_iter()
            .map(|photo| (photo.object_id, photo.url))
            .collect();
        let mut report = self.load_images(targets).await;
        report.page = page;
        report.created = created;
        Ok(report)
    }

    pub async fn remove_photo(&self, photo: ObjectId) -> Result<(), AlbumError> {
        self.run(move |context| context.delete_photo(photo)).await??;
        Ok(())
    }

    /// Download images for photos of `pin` that have none yet.
    pub async fn load_missing_images(&self, pin: ObjectId) -> Result<PopulateReport, AlbumError> {
        let targets: Vec<(ObjectId, String)> = self
            .read(move |context| {
                context
                    .photos_of(pin)
                    .into_iter()
                    .filter(|photo| !photo.has_image())
                    .map(|photo| (photo.object_id, photo.url))
                    .collect()
            })
            .await?;
        let mut report = self.load_images(targets).await;
        report.page = self.current_page(pin).unwrap_or(1);
        Ok(report)
    }

    async fn coordinates(&self, pin: ObjectId) -> Result<(String, String), AlbumError> {
        self.read(move |context| context.pin(pin).map(|pin| pin.coordinate_strings()))
            .await?
            .ok_or(AlbumError::Context(ContextError::ObjectNotFound(pin)))
    }

    /// Run `read` on the main context without blocking the executor.
    async fn read<F, R>(&self, read: F) -> Result<R, AlbumError>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.main.perform(move |context| {
            let _ = tx.send(read(context));
        })?;
        rx.await.map_err(|_| AlbumError::Cancelled)
    }

    fn remember_page(&self, pin: ObjectId, page: u32) {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, page);
    }

    async fn load_images(&self, targets: Vec<(ObjectId, String)>) -> PopulateReport {
        let outcomes: Vec<ImageOutcome> = stream::iter(targets)
            .map(|(photo, url)| self.load_image(photo, url))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PopulateReport::default();
        for outcome in outcomes {
            match outcome {
                ImageOutcome::Loaded => report.images_loaded += 1,
                ImageOutcome::Skipped => report.images_skipped += 1,
                ImageOutcome::Failed => report.images_failed += 1,
            }
        }
        report
    }

    async fn load_image(&self, photo: ObjectId, url: String) -> ImageOutcome {
        let bytes = match self.source.fetch_image(&url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%url, error = %err, "image download failed");
                return ImageOutcome::Failed;
            }
        };

        match self.run(move |context| context.set_photo_image(photo, bytes)).await {
            Ok(Ok(())) => ImageOutcome::Loaded,
            Ok(Err(ContextError::ObjectNotFound(_))) => {
                debug!(%photo, "photo deleted before its image arrived");
                ImageOutcome::Skipped
            }
            Ok(Err(err)) => {
                warn!(%photo, error = %err, "image not stored");
                ImageOutcome::Failed
            }
            Err(err) => {
                warn!(%photo, error = %err, "image unit not completed");
                ImageOutcome::Failed
            }
        }
    }

    /// Submit `unit` and resolve once its changes are in the store.
    async fn run<F, R>(&self, unit: F) -> Result<R, AlbumError>
    where
        F: FnOnce(&mut Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.scheduler.submit_then_with(unit, move |output| {
            let _ = tx.send(output);
        })?;
        rx.await.map_err(|_| AlbumError::Cancelled)
    }
}
