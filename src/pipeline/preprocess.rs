// Request preprocessing — split request options, resolve URLs through a pluggable sub-pipeline.

use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use super::options::{RequestOptions, RequestType, CACHE_BUNDLE_ROOT};
use super::task::{ItemPool, RequestInput, RequestItem, RequestTask, TaskPool};
use crate::engine::downloader::extname;
use crate::error::AssetError;

/// One stage of URL resolution.
///
/// Stages read `task.input` and fill or adjust `task.output`, acquiring new items
/// from `items`. Items already pushed when a stage fails are released by the caller.
pub trait UrlTransform: Send + Sync {
    fn transform(&self, task: &mut RequestTask, items: &ItemPool) -> Result<()>;
}

/// Runs stages in order, stopping at the first error.
#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Arc<dyn UrlTransform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn UrlTransform>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl UrlTransform for TransformChain {
    fn transform(&self, task: &mut RequestTask, items: &ItemPool) -> Result<()> {
        for stage in &self.stages {
            stage.transform(task, items)?;
        }
        Ok(())
    }
}

/// Resolves `url` requests to themselves. Other request types need an asset database.
pub struct DirectUrlResolver;

impl UrlTransform for DirectUrlResolver {
    fn transform(&self, task: &mut RequestTask, items: &ItemPool) -> Result<()> {
        for input in &task.input {
            if input.kind != RequestType::Url {
                return Err(anyhow!(
                    "cannot resolve {} request {:?} without an asset database",
                    input.kind.as_str(),
                    input.target
                ));
            }

            let mut item = items.acquire();
            item.id.push_str(&input.target);
            item.url.push_str(&input.target);
            item.ext = task
                .options
                .get_str("ext")
                .map(str::to_string)
                .unwrap_or_else(|| extname(&input.target).to_string());
            item.config = task.options.get_str("bundle").map(str::to_string);
            item.options = input.options.clone();
            item.options.merge_missing(&task.options);
            task.output.push(item);
        }
        Ok(())
    }
}

/// Tags each item resolved through a bundle config with that bundle as cache subfolder.
pub struct CacheBundleRootStage;

impl UrlTransform for CacheBundleRootStage {
    fn transform(&self, task: &mut RequestTask, _items: &ItemPool) -> Result<()> {
        for item in task.output.iter_mut() {
            if let Some(name) = &item.config {
                item.options.insert(CACHE_BUNDLE_ROOT, name.clone());
            }
        }
        Ok(())
    }
}

/// Resolved items plus the options left for later stages.
#[derive(Debug)]
pub struct Preprocessed {
    pub items: Vec<RequestItem>,
    pub options: RequestOptions,
}

pub struct Preprocessor {
    transform: Arc<dyn UrlTransform>,
    tasks: TaskPool,
    items: ItemPool,
}

impl Preprocessor {
    pub fn new(transform: Arc<dyn UrlTransform>) -> Self {
        Self {
            transform,
            tasks: TaskPool::default(),
            items: ItemPool::default(),
        }
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn items(&self) -> &ItemPool {
        &self.items
    }

    /// Split `task.options` and resolve `task.input` into `task.output`.
    ///
    /// `task.options` keeps only the remainder. The sub-task used for resolution is
    /// returned to its pool on every path; on error its partial output is released too.
    pub fn run(&self, task: &mut RequestTask) -> Result<(), AssetError> {
        let (sub_options, left_options) = task.options.split();
        task.options = left_options;

        let mut sub = self.tasks.scoped();
        sub.input = task.input.clone();
        sub.options = sub_options;

        match self.transform.transform(&mut sub, &self.items) {
            Ok(()) => {
                task.output = mem::take(&mut sub.output);
                debug!("resolved {} request items", task.output.len());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "url transform failed after {} items: {:#}",
                    sub.output.len(),
                    e
                );
                for item in sub.output.drain(..) {
                    self.items.release(item);
                }
                Err(AssetError::Pipeline(e))
            }
        }
    }

    /// Run a request on a pooled task and hand back its results.
    pub fn process(
        &self,
        input: Vec<RequestInput>,
        options: RequestOptions,
    ) -> Result<Preprocessed, AssetError> {
        let mut task = self.tasks.scoped();
        task.input = input;
        task.options = options;
        self.run(&mut task)?;
        Ok(Preprocessed {
            items: mem::take(&mut task.output),
            options: mem::take(&mut task.options),
        })
    }

    /// Return items a caller has finished with.
    pub fn release_items(&self, items: Vec<RequestItem>) {
        for item in items {
            self.items.release(item);
        }
    }
}
