//! Build plans.
//!
//! A plan runs four stages in order:
//! 1. resolve the base image
//! 2. build (or reuse) every layer, in parallel up to the worker limit
//! 3. assemble config and manifest
//! 4. deliver to the target
//!
//! The first three stages depend only on the [`BuildContext`], so plans for
//! different targets over the same context produce identical digests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::archive::{stream_docker_archive, ArchiveWriter};
use crate::base;
use crate::context::{BuildContext, LayerSource};
use crate::daemon::DaemonClient;
use crate::error::{BuildError, PlanError, Stage};
use crate::image::ImageConfiguration;
use crate::layer::{build_layer, content_key, CachedLayer, LayerCache};
use crate::manifest::{self, AssembledImage, BuiltLayer};
use crate::registry::{RegistryClient, RegistryConfig};
use crate::target::TargetKind;

/// Delivery client wired into a plan's final stage.
#[derive(Debug, Clone)]
pub enum Delivery {
    Daemon(DaemonClient),
    /// The HTTP client is created when the stage runs.
    Registry(RegistryConfig),
    Archive(ArchiveWriter),
}

impl Delivery {
    pub fn kind(&self) -> TargetKind {
        match self {
            Delivery::Daemon(_) => TargetKind::Daemon,
            Delivery::Registry(_) => TargetKind::Registry,
            Delivery::Archive(_) => TargetKind::Archive,
        }
    }
}

/// Outcome of a successful plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    pub target: TargetKind,
    /// Manifest digest.
    pub image_digest: String,
    /// Config digest, as the daemon reports it.
    pub image_id: String,
    /// Primary tag the image was delivered under, e.g. `myimage:latest`.
    pub tag: Option<String>,
    /// Every tag applied.
    pub tags: Vec<String>,
    /// Layer digests, base layers first.
    pub layers: Vec<String>,
    /// File written by an archive target.
    pub output: Option<PathBuf>,
    pub duration_ms: u64,
}

/// Ordered stages bound to a build context and one delivery client.
#[derive(Debug)]
pub struct BuildPlan {
    stages: Vec<Stage>,
    image: ImageConfiguration,
    context: Arc<BuildContext>,
    delivery: Delivery,
}

impl BuildPlan {
    pub fn new(image: ImageConfiguration, context: Arc<BuildContext>, delivery: Delivery) -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
            image,
            context,
            delivery,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn image(&self) -> &ImageConfiguration {
        &self.image
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.context
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Run the target-agnostic stages and return the assembled image without
    /// delivering it.
    pub async fn assemble(&self) -> Result<AssembledImage, PlanError> {
        self.assemble_tracked(&AtomicUsize::new(0)).await
    }

    /// Run every stage.
    pub async fn execute(&self) -> Result<BuildResult, PlanError> {
        self.run(&AtomicUsize::new(0)).await
    }

    /// Run every stage, abandoning the build when `shutdown` becomes `true`.
    ///
    /// In-flight layer tasks are aborted and a running daemon subprocess is
    /// killed; the error names the stage that was interrupted.
    pub async fn execute_until(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BuildResult, PlanError> {
        let current = AtomicUsize::new(0);

        tokio::select! {
            result = self.run(&current) => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                let stage = self.stages[current.load(Ordering::SeqCst)];
                warn!(stage = %stage, "Build cancelled");
                Err(PlanError::new(stage, BuildError::Cancelled))
            }
        }
    }

    async fn run(&self, current: &AtomicUsize) -> Result<BuildResult, PlanError> {
        let start = Instant::now();
        let assembled = self.assemble_tracked(current).await?;

        current.store(3, Ordering::SeqCst);
        let delivered = self
            .deliver(&assembled)
            .await
            .map_err(|e| PlanError::new(Stage::Deliver, e))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            kind = %self.delivery.kind(),
            digest = %assembled.manifest_digest,
            tag = delivered.tag.as_deref().unwrap_or("-"),
            duration_ms = duration_ms,
            "Build complete"
        );

        Ok(BuildResult {
            target: self.delivery.kind(),
            image_digest: delivered.digest.unwrap_or_else(|| assembled.manifest_digest.clone()),
            image_id: assembled.image_id().to_string(),
            tag: delivered.tag,
            tags: delivered.tags,
            layers: assembled.layers().iter().map(|l| l.digest.clone()).collect(),
            output: delivered.output,
            duration_ms,
        })
    }

    async fn assemble_tracked(&self, current: &AtomicUsize) -> Result<AssembledImage, PlanError> {
        current.store(0, Ordering::SeqCst);
        let stage_start = Instant::now();
        let base = base::resolve(
            &self.context.base_image,
            self.context.cache.store(),
            &self.context.settings,
        )
        .await
        .map_err(|e| PlanError::new(Stage::ResolveBaseImage, e))?;
        log_stage(Stage::ResolveBaseImage, stage_start);

        current.store(1, Ordering::SeqCst);
        let stage_start = Instant::now();
        let built = self
            .build_layers()
            .await
            .map_err(|e| PlanError::new(Stage::BuildLayers, e))?;
        log_stage(Stage::BuildLayers, stage_start);

        current.store(2, Ordering::SeqCst);
        let stage_start = Instant::now();
        let assembled = manifest::assemble(&base, &built, &self.context.container)
            .map_err(|e| PlanError::new(Stage::AssembleManifest, e))?;
        log_stage(Stage::AssembleManifest, stage_start);

        Ok(assembled)
    }

    async fn build_layers(&self) -> Result<Vec<BuiltLayer>, BuildError> {
        let workers = self.context.settings.max_concurrent_layers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for (index, source) in self.context.layers.iter().enumerate() {
            let cache = self.context.cache.clone();
            let semaphore = semaphore.clone();
            let source = source.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| layer_error(&source.name, e))?;
                let name = source.name.clone();
                let layer = build_cached(&cache, source).await?;
                Ok::<_, BuildError>((index, BuiltLayer { name, layer }))
            });
        }

        let mut built: Vec<Option<BuiltLayer>> = vec![None; self.context.layers.len()];
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(layer_error("<task>", e)),
            };

            match outcome {
                Ok((index, layer)) => built[index] = Some(layer),
                Err(e) => {
                    // Siblings are abandoned; their finished layers stay cached.
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(built.into_iter().flatten().collect())
    }

    async fn deliver(&self, image: &AssembledImage) -> Result<Delivered, BuildError> {
        let store = self.context.cache.store();
        let tags = self.image.repo_tags();

        match &self.delivery {
            Delivery::Daemon(client) => {
                let (archive, writer) =
                    stream_docker_archive(image.clone(), tags.clone(), store.clone());

                let loaded = client.load(archive).await;
                let written = writer.await;
                // A daemon failure also breaks the pipe; report the daemon's error.
                let output = loaded?;
                written.map_err(|e| BuildError::Delivery(e.to_string()))??;

                debug!(stdout = %output.stdout.trim(), "Daemon accepted image");

                Ok(Delivered {
                    tag: tags.first().cloned(),
                    tags,
                    digest: None,
                    output: None,
                })
            }
            Delivery::Registry(config) => {
                let client = RegistryClient::new(config.clone())?;
                let reference = self.image.reference();

                let mut references: Vec<String> = self
                    .image
                    .tagged_references()
                    .iter()
                    .filter(|r| !r.is_digest())
                    .map(|r| r.reference().to_string())
                    .collect();
                if references.is_empty() {
                    references.push(image.manifest_digest.clone());
                }

                let digest = client
                    .push_image(reference.repository(), &references, image, store)
                    .await?;

                Ok(Delivered {
                    tag: tags.first().cloned(),
                    tags,
                    digest: Some(digest),
                    output: None,
                })
            }
            Delivery::Archive(writer) => {
                writer.write(image, &tags, store).await.map_err(|e| {
                    BuildError::Delivery(format!(
                        "failed to write {}: {e}",
                        writer.output().display()
                    ))
                })?;

                Ok(Delivered {
                    tag: tags.first().cloned(),
                    tags,
                    digest: None,
                    output: Some(writer.output().to_path_buf()),
                })
            }
        }
    }
}

struct Delivered {
    tag: Option<String>,
    tags: Vec<String>,
    digest: Option<String>,
    output: Option<PathBuf>,
}

/// Build a layer through the cache, so identical content is built once.
async fn build_cached(cache: &LayerCache, source: LayerSource) -> Result<CachedLayer, BuildError> {
    let source = Arc::new(source);
    let name = source.name.clone();

    let key = {
        let source = source.clone();
        tokio::task::spawn_blocking(move || content_key(&source))
    }
    .await
    .map_err(|e| layer_error(&name, e))?
    .map_err(|e| layer_error(&name, e))?;

    let store = cache.store().clone();
    cache
        .get_or_build(&key, || async move {
            let layer = tokio::task::spawn_blocking(move || build_layer(&source, &store))
                .await
                .map_err(|e| layer_error(&name, e))?
                .map_err(|e| layer_error(&name, e))?;
            info!(layer = %name, digest = %layer.digest, size = layer.size, "Layer built");
            Ok(layer)
        })
        .await
}

fn layer_error(layer: &str, err: impl std::fmt::Display) -> BuildError {
    BuildError::LayerBuild {
        layer: layer.to_string(),
        message: err.to_string(),
    }
}

fn log_stage(stage: Stage, start: Instant) {
    info!(
        stage = %stage,
        duration_ms = start.elapsed().as_millis() as u64,
        "Stage complete"
    );
}

/// Resolves once `shutdown` is `true`. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
