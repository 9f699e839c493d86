use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{instrument, Span};

pub use search_ranking_backend_core::{
    BackendError, ComputeTarget, Metadata, Metric, ModelFamily, PairBatch, Query, RerankModel,
    RetrievalRequest, RetrievedItem, Retriever, Value,
};

/// Shared handle over a rerank model served by a fixed pool of worker threads
#[derive(Debug, Clone)]
pub struct RerankBackend {
    /// Channel to communicate with the worker threads
    sender: async_channel::Sender<ModelCommand>,
    /// Health status
    health_receiver: watch::Receiver<bool>,
    _workers: Arc<WorkerPool>,
    pub families: Vec<ModelFamily>,
    pub max_batch_size: Option<usize>,
    pub workers: usize,
}

impl RerankBackend {
    pub fn new(
        model: Arc<dyn RerankModel + Send + Sync>,
        workers: usize,
    ) -> Result<Self, BackendError> {
        if workers == 0 {
            return Err(BackendError::Start(
                "at least one rerank worker is required".to_string(),
            ));
        }
        let families = model.families();
        if families.is_empty() {
            return Err(BackendError::NoBackend);
        }
        let max_batch_size = model.max_batch_size();

        tracing::info!("Starting {workers} rerank workers");

        let (sender, receiver) = async_channel::bounded(workers * 4);
        let (health_sender, health_receiver) = watch::channel(false);
        let health_sender = Arc::new(health_sender);

        let handles = (0..workers)
            .map(|_| {
                let model = model.clone();
                let receiver = receiver.clone();
                let health_sender = health_sender.clone();
                std::thread::spawn(move || model_worker(model, receiver, health_sender))
            })
            .collect();

        Ok(Self {
            sender,
            health_receiver,
            _workers: Arc::new(WorkerPool(handles)),
            families,
            max_batch_size,
            workers,
        })
    }

    pub fn supports(&self, family: ModelFamily) -> bool {
        self.families.contains(&family)
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        if *self.health_receiver.borrow() {
            // Only ask the model for its health status
            let (sender, receiver) = oneshot::channel();
            self.call(ModelCommand::Health(Span::current(), sender), receiver)
                .await
        } else {
            // Un-healthy or just started: run a forward pass on a warmup input
            if self.supports(ModelFamily::CrossEncoder) {
                let batch = PairBatch {
                    query: Query::from_text("health"),
                    documents: vec!["health".to_string()],
                };
                let (sender, receiver) = oneshot::channel();
                self.call(
                    ModelCommand::Predict(batch, Span::current(), sender),
                    receiver,
                )
                .await
                .map(|_| ())
            } else {
                let (sender, receiver) = oneshot::channel();
                self.call(
                    ModelCommand::Embed(vec!["health".to_string()], Span::current(), sender),
                    receiver,
                )
                .await
                .map(|_| ())
            }
        }
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.health_receiver.clone()
    }

    #[instrument(skip_all, fields(batch_size = batch.len()))]
    pub async fn predict(
        &self,
        batch: PairBatch,
        deadline: Instant,
    ) -> Result<(Vec<f32>, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        let command = ModelCommand::Predict(batch, Span::current(), sender);
        tokio::time::timeout_at(deadline, self.call(command, receiver))
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    #[instrument(skip_all, fields(batch_size = texts.len()))]
    pub async fn embed(
        &self,
        texts: Vec<String>,
        deadline: Instant,
    ) -> Result<(Vec<Vec<f32>>, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        let command = ModelCommand::Embed(texts, Span::current(), sender);
        tokio::time::timeout_at(deadline, self.call(command, receiver))
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    async fn call<T>(
        &self,
        command: ModelCommand,
        receiver: oneshot::Receiver<Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| BackendError::Unhealthy)?;
        receiver
            .await
            .map_err(|_| BackendError::Inference("rerank worker dropped the request".to_string()))?
    }
}

fn model_worker(
    model: Arc<dyn RerankModel + Send + Sync>,
    receiver: async_channel::Receiver<ModelCommand>,
    health_sender: Arc<watch::Sender<bool>>,
) {
    while let Ok(cmd) = receiver.recv_blocking() {
        let start = std::time::Instant::now();
        // Health is published before the response so callers observe it on return
        match cmd {
            ModelCommand::Health(span, sender) => {
                let _span = span.entered();
                let result = model.health();
                let _ = health_sender.send(result.is_ok());
                let _ = sender.send(result);
            }
            ModelCommand::Predict(batch, span, sender) => {
                // The caller gave up while the batch was queued
                if sender.is_closed() {
                    metrics::counter!("sr_rerank_dropped").increment(1);
                    continue;
                }
                let _span = span.entered();
                let expected = batch.len();
                let result = model
                    .predict(batch)
                    .and_then(|scores| check_len(expected, scores.len()).map(|_| scores))
                    .map(|scores| (scores, start.elapsed()));
                metrics::histogram!("sr_rerank_inference_duration")
                    .record(start.elapsed().as_secs_f64());
                let _ = health_sender.send(result.is_ok());
                let _ = sender.send(result);
            }
            ModelCommand::Embed(texts, span, sender) => {
                if sender.is_closed() {
                    metrics::counter!("sr_rerank_dropped").increment(1);
                    continue;
                }
                let _span = span.entered();
                let expected = texts.len();
                let result = model
                    .embed(texts)
                    .and_then(|embeddings| {
                        check_len(expected, embeddings.len()).map(|_| embeddings)
                    })
                    .map(|embeddings| (embeddings, start.elapsed()));
                metrics::histogram!("sr_rerank_inference_duration")
                    .record(start.elapsed().as_secs_f64());
                let _ = health_sender.send(result.is_ok());
                let _ = sender.send(result);
            }
        }
    }
}

fn check_len(expected: usize, got: usize) -> Result<(), BackendError> {
    if expected != got {
        return Err(BackendError::Inference(format!(
            "model returned {got} outputs for {expected} inputs"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct WorkerPool(Vec<JoinHandle<()>>);

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once every sender is dropped
        for handle in self.0.drain(..) {
            let _ = handle.join();
        }
    }
}

enum ModelCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Predict(
        PairBatch,
        Span,
        oneshot::Sender<Result<(Vec<f32>, Duration), BackendError>>,
    ),
    Embed(
        Vec<String>,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Vec<Vec<f32>>, Duration), BackendError>>,
    ),
}

/// Deadline bounded access to the vector index
#[derive(Clone)]
pub struct Retrieval {
    retriever: Arc<dyn Retriever>,
}

impl Retrieval {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        self.retriever.health().await
    }

    #[instrument(skip_all, fields(top_k = request.top_k, metric = %request.metric))]
    pub async fn search(
        &self,
        request: RetrievalRequest,
        deadline: Instant,
    ) -> Result<(Vec<RetrievedItem>, Duration), BackendError> {
        let start = std::time::Instant::now();
        let items = tokio::time::timeout_at(deadline, self.retriever.search(request))
            .await
            .map_err(|_| BackendError::Timeout)??;
        Ok((items, start.elapsed()))
    }
}

impl fmt::Debug for Retrieval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrieval").finish_non_exhaustive()
    }
}
