use crate::{
    config::{DispatcherConfig, OverflowPolicy},
    detector::Detector,
    error::DispatchError,
    task::{PendingTask, TaskIdGenerator, Ticket},
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, UpDownCounter},
};
use protocol::{DetectError, DetectionResponse, ErrorKind};
use std::any::Any;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Instant;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::Instrument;

#[derive(Clone)]
struct DispatchMetrics {
    queue_depth: UpDownCounter<i64>,
    submitted: Counter<u64>,
    failed: Counter<u64>,
    cancelled: Counter<u64>,
    wait_seconds: Histogram<f64>,
    detect_seconds: Histogram<f64>,
}

fn init_metrics(meter_name: &'static str) -> DispatchMetrics {
    let meter = global::meter(meter_name);
    let latency_buckets = [
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    DispatchMetrics {
        queue_depth: meter
            .i64_up_down_counter("dispatch_queue_depth")
            .with_description("Tasks enqueued and not yet picked up by the worker")
            .build(),
        submitted: meter
            .u64_counter("dispatch_tasks_total")
            .with_description("Tasks accepted into the queue")
            .build(),
        failed: meter
            .u64_counter("dispatch_tasks_failed_total")
            .with_description("Tasks that completed with an error")
            .build(),
        cancelled: meter
            .u64_counter("dispatch_tasks_cancelled_total")
            .with_description("Tasks skipped because their caller went away")
            .build(),
        wait_seconds: meter
            .f64_histogram("dispatch_wait_seconds")
            .with_description("Time between enqueue and the worker picking the task up")
            .with_unit("s")
            .with_boundaries(latency_buckets.to_vec())
            .build(),
        detect_seconds: meter
            .f64_histogram("dispatch_detect_seconds")
            .with_description("Time spent in the detector per task")
            .with_unit("s")
            .with_boundaries(latency_buckets.to_vec())
            .build(),
    }
}

/// Serializes concurrent callers onto one detector.
///
/// Callers enqueue images and each gets a [`Ticket`] bound to its own task. A
/// single worker pulls tasks in submission order and hands every result to the
/// ticket of the task that produced it.
pub struct Dispatcher {
    tx: mpsc::Sender<PendingTask>,
    ids: TaskIdGenerator,
    config: DispatcherConfig,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    /// Spawn the worker on the current runtime.
    pub fn start<D: Detector>(detector: D, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = init_metrics("dispatcher");

        let worker = tokio::spawn(run_worker(
            Arc::new(detector),
            rx,
            shutdown_rx,
            metrics.clone(),
        ));

        tracing::info!(
            queue_capacity = config.queue_capacity,
            overflow = ?config.overflow,
            task_timeout = ?config.task_timeout,
            "Dispatcher started"
        );

        Self {
            tx,
            ids: TaskIdGenerator::new(),
            config,
            closing: AtomicBool::new(false),
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Tasks waiting in the queue (not counting the one being processed).
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue an image and return the ticket for its result.
    ///
    /// With [`OverflowPolicy::Wait`] this waits for queue space (up to the task
    /// timeout). With [`OverflowPolicy::Reject`] a full queue fails immediately.
    pub async fn enqueue(&self, image: Vec<u8>) -> Result<Ticket, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }

        let id = self.ids.next();
        let (task, ticket) = PendingTask::new(id, image, self.config.task_timeout);

        self.metrics.queue_depth.add(1, &[]);
        let sent = match self.config.overflow {
            OverflowPolicy::Reject => self.tx.try_send(task).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull {
                    capacity: self.queue_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => DispatchError::ShuttingDown,
            }),
            OverflowPolicy::Wait => match self.config.task_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.tx.send(task)).await {
                    Ok(sent) => sent.map_err(|_| DispatchError::ShuttingDown),
                    Err(_) => Err(DispatchError::Timeout { id, waited: limit }),
                },
                None => self
                    .tx
                    .send(task)
                    .await
                    .map_err(|_| DispatchError::ShuttingDown),
            },
        };

        if let Err(e) = sent {
            self.metrics.queue_depth.add(-1, &[]);
            tracing::warn!(task_id = %id, error = %e, "Task not enqueued");
            return Err(e);
        }

        self.metrics.submitted.add(1, &[]);
        tracing::debug!(task_id = %id, "Task enqueued");
        Ok(ticket)
    }

    /// Enqueue and wait for this image's own result.
    pub async fn submit(&self, image: Vec<u8>) -> Result<DetectionResponse, DispatchError> {
        self.enqueue(image).await?.wait().await
    }

    /// [`Dispatcher::submit`] for callers on plain threads.
    ///
    /// Must not be called from inside the runtime `handle` belongs to.
    pub fn submit_blocking(
        &self,
        handle: &Handle,
        image: Vec<u8>,
    ) -> Result<DetectionResponse, DispatchError> {
        handle.block_on(self.submit(image))
    }

    /// Stop accepting tasks, finish everything already queued, then stop the worker.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Dispatcher shutdown already requested");
        }
        let _ = self.shutdown_tx.send(true);

        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            tracing::info!(pending = self.pending(), "Draining dispatcher queue");
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Dispatcher worker ended abnormally");
            }
            tracing::info!("Dispatcher stopped");
        }
    }
}

async fn run_worker<D: Detector>(
    detector: Arc<D>,
    mut rx: mpsc::Receiver<PendingTask>,
    mut shutdown: watch::Receiver<bool>,
    metrics: DispatchMetrics,
) {
    tracing::debug!("Dispatch worker running");

    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => return,
            },
        };
        process_task(&detector, task, &metrics).await;
    }

    // Intake is closed; whatever made it into the queue still gets served.
    rx.close();
    while let Some(task) = rx.recv().await {
        process_task(&detector, task, &metrics).await;
    }
}

async fn process_task<D: Detector>(detector: &Arc<D>, task: PendingTask, metrics: &DispatchMetrics) {
    let PendingTask {
        id,
        image,
        enqueued_at,
        reply,
    } = task;

    metrics.queue_depth.add(-1, &[]);
    metrics
        .wait_seconds
        .record(enqueued_at.elapsed().as_secs_f64(), &[]);

    if reply.is_closed() {
        metrics.cancelled.add(1, &[]);
        tracing::debug!(task_id = %id, "Caller gone, skipping task");
        return;
    }

    let span = tracing::info_span!("dispatch_task", task_id = %id, bytes = image.len());
    let start = Instant::now();

    // Run the detection on its own task so a panic only fails this task.
    let detector = Arc::clone(detector);
    let joined = tokio::spawn(async move { detector.detect(image).await }.instrument(span)).await;

    let result = match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!(task_id = %id, panic = %message, "Detector panicked");
            Err(DetectError::Backend(format!("detector panicked: {}", message)))
        }
        Err(e) => Err(DetectError::Backend(format!("detection task aborted: {}", e))),
    };

    metrics
        .detect_seconds
        .record(start.elapsed().as_secs_f64(), &[]);

    if let Err(e) = &result {
        let kind = match e.kind() {
            ErrorKind::Client => "client",
            ErrorKind::Server => "server",
        };
        metrics.failed.add(1, &[KeyValue::new("kind", kind)]);
        tracing::warn!(task_id = %id, error = %e, "Detection failed");
    } else {
        tracing::debug!(
            task_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Detection completed"
        );
    }

    if reply.send(result).is_err() {
        metrics.cancelled.add(1, &[]);
        tracing::debug!(task_id = %id, "Caller left before the result arrived");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
