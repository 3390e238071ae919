use crate::{
    extract::{ProgressSink, ProgressUpdate},
    models::{ApiError, GroupRunRequest, GroupRunResponse},
    pipeline::Pipeline,
    security::AuthContext,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

type Statuses = Arc<Mutex<JobBook>>;

/// Job states plus the order jobs finished in. Only finished jobs are
/// evicted; queued and running ones stay until they finish.
struct JobBook {
    states: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    retention: usize,
}

impl JobBook {
    fn new(retention: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    fn finish(&mut self, id: Uuid, state: JobState) {
        self.states.insert(id, state);
        self.finished.push_back(id);
        while self.finished.len() > self.retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.states.remove(&evicted);
            }
        }
    }
}

/// Background queue for group runs. One worker drains the channel; the
/// extraction inside each run is already concurrent.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Statuses,
}

struct Job {
    id: Uuid,
    request: GroupRunRequest,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<ProgressUpdate>,
    },
    Completed {
        result: Box<GroupRunResponse>,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

// Guards are never held across an await, and a poisoned map is still
// readable.
fn lock(statuses: &Statuses) -> MutexGuard<'_, JobBook> {
    statuses.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobQueue {
    /// Starts the worker. At most `retention` finished jobs stay queryable.
    pub fn spawn(pipeline: Pipeline, capacity: usize, retention: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses: Statuses = Arc::new(Mutex::new(JobBook::new(retention)));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                lock(&statuses_bg)
                    .states
                    .insert(job.id, JobState::Running { progress: None });
                info!(
                    target = "metafield.api",
                    job_id = %job.id,
                    tag = %job.request.tag,
                    client = %job.context.label,
                    "job started"
                );

                let sink_statuses = statuses_bg.clone();
                let job_id = job.id;
                let sink: ProgressSink = Arc::new(move |update: &ProgressUpdate| {
                    lock(&sink_statuses).states.insert(
                        job_id,
                        JobState::Running {
                            progress: Some(update.clone()),
                        },
                    );
                });

                let result = pipeline.run_group(job.request, Some(sink)).await;
                let state = match result {
                    Ok(resp) => JobState::Completed {
                        result: Box::new(resp),
                    },
                    Err(err) => {
                        warn!(
                            target = "metafield.api",
                            job_id = %job.id,
                            stage = err.stage(),
                            error = %err,
                            "job failed"
                        );
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                lock(&statuses_bg).finish(job.id, state);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_group(
        &self,
        request: GroupRunRequest,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        lock(&self.statuses).states.insert(id, JobState::Queued);
        let job = Job {
            id,
            request,
            context,
        };
        if self.tx.send(job).await.is_err() {
            lock(&self.statuses).states.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<JobInfo> {
        lock(&self.statuses).states.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}
