//! Single-shot job results.
//!
//! A [`JobResult`] is the receiving half of a job's outcome; the worker holds
//! the matching [`ResultSender`]. Sending consumes the sender, so an outcome is
//! delivered at most once, and dropping it unsent fails the result with
//! [`RuntimeError::ResultDropped`].
//!
//! A Runnable may produce another job's result ([`Output::Pending`]) or a
//! [`Group`] as its output. Awaiting the outer result then follows the chain
//! iteratively until a plain value or an error is reached.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use runnr_common::RuntimeError;

/// The value a job produces.
#[derive(Debug, Default)]
pub enum Output {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
    /// Forward to another job's result.
    Pending(JobResult),
    /// Wait for every result in the group.
    Group(Group),
}

impl Output {
    /// The output as bytes.
    ///
    /// # Errors
    ///
    /// Fails for unresolved outputs ([`Output::Pending`], [`Output::Group`]).
    pub fn to_bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::Bytes(b) => Ok(b.clone()),
            Self::Text(s) => Ok(s.clone().into_bytes()),
            Self::Json(v) => {
                serde_json::to_vec(v).map_err(|e| RuntimeError::payload(e.to_string()))
            }
            Self::Pending(_) | Self::Group(_) => {
                Err(RuntimeError::payload("output is not resolved yet"))
            }
        }
    }

    /// Consume the output as bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Text(s) => Ok(s.into_bytes()),
            other => other.to_bytes(),
        }
    }
}

impl From<Vec<u8>> for Output {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<String> for Output {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Output {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Output {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<JobResult> for Output {
    fn from(r: JobResult) -> Self {
        Self::Pending(r)
    }
}

impl From<Group> for Output {
    fn from(g: Group) -> Self {
        Self::Group(g)
    }
}

type Outcome = Result<Output, RuntimeError>;

/// Producing half of a [`JobResult`].
#[derive(Debug)]
pub struct ResultSender {
    uuid: String,
    tx: oneshot::Sender<Outcome>,
}

impl ResultSender {
    /// Deliver the outcome. Ignored if the result was already dropped.
    pub fn send(self, outcome: Outcome) {
        if self.tx.send(outcome).is_err() {
            debug!(uuid = %self.uuid, "result receiver dropped before delivery");
        }
    }

    pub fn send_result(self, output: impl Into<Output>) {
        self.send(Ok(output.into()));
    }

    pub fn send_error(self, error: RuntimeError) {
        self.send(Err(error));
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// The eventual outcome of a job.
#[derive(Debug)]
pub struct JobResult {
    uuid: String,
    rx: oneshot::Receiver<Outcome>,
}

impl JobResult {
    /// A connected sender and result for the job `uuid`.
    pub fn pair(uuid: impl Into<String>) -> (ResultSender, JobResult) {
        let uuid = uuid.into();
        let (tx, rx) = oneshot::channel();
        (
            ResultSender {
                uuid: uuid.clone(),
                tx,
            },
            JobResult { uuid, rx },
        )
    }

    /// A result that already holds `outcome`.
    pub fn ready(uuid: impl Into<String>, outcome: Outcome) -> Self {
        let (sender, result) = Self::pair(uuid);
        sender.send(outcome);
        result
    }

    /// The uuid of the job this result belongs to.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Wait for the outcome, following any forwarded results or groups.
    ///
    /// The returned output is never [`Output::Pending`] or [`Output::Group`];
    /// a completed group yields [`Output::Empty`].
    pub async fn then(self) -> Outcome {
        let mut outcome = self.rx.await.unwrap_or(Err(RuntimeError::ResultDropped));

        loop {
            outcome = match outcome {
                Ok(Output::Pending(next)) => {
                    next.rx.await.unwrap_or(Err(RuntimeError::ResultDropped))
                }
                Ok(Output::Group(group)) => return group.wait().await.map(|()| Output::Empty),
                resolved => return resolved,
            };
        }
    }

    /// Run `callback` with the outcome once it is available.
    pub fn then_do<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        tokio::spawn(async move { callback(self.then().await) })
    }

    /// Wait for the outcome and decode it as JSON.
    pub async fn then_json<T: DeserializeOwned>(self) -> Result<T, RuntimeError> {
        let bytes = self.then().await?.into_bytes()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RuntimeError::payload(format!("output is not the expected JSON: {e}")))
    }

    /// Drain and drop the outcome in the background.
    pub fn discard(self) {
        tokio::spawn(async move {
            if let Err(e) = self.then().await {
                debug!(error = %e, "discarded job failed");
            }
        });
    }
}

/// An ordered collection of results awaited together.
#[derive(Debug, Default)]
pub struct Group {
    results: Vec<JobResult>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: JobResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Wait for every result. Returns the first error in insertion order, if any.
    pub fn wait(self) -> BoxFuture<'static, Result<(), RuntimeError>> {
        Box::pin(async move {
            let mut first_err = None;
            for result in self.results {
                if let Err(e) = result.then().await {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

impl FromIterator<JobResult> for Group {
    fn from_iter<I: IntoIterator<Item = JobResult>>(iter: I) -> Self {
        Self {
            results: iter.into_iter().collect(),
        }
    }
}
