//! [`BuildJobApi`] backed by a Kubernetes API server.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use repobuild_config::cluster::MAX_WATCH_TIMEOUT;
use repobuild_core::{Error, Result};
use std::pin::pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::cluster::{BuildJobApi, JobWatchEvent};

/// Events buffered between the API server and a slow consumer.
const STREAM_BUFFER: usize = 100;

/// Pods in one namespace, reached through a kube client.
#[derive(Clone)]
pub struct KubeJobApi {
    pods: Api<Pod>,
    namespace: String,
}

impl KubeJobApi {
    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            pods: Api::namespaced(client, &namespace),
            namespace,
        }
    }
}

/// Map a kube error onto the crate's error kinds by HTTP status.
pub fn map_kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => Error::NotFound(response.message),
            409 => Error::Conflict(response.message),
            401 => Error::Unauthorized(response.message),
            403 => Error::Forbidden(response.message),
            code => Error::Api {
                code,
                message: response.message,
            },
        },
        other => Error::Transport(other.to_string()),
    }
}

fn watch_timeout_secs(timeout: Duration) -> u32 {
    timeout.clamp(Duration::from_secs(1), MAX_WATCH_TIMEOUT).as_secs() as u32
}

#[async_trait]
impl BuildJobApi for KubeJobApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, job: &Pod) -> Result<()> {
        self.pods
            .create(&PostParams::default(), job)
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.pods
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        let pods = self.pods.list(&params).await.map_err(map_kube_error)?;
        Ok(pods.items)
    }

    async fn watch(
        &self,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<JobWatchEvent>>> {
        let pods = self.pods.clone();
        let params = WatchParams::default()
            .labels(label_selector)
            .timeout(watch_timeout_secs(timeout));
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        // The watch stream borrows its parameters, so it is driven from a
        // task that owns them and forwarded through a channel.
        tokio::spawn(async move {
            let stream = match pods.watch(&params, "0").await {
                Ok(stream) => {
                    let _ = opened_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(map_kube_error(e)));
                    return;
                }
            };
            let mut stream = pin!(stream);

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => next,
                };
                let Some(event) = next else { break };

                let item = match event {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                        JobWatchEvent::Applied(pod)
                    }
                    Ok(WatchEvent::Deleted(pod)) => JobWatchEvent::Deleted(pod),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(response)) => {
                        let _ = tx.send(Err(map_kube_error(kube::Error::Api(response)))).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(map_kube_error(e))).await;
                        break;
                    }
                };
                if tx.send(Ok(item)).await.is_err() {
                    break;
                }
            }
            debug!("Watch stream closed");
        });

        opened_rx
            .await
            .map_err(|_| Error::Internal("watch task exited before opening".to_string()))??;
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn logs(
        &self,
        name: &str,
        tail_lines: Option<i64>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let pods = self.pods.clone();
        let pod_name = name.to_string();
        let params = LogParams {
            follow: true,
            tail_lines,
            ..Default::default()
        };
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod_name, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(map_kube_error(e)));
                    return;
                }
            };
            info!(pod = %pod_name, tail = ?params.tail_lines, "Following pod logs");
            let mut lines = pin!(reader.lines());

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = lines.next() => next,
                };
                let Some(line) = next else { break };

                let item = line.map_err(|e| Error::Transport(e.to_string()));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            if tx.is_closed() {
                debug!(pod = %pod_name, "Log consumer went away");
            } else {
                info!(pod = %pod_name, "Pod log stream ended");
            }
        });

        opened_rx
            .await
            .map_err(|_| Error::Internal("log task exited before opening".to_string()))??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}
