use futures::{StreamExt, pin_mut};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use kube::api::Api;
use kube::runtime::{WatchStreamExt, watcher};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{NodeAction, PodAction, SharedCache, pod_is_completed, pod_key};
use crate::deschedule;
use crate::error::Error;
use crate::labels::{CARDS_ANNOTATION, TILES_ANNOTATION};

const MAX_REQUEUE_ATTEMPTS: u32 = 8;

/// A pod event with everything the handler needs, extracted at enqueue time.
#[derive(Debug)]
pub struct PodWork {
    pub action: PodAction,
    pub pod: Pod,
    pub card_annotation: String,
    pub tile_annotation: String,
    pub node: String,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct NodeWork {
    pub action: NodeAction,
    pub node: Node,
    pub attempts: u32,
}

/// Runs both watchers and their single-consumer queues until the token is
/// cancelled. Each queue has exactly one consumer task; ordering within a
/// queue is delivery order plus rate-limited requeues.
pub async fn run(client: Client, cache: SharedCache, token: CancellationToken) {
    let (pod_tx, pod_rx) = mpsc::unbounded_channel();
    let (node_tx, node_rx) = mpsc::unbounded_channel();

    let tasks = [
        tokio::spawn(watch_pods(client.clone(), pod_tx.clone(), token.clone())),
        tokio::spawn(watch_nodes(client.clone(), node_tx.clone(), token.clone())),
        tokio::spawn(consume_pods(cache.clone(), pod_rx, pod_tx, token.clone())),
        tokio::spawn(consume_nodes(client, cache, node_rx, node_tx, token)),
    ];
    for task in tasks {
        if let Err(err) = task.await {
            warn!(%err, "event loop task panicked");
        }
    }
    info!("event loops drained");
}

/// Watches pods cluster-wide, admitting only pods that request GPU resources,
/// and turns watcher events into typed queue items.
async fn watch_pods(client: Client, queue: mpsc::UnboundedSender<PodWork>, token: CancellationToken) {
    let pods: Api<Pod> = Api::all(client);
    let stream = watcher(pods, watcher::Config::default()).default_backoff();
    pin_mut!(stream);

    let mut known: HashSet<String> = HashSet::new();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                if !crate::cache::pod_requests_gpus(&pod) {
                    continue;
                }
                let key = pod_key(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                );
                let action = if pod_is_completed(&pod) {
                    PodAction::Completed
                } else if known.insert(key.clone()) {
                    PodAction::Added
                } else {
                    PodAction::Updated
                };
                enqueue_pod(&queue, action, pod);
            }
            Some(Ok(watcher::Event::Delete(pod))) => {
                if !crate::cache::pod_requests_gpus(&pod) {
                    continue;
                }
                let key = pod_key(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                );
                known.remove(&key);
                enqueue_pod(&queue, PodAction::Deleted, pod);
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
            #[allow(unreachable_patterns)]
            Some(Ok(_)) => warn!("unrecognized pod watch event, dropping"),
            Some(Err(err)) => warn!(%err, "pod watch error"),
            None => break,
        }
    }
    debug!("pod watcher stopped");
}

fn enqueue_pod(queue: &mpsc::UnboundedSender<PodWork>, action: PodAction, pod: Pod) {
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let work = PodWork {
        action,
        card_annotation: annotations.get(CARDS_ANNOTATION).cloned().unwrap_or_default(),
        tile_annotation: annotations.get(TILES_ANNOTATION).cloned().unwrap_or_default(),
        node: pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default(),
        pod,
        attempts: 0,
    };
    let _ = queue.send(work);
}

/// Watches nodes, admitting only nodes with allocatable GPU plugin resources.
async fn watch_nodes(
    client: Client,
    queue: mpsc::UnboundedSender<NodeWork>,
    token: CancellationToken,
) {
    let nodes: Api<Node> = Api::all(client);
    let stream = watcher(nodes, watcher::Config::default()).default_backoff();
    pin_mut!(stream);

    let mut known: HashSet<String> = HashSet::new();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Apply(node) | watcher::Event::InitApply(node))) => {
                if !crate::cache::node_has_gpu_capacity(&node) {
                    continue;
                }
                let name = node.metadata.name.clone().unwrap_or_default();
                let action = if known.insert(name) {
                    NodeAction::Added
                } else {
                    NodeAction::Updated
                };
                let _ = queue.send(NodeWork {
                    action,
                    node,
                    attempts: 0,
                });
            }
            Some(Ok(watcher::Event::Delete(node))) => {
                let name = node.metadata.name.clone().unwrap_or_default();
                if known.remove(&name) {
                    let _ = queue.send(NodeWork {
                        action: NodeAction::Deleted,
                        node,
                        attempts: 0,
                    });
                }
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
            #[allow(unreachable_patterns)]
            Some(Ok(_)) => warn!("unrecognized node watch event, dropping"),
            Some(Err(err)) => warn!(%err, "node watch error"),
            None => break,
        }
    }
    debug!("node watcher stopped");
}

/// The pod queue's only consumer.
async fn consume_pods(
    cache: SharedCache,
    mut queue: mpsc::UnboundedReceiver<PodWork>,
    requeue: mpsc::UnboundedSender<PodWork>,
    token: CancellationToken,
) {
    loop {
        let work = tokio::select! {
            _ = token.cancelled() => break,
            work = queue.recv() => work,
        };
        let Some(work) = work else { break };

        let result = {
            let mut state = cache.write().await;
            state.handle_pod_event(
                work.action,
                &work.pod,
                &work.card_annotation,
                &work.tile_annotation,
                &work.node,
            )
        };
        if let Err(err) = result {
            requeue_pod_work(&requeue, work, err);
        }
    }
    debug!("pod consumer stopped");
}

fn requeue_pod_work(requeue: &mpsc::UnboundedSender<PodWork>, mut work: PodWork, err: Error) {
    if !err.is_retryable() {
        warn!(%err, "dropping pod event");
        return;
    }
    if work.attempts >= MAX_REQUEUE_ATTEMPTS {
        warn!(%err, attempts = work.attempts, "giving up on pod event");
        return;
    }
    work.attempts += 1;
    warn!(%err, attempts = work.attempts, "requeueing pod event");
    let requeue = requeue.clone();
    let delay = requeue_delay(work.attempts);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = requeue.send(work);
    });
}

/// The node queue's only consumer. Descheduling scans run after the lock is
/// released; a scan that fails requeues the node event so the unchanged sets
/// are re-derived and retried.
async fn consume_nodes(
    client: Client,
    cache: SharedCache,
    mut queue: mpsc::UnboundedReceiver<NodeWork>,
    requeue: mpsc::UnboundedSender<NodeWork>,
    token: CancellationToken,
) {
    loop {
        let work = tokio::select! {
            _ = token.cancelled() => break,
            work = queue.recv() => work,
        };
        let Some(work) = work else { break };

        let scan = {
            let mut state = cache.write().await;
            state.handle_node_event(work.action, &work.node)
        };
        let Some(scan) = scan else { continue };

        match deschedule::apply_scan(&client, &cache, &scan).await {
            Ok(()) => {
                cache.write().await.commit_deschedule_scan(&scan);
            }
            Err(err) => requeue_node_work(&requeue, work, err),
        }
    }
    debug!("node consumer stopped");
}

fn requeue_node_work(requeue: &mpsc::UnboundedSender<NodeWork>, mut work: NodeWork, err: Error) {
    if !err.is_retryable() {
        warn!(%err, "dropping node event");
        return;
    }
    if work.attempts >= MAX_REQUEUE_ATTEMPTS {
        warn!(%err, attempts = work.attempts, "giving up on node event");
        return;
    }
    work.attempts += 1;
    warn!(%err, attempts = work.attempts, "requeueing node event");
    let requeue = requeue.clone();
    let delay = requeue_delay(work.attempts);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = requeue.send(work);
    });
}

fn requeue_delay(attempts: u32) -> Duration {
    Duration::from_millis(200u64.saturating_mul(1 << attempts.min(6)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_delay_grows_and_caps() {
        assert_eq!(requeue_delay(1), Duration::from_millis(400));
        assert_eq!(requeue_delay(2), Duration::from_millis(800));
        assert_eq!(requeue_delay(6), requeue_delay(7));
    }
}
