use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::annotation;
use crate::cache::{DescheduleScan, SharedCache, pod_key};
use crate::error::{Error, Result};
use crate::labels::{
    CARDS_ANNOTATION, POD_DESCHEDULE_LABEL, POD_DESCHEDULE_VALUE, TILES_ANNOTATION,
};

const LABEL_UPDATE_ATTEMPTS: usize = 5;

/// Whether any of the pod's allocated cards or tiles intersect the node's
/// descheduled sets.
pub fn pod_needs_deschedule(
    card_annotation: &str,
    tile_annotation: &str,
    scan: &DescheduleScan,
) -> bool {
    if card_annotation.is_empty() {
        return false;
    }
    let cards = annotation::parse_card_annotation(card_annotation);
    if cards
        .iter()
        .flatten()
        .any(|card| scan.cards.contains(card))
    {
        return true;
    }

    if tile_annotation.is_empty() {
        return false;
    }
    match annotation::parse_tile_annotation(tile_annotation) {
        Ok(containers) => containers.iter().flatten().any(|(card, tiles)| {
            tiles
                .iter()
                .any(|tile| scan.tiles.contains(&format!("{card}_gt{tile}")))
        }),
        Err(err) => {
            warn!(%err, "unreadable tile annotation, ignoring tiles");
            false
        }
    }
}

/// Re-examines the running pods on the scanned node and reconciles their
/// deschedule labels. Patches only pods whose computed need differs from the
/// remembered status, so repeated scans do not repeat patches.
pub async fn apply_scan(client: &Client, cache: &SharedCache, scan: &DescheduleScan) -> Result<()> {
    let pods: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!(
        "spec.nodeName={},status.phase=Running",
        scan.node
    ));
    let running = pods.list(&params).await?;
    debug!(node = %scan.node, pods = running.items.len(), "re-examining running pods");

    for pod in running.items {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = pod_key(&namespace, &name);

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let cards = annotations
            .get(CARDS_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let tiles = annotations
            .get(TILES_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        let wanted = pod_needs_deschedule(&cards, &tiles, scan);
        let remembered = { cache.read().await.pod_deschedule_status(&key) };
        if remembered == Some(wanted) {
            continue;
        }

        set_pod_deschedule_label(client, &namespace, &name, wanted).await?;
        cache.write().await.set_pod_deschedule_status(&key, wanted);
        info!(pod = %key, wanted, "updated deschedule label");
    }

    Ok(())
}

/// Read-modify-write label update with up to five attempts; an optimistic
/// concurrency conflict refetches and reapplies, any other error breaks out.
pub async fn set_pod_deschedule_label(
    client: &Client,
    namespace: &str,
    name: &str,
    wanted: bool,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let mut last_error: Option<Error> = None;
    for attempt in 0..LABEL_UPDATE_ATTEMPTS {
        let mut pod = pods.get(name).await?;
        let labels = pod.metadata.labels.get_or_insert_with(Default::default);
        if wanted {
            labels.insert(
                POD_DESCHEDULE_LABEL.to_string(),
                POD_DESCHEDULE_VALUE.to_string(),
            );
        } else {
            labels.remove(POD_DESCHEDULE_LABEL);
        }

        match pods
            .replace(name, &kube::api::PostParams::default(), &pod)
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(pod = name, attempt, "label update conflict, refetching");
                last_error = Some(Error::Api(kube::Error::Api(response)));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::NotFound(format!("pod {namespace}/{name} label update never attempted"))
    }))
}
