use k8s_openapi::api::core::v1::{Container, Node, NodeStatus, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

fn string_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn quantity_map(entries: &[(&str, i64)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// A pod with auto-named containers (`container0`, `container1`, …), one per
/// request slice.
pub fn create_mock_pod(name: &str, containers: &[&[(&str, i64)]], annotations: &[(&str, &str)]) -> Pod {
    let named: Vec<(String, Vec<(&str, i64)>)> = containers
        .iter()
        .enumerate()
        .map(|(index, requests)| (format!("container{index}"), requests.to_vec()))
        .collect();
    let borrowed: Vec<(&str, &[(&str, i64)])> = named
        .iter()
        .map(|(cname, requests)| (cname.as_str(), requests.as_slice()))
        .collect();
    create_mock_named_pod(name, &borrowed, annotations)
}

/// A pod with explicitly named containers.
pub fn create_mock_named_pod(
    name: &str,
    containers: &[(&str, &[(&str, i64)])],
    annotations: &[(&str, &str)],
) -> Pod {
    let containers = containers
        .iter()
        .map(|(cname, requests)| Container {
            name: cname.to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(quantity_map(requests)),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(string_map(annotations)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A node with the given labels and allocatable resources.
pub fn create_mock_node(name: &str, labels: &[(&str, &str)], allocatable: &[(&str, i64)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(string_map(labels)),
            ..Default::default()
        },
        status: Some(NodeStatus {
            allocatable: Some(quantity_map(allocatable)),
            capacity: Some(quantity_map(allocatable)),
            ..Default::default()
        }),
        ..Default::default()
    }
}
