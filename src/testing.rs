//! Shared fixtures for unit tests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, Pod, PodSpec, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::cluster::{CONTROL_PLANE_NS_LABEL, PROXY_CONTAINER_NAME, TRUST_ANCHORS_ENV};

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// A running pod with an injected proxy
pub(crate) fn meshed_pod(namespace: &str, name: &str, anchors: Option<&str>) -> Pod {
    let env = anchors.map(|value| {
        vec![EnvVar {
            name: TRUST_ANCHORS_ENV.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            labels: Some(BTreeMap::from([(
                CONTROL_PLANE_NS_LABEL.to_string(),
                "linkerd".to_string(),
            )])),
            ..meta(namespace, name)
        },
        spec: Some(PodSpec {
            containers: vec![
                Container {
                    name: "app".to_string(),
                    ..Default::default()
                },
                Container {
                    name: PROXY_CONTAINER_NAME.to_string(),
                    env,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// A secret with the given data keys
pub(crate) fn secret(namespace: &str, name: &str, type_: Option<&str>, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        type_: type_.map(str::to_string),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// A ConfigMap with the given data keys
pub(crate) fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: meta(namespace, name),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
