use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use arango_core::crd::{DeploymentSpec, ServerGroup};
use arango_core::LABEL_ROLE;

use crate::resources::{ResourceNames, ARANGO_PORT};

/// Build the services of a deployment.
///
/// The headless service gives every member a stable DNS name, the client service balances over
/// the servers which accept client traffic in the deployment's mode.
pub fn build_services(spec: &DeploymentSpec, names: &ResourceNames) -> Vec<Service> {
    let client_role = if spec.mode.has_coordinators() {
        ServerGroup::Coordinators
    } else {
        ServerGroup::Single
    };
    let mut client_selector = names.labels();
    client_selector.insert(LABEL_ROLE.into(), client_role.as_role().into());

    vec![
        build_service(names, names.headless_service_name(), names.labels(), true),
        build_service(names, names.client_service_name(), client_selector, false),
    ]
}

fn build_service(names: &ResourceNames, name: String, selector: std::collections::BTreeMap<String, String>, headless: bool) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(names.namespace.clone()),
            labels: Some(names.labels()),
            owner_references: names.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: if headless { Some("None".into()) } else { None },
            publish_not_ready_addresses: Some(headless),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("server".into()),
                port: ARANGO_PORT,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(ARANGO_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
