use arango_core::crd::{DeploymentMode, DeploymentSpec, MemberStatus, ServerGroup};

use crate::resources::{ResourceNames, ARANGOSYNC_PORT, ARANGO_PORT};

/// The directory holding the data of a server.
pub const DATA_MOUNT_PATH: &str = "/data";
/// The environment variable holding the JWT secret inside server containers.
pub const ENV_JWT_SECRET: &str = "ARANGOD_JWT_SECRET";

/// Build the command line arguments of the given member.
///
/// Operator owned options come first, sorted by key, followed by the group's own args. The result
/// only depends on its inputs, so it can be compared against the args of a running pod.
pub fn member_args(spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup, id: &str, agents: &[MemberStatus]) -> Vec<String> {
    let mut options = if group.is_arangosync() {
        arangosync_options(spec, names, group)
    } else {
        arangod_options(spec, names, group, id, agents)
    };
    options.sort();
    let mut args: Vec<String> = options.into_iter().map(|(key, val)| format!("{}={}", key, val)).collect();
    if group.is_arangosync() {
        let cmd = if group == ServerGroup::SyncMasters { "master" } else { "worker" };
        args.insert(0, cmd.into());
        args.insert(0, "run".into());
    }
    args.extend(spec.group_spec(group).args.iter().cloned());
    args
}

fn scheme(spec: &DeploymentSpec) -> &'static str {
    if spec.tls.is_secure() {
        "ssl"
    } else {
        "tcp"
    }
}

fn arangod_options(spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup, id: &str, agents: &[MemberStatus]) -> Vec<(&'static str, String)> {
    let scheme = scheme(spec);
    let mut options = vec![
        ("--server.endpoint", format!("{}://[::]:{}", scheme, ARANGO_PORT)),
        ("--server.storage-engine", spec.storage_engine.as_arangod_value().into()),
        ("--database.directory", DATA_MOUNT_PATH.into()),
        ("--log.output", "+".into()),
    ];
    if spec.auth.is_authenticated() {
        options.push(("--server.authentication", "true".into()));
        options.push(("--server.jwt-secret", format!("$({})", ENV_JWT_SECRET)));
    } else {
        options.push(("--server.authentication", "false".into()));
    }

    let my_address = format!("{}://{}:{}", scheme, names.member_dns_name(group, id), ARANGO_PORT);
    let agent_endpoints = agents
        .iter()
        .map(|agent| format!("{}://{}:{}", scheme, names.member_dns_name(ServerGroup::Agents, &agent.id), ARANGO_PORT));
    match group {
        ServerGroup::Agents => {
            options.push(("--agency.activate", "true".into()));
            options.push(("--agency.my-address", my_address));
            options.push(("--agency.size", spec.agents.count().to_string()));
            options.push(("--agency.supervision", "true".into()));
            options.push(("--foxx.queues", "false".into()));
            options.push(("--server.statistics", "false".into()));
            let peers = agents.iter().filter(|agent| agent.id != id);
            for peer in peers {
                let dns = names.member_dns_name(ServerGroup::Agents, &peer.id);
                options.push(("--agency.endpoint", format!("{}://{}:{}", scheme, dns, ARANGO_PORT)));
            }
        }
        ServerGroup::DBServers => {
            options.push(("--cluster.my-address", my_address));
            options.push(("--cluster.my-role", "PRIMARY".into()));
            options.push(("--foxx.queues", "false".into()));
            options.push(("--server.statistics", "true".into()));
            options.extend(agent_endpoints.map(|ep| ("--cluster.agency-endpoint", ep)));
        }
        ServerGroup::Coordinators => {
            options.push(("--cluster.my-address", my_address));
            options.push(("--cluster.my-role", "COORDINATOR".into()));
            options.push(("--foxx.queues", "true".into()));
            options.push(("--server.statistics", "true".into()));
            options.extend(agent_endpoints.map(|ep| ("--cluster.agency-endpoint", ep)));
        }
        ServerGroup::Single => {
            options.push(("--foxx.queues", "true".into()));
            options.push(("--server.statistics", "true".into()));
            if spec.mode == DeploymentMode::ResilientSingle {
                options.push(("--replication.automatic-failover", "true".into()));
                options.push(("--cluster.my-address", my_address));
                options.push(("--cluster.my-role", "SINGLE".into()));
                options.extend(agent_endpoints.map(|ep| ("--cluster.agency-endpoint", ep)));
            }
        }
        ServerGroup::SyncMasters | ServerGroup::SyncWorkers => (),
    }
    options
}

fn arangosync_options(spec: &DeploymentSpec, names: &ResourceNames, group: ServerGroup) -> Vec<(&'static str, String)> {
    let mut options = vec![("--server.port", ARANGOSYNC_PORT.to_string())];
    let cluster_endpoint = format!("https://{}:{}", names.client_dns_name(), ARANGO_PORT);
    options.push(("--cluster.endpoint", cluster_endpoint));
    if spec.auth.is_authenticated() {
        options.push(("--cluster.jwt-secret", format!("$({})", ENV_JWT_SECRET)));
    }
    if group == ServerGroup::SyncWorkers {
        let master_endpoint = format!("https://{}-sync.{}.svc:{}", names.deployment, names.namespace, ARANGOSYNC_PORT);
        options.push(("--master.endpoint", master_endpoint));
    }
    options
}
