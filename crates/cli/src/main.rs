use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use fakelet_controller::{
    custom_controller, node_controller, pod_controller, ControllerConfig, NodeRegistry, NodeSelection, PodIpAllocator,
};
use fakelet_core::stage::{ResourceRef, Stage};
use fakelet_kubehub::{find_api_resource, immediate_delete, watch, KubeEventRecorder, KubeObjectClient};
use fakelet_lifecycle::{group_by_resource, Lifecycle};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod stages;

const REPORTER: &str = "fakelet";

#[derive(Parser, Debug)]
#[command(name = "fakeletctl", version, about = "Drive fake nodes and pods through configured lifecycle stages")]
struct Cli {
    /// Stage files (multi-document YAML)
    #[arg(long = "stages", env = "FAKELET_STAGES", value_delimiter = ',', required = true)]
    stages: Vec<PathBuf>,

    /// Take over every node
    #[arg(long = "manage-all-nodes", action = ArgAction::SetTrue)]
    manage_all_nodes: bool,

    /// Take over nodes whose labels match, e.g. "type=fake"
    #[arg(long = "manage-nodes-with-label-selector")]
    manage_label_selector: Option<String>,

    /// Take over nodes whose annotations match
    #[arg(long = "manage-nodes-with-annotation-selector")]
    manage_annotation_selector: Option<String>,

    /// Leave the status of matching managed nodes alone
    #[arg(long = "disregard-status-with-label-selector")]
    disregard_label_selector: Option<String>,

    #[arg(long = "disregard-status-with-annotation-selector")]
    disregard_annotation_selector: Option<String>,

    /// Pod CIDR for nodes without spec.podCIDR
    #[arg(long = "cidr", env = "FAKELET_CIDR", default_value = "10.0.0.1/24")]
    cidr: String,

    /// Address reported for managed nodes
    #[arg(long = "node-ip", env = "FAKELET_NODE_IP", default_value = "196.168.0.1")]
    node_ip: String,

    /// Apply workers per controller (overrides FAKELET_WORKERS)
    #[arg(long = "workers")]
    workers: Option<usize>,
}

impl Cli {
    fn node_selection(&self) -> NodeSelection {
        NodeSelection {
            manage_all: self.manage_all_nodes,
            label_selector: self.manage_label_selector.clone(),
            annotation_selector: self.manage_annotation_selector.clone(),
            disregard_label_selector: self.disregard_label_selector.clone(),
            disregard_annotation_selector: self.disregard_annotation_selector.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("FAKELET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FAKELET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FAKELET_METRICS_ADDR; expected host:port");
        }
    }
}

fn compile(resource: &ResourceRef, stages: &[Stage]) -> Result<Lifecycle> {
    let lifecycle = Lifecycle::compile(stages).with_context(|| format!("compiling stages for {}", resource.kind))?;
    info!(kind = %resource.kind, group = %resource.api_group, stages = ?lifecycle.stage_names(), "lifecycle loaded");
    Ok(lifecycle)
}

struct Wiring {
    client: Client,
    config: ControllerConfig,
    done: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Wiring {
    fn nodes(&mut self, cli: &Cli, lifecycle: Lifecycle, registry: Arc<NodeRegistry>, allocator: Arc<PodIpAllocator>) -> Result<()> {
        let api_client = Arc::new(KubeObjectClient::<Node>::cluster(self.client.clone()));
        let ctrl = node_controller(api_client, &cli.node_selection(), registry, Some(allocator), &cli.node_ip)
            .context("node selection")?
            .lifecycle(lifecycle)
            .config(self.config.clone())
            .recorder(Arc::new(KubeEventRecorder::<Node>::new(self.client.clone(), REPORTER, ())))
            .build(self.done.clone());
        let events = watch(Api::<Node>::all(self.client.clone()), watcher::Config::default());
        self.tasks.push(tokio::spawn(ctrl.run(events)));
        Ok(())
    }

    fn pods(&mut self, cli: &Cli, lifecycle: Lifecycle, registry: Arc<NodeRegistry>, allocator: Arc<PodIpAllocator>) {
        let api_client =
            Arc::new(KubeObjectClient::<Pod>::namespaced(self.client.clone()).with_delete_params(immediate_delete()));
        let ctrl = pod_controller(api_client, registry, allocator, &cli.node_ip)
            .lifecycle(lifecycle)
            .config(self.config.clone())
            .recorder(Arc::new(KubeEventRecorder::<Pod>::new(self.client.clone(), REPORTER, ())))
            .build(self.done.clone());
        let events = watch(Api::<Pod>::all(self.client.clone()), watcher::Config::default());
        self.tasks.push(tokio::spawn(ctrl.run(events)));
    }

    async fn custom(&mut self, resource: &ResourceRef, lifecycle: Lifecycle) -> Result<()> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), resource)
            .await
            .with_context(|| format!("discovering {}/{}", resource.api_group, resource.kind))?;
        let api_client = Arc::new(KubeObjectClient::dynamic(self.client.clone(), ar.clone(), namespaced));
        let ctrl = custom_controller(resource, api_client)
            .lifecycle(lifecycle)
            .config(self.config.clone())
            .recorder(Arc::new(KubeEventRecorder::<DynamicObject>::new(self.client.clone(), REPORTER, ar.clone())))
            .build(self.done.clone());
        let events = watch(Api::<DynamicObject>::all_with(self.client.clone(), &ar), watcher::Config::default());
        self.tasks.push(tokio::spawn(ctrl.run(events)));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let stages = stages::load_stages(&cli.stages)?;
    let mut groups = group_by_resource(stages);
    let node_ref = ResourceRef::new("v1", "Node");
    let pod_ref = ResourceRef::new("v1", "Pod");
    let node_stages = groups.remove(&node_ref).unwrap_or_default();
    let pod_stages = groups.remove(&pod_ref).unwrap_or_default();

    let selection = cli.node_selection();
    let wants_nodes = !node_stages.is_empty() || !pod_stages.is_empty();
    if wants_nodes
        && !selection.manage_all
        && selection.label_selector.is_none()
        && selection.annotation_selector.is_none()
    {
        bail!("no nodes selected: pass --manage-all-nodes or a --manage-nodes-with-* selector");
    }

    let mut config = ControllerConfig::from_env();
    if let Some(n) = cli.workers {
        config = config.with_workers(n);
    }
    let client = Client::try_default().await.context("connecting to the API server")?;
    let done = CancellationToken::new();
    let mut wiring = Wiring { client, config, done: done.clone(), tasks: Vec::new() };

    if wants_nodes {
        let registry = Arc::new(NodeRegistry::new());
        let allocator = Arc::new(PodIpAllocator::new(&cli.cidr, Arc::clone(&registry)).context("--cidr")?);
        // The node controller also feeds the registry pods are filtered by.
        let nodes = compile(&node_ref, &node_stages)?;
        wiring.nodes(&cli, nodes, Arc::clone(&registry), Arc::clone(&allocator))?;
        if !pod_stages.is_empty() {
            let pods = compile(&pod_ref, &pod_stages)?;
            wiring.pods(&cli, pods, registry, allocator);
        }
    }
    for (resource, stages) in groups {
        let lifecycle = compile(&resource, &stages)?;
        wiring.custom(&resource, lifecycle).await?;
    }
    if wiring.tasks.is_empty() {
        bail!("no stages loaded from {:?}", cli.stages);
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "signal handler failed");
            }
            info!("shutting down");
        }
        _ = done.cancelled() => {}
    }
    done.cancel();
    for t in wiring.tasks {
        if let Err(e) = t.await {
            error!(error = %e, "controller task failed");
        }
    }
    Ok(())
}
