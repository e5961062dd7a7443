use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource};
use machine_api_operator::clock::{Clock, SystemClock};
use machine_api_operator::controller::operator::{
    FeatureGates, Images, OperatorSettings, CLUSTER_OPERATOR_NAME, OPERATOR_KEY,
};
use machine_api_operator::controller::{
    mapping, Collector, MachineHealthCheckReconciler, MachineSetReconciler, OperatorReconciler,
    OperatorStores, COLLECTION_INTERVAL,
};
use machine_api_operator::crd::{
    ClusterOperator, Infrastructure, Machine, MachineHealthCheck, MachineSet, Proxy,
};
use machine_api_operator::engine::{
    self, controller_owner_key, reflect, wait_for_cache_sync, Context, ObjectKey, Shutdown,
};
use machine_api_operator::leader::{self, LeaderElectionConfig, LeaderElector};
use machine_api_operator::server::{self, Readiness};
use machine_api_operator::store::KubeStore;
use machine_api_operator::telemetry::{self, LogFormat};
use machine_api_operator::{duration, Error, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Start(StartArgs),
    /// Print the version
    Version,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// JSON file with the images of every managed container
    #[arg(long)]
    images_json: PathBuf,

    /// Namespace holding Machines, MachineSets and the managed operands
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "openshift-machine-api")]
    namespace: String,

    /// Acquire the leader lease before reconciling
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = clap::ArgAction::Set)]
    leader_elect: bool,

    #[arg(long, default_value = "137s", value_parser = duration::parse)]
    leader_elect_lease_duration: Duration,

    #[arg(long, default_value = "107s", value_parser = duration::parse)]
    leader_elect_renew_deadline: Duration,

    #[arg(long, default_value = "26s", value_parser = duration::parse)]
    leader_elect_retry_period: Duration,

    #[arg(long, default_value = leader::DEFAULT_LEASE_NAME)]
    leader_elect_lease_name: String,

    /// Metrics address; the port is replaced by METRICS_PORT when set
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// Directory with tls.crt and tls.key for the metrics endpoint
    #[arg(long)]
    metrics_cert_dir: Option<PathBuf>,

    #[arg(long, default_value = ":9440")]
    health_addr: String,

    #[arg(long, default_value_t = 8443)]
    webhook_port: u16,

    #[arg(long, default_value = "/etc/machine-api-operator/tls")]
    webhook_cert_dir: String,

    #[arg(long, env = "RELEASE_VERSION", default_value = "0.0.1-snapshot")]
    release_version: String,

    /// Comma separated Name=bool pairs
    #[arg(long)]
    feature_gates: Option<FeatureGates>,

    /// Concurrent MachineSet reconciles
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=10))]
    machineset_workers: u16,

    /// text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("machine-api-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Start(start_args) => {
            telemetry::init(start_args.log_format)?;
            let result = run(start_args).await;
            if let Err(e) = &result {
                error!("Operator exited: {e}");
            }
            telemetry::shutdown();
            result
        }
    }
}

async fn run(args: StartArgs) -> Result<()> {
    info!("Starting machine-api-operator v{}", env!("CARGO_PKG_VERSION"));

    let images = Images::load(&args.images_json)?;
    let settings = OperatorSettings {
        namespace: args.namespace.clone(),
        release_version: args.release_version.clone(),
        webhook_port: args.webhook_port,
        webhook_cert_dir: args.webhook_cert_dir.clone(),
        features: args.feature_gates.clone().unwrap_or_default(),
    };
    let metrics_port = std::env::var(server::METRICS_PORT_ENV).ok();
    let metrics_addr = server::metrics_address(&args.metrics_bind_address, metrics_port.as_deref())?;
    let health_addr = server::parse_bind_address(&args.health_addr)?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let readiness = Readiness::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(server::serve_health(
        health_addr,
        readiness.clone(),
        shutdown.signal(),
    ));
    {
        let cert_dir = args.metrics_cert_dir.clone();
        let signal = shutdown.signal();
        tasks.spawn(async move { server::serve_metrics(metrics_addr, cert_dir.as_deref(), signal).await });
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if args.leader_elect {
        let config = LeaderElectionConfig {
            lease_name: args.leader_elect_lease_name.clone(),
            identity: leader::default_identity(),
            lease_duration: args.leader_elect_lease_duration,
            renew_deadline: args.leader_elect_renew_deadline,
            retry_period: args.leader_elect_retry_period,
        };
        config.validate()?;
        let leases = Arc::new(KubeStore::<Lease>::namespaced(client.clone(), &args.namespace));
        let elector = Arc::new(LeaderElector::new(leases, clock.clone(), config));
        if !elector.acquire(shutdown.signal()).await? {
            info!("Shutdown before acquiring leadership");
            return drain(tasks, &shutdown).await;
        }
        let signal = shutdown.signal();
        tasks.spawn(async move { elector.hold(signal).await });
    } else {
        warn!("Leader election disabled");
    }

    let ns = args.namespace.as_str();
    let wc = watcher::Config::default;

    // Machines and MachineHealthChecks are read by controllers keyed on other kinds.
    let (machine_cache, machine_reflector) =
        reflect(Api::<Machine>::namespaced(client.clone(), ns), shutdown.signal());
    let (mhc_cache, mhc_reflector) = reflect(
        Api::<MachineHealthCheck>::namespaced(client.clone(), ns),
        shutdown.signal(),
    );
    tasks.spawn(machine_reflector);
    tasks.spawn(mhc_reflector);
    if !synced("Machine", &machine_cache, &shutdown).await?
        || !synced("MachineHealthCheck", &mhc_cache, &shutdown).await?
    {
        return drain(tasks, &shutdown).await;
    }

    let node_controller = Controller::new(Api::<Node>::all(client.clone()), wc());
    let machine_set_controller =
        Controller::new(Api::<MachineSet>::namespaced(client.clone(), ns), wc());
    let node_cache = node_controller.store();
    let machine_set_cache = machine_set_controller.store();

    let machines = Arc::new(
        KubeStore::<Machine>::namespaced(client.clone(), ns).with_cache(machine_cache.clone()),
    );
    let machine_sets = Arc::new(
        KubeStore::<MachineSet>::namespaced(client.clone(), ns)
            .with_cache(machine_set_cache.clone()),
    );
    let nodes = Arc::new(KubeStore::<Node>::cluster(client.clone()).with_cache(node_cache.clone()));
    let health_checks = Arc::new(
        KubeStore::<MachineHealthCheck>::namespaced(client.clone(), ns).with_cache(mhc_cache),
    );
    let config_maps = Arc::new(KubeStore::<ConfigMap>::namespaced(client.clone(), ns));

    // MachineHealthCheck remediation, keyed by Node.
    let mhc_ctx = Arc::new(Context::new(
        Arc::new(MachineHealthCheckReconciler::new(
            nodes.clone(),
            machines.clone(),
            health_checks,
            config_maps.clone(),
            clock.clone(),
        )),
        shutdown.clone(),
    ));
    let node_controller = {
        let all_nodes = node_cache.clone();
        let configured_nodes = node_cache.clone();
        node_controller
            .watches(Api::<Machine>::namespaced(client.clone(), ns), wc(), |m: Machine| {
                object_refs::<Node>(mapping::node_keys_for_machine(&m))
            })
            .watches(
                Api::<MachineHealthCheck>::namespaced(client.clone(), ns),
                wc(),
                move |_: MachineHealthCheck| {
                    all_nodes
                        .state()
                        .iter()
                        .map(|n| ObjectRef::from_obj(n.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .watches(Api::<ConfigMap>::namespaced(client.clone(), ns), wc(), move |cm: ConfigMap| {
                let state = configured_nodes.state();
                object_refs::<Node>(mapping::node_keys_for_config_map(
                    &cm,
                    state.iter().map(|n| n.as_ref()),
                ))
            })
    };
    tasks.spawn(engine::run(node_controller, mhc_ctx, 1));
    if !synced("Node", &node_cache, &shutdown).await? {
        return drain(tasks, &shutdown).await;
    }

    // MachineSet replicas. The Machine watch covers both owned Machines and
    // orphans a set may adopt.
    let machine_set_ctx = Arc::new(Context::new(
        Arc::new(MachineSetReconciler::new(
            machine_sets.clone(),
            machines.clone(),
            nodes.clone(),
            clock.clone(),
        )),
        shutdown.clone(),
    ));
    let machine_set_controller = {
        let sets = machine_set_cache.clone();
        let cached = machine_cache.clone();
        machine_set_controller
            .watches(Api::<Machine>::namespaced(client.clone(), ns), wc(), move |m: Machine| {
                let state = sets.state();
                object_refs::<MachineSet>(mapping::machine_set_keys_for_machine(
                    &m,
                    state.iter().map(|s| s.as_ref()),
                ))
            })
            .watches(Api::<Node>::all(client.clone()), wc(), move |n: Node| {
                object_refs::<MachineSet>(owner_of_node_machine(&cached, &n))
            })
    };
    tasks.spawn(engine::run(
        machine_set_controller,
        machine_set_ctx,
        args.machineset_workers,
    ));
    if !synced("MachineSet", &machine_set_cache, &shutdown).await? {
        return drain(tasks, &shutdown).await;
    }

    // Operator rollout, keyed on the machine-api ClusterOperator.
    let operator_stores = OperatorStores {
        deployments: Arc::new(KubeStore::<Deployment>::namespaced(client.clone(), ns)),
        daemon_sets: Arc::new(KubeStore::<DaemonSet>::namespaced(client.clone(), ns)),
        validating_webhooks: Arc::new(KubeStore::<ValidatingWebhookConfiguration>::cluster(
            client.clone(),
        )),
        mutating_webhooks: Arc::new(KubeStore::<MutatingWebhookConfiguration>::cluster(
            client.clone(),
        )),
        config_maps,
        machine_sets: machine_sets.clone(),
        machines: machines.clone(),
        infrastructures: Arc::new(KubeStore::<Infrastructure>::cluster(client.clone())),
        proxies: Arc::new(KubeStore::<Proxy>::cluster(client.clone())),
        cluster_operators: Arc::new(KubeStore::<ClusterOperator>::cluster(client.clone())),
    };
    let operator = Arc::new(OperatorReconciler::new(
        operator_stores,
        images,
        settings,
        clock.clone(),
    ));
    operator.ensure_cluster_operator().await?;
    let operator_ctx = Arc::new(
        Context::new(operator, shutdown.clone())
            .with_fixed_key(ObjectKey::namespaced(ns, OPERATOR_KEY)),
    );
    let operator_controller = Controller::new(
        Api::<ClusterOperator>::all(client.clone()),
        wc().fields(&format!("metadata.name={CLUSTER_OPERATOR_NAME}")),
    )
    .watches(Api::<Deployment>::namespaced(client.clone(), ns), wc(), operator_trigger)
    .watches(Api::<DaemonSet>::namespaced(client.clone(), ns), wc(), operator_trigger)
    .watches(Api::<Infrastructure>::all(client.clone()), wc(), operator_trigger)
    .watches(Api::<Proxy>::all(client.clone()), wc(), operator_trigger)
    .watches(Api::<Machine>::namespaced(client.clone(), ns), wc(), operator_trigger)
    .watches(Api::<MachineSet>::namespaced(client.clone(), ns), wc(), operator_trigger)
    .watches(Api::<ConfigMap>::namespaced(client.clone(), ns), wc(), |cm: ConfigMap| {
        mapping::is_operator_config_map(&cm)
            .then(|| ObjectRef::<ClusterOperator>::new(CLUSTER_OPERATOR_NAME))
    });
    tasks.spawn(engine::run(operator_controller, operator_ctx, 1));

    {
        let collector = Collector::new(machines, machine_sets, ns);
        let signal = shutdown.signal();
        tasks.spawn(async move {
            collector.run(COLLECTION_INTERVAL, signal).await;
            Ok(())
        });
    }

    readiness.set_ready(true);
    info!("Controllers started");
    drain(tasks, &shutdown).await
}

/// Wait for a cache to sync. `false` if shutdown came first.
async fn synced<K>(kind: &str, cache: &Store<K>, shutdown: &Shutdown) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let mut signal = shutdown.signal();
    tokio::select! {
        _ = signal.recv() => Ok(false),
        synced = wait_for_cache_sync(kind, cache) => synced.map(|_| true),
    }
}

fn object_refs<K: Resource<DynamicType = ()>>(keys: Vec<ObjectKey>) -> Vec<ObjectRef<K>> {
    keys.iter().map(ObjectKey::object_ref).collect()
}

/// Every change to an operand or input maps to the one ClusterOperator.
fn operator_trigger<T>(_: T) -> Option<ObjectRef<ClusterOperator>> {
    Some(ObjectRef::new(CLUSTER_OPERATOR_NAME))
}

/// MachineSet keys for the Machine a Node is annotated with.
fn owner_of_node_machine(machines: &Store<Machine>, node: &Node) -> Vec<ObjectKey> {
    let Some((ns, name)) = mapping::machine_ref_for_node(node) else {
        return Vec::new();
    };
    machines
        .get(&ObjectRef::new(&name).within(&ns))
        .map(|m| controller_owner_key("MachineSet", m.as_ref()))
        .unwrap_or_default()
}

/// Wait for every task. The first error triggers shutdown and is returned.
async fn drain(mut tasks: JoinSet<Result<()>>, shutdown: &Shutdown) -> Result<()> {
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| Error::Fatal(format!("task panicked: {e}")))
            .and_then(|r| r);
        if let Err(e) = outcome {
            error!("Task failed: {e}");
            shutdown.trigger();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    info!("Shutdown complete");
    result
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        shutdown.trigger();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
