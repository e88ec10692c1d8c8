//! Cloudnet Kubernetes Operator
//!
//! Converges cloud load balancers and VPC route tables to the state declared
//! in the cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! cloudnet-operator --cluster-id prod-1 --vpc-id vpc-123 --cluster-cidr 10.0.0.0/8
//!
//! # Run with custom log level
//! RUST_LOG=debug cloudnet-operator
//! ```

use clap::Parser;
use cloudnet_operator::config::{split_list, ControllerConfig, DEFAULT_MAX_PARALLELISM};
use cloudnet_operator::controllers::{Controller, KubeNodeNetworkStatus};
use cloudnet_operator::events::{EventPublisher, KubeEventPublisher};
use cloudnet_operator::leader_election::{self, LeaderElector, LeaseConfig};
use cloudnet_operator::provider::{CloudProvider, InMemoryCloud};
use cloudnet_operator::retry::RetryConfig;
use cloudnet_operator::{LoadBalancerController, ModelApplier, RouteController, RouteReconciler};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Cloudnet Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "cloudnet-operator")]
#[command(version, about = "Kubernetes Operator for cloud load balancers and VPC routes")]
struct Args {
    /// Cluster identity stamped into ownership tags
    #[arg(long, env = "CLUSTER_ID", default_value = "kubernetes")]
    cluster_id: String,

    /// Only routes inside this CIDR are managed (empty for all)
    #[arg(long, env = "CLUSTER_CIDR", default_value = "")]
    cluster_cidr: String,

    /// VPC whose route table is discovered when no table ids are given
    #[arg(long, env = "VPC_ID", default_value = "")]
    vpc_id: String,

    /// Comma separated route table ids
    #[arg(long, env = "ROUTE_TABLE_IDS", default_value = "")]
    route_table_ids: String,

    /// Manage node pod CIDR routes
    #[arg(long, env = "CONFIGURE_CLOUD_ROUTES", default_value = "true", action = clap::ArgAction::Set)]
    configure_cloud_routes: bool,

    /// Seconds between full route table syncs
    #[arg(long, env = "ROUTE_RECONCILE_PERIOD", default_value = "300")]
    route_reconcile_period: u64,

    /// Seconds between load balancer resyncs
    #[arg(long, env = "LOAD_BALANCER_RESYNC_PERIOD", default_value = "600")]
    load_balancer_resync_period: u64,

    /// Parallel backend group and listener actions per pass
    #[arg(long, env = "MAX_PARALLELISM", default_value_t = DEFAULT_MAX_PARALLELISM)]
    max_parallelism: usize,

    /// Route create backoff: seconds before the first retry
    #[arg(long, default_value = "5")]
    route_backoff_initial: u64,

    /// Route create backoff: delay multiplier
    #[arg(long, default_value = "2.0")]
    route_backoff_factor: f64,

    /// Route create backoff: attempts including the first
    #[arg(long, default_value = "3")]
    route_backoff_steps: u32,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            cluster_id: self.cluster_id.clone(),
            cluster_cidr: (!self.cluster_cidr.is_empty()).then(|| self.cluster_cidr.clone()),
            vpc_id: self.vpc_id.clone(),
            route_table_ids: split_list(&self.route_table_ids),
            configure_cloud_routes: self.configure_cloud_routes,
            route_reconcile_period: Duration::from_secs(self.route_reconcile_period),
            max_parallelism: self.max_parallelism,
            route_create_backoff: RetryConfig {
                max_attempts: self.route_backoff_steps,
                initial_delay: Duration::from_secs(self.route_backoff_initial),
                backoff_multiplier: self.route_backoff_factor,
                ..RetryConfig::route_create()
            },
            namespace: self.namespace.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = args.controller_config();
    config.validate()?;

    info!(
        cluster_id = %config.cluster_id,
        cluster_cidr = ?config.cluster_cidr,
        routes = config.configure_cloud_routes,
        leader_election = args.leader_election,
        namespace = if config.namespace.is_empty() { "all" } else { config.namespace.as_str() },
        "Starting cloudnet operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Acquire the lease before starting controllers
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!(namespace = %ns, "Leader election enabled");
        let elector = LeaderElector::new(client.clone(), &ns, LeaseConfig::default());
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    warn!("No cloud SDK backend is linked in, running against the in-memory cloud");
    let cloud: Arc<dyn CloudProvider> = Arc::new(InMemoryCloud::new());
    let publisher: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(client.clone(), "cloudnet-operator"));

    let mut handles = Vec::new();

    let lb_controller = Arc::new(LoadBalancerController::new(
        client.clone(),
        ModelApplier::new(Arc::clone(&cloud), config.cluster_id.clone(), config.max_parallelism),
        Arc::clone(&publisher),
        config.namespace.clone(),
        Duration::from_secs(args.load_balancer_resync_period),
    ));
    handles.push(spawn_controller(lb_controller));

    if config.configure_cloud_routes {
        let reconciler = RouteReconciler::new(
            Arc::clone(&cloud),
            &config,
            Arc::new(KubeNodeNetworkStatus::new(client.clone())),
            Arc::clone(&publisher),
        )?;
        let route_controller = Arc::new(RouteController::new(
            client.clone(),
            reconciler,
            config.route_reconcile_period,
        ));
        handles.push(spawn_controller(route_controller));
    } else {
        info!("Cloud routes disabled");
    }

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to renew leader lease");
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        (result, _, _) = futures::future::select_all(handles) => {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Cloudnet operator shutting down");
    Ok(())
}

fn spawn_controller<C: Controller + 'static>(controller: Arc<C>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let name = controller.name();
        if let Err(e) = controller.run().await {
            error!(controller = name, error = %e, "Controller error");
        }
    })
}
