//! Process assembly: which components run, wired to one event store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, TransportConfig, TransportKind};
use crate::controller::{invocation_rules, workflow_rules, Controller};
use crate::error::Result;
use crate::fes::{CacheWriter, EventLog, EventStore, ProjectionCache};
use crate::functions::FunctionRegistry;
use crate::telemetry::Telemetry;
use crate::transport::{MemoryTransport, RedisTransport, RedisTransportConfig, Transport};

pub const INVOCATION: &str = "invocation";
pub const WORKFLOW: &str = "workflow";

/// Component switches. Everything is on by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOptions {
    /// Register the builtin functions
    #[serde(default = "enabled")]
    pub internal_runtime: bool,

    #[serde(default = "enabled")]
    pub invocation_controller: bool,

    #[serde(default = "enabled")]
    pub workflow_controller: bool,

    /// Keep the projection cache in sync with the store
    #[serde(default = "enabled")]
    pub projection_cache: bool,

    /// Watch the aggregate types the controllers need
    #[serde(default = "enabled")]
    pub fes_watch: bool,
}

fn enabled() -> bool {
    true
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            internal_runtime: true,
            invocation_controller: true,
            workflow_controller: true,
            projection_cache: true,
            fes_watch: true,
        }
    }
}

/// Open the configured transport.
pub async fn connect_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config.kind {
        TransportKind::Memory => Ok(Arc::new(MemoryTransport::new())),
        TransportKind::Redis => {
            let transport = RedisTransport::connect(RedisTransportConfig::from(config)).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// The running components.
pub struct Bundle {
    id: Uuid,
    options: BundleOptions,
    store: Arc<EventStore>,
    projections: Arc<ProjectionCache<EventLog>>,
    functions: Arc<FunctionRegistry>,
    controllers: Vec<Arc<Controller>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Bundle {
    /// Connect the configured transport and start the enabled components.
    pub async fn start(config: &Config, telemetry: Telemetry) -> Result<Self> {
        let transport = connect_transport(&config.transport).await?;
        Self::with_transport(config, transport, telemetry).await
    }

    /// Start the enabled components over an existing transport.
    pub async fn with_transport(
        config: &Config,
        transport: Arc<dyn Transport>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let options = config.bundle.clone();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let store = Arc::new(EventStore::new(
            transport,
            config.event_store.clone(),
            telemetry.child("fes"),
        ));

        let projections = Arc::new(ProjectionCache::<EventLog>::new(
            Arc::clone(&store),
            telemetry.child("projection_cache"),
        ));
        if options.projection_cache {
            tasks.push(Arc::clone(&projections).follow(shutdown.child_token()));
        }

        let functions = Arc::new(if options.internal_runtime {
            FunctionRegistry::with_builtins()
        } else {
            FunctionRegistry::new()
        });

        let cache: Arc<dyn CacheWriter> = projections.clone();
        let mut controllers = Vec::new();
        if options.invocation_controller {
            controllers.push(Arc::new(Controller::new(
                "invocation",
                vec![INVOCATION.to_string()],
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::new(invocation_rules(&config.controller)),
                config.controller.clone(),
                telemetry.child("controller.invocation"),
            )));
        }
        if options.workflow_controller {
            controllers.push(Arc::new(Controller::new(
                "workflow",
                vec![WORKFLOW.to_string()],
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::new(workflow_rules(&config.controller)),
                config.controller.clone(),
                telemetry.child("controller.workflow"),
            )));
        }

        for controller in &controllers {
            tasks.push(controller.start(shutdown.child_token())?);
        }

        if options.fes_watch {
            let mut types: Vec<&str> = controllers
                .iter()
                .flat_map(|c| c.aggregate_types().iter().map(String::as_str))
                .collect();
            types.sort_unstable();
            types.dedup();
            for aggregate_type in types {
                store.watch(aggregate_type).await?;
            }
        }

        let id = Uuid::new_v4();
        info!(
            "bundle.id" = %id,
            options = ?options,
            controllers = controllers.len(),
            functions = ?functions.names(),
            "bundle started"
        );

        Ok(Self {
            id,
            options,
            store,
            projections,
            functions,
            controllers,
            tasks,
            shutdown,
        })
    }

    /// Identifies this process's components in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn projections(&self) -> &Arc<ProjectionCache<EventLog>> {
        &self.projections
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    pub fn controller(&self, name: &str) -> Option<&Arc<Controller>> {
        self.controllers.iter().find(|c| c.name() == name)
    }

    /// Stop every component and close the store.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "component task ended abnormally");
            }
        }
        self.store.close().await?;
        info!("bundle.id" = %self.id, "bundle stopped");
        Ok(())
    }
}
