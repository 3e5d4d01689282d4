//! Process wiring: build every component from one [`Config`] and the
//! embedder's capability handles, and run the long-lived loops.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::control::Orchestrator;
use crate::error::Result;
use crate::sender::{BridgeEvent, CommandSender};
use crate::services::{
    AuditSink, DeviceDirectory, FlowQuery, PlanStore, Publisher, RuleStore,
};

/// The external capabilities a deployment supplies.
pub struct Capabilities {
    pub directory: Arc<dyn DeviceDirectory>,
    pub flow: Arc<dyn FlowQuery>,
    pub rules: Arc<dyn RuleStore>,
    pub plans: Arc<dyn PlanStore>,
    pub audit: Arc<dyn AuditSink>,
    pub publisher: Arc<dyn Publisher>,
}

/// The assembled driver. Components stay reachable for embedders that need
/// direct access (for example to call [`Bridge::handle_request`] from their
/// inbound subscription).
pub struct Driver {
    manager: Arc<ConnectionManager>,
    sender: Arc<CommandSender>,
    orchestrator: Arc<Orchestrator>,
    bridge: Arc<Bridge>,
    events: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
}

impl Driver {
    pub fn new(config: Config, caps: Capabilities) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&caps.directory),
            Arc::clone(&caps.audit),
            config.connection.clone(),
        ));
        let (sender, events) = CommandSender::new(
            Arc::clone(&manager),
            Arc::clone(&caps.audit),
            config.protocol.clone(),
        );
        let sender = Arc::new(sender);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&sender),
            Arc::clone(&manager),
            Arc::clone(&caps.directory),
            Arc::clone(&caps.flow),
            Arc::clone(&caps.rules),
            Arc::clone(&caps.plans),
            Arc::clone(&caps.audit),
            config.control.clone(),
        ));
        let bridge =
            Arc::new(Bridge::new(Arc::clone(&sender), Arc::clone(&caps.publisher), config.bridge));
        Self { manager, sender, orchestrator, bridge, events: Mutex::new(Some(events)) }
    }

    /// Load rules, connect the fleet, and spawn the health-check, scheduler,
    /// and event-pump loops. Must run inside a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        self.orchestrator.reload().await?;
        self.manager.check_once().await;

        let taken = self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(events) = taken {
            let bridge = Arc::clone(&self.bridge);
            tokio::spawn(async move { bridge.run(events).await });
        }
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.run().await });
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move { orchestrator.run().await });
        Ok(())
    }

    /// Stop the loops and close every connection.
    pub fn stop(&self) {
        self.orchestrator.stop();
        self.manager.stop();
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn sender(&self) -> &Arc<CommandSender> {
        &self.sender
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}
