//! Process-level wiring: storage, services, buses, the reasoning pipeline and
//! the agent processor, plus the entry points that reach the runtime from
//! outside (task submission and privileged commands).

pub mod inbox;
pub mod state;

pub use inbox::{InboxKind, InboxPass, TaskRequest, deliver, inbox_dir};
pub use state::{RuntimeStatus, read_status, state_file_path};

use crate::audit::{AuditEntry, AuditOutcome, AuditService, Direction};
use crate::authority::{CommandType, KeyAllowlist, PrivilegedCommand, SigningKey};
use crate::buses::{
    BusManager, InMemoryMemory, LocalCommunication, LocalToolService, LocalWiseAuthority,
};
use crate::config::{Config, ConfigHandle};
use crate::conscience::ConscienceChain;
use crate::dma::{DmaPipeline, HeuristicBackend, ReasoningBackend};
use crate::error::CirisError;
use crate::handlers::{HandlerDeps, HandlerRegistry};
use crate::observability::{EventSender, LogObserver, RuntimeEvent, emit, event_bus};
use crate::persistence::SqliteTaskStore;
use crate::persistence::sqlite::connect;
use crate::processors::{AgentProcessor, AgentState, ProcessorContext, ThoughtProcessor};
use crate::scheduler::ThoughtScheduler;
use crate::schemas::{Task, TaskContext};
use crate::secrets::SecretsVault;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fully wired agent.
pub struct CirisRuntime {
    ctx: ProcessorContext,
    agent: Arc<AgentProcessor>,
    audit: Arc<AuditService>,
    vault: Arc<SecretsVault>,
    allowlist: KeyAllowlist,
    comms: Arc<LocalCommunication>,
    wise_authority: Arc<LocalWiseAuthority>,
    /// Stops the background tasks once the agent is done.
    background: CancellationToken,
}

impl CirisRuntime {
    /// Open the database under the data directory, recover interrupted work
    /// and register the local providers for every capability.
    pub async fn build(config: Config) -> Result<Self> {
        Self::build_with_backend(config, Arc::new(HeuristicBackend::new())).await
    }

    /// Like [`CirisRuntime::build`] but reasoning through `backend`.
    pub async fn build_with_backend(
        config: Config,
        backend: Arc<dyn ReasoningBackend>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;
        let pool = connect(&config.database_url())
            .await
            .with_context(|| format!("failed to open {}", config.database_path().display()))?;

        let store = Arc::new(SqliteTaskStore::new(pool.clone()).await?);
        let scheduler = Arc::new(ThoughtScheduler::new(store));
        let recovered = scheduler.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued thoughts interrupted by the previous run");
        }

        let signer = config
            .audit
            .signing_key_path
            .as_deref()
            .map(SigningKey::load)
            .transpose()
            .context("failed to load the audit signing key")?;
        let audit = Arc::new(AuditService::new(pool.clone(), signer).await?);
        let vault = Arc::new(
            SecretsVault::new(pool, &config.data_dir, config.secrets.encrypt).await?,
        );

        let buses = Arc::new(BusManager::new(&config.bus));
        let comms = Arc::new(LocalCommunication::with_agent_id(config.agent.agent_id.clone()));
        let wise_authority = Arc::new(LocalWiseAuthority::new());
        buses.register_communication(comms.clone()).await;
        buses.register_memory(Arc::new(InMemoryMemory::new())).await;
        buses.register_tools(Arc::new(LocalToolService::new())).await;
        buses.register_wise_authority(wise_authority.clone()).await;
        buses.register_audit(audit.clone()).await;
        buses.init().await?;

        let (events, _) = event_bus(config.observability.event_capacity);
        let registry = HandlerRegistry::with_defaults(HandlerDeps {
            buses: buses.clone(),
            scheduler,
            vault: vault.clone(),
            events: events.clone(),
            agent_id: config.agent.agent_id.clone(),
            default_channel: config.agent.default_channel.clone(),
            max_depth: config.workflow.max_thought_depth,
            sensitivity: config.secrets.sensitivity,
            auto_decrypt: config.secrets.auto_decrypt_actions.clone(),
        });
        let pipeline = DmaPipeline::new(backend, &config.workflow);
        let chain = ConscienceChain::from_config(&config.guardrails, &config.secrets, vault.clone());
        let allowlist = KeyAllowlist::from_config(&config.wise_authority);

        let handle = ConfigHandle::new(config);
        let thoughts = Arc::new(ThoughtProcessor::new(
            pipeline,
            chain,
            registry,
            handle.clone(),
        ));
        let ctx = ProcessorContext {
            config: handle,
            thoughts,
            buses,
            events,
            cancel: CancellationToken::new(),
        };
        let agent = Arc::new(AgentProcessor::new(ctx.clone()));

        Ok(Self {
            ctx,
            agent,
            audit,
            vault,
            allowlist,
            comms,
            wise_authority,
            background: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.ctx.config
    }

    pub fn agent(&self) -> &Arc<AgentProcessor> {
        &self.agent
    }

    pub fn audit(&self) -> &Arc<AuditService> {
        &self.audit
    }

    pub fn scheduler(&self) -> &Arc<ThoughtScheduler> {
        self.ctx.scheduler()
    }

    pub fn thoughts(&self) -> &Arc<ThoughtProcessor> {
        &self.ctx.thoughts
    }

    pub fn buses(&self) -> &Arc<BusManager> {
        &self.ctx.buses
    }

    pub fn events(&self) -> &EventSender {
        &self.ctx.events
    }

    pub fn communication(&self) -> &Arc<LocalCommunication> {
        &self.comms
    }

    pub fn wise_authority(&self) -> &Arc<LocalWiseAuthority> {
        &self.wise_authority
    }

    pub fn allowlist(&self) -> &KeyAllowlist {
        &self.allowlist
    }

    /// Queue a task. Secrets in the description are lifted into the vault
    /// before anything is persisted.
    pub async fn submit_task(
        &self,
        description: &str,
        priority: i32,
        channel_id: Option<String>,
        requester_id: Option<String>,
    ) -> Result<Task> {
        let config = self.ctx.config.load_full();
        let protected = self
            .vault
            .protect(description, config.secrets.sensitivity)
            .await?;
        let channel = channel_id.unwrap_or_else(|| config.agent.default_channel.clone());
        let stakeholder = requester_id
            .clone()
            .unwrap_or_else(|| format!("channel:{channel}"));
        let task = Task::new(
            protected.text,
            priority,
            TaskContext::new(Some(channel), requester_id),
        );

        self.audit
            .record(
                AuditEntry::new(Direction::Inbound, stakeholder, "SUBMIT_TASK", AuditOutcome::Ok)
                    .with_correlation(task.context.correlation_id.clone())
                    .with_detail(json!({
                        "task_id": task.task_id,
                        "priority": priority,
                        "secrets": protected.labels,
                    })),
            )
            .await?;
        self.ctx.scheduler().enqueue(&task).await?;
        tracing::info!(task_id = %task.task_id, priority, "task submitted");
        Ok(task)
    }

    /// Verify and apply a signed command. Rejected commands leave an ERROR
    /// audit record and have no other effect.
    pub async fn handle_privileged_command(
        &self,
        command: &PrivilegedCommand,
    ) -> std::result::Result<(), CirisError> {
        let config = self.ctx.config.load_full();
        let stakeholder = format!("wa:{}", command.wa_id);
        let action = command.command_type.to_string();

        if let Err(err) = self
            .allowlist
            .verify_command(command, &config.agent.agent_id, Utc::now())
        {
            tracing::warn!(command_id = %command.command_id, error = %err, "privileged command rejected");
            self.audit
                .record(
                    AuditEntry::new(Direction::Inbound, stakeholder, action, AuditOutcome::Error)
                        .with_correlation(command.command_id.clone())
                        .with_detail(json!({ "error": err.to_string() })),
                )
                .await?;
            return Err(err.into());
        }

        self.audit
            .record(
                AuditEntry::new(Direction::Inbound, stakeholder, action, AuditOutcome::Ok)
                    .with_correlation(command.command_id.clone())
                    .with_detail(json!({
                        "reason": command.reason,
                        "relay_chain": command.relay_chain,
                    })),
            )
            .await?;

        match command.command_type {
            CommandType::EmergencyShutdown => {
                self.request_shutdown(format!(
                    "emergency shutdown by {}: {}",
                    command.wa_id, command.reason
                ));
            }
            CommandType::ReloadConfig => {
                self.ctx.config.reload()?;
                let fresh = self.ctx.config.load();
                self.allowlist.rotate(fresh.wise_authority.trusted_keys.clone());
            }
        }
        Ok(())
    }

    /// Move the agent into SHUTDOWN at the next round boundary.
    pub fn request_shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        emit(
            &self.ctx.events,
            RuntimeEvent::ShutdownRequested {
                reason: reason.clone(),
            },
        );
        self.agent.request_transition(AgentState::Shutdown, reason);
        self.ctx.cancel.cancel();
    }

    /// Run until the agent finishes shutting down; Ctrl-C starts the shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "interrupt handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Run until the agent finishes shutting down; `interrupt` resolving
    /// starts the shutdown.
    pub async fn run_until(self: Arc<Self>, interrupt: impl Future<Output = ()>) -> Result<()> {
        let background = Self::spawn_background(&self);
        let agent = Arc::clone(&self.agent);
        let mut agent_loop = tokio::spawn(async move { agent.run().await });

        let joined = tokio::select! {
            joined = &mut agent_loop => joined,
            () = interrupt => {
                tracing::info!("interrupt received");
                self.request_shutdown("interrupt received");
                agent_loop.await
            }
        };

        self.ctx.buses.shutdown().await;
        self.background.cancel();
        for handle in background {
            let _ = handle.await;
        }

        joined.context("agent loop panicked")??;
        Ok(())
    }

    fn spawn_background(this: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let interval = this.ctx.config.load().audit.verify_interval_seconds;
        let cancel = &this.background;
        let mut handles = vec![
            LogObserver::new().spawn(this.ctx.events.subscribe(), cancel.clone()),
            inbox::spawn_inbox_poller(Arc::clone(this), cancel.clone()),
            state::spawn_state_writer(Arc::clone(this), cancel.clone()),
        ];
        if interval > 0 {
            handles.push(
                Arc::clone(&this.audit).spawn_verifier(Duration::from_secs(interval), cancel.clone()),
            );
        }
        handles
    }
}
