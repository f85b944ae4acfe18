//! Weaver host
//!
//! Runs the checkpoint orchestrator and speaks the JSON-lines bridge
//! protocol on stdin/stdout. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::BufReader;

use weaver_lib::{
    host, init_logging, ApiBriefGenerator, BriefGenerator, Collaborators, Context, FileStore,
    HostConfig, LifecycleManager, LocalArchive, MessageBus, Orchestrator, OrchestratorConfig,
    Records, ResumeSummary, UnavailablePage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = HostConfig::load().context("loading host config")?;
    let data_dir = config.data_dir()?;
    let store = FileStore::open(config.store_dir()?).context("opening store")?;
    let records = Records::new(Arc::new(store));
    let lifecycle = LifecycleManager::new(records.clone());

    let report = lifecycle.repair_all().context("repairing threads")?;
    tracing::info!(
        threads = report.threads_checked,
        repaired = report.repaired.len(),
        corrupted = report.corrupted.len(),
        orphans = report.orphan_segments.len(),
        data_dir = %data_dir.display(),
        "Store ready"
    );

    let settings = records.settings()?;
    let briefs: Arc<dyn BriefGenerator> = match settings.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => {
            tracing::info!(model = %config.brief_model, "Briefs via API");
            Arc::new(ApiBriefGenerator::with_base_url(&config.api_base, key, &config.brief_model))
        }
        None => Arc::new(UnavailablePage),
    };
    let collaborators = Collaborators {
        briefs,
        ..Collaborators::unavailable()
    };

    let bus = MessageBus::new();
    let mailbox = bus.register(Context::Orchestrator);
    let orchestrator = Orchestrator::new(
        lifecycle,
        LocalArchive::new(&data_dir),
        collaborators,
        bus.endpoint(Context::Orchestrator),
        OrchestratorConfig {
            stage_timeout: config.stage_timeout(),
        },
    );

    let resumer = orchestrator.clone();
    tokio::spawn(async move {
        match resumer.resume_pending().await {
            Ok(summary) if summary == ResumeSummary::default() => {}
            Ok(summary) => tracing::info!(
                completed = summary.completed.len(),
                failed = summary.failed.len(),
                dropped = summary.dropped.len(),
                "Pending checkpoints resumed"
            ),
            Err(e) => tracing::error!(error = %e, "Could not read pending checkpoints"),
        }
    });
    tokio::spawn(orchestrator.run(mailbox));

    host::serve(
        bus,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        config.request_timeout(),
    )
    .await?;

    tracing::info!("Host exiting");
    Ok(())
}
