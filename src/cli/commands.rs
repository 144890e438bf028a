use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::TransportChannel;
use crate::browser::{
    BehaviorSimulator, BrowserSessionManager, CaptchaGate, CdpLauncher, ConsoleSignal, OperatorResolver,
    OperatorSignal, SessionStore,
};
use crate::cli::config::{AgentConfig, EngineSettings};
use crate::control::{heartbeat_loop, ControlPlane, DetachedControlPlane, HttpControlPlane, Website};
use crate::crawler::engine::pick_user_agent;
use crate::crawler::{
    CrawlEngine, Dispatcher, HandlerRegistry, PageArchive, SourceType, Task, TaskProcessor, TaskSink, TaskType,
};
use crate::source::{AdapterCall, AdapterRegistry, GlyphMap, SourceContext};
use crate::utils::CrawlStats;

/// Collaborators handed to every source adapter
fn source_context(config: &AgentConfig) -> Result<SourceContext> {
    let signal: Arc<dyn OperatorSignal> = Arc::new(ConsoleSignal::new());
    let timeout = config.captcha.timeout_secs.map(Duration::from_secs);

    let resolver = Arc::new(OperatorResolver::new(
        Arc::clone(&signal),
        config.output.artifact_dir.clone(),
        timeout,
    ));
    let gate = Arc::new(CaptchaGate::new(
        resolver,
        signal,
        timeout,
        Duration::from_secs(config.captcha.grace_secs),
        Duration::from_secs(config.captcha.login_grace_secs),
    ));

    let glyphs = match &config.output.glyph_map {
        Some(path) => GlyphMap::load(path)?,
        None => GlyphMap::default(),
    };

    Ok(SourceContext {
        gate,
        behavior: BehaviorSimulator::new(config.browser.typing_speed, config.browser.click_delay),
        glyphs: Arc::new(glyphs),
        session_prefix: config.engine.session_prefix.clone(),
        artifact_dir: config.output.artifact_dir.clone(),
        settings: config.adapter.clone(),
    })
}

/// Launch the browser and build an engine on it
async fn start_engine(
    config: &AgentConfig,
    settings: EngineSettings,
) -> Result<(Arc<BrowserSessionManager>, CrawlEngine)> {
    let user_agent = pick_user_agent(&settings.user_agents).map(str::to_string);
    let launcher = Arc::new(CdpLauncher::new(config.browser.clone(), user_agent));
    let browser = Arc::new(BrowserSessionManager::new(launcher, config.browser.headless));
    browser.initialize().await.context("Failed to launch browser")?;

    let sessions = Arc::new(SessionStore::new(config.output.session_file.clone()));
    let engine = CrawlEngine::new(
        settings,
        Duration::from_secs(config.browser.page_timeout_secs),
        Arc::clone(&browser),
        sessions,
        CrawlStats::new(),
    )
    .context("Failed to create crawl engine")?;

    let engine = match &config.browser.proxy_url {
        Some(proxy_url) => engine
            .with_proxy(proxy_url)
            .context(format!("Invalid proxy URL: {}", proxy_url))?,
        None => engine,
    };

    Ok((browser, engine))
}

/// Control plane from the configuration; detached when no API is configured
fn control_plane(config: &AgentConfig) -> Result<Arc<dyn ControlPlane>> {
    match &config.control_api.base_url {
        Some(base_url) => {
            let client = HttpControlPlane::new(
                base_url,
                &config.control_api.api_key,
                Duration::from_secs(config.control_api.timeout_secs),
            )
            .context(format!("Failed to create control API client for {}", base_url))?;
            info!("Using control API at {}", base_url);
            Ok(Arc::new(client))
        }
        None => {
            info!("No control API configured, running detached");
            Ok(Arc::new(DetachedControlPlane::new(config.sites.clone())))
        }
    }
}

async fn websites(control: &dyn ControlPlane) -> Result<Vec<Website>> {
    let websites = control.websites().await.context("Failed to fetch websites")?;
    info!("Loaded {} websites", websites.len());
    Ok(websites)
}

/// Wait for tasks to stop, giving up after `grace`
async fn join_with_grace(handles: Vec<JoinHandle<()>>, grace: Duration) {
    if tokio::time::timeout(grace, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!("Workers did not stop within {:?}, continuing shutdown", grace);
    }
}

/// Run the agent until Ctrl-C
pub async fn run(config: AgentConfig) -> Result<()> {
    let control = control_plane(&config)?;
    let agent = control
        .resolve_agent(&config.control_api.agent_name, &config.control_api.ip_address)
        .await
        .context("Failed to resolve agent identity")?;
    info!("Running as agent {} ({})", agent.name, agent.id);

    // Adapters for the websites this agent serves
    let ctx = source_context(&config)?;
    let adapters = AdapterRegistry::from_websites(&websites(control.as_ref()).await?, &ctx);
    if adapters.is_empty() {
        warn!("No source adapters registered, every task will be dropped");
    }
    let handlers = HandlerRegistry::with_defaults()?;

    let (browser, engine) = start_engine(&config, config.engine.clone()).await?;
    let engine = Arc::new(engine);

    // No broker, no agent
    let transport = Arc::new(
        TransportChannel::connect(config.broker.clone())
            .await
            .context("Failed to connect to broker")?,
    );

    let processor = Arc::new(TaskProcessor::new(
        adapters,
        handlers,
        Arc::clone(&engine),
        Arc::clone(&control),
        agent.id,
        config.control_api.report_results,
    ));
    let (dispatcher, dispatch_loop) = Dispatcher::new(processor, &config.dispatcher, &config.broker.priority_topic);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![tokio::spawn(dispatch_loop.run(shutdown_rx.clone()))];
    handles.extend(engine.spawn_workers(shutdown_rx.clone()));
    handles.push(tokio::spawn(heartbeat_loop(
        Arc::clone(&control),
        agent.id,
        Duration::from_secs(config.control_api.heartbeat_interval_secs),
        shutdown_rx.clone(),
    )));

    let consumer = {
        let transport = Arc::clone(&transport);
        let sink: Arc<dyn TaskSink> = Arc::new(dispatcher);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { transport.consume(sink, shutdown).await })
    };
    handles.push(consumer);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    transport.close().await;
    let grace = Duration::from_secs(config.engine.shutdown_grace_secs);
    join_with_grace(handles, grace).await;

    engine.stats().log_summary().await;
    browser.close_within(grace).await;

    Ok(())
}

/// Publish one task
pub async fn publish(config: AgentConfig, source: &str, kind: &str, url: &str) -> Result<()> {
    let source: SourceType = source.parse().context("Invalid --source")?;
    let task_type: TaskType = kind.parse().context("Invalid --kind")?;
    let task = Task::new(source, task_type, url);

    let transport = TransportChannel::connect(config.broker.clone())
        .await
        .context("Failed to connect to broker")?;
    let published = transport.publish(&task).await;
    transport.close().await;
    published.context("Failed to publish task")?;

    println!("Published {} on {}", url, task.topic);
    Ok(())
}

/// Crawl from `url` until the frontier drains or Ctrl-C
pub async fn crawl(config: AgentConfig, url: &str, depth: Option<u32>, output: Option<PathBuf>) -> Result<()> {
    let mut settings = config.engine.clone();
    if let Some(depth) = depth {
        settings.max_depth = depth;
    }

    let (browser, engine) = start_engine(&config, settings).await?;
    let engine = match output {
        Some(dir) => {
            info!("Saving pages to {}", dir.display());
            engine.with_callback(Arc::new(PageArchive::new(dir)))
        }
        None => engine,
    };
    let engine = Arc::new(engine);

    if !engine.seed(url).await {
        browser.close().await;
        return Err(anyhow!("Not a crawlable URL: {}", url));
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let workers = engine.spawn_workers(shutdown_rx.clone());

    tokio::select! {
        _ = engine.wait_until_drained(&mut shutdown_rx) => info!("Frontier drained"),
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping workers"),
    }

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.engine.shutdown_grace_secs);
    join_with_grace(workers, grace).await;

    let frontier = engine.frontier();
    println!(
        "Visited {} URLs ({} failed, {} still queued)",
        frontier.visited_count().await,
        frontier.failed_count().await,
        frontier.pending_count().await
    );
    engine.stats().log_summary().await;
    browser.close_within(grace).await;

    Ok(())
}

/// Log in to `source` in a visible browser and persist the session
pub async fn login(config: AgentConfig, source: &str) -> Result<()> {
    let source: SourceType = source.parse().context("Invalid --source")?;

    let control = control_plane(&config)?;
    let ctx = source_context(&config)?;
    let adapters = AdapterRegistry::from_websites(&websites(control.as_ref()).await?, &ctx);
    let adapter = adapters
        .get(source)
        .ok_or_else(|| anyhow!("No enabled website with an adapter for {}", source))?;

    let (browser, engine) = start_engine(&config, config.engine.clone()).await?;
    let result = engine
        .process_page_exclusive(adapter.home_url(), adapter.as_ref(), AdapterCall::SourceSession, false)
        .await;
    browser.close().await;
    result.context(format!("Login to {} failed", source))?;

    match engine.sessions().load().await? {
        Some(snapshot) => println!(
            "Session saved to {} ({} cookies)",
            engine.sessions().path().display(),
            snapshot.cookies.len()
        ),
        None => warn!("Login finished but no session snapshot was saved"),
    }

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &AgentConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("Current configuration:");
    println!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_validates_before_connecting() {
        let url = "https://sangtacviet.app/truyen/qidian/1/1/";

        let err = publish(AgentConfig::default(), "sangtacviet", "poem", url).await.unwrap_err();
        assert!(err.to_string().contains("--kind"));

        let err = publish(AgentConfig::default(), "nowhere", "book", url).await.unwrap_err();
        assert!(err.to_string().contains("--source"));
    }

    #[test]
    fn test_source_context_loads_glyph_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glyphs.json");
        std::fs::write(&path, r#"{"\uE001": "a"}"#).unwrap();

        let mut config = AgentConfig::default();
        config.output.glyph_map = Some(path);
        config.engine.session_prefix = "live:".to_string();

        let ctx = source_context(&config).unwrap();
        assert_eq!(ctx.glyphs.len(), 1);
        assert_eq!(ctx.session_prefix, "live:");
    }

    #[test]
    fn test_missing_glyph_map_is_an_error() {
        let mut config = AgentConfig::default();
        config.output.glyph_map = Some(PathBuf::from("/nonexistent/glyphs.json"));
        assert!(source_context(&config).is_err());
    }

    #[test]
    fn test_detached_without_control_api() {
        let config = AgentConfig::default();
        assert!(config.control_api.base_url.is_none());
        assert!(control_plane(&config).is_ok());
    }
}
