use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchscribe::backend::{ProcessBackend, ScriptedBackend};
use batchscribe::cli::{Cli, Command};
use batchscribe::config::{BatchscribeConfig, TrackerConfig};
use batchscribe::state_machine::{JobId, ModelSize};
use batchscribe::storage::{keys, ArtifactStore, InMemoryStore, LocalFsStore};
use batchscribe::ui::JobProgress;
use batchscribe::{Dispatcher, JobRecord, JobRequest, JobState, JobTracker};

const UPLOAD_PREFIX: &str = "uploads";
const DELETE_CONCURRENCY: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "batchscribe=debug" } else { "batchscribe=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = BatchscribeConfig::load()?;
    if let Some(max_attempts) = cli.max_attempts {
        config.tracker.max_attempts = max_attempts;
    }
    config.backend.dev |= cli.dev;

    match cli.command {
        Command::Transcribe {
            file,
            language,
            model,
            job_id,
        } => transcribe(&config, &file, &language, model.into(), job_id).await,
        Command::List => list(&config).await,
        Command::Download { job_id, out_dir } => download(&config, &job_id, &out_dir).await,
        Command::Delete { job_ids } => delete(&config, job_ids).await,
        Command::Demo => demo(&config).await,
    }
}

async fn transcribe(
    config: &BatchscribeConfig,
    file: &Path,
    language: &str,
    model: ModelSize,
    job_id: Option<String>,
) -> Result<()> {
    let store = LocalFsStore::new(&config.store.root);
    let backend = ProcessBackend::new(&config.backend.command, store.clone())
        .context("set [backend].command in batchscribe.toml or BATCHSCRIBE_BACKEND_COMMAND")?;

    let job_id = match job_id {
        Some(id) => JobId::parse(&id).map_err(anyhow::Error::msg)?,
        None => JobId::generate(),
    };
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} is not a file name", file.display()))?;
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let input_key = format!("{UPLOAD_PREFIX}/{job_id}/{name}");
    store
        .put(&input_key, data)
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;
    tracing::info!(%job_id, input_key, "Uploaded input");

    let tracker = JobTracker::new(
        config.tracker.clone(),
        config.backend.effective_image_tag(),
        Arc::new(backend),
        Arc::new(store),
    );
    let dispatcher = Dispatcher::new(tracker);
    let request = JobRequest::new(input_key, model.to_string())
        .with_job_id(job_id.as_str())
        .with_language(language);

    let record = run(&dispatcher, &request).await;
    dispatcher.shutdown().await;
    let record = record?;
    if record.state != JobState::Succeeded {
        bail!("job {} finished as {}", record.job_id(), record.state);
    }
    Ok(())
}

/// Submit `request` and follow it until it is terminal. Ctrl-C cancels it.
async fn run(dispatcher: &Dispatcher, request: &JobRequest) -> Result<JobRecord> {
    let job_id = dispatcher.submit(request)?;
    let mut states = dispatcher.subscribe(job_id.as_str())?;
    let mut progress = JobProgress::start(job_id.as_str());

    loop {
        let record = dispatcher.status(job_id.as_str())?;
        progress.update(&record);
        if record.is_terminal() {
            progress.complete(&record);
            progress.print_record(&record);
            return Ok(record);
        }
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(dispatcher.wait(job_id.as_str()).await?);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(%job_id, "Interrupted, cancelling job");
                dispatcher.cancel(job_id.as_str())?;
            }
        }
    }
}

async fn list(config: &BatchscribeConfig) -> Result<()> {
    let store = LocalFsStore::new(&config.store.root);
    let keys = store
        .list("")
        .await
        .with_context(|| format!("failed to list {}", config.store.root.display()))?;
    let listings = keys::listings(keys.iter().map(String::as_str));
    if listings.is_empty() {
        println!("No jobs in {}", config.store.root.display());
        return Ok(());
    }

    println!("{:<34} {:<8} {:<6} {:<6} {:>7}  CREATED", "JOB", "STATUS", "MODEL", "LANG", "OUTPUTS");
    for listing in listings {
        let manifest = if listing.has_manifest {
            store
                .get(&keys::manifest_key(&listing.job_id))
                .await
                .ok()
                .and_then(|body| serde_json::from_slice::<keys::JobManifest>(&body).ok())
        } else {
            None
        };
        let status = if listing.done { "done" } else { "pending" };
        let (model, language, created) = match &manifest {
            Some(m) => (
                m.spec.model().to_string(),
                m.spec.language().as_str().to_string(),
                m.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            None => ("-".into(), "-".into(), "-".into()),
        };
        println!(
            "{:<34} {:<8} {:<6} {:<6} {:>7}  {}",
            listing.job_id, status, model, language, listing.outputs, created
        );
    }
    Ok(())
}

async fn download(config: &BatchscribeConfig, job_id: &str, out_dir: &Path) -> Result<()> {
    let job_id = JobId::parse(job_id).map_err(anyhow::Error::msg)?;
    let store = LocalFsStore::new(&config.store.root);

    let marker = keys::done_marker(&job_id);
    if !store.list(&marker).await?.contains(&marker) {
        bail!("job {job_id} not finished");
    }

    let prefix = keys::output_prefix(&job_id);
    let outputs = store.list(&prefix).await?;
    let target = out_dir.join(job_id.as_str());
    for key in &outputs {
        let relative = &key[prefix.len()..];
        let path: PathBuf = target.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = store.get(key).await?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{}", path.display());
    }
    tracing::info!(%job_id, files = outputs.len(), "Downloaded output");
    Ok(())
}

async fn delete(config: &BatchscribeConfig, job_ids: Vec<String>) -> Result<()> {
    let ids = job_ids
        .iter()
        .map(|id| JobId::parse(id).map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    let store = Arc::new(LocalFsStore::new(&config.store.root));
    let permits = Arc::new(Semaphore::new(DELETE_CONCURRENCY));

    let mut tasks = JoinSet::new();
    for job_id in ids {
        let store = Arc::clone(&store);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let removed = store.delete_prefix(&keys::job_prefix(&job_id)).await?;
            anyhow::Ok((job_id, removed))
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok((job_id, removed)) => println!("Deleted {job_id} ({removed} objects)"),
            Err(e) => {
                failures += 1;
                eprintln!("Delete failed: {e:#}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} job(s) could not be deleted");
    }
    Ok(())
}

/// Run one job end to end against the in-memory store and scripted backend.
async fn demo(config: &BatchscribeConfig) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    store.insert("in/audio.mp3", b"ID3 demo audio".to_vec());
    let backend = Arc::new(
        ScriptedBackend::succeeding_after(3).writing_output(store.clone(), "Hello from the demo transcript.\n"),
    );
    let tracker_config = TrackerConfig {
        poll_interval_ms: 300,
        base_delay_ms: 100,
        max_attempts: config.tracker.max_attempts,
        ..TrackerConfig::default()
    };
    let tracker = JobTracker::new(tracker_config, config.backend.effective_image_tag(), backend.clone(), store.clone());
    let dispatcher = Dispatcher::new(tracker);

    let request = JobRequest::new("in/audio.mp3", "large")
        .with_job_id("abc")
        .with_language("en");
    let record = run(&dispatcher, &request).await;
    dispatcher.shutdown().await;
    let record = record?;

    println!();
    println!("Submitted: {:?}", backend.submitted().iter().map(|r| &r.name).collect::<Vec<_>>());
    println!("Store:     {:?}", store.keys());
    if record.state != JobState::Succeeded {
        bail!("demo job finished as {}", record.state);
    }
    Ok(())
}
