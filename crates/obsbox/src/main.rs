use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use obsbox_bucket::{BucketConfig, S3BucketStore};
use obsbox_core::api::SensorThingsBackend;
use obsbox_core::config::Settings;
use obsbox_core::dispatch::{Dispatcher, DispatcherConfig};
use obsbox_core::notify::NotificationEmitter;
use obsbox_core::pipeline::{IngestHints, Pipeline};
use obsbox_core::publish::StoragePublisher;
use obsbox_core::registry::{parse_mapping_file, DatasetDescriptor, DatasetRegistry, ResolveHint};
use obsbox_core::transform::TransformContext;
use obsbox_core::types::{BoundingBox, RawDeposit};
use obsbox_core::validate::Validator;
use obsbox_pubsub::{
    BrokerConfig, FsDeadLetterQueue, MqttPubSubClient, Subscriber, SubscriberConfig,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Observational data pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dataset metadata management
    Metadata(MetadataArgs),
    /// Manual data ingestion
    Data(DataArgs),
    /// Event-driven operation against the message bus
    Pubsub(PubsubArgs),
}

#[derive(Args, Debug)]
struct MetadataArgs {
    #[command(subcommand)]
    resource: MetadataResource,
}

#[derive(Subcommand, Debug)]
enum MetadataResource {
    /// Dataset collections on the discovery API
    Thing(ThingArgs),
}

#[derive(Args, Debug)]
struct ThingArgs {
    #[command(subcommand)]
    command: ThingCommand,
}

#[derive(Subcommand, Debug)]
enum ThingCommand {
    /// Register datasets from the mapping file and provision their
    /// collections on the discovery API
    PublishCollection(PublishCollectionArgs),
    /// Remove a dataset's collection from the discovery API
    UnpublishCollection(UnpublishCollectionArgs),
}

#[derive(Args, Debug)]
struct PublishCollectionArgs {
    /// TOML data-mapping file listing dataset descriptors
    #[arg(long)]
    mappings: PathBuf,
}

#[derive(Args, Debug)]
struct UnpublishCollectionArgs {
    /// Dataset identifier whose collection is removed
    #[arg(long)]
    dataset: String,
}

#[derive(Args, Debug)]
struct DataArgs {
    #[command(subcommand)]
    resource: DataResource,
}

#[derive(Subcommand, Debug)]
enum DataResource {
    /// Observation deposits
    Observation(ObservationArgs),
}

#[derive(Args, Debug)]
struct ObservationArgs {
    #[command(subcommand)]
    command: ObservationCommand,
}

#[derive(Subcommand, Debug)]
enum ObservationCommand {
    /// Run local files through the full pipeline synchronously
    Ingest(IngestArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// TOML data-mapping file listing dataset descriptors
    #[arg(long)]
    mappings: PathBuf,
    /// File or directory to ingest
    #[arg(long)]
    path: PathBuf,
    /// Template hint used to resolve the dataset
    #[arg(long)]
    template_hint: String,
    /// Spatial hint for dataset resolution: minlon,minlat,maxlon,maxlat
    #[arg(long, value_parser = parse_bounds)]
    bounds: Option<BoundingBox>,
    /// Descend into subdirectories
    #[arg(long)]
    recursive: bool,
}

#[derive(Args, Debug)]
struct PubsubArgs {
    #[command(subcommand)]
    command: PubsubCommand,
}

#[derive(Subcommand, Debug)]
enum PubsubCommand {
    /// Subscribe to storage events and process deposits as they arrive
    Subscribe(SubscribeArgs),
}

#[derive(Args, Debug)]
struct SubscribeArgs {
    /// TOML data-mapping file listing dataset descriptors
    #[arg(long)]
    mappings: PathBuf,
    /// Broker URL override (defaults to OBSBOX_BROKER_URL)
    #[arg(long)]
    broker: Option<String>,
    /// Topic pattern override (defaults to OBSBOX_EVENTS_TOPIC)
    #[arg(long)]
    topic: Option<String>,
}

fn parse_bounds(raw: &str) -> std::result::Result<BoundingBox, String> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| format!("bounds must be four numbers: {err}"))?;
    if parts.len() != 4 {
        return Err(format!("expected minlon,minlat,maxlon,maxlat, got {raw}"));
    }
    Ok(BoundingBox {
        min_lon: parts[0],
        min_lat: parts[1],
        max_lon: parts[2],
        max_lat: parts[3],
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("configuration incomplete")?;

    match cli.command {
        Command::Metadata(args) => match args.resource {
            MetadataResource::Thing(args) => match args.command {
                ThingCommand::PublishCollection(args) => {
                    let pipeline = build_pipeline(&settings, &args.mappings).await?;
                    let descriptors = load_descriptors(&args.mappings)?;
                    let count = pipeline.register_datasets(descriptors).await?;
                    info!(count, "datasets published");
                    Ok(())
                }
                ThingCommand::UnpublishCollection(args) => {
                    use obsbox_core::api::DiscoveryBackend;
                    let backend = SensorThingsBackend::new(&settings.api_url);
                    backend.delete_collection(&args.dataset).await?;
                    info!(dataset = %args.dataset, "collection removed");
                    Ok(())
                }
            },
        },
        Command::Data(args) => match args.resource {
            DataResource::Observation(args) => match args.command {
                ObservationCommand::Ingest(args) => ingest(&settings, args).await,
            },
        },
        Command::Pubsub(args) => match args.command {
            PubsubCommand::Subscribe(args) => subscribe(&settings, args).await,
        },
    }
}

fn load_descriptors(mappings: &Path) -> Result<Vec<DatasetDescriptor>> {
    let contents = std::fs::read_to_string(mappings)
        .with_context(|| format!("cannot read mapping file {}", mappings.display()))?;
    Ok(parse_mapping_file(&contents)?)
}

async fn build_pipeline(settings: &Settings, mappings: &Path) -> Result<Arc<Pipeline>> {
    let registry = Arc::new(DatasetRegistry::new());
    for descriptor in load_descriptors(mappings)? {
        registry.register(descriptor);
    }

    let public = S3BucketStore::new(bucket_config(
        settings,
        settings.storage.bucket_public.clone(),
    ))
    .await?;

    let broker = BrokerConfig::from_url(&settings.broker_url, "obsbox-publisher")?;
    let bus = MqttPubSubClient::connect(&broker);
    let dead_letter = FsDeadLetterQueue::new(&settings.dead_letter_dir);

    Ok(Arc::new(Pipeline::new(
        registry,
        Validator {
            bounds_tolerance_deg: settings.bounds_tolerance_deg,
            staleness_window: settings.staleness_window,
            clock_skew: settings.clock_skew,
        },
        StoragePublisher::new(Arc::new(public), settings.storage_retry.clone()),
        NotificationEmitter::new(
            Arc::new(bus),
            Arc::new(dead_letter),
            settings.notify_retry.clone(),
            &settings.public_url,
        ),
        Arc::new(SensorThingsBackend::new(&settings.api_url)),
        TransformContext {
            skip_ratio_threshold: settings.skip_ratio_threshold,
        },
    )))
}

fn bucket_config(settings: &Settings, bucket: String) -> BucketConfig {
    BucketConfig {
        bucket,
        region: settings.storage.region.clone(),
        endpoint: settings.storage.endpoint.clone(),
        access_key_id: settings.storage.access_key_id.clone(),
        secret_access_key: settings.storage.secret_access_key.clone(),
        force_path_style: settings.storage.force_path_style,
    }
}

async fn ingest(settings: &Settings, args: IngestArgs) -> Result<()> {
    let pipeline = build_pipeline(settings, &args.mappings).await?;
    let files = collect_files(&args.path, args.recursive)?;
    anyhow::ensure!(!files.is_empty(), "no files found at {}", args.path.display());

    let hints = IngestHints {
        template: args.template_hint.clone(),
        resolve: ResolveHint {
            bbox: args.bounds,
            time: None,
        },
    };
    let mut published = 0usize;
    let mut failed = 0usize;
    for file in files {
        let bytes =
            std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "deposit".to_string());
        let deposit = RawDeposit::new(
            format!("{}/{name}", args.template_hint),
            bytes.into(),
            Utc::now(),
        );

        match pipeline.ingest(&deposit, &hints).await {
            Ok(report) => {
                published += report.published.len();
                if !report.rejected.is_empty() {
                    warn!(
                        file = %file.display(),
                        rejected = report.rejected.len(),
                        "some records were rejected"
                    );
                }
            }
            Err(err) => {
                failed += 1;
                warn!(file = %file.display(), error = %err, "ingest failed");
            }
        }
    }
    info!(published, failed, "ingest run complete");
    anyhow::ensure!(failed == 0, "{failed} deposit(s) failed");
    Ok(())
}

fn collect_files(path: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(path).with_context(|| format!("cannot list {}", path.display()))?
    {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            if recursive {
                files.extend(collect_files(&entry_path, true)?);
            }
        } else {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}

async fn subscribe(settings: &Settings, args: SubscribeArgs) -> Result<()> {
    let pipeline = build_pipeline(settings, &args.mappings).await?;

    let incoming = S3BucketStore::new(bucket_config(
        settings,
        settings.storage.bucket_incoming.clone(),
    ))
    .await?;

    let dispatcher = Dispatcher::start(
        pipeline,
        Arc::new(incoming),
        DispatcherConfig {
            workers: settings.workers,
            queue_depth: settings.queue_depth,
            dedup_window: settings.dedup_window,
            max_event_attempts: settings.max_event_attempts,
            retry: settings.storage_retry.clone(),
        },
    );

    let broker_url = args.broker.as_deref().unwrap_or(&settings.broker_url);
    let topic_pattern = args
        .topic
        .clone()
        .unwrap_or_else(|| settings.events_topic.clone());
    let broker = BrokerConfig::from_url(broker_url, "obsbox-subscriber")?;
    let subscriber = Subscriber::new(SubscriberConfig {
        broker,
        topic_pattern: topic_pattern.clone(),
        reconnect_initial: Duration::from_secs(1),
        reconnect_max: Duration::from_secs(60),
    });

    let (tx, rx) = mpsc::channel(settings.queue_depth);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let subscription = tokio::spawn(async move { subscriber.run(tx, shutdown_rx).await });

    info!(topic = %topic_pattern, "listening for storage events");
    tokio::select! {
        _ = dispatcher.consume(rx) => {
            warn!("event stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, draining workers");
        }
    }

    let _ = shutdown_tx.send(true);
    dispatcher.shutdown(Duration::from_secs(30)).await;
    let _ = subscription.await;
    Ok(())
}
