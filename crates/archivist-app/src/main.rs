use std::{process, sync::Arc, time::Duration};

use archivist_app::cli::{
    ArchivesArgs, ArchivesCommands, ArchivesGetArgs, ArchivesListArgs, BuildArgs, BuildCommands,
    Cli, Commands, ServeArgs,
};
use archivist_app::config::{self, AppConfig, EventsKind};
use archivist_app::error::AppError;
use archivist_app::paths::AppPaths;
use archivist_app::services::{
    AllCorpusCoordinator, ArchiveStore, BuildContext, BuildLauncher, BuildPlan, CatalogService,
    CoordinatorOptions, EventSource, IntervalEventSource, MemoryArchiveStore, PgArchiveStore,
    PipelineLauncher, QueueEventSource, SetQueryDispatcher, build_context,
};
use archivist_server::{Archive, ArchiveStatus, ArchiveType, ListParams, SortDirection, SortField};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    if cli.quiet {
        return LevelFilter::ERROR;
    }
    match cli.command.as_ref() {
        Some(Commands::Archives(_)) => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(args)) => run_serve(args).await,
        Some(Commands::Build(args)) => run_build_command(args).await,
        Some(Commands::Archives(args)) => run_archives(args).await,
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

async fn open_store(cfg: &AppConfig) -> Result<Arc<dyn ArchiveStore>, AppError> {
    if cfg.database.is_memory() {
        tracing::warn!("using the in-memory archive store; archive rows are lost on exit");
        return Ok(Arc::new(MemoryArchiveStore::new()));
    }
    let store = PgArchiveStore::connect(&cfg.database).await?;
    Ok(Arc::new(store))
}

async fn open_context(
    cfg: &AppConfig,
) -> Result<(Arc<BuildContext>, Arc<dyn ArchiveStore>), AppError> {
    let paths = AppPaths::new(&cfg.storage.path)?;
    let store = open_store(cfg).await?;
    let ctx = Arc::new(build_context(cfg, paths, store.clone())?);
    Ok((ctx, store))
}

async fn run_serve(args: ServeArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let (ctx, store) = open_context(&cfg).await?;
    let launcher: Arc<dyn BuildLauncher> = Arc::new(PipelineLauncher::new(ctx.clone()));

    // The queue source lives as long as the server so its stream stays open.
    let queue = QueueEventSource::new();
    let events = match cfg.events.kind {
        EventsKind::Queue => queue.receive(),
        EventsKind::Interval => {
            IntervalEventSource::new(Duration::from_secs(cfg.events.interval_secs)).receive()
        }
    };

    let options = CoordinatorOptions {
        build_on_startup: !args.no_startup_build,
        ..CoordinatorOptions::from_config(&cfg.build)
    };
    let coordinator = AllCorpusCoordinator::spawn(launcher.clone(), options, events);
    let dispatcher = SetQueryDispatcher::spawn(
        launcher,
        cfg.build.set_query_workers,
        cfg.build.set_query_queue_capacity,
    );

    let api = Arc::new(
        CatalogService::builder()
            .store(store)
            .objects(ctx.objects.clone())
            .coordinator(coordinator.handle())
            .set_queries(dispatcher.handle())
            .max_building(Duration::from_secs(cfg.build.max_building_secs))
            .build(),
    );

    let served = archivist_server::serve(cfg.server.clone(), api).await;
    tracing::info!("stopping build workers");
    dispatcher.shutdown().await;
    coordinator.shutdown().await;
    drop(queue);
    served?;
    Ok(())
}

async fn run_build_command(args: BuildArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let (ctx, _store) = open_context(&cfg).await?;
    let launcher = PipelineLauncher::new(ctx);

    let plan = match args.command {
        BuildCommands::All(all) => {
            let cutoff = match all.cutoff {
                Some(raw) => parse_cutoff(&raw)?,
                None => Utc::now(),
            };
            launcher.prepare_all(cutoff).await?
        }
        BuildCommands::Set(set) => launcher.prepare_set(&set.set_id).await?,
    };

    let request = match plan {
        BuildPlan::Reuse(archive) => {
            tracing::info!(archive_id = %archive.id, "snapshot already archived");
            return print_json(&archive);
        }
        BuildPlan::Build(request) => request,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling build");
            on_signal.cancel();
        }
    });

    let archive = launcher.run(request, cancel).await;
    print_json(&archive)?;
    if archive.status != ArchiveStatus::Complete {
        return Err(AppError::BuildUnsuccessful {
            id: archive.id,
            status: archive.status.to_string(),
        });
    }
    Ok(())
}

fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|source| AppError::InvalidTimestamp {
            value: raw.to_string(),
            source,
        })
}

async fn run_archives(args: ArchivesArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let store = open_store(&cfg).await?;
    match args.command {
        ArchivesCommands::List(list) => {
            let params = list_params(list)?;
            let page = store.list(&params).await?;
            print_json(&page)
        }
        ArchivesCommands::Get(ArchivesGetArgs { id, archive_type }) => {
            let archive_type = ArchiveType::from(archive_type);
            let archive: Archive = store
                .get(id)
                .await?
                .filter(|archive| archive.archive_type == archive_type)
                .ok_or(AppError::ArchiveNotFound { id })?;
            print_json(&archive)
        }
    }
}

fn list_params(args: ArchivesListArgs) -> Result<ListParams, AppError> {
    let mut params = ListParams::first_page(args.archive_type.into());
    params.status = args.status.map(Into::into);
    params.offset = args.offset;
    params.size = args.size;
    if let Some(sort) = args.sort {
        let (field, dir) = match sort.split_once(',') {
            Some((field, dir)) => (field, Some(dir)),
            None => (sort.as_str(), None),
        };
        params.sort_field = SortField::parse(field)
            .ok_or_else(|| AppError::Config(format!("unknown sort field `{field}`")))?;
        if let Some(dir) = dir {
            params.sort_dir = SortDirection::parse(dir)
                .ok_or_else(|| AppError::Config(format!("unknown sort direction `{dir}`")))?;
        }
    }
    Ok(params)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
