use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use folio::{Config, Database, Engine, ProjectRegistry, Server};

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    folder: Option<PathBuf>,
    sweep: bool,
    cleanup: bool,
    search: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("folio {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--search" | "-s" => {
                if i + 1 < args.len() {
                    parsed.search = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --search requires a query argument");
                    std::process::exit(1);
                }
            }
            "--sweep" => parsed.sweep = true,
            "--cleanup" => parsed.cleanup = true,
            arg if !arg.starts_with('-') && parsed.folder.is_none() => {
                parsed.folder = Some(PathBuf::from(arg));
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"folio - cache-first photo library engine

USAGE:
    folio [OPTIONS] [FOLDER]

Opens FOLDER (or the most recently opened project), serves its previews over
HTTP and prints library events as JSON lines until interrupted.

OPTIONS:
    --config, -c PATH   Path to config file
    --search, -s QUERY  Print images matching QUERY and exit
    --sweep             Delete derivatives of files no longer in FOLDER and exit
    --cleanup           Drop stale unrated, untagged cache rows and exit
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FOLIO_CONFIG        Path to config file (overrides default location)
    FOLIO_LOG           Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/folio/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // journald on Linux, rolling file otherwise
    if let Err(e) = folio::logging::init(Some(Config::config_dir().join("logs"))) {
        eprintln!("Logging disabled: {:#}", e);
    }

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = Arc::new(Database::open(&config.db_path, config.maintenance.clone())?);
    let registry = ProjectRegistry::new();

    let result = run(&args, config, db.clone(), registry).await;

    if let Err(e) = db.close() {
        error!("Database shutdown failed: {:#}", e);
    }
    result
}

async fn run(args: &Args, config: Config, db: Arc<Database>, registry: ProjectRegistry) -> Result<()> {
    if args.cleanup {
        let engine = Engine::new(db, registry, config, "http://127.0.0.1");
        let removed = engine.cleanup_orphaned().await?;
        println!("Removed {} stale cache rows", removed);
        return Ok(());
    }

    let server = Server::bind(&config.server, registry.clone()).await?;
    let base_url = server.base_url();
    let engine = Engine::new(db, registry, config, &base_url);

    if let Some(query) = &args.search {
        for record in engine.search(query, None, 50).await? {
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(());
    }

    if args.sweep {
        let folder = args.folder.as_ref().context("--sweep needs a FOLDER")?;
        let project = engine.add_folder(folder).await?.project().clone();
        let report = engine.sweep_orphans(&project.id).await?;
        println!("Removed {} orphaned files, kept {}", report.removed, report.kept);
        return Ok(());
    }

    let handle = server.spawn();
    let mut events = engine.subscribe();

    let cached = match &args.folder {
        Some(folder) => engine.open_folder(folder).await?,
        None => {
            let recent = engine.list_projects().await?.into_iter().next();
            match recent {
                Some(project) => engine.open_project(&project.id).await?,
                None => {
                    handle.shutdown().await?;
                    anyhow::bail!("No FOLDER given and no project opened before");
                }
            }
        }
    };
    for record in &cached {
        println!("{}", serde_json::to_string(record)?);
    }
    info!("Serving previews at {}", base_url);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    handle.shutdown().await
}
