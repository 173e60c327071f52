#[cfg(all(target_env = "musl", target_arch = "x86_64"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context as _, Error};
use camino::Utf8PathBuf as PathBuf;
use cli_table::{Cell, Table};
use clap::builder::{PossibleValuesParser, TypedValueParser as _};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use msappkit::model::{Architecture, ProductId};
use msappkit::pipeline::ArchitecturePolicy;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;

fn setup_logger(json: bool, log_level: LevelFilter) -> Result<(), Error> {
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();

    // If a user specifies a log level, we assume it only pertains to msappkit;
    // if they want to trace other crates they can use the RUST_LOG env approach.
    env_filter = env_filter.add_directive(format!("msappkit={}", log_level).parse()?);

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(subscriber.json().finish())
            .context("failed to set default subscriber")?;
    } else {
        tracing::subscriber::set_global_default(subscriber.finish())
            .context("failed to set default subscriber")?;
    }

    Ok(())
}

const ARCH_POLICIES: &[&str] = &["all", "autodetect", "x86", "x64", "arm", "arm64"];
const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

fn parse_level(s: &str) -> Result<LevelFilter, Error> {
    s.parse::<LevelFilter>()
        .map_err(|_e| anyhow::anyhow!("failed to parse level '{s}'"))
}

#[derive(Subcommand)]
enum StoreCommand {
    /// Resolves a Store product ID into a unified, installable view.
    Get {
        /// The 12+ character Store product ID (e.g. `9NBLGGH4NNS1`).
        product_id: String,
        #[arg(long, default_value = "US")]
        market: String,
        #[arg(long, default_value = "en")]
        language: String,
        #[arg(
            long,
            default_value = "autodetect",
            value_parser = PossibleValuesParser::new(ARCH_POLICIES),
        )]
        arch: String,
        /// For MSIX/AppX products, keep only the highest version per package name.
        #[arg(long)]
        latest_only: bool,
    },
    /// Prints the resolved packages for an MSIX/AppX product, with their
    /// `IsMainPackage`/`Installed` flags.
    ListPackages {
        product_id: String,
        #[arg(long, default_value = "US")]
        market: String,
        #[arg(long, default_value = "en")]
        language: String,
        #[arg(
            long,
            default_value = "autodetect",
            value_parser = PossibleValuesParser::new(ARCH_POLICIES),
        )]
        arch: String,
        #[arg(long)]
        latest_only: bool,
    },
}

#[derive(Subcommand)]
enum WingetCommand {
    /// Downloads and extracts the offline WinGet source catalog.
    Open {
        /// Directory the catalog archive is extracted into.
        output_dir: PathBuf,
        #[arg(long)]
        source_url: Option<String>,
    },
    /// Full-text search across package name, ID, moniker, and publisher.
    Search {
        database_path: PathBuf,
        term: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Shows the manifest for one package, optionally pinned to a version.
    Show {
        database_path: PathBuf,
        package_id: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value = "https://cdn.winget.microsoft.com/cache")]
        source_base: String,
    },
    /// Resolves the installer URL/switches for one package.
    Installer {
        database_path: PathBuf,
        package_id: String,
        #[arg(long, default_value = "x64")]
        arch: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value = "https://cdn.winget.microsoft.com/cache")]
        source_base: String,
    },
}

#[derive(Subcommand)]
enum MsiCommand {
    /// Dumps the fixed Summary Information stream.
    Summary { database_path: PathBuf },
    /// Reads one property, or every property if `name` is omitted.
    GetProperty {
        database_path: PathBuf,
        name: Option<String>,
    },
    /// Sets (inserting or updating) a single property, then commits.
    SetProperty {
        database_path: PathBuf,
        name: String,
        value: String,
    },
    /// Lists every named stream in the database.
    Streams { database_path: PathBuf },
    /// Exports a named stream's bytes to a file.
    ExportBinary {
        database_path: PathBuf,
        stream_name: String,
        out_path: PathBuf,
    },
    /// Writes a file's bytes into a named stream, then commits.
    ImportBinary {
        database_path: PathBuf,
        stream_name: String,
        in_path: PathBuf,
    },
    /// Runs a bare table name or `SELECT ... FROM ... [WHERE ...]` query.
    Query {
        database_path: PathBuf,
        query: String,
    },
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum ScopeArg {
    Machine,
    User,
}

#[derive(Subcommand)]
enum Command {
    /// Microsoft Store delivery pipeline (DisplayCatalog/PackageManifests/FE3).
    Store {
        #[command(subcommand)]
        cmd: StoreCommand,
    },
    /// Offline WinGet catalog and manifest resolution.
    Winget {
        #[command(subcommand)]
        cmd: WingetCommand,
    },
    /// MSI installer database editing.
    Msi {
        #[command(subcommand)]
        cmd: MsiCommand,
    },
    /// Lists installed Win32/AppX programs from the uninstall registry.
    Installed {
        #[arg(long, value_enum)]
        scope: Option<ScopeArg>,
        #[arg(long)]
        include_appx: bool,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(
        short = 'L',
        long = "log-level",
        default_value = "info",
        value_parser = PossibleValuesParser::new(LOG_LEVELS).map(|l| parse_level(&l).unwrap()),
    )]
    level: LevelFilter,
    /// Output log messages as json.
    #[arg(long)]
    json: bool,
    /// Overrides the default cache directory used for the device-token cache
    /// and extracted WinGet archives.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// An HTTPS proxy to use for REST/SOAP requests.
    #[arg(long, env = "HTTPS_PROXY")]
    https_proxy: Option<String>,
    #[command(subcommand)]
    cmd: Command,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    setup_logger(args.json, args.level)?;

    let mut config = match &args.cache_dir {
        Some(dir) => msappkit::config::Config::new(dir.clone()),
        None => msappkit::config::Config::default(),
    };
    config.https_proxy = args.https_proxy.clone();
    config.ensure_cache_dir()?;

    match args.cmd {
        Command::Store { cmd } => run_store(cmd, &config, args.json),
        Command::Winget { cmd } => run_winget(cmd, &config, args.json),
        Command::Msi { cmd } => run_msi(cmd),
        Command::Installed { scope, include_appx } => {
            run_installed(scope, include_appx, args.json)
        }
    }
}

fn build_http(config: &msappkit::config::Config) -> Result<msappkit::http::MsHttpClient, Error> {
    let agent = msappkit::http::MsHttpClient::build_agent(
        config.rest_timeout,
        config.https_proxy.as_deref(),
    )?;
    Ok(msappkit::http::MsHttpClient::new(agent, Arc::new(msappkit::Cv::new())))
}

fn parse_arch_policy(arch: &str) -> Result<ArchitecturePolicy, Error> {
    Ok(match arch {
        "all" => ArchitecturePolicy::All,
        "autodetect" => ArchitecturePolicy::Autodetect(msappkit::locale::detect_architecture()),
        other => ArchitecturePolicy::Exact(
            other
                .parse::<Architecture>()
                .map_err(|e| anyhow::anyhow!("invalid --arch value: {e}"))?,
        ),
    })
}

fn run_store(cmd: StoreCommand, config: &msappkit::config::Config, json: bool) -> Result<(), Error> {
    let resolve = |product_id: &str,
                   market: &str,
                   language: &str,
                   arch: &str,
                   latest_only: bool|
     -> Result<msappkit::model::UnifiedStoreApp, Error> {
        let http = build_http(config)?;
        let product_id = ProductId::parse(product_id)
            .map_err(|e| anyhow::anyhow!("invalid product id: {e}"))?;

        let token_provider =
            msappkit::token::DeviceTokenProvider::new(config.device_token_cache_path());
        let device_token = token_provider.get(msappkit::token::GetOptions {
            elevate_if_needed: false,
            skip_cache: false,
        });

        let installed = msappkit::installed::InstalledPrograms::new(true);
        let pipeline = msappkit::pipeline::StorePipeline::new(&http, &installed);
        let policy = parse_arch_policy(arch)?;

        pipeline
            .get_unified_store_app_info(
                &product_id,
                market,
                language,
                &device_token,
                policy,
                latest_only,
            )
            .map_err(|e| anyhow::anyhow!("{e}"))
    };

    match cmd {
        StoreCommand::Get {
            product_id,
            market,
            language,
            arch,
            latest_only,
        } => {
            let app = resolve(&product_id, &market, &language, &arch, latest_only)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&app)?);
                return Ok(());
            }

            let rows = vec![
                vec!["Product ID".cell(), app.product_id.to_string().cell()],
                vec!["Type".cell(), app.app_type.to_string().cell()],
                vec!["Name".cell(), app.display_name.cell()],
                vec!["Publisher".cell(), app.publisher.cell()],
                vec!["Version".cell(), app.version.cell()],
                vec!["Category".cell(), app.category.cell()],
                vec![
                    "Price".cell(),
                    if app.is_free {
                        "free".to_string().cell()
                    } else {
                        app.price
                            .map(|p| format!("{p:.2}"))
                            .unwrap_or_default()
                            .cell()
                    },
                ],
            ];
            let table = rows.table().title(vec!["Field".cell(), "Value".cell()]);
            println!("{}", table.display()?);
            Ok(())
        }
        StoreCommand::ListPackages {
            product_id,
            market,
            language,
            arch,
            latest_only,
        } => {
            let app = resolve(&product_id, &market, &language, &arch, latest_only)?;
            let packages = match &app.download_info {
                msappkit::model::DownloadInfo::MsixOrAppx { packages, .. } => packages.clone(),
                msappkit::model::DownloadInfo::Win32 { .. } => {
                    anyhow::bail!("'{product_id}' is a Win32 product, which has no package list")
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&packages)?);
                return Ok(());
            }

            let rows: Vec<_> = packages
                .iter()
                .map(|p| {
                    vec![
                        p.package_name.clone().cell(),
                        p.version.clone().cell(),
                        p.architecture
                            .map(|a| a.to_string())
                            .unwrap_or_default()
                            .cell(),
                        p.is_main_package.to_string().cell(),
                        p.installed.to_string().cell(),
                    ]
                })
                .collect();
            let table = rows.table().title(vec![
                "Package".cell(),
                "Version".cell(),
                "Architecture".cell(),
                "IsMainPackage".cell(),
                "Installed".cell(),
            ]);
            println!("{}", table.display()?);
            Ok(())
        }
    }
}

fn run_winget(cmd: WingetCommand, config: &msappkit::config::Config, json: bool) -> Result<(), Error> {
    match cmd {
        WingetCommand::Open {
            output_dir,
            source_url,
        } => {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message("downloading and extracting winget catalog archive...");
            spinner.enable_steady_tick(std::time::Duration::from_millis(100));

            let http = build_http(config)?;
            let catalog = msappkit::winget::WingetCatalog::open(
                &http,
                source_url.as_deref(),
                &output_dir,
                false,
            )
            .map_err(|e| anyhow::anyhow!("{e}"));

            let catalog = match catalog {
                Ok(c) => {
                    spinner.finish_with_message("catalog extracted");
                    c
                }
                Err(e) => {
                    spinner.finish_with_message("failed");
                    return Err(e);
                }
            };

            println!(
                "opened catalog at {} ({:.1} MB, {} packages)",
                catalog.database_path,
                catalog.database_size_mb,
                catalog.count().map_err(|e| anyhow::anyhow!("{e}"))?,
            );
            Ok(())
        }
        WingetCommand::Search {
            database_path,
            term,
            limit,
        } => {
            let catalog = open_catalog(&database_path)?;
            let rows = catalog
                .search_packages(&term, true, limit)
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }

            let table_rows: Vec<_> = rows
                .iter()
                .map(|r| vec![r.rowid.to_string().cell(), r.id.clone().cell(), r.name.clone().cell()])
                .collect();
            let table = table_rows
                .table()
                .title(vec!["Row".cell(), "Package ID".cell(), "Name".cell()]);
            println!("{}", table.display()?);
            Ok(())
        }
        WingetCommand::Show {
            database_path,
            package_id,
            version,
            source_base,
        } => {
            let http = ureq_only_client()?;
            let catalog = open_catalog(&database_path)?;
            let fetcher = msappkit::winget::WingetManifestFetcher::new(&http, source_base);
            let manifest = fetcher
                .get_manifest(&catalog, &package_id, version.as_deref())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_yaml::to_string(&manifest.document)?);
            Ok(())
        }
        WingetCommand::Installer {
            database_path,
            package_id,
            arch,
            version,
            source_base,
        } => {
            let http = ureq_only_client()?;
            let catalog = open_catalog(&database_path)?;
            let fetcher = msappkit::winget::WingetManifestFetcher::new(&http, source_base);
            let manifest = fetcher
                .get_manifest(&catalog, &package_id, version.as_deref())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let arch: Architecture = arch
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --arch value: {e}"))?;
            let installer = fetcher
                .get_package_installer(&manifest, arch, None, None)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("installer_type: {}", installer.installer_type);
            println!("silent: {}", installer.silent);
            println!("url: {}", installer.url);
            Ok(())
        }
    }
}

fn open_catalog(database_path: &PathBuf) -> Result<msappkit::winget::WingetCatalog, Error> {
    let extract_path = database_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(msappkit::winget::WingetCatalog {
        database_path: database_path.clone(),
        extract_path,
        source_url: String::new(),
        database_size_mb: std::fs::metadata(database_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0),
    })
}

fn ureq_only_client() -> Result<msappkit::http::MsHttpClient, Error> {
    let agent = msappkit::http::MsHttpClient::build_agent(
        msappkit::config::DEFAULT_REST_TIMEOUT,
        None,
    )?;
    Ok(msappkit::http::MsHttpClient::new(agent, Arc::new(msappkit::Cv::new())))
}

fn run_msi(cmd: MsiCommand) -> Result<(), Error> {
    match cmd {
        MsiCommand::Summary { database_path } => {
            let db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&db.get_summary())?);
            Ok(())
        }
        MsiCommand::GetProperty {
            database_path,
            name,
        } => {
            let mut db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let props = db
                .get_property(name.as_deref())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for (k, v) in props {
                println!("{k}={v}");
            }
            Ok(())
        }
        MsiCommand::SetProperty {
            database_path,
            name,
            value,
        } => {
            let mut db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.open_database(msappkit::msi_db::Mode::Transact)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.set_property(&name, &value)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.commit().map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(())
        }
        MsiCommand::Streams { database_path } => {
            let db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for name in db.get_streams() {
                println!("{name}");
            }
            Ok(())
        }
        MsiCommand::ExportBinary {
            database_path,
            stream_name,
            out_path,
        } => {
            let mut db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.get_binary(&stream_name, &out_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(())
        }
        MsiCommand::ImportBinary {
            database_path,
            stream_name,
            in_path,
        } => {
            let mut db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.open_database(msappkit::msi_db::Mode::Direct)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.set_binary(&stream_name, &in_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            db.commit().map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(())
        }
        MsiCommand::Query {
            database_path,
            query,
        } => {
            let mut db = msappkit::msi_db::MsiDatabase::open(&database_path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let rows = db.execute_sql(&query).map_err(|e| anyhow::anyhow!("{e}"))?;
            for row in rows {
                println!("{row:?}");
            }
            Ok(())
        }
    }
}

fn run_installed(scope: Option<ScopeArg>, include_appx: bool, json: bool) -> Result<(), Error> {
    let installed = msappkit::installed::InstalledPrograms::new(include_appx);
    let programs: Vec<_> = installed
        .list()
        .into_iter()
        .filter(|p| match scope {
            Some(ScopeArg::Machine) => p.scope == msappkit::installed::Scope::Machine,
            Some(ScopeArg::User) => p.scope == msappkit::installed::Scope::User,
            None => true,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&programs)?);
        return Ok(());
    }

    let rows: Vec<_> = programs
        .iter()
        .map(|p| {
            vec![
                p.name.clone().cell(),
                format!("{:?}", p.program_type).cell(),
                p.publisher.clone().unwrap_or_default().cell(),
                p.version.clone().unwrap_or_default().cell(),
                format!("{:?}", p.scope).cell(),
            ]
        })
        .collect();
    let table = rows.table().title(vec![
        "Name".cell(),
        "Type".cell(),
        "Publisher".cell(),
        "Version".cell(),
        "Scope".cell(),
    ]);
    println!("{}", table.display()?);
    Ok(())
}
