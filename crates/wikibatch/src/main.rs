use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use walkdir::WalkDir;
use wikibatch_core::client::{ActionClient, EditMode};
use wikibatch_core::config::{BotConfig, ClientConfig, load_config};
use wikibatch_core::dispatcher::{ActionItem, BatchDispatcher, BatchOptions, BatchReport};
use wikibatch_core::namespace::{NS_FILE, NamespaceResolver};
use wikibatch_core::transport::HttpTransport;

mod listing;

#[derive(Debug, Parser)]
#[command(
    name = "wikibatch",
    version,
    about = "Batch write operations against a MediaWiki API"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Path to wikibatch.toml")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "N", help = "Worker pool size")]
    concurrency: Option<usize>,
    #[arg(long, global = true, value_name = "N", help = "Attempts per call before an item fails")]
    retries: Option<usize>,
    #[arg(long, global = true, value_name = "MS", help = "Initial backoff between attempts")]
    backoff_ms: Option<u64>,
    #[arg(long, global = true, help = "Print planned items without executing")]
    dry_run: bool,
    #[arg(long, global = true, help = "Print the batch report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Delete every member of a category")]
    Nuke(NukeArgs),
    #[command(about = "Delete titles listed in a file")]
    Delete(TitleFileArgs),
    #[command(about = "Edit titles listed in a file")]
    Edit(EditArgs),
    #[command(about = "Purge titles listed in a file")]
    Purge(PurgeArgs),
    #[command(about = "Upload a file, or every file in a directory")]
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
struct NukeArgs {
    category: String,
    #[arg(short = 'r', long)]
    reason: String,
}

#[derive(Debug, Args)]
struct TitleFileArgs {
    file: PathBuf,
    #[arg(short = 'r', long)]
    reason: String,
}

#[derive(Debug, Args)]
struct EditArgs {
    file: PathBuf,
    #[arg(long)]
    text: String,
    #[arg(short = 's', long)]
    summary: String,
    #[arg(long, value_enum, default_value_t = EditModeArg::Replace)]
    mode: EditModeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EditModeArg {
    Replace,
    Prepend,
    Append,
}

impl From<EditModeArg> for EditMode {
    fn from(mode: EditModeArg) -> Self {
        match mode {
            EditModeArg::Replace => EditMode::Replace,
            EditModeArg::Prepend => EditMode::Prepend,
            EditModeArg::Append => EditMode::Append,
        }
    }
}

#[derive(Debug, Args)]
struct PurgeArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct UploadArgs {
    source: PathBuf,
    #[arg(short = 'd', long)]
    description: String,
    #[arg(short = 's', long)]
    summary: String,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = resolve_config_path(&cli);
    let config = load_config(&config_path)?;
    let client_config = ClientConfig::from_config(&config);
    if client_config.api_url.trim().is_empty() {
        bail!(
            "no API URL configured; set WIKI_API_URL or [wiki].api_url in {}",
            config_path.display()
        );
    }

    let resolver = NamespaceResolver::with_custom_namespaces(&config.wiki.custom_namespaces);
    let options = batch_options(&cli, &config);
    let items = build_items(&cli.command, &resolver, &client_config)?;
    if items.is_empty() {
        println!("nothing to do");
        return Ok(());
    }

    if cli.dry_run {
        println!("dry run: {} items", items.len());
        for item in &items {
            println!("  - {}", item.label());
        }
        return Ok(());
    }

    let username = require_env("WIKI_BOT_USER")?;
    let password = require_env("WIKI_BOT_PASS")?;
    let mut client = ActionClient::from_config(&client_config)?;
    client
        .login(username.trim(), password.trim())
        .context("login failed")?;

    let dispatcher = BatchDispatcher::new(&client, options);
    let report = dispatcher.run(items);
    print_report(&report, cli.json)?;
    if !report.is_clean() {
        bail!(
            "{} of {} items failed permanently",
            report.failed.len(),
            report.total
        );
    }
    Ok(())
}

fn resolve_config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    if let Ok(value) = env::var("WIKIBATCH_CONFIG") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from("wikibatch.toml")
}

fn batch_options(cli: &Cli, config: &BotConfig) -> BatchOptions {
    let mut options = config.batch_options();
    if let Some(concurrency) = cli.concurrency {
        options.concurrency = concurrency.max(1);
    }
    if let Some(retries) = cli.retries {
        options.retry.max_attempts = retries.max(1);
    }
    if let Some(backoff_ms) = cli.backoff_ms {
        options.retry.initial_backoff = Duration::from_millis(backoff_ms);
    }
    options
}

fn build_items(
    command: &Commands,
    resolver: &NamespaceResolver,
    client_config: &ClientConfig,
) -> Result<Vec<ActionItem>> {
    match command {
        Commands::Nuke(args) => {
            let transport = HttpTransport::new(client_config)?;
            let members = listing::category_members(&transport, &args.category)?;
            Ok(members
                .into_iter()
                .map(|title| ActionItem::Delete {
                    title: resolver.resolve(&title),
                    reason: args.reason.clone(),
                })
                .collect())
        }
        Commands::Delete(args) => {
            let titles = listing::read_titles_file(&args.file)?;
            Ok(titles
                .into_iter()
                .map(|title| ActionItem::Delete {
                    title: resolver.resolve(&title),
                    reason: args.reason.clone(),
                })
                .collect())
        }
        Commands::Edit(args) => {
            let titles = listing::read_titles_file(&args.file)?;
            Ok(titles
                .into_iter()
                .map(|title| ActionItem::Edit {
                    title: resolver.resolve(&title),
                    text: args.text.clone(),
                    summary: args.summary.clone(),
                    mode: args.mode.into(),
                })
                .collect())
        }
        Commands::Purge(args) => {
            let titles = listing::read_titles_file(&args.file)?;
            // The purge module caps title lists at 50 per call.
            Ok(titles
                .chunks(50)
                .map(|batch| ActionItem::Purge {
                    titles: batch.iter().map(|title| resolver.resolve(title)).collect(),
                })
                .collect())
        }
        Commands::Upload(args) => {
            let sources = collect_upload_sources(&args.source)?;
            let mut items = Vec::with_capacity(sources.len());
            for source in sources {
                let file_name = source
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| {
                        anyhow::anyhow!("upload source has no usable name: {}", source.display())
                    })?;
                let target = resolver.coerce_into(file_name, NS_FILE);
                items.push(ActionItem::Upload {
                    target,
                    source,
                    description: args.description.clone(),
                    summary: args.summary.clone(),
                });
            }
            Ok(items)
        }
    }
}

fn collect_upload_sources(source: &Path) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    if !source.is_dir() {
        bail!("upload source does not exist: {}", source.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("failed to scan {}", source.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn require_env(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{key} is required"),
    }
}

fn print_report(report: &BatchReport, as_json: bool) -> Result<()> {
    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("failed to serialize batch report")?
        );
        return Ok(());
    }
    println!("total: {}", report.total);
    println!("succeeded: {}", report.succeeded);
    println!("failed: {}", report.failed.len());
    for failure in &report.failed {
        println!(
            "  - {} [{}]: {}",
            failure.item.label(),
            failure.kind.as_str(),
            failure.cause
        );
    }
    Ok(())
}
