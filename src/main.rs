//! CLI entry point for `mailengine`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mailengine::compose::{compose_message, create_reply};
use mailengine::config::Config;
use mailengine::delivery::{DeliveryPolicy, InboundDeliverer};
use mailengine::import::{
    import_folder, import_mbox_file, ImapImportOptions, ImapImportReport, ImapSessionConnection,
    MboxImportReport,
};
use mailengine::model::address::EmailAddress;
use mailengine::model::message::ParsedMessage;
use mailengine::parser::{mbox, parse_message};
use mailengine::store::{MemoryStore, Store};

#[derive(Parser)]
#[command(
    name = "mailengine",
    version,
    about = "Mail delivery and threading engine",
    after_help = "Configuration is read from $MAILENGINE_CONFIG or ~/.config/mailengine/config.toml."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a single message and show its structure
    Parse {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Split an MBOX file into individual .eml files
    Split {
        path: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Import an MBOX file into an in-memory mailbox and summarize the threads
    Import {
        path: PathBuf,
        /// Recipient mailbox address
        #[arg(long)]
        to: String,
        #[arg(long)]
        json: bool,
    },
    /// Import folders from the IMAP account in the config file
    ImapImport {
        /// Recipient mailbox address
        #[arg(long)]
        to: String,
        /// Folder name, or ALL for every folder
        #[arg(long, default_value = "INBOX")]
        folder: String,
        /// Only the most recent N messages per folder
        #[arg(long, value_name = "N")]
        max: Option<usize>,
        /// Label threads with their source folder
        #[arg(long)]
        label: bool,
        #[arg(long)]
        json: bool,
    },
    /// Compose a reply to a message and print it
    Reply {
        path: PathBuf,
        #[arg(long)]
        text: String,
        /// Optional HTML body for the reply
        #[arg(long)]
        html: Option<String>,
        /// Sender address (defaults to the first To: of the original)
        #[arg(long)]
        from: Option<String>,
        /// Do not quote the original message
        #[arg(long)]
        no_quote: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = mailengine::config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Parse { path, json } => cmd_parse(&path, json),
        Commands::Split { path, output } => cmd_split(&path, &output),
        Commands::Import { path, to, json } => cmd_import(&path, &to, json, &config),
        Commands::ImapImport {
            to,
            folder,
            max,
            label,
            json,
        } => cmd_imap_import(
            &to,
            ImapImportOptions {
                folder,
                max_messages: max,
                label,
            },
            json,
            &config,
        ),
        Commands::Reply {
            path,
            text,
            html,
            from,
            no_quote,
        } => cmd_reply(&path, &text, html.as_deref(), from.as_deref(), !no_quote),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Log to stderr, and to `mailengine.log` in the cache directory when it
/// can be created. `RUST_LOG` overrides the level.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = mailengine::config::cache_dir(config);
    let file_layer = std::fs::create_dir_all(&log_dir).ok().map(|()| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(tracing_appender::rolling::never(&log_dir, "mailengine.log"))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailengine", &mut std::io::stdout());
    Ok(())
}

fn cmd_manpage() -> anyhow::Result<()> {
    clap_mangen::Man::new(Cli::command()).render(&mut std::io::stdout().lock())?;
    Ok(())
}

fn read_message(path: &Path) -> anyhow::Result<(Vec<u8>, ParsedMessage)> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let raw = std::fs::read(path)?;
    let parsed = parse_message(&raw)?;
    Ok((raw, parsed))
}

/// Show the decomposition of a single message.
fn cmd_parse(path: &Path, json: bool) -> anyhow::Result<()> {
    let (_, parsed) = read_message(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
    } else {
        print_parsed_table(&parsed);
    }
    Ok(())
}

fn print_parsed_table(parsed: &ParsedMessage) {
    use humansize::{format_size, BINARY};

    let list = |addrs: &[EmailAddress]| {
        addrs
            .iter()
            .map(EmailAddress::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    println!();
    println!("  {:<14} {}", "Subject", parsed.subject);
    println!("  {:<14} {}", "From", parsed.from);
    if !parsed.to.is_empty() {
        println!("  {:<14} {}", "To", list(&parsed.to));
    }
    if !parsed.cc.is_empty() {
        println!("  {:<14} {}", "Cc", list(&parsed.cc));
    }
    println!(
        "  {:<14} {}{}",
        "Date",
        parsed.date.format("%Y-%m-%d %H:%M:%S UTC"),
        if parsed.has_date { "" } else { " (assumed)" }
    );
    if let Some(id) = &parsed.message_id {
        println!("  {:<14} <{id}>", "Message-ID");
    }
    if let Some(id) = &parsed.in_reply_to {
        println!("  {:<14} <{id}>", "In-Reply-To");
    }
    println!("  {:<14} {}", "Headers", parsed.headers.len());

    println!();
    for part in parsed.text_body.iter().chain(&parsed.html_body) {
        println!(
            "    [{}] {:<12} {:>10}",
            part.part_id,
            part.content_type,
            format_size(part.content.len(), BINARY)
        );
    }
    for att in &parsed.attachments {
        println!(
            "    {:<10} {:<24} {:>10}  {}{}",
            att.disposition.as_str(),
            att.content_type,
            format_size(att.size, BINARY),
            att.name,
            att.cid
                .as_deref()
                .map(|c| format!(" <{c}>"))
                .unwrap_or_default()
        );
    }
    println!();
}

/// Write every message of an MBOX file to `<output>/NNNNN.eml`.
fn cmd_split(path: &Path, output: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let messages = mbox::split_mbox_file(path)?;
    std::fs::create_dir_all(output)?;

    let pb = ProgressBar::new(messages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Splitting [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );
    for (idx, raw) in messages.iter().enumerate() {
        std::fs::write(output.join(format!("{:05}.eml", idx + 1)), raw)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("  Wrote {} message(s) to {}", messages.len(), output.display());
    Ok(())
}

/// A throwaway in-memory store and a deliverer that creates any mailbox.
fn dry_run_engine(config: &Config) -> (Arc<MemoryStore>, InboundDeliverer) {
    let store = Arc::new(MemoryStore::new());
    let mut policy = DeliveryPolicy::from_config(&config.delivery);
    policy.accept_all_emails = true;
    let deliverer = InboundDeliverer::new(store.clone(), policy);
    (store, deliverer)
}

/// Import an MBOX file into a dry-run mailbox and print its threads.
fn cmd_import(path: &Path, to: &str, json: bool, config: &Config) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let (store, deliverer) = dry_run_engine(config);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} Importing {pos} message(s) {msg}")?,
    );

    let start = Instant::now();
    let report = import_mbox_file(path, to, &deliverer, &mut |r: &MboxImportReport| {
        pb.set_position(r.total as u64);
        if r.failed > 0 {
            pb.set_message(format!("({} failed)", r.failed));
        }
    })?;
    pb.finish_and_clear();
    let elapsed = start.elapsed();

    if json {
        print_mailbox_json(&store, to, &serde_json::to_value(report)?)
    } else {
        println!();
        println!("  {:<20} {}", "Messages", report.total);
        println!("  {:<20} {}", "Delivered", report.delivered);
        println!("  {:<20} {}", "Duplicates", report.duplicates);
        println!("  {:<20} {}", "Failed", report.failed);
        println!("  {:<20} {:.2?}", "Import time", elapsed);
        print_mailbox_threads(&store, to)
    }
}

/// Import IMAP folders into a dry-run mailbox and print its threads.
fn cmd_imap_import(
    to: &str,
    options: ImapImportOptions,
    json: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let (store, deliverer) = dry_run_engine(config);
    let mut conn = ImapSessionConnection::connect(&config.imap)?;
    let report = import_folder(&mut conn, &deliverer, store.as_ref(), to, &options)?;

    if json {
        print_mailbox_json(&store, to, &serde_json::to_value(&report)?)
    } else {
        print_folder_table(&report);
        print_mailbox_threads(&store, to)
    }
}

fn print_folder_table(report: &ImapImportReport) {
    println!();
    for f in &report.folders {
        match &f.error {
            Some(e) => println!("  {:<24} error: {e}", f.folder),
            None => println!(
                "  {:<24} {:>6} found {:>6} delivered {:>6} duplicates {:>6} failed",
                f.folder, f.found, f.delivered, f.duplicates, f.failed
            ),
        }
    }
}

fn mailbox_threads(
    store: &MemoryStore,
    to: &str,
) -> anyhow::Result<Vec<mailengine::model::entity::Thread>> {
    let addr = EmailAddress::new("", to);
    let Some((local, domain)) = addr.split() else {
        anyhow::bail!("Invalid recipient address: {to}");
    };
    match store.find_mailbox(local, domain)? {
        Some(mailbox) => Ok(store.threads(mailbox.id)?),
        None => Ok(Vec::new()),
    }
}

fn print_mailbox_threads(store: &MemoryStore, to: &str) -> anyhow::Result<()> {
    let threads = mailbox_threads(store, to)?;
    println!();
    println!("  {} thread(s) in {to}", threads.len());
    for t in &threads {
        println!(
            "    {:>4} msg {:>4} unread  {:<40}  {}",
            t.count_messages,
            t.count_unread,
            t.subject,
            t.sender_names.join(" .. ")
        );
    }
    println!();
    Ok(())
}

fn print_mailbox_json(
    store: &MemoryStore,
    to: &str,
    report: &serde_json::Value,
) -> anyhow::Result<()> {
    let threads = mailbox_threads(store, to)?;
    let output = serde_json::json!({
        "recipient": to,
        "report": report,
        "threads": threads,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Compose a reply to the message at `path` and print the raw MIME.
fn cmd_reply(
    path: &Path,
    text: &str,
    html: Option<&str>,
    from: Option<&str>,
    include_quote: bool,
) -> anyhow::Result<()> {
    let (_, original) = read_message(path)?;
    let mut reply = create_reply(&original, text, html, include_quote);
    reply.from = match from {
        Some(f) => Some(EmailAddress::parse(f)),
        None => original.to.first().cloned(),
    };
    if reply.from.is_none() {
        anyhow::bail!("The original has no To: address; pass --from");
    }
    let raw = compose_message(&reply, None)?;
    std::io::Write::write_all(&mut std::io::stdout(), &raw)?;
    Ok(())
}
