use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use mbox_iterator::{mailbox::{BoundaryFlags, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PATTERN, DEFAULT_SPILL_LIMIT}, Email, MboxConfig, MboxIterator};

/// Lists the messages of an mbox archive.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the mbox file
    path: PathBuf,

    /// Charset of the file (WHATWG label)
    #[arg(long, default_value = "UTF-8")]
    charset: String,

    /// Regex matching the From_ separator lines
    #[arg(long, default_value = DEFAULT_PATTERN)]
    pattern: String,

    /// Decode window size, in decoded bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Bytes of a message allowed outside the window, 0 rejects larger messages
    #[arg(long, default_value_t = DEFAULT_SPILL_LIMIT)]
    spill_limit: usize,

    /// Separator lines end with CRLF
    #[arg(long)]
    crlf: bool,

    #[arg(long)]
    ignore_case: bool,

    /// One JSON object per message
    #[arg(long)]
    json: bool,
}

impl From<&Args> for MboxConfig {
    fn from(args: &Args) -> Self {
        MboxConfig {
            charset: args.charset.clone(),
            pattern: args.pattern.clone(),
            flags: BoundaryFlags { crlf: args.crlf, case_insensitive: args.ignore_case, ..BoundaryFlags::default() },
            max_message_size: args.max_message_size,
            spill_limit: args.spill_limit,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let mut mbox = MboxIterator::builder(&args.path)
        .config(MboxConfig::from(&args))
        .build()
        .with_context(|| format!("Error opening mbox {}", args.path.display()))?;
    while let Some(message) = mbox.next_message()? {
        let email = Email::from(&message);
        if args.json {
            println!("{}", serde_json::to_string(&email)?);
        } else {
            println!("{email}");
        }
    }
    info!(messages = mbox.messages_read(), "Done");
    Ok(())
}
