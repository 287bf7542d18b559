//! xp-queue - Schedule, inspect and cancel posts
//!
//! Unix-style front-end to the scheduling service. Every command prints JSON
//! on stdout; `list` can also print one line per post.

use std::io::Read;

use clap::{Args, Parser, Subcommand};
use libcrosspost::logging::LoggingConfig;
use libcrosspost::scheduling::parse_schedule;
use libcrosspost::service::schedule::{DraftRequest, ResolveRequest, ScheduleRequest};
use libcrosspost::service::CrosspostService;
use libcrosspost::types::{MediaKind, MediaRef, PlatformTarget, PostOptions};
use libcrosspost::{Config, CrosspostError, Post, PostStatus, Provider, Result};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "xp-queue")]
#[command(version)]
#[command(about = "Schedule, inspect and cancel posts")]
#[command(long_about = "\
xp-queue - Schedule, inspect and cancel posts

DESCRIPTION:
    xp-queue creates and updates scheduled posts, resolves posts held back by
    preflight, and shows their state and job log. Results are printed as JSON.

    Scheduling always runs preflight. When every platform is ready the post
    becomes 'scheduled' and a delayed publish job is queued; otherwise it is
    'scheduled_pending' and the blocking issues are listed in the response.

COMMANDS:
    schedule    Create or update a schedule
    resolve     Re-check a scheduled_pending post with new platforms
    draft       Save a draft without scheduling
    show        Show a post with character counts and its last error
    duplicate   Copy a post into a new draft
    cancel      Cancel a schedule and return the post to draft
    list        List posts
    logs        Show a post's job log

USAGE EXAMPLES:
    # Schedule for Pinterest (board required) and X
    xp-queue schedule --owner u1 --caption \"Launch day\" \\
        --at \"tomorrow 3pm\" --platform pinterest:1234 --platform twitter

    # Same request as JSON on stdin
    echo '{\"ownerId\":\"u1\",...}' | xp-queue schedule --json -

    # Move an existing schedule
    xp-queue schedule --post-id <ID> --owner u1 --caption \"Launch day\" \\
        --at 2h --platform twitter

    # Fix a missing board
    xp-queue resolve <ID> --platform pinterest:1234

TIME FORMATS:
    RFC 3339 (2026-11-20T15:00:00Z), plain UTC (2026-11-20 15:00),
    durations (30m, 2h, \"in 1 hour\") and phrases (\"tomorrow 3pm\").

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (past time, unknown provider, bad post ID, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a schedule
    Schedule(ScheduleArgs),

    /// Re-run preflight on a scheduled_pending post
    Resolve {
        post_id: String,

        /// Platform, optionally with a board: "twitter", "pinterest:1234"
        #[arg(short, long = "platform", required = true)]
        platforms: Vec<String>,
    },

    /// Create or update a draft
    Draft(DraftArgs),

    /// Show one post
    Show { post_id: String },

    /// Copy a post into a new draft
    Duplicate { post_id: String },

    /// Cancel a schedule
    Cancel { post_id: String },

    /// List posts
    List {
        /// Only this owner's posts
        #[arg(long)]
        owner: Option<String>,

        /// Only posts in this status (draft, scheduled_pending, scheduled, ...)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Show a post's job log, oldest first
    Logs { post_id: String },
}

#[derive(Args, Debug)]
struct ContentArgs {
    #[arg(long)]
    owner: Option<String>,

    #[arg(long)]
    caption: Option<String>,

    /// Image URL in the media store
    #[arg(long, conflicts_with = "video")]
    image: Option<String>,

    /// Video URL in the media store
    #[arg(long)]
    video: Option<String>,

    /// Platform, optionally with a board: "twitter", "pinterest:1234"
    #[arg(short, long = "platform")]
    platforms: Vec<String>,

    #[arg(long)]
    tone: Option<String>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    category: Option<String>,
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    /// Existing post to update
    #[arg(long)]
    post_id: Option<String>,

    /// When to publish
    #[arg(long, required_unless_present = "json")]
    at: Option<String>,

    /// Read the whole request as JSON from a file, or '-' for stdin
    #[arg(long, value_name = "PATH")]
    json: Option<String>,

    #[command(flatten)]
    content: ContentArgs,
}

#[derive(Args, Debug)]
struct DraftArgs {
    /// Existing draft to update
    #[arg(long)]
    post_id: Option<String>,

    #[command(flatten)]
    content: ContentArgs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let service = CrosspostService::from_config(config).await?;
    let schedule = service.schedule();

    match cli.command {
        Commands::Schedule(args) => {
            let request = schedule_request(args)?;
            print_json(&schedule.upsert(request).await?)
        }
        Commands::Resolve { post_id, platforms } => {
            let request = ResolveRequest {
                platforms: parse_platforms(&platforms)?,
            };
            print_json(&schedule.resolve(&post_id, request).await?)
        }
        Commands::Draft(args) => {
            let request = draft_request(args)?;
            print_json(&schedule.save_draft(request).await?)
        }
        Commands::Show { post_id } => print_json(&schedule.detail(&post_id).await?),
        Commands::Duplicate { post_id } => print_json(&schedule.duplicate(&post_id).await?),
        Commands::Cancel { post_id } => {
            let outcome = schedule.cancel(&post_id).await?;
            print_json(&serde_json::json!({ "id": post_id, "outcome": outcome }))
        }
        Commands::List {
            owner,
            status,
            limit,
            format,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<PostStatus>)
                .transpose()?;
            let posts = schedule.list(owner.as_deref(), status, limit).await?;
            match format.as_str() {
                "json" => print_json(&posts),
                "text" => {
                    output_list_text(&posts);
                    Ok(())
                }
                other => Err(CrosspostError::InvalidInput(format!(
                    "Invalid format '{}'. Must be 'text' or 'json'",
                    other
                ))),
            }
        }
        Commands::Logs { post_id } => print_json(&schedule.logs(&post_id).await?),
    }
}

fn schedule_request(args: ScheduleArgs) -> Result<ScheduleRequest> {
    if let Some(source) = &args.json {
        let mut request: ScheduleRequest = serde_json::from_str(&read_source(source)?)
            .map_err(|e| CrosspostError::InvalidInput(format!("Invalid request JSON: {}", e)))?;
        if args.post_id.is_some() {
            request.post_id = args.post_id;
        }
        return Ok(request);
    }

    let at = args
        .at
        .as_deref()
        .ok_or_else(|| CrosspostError::InvalidInput("--at is required".to_string()))?;
    let content = args.content;
    Ok(ScheduleRequest {
        post_id: args.post_id,
        owner_id: required(content.owner, "--owner")?,
        caption: required(content.caption, "--caption")?,
        media: media(content.image, content.video),
        scheduled_at: parse_schedule(at)?,
        platforms: parse_platforms(&content.platforms)?,
        options: PostOptions {
            tone: content.tone,
            language: content.language,
            category: content.category,
        },
    })
}

fn draft_request(args: DraftArgs) -> Result<DraftRequest> {
    let content = args.content;
    Ok(DraftRequest {
        post_id: args.post_id,
        owner_id: required(content.owner, "--owner")?,
        caption: content.caption.unwrap_or_default(),
        media: media(content.image, content.video),
        platforms: parse_platforms(&content.platforms)?,
        options: PostOptions {
            tone: content.tone,
            language: content.language,
            category: content.category,
        },
    })
}

fn required(value: Option<String>, flag: &str) -> Result<String> {
    value.ok_or_else(|| CrosspostError::InvalidInput(format!("{} is required", flag)))
}

fn media(image: Option<String>, video: Option<String>) -> Option<MediaRef> {
    match (image, video) {
        (Some(url), _) => Some(MediaRef {
            kind: MediaKind::Image,
            url,
        }),
        (None, Some(url)) => Some(MediaRef {
            kind: MediaKind::Video,
            url,
        }),
        (None, None) => None,
    }
}

/// "pinterest:1234" becomes Pinterest with board 1234
fn parse_platform(arg: &str) -> Result<PlatformTarget> {
    match arg.split_once(':') {
        Some((provider, board)) => Ok(PlatformTarget::with_board(
            provider.parse::<Provider>()?,
            board,
        )),
        None => Ok(PlatformTarget::new(arg.parse::<Provider>()?)),
    }
}

fn parse_platforms(args: &[String]) -> Result<Vec<PlatformTarget>> {
    args.iter().map(|a| parse_platform(a)).collect()
}

fn read_source(source: &str) -> Result<String> {
    let mut content = String::new();
    if source == "-" {
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|e| CrosspostError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    } else {
        content = std::fs::read_to_string(source).map_err(|e| {
            CrosspostError::InvalidInput(format!("Failed to read {}: {}", source, e))
        })?;
    }
    Ok(content)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CrosspostError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// One line per post: id, status, when, caption preview
fn output_list_text(posts: &[Post]) {
    let now = chrono::Utc::now().timestamp();
    for post in posts {
        let when = post
            .scheduled_at
            .map(|ts| format_time_until(now, ts))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} | {} | {} | {}",
            post.id,
            post.status,
            when,
            truncate_content(&post.caption, 50)
        );
    }
}

/// Truncate to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
