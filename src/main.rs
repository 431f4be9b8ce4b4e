use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mempack::commands::{context, doctor, drain, forget, ingest, link, remember, search, state, update};
use mempack::config::{AppContext, Overrides, resolve};
use mempack::output::Format;

#[derive(Parser)]
#[command(
    name = "mempack",
    version,
    about = "Per-repository memory store and context retrieval for coding agents"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Workspace partition (defaults to "default")
    #[arg(long, global = true, default_value = "")]
    workspace: String,
    /// Override the data root directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    Remember {
        /// Short title
        title: String,
        /// Summary body
        #[arg(long, short)]
        summary: String,
        /// Thread id (defaults to the configured default thread)
        #[arg(long)]
        thread: Option<String>,
        /// Tags (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,
        /// Entities (comma-separated)
        #[arg(long, value_delimiter = ',')]
        entity: Vec<String>,
        /// Anchor the memory to the current HEAD commit
        #[arg(long)]
        anchor: bool,
    },
    /// Patch an existing memory
    Update {
        /// Memory id
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        thread: Option<String>,
        /// Replace the tag list (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
        /// Add tags (repeatable)
        #[arg(long = "add-tag")]
        add_tag: Vec<String>,
        /// Remove tags (repeatable)
        #[arg(long = "remove-tag")]
        remove_tag: Vec<String>,
        /// Replace the entity list (comma-separated)
        #[arg(long, value_delimiter = ',')]
        entities: Option<Vec<String>>,
        /// Add entities (repeatable)
        #[arg(long = "add-entity")]
        add_entity: Vec<String>,
        /// Remove entities (repeatable)
        #[arg(long = "remove-entity")]
        remove_entity: Vec<String>,
        /// Mark this memory superseded by another
        #[arg(long)]
        supersede_with: Option<String>,
    },
    /// Search stored memories (or chunks with --chunks)
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Search ingested chunks instead of memories
        #[arg(long)]
        chunks: bool,
    },
    /// Build the ranked, token-budgeted context pack
    Context {
        /// Natural-language query; empty returns state-only context
        #[arg(default_value = "")]
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Include untruncated chunk texts
        #[arg(long)]
        raw: bool,
        /// Seed rule line (repeatable)
        #[arg(long = "rule")]
        rules: Vec<String>,
        /// Total token budget override
        #[arg(long)]
        budget: Option<usize>,
        /// Deadline in seconds for provider calls
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Ingest a file (or stdin with `-`) as chunked artifact text
    Ingest {
        /// Path to read; `-` for stdin
        path: String,
        /// Artifact kind label
        #[arg(long, default_value = "file")]
        kind: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,
        /// Soft-delete prior chunks from the same source first
        #[arg(long)]
        replace: bool,
    },
    /// Read or write the authoritative workspace state
    State {
        /// New state JSON; omit to read the current state
        #[arg(long)]
        set: Option<String>,
        /// Reason recorded with the history entry
        #[arg(long, default_value = "")]
        reason: String,
        /// Show history instead of current state
        #[arg(long, conflicts_with = "set")]
        history: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Add a typed link between memories, or list links
    Link {
        /// Source memory id (omit with --list)
        #[arg(required_unless_present = "list")]
        from: Option<String>,
        /// Target memory id
        #[arg(required_unless_present = "list")]
        to: Option<String>,
        /// Relation name
        #[arg(long, default_value = "relates_to")]
        rel: String,
        #[arg(long, default_value_t = 1.0)]
        weight: f64,
        /// List links among the given ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        list: Option<Vec<String>>,
    },
    /// Soft-delete a memory or chunk, or all chunks from a source
    Forget {
        /// Memory or chunk id
        id: Option<String>,
        /// Treat the id as a chunk id
        #[arg(long)]
        chunk: bool,
        /// Soft-delete every chunk ingested from this source
        #[arg(long, conflicts_with = "id")]
        source: Option<String>,
    },
    /// Hard-delete a memory and its dependents
    Purge {
        /// Memory id
        id: String,
    },
    /// Drain the embedding queue through the configured provider
    Drain {
        /// Sweep live items for stale embeddings first
        #[arg(long)]
        sweep: bool,
        /// Stop after this many batches (0 = until empty)
        #[arg(long, default_value_t = 0)]
        max_batches: usize,
    },
    /// Check store health; --fix repairs what it can
    Doctor {
        #[arg(long)]
        fix: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MEMPACK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error ({}): {err}", err.code());
        let hint = err.suggestion();
        if !hint.is_empty() {
            eprintln!("hint: {hint}");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> mempack::error::Result<()> {
    let config = resolve(&Overrides {
        data_dir: cli.data_dir.clone(),
        ..Overrides::default()
    })?;
    let ctx = AppContext::new(config);
    let cwd = std::env::current_dir()?;
    let format = cli.format;
    let workspace = cli.workspace.clone();

    match cli.command {
        Commands::Remember {
            title,
            summary,
            thread,
            tag,
            entity,
            anchor,
        } => remember::run(
            &ctx,
            &cwd,
            remember::RememberArgs {
                title,
                summary,
                workspace,
                thread,
                tags: tag,
                entities: entity,
                anchor,
            },
            format,
        ),
        Commands::Update {
            id,
            title,
            summary,
            thread,
            tags,
            add_tag,
            remove_tag,
            entities,
            add_entity,
            remove_entity,
            supersede_with,
        } => update::run(
            &ctx,
            &cwd,
            update::UpdateArgs {
                id,
                workspace,
                title,
                summary,
                thread,
                tags_set: tags,
                tags_add: add_tag,
                tags_remove: remove_tag,
                entities_set: entities,
                entities_add: add_entity,
                entities_remove: remove_entity,
                supersede_with,
            },
            format,
        ),
        Commands::Search {
            query,
            limit,
            chunks,
        } => search::run(
            &ctx,
            &cwd,
            search::SearchArgs {
                query,
                workspace,
                limit,
                chunks,
            },
            format,
        ),
        Commands::Context {
            query,
            limit,
            raw,
            rules,
            budget,
            timeout,
        } => context::run(
            &ctx,
            &cwd,
            context::ContextArgs {
                query,
                workspace,
                limit,
                include_raw: raw,
                rules,
                budget,
                timeout_secs: timeout,
            },
            format,
        ),
        Commands::Ingest {
            path,
            kind,
            thread,
            tag,
            replace,
        } => ingest::run(
            &ctx,
            &cwd,
            ingest::IngestArgs {
                path,
                workspace,
                kind,
                thread,
                tags: tag,
                replace,
            },
            format,
        ),
        Commands::State {
            set,
            reason,
            history,
            limit,
        } => {
            let action = if history {
                state::StateAction::History { limit }
            } else if let Some(state_json) = set {
                state::StateAction::Set { state_json, reason }
            } else {
                state::StateAction::Get
            };
            state::run(&ctx, &cwd, &workspace, action, format)
        }
        Commands::Link {
            from,
            to,
            rel,
            weight,
            list,
        } => {
            let action = if let Some(ids) = list {
                link::LinkAction::List { ids }
            } else {
                link::LinkAction::Add {
                    from: from.unwrap_or_default(),
                    rel,
                    to: to.unwrap_or_default(),
                    weight,
                }
            };
            link::run(&ctx, &cwd, &workspace, action, format)
        }
        Commands::Forget { id, chunk, source } => {
            let target = if let Some(source) = source {
                forget::ForgetTarget::Source { source }
            } else if chunk {
                forget::ForgetTarget::Chunk {
                    id: id.unwrap_or_default(),
                }
            } else {
                forget::ForgetTarget::Memory {
                    id: id.unwrap_or_default(),
                    purge: false,
                }
            };
            forget::run(&ctx, &cwd, &workspace, target, format)
        }
        Commands::Purge { id } => forget::run(
            &ctx,
            &cwd,
            &workspace,
            forget::ForgetTarget::Memory { id, purge: true },
            format,
        ),
        Commands::Drain { sweep, max_batches } => drain::run(
            &ctx,
            &cwd,
            drain::DrainArgs {
                workspace,
                sweep,
                max_batches,
            },
            format,
        ),
        Commands::Doctor { fix } => doctor::run(&ctx, &cwd, fix, format),
    }
}
