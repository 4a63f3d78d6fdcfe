//! conveyor CLI — operator interface to the work queue.

use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use conveyor::client::Client;
use conveyor::config::Config;
use conveyor::model::{Create, Filter, Pagination, Repeat, State, Work, WorkId};
use conveyor::store::PostgresStore;
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "conveyor", about = "Persisted work queue and job coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit a new work item
    Submit {
        /// Work type (reverse-domain, determines processor routing)
        work_type: String,
        /// Lease duration in seconds once claimed
        #[arg(long, default_value_t = 60)]
        timeout: i64,
        /// Batch-deletion grouping key
        #[arg(long)]
        group_id: Option<String>,
        /// Idempotency key
        #[arg(long)]
        deduplication_id: Option<String>,
        /// Mutual-exclusion key
        #[arg(long)]
        serial_id: Option<String>,
        /// Priority (higher = claimed first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// JSON metadata object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List work items
    List {
        /// Filter by work type (repeatable)
        #[arg(long, name = "type")]
        work_type: Vec<String>,
        /// Filter by group id
        #[arg(long)]
        group_id: Option<String>,
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Page size
        #[arg(long, default_value_t = 100)]
        size: usize,
        /// Page number
        #[arg(long, default_value_t = 0)]
        page: usize,
    },
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
    },
    /// Re-arm a terminal (failed/success) work item back to pending
    Repeat {
        /// Work item ID
        id: String,
        /// New priority
        #[arg(long)]
        priority: Option<i32>,
        /// New lease duration in seconds
        #[arg(long)]
        timeout: Option<i64>,
    },
    /// Delete a work item (idempotent)
    Delete {
        /// Work item ID
        id: String,
    },
    /// Delete every work item in a group
    DeleteGroup {
        /// Group id
        group_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let store = PostgresStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    let client = Client::new(Arc::new(store));

    match cli.command {
        Command::Work { action } => match action {
            WorkAction::Submit {
                work_type,
                timeout,
                group_id,
                deduplication_id,
                serial_id,
                priority,
                metadata,
            } => {
                cmd_work_submit(
                    &client,
                    work_type,
                    timeout,
                    group_id,
                    deduplication_id,
                    serial_id,
                    priority,
                    metadata,
                )
                .await
            }
            WorkAction::List {
                work_type,
                group_id,
                state,
                size,
                page,
            } => cmd_work_list(&client, work_type, group_id, state, size, page).await,
            WorkAction::Show { id } => cmd_work_show(&client, &id).await,
            WorkAction::Repeat {
                id,
                priority,
                timeout,
            } => cmd_work_repeat(&client, &id, priority, timeout).await,
            WorkAction::Delete { id } => {
                client.delete(&WorkId::parse(&id)?).await?;
                println!("Deleted: {id}");
                Ok(())
            }
            WorkAction::DeleteGroup { group_id } => {
                let removed = client.delete_all_by_group_id(&group_id).await?;
                println!("Deleted {removed} item(s) in group {group_id}");
                Ok(())
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_work_submit(
    client: &Client,
    work_type: String,
    timeout: i64,
    group_id: Option<String>,
    deduplication_id: Option<String>,
    serial_id: Option<String>,
    priority: i32,
    metadata: Option<String>,
) -> anyhow::Result<()> {
    let mut create = Create::new(&work_type, timeout).priority(priority);

    if let Some(ref group_id) = group_id {
        create = create.group_id(group_id);
    }
    if let Some(ref deduplication_id) = deduplication_id {
        create = create.deduplication_id(deduplication_id);
    }
    if let Some(ref serial_id) = serial_id {
        create = create.serial_id(serial_id);
    }
    if let Some(ref json) = metadata {
        create = create.metadata(serde_json::from_str(json)?);
    }

    let work = client.create(&create).await?;
    println!("Created: {} (state: {})", work.id, work.state);
    Ok(())
}

async fn cmd_work_list(
    client: &Client,
    work_type: Vec<String>,
    group_id: Option<String>,
    state: Option<String>,
    size: usize,
    page: usize,
) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(State::from_str(&s).map_err(|_| anyhow::anyhow!("invalid state: {s}"))?),
        None => None,
    };

    let filter = Filter {
        types: if work_type.is_empty() {
            None
        } else {
            Some(work_type)
        },
        group_id,
    };
    let items = client
        .store()
        .list(&filter, &Pagination { page, size })
        .await?;
    let items: Vec<&Work> = items
        .iter()
        .filter(|w| state_filter.is_none_or(|s| s == w.state))
        .collect();

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<24}  {:<40}  {:<10}  {:<4}  CREATED",
        "ID", "TYPE", "STATE", "PRI"
    );
    println!("{}", "-".repeat(100));

    for item in &items {
        let type_display = if item.work_type.len() > 40 {
            &item.work_type[..40]
        } else {
            &item.work_type
        };
        println!(
            "{:<24}  {:<40}  {:<10}  {:<4}  {}",
            item.id,
            type_display,
            item.state,
            item.processing_priority,
            item.created_time.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_work_show(client: &Client, id_str: &str) -> anyhow::Result<()> {
    let id = WorkId::parse(id_str)?;
    let Some(item) = client.get(&id).await? else {
        anyhow::bail!("no work item with id {id_str}");
    };

    println!("ID:          {}", item.id);
    println!("Type:        {}", item.work_type);
    println!("State:       {}", item.state);
    println!("Priority:    {}", item.processing_priority);
    println!("Timeout:     {}s", item.processing_timeout);
    println!("Available:   {}", item.processing_available_time);
    println!("Group:       {}", item.group_id.as_deref().unwrap_or("-"));
    println!(
        "Dedup Key:   {}",
        item.deduplication_id.as_deref().unwrap_or("-")
    );
    println!("Serial Key:  {}", item.serial_id.as_deref().unwrap_or("-"));
    if let Some(ref metadata) = item.metadata {
        println!("Metadata:    {}", serde_json::to_string_pretty(metadata)?);
    }
    println!("Created:     {}", item.created_time);
    println!("Modified:    {}", item.modified_time);
    println!("Revision:    {}", item.revision);
    if let Some(pending) = item.pending_time {
        println!("Pending:     {pending}");
    }
    if let Some(processing) = item.processing_time {
        println!("Processing:  {processing}");
    }
    if let Some(expiry) = item.processing_timeout_time {
        println!("Lease Until: {expiry}");
    }
    if let Some(duration) = item.processing_duration {
        println!("Duration:    {duration:.3}s");
    }
    if let Some(ref error) = item.failing_error {
        println!("---");
        println!("Failing:     {error}");
        if let Some(count) = item.failing_retry_count {
            println!("Retries:     {count}");
        }
        if let Some(retry) = item.failing_retry_time {
            println!("Next Retry:  {retry}");
        }
    }
    if let Some(ref error) = item.failed_error {
        println!("---");
        println!("Failed:      {error}");
    }
    if let Some(success) = item.success_time {
        println!("Succeeded:   {success}");
    }

    Ok(())
}

async fn cmd_work_repeat(
    client: &Client,
    id_str: &str,
    priority: Option<i32>,
    timeout: Option<i64>,
) -> anyhow::Result<()> {
    let id = WorkId::parse(id_str)?;
    let repeat = Repeat {
        processing_available_time: None,
        processing_priority: priority,
        processing_timeout: timeout,
    };
    let work = client.repeat(&id, &repeat).await?;
    println!("Repeated: {} (state: {})", work.id, work.state);
    Ok(())
}
