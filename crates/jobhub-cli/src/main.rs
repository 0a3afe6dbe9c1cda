//! jobhub CLI - command line interface for the jobhub server.

mod client;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use jobhub_core::{Job, Workflow};

use client::{ClientError, HttpClient};

/// jobhub CLI - hub management tool
#[derive(Parser)]
#[command(name = "jobhub")]
#[command(about = "CLI for the jobhub server", long_about = None)]
struct Cli {
    /// Hub HTTP address
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check hub health
    Health,

    /// Submit a job
    #[command(name = "submit-job")]
    SubmitJob {
        /// Requirement document (JSON)
        #[arg(short, long, default_value = "{}")]
        requirements: String,

        /// Job payload (JSON)
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Workflow to add the job to
        #[arg(short, long)]
        workflow: Option<String>,

        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        customer: Option<String>,
    },

    /// Get a job
    #[command(name = "get-job")]
    GetJob { id: String },

    /// Show a job's queue position
    Position { id: String },

    /// Cancel a job
    #[command(name = "cancel-job")]
    CancelJob { id: String },

    /// Return an assigned job to the queue
    #[command(name = "release-job")]
    ReleaseJob { id: String },

    /// Claim the best job for a capability document
    #[command(name = "next-job")]
    NextJob {
        /// Worker capability document (JSON)
        capabilities: String,

        /// Queue entries to scan
        #[arg(long)]
        max_scan: Option<usize>,
    },

    /// Show queue depth and the head of the queue
    Queue {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List registered workers
    #[command(name = "list-workers")]
    ListWorkers,

    /// Create a workflow
    #[command(name = "create-workflow")]
    CreateWorkflow {
        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        customer: Option<String>,
    },

    /// Get a workflow and its job counts
    #[command(name = "get-workflow")]
    GetWorkflow { id: String },

    /// Move a workflow to completed, failed or cancelled
    #[command(name = "set-workflow-status")]
    SetWorkflowStatus { id: String, status: String },

    /// Show routing and message statistics
    #[command(name = "routing-stats")]
    RoutingStats,

    /// List dead letters
    #[command(name = "dead-letters")]
    DeadLetters,

    /// Reprocess a dead letter
    Reprocess { id: String },

    /// Remove every dead letter
    #[command(name = "clear-dead-letters")]
    ClearDeadLetters,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let client = HttpClient::new(&cli.addr);
    let raw = cli.json;

    match cli.command {
        Commands::Health => {
            let healthy = client.health().await?;
            println!("{}", if healthy { "ok" } else { "unhealthy" });
        }
        Commands::SubmitJob {
            requirements,
            payload,
            workflow,
            priority,
            customer,
        } => {
            let body = json!({
                "requirements": parse_json("requirements", &requirements)?,
                "payload": parse_json("payload", &payload)?,
                "workflow_id": workflow,
                "priority": priority,
                "customer_id": customer,
            });
            let job: Value = client.post_json("/v1/jobs", &body).await?;
            show_job(&job, raw, "Job submitted:")?;
        }
        Commands::GetJob { id } => {
            let job: Value = client.get_json(&format!("/v1/jobs/{id}")).await?;
            show_job(&job, raw, "")?;
        }
        Commands::Position { id } => {
            let position: Value = client.get_json(&format!("/v1/jobs/{id}/position")).await?;
            if raw {
                print_json(&position)?;
            } else {
                match position["position"].as_u64() {
                    Some(p) => println!("{id}: position {p}"),
                    None => println!("{id}: not queued"),
                }
            }
        }
        Commands::CancelJob { id } => {
            let job: Value = client.post_empty(&format!("/v1/jobs/{id}/cancel")).await?;
            show_job(&job, raw, "Job cancelled:")?;
        }
        Commands::ReleaseJob { id } => {
            let job: Value = client.post_empty(&format!("/v1/jobs/{id}/release")).await?;
            show_job(&job, raw, "Job released:")?;
        }
        Commands::NextJob {
            capabilities,
            max_scan,
        } => {
            let body = json!({
                "capabilities": parse_json("capabilities", &capabilities)?,
                "max_scan": max_scan,
            });
            let matched: Value = client.post_json("/v1/workers/next", &body).await?;
            if raw {
                print_json(&matched)?;
            } else if matched["job"].is_null() {
                println!("No matching job");
            } else {
                show_job(&matched["job"], false, "Job claimed:")?;
            }
        }
        Commands::Queue { limit } => {
            let queue: Value = client.get_json(&format!("/v1/queue?limit={limit}")).await?;
            if raw {
                print_json(&queue)?;
            } else {
                print_queue(&queue)?;
            }
        }
        Commands::ListWorkers => {
            let workers: Value = client.get_json("/v1/workers").await?;
            if raw {
                print_json(&workers)?;
            } else {
                print_workers(&workers);
            }
        }
        Commands::CreateWorkflow { priority, customer } => {
            let body = json!({"priority": priority, "customer_id": customer});
            let workflow: Value = client.post_json("/v1/workflows", &body).await?;
            show_workflow(&workflow, raw, "Workflow created:")?;
        }
        Commands::GetWorkflow { id } => {
            let metadata: Value = client.get_json(&format!("/v1/workflows/{id}")).await?;
            show_workflow(&metadata, raw, "")?;
            if !raw {
                println!("  Jobs:        {}", metadata["job_count"]);
                if let Some(counts) = metadata["jobs_by_status"].as_object() {
                    for (status, count) in counts {
                        println!("    {status:<12} {count}");
                    }
                }
            }
        }
        Commands::SetWorkflowStatus { id, status } => {
            let workflow: Value = client
                .put_json(&format!("/v1/workflows/{id}/status"), &json!({"status": status}))
                .await?;
            show_workflow(&workflow, raw, "Workflow updated:")?;
        }
        Commands::RoutingStats => {
            let stats: Value = client.get_json("/v1/routing/stats").await?;
            print_json(&stats)?;
        }
        Commands::DeadLetters => {
            let letters: Value = client.get_json("/v1/dead-letters").await?;
            if raw {
                print_json(&letters)?;
            } else {
                print_dead_letters(&letters);
            }
        }
        Commands::Reprocess { id } => {
            let outcome: Value = client
                .post_empty(&format!("/v1/dead-letters/{id}/reprocess"))
                .await?;
            if raw {
                print_json(&outcome)?;
            } else if outcome["delivered"].as_bool() == Some(true) {
                println!("Dead letter {id} delivered");
            } else {
                println!("Dead letter {id} failed again and was kept");
            }
        }
        Commands::ClearDeadLetters => {
            let cleared: Value = client.delete_json("/v1/dead-letters").await?;
            println!("Cleared {} dead letters", cleared["cleared"]);
        }
    }

    Ok(())
}

fn parse_json(name: &str, text: &str) -> Result<Value, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::InvalidInput(format!("{name}: {e}")))
}

fn print_json(value: &Value) -> Result<(), ClientError> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| ClientError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn show_job(value: &Value, raw: bool, heading: &str) -> Result<(), ClientError> {
    if raw {
        return print_json(value);
    }
    let job: Job = serde_json::from_value(value.clone())
        .map_err(|e| ClientError::Serialization(e.to_string()))?;
    if !heading.is_empty() {
        println!("{heading}");
    }
    print_job(&job);
    Ok(())
}

fn print_job(job: &Job) {
    println!("  ID:          {}", job.id);
    println!("  Workflow:    {}", job.workflow_id);
    println!("  Status:      {}", job.status);
    println!("  Priority:    {}", job.priority);
    if let Some(worker) = &job.worker_id {
        println!("  Worker:      {worker}");
    }
    if let Some(customer) = &job.customer_id {
        println!("  Customer:    {customer}");
    }
    println!("  Retries:     {}/{}", job.retry_count, job.max_retries);
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(at) = job.completed_at {
        println!("  Completed:   {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &job.error_message {
        println!("  Error:       {error}");
    }
}

fn show_workflow(value: &Value, raw: bool, heading: &str) -> Result<(), ClientError> {
    if raw {
        return print_json(value);
    }
    let workflow: Workflow = serde_json::from_value(value.clone())
        .map_err(|e| ClientError::Serialization(e.to_string()))?;
    if !heading.is_empty() {
        println!("{heading}");
    }
    println!("  ID:          {}", workflow.id);
    println!("  Status:      {}", workflow.status);
    println!("  Priority:    {}", workflow.priority);
    if let Some(customer) = &workflow.customer_id {
        println!("  Customer:    {customer}");
    }
    println!("  Updated:     {}", workflow.updated_at.format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

fn print_queue(queue: &Value) -> Result<(), ClientError> {
    println!("Queue depth: {}", queue["depth"]);
    let pending: Vec<Job> = serde_json::from_value(queue["pending"].clone())
        .map_err(|e| ClientError::Serialization(e.to_string()))?;
    if pending.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<4}  {:<36}  {:<8}  {}", "POS", "ID", "PRIORITY", "CREATED");
    println!("{}", "-".repeat(72));
    for (index, job) in pending.iter().enumerate() {
        println!(
            "{:<4}  {:<36}  {:<8}  {}",
            index + 1,
            job.id,
            job.priority,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_workers(response: &Value) {
    let empty = Vec::new();
    let workers = response["workers"].as_array().unwrap_or(&empty);
    println!("Workers ({}):", workers.len());
    println!("{:<24}  {:<10}  {:<36}  {}", "ID", "STATUS", "CURRENT JOB", "SERVICES");
    println!("{}", "-".repeat(90));
    for worker in workers {
        let services = worker["capabilities"]["services"]
            .as_array()
            .map(|s| {
                s.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        println!(
            "{:<24}  {:<10}  {:<36}  {}",
            worker["worker_id"].as_str().unwrap_or("-"),
            worker["status"].as_str().unwrap_or("-"),
            worker["current_job_id"].as_str().unwrap_or("-"),
            services
        );
    }
}

fn print_dead_letters(letters: &Value) {
    let empty = Vec::new();
    let letters = letters.as_array().unwrap_or(&empty);
    println!("Dead letters ({}):", letters.len());
    for letter in letters {
        println!(
            "  {}  {:<20}  attempts={}  {}",
            letter["id"].as_str().unwrap_or("-"),
            letter["message"]["type"].as_str().unwrap_or("-"),
            letter["attempts"],
            letter["error"].as_str().unwrap_or("")
        );
    }
}
