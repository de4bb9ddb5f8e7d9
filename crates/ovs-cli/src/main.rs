//! Operator CLI for the Overseer execution core.
//!
//! Covers the day-two chores that should not require the HTTP surface:
//! migrations (guarded against live executions), catalog seeding, credential
//! management, and DLQ triage.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use ovs_catalog::CatalogService;
use ovs_queue::DlqHandler;
use ovs_schemas::ToolSpec;
use ovs_secrets::SecretsBroker;

#[derive(Parser)]
#[command(name = "ovs")]
#[command(about = "Overseer operations CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Tool catalog commands
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCmd,
    },

    /// Credential broker commands
    Credential {
        #[command(subcommand)]
        cmd: CredentialCmd,
    },

    /// Dead-letter queue commands
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply migrations. Refuses while executions are QUEUED or RUNNING
    /// unless --force is given.
    Migrate {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// Load tool specs from a JSON file (single spec or array of specs).
    Load {
        path: String,
    },
    List,
    /// Point a tool's latest marker at an earlier version.
    Rollback {
        tool: String,
        version: i32,
    },
}

#[derive(Subcommand)]
enum CredentialCmd {
    /// Store or replace a credential. The password is read from the
    /// OVS_CREDENTIAL_PASSWORD env var, never from argv.
    Upsert {
        #[arg(long)]
        host: String,
        #[arg(long)]
        purpose: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        domain: Option<String>,
    },
    Delete {
        #[arg(long)]
        host: String,
        #[arg(long)]
        purpose: String,
    },
}

#[derive(Subcommand)]
enum DlqCmd {
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Stats,
    Requeue {
        item_id: Uuid,
        /// Restart the retry budget instead of granting a single attempt.
        #[arg(long)]
        reset_attempt: bool,
    },
    /// Archive items dead for longer than the retention window.
    Archive {
        #[arg(long, default_value_t = 30)]
        retention_days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ovs_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ovs_db::status(&pool).await?;
                    println!("db_ok={} has_executions_table={}", s.ok, s.has_executions_table);
                }
                DbCmd::Migrate { force } => {
                    let live = ovs_db::count_live_executions(&pool).await?;
                    if live > 0 && !force {
                        bail!(
                            "refusing to migrate: {live} executions are QUEUED or RUNNING \
                             (use --force to override)"
                        );
                    }
                    ovs_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Catalog { cmd } => {
            let pool = ovs_db::connect_from_env().await?;
            let catalog = CatalogService::new(pool, 64, Duration::from_secs(60));
            match cmd {
                CatalogCmd::Load { path } => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("read tool specs: {path}"))?;
                    let specs: Vec<ToolSpec> = match serde_json::from_str::<ToolSpec>(&raw) {
                        Ok(single) => vec![single],
                        Err(_) => serde_json::from_str(&raw)
                            .with_context(|| format!("parse tool specs: {path}"))?,
                    };
                    for spec in &specs {
                        let version = catalog.put_tool(spec).await?;
                        println!("stored {}@{}", spec.tool_name, version);
                    }
                }
                CatalogCmd::List => {
                    for tool in catalog.list_tools().await? {
                        println!(
                            "{}@{} category={} enabled={}",
                            tool.tool_name, tool.version, tool.category, tool.enabled
                        );
                    }
                }
                CatalogCmd::Rollback { tool, version } => {
                    catalog.rollback(&tool, version).await?;
                    println!("latest_now={tool}@{version}");
                }
            }
        }

        Commands::Credential { cmd } => {
            let pool = ovs_db::connect_from_env().await?;
            let keys = ovs_config::ResolvedKeys::from_env()?;
            let broker = SecretsBroker::new(pool, keys.kms_master_key, keys.internal_key);
            let actor = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());

            match cmd {
                CredentialCmd::Upsert {
                    host,
                    purpose,
                    username,
                    domain,
                } => {
                    let password = match std::env::var("OVS_CREDENTIAL_PASSWORD") {
                        Ok(v) if !v.is_empty() => v,
                        _ => bail!("set OVS_CREDENTIAL_PASSWORD (passwords are not read from argv)"),
                    };
                    broker
                        .upsert(&actor, &host, &purpose, &username, &password, domain)
                        .await?;
                    println!("stored {host}/{purpose}");
                }
                CredentialCmd::Delete { host, purpose } => {
                    broker.delete(&actor, &host, &purpose).await?;
                    println!("deleted {host}/{purpose}");
                }
            }
        }

        Commands::Dlq { cmd } => {
            let pool = ovs_db::connect_from_env().await?;
            let dlq = DlqHandler::new(pool);
            match cmd {
                DlqCmd::List { limit, offset } => {
                    for item in dlq.list(limit, offset).await? {
                        println!(
                            "{} execution={} attempts={}/{} dead_at={} reason={}",
                            item.item_id,
                            item.execution_id,
                            item.attempt,
                            item.max_attempts,
                            item.dead_at,
                            item.failure_reason
                        );
                    }
                }
                DlqCmd::Stats => {
                    let stats = dlq.stats().await?;
                    println!("total={}", stats.total);
                    for r in stats.by_reason {
                        println!("{}={}", r.reason, r.count);
                    }
                }
                DlqCmd::Requeue {
                    item_id,
                    reset_attempt,
                } => {
                    dlq.requeue(item_id, reset_attempt).await?;
                    println!("requeued={item_id} reset_attempt={reset_attempt}");
                }
                DlqCmd::Archive { retention_days } => {
                    let n = dlq.archive_with_retention(retention_days).await?;
                    println!("archived={n}");
                }
            }
        }
    }

    Ok(())
}
