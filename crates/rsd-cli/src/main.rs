use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use rsd_config::{ConfigMode, UnusedKeyPolicy};
use rsd_handover::ports::AccountDirectory;
use rsd_handover::{Account, AccountId, ResidenceId, Role};

mod commands;

use commands::Wiring;

#[derive(Parser)]
#[command(name = "rsd")]
#[command(about = "Residence syndic handover CLI", long_about = None)]
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

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> overlays)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Report config keys that nothing reads in the given mode
    ConfigCheck {
        /// OFFLINE | SERVICE
        #[arg(long, default_value = "OFFLINE")]
        mode: String,

        /// Fail instead of warn on unused keys
        #[arg(long, default_value_t = false)]
        strict: bool,

        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Account directory commands
    Account {
        #[command(subcommand)]
        cmd: AccountCmd,
    },

    /// Access code lifecycle
    Code {
        /// Layered config paths in merge order
        #[arg(long = "config", default_value = "config/base.yaml")]
        config_paths: Vec<String>,

        /// OFFLINE | SERVICE (SERVICE cancels billing subscriptions)
        #[arg(long, default_value = "OFFLINE")]
        mode: String,

        #[command(subcommand)]
        cmd: CodeCmd,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum AccountCmd {
    /// Insert an account row.
    Add {
        #[arg(long)]
        email: String,

        /// SYNDIC | RESIDENT
        #[arg(long, default_value = "RESIDENT")]
        role: String,

        #[arg(long)]
        residence: Option<i64>,
    },

    /// Print one account by email.
    Show {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum CodeCmd {
    /// Issue a code naming the next syndic of a residence.
    Issue {
        /// Email of the current syndic
        #[arg(long)]
        owner: String,

        /// Email of the replacement account
        #[arg(long)]
        to: String,

        #[arg(long)]
        residence: i64,

        /// CHANGE_ROLE | DELETE_ACCOUNT
        #[arg(long, default_value = "CHANGE_ROLE")]
        action: String,
    },

    /// Cancel a code that has not started transferring.
    Cancel {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        code: String,
    },

    /// List the codes an owner has issued.
    List {
        #[arg(long)]
        owner: String,
    },

    /// Read-only status of a code.
    Status {
        #[arg(long)]
        code: String,
    },

    /// Owner-confirmed completion of a claimed code.
    Finalize {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        code: String,
    },

    /// Delete expired, unused, cancellable codes.
    PurgeExpired,
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of a JSONL audit log.
    Verify {
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience).
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = rsd_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = rsd_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_access_codes_table={}",
                        s.ok, s.has_access_codes_table
                    );
                }
                DbCmd::Migrate => {
                    rsd_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let loaded = commands::load_config(&paths)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::ConfigCheck {
            mode,
            strict,
            paths,
        } => {
            let mode = ConfigMode::parse(&mode)?;
            let loaded = commands::load_config(&paths)?;
            let policy = if strict {
                UnusedKeyPolicy::Fail
            } else {
                UnusedKeyPolicy::Warn
            };
            let report = rsd_config::report_unused_keys(mode, &loaded.config_json, policy)?;
            print_settings(&loaded.config_json)?;
            println!("mode={} unused_keys={}", report.mode, report.unused_leaf_pointers.len());
            for p in &report.unused_leaf_pointers {
                println!("unused={}", p);
            }
        }

        Commands::Account { cmd } => {
            let pool = rsd_db::connect_from_env().await?;
            match cmd {
                AccountCmd::Add {
                    email,
                    role,
                    residence,
                } => {
                    let role = Role::parse(role.trim().to_ascii_uppercase().as_str())?;
                    if role == Role::Syndic && residence.is_none() {
                        bail!("a SYNDIC account needs --residence");
                    }
                    let account = Account {
                        id: AccountId::new_v4(),
                        email: email.trim().to_string(),
                        role,
                        residence_id: residence.map(ResidenceId),
                    };
                    rsd_db::insert_account(&pool, &account).await?;
                    println!("account_id={} email={}", account.id, account.email);
                }
                AccountCmd::Show { email } => {
                    let store = rsd_db::PgHandoverStore::new(pool);
                    match store.find_by_email(&email).await? {
                        Some(a) => println!(
                            "account_id={} email={} role={} residence={}",
                            a.id,
                            a.email,
                            a.role.as_str(),
                            a.residence_id.map(|r| r.to_string()).unwrap_or_default()
                        ),
                        None => bail!("no account with email {}", email.trim()),
                    }
                }
            }
        }

        Commands::Code {
            config_paths,
            mode,
            cmd,
        } => {
            let mode = ConfigMode::parse(&mode)?;
            let w = Wiring::from_config(&config_paths, mode).await?;
            match cmd {
                CodeCmd::Issue {
                    owner,
                    to,
                    residence,
                    action,
                } => commands::code::issue(&w, &owner, &to, residence, &action).await?,
                CodeCmd::Cancel { owner, code } => commands::code::cancel(&w, &owner, &code).await?,
                CodeCmd::List { owner } => commands::code::list(&w, &owner).await?,
                CodeCmd::Status { code } => commands::code::status(&w, &code).await?,
                CodeCmd::Finalize { owner, code } => {
                    commands::code::finalize(&w, &owner, &code).await?
                }
                CodeCmd::PurgeExpired => commands::code::purge_expired(&w).await?,
            }
        }

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => match rsd_audit::verify_hash_chain(&path)? {
                rsd_audit::VerifyResult::Valid { lines } => {
                    println!("audit_valid=true lines={}", lines);
                }
                rsd_audit::VerifyResult::Broken { line, reason } => {
                    println!("audit_valid=false line={} reason={}", line, reason);
                    bail!("audit chain broken at line {}", line);
                }
            },
        },
    }

    Ok(())
}

/// The `handover` section must also parse into valid settings.
fn print_settings(config: &serde_json::Value) -> Result<()> {
    let s = rsd_config::handover_settings(config)?;
    println!(
        "code_ttl_secs={} code_length={} external_call_timeout_ms={} transfer_lease_secs={}",
        s.code_ttl.as_secs(),
        s.code_length,
        s.external_call_timeout.as_millis(),
        s.transfer_lease.as_secs()
    );
    Ok(())
}

fn init_tracing() {
    // stderr, so stdout stays `key=value` for scripts.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
