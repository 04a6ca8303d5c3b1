use std::collections::VecDeque;

use identity_resolution::crypto::{hash_email, is_hashed_email};
use identity_resolution::domain::{format_partition_date, EventRecord};
use identity_resolution::job::{execute_merge_job, parse_trigger_watermark, Backend};
use identity_resolution::telemetry::{init_telemetry, TelemetryConfig};
use identity_resolution::{EventSource, IdentityStore, ResolverConfig};

fn print_help() {
    eprintln!(
        "\
identity-admin

USAGE:
  identity-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  merge                           Run one identity merge pass
  load-events                     Load exported analytics events
  partitions                      List event partition dates
  cross-device                    List hashed emails seen on several devices
  identities                      Show identity records for one email
  hash-email <address>            Print the hashed form of an email address

COMMON OPTIONS:
  --database-url <url>            (defaults to env DATABASE_URL; sqlite: or postgres://)

merge OPTIONS:
  --since <YYYYMMDD>              (optional) Exclusive lower partition bound;
                                  derived from the identity table when omitted

load-events OPTIONS:
  --file <path>                   (required) JSON array or NDJSON of exported events

cross-device OPTIONS:
  --min-devices <n>               (default: 2)

identities OPTIONS:
  --email <hash|address>          (required) Plain addresses are hashed first

ENV:
  PROJECT_ID / DATASET_ID         (default: local / public)
  HASHED_EMAIL_PARAM, EPOCH_FLOOR, MAX_DB_CONNECTIONS, WRITE_MAX_RETRIES
  LOG_LEVEL / RUST_LOG, LOG_JSON
"
    );
}

fn load_config(database_url: Option<String>) -> anyhow::Result<ResolverConfig> {
    let config = ResolverConfig::from_lookup(|key| {
        let env = std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        match key {
            "DATABASE_URL" => database_url.clone().or(env),
            "PROJECT_ID" => env.or_else(|| Some("local".to_string())),
            "DATASET_ID" => env.or_else(|| Some("public".to_string())),
            _ => env,
        }
    })?;
    Ok(config)
}

async fn connect(database_url: Option<String>) -> anyhow::Result<(ResolverConfig, Backend)> {
    let config = load_config(database_url)?;
    let backend = Backend::connect(&config).await?;
    Ok((config, backend))
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

/// Parse a JSON array of events, falling back to one event per line
fn parse_events(content: &str) -> anyhow::Result<Vec<EventRecord>> {
    if content.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(content)?);
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| anyhow::anyhow!("line {}: {e}", n + 1))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    init_telemetry(&TelemetryConfig::from_env()).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (_, backend) = connect(database_url).await?;
            backend.migrate().await?;
            println!("migrations applied ({})", backend.kind().as_str());
        }

        "merge" => {
            let mut database_url: Option<String> = None;
            let mut since: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "--since" => since = Some(take_value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let since = parse_trigger_watermark(since.as_deref())?;
            let (config, backend) = connect(database_url).await?;
            if config.migrate_on_startup {
                backend.migrate().await?;
            }

            let outcome = execute_merge_job(&backend, &config, since).await?;
            eprintln!("{}", outcome.status());
            println!("{}", serde_json::to_string_pretty(&outcome.report)?);
        }

        "load-events" => {
            let mut database_url: Option<String> = None;
            let mut file: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "--file" => file = Some(take_value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let file = file.ok_or_else(|| anyhow::anyhow!("--file is required"))?;
            let content = tokio::fs::read_to_string(&file).await?;
            let events = parse_events(&content)?;

            let (config, backend) = connect(database_url).await?;
            if config.migrate_on_startup {
                backend.migrate().await?;
            }
            let loaded = backend.load_events(&events).await?;
            println!("loaded {loaded} events from {file}");
        }

        "partitions" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (_, backend) = connect(database_url).await?;
            for date in backend.event_source().partitions().await? {
                println!("events_{}", format_partition_date(date));
            }
        }

        "cross-device" => {
            let mut database_url: Option<String> = None;
            let mut min_devices: u64 = 2;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "--min-devices" => {
                        min_devices = take_value(&mut args, &arg)?
                            .parse()
                            .map_err(|e| anyhow::anyhow!("invalid --min-devices: {e}"))?;
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (_, backend) = connect(database_url).await?;
            let summary = backend
                .identity_store()
                .cross_device_summary(min_devices)
                .await?;
            for row in &summary {
                println!("{}\t{}", row.hashed_email, row.device_count);
            }
            eprintln!("{} emails with at least {min_devices} devices", summary.len());
        }

        "identities" => {
            let mut database_url: Option<String> = None;
            let mut email: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(take_value(&mut args, &arg)?),
                    "--email" => email = Some(take_value(&mut args, &arg)?),
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let email = email.ok_or_else(|| anyhow::anyhow!("--email is required"))?;
            let hashed = if is_hashed_email(&email) {
                email
            } else {
                hash_email(&email)
            };

            let (_, backend) = connect(database_url).await?;
            let store = backend.identity_store();
            let identities = store.identities_for_email(&hashed).await?;
            let alternates = store.alternates_for_emails(&[hashed.clone()]).await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "hashed_email": hashed,
                    "identities": identities,
                    "alternate_ids": alternates,
                }))?
            );
        }

        "hash-email" => {
            let address = args
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("hash-email requires an address"))?;
            println!("{}", hash_email(&address));
        }

        other => {
            print_help();
            anyhow::bail!("unknown command: {other}");
        }
    }

    Ok(())
}
