//! schoolcache - resolve and inspect school entities from the command line.
//!
//! Entities are resolved by provider alias through the offline-first core:
//! known aliases are served from local storage, unknown ones are downloaded
//! with the credentials stored for their school.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use schoolcache_core::auth::{CredentialSource, CredentialStore, SchoolCredentials};
use schoolcache_core::models::{credential_scope, RemoteEntity};
use schoolcache_core::services::HttpEntityAdapter;
use schoolcache_core::{Alias, AliasResolver, AliasState, Config, ProviderId, RefreshPolicy, Services};

const USAGE: &str = "\
Usage: schoolcache [--log-file <path>] <command>

Commands:
  resolve <school|group|subject> <provider> <value> [--version <n>] [--policy <policy>]
  credentials set <school-number> <username>
  credentials delete <school-number>
  clear-cache

Policies: cache-first (default), cache-then-network, network-first, network-only, cache-only
Providers: sp24, vpp, schulverwalter";

/// Alias version used when `--version` is not given
const DEFAULT_ALIAS_VERSION: i32 = 1;

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr unless a log file is given, in which case they go to a
/// daily rolling file. The returned guard must live until exit so buffered
/// lines are flushed.
fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "schoolcache.log".to_string());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };
    let stderr_layer = file_layer.is_none().then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let log_file = take_option(&mut args, "--log-file")?.map(PathBuf::from);
    let guard = init_tracing(log_file.as_deref());
    info!("schoolcache starting");

    let result = run(args).await;
    info!("schoolcache shutting down");
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(mut args: Vec<String>) -> Result<()> {
    let mut config = Config::load()?;

    match args.first().map(String::as_str) {
        Some("resolve") => {
            let version = take_option(&mut args, "--version")?
                .map(|v| v.parse::<i32>().context("Invalid --version"))
                .transpose()?
                .unwrap_or(DEFAULT_ALIAS_VERSION);
            let policy = take_option(&mut args, "--policy")?
                .map(|p| p.parse::<RefreshPolicy>())
                .transpose()?
                .unwrap_or_default();
            let [_, kind, provider, value] = args.as_slice() else {
                bail!("{}", USAGE);
            };
            let alias = Alias::new(provider.parse::<ProviderId>()?, value.as_str(), version);

            if !matches!(
                kind.as_str(),
                "school" | "schools" | "group" | "groups" | "subject" | "subject-instance" | "subject-instances"
            ) {
                bail!("Unknown entity kind: {}\n\n{}", kind, USAGE);
            }

            let store = CredentialStore::new();
            if let Some(hint) = missing_credentials_hint(&alias, policy, |scope| store.has_credentials(scope)) {
                eprintln!("{}", hint);
            }

            let credentials: Arc<dyn CredentialSource> = Arc::new(store);
            let services = Services::open(&config, credentials).await?;
            let result = match kind.as_str() {
                "school" | "schools" => resolve_and_print(&services.schools, alias, policy).await,
                "group" | "groups" => resolve_and_print(&services.groups, alias, policy).await,
                _ => resolve_and_print(&services.subject_instances, alias, policy).await,
            };
            // Downloads and refreshes still running are persisted before exit
            services.shutdown().await;
            result
        }
        Some("credentials") => match args.get(1).map(String::as_str) {
            Some("set") => {
                let (Some(school), Some(username)) = (args.get(2), args.get(3)) else {
                    bail!("{}", USAGE);
                };
                let password = rpassword::prompt_password(format!("Password for {}@{}: ", username, school))
                    .context("Failed to read password")?;
                CredentialStore::new().store(
                    school,
                    &SchoolCredentials {
                        username: username.clone(),
                        password,
                    },
                )?;
                config.last_username = Some(username.clone());
                config.save()?;
                println!("Stored credentials for school {}", school);
                Ok(())
            }
            Some("delete") => {
                let Some(school) = args.get(2) else {
                    bail!("{}", USAGE);
                };
                CredentialStore::new().delete(school)?;
                println!("Deleted credentials for school {}", school);
                Ok(())
            }
            _ => bail!("{}", USAGE),
        },
        Some("clear-cache") => {
            let credentials: Arc<dyn CredentialSource> = Arc::new(CredentialStore::new());
            let services = Services::open(&config, credentials).await?;
            services.clear_cache().await?;
            services.shutdown().await;
            println!("Cache cleared");
            Ok(())
        }
        _ => bail!("{}", USAGE),
    }
}

/// Remove `--name <value>` from `args`, returning the value.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(index) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        bail!("Missing value for {}", name);
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

/// Warning printed before a resolution that may go to the network without
/// credentials for the alias's school.
fn missing_credentials_hint(
    alias: &Alias,
    policy: RefreshPolicy,
    has_credentials: impl Fn(&str) -> bool,
) -> Option<String> {
    let scope = credential_scope(alias);
    if !policy.uses_network() || has_credentials(scope) {
        return None;
    }
    Some(format!(
        "No credentials stored for school {}; downloads will fail.\nStore them with: schoolcache credentials set {} <username>",
        scope, scope
    ))
}

async fn resolve_and_print<T: RemoteEntity>(
    resolver: &AliasResolver<HttpEntityAdapter<T>, T>,
    alias: Alias,
    policy: RefreshPolicy,
) -> Result<()> {
    let mut states = resolver.resolve_with(alias.clone(), policy);

    while let Some(state) = states.next().await {
        match state {
            AliasState::Loading => eprintln!("Resolving {}...", alias),
            AliasState::Done(entity) => {
                let age = entity
                    .local_id()
                    .and_then(|id| resolver.source().cache().peek(&id))
                    .map(|entry| entry.age_display())
                    .unwrap_or_else(|| "unknown".to_string());
                eprintln!("{} {}: {} (cached {})", T::KIND, alias, entity.display_name(), age);
                println!("{}", serde_json::to_string_pretty(&entity)?);
                return Ok(());
            }
            AliasState::NotExisting => {
                println!("No {} exists under {}", T::KIND, alias);
                return Ok(());
            }
            AliasState::Error(e) => {
                if e.needs_authentication() {
                    bail!(
                        "{}\nStore credentials with: schoolcache credentials set <school-number> <username>",
                        e
                    );
                }
                return Err(e.into());
            }
        }
    }
    bail!("Resolution of {} ended without a result", alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_option() {
        let mut args: Vec<String> = ["resolve", "--policy", "cache-only", "school", "sp24", "12345"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            take_option(&mut args, "--policy").expect("take"),
            Some("cache-only".to_string())
        );
        assert_eq!(args, ["resolve", "school", "sp24", "12345"]);
        assert_eq!(take_option(&mut args, "--version").expect("take"), None);

        args.push("--version".to_string());
        assert!(take_option(&mut args, "--version").is_err());
    }

    #[test]
    fn test_missing_credentials_hint() {
        let alias = Alias::new(ProviderId::Sp24, "12345/9c", 1);

        let hint = missing_credentials_hint(&alias, RefreshPolicy::CacheFirst, |_| false)
            .expect("hint without credentials");
        assert!(hint.contains("credentials set 12345"));

        assert!(missing_credentials_hint(&alias, RefreshPolicy::CacheFirst, |scope| scope == "12345").is_none());
        assert!(missing_credentials_hint(&alias, RefreshPolicy::CacheOnly, |_| false).is_none());
    }
}
