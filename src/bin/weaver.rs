//! Weaver CLI
//!
//! Inspect and maintain the thread store shared with the host: list and
//! repair threads, clear stuck checkpoints, edit settings, watch changes.
//! Every command prints one JSON document.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use weaver_lib::{
    init_logging, watch_store, FileStore, HostConfig, LifecycleManager, LocalArchive, Records, ThreadState,
    UserSettings,
};

#[derive(Parser)]
#[command(name = "weaver")]
#[command(about = "Weaver CLI - thread and checkpoint maintenance", long_about = None)]
struct Cli {
    /// Data directory (defaults to WEAVER_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Thread commands
    Thread {
        #[command(subcommand)]
        action: ThreadAction,
    },
    /// Pending checkpoint commands
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// User settings commands
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Print the active thread state whenever the store changes
    Watch,
}

#[derive(Subcommand)]
enum ThreadAction {
    /// List all threads
    List,
    /// Show a thread with its segments
    Show { thread_id: String },
    /// Delete a thread and all of its segments
    Delete {
        thread_id: String,
        /// Also remove archived briefs and artifacts
        #[arg(long)]
        purge: bool,
    },
    /// Read-repair every thread
    Repair,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List pending checkpoint records
    List,
    /// Drop the pending checkpoint record of a thread
    Clear { thread_id: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show current settings (API key masked)
    Show,
    /// Set one setting, e.g. `split-threshold 4` or `adaptive-char-threshold off`
    Set { key: String, value: String },
}

// ============ Output Types ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListItem {
    id: String,
    title: String,
    segments: u32,
    active: bool,
    project_url: Option<String>,
    updated: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingItem {
    thread_id: String,
    segment_id: String,
    stage: String,
    label: String,
    attempts: u32,
    last_error: Option<String>,
    updated: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsOutput {
    split_threshold: u32,
    default_prefix: String,
    local_root: String,
    api_key: Option<String>,
    first_run_complete: bool,
    adaptive_char_threshold: Option<usize>,
}

impl From<UserSettings> for SettingsOutput {
    fn from(s: UserSettings) -> Self {
        Self {
            split_threshold: s.split_threshold,
            default_prefix: s.default_prefix,
            local_root: s.local_root,
            api_key: s.api_key.as_deref().map(mask_key),
            first_run_complete: s.first_run_complete,
            adaptive_char_threshold: s.adaptive_char_threshold,
        }
    }
}

fn mask_key(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}

// ============ Main ============

struct Env {
    config: HostConfig,
    records: Records,
    lifecycle: LifecycleManager,
}

fn open(data_dir: Option<PathBuf>) -> anyhow::Result<Env> {
    let config = match data_dir {
        Some(dir) => HostConfig::load_from(&dir)?,
        None => HostConfig::load()?,
    };
    let store = FileStore::open(config.store_dir()?)?;
    let records = Records::new(Arc::new(store));
    let lifecycle = LifecycleManager::new(records.clone());
    Ok(Env {
        config,
        records,
        lifecycle,
    })
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = open(cli.data_dir).and_then(|env| match cli.command {
        Commands::Thread { action } => handle_thread(&env, action),
        Commands::Checkpoint { action } => handle_checkpoint(&env, action),
        Commands::Settings { action } => handle_settings(&env, action),
        Commands::Watch => handle_watch(&env),
    });

    match result {
        Ok(json) => println!("{}", json),
        Err(e) => {
            println!("{}", json!({ "error": e.to_string() }));
            std::process::exit(1);
        }
    }
}

// ============ Handlers ============

fn handle_thread(env: &Env, action: ThreadAction) -> anyhow::Result<String> {
    match action {
        ThreadAction::List => {
            let active = env.records.active_thread_id()?;
            let items: Vec<ThreadListItem> = env
                .lifecycle
                .threads()?
                .into_iter()
                .map(|t| ThreadListItem {
                    active: active.as_deref() == Some(t.id.as_str()),
                    id: t.id,
                    title: t.title,
                    segments: t.segment_count,
                    project_url: t.project_url,
                    updated: t.updated_at.to_rfc3339(),
                })
                .collect();
            Ok(serde_json::to_string(&items)?)
        }

        ThreadAction::Show { thread_id } => {
            let thread = env.lifecycle.load_thread(&thread_id)?;
            let segments = env.lifecycle.segments_for_thread(&thread.id)?;
            let state = ThreadState {
                thread: Some(thread),
                segments,
            };
            Ok(serde_json::to_string_pretty(&state)?)
        }

        ThreadAction::Delete { thread_id, purge } => {
            let thread = env.records.thread(&thread_id)?;
            let removed = env.lifecycle.delete_thread(&thread_id)?;
            let archive_removed = match (purge, thread) {
                (true, Some(thread)) => LocalArchive::new(env.config.data_dir()?).remove_thread(&thread)?,
                _ => false,
            };
            Ok(json!({
                "deleted": thread_id,
                "segmentsRemoved": removed,
                "archiveRemoved": archive_removed,
            })
            .to_string())
        }

        ThreadAction::Repair => {
            let report = env.lifecycle.repair_all()?;
            Ok(serde_json::to_string(&report)?)
        }
    }
}

fn handle_checkpoint(env: &Env, action: CheckpointAction) -> anyhow::Result<String> {
    match action {
        CheckpointAction::List => {
            let items: Vec<PendingItem> = env
                .records
                .all_progress()?
                .into_iter()
                .map(|p| PendingItem {
                    thread_id: p.thread_id,
                    segment_id: p.segment_id,
                    stage: p.stage.as_str().to_string(),
                    label: p.stage.label().to_string(),
                    attempts: p.attempts,
                    last_error: p.last_error.map(|f| format!("{}: {}", f.stage, f.message)),
                    updated: p.updated_at.to_rfc3339(),
                })
                .collect();
            Ok(serde_json::to_string(&items)?)
        }

        CheckpointAction::Clear { thread_id } => {
            let cleared = env.records.clear_progress(&thread_id)?;
            Ok(json!({ "threadId": thread_id, "cleared": cleared }).to_string())
        }
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(anyhow!("Expected a boolean, got {}", other)),
    }
}

fn apply_setting(settings: &mut UserSettings, key: &str, value: &str) -> anyhow::Result<()> {
    match key.replace('_', "-").as_str() {
        "split-threshold" => settings.split_threshold = value.parse()?,
        "default-prefix" => {
            if value.is_empty() {
                bail!("Prefix cannot be empty");
            }
            settings.default_prefix = value.to_string();
        }
        "local-root" => settings.local_root = value.to_string(),
        "api-key" => {
            settings.api_key = match value {
                "" | "none" => None,
                key => Some(key.to_string()),
            }
        }
        "first-run-complete" => settings.first_run_complete = parse_bool(value)?,
        "adaptive-char-threshold" => {
            settings.adaptive_char_threshold = match value {
                "off" | "none" => None,
                chars => Some(chars.parse()?),
            }
        }
        other => bail!("Unknown setting: {}", other),
    }
    Ok(())
}

fn handle_settings(env: &Env, action: SettingsAction) -> anyhow::Result<String> {
    match action {
        SettingsAction::Show => {
            let output = SettingsOutput::from(env.records.settings()?);
            Ok(serde_json::to_string(&output)?)
        }

        SettingsAction::Set { key, value } => {
            // Validate before touching the store
            let mut candidate = env.records.settings()?;
            apply_setting(&mut candidate, &key, &value)?;
            let updated = env.records.update_settings(|s| *s = candidate)?;
            Ok(serde_json::to_string(&SettingsOutput::from(updated))?)
        }
    }
}

fn handle_watch(env: &Env) -> anyhow::Result<String> {
    let dir = env.config.store_dir()?;
    let (tx, rx) = mpsc::channel();
    let _watcher = watch_store(&dir, env.config.debounce(), move |keys| {
        let _ = tx.send(keys);
    })?;

    println!("{}", serde_json::to_string(&env.lifecycle.thread_state()?)?);
    for keys in rx {
        tracing::debug!(?keys, "Store changed");
        match env.lifecycle.thread_state() {
            Ok(state) => println!("{}", serde_json::to_string(&state)?),
            Err(e) => println!("{}", json!({ "error": e.to_string() })),
        }
    }
    Ok(json!({ "watching": false }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_setting() {
        let mut settings = UserSettings::default();
        apply_setting(&mut settings, "split-threshold", "5").unwrap();
        apply_setting(&mut settings, "adaptive_char_threshold", "off").unwrap();
        apply_setting(&mut settings, "api-key", "sk-abcdef1234").unwrap();
        assert_eq!(settings.split_threshold, 5);
        assert_eq!(settings.adaptive_char_threshold, None);
        assert_eq!(settings.api_key.as_deref(), Some("sk-abcdef1234"));

        assert!(apply_setting(&mut settings, "split-threshold", "many").is_err());
        assert!(apply_setting(&mut settings, "colour", "blue").is_err());
        assert!(apply_setting(&mut settings, "default-prefix", "").is_err());
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-abcdef1234"), "****1234");
        assert_eq!(mask_key("ab"), "****ab");
    }
}
