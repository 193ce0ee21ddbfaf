use clap::{Parser, Subcommand};
use deltastore_common::{EntityKey, SchemaDef};
use deltastore_engine::{DiffStatus, Engine};
use deltastore_log::Change;
use deltastore_persist::DurableStore;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deltastore-cli", about = "CLI tool for deltastore operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print engine version and crate info
    Info,
    /// Run a scripted branch/diff/merge demo
    Demo {
        /// Number of entities to seed
        #[arg(short, long, default_value = "3")]
        entities: usize,
    },
    /// Verify the integrity of a file-backed store
    Verify {
        /// Path to the store directory
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("deltastore-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common:  {}", deltastore_common::crate_info());
            println!("log:     {}", deltastore_log::crate_info());
            println!("graph:   {}", deltastore_graph::crate_info());
            println!("cache:   {}", deltastore_cache::crate_info());
            println!("persist: {}", deltastore_persist::crate_info());
            println!("engine:  {}", deltastore_engine::crate_info());
        }
        Commands::Demo { entities } => {
            println!("Branch/diff/merge demo: seeding {entities} entities");

            let mut engine = Engine::in_memory()?;
            engine.register_schema(SchemaDef::new("note", "1.0", &["title", "body"]))?;
            let main = engine.active_version()?;
            let seed: Vec<Change> = (0..entities)
                .map(|i| {
                    Change::new_snapshot(
                        EntityKey::new(format!("note_{i}"), "note", "demo"),
                        "1.0",
                        "plugin_demo",
                        json!({"title": format!("note {i}")}),
                    )
                })
                .collect();
            engine.append_changes(main, seed)?;
            println!(
                "main: {} change-sets, {} commits, {} changes",
                engine.graph().change_set_count(),
                engine.graph().commit_count(),
                engine.changes().len()
            );

            // Branch, edit both sides, then diff.
            let feature = engine.create_version("feature", Some(main), None)?;
            engine.append_changes(
                feature,
                vec![Change::new_snapshot(
                    EntityKey::new("note_0", "note", "demo"),
                    "1.0",
                    "plugin_demo",
                    json!({"title": "note 0 (feature edit)"}),
                )],
            )?;
            engine.append_changes(
                feature,
                vec![Change::new_snapshot(
                    EntityKey::new("extra", "note", "demo"),
                    "1.0",
                    "plugin_demo",
                    json!({"title": "feature-only note"}),
                )],
            )?;

            let diffs = engine.diff(feature, main)?;
            for d in &diffs {
                let status = match d.status {
                    DiffStatus::Created => "created",
                    DiffStatus::Updated => "updated",
                    DiffStatus::Unchanged => "unchanged",
                    DiffStatus::Deleted => "deleted",
                };
                println!("diff: {} -> {status}", d.entity_id);
            }

            // Merge feature into main and show the winner landing.
            let merged = engine.merge_version(feature, Some(main))?;
            match merged {
                Some(commit) => println!("merge commit: {:?}", commit.commit_id),
                None => println!("merge: nothing to do"),
            }
            let resolved = engine.resolve(&EntityKey::new("note_0", "note", "demo"), main)?;
            if let Some(row) = resolved {
                println!("note_0 on main: {}", row.row.properties["title"]);
            }
            let second = engine.merge_version(feature, Some(main))?;
            println!(
                "second merge: {}",
                if second.is_none() { "no-op" } else { "unexpected commit" }
            );
        }
        Commands::Verify { path } => {
            let store = DurableStore::open(&path)?;
            store.verify_integrity()?;
            println!(
                "store OK: {} segments, graph snapshot {}",
                store.meta().segment_count,
                if store.meta().graph_sha256.is_some() {
                    "present"
                } else {
                    "absent"
                }
            );
        }
    }

    Ok(())
}
