use std::path::PathBuf;

use clap::Parser;
use policyseek::{
    ConfigDb,
    DataDir,
    EmbeddingDb,
    Error,
    Result,
    Retrieval,
    Settings,
    mcp,
    retriever::join_hits,
    settings::{self, KEY_MODEL_NAME, Overrides},
};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CacheAction, Cli, Command, ConfigAction, ModelAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("POLICYSEEK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    debug!(data_dir = %data_dir.root().display(), "resolved data directory");

    let mut overrides = Overrides {
        model: cli.model.clone(),
        embedder: cli.embedder,
        ..Default::default()
    };
    let embedding_db = |settings: &Settings| {
        if cli.no_cache {
            return None;
        }
        debug!(model = %settings.embedder_id(), "using embedding cache");
        EmbeddingDb::open_or_skip(&data_dir.embeddings_db())
    };

    match &cli.command {
        Command::Search(args) => {
            overrides.policy_path = args.document.clone();
            overrides.top_k = args.count;
            let settings = Settings::resolve(&overrides, Some(&config_db))?;
            let retriever =
                settings.build_retriever(embedding_db(&settings))?;

            let retrieval = retriever.search(
                &settings.policy_path,
                &args.query,
                settings.top_k,
            )?;
            print_retrieval(&args.query, &settings, retrieval, args.json)?;
        }
        Command::Chunks(args) => {
            overrides.policy_path = args.document.clone();
            let settings = Settings::resolve(&overrides, Some(&config_db))?;
            cmd_chunks(&settings, args.json)?;
        }
        Command::Status(args) => {
            let settings = Settings::resolve(&overrides, Some(&config_db))?;
            cmd_status(&data_dir, &settings, args.json)?;
        }
        Command::Mcp(args) => {
            overrides.policy_path = args.document.clone();
            let settings = Settings::resolve(&overrides, Some(&config_db))?;
            let search =
                settings.build_policy_search(embedding_db(&settings))?;
            mcp::run_mcp(search)?;
        }
        Command::Model { action } => match action {
            ModelAction::Show { json } => {
                let settings =
                    Settings::resolve(&overrides, Some(&config_db))?;
                if *json {
                    println!(
                        "{}",
                        json!({
                            "model": settings.model_name,
                            "source": settings.model_source,
                            "embedder": settings.embedder,
                        })
                    );
                } else {
                    println!(
                        "{} ({})",
                        settings.model_name, settings.model_source
                    );
                }
            }
            ModelAction::Set { model } => {
                settings::validate_setting(KEY_MODEL_NAME, model)?;
                config_db.set_setting(KEY_MODEL_NAME, model)?;
                println!("Default model set to {model}");
            }
            ModelAction::Clear => {
                if config_db.remove_setting(KEY_MODEL_NAME)? {
                    println!("Cleared stored model setting");
                } else {
                    println!("No stored model setting");
                }
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Show { json } => {
                let entries = config_db.list_settings()?;
                if *json {
                    let map: serde_json::Map<String, serde_json::Value> =
                        entries
                            .into_iter()
                            .map(|(k, v)| (k, serde_json::Value::String(v)))
                            .collect();
                    println!("{}", serde_json::Value::Object(map));
                } else if entries.is_empty() {
                    println!("No settings stored.");
                } else {
                    for (key, value) in &entries {
                        println!("{key}\t{value}");
                    }
                }
            }
            ConfigAction::Set { key, value } => {
                settings::validate_setting(key, value)?;
                config_db.set_setting(key, value)?;
                println!("Set {key} = {value}");
            }
            ConfigAction::Unset { key } => {
                if !config_db.remove_setting(key)? {
                    return Err(Error::NotFound {
                        kind: "setting",
                        name: key.clone(),
                    });
                }
                println!("Removed {key}");
            }
        },
        Command::Cache { action } => {
            let db = EmbeddingDb::open(&data_dir.embeddings_db())?;
            match action {
                CacheAction::Show { json } => {
                    let embeddings = db.len()?;
                    let documents = db.document_count()?;
                    if *json {
                        println!(
                            "{}",
                            json!({
                                "path": data_dir.embeddings_db(),
                                "embeddings": embeddings,
                                "documents": documents,
                            })
                        );
                    } else {
                        println!(
                            "{}: {embeddings} embedding(s) for {documents} document(s)",
                            data_dir.embeddings_db().display()
                        );
                    }
                }
                CacheAction::Clear => {
                    let removed = db.clear()?;
                    println!("Removed {removed} cached embedding(s)");
                }
            }
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn print_retrieval(
    query: &str,
    settings: &Settings,
    retrieval: Retrieval,
    json: bool,
) -> Result<()> {
    if !json {
        let text = retrieval.into_text();
        if !text.is_empty() {
            println!("{text}");
        }
        return Ok(());
    }

    let value = match &retrieval {
        Retrieval::Missing(path) => json!({
            "query": query,
            "document": path,
            "found": false,
            "results": [],
        }),
        Retrieval::Found(hits) => json!({
            "query": query,
            "document": settings.policy_path,
            "found": true,
            "text": join_hits(hits),
            "results": hits,
        }),
    };
    println!("{}", to_json(&value)?);
    Ok(())
}

fn cmd_chunks(settings: &Settings, json: bool) -> Result<()> {
    let retriever = settings.build_retriever(None)?;
    let Some(chunks) = retriever.chunks(&settings.policy_path)? else {
        return Err(Error::NotFound {
            kind: "policy document",
            name: settings.policy_path.display().to_string(),
        });
    };

    if json {
        println!("{}", to_json(&chunks)?);
        return Ok(());
    }

    for chunk in &chunks {
        println!(
            "--- chunk {} [{}..{}] {} chars ---",
            chunk.index,
            chunk.start_offset,
            chunk.end_offset,
            chunk.char_len()
        );
        println!("{}", chunk.content);
    }
    println!("\n{} chunk(s)", chunks.len());
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    settings: &Settings,
    json: bool,
) -> Result<()> {
    let document = document_status(&settings.policy_path)?;
    let cached = if data_dir.embeddings_db().exists() {
        EmbeddingDb::open_or_skip(&data_dir.embeddings_db())
            .and_then(|db| db.len().ok())
    } else {
        None
    };

    if json {
        println!(
            "{}",
            to_json(&json!({
                "data_dir": data_dir.root(),
                "settings": settings,
                "document": document.as_ref().map(|(path, bytes)| json!({
                    "path": path,
                    "bytes": bytes,
                })),
                "cached_embeddings": cached,
            }))?
        );
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Model: {} ({})", settings.model_name, settings.model_source);
    println!("Embedder: {}", settings.embedder);
    println!(
        "Chunking: {} chars, {} overlap",
        settings.chunk_size, settings.chunk_overlap
    );
    println!("Top k: {}", settings.top_k);
    println!("Metric: {}", settings.metric);
    match document {
        Some((path, bytes)) => {
            println!("Document: {} ({bytes} bytes)", path.display());
        }
        None => println!(
            "Document: {} (not found)",
            settings.policy_path.display()
        ),
    }
    if let Some(count) = cached {
        println!("Cached embeddings: {count}");
    }
    Ok(())
}

fn document_status(path: &std::path::Path) -> Result<Option<(PathBuf, u64)>> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            Ok(Some((path, meta.len())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("failed to serialize output: {e}")))
}
