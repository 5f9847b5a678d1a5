mod config;
mod runtime;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use ws_core::CancellationToken;
use ws_editor::AtomicFileEditor;

#[derive(Parser)]
#[command(name = "ws", about = "Workspace service CLI: checkout/commit/cleanup, project CRUD, file editing, DEK rotation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file. Defaults to $WORKSPACE_CONFIG, then
    /// <config_dir>/workspaced/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Hydrate a session working directory from durable storage.
    Checkout {
        user_id: String,
        project_id: String,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Reconcile a session working directory back to durable storage.
    Commit { user_id: String, project_id: String, session_id: String },
    /// Discard a session working directory.
    Cleanup { user_id: String, project_id: String, session_id: String },

    /// Create a new project for a user.
    CreateProject { user_id: String, name: String },
    /// List a user's projects.
    ListProjects { user_id: String },
    /// Fetch a single project's metadata.
    HeadProject { user_id: String, project_id: String },
    /// List a directory within a project.
    ListTree {
        user_id: String,
        project_id: String,
        #[arg(default_value = "")]
        path: String,
    },
    /// Upload a local file into a project.
    Upload {
        user_id: String,
        project_id: String,
        local_path: PathBuf,
        dest_dir: String,
        dest_name: String,
    },
    /// Print a project file's plaintext contents to stdout.
    ReadFile { user_id: String, project_id: String, path: String },
    /// Remove a file or directory subtree from a project.
    DeleteFile { user_id: String, project_id: String, path: String },
    /// Move or rename a path within a project.
    MovePath { user_id: String, project_id: String, from: String, to: String },
    /// Create a directory within a project.
    CreateDir { user_id: String, project_id: String, path: String },
    /// Enable or disable at-rest encryption for a project.
    EnableEncryption { user_id: String, project_id: String, enabled: bool },
    /// Rotate a project's data encryption key.
    RotateDek { user_id: String, project_id: String },

    /// Line-oriented file editing, rooted at a local directory (typically a
    /// checked-out session's working directory).
    Edit {
        #[command(subcommand)]
        action: EditAction,
    },

    /// Sanity-check configuration and connectivity to the configured backend.
    Doctor,
}

#[derive(Subcommand)]
enum EditAction {
    Read { root: PathBuf, path: String },
    ReadRange { root: PathBuf, path: String, start: usize, end: usize },
    Search { root: PathBuf, path: String, pattern: String },
    ReplaceLine { root: PathBuf, path: String, line: usize, text: String },
    ReplaceRange { root: PathBuf, path: String, start: usize, end: usize, text: String },
    InsertAfter { root: PathBuf, path: String, line: usize, text: String },
    DeleteRange { root: PathBuf, path: String, start: usize, end: usize },
    ApplyPatch { root: PathBuf, path: String, diff_file: PathBuf },
    PreviewPatch { root: PathBuf, path: String, diff_file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    // One root token for the whole invocation; ctrl-c cancels every
    // in-flight operation at its next checkpoint.
    let ctx = CancellationToken::new();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_ctx.cancel();
        }
    });

    match run(&ctx, cli.command, &cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(ctx: &CancellationToken, command: Commands, cfg: &ws_core::Config) -> Result<()> {
    match command {
        Commands::Checkout { user_id, project_id, session_id } => {
            let manager = runtime::build_workspace_manager(cfg).await?;
            let ws = manager.checkout(ctx, &user_id, &project_id, session_id.as_deref()).await?;
            println!("session {} checked out at {}", ws.session_id, ws.base_dir.display());
        }
        Commands::Commit { user_id, project_id, session_id } => {
            let manager = runtime::build_workspace_manager(cfg).await?;
            let ws = manager.checkout(ctx, &user_id, &project_id, Some(&session_id)).await?;
            manager.commit(ctx, &ws).await?;
            println!("session {session_id} committed");
        }
        Commands::Cleanup { user_id, project_id, session_id } => {
            let manager = runtime::build_workspace_manager(cfg).await?;
            let ws = manager.checkout(ctx, &user_id, &project_id, Some(&session_id)).await?;
            manager.cleanup(ctx, &ws).await?;
            println!("session {session_id} cleaned up");
        }

        Commands::CreateProject { user_id, name } => {
            let service = runtime::build_projects_service(cfg).await?;
            let project = service.create_project(ctx, &user_id, &name).await?;
            println!("{}", serde_json::to_string_pretty(&project)?);
        }
        Commands::ListProjects { user_id } => {
            let service = runtime::build_projects_service(cfg).await?;
            let projects = service.list_projects(ctx, &user_id).await?;
            println!("{}", serde_json::to_string_pretty(&projects)?);
        }
        Commands::HeadProject { user_id, project_id } => {
            let service = runtime::build_projects_service(cfg).await?;
            let project = service.head_project(ctx, &user_id, &project_id).await?;
            println!("{}", serde_json::to_string_pretty(&project)?);
        }
        Commands::ListTree { user_id, project_id, path } => {
            let service = runtime::build_projects_service(cfg).await?;
            let entries = service.list_tree(ctx, &user_id, &project_id, &path).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Upload { user_id, project_id, local_path, dest_dir, dest_name } => {
            let service = runtime::build_projects_service(cfg).await?;
            let content = std::fs::read(&local_path).with_context(|| format!("failed to read {}", local_path.display()))?;
            service.upload_file(ctx, &user_id, &project_id, &dest_dir, &dest_name, content).await?;
            println!("uploaded {dest_dir}/{dest_name}");
        }
        Commands::ReadFile { user_id, project_id, path } => {
            let service = runtime::build_projects_service(cfg).await?;
            let content = service.read_file(ctx, &user_id, &project_id, &path).await?;
            std::io::Write::write_all(&mut std::io::stdout(), &content)?;
        }
        Commands::DeleteFile { user_id, project_id, path } => {
            let service = runtime::build_projects_service(cfg).await?;
            service.delete_file(ctx, &user_id, &project_id, &path).await?;
            println!("deleted {path}");
        }
        Commands::MovePath { user_id, project_id, from, to } => {
            let service = runtime::build_projects_service(cfg).await?;
            service.move_path(ctx, &user_id, &project_id, &from, &to).await?;
            println!("moved {from} -> {to}");
        }
        Commands::CreateDir { user_id, project_id, path } => {
            let service = runtime::build_projects_service(cfg).await?;
            service.create_dir(ctx, &user_id, &project_id, &path).await?;
            println!("created {path}");
        }
        Commands::EnableEncryption { user_id, project_id, enabled } => {
            let service = runtime::build_projects_service(cfg).await?;
            service.enable_encryption(ctx, &user_id, &project_id, enabled).await?;
            println!("encryption {} for project {project_id}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::RotateDek { user_id, project_id } => {
            let service = runtime::build_projects_service(cfg).await?;
            service.rotate_project_dek(ctx, &user_id, &project_id).await?;
            println!("rotated DEK for project {project_id}");
        }

        Commands::Edit { action } => run_edit(ctx, action).await?,

        Commands::Doctor => run_doctor(ctx, cfg).await?,
    }
    Ok(())
}

async fn run_edit(ctx: &CancellationToken, action: EditAction) -> Result<()> {
    match action {
        EditAction::Read { root, path } => {
            let result = AtomicFileEditor::new(root).read(&path).await?;
            print!("{}", result.content);
        }
        EditAction::ReadRange { root, path, start, end } => {
            let result = AtomicFileEditor::new(root).read_range(&path, start, end).await?;
            print!("{}", result.content);
        }
        EditAction::Search { root, path, pattern } => {
            let result = AtomicFileEditor::new(root).search(&path, &pattern).await?;
            for m in result.matches {
                println!("{}:{}", m.line, m.text);
            }
            if result.truncated {
                eprintln!("(results truncated)");
            }
        }
        EditAction::ReplaceLine { root, path, line, text } => {
            AtomicFileEditor::new(root).replace_line(ctx, &path, line, &text).await?;
        }
        EditAction::ReplaceRange { root, path, start, end, text } => {
            AtomicFileEditor::new(root).replace_range(ctx, &path, start, end, &text).await?;
        }
        EditAction::InsertAfter { root, path, line, text } => {
            AtomicFileEditor::new(root).insert_after(ctx, &path, line, &text).await?;
        }
        EditAction::DeleteRange { root, path, start, end } => {
            AtomicFileEditor::new(root).delete_range(ctx, &path, start, end).await?;
        }
        EditAction::ApplyPatch { root, path, diff_file } => {
            let diff = std::fs::read_to_string(&diff_file).with_context(|| format!("failed to read {}", diff_file.display()))?;
            AtomicFileEditor::new(root).apply_patch(ctx, &path, &diff).await?;
        }
        EditAction::PreviewPatch { root, path, diff_file } => {
            let diff = std::fs::read_to_string(&diff_file).with_context(|| format!("failed to read {}", diff_file.display()))?;
            let preview = AtomicFileEditor::new(root).preview_patch(&path, &diff).await?;
            print!("{}", preview.unified_diff);
        }
    }
    Ok(())
}

async fn run_doctor(ctx: &CancellationToken, cfg: &ws_core::Config) -> Result<()> {
    let mut ok = true;

    match runtime::build_object_store(cfg) {
        Ok(store) => match store.exists(ctx, "doctor-probe").await {
            Ok(_) => println!("object store: reachable ({:?} backend)", cfg.backend),
            Err(e) => {
                ok = false;
                println!("object store: unreachable ({e})");
            }
        },
        Err(e) => {
            ok = false;
            println!("object store: misconfigured ({e})");
        }
    }

    if cfg.redis.enabled {
        match runtime::redis_url(cfg) {
            Ok(url) => match ws_enterprise::RedisGenerationCache::connect(&url).await {
                Ok(_) => println!("redis: reachable"),
                Err(e) => {
                    ok = false;
                    println!("redis: unreachable ({e})");
                }
            },
            Err(e) => {
                ok = false;
                println!("redis: misconfigured ({e})");
            }
        }
    } else {
        println!("redis: disabled");
    }

    match runtime::build_key_provider(cfg).await {
        Ok(Some(_)) => println!("encryption: enabled, key provider {:?}", cfg.encryption.provider),
        Ok(None) => println!("encryption: disabled"),
        Err(e) => {
            ok = false;
            println!("encryption: misconfigured ({e})");
        }
    }

    if !ok {
        anyhow::bail!("one or more checks failed");
    }
    Ok(())
}
