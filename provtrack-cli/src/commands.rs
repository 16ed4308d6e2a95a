//! Subcommand handlers.

use anyhow::Context as _;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use provtrack_core::frame::{self, Frame, FrameOps};
use provtrack_core::intercept::Traced;
use provtrack_core::{
    Catalog, ConsoleWriter, DagFilter, FileStore, GraphBatch, Interceptor, PersistentWriter,
    RunMetadata, RunStatus, SnapshotRecord, SnapshotStore, Tracker, TrackerConfig, WriteMode,
    frame_vocabulary,
};

use crate::{Commands, ConfigAction};

/// Options shared by every subcommand.
pub(crate) struct Context {
    pub workspace: PathBuf,
    pub store: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    fn config(&self) -> anyhow::Result<TrackerConfig> {
        let mut config = provtrack_core::config::load_config(Some(&self.workspace), None)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        if let Some(root) = &self.store {
            config.store.root = Some(root.clone());
        }
        Ok(config)
    }

    fn store(&self) -> anyhow::Result<Arc<FileStore>> {
        let root = self.config()?.store.resolved_root();
        tracing::debug!(root = %root.display(), "Opening snapshot store");
        Ok(Arc::new(FileStore::new(root)))
    }

    fn catalog(&self) -> anyhow::Result<Catalog<FileStore>> {
        Ok(Catalog::new(self.store()?))
    }
}

fn filter(
    project: String,
    pipeline: Option<String>,
    run: Option<String>,
    user_tag: Option<String>,
) -> DagFilter {
    DagFilter {
        project_name: Some(project),
        pipeline_name: pipeline,
        run_uid: run,
        user_tag,
    }
}

fn print_json<T: Serialize>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub(crate) fn handle_command(
    command: Commands,
    ctx: &Context,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Commands::Projects => handle_projects(ctx, out),
        Commands::Pipelines { project, user_tag } => {
            let pipelines = ctx.catalog()?.list_pipelines(&project, user_tag.as_deref())?;
            if ctx.json {
                return print_json(out, &pipelines);
            }
            for name in pipelines {
                writeln!(out, "{name}")?;
            }
            Ok(())
        }
        Commands::Runs {
            project,
            pipeline,
            user_tag,
        } => handle_runs(ctx, filter(project, pipeline, None, user_tag), out),
        Commands::Dag {
            project,
            pipeline,
            run,
            user_tag,
        } => handle_dag(ctx, filter(project, pipeline, run, user_tag), out),
        Commands::History { run_uid } => handle_history(ctx, &run_uid, out),
        Commands::Show { run_uid, version } => handle_show(ctx, &run_uid, version, out),
        Commands::Verify { run_uid } => handle_verify(ctx, &run_uid, out),
        Commands::Demo { csv, console } => handle_demo(ctx, csv.as_deref(), console, out),
        Commands::Config { action } => handle_config(action, ctx, out),
    }
}

fn handle_projects(ctx: &Context, out: &mut dyn Write) -> anyhow::Result<()> {
    let projects = ctx.catalog()?.projects_with_pipelines()?;
    if ctx.json {
        return print_json(out, &projects);
    }
    if projects.is_empty() {
        writeln!(out, "No runs recorded yet.")?;
        return Ok(());
    }
    for project in projects {
        match &project.user_tag {
            Some(tag) => writeln!(out, "{} [{}]", project.project_name, tag)?,
            None => writeln!(out, "{}", project.project_name)?,
        }
        for pipeline in project.pipelines {
            let noun = if pipeline.runs == 1 { "run" } else { "runs" };
            writeln!(out, "  {} ({} {})", pipeline.name, pipeline.runs, noun)?;
        }
    }
    Ok(())
}

fn handle_runs(ctx: &Context, filter: DagFilter, out: &mut dyn Write) -> anyhow::Result<()> {
    let runs = ctx.catalog()?.list_runs(&filter)?;
    if ctx.json {
        return print_json(out, &runs);
    }
    writeln!(
        out,
        "{:<36}  {:<16}  {:<10}  {:<8}  {:>4}  OPENED",
        "RUN", "PIPELINE", "TAG", "STATUS", "SV"
    )?;
    for run in runs {
        let sv = run
            .latest_sequence_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{:<36}  {:<16}  {:<10}  {:<8}  {:>4}  {}",
            run.run_uid,
            run.pipeline_name,
            run.user_tag.as_deref().unwrap_or("-"),
            run.status,
            sv,
            run.opened_at.format("%Y-%m-%d %H:%M:%S"),
        )?;
    }
    Ok(())
}

fn handle_dag(ctx: &Context, filter: DagFilter, out: &mut dyn Write) -> anyhow::Result<()> {
    let catalog = ctx.catalog()?;
    if ctx.json {
        return print_json(out, &catalog.list_dag(&filter)?);
    }
    let store = ctx.store()?;
    for run in catalog.list_runs(&filter)? {
        if let Some(record) = catalog.current(&run.run_uid)? {
            render_snapshot(store.as_ref(), &record, out)?;
        }
    }
    Ok(())
}

fn handle_history(ctx: &Context, run_uid: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    let history = ctx.catalog()?.history(run_uid)?;
    if ctx.json {
        return print_json(out, &history);
    }
    writeln!(
        out,
        "{:>4}  {:<8}  {:>5}  {:>5}  {:<19}  CHAIN",
        "SV", "STATUS", "NODES", "EDGES", "COMMITTED"
    )?;
    for entry in history {
        writeln!(
            out,
            "{:>4}  {:<8}  {:>5}  {:>5}  {:<19}  {}",
            entry.sequence_version,
            entry.status,
            entry.nodes,
            entry.edges,
            entry.committed_at.format("%Y-%m-%d %H:%M:%S"),
            &entry.chain_hash[..12.min(entry.chain_hash.len())],
        )?;
    }
    Ok(())
}

fn handle_show(
    ctx: &Context,
    run_uid: &str,
    version: Option<u64>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let catalog = ctx.catalog()?;
    let record = match version {
        Some(sv) => catalog.snapshot(run_uid, sv)?,
        None => catalog.current(run_uid)?,
    }
    .with_context(|| match version {
        Some(sv) => format!("run {run_uid} has no snapshot {sv}"),
        None => format!("run {run_uid} has no snapshots"),
    })?;

    if ctx.json {
        return print_json(out, &record);
    }
    render_snapshot(ctx.store()?.as_ref(), &record, out)
}

/// Render a stored snapshot the same way the console writer renders a live run.
fn render_snapshot(
    store: &dyn SnapshotStore,
    record: &SnapshotRecord,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let run = store.run(&record.run_uid)?;
    let meta = RunMetadata {
        session_id: record.session_id,
        project_name: record.project_name.clone(),
        pipeline_name: record.pipeline_name.clone(),
        user_tag: record.user_tag.clone(),
        description: record.description.clone(),
        status: record.status,
        started_at: run.as_ref().map_or(record.committed_at, |r| r.opened_at),
        finished_at: run.and_then(|r| r.closed_at),
    };
    let batch = GraphBatch {
        run: &meta,
        nodes: &record.nodes,
        edges: &record.edges,
        mode: WriteMode::Full,
    };
    writeln!(
        out,
        "run {} @ SV {} (committed {})",
        record.run_uid,
        record.sequence_version,
        record.committed_at.format("%Y-%m-%d %H:%M:%S")
    )?;
    write!(out, "{}", ConsoleWriter::render(&batch))?;
    Ok(())
}

fn handle_verify(ctx: &Context, run_uid: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    let report = ctx.catalog()?.verify_history(run_uid)?;
    if ctx.json {
        print_json(out, &report)?;
    } else if report.valid {
        writeln!(
            out,
            "run {run_uid}: {} snapshots, hash chain valid",
            report.checked
        )?;
    }
    if !report.valid {
        anyhow::bail!(
            "run {run_uid}: hash chain broken at SV {}: {}",
            report
                .first_invalid
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string()),
            report.reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn sample_frame() -> anyhow::Result<Frame> {
    let rows = vec![
        vec![json!(3), json!("eu"), json!(75)],
        vec![json!(1), json!("eu"), json!(120)],
        vec![json!(2), json!("us"), serde_json::Value::Null],
        vec![json!(3), json!("eu"), json!(75)],
        vec![json!(4), json!("apac"), json!(42)],
    ];
    Ok(Frame::new(
        vec!["id".into(), "region".into(), "spend".into()],
        rows,
    )?)
}

/// The demo pipeline: dedupe and sort, checkpoint, then join the top rows
/// back onto the cleaned frame.
fn demo_pipeline(tracker: &Tracker, source: Traced<Frame>) -> anyhow::Result<Traced<Frame>> {
    let clean = source.deduplicate()?;
    let sorted = clean.sort_by("id", true)?;
    tracker.flush()?;
    let top = sorted.head(3)?;
    Ok(top.merge(&clean, "id")?)
}

fn handle_demo(
    ctx: &Context,
    csv: Option<&Path>,
    console: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let mut config = ctx.config()?;
    config.console.enabled |= console;
    let store = Arc::new(FileStore::new(config.store.resolved_root()));
    let writer = Arc::new(PersistentWriter::new(store.clone()));

    let tracker = Arc::new(Tracker::from_config(&config));
    tracker.attach_writer(writer.clone());
    let interceptor =
        Interceptor::new(tracker.clone(), frame_vocabulary()).with_capture(config.capture.clone());

    let session = tracker.start();
    tracing::info!(session_id = %session.session_id, "Demo run started");

    let source = match csv {
        Some(path) => frame::read_csv(&interceptor, path),
        None => {
            let sample = sample_frame()?;
            frame::from_rows(&interceptor, sample.columns().to_vec(), sample.rows().to_vec())
        }
    };
    let key = tracker.run_config().key();
    let result = source
        .map_err(anyhow::Error::from)
        .and_then(|source| demo_pipeline(&tracker, source));
    let run_uid = writer.current_run_uid(&key);

    match result {
        Ok(output) => {
            tracker.stop(RunStatus::Finished)?;
            if ctx.json {
                return print_json(
                    out,
                    &json!({
                        "run_uid": run_uid,
                        "rows": output.row_count(),
                        "store": store.root().display().to_string(),
                    }),
                );
            }
            writeln!(
                out,
                "Committed run {} ({} output rows) to {}",
                run_uid.as_deref().unwrap_or("?"),
                output.row_count(),
                store.root().display()
            )?;
            Ok(())
        }
        Err(err) => {
            if let Err(stop_err) = tracker.stop(RunStatus::Failed) {
                tracing::warn!(error = %stop_err, "Failed to record failed run");
            }
            Err(err)
        }
    }
}

fn handle_config(action: ConfigAction, ctx: &Context, out: &mut dyn Write) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = provtrack_core::config::write_workspace_config(
                &ctx.workspace,
                &TrackerConfig::default(),
                force,
            )
            .map_err(|e| anyhow::anyhow!("Failed to write config: {}", e))?;
            writeln!(out, "Created default configuration at: {}", path.display())?;
            Ok(())
        }
        ConfigAction::Show => {
            let config = ctx.config()?;
            if ctx.json {
                return print_json(out, &config);
            }
            write!(out, "{}", toml::to_string_pretty(&config)?)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir, json: bool) -> Context {
        Context {
            workspace: dir.path().to_path_buf(),
            store: Some(dir.path().join("store")),
            json,
        }
    }

    fn run(ctx: &Context, command: Commands) -> String {
        let mut buf = Vec::new();
        handle_command(command, ctx, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn demo_run_uid(ctx: &Context) -> String {
        let json_ctx = Context {
            workspace: ctx.workspace.clone(),
            store: ctx.store.clone(),
            json: true,
        };
        let output = run(
            &json_ctx,
            Commands::Demo {
                csv: None,
                console: false,
            },
        );
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        value["run_uid"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_config_init_and_show() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);

        let output = run(&ctx, Commands::Config {
            action: ConfigAction::Init { force: false },
        });
        assert!(output.contains("Created default configuration"));
        let config_path = dir.path().join(".provtrack").join("config.toml");
        let parsed: TrackerConfig =
            toml::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(parsed.run.project_name, "default");

        let mut buf = Vec::new();
        let err = handle_command(
            Commands::Config {
                action: ConfigAction::Init { force: false },
            },
            &ctx,
            &mut buf,
        );
        assert!(err.is_err());

        let shown = run(&ctx, Commands::Config {
            action: ConfigAction::Show,
        });
        assert!(shown.contains("[run]"));
    }

    #[test]
    fn test_demo_then_browse() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);
        let run_uid = demo_run_uid(&ctx);

        let projects = run(&ctx, Commands::Projects);
        assert!(projects.contains("default"));
        assert!(projects.contains("main (1 run)"));

        let pipelines = run(&ctx, Commands::Pipelines {
            project: "default".into(),
            user_tag: None,
        });
        assert_eq!(pipelines.trim(), "main");

        let runs = run(&ctx, Commands::Runs {
            project: "default".into(),
            pipeline: None,
            user_tag: None,
        });
        assert!(runs.contains(&run_uid));
        assert!(runs.contains("finished"));

        let history = run(&ctx, Commands::History {
            run_uid: run_uid.clone(),
        });
        assert_eq!(history.lines().count(), 3);

        let verify = run(&ctx, Commands::Verify {
            run_uid: run_uid.clone(),
        });
        assert!(verify.contains("2 snapshots, hash chain valid"));

        let shown = run(&ctx, Commands::Show {
            run_uid: run_uid.clone(),
            version: Some(0),
        });
        assert!(shown.contains("SV 0"));
        assert!(shown.contains("sort_by"));
        assert!(!shown.contains("merge"));

        let dag = run(&ctx, Commands::Dag {
            project: "default".into(),
            pipeline: None,
            run: Some(run_uid),
            user_tag: None,
        });
        assert!(dag.contains("merge"));
        assert!(dag.contains("5 nodes, 5 edges"));
    }

    #[test]
    fn test_demo_with_csv_json_dag() {
        let dir = TempDir::new().unwrap();
        let csv = dir.path().join("input.csv");
        std::fs::write(&csv, "id,name\n2,bo\n1,al\n").unwrap();
        let ctx = context(&dir, true);

        run(&ctx, Commands::Demo {
            csv: Some(csv),
            console: false,
        });
        let output = run(&ctx, Commands::Dag {
            project: "default".into(),
            pipeline: Some("main".into()),
            run: None,
            user_tag: None,
        });
        let dag: serde_json::Value = serde_json::from_str(&output).unwrap();
        let operations: Vec<&str> = dag["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["operation"].as_str().unwrap())
            .collect();
        assert_eq!(
            operations,
            vec!["read_csv", "deduplicate", "sort_by", "head", "merge"]
        );
    }

    #[test]
    fn test_show_missing_version_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);
        let run_uid = demo_run_uid(&ctx);
        let mut buf = Vec::new();
        let result = handle_command(
            Commands::Show {
                run_uid,
                version: Some(42),
            },
            &ctx,
            &mut buf,
        );
        assert!(result.is_err());
    }
}
