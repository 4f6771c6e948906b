use std::path::PathBuf;

use system_utils::path::expand_tilde;
use tracing::warn;

use crate::channel::{shell_escape, Channel, RemoteScript, SshChannel};
use crate::cli::{Args, Command, InitArgs, LaunchArgs};
use crate::context::FleetContext;
use crate::errors::PartialFailure;
use crate::migrate::{discover, run_migrations, RemotePsql};
use crate::redeploy::Redeploy;
use crate::state::DeploymentState;
use crate::status::{collect_status, render_table, Palette};
use crate::supervisor::{ServiceOutcome, StopReport};

const LOGS_TEMPLATE: &str = r#"if [ ! -f "$fleet_log" ]; then
  echo "(no log at $fleet_log)"
  exit 0
fi
tail -n "$fleet_lines" "$fleet_log"
"#;

/// Runs one CLI command; the returned value is the process exit code.
pub(crate) async fn run(args: Args) -> anyhow::Result<u8> {
    let ctx = FleetContext::from_args(&args.global)?;
    match args.command {
        Command::Status { json } => status(&ctx, json).await,
        Command::Logs {
            service,
            lines,
            follow,
            save,
        } => logs(&ctx, &service, lines, follow, save).await,
        Command::Start(launch) => start(&ctx, launch).await,
        Command::Stop { service } => stop(&ctx, &service).await,
        Command::Restart(launch) => restart(&ctx, launch).await,
        Command::StopAll => stop_all(&ctx).await,
        Command::Redeploy { skip_build } => redeploy(&ctx, skip_build).await,
        Command::Migrate => migrate(&ctx).await,
        Command::Ssh { command } => ssh(&ctx, &command).await,
        Command::Db { sql } => db(&ctx, sql.as_deref()).await,
        Command::Init(init) => init_deployment(&ctx, init).await,
        Command::Teardown => teardown(&ctx).await,
    }
}

fn connect(ctx: &FleetContext) -> anyhow::Result<SshChannel> {
    let state = ctx.load_state()?;
    Ok(ctx.channel(&state))
}

async fn status(ctx: &FleetContext, json: bool) -> anyhow::Result<u8> {
    let channel = connect(ctx)?;
    let snapshot = collect_status(&channel, &ctx.registry, &ctx.status_request()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_table(&snapshot, ctx.palette));
    }
    Ok(0)
}

async fn logs(
    ctx: &FleetContext,
    service: &str,
    lines: usize,
    follow: bool,
    save: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let service = ctx.registry.get(service)?;
    let channel = connect(ctx)?;
    if follow {
        let remote_cmd = format!("tail -n {lines} -F {}", shell_escape(&service.log_file));
        return Ok(exit_code(channel.interactive(Some(&remote_cmd)).await?));
    }
    if let Some(path) = save {
        channel.download(&service.log_file, &path).await?;
        println!("saved {} to {}", service.log_file, path.display());
        return Ok(0);
    }
    let output = channel
        .execute(&tail_script(&service.log_file, lines))
        .await?
        .check(&format!("logs {}", service.name))?;
    print!("{}", output.stdout);
    Ok(0)
}

async fn start(ctx: &FleetContext, launch: LaunchArgs) -> anyhow::Result<u8> {
    let service = ctx.registry.get(&launch.service)?;
    let channel = connect(ctx)?;
    let handle = ctx.supervisor(&channel).start(service, &launch.args).await?;
    println!("{}: started (pid {})", service.name, handle.pid);
    Ok(0)
}

async fn stop(ctx: &FleetContext, service: &str) -> anyhow::Result<u8> {
    let service = ctx.registry.get(service)?;
    let channel = connect(ctx)?;
    let report = ctx.supervisor(&channel).stop(service).await?;
    println!("{}: {report}", service.name);
    Ok(0)
}

async fn restart(ctx: &FleetContext, launch: LaunchArgs) -> anyhow::Result<u8> {
    let service = ctx.registry.get(&launch.service)?;
    let channel = connect(ctx)?;
    let (report, handle) = ctx
        .supervisor(&channel)
        .restart(service, &launch.args)
        .await?;
    println!("{}: {report}", service.name);
    println!("{}: started (pid {})", service.name, handle.pid);
    Ok(0)
}

async fn stop_all(ctx: &FleetContext) -> anyhow::Result<u8> {
    let channel = connect(ctx)?;
    let outcomes = ctx.supervisor(&channel).stop_all(&ctx.registry).await;
    let failed = print_stop_outcomes(&outcomes, ctx.palette);
    if !failed.is_empty() {
        return Err(PartialFailure {
            action: "stop-all",
            failed,
        }
        .into());
    }
    Ok(0)
}

fn print_stop_outcomes(outcomes: &[ServiceOutcome<StopReport>], palette: Palette) -> Vec<String> {
    let mut failed = Vec::new();
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => println!("{}: {report}", outcome.service),
            Err(err) => {
                println!("{}: {}", outcome.service, palette.paint("31", &format!("error: {err:#}")));
                failed.push(outcome.service.clone());
            }
        }
    }
    failed
}

async fn redeploy(ctx: &FleetContext, skip_build: bool) -> anyhow::Result<u8> {
    let database_url = ctx.settings.require_database_url()?;
    let channel = connect(ctx)?;
    let supervisor = ctx.supervisor(&channel);
    let target = RemotePsql::new(&channel, database_url, &ctx.settings.layout.staging_dir());
    let report = Redeploy {
        channel: &channel,
        settings: &ctx.settings,
        registry: &ctx.registry,
        supervisor: &supervisor,
        migrations: &target,
    }
    .run(skip_build)
    .await?;

    println!("artifact: {} replaced", ctx.settings.layout.artifact_path());
    println!("migrations: {}", report.migrations);
    for outcome in &report.restarted {
        match &outcome.result {
            Ok(handle) => println!("{}: started (pid {})", outcome.service, handle.pid),
            Err(err) => println!(
                "{}: {}",
                outcome.service,
                ctx.palette.paint("31", &format!("error: {err:#}"))
            ),
        }
    }
    let failed = report.failed_restarts();
    if !failed.is_empty() {
        return Err(PartialFailure {
            action: "restart after redeploy",
            failed,
        }
        .into());
    }
    Ok(0)
}

async fn migrate(ctx: &FleetContext) -> anyhow::Result<u8> {
    let database_url = ctx.settings.require_database_url()?;
    let migrations = discover(&ctx.settings.migrations_dir)?;
    let channel = connect(ctx)?;
    let target = RemotePsql::new(&channel, database_url, &ctx.settings.layout.staging_dir());
    let report = run_migrations(&target, &migrations).await?;
    println!("{report}");
    Ok(0)
}

async fn ssh(ctx: &FleetContext, command: &[String]) -> anyhow::Result<u8> {
    let channel = connect(ctx)?;
    let remote_cmd = (!command.is_empty()).then(|| command.join(" "));
    Ok(exit_code(channel.interactive(remote_cmd.as_deref()).await?))
}

async fn db(ctx: &FleetContext, sql: Option<&str>) -> anyhow::Result<u8> {
    let database_url = ctx.settings.require_database_url()?;
    let channel = connect(ctx)?;
    let remote_cmd = psql_command(database_url, sql);
    Ok(exit_code(channel.interactive(Some(&remote_cmd)).await?))
}

fn tail_script(log_file: &str, lines: usize) -> RemoteScript {
    RemoteScript::new()
        .set("fleet_log", log_file)
        .set("fleet_lines", &lines.to_string())
        .line(LOGS_TEMPLATE)
}

fn psql_command(database_url: &str, sql: Option<&str>) -> String {
    let mut command = format!("psql {}", shell_escape(database_url));
    if let Some(sql) = sql {
        command.push_str(" -c ");
        command.push_str(&shell_escape(sql));
    }
    command
}

async fn init_deployment(ctx: &FleetContext, init: InitArgs) -> anyhow::Result<u8> {
    ctx.state_store.ensure_vacant()?;
    let key = expand_tilde(&init.key);
    if !key.is_file() {
        anyhow::bail!("identity file not found: {}", key.display());
    }
    let state = DeploymentState {
        host_address: init.host,
        credential_ref: key.display().to_string(),
        network_group_id: init.network_group,
        allocation_id: init.allocation,
        region: init.region,
        market_type: init.market_type,
    };
    if !init.no_wait {
        let timing = &ctx.settings.timing;
        ctx.channel(&state)
            .wait_until_reachable(timing.reachable_attempts, timing.reachable_interval)
            .await?;
    }
    ctx.state_store.create(&state)?;
    println!(
        "recorded {} in {}",
        state.host_address,
        ctx.state_store.path().display()
    );
    Ok(0)
}

async fn teardown(ctx: &FleetContext) -> anyhow::Result<u8> {
    let state = ctx.load_state()?;
    let channel = ctx.channel(&state);
    let outcomes = ctx.supervisor(&channel).stop_all(&ctx.registry).await;
    let failed = print_stop_outcomes(&outcomes, ctx.palette);
    if !failed.is_empty() {
        warn!(
            event = "teardown.stop_incomplete",
            host = %channel.describe(),
            failed = ?failed,
            "some services could not be stopped"
        );
    }
    ctx.state_store.remove()?;
    println!("removed deployment state {}", ctx.state_store.path().display());
    println!(
        "release network group {} and allocation {} with the provider",
        state.network_group_id, state.allocation_id
    );
    Ok(0)
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
