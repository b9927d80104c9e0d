// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxistate::{
    apply::{ApplyOptions, Reconciler},
    config::Config,
    entry::target::{process_umask, IncludeSet},
    manifest::ManifestResolver,
    path::{default_config_file, default_manifest_file, default_state_file, home_dir},
    store::{
        sqlite::{SqliteOptions, SqlitePersistentState},
        state_data, PersistentState, ENTRY_STATE_BUCKET, SCRIPT_ONCE_STATE_BUCKET,
    },
    system::{
        debug::DebugSystem, dry_run::DryRunSystem, git_diff::GitDiffSystem,
        read_only::ReadOnlySystem, real::RealSystem, System,
    },
};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use inquire::Confirm;
use serde_json::json;
use std::{
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
    process::exit,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxistate [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let ctx = Context::load(self.global)?;
        match self.command {
            Command::Apply(opts) => run_apply(&ctx, opts),
            Command::Diff(opts) => run_diff(&ctx, opts),
            Command::Verify(opts) => run_verify(&ctx, opts),
            Command::State(StateCommand::Create) => run_state_create(&ctx),
            Command::State(StateCommand::Dump) => run_state_dump(&ctx),
            Command::State(StateCommand::Reset) => run_state_reset(&ctx),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct GlobalOptions {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to manifest of target state.
    #[arg(short, long, global = true, value_name = "path")]
    pub manifest: Option<PathBuf>,

    /// Destination directory to reconcile.
    #[arg(short = 'D', long, global = true, value_name = "path")]
    pub destination: Option<PathBuf>,

    /// Show what would change without changing anything.
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Print a diff of every change.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log every system and persistent state operation.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Continue with the next target after a failure.
    #[arg(short, long, global = true)]
    pub keep_going: bool,

    /// Never prompt for confirmation.
    #[arg(long, global = true)]
    pub force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Bring destination in line with the manifest.
    #[command(override_usage = "oxistate apply [options] [<target>]...")]
    Apply(ApplyCmdOptions),

    /// Print changes that apply would make.
    #[command(override_usage = "oxistate diff [options] [<target>]...")]
    Diff(DiffOptions),

    /// Exit unsuccessfully if destination differs from the manifest.
    #[command(override_usage = "oxistate verify [options]")]
    Verify(VerifyOptions),

    /// Manage persistent state.
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ApplyCmdOptions {
    /// Target names to apply, everything if empty.
    #[arg(value_name = "target")]
    pub targets: Vec<String>,

    /// Entry types to apply, e.g., "files,dirs".
    #[arg(short, long, value_name = "types")]
    pub include: Option<IncludeSet>,

    /// Run scripts again even if they already ran.
    #[arg(long)]
    pub rerun_scripts: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DiffOptions {
    /// Target names to diff, everything if empty.
    #[arg(value_name = "target")]
    pub targets: Vec<String>,

    /// Entry types to diff, e.g., "files,dirs".
    #[arg(short, long, value_name = "types")]
    pub include: Option<IncludeSet>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct VerifyOptions {
    /// Entry types to verify, e.g., "files,dirs".
    #[arg(short, long, value_name = "types")]
    pub include: Option<IncludeSet>,
}

#[derive(Debug, Clone, Subcommand)]
enum StateCommand {
    /// Create persistent state file if it does not exist.
    Create,

    /// Print persistent state as JSON.
    Dump,

    /// Remove persistent state file.
    Reset,
}

struct Context {
    global: GlobalOptions,
    config: Config,
    dest_dir: PathBuf,
    state_file: PathBuf,
    manifest_file: PathBuf,
    umask: u32,
}

impl Context {
    fn load(global: GlobalOptions) -> Result<Self> {
        let config_file = match &global.config {
            Some(path) => path.clone(),
            None => default_config_file()?,
        };
        let config: Config = match fs::read_to_string(&config_file) {
            Ok(data) => data.parse()?,
            Err(err) if err.kind() == ErrorKind::NotFound && global.config.is_none() => {
                Config::default()
            }
            Err(err) => return Err(err.into()),
        };

        let dest_dir = match (&global.destination, &config.settings.dest_dir) {
            (Some(path), _) | (None, Some(path)) => path.clone(),
            (None, None) => home_dir()?,
        };
        let state_file = match (&config.settings.state_file, &global.config) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => path.with_file_name("oxistate.db"),
            (None, None) => default_state_file()?,
        };
        let manifest_file = match (&global.manifest, &global.config) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => path.with_file_name("manifest.toml"),
            (None, None) => default_manifest_file()?,
        };

        // INVARIANT: Read process umask while still single threaded.
        let umask = config
            .settings
            .umask
            .map_or_else(process_umask, |umask| umask.bits());

        Ok(Self {
            global,
            config,
            dest_dir,
            state_file,
            manifest_file,
            umask,
        })
    }


    fn keep_going(&self) -> bool {
        self.global.keep_going || self.config.settings.keep_going
    }

    fn options(&self, include: Option<IncludeSet>) -> ApplyOptions {
        ApplyOptions {
            include: include.unwrap_or(self.config.settings.include),
            umask: self.umask,
            verify: false,
            force_scripts: false,
        }
    }

    fn store(&self, read_only: bool) -> Result<SqlitePersistentState> {
        let options = SqliteOptions {
            timeout: self.config.settings.lock_timeout(),
            read_only,
        };
        Ok(SqlitePersistentState::new(&self.state_file, options)?)
    }

    fn real_system(&self, read_only: bool) -> Result<RealSystem> {
        let store = self.store(read_only)?;
        Ok(RealSystem::new(store).with_interpreters(self.config.interpreters()?))
    }

    fn reconciler(&self) -> Result<Reconciler<ManifestResolver>> {
        let resolver = ManifestResolver::load(&self.manifest_file)?;
        Ok(Reconciler::new(resolver)?.keep_going(self.keep_going()))
    }

    /// Layer decorators over `system` in a fixed order: dry run first, then
    /// diff, then debug.
    fn decorate(&self, system: Box<dyn System>, dry_run: bool, diff: bool) -> Box<dyn System> {
        let mut system = system;
        if dry_run {
            system = Box::new(DryRunSystem::new(system));
        }
        if diff {
            system = Box::new(GitDiffSystem::new(system, io::stdout(), &self.dest_dir));
        }
        if self.global.debug {
            system = Box::new(DebugSystem::new(system));
        }
        system
    }
}

fn main() {
    let debug = std::env::args().any(|arg| arg == "--debug");
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_apply(ctx: &Context, opts: ApplyCmdOptions) -> Result<()> {
    let dry_run = ctx.global.dry_run;
    let reconciler = ctx.reconciler()?;
    let real: Box<dyn System> = Box::new(ctx.real_system(dry_run)?);
    let system = ctx.decorate(real, dry_run, ctx.global.verbose);

    let options = ApplyOptions {
        verify: !dry_run,
        force_scripts: opts.rerun_scripts,
        ..ctx.options(opts.include)
    };
    let summary = if opts.targets.is_empty() {
        reconciler.apply_all(&system, &ctx.dest_dir, &options)?
    } else {
        reconciler.apply_names(&system, &ctx.dest_dir, opts.targets, &options)?
    };

    info!("{summary}");
    if !summary.is_success() {
        bail!("failed to apply {}", summary.failed.join(", "));
    }

    Ok(())
}

fn run_diff(ctx: &Context, opts: DiffOptions) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    let real: Box<dyn System> = Box::new(ctx.real_system(true)?);
    let system = ctx.decorate(real, true, true);

    let options = ctx.options(opts.include);
    if opts.targets.is_empty() {
        reconciler.apply_all(&system, &ctx.dest_dir, &options)?;
    } else {
        reconciler.apply_names(&system, &ctx.dest_dir, opts.targets, &options)?;
    }

    Ok(())
}

fn run_verify(ctx: &Context, opts: VerifyOptions) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    let real: Box<dyn System> = Box::new(ReadOnlySystem::new(ctx.real_system(true)?));
    let system = ctx.decorate(real, false, false);

    let differ = reconciler.verify_all(&system, &ctx.dest_dir, &ctx.options(opts.include))?;
    if !differ.is_empty() {
        for name in &differ {
            warn!("{name} differs from target state");
        }
        bail!("{} targets differ from target state", differ.len());
    }

    Ok(())
}

fn run_state_create(ctx: &Context) -> Result<()> {
    if let Some(parent) = ctx.state_file.parent() {
        mkdirp::mkdirp(parent)?;
    }

    ctx.store(false)?.open_or_create()?;
    info!("persistent state ready at {:?}", ctx.state_file.display());

    Ok(())
}

fn run_state_dump(ctx: &Context) -> Result<()> {
    let store = ctx.store(true)?;
    let data = json!({
        "entryState": state_data(&store, ENTRY_STATE_BUCKET)?,
        "scriptOnce": state_data(&store, SCRIPT_ONCE_STATE_BUCKET)?,
    });
    println!("{}", serde_json::to_string_pretty(&data)?);

    Ok(())
}

fn run_state_reset(ctx: &Context) -> Result<()> {
    let path = &ctx.state_file;
    if !ctx.global.force {
        let confirmed = Confirm::new(&format!("Remove persistent state {:?}?", path.display()))
            .with_default(false)
            .prompt()?;
        if !confirmed {
            info!("keeping persistent state");
            return Ok(());
        }
    }

    // INVARIANT: Hold the lock while removing, so no other run is using it.
    let store = ctx.store(false)?;
    match fs::remove_file(path) {
        Ok(()) => info!("removed persistent state {:?}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no persistent state at {:?}", path.display())
        }
        Err(err) => return Err(err.into()),
    }
    drop(store);

    Ok(())
}
