use {
  clap::Parser,
  eyre::{Context, Result, bail, eyre},
  mprof::{
    CallStackPattern, CallStackView, CsvSource, GroupId, JsonLinesWriter,
    LoadOptions, ProfileData, Snapshot, SnapshotStore, SnapshotStreamWriter,
    TraceLoader,
  },
  serde::Deserialize,
  std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::PathBuf,
  },
  tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "mprof")]
#[command(about = "load memory profiler traces and export their snapshots")]
struct Args {
  #[arg(help = "trace file; later parts are found as .m1, .m2, ...")]
  trace: PathBuf,

  #[arg(short, long, help = "load options and group rules (toml format)")]
  config: Option<PathBuf>,

  #[arg(short, long, help = "print every snapshot")]
  list: bool,

  #[arg(long, value_name = "FILE", help = "write a snapshot as csv")]
  csv: Option<PathBuf>,

  #[arg(
    long,
    value_name = "N",
    help = "snapshot exported by --csv and --pprof (default: last)"
  )]
  snapshot: Option<usize>,

  #[arg(long, requires = "csv", help = "export lifetime totals to csv")]
  lifetime: bool,

  #[arg(long, value_name = "FILE", help = "write every snapshot as json lines")]
  json: Option<PathBuf>,

  #[arg(long, value_name = "FILE", help = "write a snapshot as pprof")]
  pprof: Option<PathBuf>,

  #[arg(
    long,
    num_args = 2,
    value_names = ["A", "B"],
    help = "print the json diff between two snapshots"
  )]
  diff: Option<Vec<usize>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
  group: Vec<GroupRule>,
  #[serde(flatten)]
  load: LoadOptions,
}

#[derive(Debug, Deserialize)]
struct GroupRule {
  functions: Vec<String>,
  name: String,
}

/// Matches a callstack when any frame's function contains a listed substring.
struct FunctionPattern {
  functions: Vec<String>,
  group: GroupId,
}

impl CallStackPattern for FunctionPattern {
  fn group(&self) -> GroupId {
    self.group
  }

  fn matches(&self, view: &CallStackView<'_>) -> bool {
    view.frames().any(|frame| {
      frame.function.is_some_and(|function| {
        self
          .functions
          .iter()
          .any(|needle| function.contains(needle.as_str()))
      })
    })
  }
}

fn load_config(path: Option<&PathBuf>) -> Result<CliConfig> {
  let Some(path) = path else {
    return Ok(CliConfig::default());
  };

  let text = fs::read_to_string(path)
    .with_context(|| format!("failed to read config path={}", path.display()))?;

  toml::from_str(&text)
    .with_context(|| format!("failed to parse config path={}", path.display()))
}

fn select(profile: &ProfileData, index: Option<usize>) -> Result<&Snapshot> {
  match index {
    Some(index) => profile.snapshot(index).ok_or_else(|| {
      eyre!(
        "snapshot {index} out of range, trace has {}",
        profile.snapshots.len()
      )
    }),
    None => profile
      .snapshots
      .last()
      .ok_or_else(|| eyre!("trace produced no snapshots")),
  }
}

fn list(profile: &ProfileData, groups: &[String]) -> Result<()> {
  let mut stdout = io::stdout().lock();

  for (index, snapshot) in profile.snapshots.iter().enumerate() {
    writeln!(
      stdout,
      "{index:>4}  {:<40} live={}B count={} events={} stream={}",
      snapshot.description(),
      snapshot.live_bytes(),
      snapshot.live_count(),
      snapshot.allocation_events(),
      snapshot.identity().stream_index,
    )?;
  }

  let anomalies = &profile.anomalies;

  writeln!(
    stdout,
    "anomalies: double_mallocs={} unmatched_frees={} out_of_range={} \
     cross_pool={} unresolved={}",
    anomalies.double_mallocs,
    anomalies.unmatched_frees,
    anomalies.out_of_range_callstacks,
    anomalies.cross_pool_callstacks,
    anomalies.unresolved_symbols,
  )?;

  if !groups.is_empty() {
    writeln!(
      stdout,
      "groups: {} configured, {} callstacks ungrouped",
      groups.len(),
      profile.ungrouped
    )?;
  }

  Ok(())
}

fn main() -> Result<()> {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let config = load_config(args.config.as_ref())?;

  let group_names = config
    .group
    .iter()
    .map(|rule| rule.name.clone())
    .collect::<Vec<_>>();

  let mut builder = TraceLoader::builder()
    .options(config.load)
    .fallback_group(GroupId(0));

  for (index, rule) in config.group.into_iter().enumerate() {
    let group = GroupId(u32::try_from(index + 1)?);
    builder = builder.pattern(FunctionPattern {
      functions: rule.functions,
      group,
    });
  }

  let mut loader = builder.finish();

  let token = loader.cancellation_token();
  ctrlc::set_handler(move || {
    tracing::info!("received ctrl+c, cancelling load");
    token.cancel();
  })?;

  let outcome = loader
    .load_file(&args.trace)
    .with_context(|| format!("failed to load {}", args.trace.display()))?;

  let Some(profile) = outcome.into_profile() else {
    bail!("load cancelled");
  };

  if args.list {
    list(&profile, &group_names)?;
  }

  if let Some(path) = &args.csv {
    let snapshot = select(&profile, args.snapshot)?;

    let source = if args.lifetime {
      CsvSource::Lifetime
    } else {
      CsvSource::Active
    };

    let writer = BufWriter::new(File::create(path)?);
    profile
      .context
      .with_symbols(|symbols| snapshot.export_csv(source, symbols, writer))?;
  }

  if let Some(path) = &args.json {
    let mut writer = JsonLinesWriter::new(BufWriter::new(File::create(path)?));

    profile.context.with_symbols(|symbols| {
      profile
        .snapshots
        .iter()
        .try_for_each(|snapshot| writer.write_snapshot(snapshot, symbols))
    })?;

    writer.into_inner().flush()?;
  }

  if let Some(path) = &args.pprof {
    let snapshot = select(&profile, args.snapshot)?;
    let writer = BufWriter::new(File::create(path)?);

    profile
      .context
      .with_symbols(|symbols| snapshot.export_pprof(symbols, writer))?;
  }

  if let Some(indices) = &args.diff {
    let [older, newer] = indices.as_slice() else {
      bail!("--diff takes exactly two snapshot indices");
    };

    let diff = SnapshotStore::diff(
      select(&profile, Some(*older))?,
      select(&profile, Some(*newer))?,
    );

    let mut stdout = io::stdout().lock();
    profile
      .context
      .with_symbols(|symbols| diff.export_json(symbols, &mut stdout))?;
    writeln!(stdout)?;
  }

  Ok(())
}
