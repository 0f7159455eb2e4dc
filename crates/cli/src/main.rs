use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clipdiary_core::config::CropConfig;
use clipdiary_core::db::SqliteMomentStorage;
use clipdiary_core::media::FfmpegMedia;
use clipdiary_core::pipeline::{MediaOps, ProcessingPipeline};
use clipdiary_core::store::MomentStore;
use clipdiary_core::timefmt::{format_clock, format_seconds};
use clipdiary_core::validate::SelectionValidator;
use clipdiary_core::workflow::{WorkflowController, WorkflowEvent, WorkflowStage};
use clipdiary_core::{Error, Moment, MomentPatch, ProcessingStage, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const COMMON_VALUE_FLAGS: &[&str] = &["--db", "--config"];

fn main() {
    init_tracing();
    if let Err(err) = real_main() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clipdiary=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(env_filter)
            .init();
    }
}

fn real_main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "probe" => {
            let parsed = parse_args(args, &[], &[])?;
            let env = Env::load(&parsed)?;
            let path = PathBuf::from(parsed.positional(0, "<file>")?);
            let asset = env.media().probe_asset(&path)?;
            println!("{}", serde_json::to_string_pretty(&asset)?);
            match SelectionValidator::new(&env.config).validate(&asset) {
                Ok(video) => println!(
                    "accepted: {} ({})",
                    format_clock(video.duration_secs),
                    video.mime_type
                ),
                Err(reason) => println!("rejected: {reason}"),
            }
            Ok(())
        }
        "add" => {
            let parsed = parse_args(
                args,
                &[
                    "--input",
                    "--name",
                    "--description",
                    "--start",
                    "--position",
                    "--out-dir",
                ],
                &[],
            )?;
            let env = Env::load(&parsed)?;
            let request = AddRequest::from_args(&parsed)?;
            let mut store = env.open_store()?;
            let moment = add_moment(&env, &mut store, &request)?;
            print_moment(&moment);
            Ok(())
        }
        "list" => {
            let parsed = parse_args(args, &[], &["--json"])?;
            let env = Env::load(&parsed)?;
            let store = env.open_store()?;
            print_moments(store.list()?, parsed.has("--json"))
        }
        "search" => {
            let parsed = parse_args(args, &[], &["--json"])?;
            let env = Env::load(&parsed)?;
            let store = env.open_store()?;
            let found = store.search(parsed.positional(0, "<query>")?)?;
            print_moments(&found, parsed.has("--json"))
        }
        "show" => {
            let parsed = parse_args(args, &[], &["--json"])?;
            let env = Env::load(&parsed)?;
            let store = env.open_store()?;
            let moment = store.get_by_id(parsed.positional(0, "<id>")?)?;
            if parsed.has("--json") {
                println!("{}", serde_json::to_string_pretty(moment)?);
            } else {
                print_moment(moment);
            }
            Ok(())
        }
        "rename" | "describe" => {
            let parsed = parse_args(args, &[], &[])?;
            let env = Env::load(&parsed)?;
            let id = parsed.positional(0, "<id>")?;
            let text = parsed.positional(1, "<text>")?.to_string();
            let patch = if cmd == "rename" {
                MomentPatch {
                    name: Some(text),
                    description: None,
                }
            } else {
                MomentPatch {
                    name: None,
                    description: Some(text),
                }
            };
            let mut store = env.open_store()?;
            let moment = store.update(id, &patch)?;
            print_moment(moment);
            Ok(())
        }
        "delete" => {
            let parsed = parse_args(args, &["--out-dir"], &["--keep-files"])?;
            let env = Env::load(&parsed)?;
            let mut store = env.open_store()?;
            let moment = store.remove(parsed.positional(0, "<id>")?)?;
            if !parsed.has("--keep-files") {
                let media = env.media();
                let files = std::iter::once(&moment.cropped_uri)
                    .chain(moment.thumbnail_uri.as_ref());
                for uri in files {
                    if let Err(err) = media.remove_artifact(uri) {
                        warn!(uri = %uri, error = %err, "could not remove file");
                    }
                }
            }
            println!("deleted {} ({})", moment.id, moment.name);
            Ok(())
        }
        _ => Err(Error::InvalidArgument(format!("unknown command: {cmd}"))),
    }
}

fn print_help() {
    println!(
        r#"clipdiary

USAGE:
  clipdiary probe <file>
  clipdiary add --input <file> --name <text> [--description <text>]
                [--start <secs> | --position <px>] [--out-dir <dir>]
  clipdiary list [--json]
  clipdiary search <query> [--json]
  clipdiary show <id> [--json]
  clipdiary rename <id> <name>
  clipdiary describe <id> <text>
  clipdiary delete <id> [--keep-files] [--out-dir <dir>]

Every command accepts --db <sqlite_path> and --config <json_path>.

NOTES:
  - A moment is a fixed-length clip (5s by default) cut from a longer video.
  - --position is a pixel offset on the crop track (300px wide by default).
  - Trimming and thumbnails need ffmpeg and ffprobe on PATH.
  - Set RUST_LOG to change verbosity and LOG_FORMAT=json for JSON logs.
"#
    );
}

/// Resolved paths and configuration for one invocation.
struct Env {
    config: CropConfig,
    db: PathBuf,
    out_dir: PathBuf,
}

impl Env {
    fn load(parsed: &Parsed) -> Result<Self> {
        let config = match parsed.value("--config") {
            Some(path) => CropConfig::load(Path::new(path))?,
            None => {
                let default = data_dir().join("config.json");
                if default.is_file() {
                    CropConfig::load(&default)?
                } else {
                    CropConfig::default()
                }
            }
        };

        Ok(Self {
            config,
            db: parsed
                .value("--db")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir().join("moments.db")),
            out_dir: parsed
                .value("--out-dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir().join("clips")),
        })
    }

    fn media(&self) -> FfmpegMedia {
        FfmpegMedia::from_config(&self.out_dir, &self.config)
    }

    fn open_store(&self) -> Result<MomentStore<SqliteMomentStorage>> {
        let mut store = MomentStore::new(SqliteMomentStorage::open(&self.db)?);
        store.initialize()?;
        Ok(store)
    }
}

fn data_dir() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("clipdiary");
    path
}

enum Placement {
    Start,
    Seconds(f64),
    Pixels(f64),
}

struct AddRequest {
    input: PathBuf,
    name: String,
    description: String,
    placement: Placement,
}

impl AddRequest {
    fn from_args(parsed: &Parsed) -> Result<Self> {
        let input = parsed
            .value("--input")
            .map(PathBuf::from)
            .ok_or_else(|| Error::InvalidArgument("missing --input <file>".to_string()))?;
        let name = parsed
            .value("--name")
            .ok_or_else(|| Error::InvalidArgument("missing --name <text>".to_string()))?
            .to_string();
        let placement = match (parsed.value("--start"), parsed.value("--position")) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument(
                    "--start and --position are mutually exclusive".to_string(),
                ))
            }
            (Some(secs), None) => Placement::Seconds(parse_number("--start", secs)?),
            (None, Some(px)) => Placement::Pixels(parse_number("--position", px)?),
            (None, None) => Placement::Start,
        };
        Ok(Self {
            input,
            name,
            description: parsed.value("--description").unwrap_or("").to_string(),
            placement,
        })
    }
}

/// Runs one crop session from selection to the saved moment.
fn add_moment(
    env: &Env,
    store: &mut MomentStore<SqliteMomentStorage>,
    request: &AddRequest,
) -> Result<Moment> {
    let media = Arc::new(env.media());
    let asset = media.probe_asset(&request.input)?;
    let pipeline = Arc::new(ProcessingPipeline::new(
        media,
        env.config.thumbnail_quality,
    ));
    let mut workflow = WorkflowController::new(env.config.clone(), pipeline);

    workflow.select(&asset)?;
    if let Some(segment) = workflow.segment_mut() {
        let placed = match request.placement {
            Placement::Start => true,
            Placement::Seconds(secs) => {
                secs >= 0.0 && segment.drag_to(segment.time_to_pixel(secs))
            }
            Placement::Pixels(px) => segment.drag_to(px),
        };
        if !placed {
            return Err(Error::InvalidArgument(
                "crop position must be a non-negative number".to_string(),
            ));
        }
    }
    let crop = workflow.confirm_crop()?;
    eprintln!(
        "cropping {} - {} of {}",
        format_clock(crop.start_time_secs),
        format_clock(crop.end_time_secs),
        request.input.display()
    );

    workflow.submit(&request.name, &request.description)?;
    while workflow.stage() == WorkflowStage::Processing {
        for event in workflow.wait(store, Duration::from_millis(250)) {
            match event {
                WorkflowEvent::Progress(fraction) => eprintln!(
                    "{:>3}% {}",
                    (fraction * 100.0).round(),
                    ProcessingStage::from_progress(fraction).label()
                ),
                WorkflowEvent::Committed(moment) => {
                    info!(id = %moment.id, "moment added");
                    return Ok(moment);
                }
                WorkflowEvent::Failed(failure) => {
                    workflow.cancel()?;
                    return Err(failure.into());
                }
            }
        }
    }
    Err(Error::Cancelled)
}

fn parse_number(flag: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::InvalidArgument(format!("{flag} expects a number, got {raw}")))
}

fn print_moments(moments: &[Moment], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(moments)?);
        return Ok(());
    }
    if moments.is_empty() {
        println!("no moments");
        return Ok(());
    }
    for moment in moments {
        println!(
            "{}  {}  {:>6}  {}  {}",
            moment.id,
            moment.created_at.format("%Y-%m-%d %H:%M"),
            format_seconds(moment.duration_secs()),
            format_clock(moment.start_time_secs),
            moment.name
        );
    }
    Ok(())
}

fn print_moment(moment: &Moment) {
    println!("id:          {}", moment.id);
    println!("name:        {}", moment.name);
    if !moment.description.is_empty() {
        println!("description: {}", moment.description);
    }
    println!(
        "range:       {} - {} ({})",
        format_clock(moment.start_time_secs),
        format_clock(moment.end_time_secs),
        format_seconds(moment.duration_secs())
    );
    println!("source:      {}", moment.original_uri);
    println!("clip:        {}", moment.cropped_uri);
    if let Some(thumb) = &moment.thumbnail_uri {
        println!("thumbnail:   {thumb}");
    }
    println!("created:     {}", moment.created_at.to_rfc3339());
}

/// Flag values, switches and positionals of one command line.
#[derive(Debug, Default)]
struct Parsed {
    positional: Vec<String>,
    values: Vec<(String, String)>,
    switches: Vec<String>,
}

impl Parsed {
    fn value(&self, flag: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(name, _)| name == flag)
            .map(|(_, value)| value.as_str())
    }

    fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|s| s == switch)
    }

    fn positional(&self, index: usize, what: &str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Error::InvalidArgument(format!("missing {what}")))
    }
}

fn parse_args(
    mut args: impl Iterator<Item = String>,
    value_flags: &[&str],
    switches: &[&str],
) -> Result<Parsed> {
    let mut parsed = Parsed::default();
    while let Some(arg) = args.next() {
        let flag = arg.as_str();
        if COMMON_VALUE_FLAGS.contains(&flag) || value_flags.contains(&flag) {
            let value = args
                .next()
                .ok_or_else(|| Error::InvalidArgument(format!("{arg} expects a value")))?;
            parsed.values.push((arg, value));
        } else if switches.contains(&flag) {
            parsed.switches.push(arg);
        } else if flag.starts_with("--") {
            return Err(Error::InvalidArgument(format!("unknown arg: {arg}")));
        } else {
            parsed.positional.push(arg);
        }
    }
    Ok(parsed)
}
