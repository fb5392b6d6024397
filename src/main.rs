//! Shape Supervisor - run a text-to-3D generator and follow its progress.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shape_supervisor::config::{ConfigLoader, SupervisorConfig};
use shape_supervisor::display;
use shape_supervisor::protocol::{GenerationParameters, LineClassifier};
use shape_supervisor::supervisor::{LineSplitter, ProcessManager, SupervisorEvent};

#[derive(Parser)]
#[command(
    name = "shape-supervisor",
    about = "Run a text-to-3D generator and follow its progress",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GenerationArgs {
    /// Text prompt describing the shape.
    prompt: String,
    /// Directory the generator writes its assets to.
    #[arg(short, long, default_value = "")]
    output_dir: String,
    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 15.0)]
    guidance_scale: f32,
    /// Number of sampling steps.
    #[arg(long, default_value_t = 64)]
    karras_steps: u32,
    /// Run the model in full precision.
    #[arg(long)]
    no_fp16: bool,
}

impl GenerationArgs {
    fn into_params(self) -> GenerationParameters {
        GenerationParameters::new(self.prompt)
            .output_directory(self.output_dir)
            .guidance_scale(self.guidance_scale)
            .karras_steps(self.karras_steps)
            .use_fp16(!self.no_fp16)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the generator and stream its events until it finishes.
    Run {
        /// Generator executable, or the script next to the configured launcher.
        executable: PathBuf,
        #[command(flatten)]
        generation: GenerationArgs,
        /// Launcher file name resolved next to the executable path.
        #[arg(long)]
        launcher: Option<String>,
        /// Show full messages without truncation.
        #[arg(long)]
        raw: bool,
    },
    /// Print the launch argument blob for a set of parameters.
    Encode {
        #[command(flatten)]
        generation: GenerationArgs,
        /// Print the JSON document instead of the base64 blob.
        #[arg(long)]
        json: bool,
    },
    /// Classify generator output read from a file or stdin.
    Classify {
        /// File with captured output; stdin when omitted.
        file: Option<PathBuf>,
        /// Show full lines without truncation.
        #[arg(long)]
        raw: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Option<SupervisorConfig> {
    let loaded = match path {
        Some(path) => ConfigLoader::load_from_path(path),
        None => ConfigLoader::new().load(),
    };
    match loaded {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            display::print_error(&e.to_string(), "ConfigError");
            None
        }
    }
}

async fn run(
    config: SupervisorConfig,
    executable: PathBuf,
    params: GenerationParameters,
    raw: bool,
) -> ExitCode {
    let (manager, mut pump) = match ProcessManager::new(config) {
        Ok(pair) => pair,
        Err(e) => {
            display::print_error(&e.to_string(), e.kind());
            return ExitCode::FAILURE;
        }
    };
    manager
        .subscribers()
        .subscribe_all(move |event| display::print_event(event, raw));

    let session = match manager.launch(&executable, &params) {
        Ok(session) => session,
        Err(_) => {
            // The failure was posted as an Error event.
            pump.drain();
            return ExitCode::FAILURE;
        }
    };
    display::print_launch(
        session,
        &manager.resolve_executable(&executable),
        manager.current_pid(),
    );

    let mut completed = false;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = pump.next() => match event {
                Some(SupervisorEvent::Complete { .. }) => completed = true,
                Some(SupervisorEvent::ProcessFinished) | None => break,
                Some(_) => {}
            },
            result = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                tracing::warn!(session = %session, "Interrupted, stopping generator");
                interrupted = true;
                manager.request_stop();
            }
        }
    }

    tracing::info!(session = %session, completed, interrupted, "Session ended");
    if completed && !interrupted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn encode(params: &GenerationParameters, json: bool) -> ExitCode {
    let rendered = if json {
        params.to_json()
    } else {
        params.encode()
    };
    match rendered {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            display::print_error(&e.to_string(), "InvalidParameters");
            ExitCode::FAILURE
        }
    }
}

fn classify(config: SupervisorConfig, file: Option<&PathBuf>, raw: bool) -> ExitCode {
    let read = match file {
        Some(path) => std::fs::read(path),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).map(|_| buf)
        }
    };
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(e) => {
            display::print_error(&e.to_string(), "ReadError");
            return ExitCode::FAILURE;
        }
    };

    let classifier = LineClassifier::new(config.progress);
    let mut splitter = LineSplitter::new();
    let mut lines = splitter.push(&bytes);
    lines.extend(splitter.finish());

    for line in lines.iter().filter(|line| !line.trim().is_empty()) {
        for event in classifier.classify(line) {
            display::print_classified(&event, raw);
        }
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(mut config) = load_config(cli.config.as_ref()) else {
        return ExitCode::FAILURE;
    };

    match cli.command {
        Commands::Run {
            executable,
            generation,
            launcher,
            raw,
        } => {
            if launcher.is_some() {
                config.launcher = launcher;
            }
            let params = generation.into_params();
            tracing::info!(
                executable = %executable.display(),
                prompt = %params.prompt,
                karras_steps = params.karras_steps,
                "Starting shape supervisor"
            );
            run(config, executable, params, raw).await
        }
        Commands::Encode { generation, json } => encode(&generation.into_params(), json),
        Commands::Classify { file, raw } => classify(config, file.as_ref(), raw),
    }
}
