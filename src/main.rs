use clap::{Parser, Subcommand};
use ondine::engine::Engine;
use ondine::pattern::PatternCompiler;
use ondine::scheduler::{task_fn, ReArm};
use ondine::EngineConfig;
use std::error::Error;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "ondine", about = "Temporal engine for live coding")]
struct Cli {
    /// Path to a JSON engine config.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine, evaluating a pattern once per beat.
    Play {
        /// Mini-notation pattern source.
        pattern: String,
        /// Override the configured tempo.
        #[arg(short, long)]
        tempo: Option<f64>,
    },
    /// Compile a pattern a few times and print the draws.
    Compile {
        pattern: String,
        /// Seed the random stream for reproducible draws.
        #[arg(short, long)]
        seed: Option<u64>,
        /// How many evaluations to print.
        #[arg(short = 'n', long, default_value_t = 4)]
        count: usize,
    },
    /// Validate a config file and print the effective settings.
    CheckConfig,
}

fn load_config(path: &Option<PathBuf>) -> Result<EngineConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Play { pattern, tempo } => {
            if let Some(bpm) = tempo {
                config.bpm = bpm;
            }
            config.validate()?;

            let engine = Engine::new(&config)?;
            let handle = engine.handle();

            let mut compiler = PatternCompiler::new();
            let source = pattern.clone();
            handle.schedule(
                "player",
                Vec::new(),
                task_fn(move |ctx| {
                    let values = compiler.compile(&source);
                    let next = ctx.next_beat_tick();
                    async move {
                        let values = values?;
                        let rendered: Vec<String> =
                            values.iter().map(|v| v.to_string()).collect();
                        info!(
                            tick = ctx.tick(),
                            beat = %format!("{:.2}", ctx.beat()),
                            "{}",
                            rendered.join(" ")
                        );
                        Ok(Some(ReArm::at(next)))
                    }
                }),
            );

            info!(pattern = %pattern, bpm = config.bpm, "playing, Ctrl-C to stop");
            engine.run();
        }
        Commands::Compile {
            pattern,
            seed,
            count,
        } => {
            let mut compiler = match seed {
                Some(seed) => PatternCompiler::with_seed(seed),
                None => PatternCompiler::new(),
            };
            for i in 0..count {
                let values = compiler.compile(&pattern)?;
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                println!("{:>3}: {}", i, rendered.join(" "));
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
