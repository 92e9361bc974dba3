mod cli;

use chunkstream::{config, library, probe, server, streaming};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // CLI flags win over the config file
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting chunkstream server");

    for tool in probe::check_tools(&config.tools) {
        if !tool.available {
            tracing::warn!("{} not found; streaming will not work without it", tool.name);
        }
    }

    let registry = Arc::new(streaming::StreamRegistry::new(
        config.streaming.clone(),
        probe::ffmpeg_path(&config.tools),
    ));

    let media_library = library::MediaLibrary::new(
        config.library.clone(),
        config.tools.clone(),
        Arc::clone(&registry),
    );
    media_library.start().await?;

    server::start_server(config, registry).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "chunkstream=trace,tower_http=debug".to_string()
        } else {
            "chunkstream=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => probe_file(&file, cli.config.as_deref(), json),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("chunkstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn probe_file(
    file: &std::path::Path,
    config_path: Option<&std::path::Path>,
    json: bool,
) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = config::load_config_or_default(config_path)?;
    let media_info = probe::probe_file(&config.tools, file)?;

    if json {
        let json_str = serde_json::to_string_pretty(&media_info)?;
        println!("{}", json_str);
    } else {
        println!("File: {}", file.display());

        let secs = media_info.duration_secs as u64;
        let mins = secs / 60;
        let hours = mins / 60;
        println!("Duration: {:02}:{:02}:{:02}", hours, mins % 60, secs % 60);

        if let Some(ref codec) = media_info.video_codec {
            println!("Video: {}", codec);
        }

        println!("\nAudio Tracks: {}", media_info.audio_tracks.len());
        for track in &media_info.audio_tracks {
            print!("  [{}] {}", track.index, track.codec);
            if let Some(ref lang) = track.language {
                print!(" ({})", lang);
            }
            if let Some(ref title) = track.title {
                print!(" \"{}\"", title);
            }
            println!();
        }
    }

    Ok(())
}

fn check_tools(config_path: Option<&std::path::Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = probe::check_tools(&config.tools);
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable streaming.");
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Library paths: {}", config.library.paths.len());
            println!("  Watch enabled: {}", config.library.watch);
            println!(
                "  Chunk duration: {}s",
                config.streaming.chunk_duration_secs
            );
            println!("  Max producers: {}", config.streaming.max_producers);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
