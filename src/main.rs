//! Magick Stream - convert images through a streaming ImageMagick process.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use owo_colors::OwoColorize;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use magick_stream::args::{ConvertArgs, STDIO_SENTINEL};
use magick_stream::config::{ConfigError, ConfigLoader};
use magick_stream::files;
use magick_stream::stream::{ConvertError, ImageStream};

/// A `KEY` or `KEY=VALUE` flag from the command line.
#[derive(Debug, Clone)]
struct FlagArg {
    name: String,
    value: Option<String>,
}

fn parse_flag(raw: &str) -> Result<FlagArg, String> {
    let (name, value) = match raw.split_once('=') {
        Some((name, value)) => (name, Some(value.to_string())),
        None => (raw, None),
    };
    if name.is_empty() {
        return Err(format!("missing flag name in `{raw}`"));
    }
    Ok(FlagArg {
        name: name.to_string(),
        value,
    })
}

#[derive(Parser)]
#[command(
    name = "magick-stream",
    about = "Convert images through a streaming ImageMagick process",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Binary to run instead of the configured one.
    #[arg(long)]
    binary: Option<String>,

    /// Input file, or `-` for stdin.
    input: String,

    /// Output file, or `-` for stdout.
    output: String,

    /// Input format tag, e.g. `jpg`.
    #[arg(long)]
    input_format: Option<String>,

    /// Output format tag, e.g. `png`.
    #[arg(long)]
    output_format: Option<String>,

    /// Resize geometry, e.g. `200x200`.
    #[arg(long)]
    resize: Option<String>,

    /// Compression quality.
    #[arg(long)]
    quality: Option<u32>,

    /// Thumbnail geometry.
    #[arg(long)]
    thumbnail: Option<String>,

    /// Orient the image from its EXIF data.
    #[arg(long)]
    auto_orient: bool,

    /// Setting placed before the input (repeatable).
    #[arg(long = "set", value_name = "KEY[=VALUE]", value_parser = parse_flag)]
    settings: Vec<FlagArg>,

    /// Operation placed after the input, applied after the named options
    /// above (repeatable).
    #[arg(long = "op", value_name = "KEY[=VALUE]", value_parser = parse_flag)]
    operations: Vec<FlagArg>,

    /// Print the command line that would run, then exit.
    #[arg(long)]
    print_args: bool,
}

impl Cli {
    fn convert_args(&self) -> ConvertArgs {
        let mut args = ConvertArgs::new();
        for flag in &self.settings {
            args.push_setting(&flag.name, flag.value.clone());
        }
        if let Some(format) = &self.input_format {
            args.set_input_format(format);
        }
        if let Some(format) = &self.output_format {
            args.set_output_format(format);
        }
        if self.auto_orient {
            args = args.auto_orient();
        }
        if let Some(geometry) = &self.resize {
            args = args.resize(geometry);
        }
        if let Some(geometry) = &self.thumbnail {
            args = args.thumbnail(geometry);
        }
        if let Some(quality) = self.quality {
            args = args.quality(quality);
        }
        for flag in &self.operations {
            args.push_operation(&flag.name, flag.value.clone());
        }
        args
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    fn from_io(err: io::Error) -> Self {
        match ConvertError::from_io(&err) {
            Some(convert) => Self::Convert(convert.root().clone()),
            None => Self::Io(err),
        }
    }
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
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    if let Some(binary) = &cli.binary {
        loader = loader.binary(binary);
    }
    let config = loader.load()?;

    let args = cli.convert_args();
    let command = args.command_line(&config.binary);
    if cli.print_args {
        println!("{command}");
        return Ok(());
    }
    tracing::info!(command = %command, "Starting conversion");

    let stream = ImageStream::new(args, config);
    let bytes = match (cli.input.as_str(), cli.output.as_str()) {
        (STDIO_SENTINEL, STDIO_SENTINEL) => pipe_stdio(stream).await?,
        (input, STDIO_SENTINEL) => {
            let mut source = files::from_path(stream, input);
            let mut stdout = tokio::io::stdout();
            let bytes = tokio::io::copy(&mut source, &mut stdout)
                .await
                .map_err(CliError::from_io)?;
            stdout.flush().await?;
            bytes
        }
        (STDIO_SENTINEL, output) => {
            let mut sink = files::to_path(stream, output);
            let mut stdin = tokio::io::stdin();
            let copied = tokio::io::copy(&mut stdin, &mut sink).await;
            let bytes = sink.finish().await?;
            copied.map_err(CliError::from_io)?;
            bytes
        }
        (input, output) => files::convert_file(stream, input, output).await?,
    };

    tracing::info!(bytes, "Conversion complete");
    Ok(())
}

async fn pipe_stdio(stream: ImageStream) -> Result<u64, CliError> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let feed = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        tokio::io::copy(&mut stdin, &mut writer).await?;
        writer.shutdown().await
    });

    let mut stdout = tokio::io::stdout();
    let bytes = tokio::io::copy(&mut reader, &mut stdout)
        .await
        .map_err(CliError::from_io)?;
    stdout.flush().await?;

    feed.await
        .map_err(io::Error::from)?
        .map_err(CliError::from_io)?;
    Ok(bytes)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
