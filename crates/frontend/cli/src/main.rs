use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use nesboy_core::logging::{LogCategory, LogLevel, LogSink, Logger};
use nesboy_core::types::Frame;
use nesboy_core::System;
use nesboy_nes::{Cartridge, ClockRatio, MachineConfig, NesSystem};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Run an iNES ROM headlessly for a number of frames.
#[derive(Parser)]
#[command(name = "nesboy", version)]
struct Args {
    /// Path to an iNES (.nes) image
    rom: PathBuf,

    /// Number of frames to run
    #[arg(long, default_value_t = 5)]
    frames: u32,

    /// JSON machine config (clock ratio and log levels)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Global core log level: off, error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Override the level for CPU events
    #[arg(long)]
    log_cpu: Option<LogLevel>,

    /// Override the level for PPU events
    #[arg(long)]
    log_ppu: Option<LogLevel>,

    /// Append core log lines to this file instead of the log facade
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// PPU dots per CPU cycle (or per instruction with --per-instruction)
    #[arg(long)]
    clock_ratio: Option<u32>,

    /// Tick the PPU a fixed number of dots per instruction
    #[arg(long, default_value_t = false)]
    per_instruction: bool,

    /// Write the last frame as a greyscale PNG
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Print the machine's debug state after every frame
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Suppress all per-frame output
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("nesboy=trace"))
        .init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let cart = Cartridge::from_file(&args.rom)
        .with_context(|| format!("loading {}", args.rom.display()))?;

    let sink: Box<dyn LogSink> = match &args.log_file {
        Some(path) => Box::new(
            Logger::to_file(config.log.clone(), path)
                .with_context(|| format!("opening log file {}", path.display()))?,
        ),
        None => Box::new(Logger::new(config.log.clone())),
    };
    let mut sys = NesSystem::from_cartridge_with_sink(&cart, config, sink);

    let mut last: Option<Frame> = None;
    for fnum in 1..=args.frames {
        let frame = sys.step_frame()?;
        if args.debug && !args.quiet {
            println!(
                "DEBUG STATE (frame {}):\n{}",
                fnum,
                serde_json::to_string_pretty(&sys.debug_state())?
            );
        }
        last = Some(frame);
    }

    if !args.quiet {
        info!(
            "ran {} frames, {} CPU cycles",
            args.frames,
            sys.cpu().cycles
        );
    }

    if let Some(path) = &args.screenshot {
        match &last {
            Some(frame) => write_png(frame, path)
                .with_context(|| format!("writing screenshot {}", path.display()))?,
            None => warn!("no frames were run, skipping screenshot"),
        }
    }

    Ok(())
}

/// Config file first, then command-line overrides on top.
fn build_config(args: &Args) -> Result<MachineConfig> {
    let mut config = match &args.config {
        Some(path) => MachineConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => MachineConfig::default(),
    };

    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(level) = args.log_cpu {
        config.log.set_level(LogCategory::Cpu, level);
    }
    if let Some(level) = args.log_ppu {
        config.log.set_level(LogCategory::Ppu, level);
    }

    if args.per_instruction {
        config.clock = ClockRatio::PerInstruction(args.clock_ratio.unwrap_or(1));
    } else if let Some(n) = args.clock_ratio {
        config.clock = ClockRatio::PerCpuCycle(n);
    }
    if config.clock.ppu_ticks(2) == 0 {
        anyhow::bail!("clock ratio must be at least 1");
    }
    Ok(config)
}

/// Palette indices (0..=0x1F) stretched over the 8-bit grey range.
fn greyscale(frame: &Frame) -> Vec<u8> {
    frame.pixels.iter().map(|&p| (p & 0x1F) << 3).collect()
}

fn write_png(frame: &Frame, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), frame.width, frame.height);
    encoder.set_color(png::ColorType::Grayscale);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&greyscale(frame))?;
    Ok(())
}
