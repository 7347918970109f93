//! CLI entry point for mixsig
//!
//! Runs acquisitions and bus transfers against the simulated device and
//! prints a summary, optionally as JSON.
//!
//! # Usage
//!
//! ```bash
//! mixsig acquire --samples 1000 --frequency 1000
//! mixsig record --rate 100000
//! mixsig uart "hello"
//! mixsig --json i2c --address 0x50 --write 00 --read 4
//! mixsig config
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use mixsig_daq::config::MixsigConfig;
use mixsig_daq::instrument::{shared, AcquisitionMode, ChannelSelector, Instrument, InstrumentState};
use mixsig_daq::logging;
use mixsig_daq::protocol::i2c::I2cNak;
use mixsig_daq::sim::{I2cSlave, Signal, SimDevice, SimHandle};
use mixsig_daq::watch::StateWatcher;
use mixsig_daq::{Device, RecordStatus};

#[derive(Parser)]
#[command(name = "mixsig")]
#[command(about = "Mixed-signal acquisition and bus tool (simulated device)", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "mixsig.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Waveform {
    Sine,
    Square,
    Noise,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one triggered buffer
    Acquire {
        /// Samples per channel
        #[arg(long, default_value_t = 1000)]
        samples: usize,

        /// Enabled channels, starting at 0
        #[arg(long, default_value_t = 2)]
        channels: usize,

        /// Sample rate in Hz (defaults to the configured rate)
        #[arg(long)]
        rate: Option<f64>,

        /// Simulated input signal
        #[arg(long, value_enum, default_value = "sine")]
        signal: Waveform,

        /// Simulated signal frequency in Hz
        #[arg(long, default_value_t = 1000.0)]
        frequency: f64,
    },

    /// Stream in record mode and report loss
    Record {
        /// Sample rate in Hz
        #[arg(long, default_value_t = 100_000.0)]
        rate: f64,

        /// Recording time in ms (defaults to the configured duration)
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Send text over the looped-back UART
    Uart {
        text: String,
    },

    /// Write then read an I2C register file
    I2c {
        /// 7-bit slave address
        #[arg(long, value_parser = parse_address)]
        address: u8,

        /// Bytes to write, hex
        #[arg(long, default_value = "")]
        write: String,

        /// Bytes to read
        #[arg(long, default_value_t = 0)]
        read: usize,
    },

    /// Print the effective configuration (file plus environment)
    Config,
}

#[derive(Serialize)]
struct ChannelSummary {
    channel: usize,
    samples: usize,
    min: f64,
    max: f64,
    mean: f64,
}

#[derive(Serialize)]
struct AcquireSummary {
    state: InstrumentState,
    sample_rate: f64,
    auto_triggered: bool,
    channels: Vec<ChannelSummary>,
}

#[derive(Serialize)]
struct RecordSummary {
    polls: usize,
    total: RecordStatus,
}

#[derive(Serialize)]
struct UartSummary {
    sent: usize,
    received: String,
    parity_error: bool,
    framing_error: bool,
}

#[derive(Serialize)]
struct I2cSummary {
    address: u8,
    nak: Option<I2cNak>,
    rx: Vec<u8>,
}

fn parse_address(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("hex string '{s}' has an odd number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).with_context(|| format!("invalid hex '{s}'")))
        .collect()
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MixsigConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config.logging)?;

    let (backend, handle) = SimDevice::new();
    let device = Device::new(backend);
    info!(config = %cli.config.display(), "mixsig started");

    match cli.command {
        Commands::Acquire {
            samples,
            channels,
            rate,
            signal,
            frequency,
        } => {
            let signal = match signal {
                Waveform::Sine => Signal::sine(1.0, frequency),
                Waveform::Square => Signal::square(1.0, frequency),
                Waveform::Noise => Signal::Noise {
                    amplitude: 1.0,
                    seed: 1,
                },
            };
            acquire(&config, &device, handle, samples, channels, rate, signal, cli.json).await
        }
        Commands::Record { rate, duration_ms } => {
            let duration = duration_ms.map_or(config.record.duration(), Duration::from_millis);
            record(&config, &device, &handle, rate, duration, cli.json)
        }
        Commands::Uart { text } => uart(&config, &device, &text, cli.json),
        Commands::I2c {
            address,
            write,
            read,
        } => {
            handle.add_i2c_slave(I2cSlave::new(address).with_memory(0, &(0..=255).collect::<Vec<u8>>()));
            i2c(&config, &device, address, &parse_hex(&write)?, read, cli.json)
        }
        Commands::Config => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn acquire(
    config: &MixsigConfig,
    device: &Device,
    handle: SimHandle,
    samples: usize,
    channels: usize,
    rate: Option<f64>,
    signal: Signal,
    json: bool,
) -> Result<()> {
    let scope = shared(device.analog_in()?);
    let sample_rate = {
        let mut scope = scope.lock();
        config.analog_in.apply(&mut scope)?;
        scope.set_mode(AcquisitionMode::Single)?;
        if let Some(rate) = rate {
            scope.set_sample_rate(rate)?;
        }
        scope.set_buffer_size(samples)?;
        for ch in 0..scope.channel_count() {
            scope.set_channel_enable(ChannelSelector::Index(ch), ch < channels)?;
            handle.set_analog_signal(ch, signal.clone());
        }
        scope.configure(false, true)?;
        scope.sample_rate()
    };

    let watcher = StateWatcher::spawn(scope.clone(), Duration::from_millis(1), true);
    let step = Duration::from_secs_f64(samples as f64 / sample_rate / 10.0);
    let clock = tokio::spawn(async move {
        loop {
            handle.advance(step);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    let state = tokio::time::timeout(
        Duration::from_secs(10),
        watcher.wait_for(|state| state == InstrumentState::Done),
    )
    .await
    .context("acquisition did not finish")??;
    clock.abort();
    watcher.stop();

    let scope = scope.lock();
    let mut summary = AcquireSummary {
        state,
        sample_rate,
        auto_triggered: scope.auto_triggered(),
        channels: Vec::new(),
    };
    for ch in 0..channels.min(scope.channel_count()) {
        let data = scope.read_samples(ch, 0, samples)?.samples;
        let n = data.len().max(1) as f64;
        summary.channels.push(ChannelSummary {
            channel: ch,
            samples: data.len(),
            min: data.iter().copied().fold(f64::INFINITY, f64::min),
            max: data.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: data.iter().sum::<f64>() / n,
        });
    }

    emit(json, &summary, |s| {
        println!("{} at {:.0} Hz", s.state, s.sample_rate);
        for c in &s.channels {
            println!(
                "  ch{}: {} samples, min {:.4} V, max {:.4} V, mean {:.4} V",
                c.channel, c.samples, c.min, c.max, c.mean
            );
        }
    })
}

fn record(
    config: &MixsigConfig,
    device: &Device,
    handle: &SimHandle,
    rate: f64,
    duration: Duration,
    json: bool,
) -> Result<()> {
    let mut scope = device.analog_in()?;
    config.analog_in.apply(&mut scope)?;
    scope.set_mode(AcquisitionMode::Record)?;
    scope.set_sample_rate(rate)?;
    scope.configure(false, true)?;

    let interval = config.record.poll_interval();
    let mut total = RecordStatus::default();
    let mut polls = 0;
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        handle.advance(interval);
        elapsed += interval;
        scope.poll(true)?;
        let status = scope.record_status()?;
        total.available += status.available;
        total.lost += status.lost;
        total.corrupt += status.corrupt;
        polls += 1;
    }
    scope.stop()?;

    emit(json, &RecordSummary { polls, total }, |s| {
        println!(
            "{} polls: {} available, {} lost, {} corrupt",
            s.polls, s.total.available, s.total.lost, s.total.corrupt
        );
    })
}

fn uart(config: &MixsigConfig, device: &Device, text: &str, json: bool) -> Result<()> {
    let mut uart = device.uart()?;
    uart.set_rate(config.bus.uart_rate_hz)?;
    uart.set_pins(Some(0), Some(1))?;
    let sent = uart.tx(text.as_bytes(), config.bus.timeout())?;
    let rx = uart.rx(text.len())?;

    let summary = UartSummary {
        sent: sent.completed,
        received: String::from_utf8_lossy(&rx.bytes()).into_owned(),
        parity_error: rx.parity_error,
        framing_error: rx.framing_error,
    };
    emit(json, &summary, |s| {
        println!("sent {} bytes, received {:?}", s.sent, s.received);
    })
}

fn i2c(
    config: &MixsigConfig,
    device: &Device,
    address: u8,
    tx: &[u8],
    rx_count: usize,
    json: bool,
) -> Result<()> {
    let mut i2c = device.i2c()?;
    i2c.set_rate(config.bus.i2c_rate_hz)?;
    i2c.set_pins(2, 3)?;
    let outcome = i2c.write_then_read(address, tx, rx_count, config.bus.timeout())?;

    let summary = I2cSummary {
        address,
        nak: outcome.nak,
        rx: outcome.rx,
    };
    emit(json, &summary, |s| match s.nak {
        Some(nak) => println!("{:#04x}: NAK in {:?} at {}", s.address, nak.phase, nak.index),
        None => println!("{:#04x}: {:02x?}", s.address, s.rx),
    })
}
