//! CLI entry point for flex_daq.
//!
//! # Usage
//!
//! Start simulated instruments on their default ports:
//! ```bash
//! flexctl simulate
//! ```
//!
//! Talk to them:
//! ```bash
//! flexctl ping lockin
//! flexctl amp set 3 --gain 100 --shunt 5k
//! flexctl sweep --channel 2 --start 0 --stop 0.1 --duration 20
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flex_daq::config::FlexConfig;
use flex_daq::instrument::{
    ChannelUpdate, CommandSet, InstrumentClient, Kh7008, LockinQuantity, MultichannelLockin, Ppms,
    StateRequest,
};
use flex_daq::session::SessionContext;
use flex_daq::sim::{self, SimulatedAmplifier, SimulatedCryostat, SimulatedLockin};
use flex_daq::sweep::{SweepChannel, SweepConfig, SweepCoordinator, SweepPattern};
use flex_daq::transport::{socket_address, TransportClient};
use flex_daq::{logging, validator};
use tracing::info;

#[derive(Parser)]
#[command(name = "flexctl")]
#[command(about = "Instrument control and sweep coordination", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = flex_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Device {
    Amplifier,
    Lockin,
    Cryostat,
}

#[derive(Subcommand)]
enum Commands {
    /// Handshake with an instrument and check its command set
    Ping { device: Device },

    /// Ask an instrument for help on all commands or one command
    Help {
        device: Device,
        command: Option<String>,
    },

    /// KH7008 amplifier
    Amp {
        #[command(subcommand)]
        action: AmpAction,
    },

    /// Multichannel lock-in
    Lockin {
        #[command(subcommand)]
        action: LockinAction,
    },

    /// PPMS temperature
    Temp {
        #[command(subcommand)]
        action: TempAction,
    },

    /// Run one timed sweep on the lock-in
    Sweep {
        /// AO channel to sweep
        #[arg(long)]
        channel: u32,
        /// Start value (V)
        #[arg(long)]
        start: f64,
        /// End value (V)
        #[arg(long)]
        stop: f64,
        /// Sweep length in seconds
        #[arg(long)]
        duration: f64,
        /// ramp, smooth-ramp or table
        #[arg(long, default_value = "ramp")]
        pattern: SweepPattern,
        /// Setpoints for the table pattern, comma separated
        #[arg(long, value_delimiter = ',')]
        table: Vec<f64>,
        /// Hold at the start value first, in seconds
        #[arg(long, default_value_t = 0.0)]
        initial_wait: f64,
        /// Return the output to its start value afterwards
        #[arg(long)]
        return_to_start: bool,
        /// Overall timeout in seconds (default: length plus configured margin)
        #[arg(long)]
        timeout: Option<f64>,
        /// Record the sweep in a session run by this user
        #[arg(long)]
        user: Option<String>,
        /// Session notes
        #[arg(long, default_value = "")]
        notes: String,
        /// Print the waveforms as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve simulated instruments on their configured addresses
    Simulate,

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum AmpAction {
    /// Show one channel
    Get { channel: i64 },
    /// Show all channels
    All,
    /// Change some fields of one channel
    Set {
        channel: i64,
        #[arg(long)]
        gain: Option<i64>,
        #[arg(long)]
        input: Option<String>,
        /// Ohms; suffixes k and M are accepted
        #[arg(long, value_parser = parse_shunt)]
        shunt: Option<i64>,
        #[arg(long)]
        couple: Option<String>,
        #[arg(long)]
        filter: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockinAction {
    /// Show the acquisition state
    State,
    /// Request acquisition start
    Start,
    /// Request stop
    Stop,
    /// Show one lock-in result
    Result {
        channel: u32,
        /// Mean, X, Y, R or Theta
        quantity: LockinQuantity,
        #[arg(long, default_value_t = 1)]
        reference: u32,
    },
    /// Show one analog output
    Ao { channel: u32 },
}

#[derive(Subcommand)]
enum TempAction {
    /// Show temperature and field
    Get,
    /// Ramp to a temperature
    Set {
        kelvin: f64,
        /// K/min
        #[arg(long, default_value_t = 10.0)]
        rate: f64,
        /// Wait until the temperature is reached
        #[arg(long)]
        wait: bool,
    },
}

fn parse_shunt(value: &str) -> Result<i64, String> {
    validator::parse_integer_with_suffix(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlexConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Ping { device } => ping(&config, device).await,
        Commands::Help { device, command } => help(&config, device, command.as_deref()).await,
        Commands::Amp { action } => amp(&config, action).await,
        Commands::Lockin { action } => lockin(&config, action).await,
        Commands::Temp { action } => temp(&config, action).await,
        Commands::Sweep {
            channel,
            start,
            stop,
            duration,
            pattern,
            table,
            initial_wait,
            return_to_start,
            timeout,
            user,
            notes,
            json,
        } => {
            let sweep_channel = match pattern {
                SweepPattern::Table => SweepChannel::table(channel, table),
                other => SweepChannel::ramp(channel, start, stop).with_pattern(other),
            };
            let program = SweepConfig::new(seconds(duration)?)
                .channel(sweep_channel)
                .initial_wait(seconds(initial_wait)?)
                .return_to_start(return_to_start);
            let timeout = match timeout {
                Some(t) => seconds(t)?,
                None => config.sweep.timeout_for(program.duration + program.initial_wait),
            };
            run_sweep(&config, &program, channel, timeout, user, notes, json).await
        }
        Commands::Simulate => simulate(&config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid duration {value} s"))
}

async fn connect(config: &FlexConfig, device: Device) -> Result<TransportClient> {
    let transport = match device {
        Device::Amplifier => config.instruments.amplifier.connect(Kh7008::DEFAULT_ADDRESS).await?,
        Device::Lockin => {
            config
                .instruments
                .lockin
                .connect(MultichannelLockin::DEFAULT_ADDRESS)
                .await?
        }
        Device::Cryostat => config.instruments.cryostat.connect(Ppms::DEFAULT_ADDRESS).await?,
    };
    Ok(transport)
}

fn client_name(device: Device) -> &'static str {
    match device {
        Device::Amplifier => Kh7008::NAME,
        Device::Lockin => MultichannelLockin::NAME,
        Device::Cryostat => Ppms::NAME,
    }
}

async fn ping(config: &FlexConfig, device: Device) -> Result<()> {
    let transport = connect(config, device).await?;
    let client = InstrumentClient::new(&transport, client_name(device));
    client.ack().await?;
    let missing = match device {
        Device::Amplifier => client.missing_commands::<Kh7008>().await?,
        Device::Lockin => client.missing_commands::<MultichannelLockin>().await?,
        Device::Cryostat => client.missing_commands::<Ppms>().await?,
    };
    transport.close().await?;

    println!("{} at {}: ACK", client.name(), transport.address());
    if missing.is_empty() {
        println!("All commands available");
        Ok(())
    } else {
        bail!("server lacks commands: {}", missing.join(", "))
    }
}

async fn help(config: &FlexConfig, device: Device, command: Option<&str>) -> Result<()> {
    let transport = connect(config, device).await?;
    let client = InstrumentClient::new(&transport, client_name(device));
    for line in client.help(command).await? {
        println!("{line}");
    }
    transport.close().await?;
    Ok(())
}

async fn amp(config: &FlexConfig, action: AmpAction) -> Result<()> {
    let transport = connect(config, Device::Amplifier).await?;
    let amplifier = Kh7008::new(&transport);
    match action {
        AmpAction::Get { channel } => {
            println!("{}", serde_json::to_string_pretty(&amplifier.channel(channel).await?)?);
        }
        AmpAction::All => {
            println!("{}", serde_json::to_string_pretty(&amplifier.all_channels().await?)?);
        }
        AmpAction::Set {
            channel,
            gain,
            input,
            shunt,
            couple,
            filter,
        } => {
            let mut update = ChannelUpdate::new();
            if let Some(gain) = gain {
                update = update.gain(gain);
            }
            if let Some(input) = input {
                update = update.input(input);
            }
            if let Some(shunt) = shunt {
                update = update.shunt(shunt);
            }
            if let Some(couple) = couple {
                update = update.couple(couple);
            }
            if let Some(filter) = filter {
                update = update.filter(filter);
            }
            if update.is_empty() {
                bail!("nothing to change; pass at least one of --gain --input --shunt --couple --filter");
            }
            let applied = amplifier.update_channel(channel, &update).await?;
            println!("{}", serde_json::to_string_pretty(&applied)?);
        }
    }
    transport.close().await?;
    Ok(())
}

async fn lockin(config: &FlexConfig, action: LockinAction) -> Result<()> {
    let transport = connect(config, Device::Lockin).await?;
    let lockin = MultichannelLockin::new(&transport).with_verify_settle(config.lockin.verify_settle());
    match action {
        LockinAction::State => println!("{}", lockin.state().await?),
        LockinAction::Start => lockin.set_state(StateRequest::Start).await?,
        LockinAction::Stop => lockin.set_state(StateRequest::Stop).await?,
        LockinAction::Result {
            channel,
            quantity,
            reference,
        } => {
            let key = quantity.key(channel, reference);
            match lockin.lockin_result(channel, quantity, reference).await? {
                Some(value) => println!("{key} = {value}"),
                None => println!("{key} = (no reading)"),
            }
        }
        LockinAction::Ao { channel } => {
            let ao = lockin.ao(channel).await?;
            println!(
                "AO{}: {} {} V amplitude, {} V DC, {} Hz, {} deg",
                ao.channel, ao.function, ao.amplitude, ao.dc, ao.frequency, ao.phase
            );
        }
    }
    transport.close().await?;
    Ok(())
}

async fn temp(config: &FlexConfig, action: TempAction) -> Result<()> {
    let transport = connect(config, Device::Cryostat).await?;
    let ppms = Ppms::new(&transport);
    match action {
        TempAction::Get => {
            let show = |v: Option<f64>| v.map_or_else(|| "(no reading)".to_string(), |v| v.to_string());
            println!("Temperature: {} K", show(ppms.temperature().await?));
            println!("Field: {} T", show(ppms.field().await?));
        }
        TempAction::Set { kelvin, rate, wait } => {
            if wait {
                let reached = ppms
                    .set_temperature_and_wait(kelvin, rate, config.cryostat.wait_settings())
                    .await?;
                println!("Reached {reached} K");
            } else {
                ppms.set_temperature(kelvin, rate).await?;
            }
        }
    }
    transport.close().await?;
    Ok(())
}

async fn run_sweep(
    config: &FlexConfig,
    program: &SweepConfig,
    channel: u32,
    timeout: Duration,
    user: Option<String>,
    notes: String,
    json: bool,
) -> Result<()> {
    let store = config.storage.open();
    let session = match user {
        Some(user) => Some(SessionContext::begin(user, notes, store.as_ref()).await?),
        None => None,
    };

    let transport = connect(config, Device::Lockin).await?;
    let lockin = MultichannelLockin::new(&transport).with_verify_settle(config.lockin.verify_settle());
    let mut coordinator = SweepCoordinator::new(&lockin).with_settings(config.sweep.settings());
    if let Some(session) = &session {
        coordinator = coordinator.with_session(session);
    }

    let mut measurement = session.as_ref().map(|s| s.measurement(format!("sweep AO{channel}")));
    if let Some(measurement) = measurement.as_mut() {
        measurement.start(store.as_ref()).await?;
    }
    let outcome = coordinator.start_sweep_for(program, timeout, channel).await;
    transport.close().await?;
    if let Some(measurement) = measurement.as_mut() {
        if let Err(e) = &outcome {
            measurement.add_note(format!("failed: {e}"));
        }
        measurement.finish(store.as_ref()).await?;
    }
    if let Some(session) = session {
        session.end(store.as_ref()).await?;
    }

    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result.channels)?);
    } else {
        for waveforms in &result.channels {
            println!(
                "Channel {}: {} samples, output {:?} -> {:?} V",
                waveforms.channel,
                waveforms.len(),
                waveforms.output.first(),
                waveforms.output.last()
            );
        }
        println!("Finished after {:?} ({} polls)", result.elapsed, result.polls);
    }
    Ok(())
}

async fn simulate(config: &FlexConfig) -> Result<()> {
    let (amp_addr, amp_task) = sim::spawn_server(
        socket_address(config.instruments.amplifier_address())?,
        SimulatedAmplifier::new(),
    )
    .await?;
    let (lockin_addr, lockin_task) = sim::spawn_server(
        socket_address(config.instruments.lockin_address())?,
        SimulatedLockin::new(),
    )
    .await?;
    let (ppms_addr, ppms_task) = sim::spawn_server(
        socket_address(config.instruments.cryostat_address())?,
        SimulatedCryostat::new(),
    )
    .await?;

    println!("Simulated instruments:");
    println!("  {} on {amp_addr}", Kh7008::NAME);
    println!("  {} on {lockin_addr}", MultichannelLockin::NAME);
    println!("  {} on {ppms_addr}", Ppms::NAME);
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Simulators shutting down");
    amp_task.abort();
    lockin_task.abort();
    ppms_task.abort();
    Ok(())
}
