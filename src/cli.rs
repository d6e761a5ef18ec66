use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tabled::{Table, Tabled};

use flowmeter::classify::BasicClassifier;
use flowmeter::engine::{FlowStreamer, PcapFileSource};
use flowmeter::plugin::PacketMatrix;
use flowmeter::{FlowRecord, MeterConfig, MeterStats};

#[derive(Parser)]
#[command(name = "flowmeter")]
#[command(author, version, about = "Bidirectional flow metering for pcap captures")]
pub struct Cli {
    /// PCAP file to meter
    pub pcap: PathBuf,

    /// Path to configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Idle timeout in seconds (overrides config)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Active timeout in seconds (overrides config)
    #[arg(long)]
    pub active_timeout: Option<u64>,

    /// Compute packet size / inter-arrival statistics
    #[arg(long)]
    pub statistics: bool,

    /// Expire TCP flows on FIN/RST teardown
    #[arg(long)]
    pub tcp_teardown: bool,

    /// Record the first N packets of each flow as a feature matrix
    #[arg(long, value_name = "N")]
    pub packet_matrix: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON record per line
    Json,
    /// Per-application totals
    Summary,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied
    fn meter_config(&self) -> Result<MeterConfig> {
        let mut config = match &self.config {
            Some(path) => MeterConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => MeterConfig::default(),
        };
        if let Some(idle) = self.idle_timeout {
            config.idle_timeout = idle;
        }
        if let Some(active) = self.active_timeout {
            config.active_timeout = active;
        }
        config.statistics |= self.statistics;
        config.tcp_teardown |= self.tcp_teardown;
        Ok(config)
    }
}

/// Per-application summary row
#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "Application")]
    application: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Flows")]
    flows: u64,
    #[tabled(rename = "Packets")]
    packets: u64,
    #[tabled(rename = "Bytes")]
    bytes: u64,
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = cli.meter_config()?;
    let source = PcapFileSource::open(&cli.pcap)
        .with_context(|| format!("Failed to open {}", cli.pcap.display()))?;

    let mut builder = FlowStreamer::builder()
        .with_config(config)
        .with_classifier(BasicClassifier::new());
    if let Some(limit) = cli.packet_matrix {
        builder = builder.with_plugin(PacketMatrix::new(limit));
    }
    let mut stream = builder.build(source).context("Failed to start metering")?;

    match cli.format {
        OutputFormat::Json => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for record in stream.by_ref() {
                let record = record?;
                writeln!(out, "{}", record.to_json()?)?;
            }
            out.flush()?;
        }
        OutputFormat::Summary => {
            let mut records = Vec::new();
            for record in stream.by_ref() {
                records.push(record?);
            }
            print_summary(&records, &stream.stats());
        }
    }

    Ok(())
}

fn print_summary(records: &[FlowRecord], stats: &MeterStats) {
    let mut apps: HashMap<(&str, &str), AppRow> = HashMap::new();
    for record in records {
        let name = record.classification.application_name.as_str();
        let category = record.classification.category_name.as_str();
        let row = apps.entry((name, category)).or_insert_with(|| AppRow {
            application: name.to_string(),
            category: category.to_string(),
            flows: 0,
            packets: 0,
            bytes: 0,
        });
        row.flows += 1;
        row.packets += record.bidirectional.packets;
        row.bytes += record.bidirectional.raw_bytes;
    }

    let mut rows: Vec<AppRow> = apps.into_values().collect();
    rows.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.application.cmp(&b.application)));

    println!("{}", "Flow Summary".green().bold());
    println!(
        "  {} packets, {} bytes, {} flows",
        stats.packets_processed, stats.bytes_processed, stats.flows_expired
    );
    println!(
        "  expired: idle={} active={} teardown={} end-of-stream={} custom={}",
        stats.idle_expired,
        stats.active_expired,
        stats.teardown_expired,
        stats.end_of_stream_expired,
        stats.custom_expired
    );
    println!();
    println!("{}", Table::new(rows));
}
