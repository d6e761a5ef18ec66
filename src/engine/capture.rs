//! Packet sources
//!
//! Supports:
//! - PCAP file replay (Ethernet or raw IP link types)
//! - Any in-memory iterator of observations (tests, replay from other tools)
//!
//! A source is pulled from the metering thread only. It yields observations
//! in nondecreasing timestamp order and `None` once exhausted.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tracing::{debug, info, warn};

use crate::core::{decode_ethernet, decode_ip, Observation};
use crate::error::{MeterError, Result};

/// Trait for packet source implementations
pub trait PacketSource: Send {
    /// Next observation, or `None` at end of stream
    fn next_observation(&mut self) -> Option<Observation>;
}

/// Source backed by an iterator
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Observation> + Send,
{
    pub fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self { inner: inner.into_iter() }
    }
}

impl<I> PacketSource for IterSource<I>
where
    I: Iterator<Item = Observation> + Send,
{
    fn next_observation(&mut self) -> Option<Observation> {
        self.inner.next()
    }
}

/// Capture statistics for a file source
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    /// Records read from the file
    pub frames_read: u64,
    /// Records that were not IP and got skipped
    pub frames_skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkType {
    Ethernet,
    RawIp,
}

/// Classic pcap file replay
pub struct PcapFileSource {
    path: PathBuf,
    reader: PcapReader<BufReader<File>>,
    link: LinkType,
    stats: CaptureStats,
    done: bool,
}

impl PcapFileSource {
    /// Open a pcap file; a missing file, bad header or unsupported link type
    /// is reported here rather than per packet
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| MeterError::Source(format!("{}: {}", path.display(), e)))?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| MeterError::Source(format!("{}: {}", path.display(), e)))?;

        let link = match reader.header().datalink {
            DataLink::ETHERNET => LinkType::Ethernet,
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkType::RawIp,
            other => {
                return Err(MeterError::Source(format!(
                    "{}: unsupported link type {:?}",
                    path.display(),
                    other
                )))
            }
        };

        info!("Opened PCAP file: {} ({:?})", path.display(), link);
        Ok(Self {
            path,
            reader,
            link,
            stats: CaptureStats::default(),
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

impl PacketSource for PcapFileSource {
    fn next_observation(&mut self) -> Option<Observation> {
        while !self.done {
            let packet = match self.reader.next_packet() {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    warn!("{}: stopping at unreadable record: {}", self.path.display(), e);
                    self.done = true;
                    break;
                }
                None => {
                    debug!(
                        frames = self.stats.frames_read,
                        skipped = self.stats.frames_skipped,
                        "PCAP file exhausted"
                    );
                    self.done = true;
                    break;
                }
            };
            self.stats.frames_read += 1;

            let timestamp_ms = packet.timestamp.as_millis() as u64;
            let decoded = match self.link {
                LinkType::Ethernet => decode_ethernet(&packet.data, packet.orig_len, timestamp_ms),
                LinkType::RawIp => decode_ip(&packet.data, packet.orig_len, timestamp_ms),
            };
            match decoded {
                Some(obs) => return Some(obs),
                None => self.stats.frames_skipped += 1,
            }
        }
        None
    }
}
