//! Loopback packet capture into classic PCAP files.
//!
//! Capture needs raw socket capabilities (root or CAP_NET_RAW on Linux); when
//! the channel cannot be opened [`PcapCapture::start`] fails and the test
//! runs without a capture.

use std::{
    collections::HashSet,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use pnet::{
    datalink::{self, Channel::Ethernet, Config, NetworkInterface},
    packet::{
        ethernet::{EtherTypes, EthernetPacket},
        ip::IpNextHeaderProtocols,
        ipv4::Ipv4Packet,
        ipv6::Ipv6Packet,
        udp::UdpPacket,
        Packet,
    },
};
use tokio::task::JoinHandle;

use crate::{
    error::{HarnessError, Result},
    time::pcap_timestamp,
};

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65_535;
const LINKTYPE_ETHERNET: u32 = 1;

/// How long a blocking read waits before the stop flag is checked again.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Writes the classic libpcap format.
pub struct PcapWriter<W: Write> {
    out: W,
    packets: usize,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global header.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    pub fn new(mut out: W) -> io::Result<Self> {
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&PCAP_SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        out.write_all(&header)?;
        Ok(Self { out, packets: 0 })
    }

    /// Appends one frame captured at `at`.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    pub fn write_packet(&mut self, at: DateTime<Utc>, frame: &[u8]) -> io::Result<()> {
        let (ts_sec, ts_usec) = pcap_timestamp(at);
        let orig_len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        let incl_len = orig_len.min(PCAP_SNAPLEN);
        self.out.write_all(&ts_sec.to_le_bytes())?;
        self.out.write_all(&ts_usec.to_le_bytes())?;
        self.out.write_all(&incl_len.to_le_bytes())?;
        self.out.write_all(&orig_len.to_le_bytes())?;
        self.out.write_all(&frame[..incl_len as usize])?;
        self.packets += 1;
        Ok(())
    }

    #[must_use]
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Flushes and returns the writer.
    ///
    /// # Errors
    /// Returns the flush error.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// UDP source and destination ports of an Ethernet frame.
#[must_use]
pub fn udp_ports(frame: &[u8]) -> Option<(u16, u16)> {
    let ethernet = EthernetPacket::new(frame)?;
    let udp_payload = match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ethernet.payload())?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
                return None;
            }
            ip.payload().to_vec()
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(ethernet.payload())?;
            if ip.get_next_header() != IpNextHeaderProtocols::Udp {
                return None;
            }
            ip.payload().to_vec()
        }
        _ => return None,
    };
    let udp = UdpPacket::new(&udp_payload)?;
    Some((udp.get_source(), udp.get_destination()))
}

type PortSet = Arc<Mutex<HashSet<u16>>>;

/// A running capture of UDP traffic to or from a set of loopback ports.
pub struct PcapCapture {
    path: PathBuf,
    ports: PortSet,
    stop: Arc<AtomicBool>,
    task: JoinHandle<io::Result<usize>>,
}

fn loopback_interface() -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.is_loopback())
}

impl PcapCapture {
    /// Opens a datalink channel on the loopback interface and starts a
    /// blocking task writing matching frames to `path`.
    ///
    /// # Errors
    /// Returns `Setup` if there is no loopback interface or the channel cannot
    /// be opened, or the I/O error creating the file.
    pub fn start(path: &Path, ports: &[u16]) -> Result<Self> {
        let interface = loopback_interface()
            .ok_or_else(|| HarnessError::Setup("no loopback interface".into()))?;
        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let mut rx = match datalink::channel(&interface, config) {
            Ok(Ethernet(_, rx)) => rx,
            Ok(_) => {
                return Err(HarnessError::Setup(format!(
                    "unhandled channel type for interface {}",
                    interface.name
                )))
            }
            Err(e) => {
                return Err(HarnessError::Setup(format!(
                    "cannot capture on {}: {e}",
                    interface.name
                )))
            }
        };
        let mut writer = PcapWriter::new(BufWriter::new(File::create(path)?))?;

        let ports: PortSet = Arc::new(Mutex::new(ports.iter().copied().collect()));
        let stop = Arc::new(AtomicBool::new(false));
        let task = {
            let ports = Arc::clone(&ports);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                while !stop.load(Ordering::Relaxed) {
                    let frame = match rx.next() {
                        Ok(frame) => frame,
                        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                            continue
                        }
                        Err(e) => return Err(e),
                    };
                    let Some((src, dst)) = udp_ports(frame) else {
                        continue;
                    };
                    let wanted = {
                        let ports = ports.lock().unwrap_or_else(PoisonError::into_inner);
                        ports.contains(&src) || ports.contains(&dst)
                    };
                    if wanted {
                        writer.write_packet(Utc::now(), frame)?;
                    }
                }
                let packets = writer.packets();
                writer.finish()?;
                Ok(packets)
            })
        };
        log::info!("Capturing loopback UDP traffic into {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            ports,
            stop,
            task,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Includes traffic of one more port, e.g. a server bound later.
    pub fn add_port(&self, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port);
    }

    /// Stops the capture and returns the number of packets written.
    ///
    /// # Errors
    /// Returns the error that ended the capture task.
    pub async fn stop(self) -> Result<usize> {
        self.stop.store(true, Ordering::Relaxed);
        let packets = self
            .task
            .await
            .map_err(|e| HarnessError::Setup(format!("capture task failed: {e}")))??;
        log::info!("Captured {packets} packets into {}", self.path.display());
        Ok(packets)
    }
}
