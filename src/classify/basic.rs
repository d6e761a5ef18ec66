//! Payload and port based classifier
//!
//! Looks at the first few payload-bearing packets of a flow. TLS and HTTP
//! are recognised from the payload itself, which also yields the SNI / Host,
//! the server certificate names and the JA3 fingerprints. Anything else
//! falls back to the well-known port table.

use tracing::trace;

use super::tls::{self, Handshake};
use super::{Classification, Classifier, ClassifierState, FlowMetadata};
use crate::core::{IpProtocol, Observation};

/// Payload-bearing packets inspected per flow before giving up
const MAX_INSPECTED: u32 = 8;

/// Known application protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppProtocol {
    pub id: u16,
    pub name: &'static str,
    pub category: &'static str,
}

pub const SMTP: AppProtocol = AppProtocol { id: 3, name: "SMTP", category: "Email" };
pub const DNS: AppProtocol = AppProtocol { id: 5, name: "DNS", category: "Network" };
pub const HTTP: AppProtocol = AppProtocol { id: 7, name: "HTTP", category: "Web" };
pub const MDNS: AppProtocol = AppProtocol { id: 8, name: "MDNS", category: "Network" };
pub const NTP: AppProtocol = AppProtocol { id: 9, name: "NTP", category: "System" };
pub const SNMP: AppProtocol = AppProtocol { id: 14, name: "SNMP", category: "Network" };
pub const DHCP: AppProtocol = AppProtocol { id: 18, name: "DHCP", category: "Network" };
pub const MYSQL: AppProtocol = AppProtocol { id: 20, name: "MySQL", category: "Database" };
pub const TLS: AppProtocol = AppProtocol { id: 91, name: "TLS", category: "Web" };
pub const SSH: AppProtocol = AppProtocol { id: 92, name: "SSH", category: "RemoteAccess" };
pub const QUIC: AppProtocol = AppProtocol { id: 188, name: "QUIC", category: "Web" };

/// Well-known port lookup
pub fn lookup_port(protocol: IpProtocol, port: u16) -> Option<AppProtocol> {
    match (protocol, port) {
        (IpProtocol::Tcp, 25 | 587) => Some(SMTP),
        (IpProtocol::Tcp | IpProtocol::Udp, 53) => Some(DNS),
        (IpProtocol::Tcp, 80 | 8080) => Some(HTTP),
        (IpProtocol::Udp, 5353) => Some(MDNS),
        (IpProtocol::Udp, 123) => Some(NTP),
        (IpProtocol::Udp, 161 | 162) => Some(SNMP),
        (IpProtocol::Udp, 67 | 68) => Some(DHCP),
        (IpProtocol::Tcp, 3306) => Some(MYSQL),
        (IpProtocol::Tcp, 443 | 853 | 993 | 995) => Some(TLS),
        (IpProtocol::Tcp, 22) => Some(SSH),
        (IpProtocol::Udp, 443) => Some(QUIC),
        _ => None,
    }
}

/// Classifier built on payload inspection plus a port table
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicClassifier;

impl BasicClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for BasicClassifier {
    fn open(&self, first: &Observation) -> Box<dyn ClassifierState> {
        // Lower port is the better service guess
        let by_port = lookup_port(first.protocol, first.dst_port.min(first.src_port))
            .or_else(|| lookup_port(first.protocol, first.dst_port))
            .or_else(|| lookup_port(first.protocol, first.src_port));

        Box::new(BasicState {
            by_port,
            by_payload: None,
            inspected: 0,
        })
    }
}

struct BasicState {
    by_port: Option<AppProtocol>,
    by_payload: Option<AppProtocol>,
    inspected: u32,
}

impl ClassifierState for BasicState {
    fn update(&mut self, obs: &Observation, metadata: &mut FlowMetadata) {
        if obs.payload.is_empty() || self.inspected >= MAX_INSPECTED {
            return;
        }
        self.inspected += 1;

        if obs.protocol != IpProtocol::Tcp {
            return;
        }

        let handshakes = tls::parse_handshakes(&obs.payload);
        if !handshakes.is_empty() {
            self.by_payload = Some(TLS);
            for handshake in handshakes {
                match handshake {
                    Handshake::ClientHello(hello) => {
                        if let Some(sni) = &hello.sni {
                            metadata.client_info = sni.clone();
                        }
                        metadata.ja3_client = hello.ja3();
                        trace!(sni = ?hello.sni, ja3 = %metadata.ja3_client, "ClientHello");
                    }
                    Handshake::ServerHello(hello) => {
                        metadata.ja3_server = hello.ja3s();
                    }
                    Handshake::Certificate(names) => {
                        if metadata.server_info.is_empty() && !names.is_empty() {
                            metadata.server_info = names.join(",");
                            trace!(server = %metadata.server_info, "Certificate");
                        }
                    }
                }
            }
            return;
        }

        if self.by_payload.is_none() {
            if let Some(host) = parse_http_host(&obs.payload) {
                self.by_payload = Some(HTTP);
                metadata.client_info = host;
            } else if obs.payload.starts_with(b"SSH-") {
                self.by_payload = Some(SSH);
            }
        }
    }

    fn finish(self: Box<Self>) -> Classification {
        match self.by_payload.or(self.by_port) {
            Some(app) => Classification {
                master_protocol: app.id,
                app_protocol: app.id,
                application_name: app.name.to_string(),
                category_name: app.category.to_string(),
            },
            None => Classification::unknown(),
        }
    }
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
];

/// Host header of an HTTP request, lowercased
fn parse_http_host(payload: &[u8]) -> Option<String> {
    if !HTTP_METHODS.iter().any(|m| payload.starts_with(m)) {
        return None;
    }
    let text = String::from_utf8_lossy(payload);
    let host = text
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("host").then(|| value.trim().to_lowercase())
        });
    // A request without Host is still HTTP
    Some(host.unwrap_or_default())
}
