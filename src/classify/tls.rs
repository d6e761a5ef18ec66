//! TLS handshake parsing: SNI, JA3/JA3S fingerprints and certificate names

use std::str;

use x509_parser::extensions::GeneralName;

/// TLS record content types
pub const TLS_HANDSHAKE: u8 = 0x16;
pub const TLS_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const TLS_ALERT: u8 = 0x15;
pub const TLS_APPLICATION_DATA: u8 = 0x17;

/// TLS handshake types
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
pub const HANDSHAKE_SERVER_HELLO: u8 = 0x02;
pub const HANDSHAKE_CERTIFICATE: u8 = 0x0b;

/// TLS extension types
pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000B;

/// Fields of a ClientHello that matter for identification
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub sni: Option<String>,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

impl ClientHello {
    /// JA3 string: `version,ciphers,extensions,curves,formats` with GREASE removed
    pub fn ja3_string(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.version,
            join(self.ciphers.iter().filter(|v| !is_grease_value(**v))),
            join(self.extensions.iter().filter(|v| !is_grease_value(**v))),
            join(self.curves.iter().filter(|v| !is_grease_value(**v))),
            join(self.point_formats.iter()),
        )
    }

    /// MD5 of the JA3 string, lowercase hex
    pub fn ja3(&self) -> String {
        format!("{:x}", md5::compute(self.ja3_string()))
    }
}

/// Fields of a ServerHello that matter for identification
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub cipher: u16,
    pub extensions: Vec<u16>,
}

impl ServerHello {
    /// JA3S string: `version,cipher,extensions`
    pub fn ja3s_string(&self) -> String {
        format!(
            "{},{},{}",
            self.version,
            self.cipher,
            join(self.extensions.iter().filter(|v| !is_grease_value(**v))),
        )
    }

    pub fn ja3s(&self) -> String {
        format!("{:x}", md5::compute(self.ja3s_string()))
    }
}

/// A handshake message recognised in a TCP payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handshake {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    /// DNS names of the server's leaf certificate
    Certificate(Vec<String>),
}

/// True when the payload starts with something shaped like a TLS record
pub fn looks_like_tls(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }
    if !matches!(
        payload[0],
        TLS_HANDSHAKE | TLS_CHANGE_CIPHER_SPEC | TLS_ALERT | TLS_APPLICATION_DATA
    ) {
        return false;
    }
    let version = u16::from_be_bytes([payload[1], payload[2]]);
    let record_length = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    (0x0300..=0x0304).contains(&version) && record_length <= 16384 + 2048
}

/// Parse every handshake message in the TLS records of a TCP payload
///
/// A record cut by the segment boundary is parsed as far as it goes;
/// messages that continue in the next segment are not reassembled.
pub fn parse_handshakes(payload: &[u8]) -> Vec<Handshake> {
    let mut found = Vec::new();
    if !looks_like_tls(payload) {
        return found;
    }

    let mut records = Reader::new(payload);
    while records.remaining() >= 5 {
        let Some(header) = records.bytes(5) else {
            break;
        };
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let Some(body) = records.bytes(len.min(records.remaining())) else {
            break;
        };
        if header[0] == TLS_HANDSHAKE {
            parse_messages(body, &mut found);
        }
    }
    found
}

fn parse_messages(body: &[u8], found: &mut Vec<Handshake>) {
    let mut r = Reader::new(body);
    while r.remaining() >= 4 {
        let start = r.pos;
        let (Some(msg_type), Some(len)) = (r.u8(), r.u24()) else {
            return;
        };
        let end = r.pos.saturating_add(len).min(body.len());
        let message = &body[start..end];

        let parsed = match msg_type {
            HANDSHAKE_CLIENT_HELLO => parse_client_hello(message).map(Handshake::ClientHello),
            HANDSHAKE_SERVER_HELLO => parse_server_hello(message).map(Handshake::ServerHello),
            HANDSHAKE_CERTIFICATE => parse_certificate(message).map(Handshake::Certificate),
            _ => None,
        };
        found.extend(parsed);

        if r.skip(len).is_none() {
            return;
        }
    }
}

/// Bounds-checked big-endian reader
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.bytes(3)?;
        Some(usize::from(bytes[0]) << 16 | usize::from(bytes[1]) << 8 | usize::from(bytes[2]))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }
}

fn parse_client_hello(data: &[u8]) -> Option<ClientHello> {
    let mut r = Reader::new(data);
    // Handshake type (1) + length (3)
    r.skip(4)?;

    let mut hello = ClientHello {
        version: r.u16()?,
        ..Default::default()
    };

    // Random
    r.skip(32)?;
    let session_len = r.u8()? as usize;
    r.skip(session_len)?;

    let cipher_len = r.u16()? as usize;
    let mut ciphers = Reader::new(r.bytes(cipher_len)?);
    while let Some(suite) = ciphers.u16() {
        hello.ciphers.push(suite);
    }

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    // Extensions are optional
    let Some(ext_len) = r.u16() else {
        return Some(hello);
    };
    let ext_len = (ext_len as usize).min(r.remaining());
    let mut exts = Reader::new(r.bytes(ext_len)?);

    while exts.remaining() >= 4 {
        let ext_type = exts.u16()?;
        let len = exts.u16()? as usize;
        let Some(body) = exts.bytes(len) else {
            break;
        };
        hello.extensions.push(ext_type);

        match ext_type {
            EXT_SERVER_NAME => hello.sni = parse_sni(body),
            EXT_SUPPORTED_GROUPS => hello.curves = parse_u16_list(body),
            EXT_EC_POINT_FORMATS => {
                if let Some((&n, rest)) = body.split_first() {
                    hello.point_formats = rest.iter().take(n as usize).copied().collect();
                }
            }
            _ => {}
        }
    }

    Some(hello)
}

fn parse_server_hello(data: &[u8]) -> Option<ServerHello> {
    let mut r = Reader::new(data);
    r.skip(4)?;

    let version = r.u16()?;
    r.skip(32)?;
    let session_len = r.u8()? as usize;
    r.skip(session_len)?;
    let cipher = r.u16()?;
    // Compression method
    r.skip(1)?;

    let mut hello = ServerHello {
        version,
        cipher,
        extensions: Vec::new(),
    };

    if let Some(ext_len) = r.u16() {
        let ext_len = (ext_len as usize).min(r.remaining());
        let mut exts = Reader::new(r.bytes(ext_len)?);
        while exts.remaining() >= 4 {
            let ext_type = exts.u16()?;
            let len = exts.u16()? as usize;
            if exts.skip(len).is_none() {
                break;
            }
            hello.extensions.push(ext_type);
        }
    }

    Some(hello)
}

/// Server names from a Certificate message: the leaf's DNS subject-alt-names,
/// or its common name when it has none
fn parse_certificate(data: &[u8]) -> Option<Vec<String>> {
    let mut r = Reader::new(data);
    r.skip(4)?;
    let _list_len = r.u24()?;
    let leaf_len = r.u24()?;
    let der = r.bytes(leaf_len)?;

    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_lowercase),
        );
    }
    Some(names)
}

/// Parse the server_name extension body
fn parse_sni(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    let _list_len = r.u16()?;
    // host_name
    if r.u8()? != 0x00 {
        return None;
    }
    let name_len = r.u16()? as usize;
    let name = r.bytes(name_len)?;
    str::from_utf8(name).ok().map(|s| s.to_lowercase())
}

/// Parse a u16-length-prefixed list of u16 values
fn parse_u16_list(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::new();
    let mut r = Reader::new(data);
    let Some(len) = r.u16() else {
        return out;
    };
    if let Some(body) = r.bytes((len as usize).min(r.remaining())) {
        let mut list = Reader::new(body);
        while let Some(v) = list.u16() {
            out.push(v);
        }
    }
    out
}

/// GREASE values: 0x0a0a, 0x1a1a, ..., 0xfafa
fn is_grease_value(value: u16) -> bool {
    let high = (value >> 8) as u8;
    let low = (value & 0xff) as u8;
    high == low && (high & 0x0f) == 0x0a
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join("-")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a TLS record carrying a ClientHello
    pub(crate) fn client_hello_record(sni: &str) -> Vec<u8> {
        let mut exts = Vec::new();

        // server_name
        let name = sni.as_bytes();
        exts.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        exts.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        exts.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        exts.push(0x00);
        exts.extend_from_slice(&(name.len() as u16).to_be_bytes());
        exts.extend_from_slice(name);

        // supported_groups: GREASE, x25519, secp256r1
        exts.extend_from_slice(&EXT_SUPPORTED_GROUPS.to_be_bytes());
        exts.extend_from_slice(&8u16.to_be_bytes());
        exts.extend_from_slice(&6u16.to_be_bytes());
        for g in [0x2a2au16, 29, 23] {
            exts.extend_from_slice(&g.to_be_bytes());
        }

        // ec_point_formats: uncompressed
        exts.extend_from_slice(&EXT_EC_POINT_FORMATS.to_be_bytes());
        exts.extend_from_slice(&2u16.to_be_bytes());
        exts.extend_from_slice(&[1, 0]);

        let mut hello = Vec::new();
        hello.extend_from_slice(&0x0303u16.to_be_bytes());
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0);
        // ciphers: GREASE, 4865, 49195
        hello.extend_from_slice(&6u16.to_be_bytes());
        for c in [0x0a0au16, 4865, 49195] {
            hello.extend_from_slice(&c.to_be_bytes());
        }
        hello.extend_from_slice(&[1, 0]);
        hello.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        hello.extend_from_slice(&exts);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// ServerHello handshake message (no record header)
    fn server_hello_message() -> Vec<u8> {
        let mut hello = Vec::new();
        hello.extend_from_slice(&0x0303u16.to_be_bytes());
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0);
        hello.extend_from_slice(&0xc02fu16.to_be_bytes());
        hello.push(0);
        // extensions: renegotiation_info
        hello.extend_from_slice(&5u16.to_be_bytes());
        hello.extend_from_slice(&[0xff, 0x01, 0x00, 0x01, 0x00]);

        let mut message = vec![HANDSHAKE_SERVER_HELLO];
        message.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&hello);
        message
    }

    /// Certificate handshake message carrying a single certificate
    fn certificate_message(der: &[u8]) -> Vec<u8> {
        let mut entry = (der.len() as u32).to_be_bytes()[1..].to_vec();
        entry.extend_from_slice(der);
        let mut list = (entry.len() as u32).to_be_bytes()[1..].to_vec();
        list.extend_from_slice(&entry);

        let mut message = vec![HANDSHAKE_CERTIFICATE];
        message.extend_from_slice(&(list.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&list);
        message
    }

    /// One TLS record holding ServerHello and Certificate for `names`
    pub(crate) fn server_flight_record(names: &[&str]) -> Vec<u8> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        let der = certified.cert.der().to_vec();

        let mut body = server_hello_message();
        body.extend_from_slice(&certificate_message(&der));

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x03];
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn test_non_tls() {
        assert!(!looks_like_tls(b"GET / HTTP/1.1\r\n"));
        assert!(parse_handshakes(b"GET / HTTP/1.1\r\n").is_empty());
    }

    #[test]
    fn test_client_hello_sni_and_ja3() {
        let record = client_hello_record("Example.COM");
        let Some(Handshake::ClientHello(hello)) = parse_handshakes(&record).into_iter().next() else {
            panic!("expected ClientHello");
        };

        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.version, 0x0303);
        assert_eq!(hello.ja3_string(), "771,4865-49195,0-10-11,29-23,0");
        assert_eq!(hello.ja3().len(), 32);
    }

    #[test]
    fn test_truncated_client_hello() {
        let record = client_hello_record("example.com");
        assert!(parse_handshakes(&record[..30]).is_empty());
    }

    #[test]
    fn test_server_hello_and_certificate_names() {
        let record = server_flight_record(&["example.com", "WWW.example.com"]);
        let messages = parse_handshakes(&record);
        assert_eq!(messages.len(), 2);

        let Handshake::ServerHello(hello) = &messages[0] else {
            panic!("expected ServerHello");
        };
        assert_eq!(hello.ja3s_string(), "771,49199,65281");
        assert_eq!(
            messages[1],
            Handshake::Certificate(vec!["example.com".to_string(), "www.example.com".to_string()])
        );
    }

    #[test]
    fn test_truncated_certificate_ignored() {
        let record = server_flight_record(&["example.com"]);
        // Keep the ServerHello, cut the certificate short
        let messages = parse_handshakes(&record[..record.len() - 40]);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Handshake::ServerHello(_)));
    }

    #[test]
    fn test_grease_detection() {
        assert!(is_grease_value(0x0a0a));
        assert!(is_grease_value(0x1a1a));
        assert!(is_grease_value(0xfafa));
        assert!(!is_grease_value(0x0001));
        assert!(!is_grease_value(0x1234));
    }
}
