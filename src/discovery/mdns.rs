//! DNS-SD over multicast DNS
//!
//! Sends a PTR question for the cast service from an ephemeral port, so
//! responders answer by unicast. Each answer packet usually carries the PTR,
//! SRV, TXT and A records for one receiver.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::net::bind_multicast_socket;
use super::scanner::DiscoveryBackend;
use super::DeviceDescriptor;
use crate::constants::{CAST_SERVICE, DEFAULT_CAST_PORT, MDNS_ADDR, MDNS_PORT};
use crate::error::DiscoveryError;

const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 1;
/// Ask for a unicast reply
const QU_BIT: u16 = 0x8000;
const FLAG_RESPONSE: u16 = 0x8000;

/// Compression pointers followed before a name is rejected
const MAX_JUMPS: usize = 16;

/// Build a one-question PTR query for `service`
pub fn build_query(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12 + service.len() + 6);
    // id, flags, one question, no records
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    for label in service.trim_end_matches('.').split('.') {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(TYPE_PTR);
    buf.put_u16(CLASS_IN | QU_BIT);
    buf.to_vec()
}

#[derive(Debug, Default)]
struct Records {
    /// Instance names announced for the service
    instances: Vec<String>,
    /// instance -> (target host, port)
    srv: HashMap<String, (String, u16)>,
    txt: HashMap<String, HashMap<String, String>>,
    a: HashMap<String, Ipv4Addr>,
}

/// Parse a response packet into the receivers it announces.
///
/// `source` stands in for the address when no A record came along. Returns
/// `None` for anything that is not a well-formed response.
pub fn parse_response(packet: &[u8], source: IpAddr, service: &str) -> Option<Vec<DeviceDescriptor>> {
    let mut reader = Reader::new(packet);
    let _id = reader.u16()?;
    let flags = reader.u16()?;
    if flags & FLAG_RESPONSE == 0 {
        return None;
    }
    let questions = reader.u16()?;
    let records = reader.u16()? as usize + reader.u16()? as usize + reader.u16()? as usize;

    for _ in 0..questions {
        reader.name()?;
        reader.skip(4)?;
    }

    let service = service.trim_end_matches('.');
    let mut parsed = Records::default();
    for _ in 0..records {
        let name = reader.name()?;
        let rtype = reader.u16()?;
        let _class = reader.u16()?;
        let _ttl = reader.u32()?;
        let len = reader.u16()? as usize;
        let end = reader.pos + len;
        if end > packet.len() {
            return None;
        }

        match rtype {
            TYPE_PTR if name.eq_ignore_ascii_case(service) => {
                let instance = reader.name()?;
                if !parsed.instances.contains(&instance) {
                    parsed.instances.push(instance);
                }
            }
            TYPE_SRV => {
                reader.skip(4)?;
                let port = reader.u16()?;
                let target = reader.name()?;
                parsed.srv.insert(name, (target, port));
            }
            TYPE_TXT => {
                parsed.txt.insert(name, parse_txt(&packet[reader.pos..end]));
            }
            TYPE_A if len == 4 => {
                let octets = &packet[reader.pos..end];
                parsed
                    .a
                    .insert(name, Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]));
            }
            _ => {}
        }
        reader.pos = end;
    }

    Some(parsed.into_descriptors(source))
}

impl Records {
    fn into_descriptors(mut self, source: IpAddr) -> Vec<DeviceDescriptor> {
        let instances = std::mem::take(&mut self.instances);
        instances
            .into_iter()
            .map(|instance| {
                let mut txt = self.txt.remove(&instance).unwrap_or_default();
                let (address, port) = match self.srv.get(&instance) {
                    Some((target, port)) => (
                        self.a.get(target).map(|ip| IpAddr::V4(*ip)).unwrap_or(source),
                        *port,
                    ),
                    None => (source, DEFAULT_CAST_PORT),
                };
                let name = txt
                    .remove("fn")
                    .unwrap_or_else(|| instance_label(&instance).to_string());

                DeviceDescriptor {
                    model: txt.remove("md"),
                    id: txt.remove("id"),
                    ..DeviceDescriptor::new(name, address, port)
                }
            })
            .collect()
    }
}

/// `Kitchen-abc123._googlecast._tcp.local` -> `Kitchen-abc123`
fn instance_label(instance: &str) -> &str {
    instance.split('.').next().unwrap_or(instance)
}

/// TXT rdata: length-prefixed `key=value` strings
fn parse_txt(data: &[u8]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut pos = 0;
    while pos < data.len() {
        let len = data[pos] as usize;
        let Some(entry) = data.get(pos + 1..pos + 1 + len) else {
            break;
        };
        let entry = String::from_utf8_lossy(entry);
        if let Some((key, value)) = entry.split_once('=') {
            out.insert(key.to_ascii_lowercase(), value.to_string());
        }
        pos += 1 + len;
    }
    out
}

struct Reader<'a> {
    packet: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(packet: &'a [u8]) -> Self {
        Self { packet, pos: 0 }
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.packet.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.packet.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.packet.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a possibly compressed name, leaving `pos` after its in-place part
    fn name(&mut self) -> Option<String> {
        let mut labels: Vec<String> = Vec::new();
        let mut pos = self.pos;
        let mut resume = None;
        let mut jumps = 0;

        loop {
            let len = *self.packet.get(pos)?;
            match len & 0xC0 {
                0x00 if len == 0 => {
                    pos += 1;
                    break;
                }
                0x00 => {
                    let label = self.packet.get(pos + 1..pos + 1 + len as usize)?;
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    pos += 1 + len as usize;
                }
                0xC0 => {
                    let low = *self.packet.get(pos + 1)?;
                    jumps += 1;
                    if jumps > MAX_JUMPS {
                        return None;
                    }
                    resume.get_or_insert(pos + 2);
                    pos = (((len & 0x3F) as usize) << 8) | low as usize;
                }
                _ => return None,
            }
        }

        self.pos = resume.unwrap_or(pos);
        Some(labels.join("."))
    }
}

/// Scans one interface with mDNS
pub struct MdnsBackend {
    interface: Ipv4Addr,
    service: String,
    requery_interval: Duration,
}

impl MdnsBackend {
    pub fn new(interface: Ipv4Addr) -> Self {
        Self {
            interface,
            service: CAST_SERVICE.to_string(),
            requery_interval: Duration::from_secs(1),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_requery_interval(mut self, interval: Duration) -> Self {
        self.requery_interval = interval;
        self
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn query(
        &self,
        tx: mpsc::Sender<DeviceDescriptor>,
        cancel: CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let socket = bind_multicast_socket(self.interface)?;
        let query = build_query(&self.service);
        let group = SocketAddrV4::new(MDNS_ADDR, MDNS_PORT);

        tracing::debug!(
            "mDNS query for {} from {}",
            self.service,
            self.interface
        );

        let mut requery = tokio::time::interval(self.requery_interval);
        let mut buf = vec![0u8; 9000];

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = requery.tick() => {
                    socket.send_to(&query, group).await?;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let Some(devices) = parse_response(&buf[..len], from.ip(), &self.service) else {
                        tracing::trace!("Ignoring non-response packet from {}", from);
                        continue;
                    };
                    for device in devices {
                        tracing::debug!("mDNS answer from {}: {} ({}:{})", from, device.name, device.address, device.port);
                        if tx.send(device).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "_googlecast._tcp.local";

    fn put_name(buf: &mut BytesMut, name: &str) {
        for label in name.split('.') {
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
        buf.put_u8(0);
    }

    fn record_header(buf: &mut BytesMut, rtype: u16, rdlen: u16) {
        buf.put_u16(rtype);
        buf.put_u16(CLASS_IN | 0x8000);
        buf.put_u32(120);
        buf.put_u16(rdlen);
    }

    /// Typical receiver answer: PTR, then SRV/TXT/A pointing back with compression
    fn answer(with_a: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        buf.put_u16(0x8400);
        buf.put_u16(0);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u16(if with_a { 3 } else { 2 });

        // PTR: service -> "Chromecast-abc._googlecast._tcp.local"
        let service_at = buf.len() as u16;
        put_name(&mut buf, SERVICE);
        let instance_label = "Chromecast-abc";
        record_header(&mut buf, TYPE_PTR, (1 + instance_label.len() + 2) as u16);
        let instance_at = buf.len() as u16;
        buf.put_u8(instance_label.len() as u8);
        buf.put_slice(instance_label.as_bytes());
        buf.put_u16(0xC000 | service_at);

        // SRV: instance -> host.local:8009
        buf.put_u16(0xC000 | instance_at);
        let host = "abc-host.local";
        record_header(&mut buf, TYPE_SRV, (6 + host.len() + 2) as u16);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(8009);
        let host_at = buf.len() as u16;
        put_name(&mut buf, host);

        // TXT
        buf.put_u16(0xC000 | instance_at);
        let entries = ["id=abc123", "md=Chromecast Audio", "fn=Living Room"];
        let rdlen: usize = entries.iter().map(|e| e.len() + 1).sum();
        record_header(&mut buf, TYPE_TXT, rdlen as u16);
        for entry in entries {
            buf.put_u8(entry.len() as u8);
            buf.put_slice(entry.as_bytes());
        }

        if with_a {
            buf.put_u16(0xC000 | host_at);
            record_header(&mut buf, TYPE_A, 4);
            buf.put_slice(&[192, 168, 1, 40]);
        }
        buf.to_vec()
    }

    fn source() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99))
    }

    #[test]
    fn test_query_layout() {
        let query = build_query(SERVICE);
        assert_eq!(&query[..12], &[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&query[12..24], b"\x0b_googlecast");
        assert_eq!(&query[query.len() - 4..], &[0, 12, 0x80, 1]);
    }

    #[test]
    fn test_full_answer() {
        let devices = parse_response(&answer(true), source(), SERVICE).unwrap();
        assert_eq!(devices.len(), 1);

        let device = &devices[0];
        assert_eq!(device.name, "Living Room");
        assert_eq!(device.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(device.port, 8009);
        assert_eq!(device.model.as_deref(), Some("Chromecast Audio"));
        assert_eq!(device.id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_missing_a_record_uses_source() {
        let devices = parse_response(&answer(false), source(), SERVICE).unwrap();
        assert_eq!(devices[0].address, source());
    }

    #[test]
    fn test_queries_are_ignored() {
        assert!(parse_response(&build_query(SERVICE), source(), SERVICE).is_none());
    }

    #[test]
    fn test_truncated_packet() {
        let packet = answer(true);
        assert!(parse_response(&packet[..packet.len() - 10], source(), SERVICE).is_none());
    }

    #[test]
    fn test_compression_loop_rejected() {
        let mut packet = vec![0, 0, 0x84, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        // a name pointing at itself
        packet.extend_from_slice(&[0xC0, 12, 0, 12, 0, 1]);
        assert!(parse_response(&packet, source(), SERVICE).is_none());
    }

    #[test]
    fn test_txt_without_friendly_name() {
        let txt = parse_txt(b"\x09id=abc123\x04junk");
        assert_eq!(txt.get("id").map(String::as_str), Some("abc123"));
        assert_eq!(txt.len(), 1);
        assert_eq!(instance_label("Kitchen-1._googlecast._tcp.local"), "Kitchen-1");
    }
}
