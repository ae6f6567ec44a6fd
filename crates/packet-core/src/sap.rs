//! SAP announcements and the SDP subset the engine speaks
//!
//! The RTP sender announces its stream with a SAP (RFC 2974) datagram
//! every few seconds; the RTP receiver listens for the same datagrams
//! to discover streams. Only the fields the engine produces are
//! modeled: IPv4 origin, `application/sdp` payload, one audio media
//! section with an `rtpmap` line.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};

const SAP_MIME: &str = "application/sdp";

/// A stream description carried in a SAP announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpStream {
    /// Session name (`s=` line)
    pub name: String,
    /// Destination address (`c=` line)
    pub destination: Ipv4Addr,
    /// RTP port from the `m=audio` line
    pub port: u16,
    /// Payload type from the `m=audio` line
    pub payload_type: u8,
    /// Encoding name from the `rtpmap` (`L16`, `opus`, ...)
    pub encoding: String,
    /// Media clock rate
    pub clock_rate: u32,
    /// Channel count
    pub channels: u8,
}

impl SdpStream {
    /// Render the SDP body
    pub fn to_sdp(&self, origin: Ipv4Addr, session_id: u32) -> String {
        format!(
            "v=0\r\n\
             o=- {sid} {sid} IN IP4 {origin}\r\n\
             s={name}\r\n\
             c=IN IP4 {dest}\r\n\
             t=0 0\r\n\
             m=audio {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} {enc}/{rate}/{ch}\r\n",
            sid = session_id,
            origin = origin,
            name = self.name,
            dest = self.destination,
            port = self.port,
            pt = self.payload_type,
            enc = self.encoding,
            rate = self.clock_rate,
            ch = self.channels,
        )
    }

    /// Parse the SDP subset out of an announcement body
    pub fn from_sdp(body: &str) -> Result<Self> {
        let mut name = None;
        let mut destination = None;
        let mut port = None;
        let mut payload_type = None;
        let mut rtpmap = None;

        for line in body.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("s=") {
                name = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
                let addr = rest.split('/').next().unwrap_or(rest);
                destination = addr.parse().ok();
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                let mut fields = rest.split_whitespace();
                port = fields.next().and_then(|p| p.parse().ok());
                payload_type = fields.nth(1).and_then(|p| p.parse().ok());
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some((_pt, spec)) = rest.split_once(' ') {
                    let mut parts = spec.split('/');
                    let enc = parts.next().unwrap_or("").to_string();
                    let rate = parts.next().and_then(|r| r.parse().ok());
                    let ch = parts.next().and_then(|c| c.parse().ok()).unwrap_or(1u8);
                    if let Some(rate) = rate {
                        rtpmap = Some((enc, rate, ch));
                    }
                }
            }
        }

        let (encoding, clock_rate, channels) =
            rtpmap.ok_or_else(|| PacketError::MalformedDatagram {
                protocol: "sdp",
                reason: "missing rtpmap".to_string(),
            })?;
        Ok(Self {
            name: name.unwrap_or_default(),
            destination: destination.ok_or_else(|| PacketError::MalformedDatagram {
                protocol: "sdp",
                reason: "missing connection line".to_string(),
            })?,
            port: port.ok_or_else(|| PacketError::MalformedDatagram {
                protocol: "sdp",
                reason: "missing media line".to_string(),
            })?,
            payload_type: payload_type.unwrap_or(0),
            encoding,
            clock_rate,
            channels,
        })
    }
}

/// Build a SAP announcement datagram around an SDP body
pub fn encode_announcement(origin: Ipv4Addr, msg_id_hash: u16, sdp: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + SAP_MIME.len() + 1 + sdp.len());
    buf.put_u8(0x20); // V=1, IPv4 origin, announcement
    buf.put_u8(0); // no authentication
    buf.put_u16(msg_id_hash);
    buf.put_slice(&origin.octets());
    buf.put_slice(SAP_MIME.as_bytes());
    buf.put_u8(0);
    buf.put_slice(sdp.as_bytes());
    buf.freeze()
}

/// Extract the SDP body from a SAP datagram
pub fn decode_announcement(datagram: &[u8]) -> Result<(Ipv4Addr, String)> {
    if datagram.len() < 8 {
        return Err(PacketError::MalformedDatagram {
            protocol: "sap",
            reason: format!("datagram is {} bytes", datagram.len()),
        });
    }
    let flags = datagram[0];
    if flags >> 5 != 1 {
        return Err(PacketError::MalformedDatagram {
            protocol: "sap",
            reason: format!("version {}", flags >> 5),
        });
    }
    if flags & 0x10 != 0 {
        return Err(PacketError::MalformedDatagram {
            protocol: "sap",
            reason: "IPv6 origin not supported".to_string(),
        });
    }
    let auth_len = datagram[1] as usize * 4;
    let origin = Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
    let mut offset = 8 + auth_len;
    if datagram.len() <= offset {
        return Err(PacketError::MalformedDatagram {
            protocol: "sap",
            reason: "no payload".to_string(),
        });
    }
    // An optional MIME type terminated by NUL precedes the SDP body.
    let rest = &datagram[offset..];
    if rest.starts_with(SAP_MIME.as_bytes()) {
        offset += SAP_MIME.len();
        if datagram.get(offset) == Some(&0) {
            offset += 1;
        }
    } else if rest.starts_with(b"v=0") {
        // bare SDP, nothing to skip
    } else if let Some(nul) = rest.iter().position(|&b| b == 0) {
        offset += nul + 1;
    }
    let body = String::from_utf8_lossy(&datagram[offset..]).into_owned();
    Ok((origin, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> SdpStream {
        SdpStream {
            name: "wavecast-living-room".to_string(),
            destination: Ipv4Addr::new(239, 1, 2, 3),
            port: 40_000,
            payload_type: 127,
            encoding: "L16".to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    #[test]
    fn sdp_round_trip() {
        let s = stream();
        let body = s.to_sdp(Ipv4Addr::new(192, 168, 1, 5), 42);
        let parsed = SdpStream::from_sdp(&body).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn announcement_round_trip() {
        let s = stream();
        let origin = Ipv4Addr::new(192, 168, 1, 5);
        let body = s.to_sdp(origin, 7);
        let dg = encode_announcement(origin, 0x1234, &body);
        let (parsed_origin, parsed_body) = decode_announcement(&dg).unwrap();
        assert_eq!(parsed_origin, origin);
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn rejects_truncated_announcement() {
        assert!(decode_announcement(&[0x20, 0, 0]).is_err());
    }
}
