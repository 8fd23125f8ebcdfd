//! SOCKS5-mediated in-band bytestream (XEP-0065): the binary side-channel
//! carrying bulk delta data, kept as its own TCP connection rather than
//! multiplexed onto the XML stream, mirroring `streamer.handshake()` in
//! `baboon/transport.py` negotiating a stream separate from the XMPP
//! session proper. The handshake itself speaks plain SOCKS5 (RFC 1928)
//! CONNECT against the server's streamer address, using the session id as
//! the destination domain name the proxy resolves to the matching peer —
//! the same role XEP-0065 gives the `sid` over its own SOCKS5 profile.
//! No crate in reach implements XEP-0065 directly, so this is hand-rolled
//! against the generic SOCKS5 wire format.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use crate::error::{BaboonError, Result};
use crate::wire;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_NO_AUTH: u8 = 0x00;

/// One negotiated bytestream: a dedicated socket keyed by SID, carrying
/// length-prefixed `wire::BytestreamPayload` frames for the life of a
/// sync session.
pub struct Bytestream {
    stream: Mutex<TcpStream>,
}

impl Bytestream {
    /// Connects to `streamer_host:streamer_port` and performs the SOCKS5
    /// handshake, requesting a CONNECT to `sid` as the destination. The
    /// streamer plays the XEP-0065 proxy role: it rendezvouses the two
    /// peers that share the same `sid` and relays bytes between them.
    pub fn connect(streamer_host: &str, streamer_port: u16, sid: &str) -> Result<Self> {
        let mut stream = TcpStream::connect((streamer_host, streamer_port)).map_err(BaboonError::Io)?;

        // Greeting: version, one auth method (no-auth).
        stream.write_all(&[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH]).map_err(BaboonError::Io)?;
        let mut greeting_reply = [0u8; 2];
        stream.read_exact(&mut greeting_reply).map_err(BaboonError::Io)?;
        if greeting_reply[0] != SOCKS5_VERSION || greeting_reply[1] != SOCKS5_NO_AUTH {
            return Err(BaboonError::Internal("streamer rejected SOCKS5 no-auth negotiation".into()));
        }

        // CONNECT request with a domain-name address: the sid itself,
        // exactly as XEP-0065 repurposes the SOCKS5 destination field to
        // carry the bytestream's negotiated session id.
        let sid_bytes = sid.as_bytes();
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00, SOCKS5_ATYP_DOMAIN, sid_bytes.len() as u8];
        request.extend_from_slice(sid_bytes);
        request.extend_from_slice(&[0u8; 2]); // port, unused by the streamer
        stream.write_all(&request).map_err(BaboonError::Io)?;

        let mut reply_header = [0u8; 4];
        stream.read_exact(&mut reply_header).map_err(BaboonError::Io)?;
        if reply_header[1] != 0x00 {
            return Err(BaboonError::Internal(format!("streamer refused bytestream (reply code {})", reply_header[1])));
        }
        // Skip the bound address the streamer echoes back: 4 or 16 bytes
        // depending on address type, plus 2 bytes of port.
        let addr_len = match reply_header[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len_byte = [0u8; 1];
                stream.read_exact(&mut len_byte).map_err(BaboonError::Io)?;
                len_byte[0] as usize
            }
            _ => return Err(BaboonError::Internal("streamer returned unknown address type".into())),
        };
        let mut discard = vec![0u8; addr_len + 2];
        stream.read_exact(&mut discard).map_err(BaboonError::Io)?;

        Ok(Self { stream: Mutex::new(stream) })
    }

    pub fn send_payload(&self, payload: &wire::BytestreamPayload) -> Result<()> {
        let framed = wire::frame(payload)?;
        self.stream.lock().unwrap().write_all(&framed).map_err(BaboonError::Io)
    }

    /// Blocks for exactly one length-prefixed frame and decodes it.
    pub fn recv_payload(&self) -> Result<wire::BytestreamPayload> {
        let mut stream = self.stream.lock().unwrap();
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(BaboonError::Io)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).map_err(BaboonError::Io)?;

        let mut framed = Vec::with_capacity(4 + len);
        framed.extend_from_slice(&len_buf);
        framed.extend_from_slice(&body);
        let (payload, _): (wire::BytestreamPayload, usize) = wire::unframe(&framed)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// A minimal SOCKS5 server stub that accepts the no-auth greeting and
    /// any CONNECT request, then echoes a success reply with a dummy bound
    /// address, exactly enough to exercise `Bytestream::connect`.
    fn spawn_stub_streamer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut greeting = [0u8; 3];
                stream.read_exact(&mut greeting).unwrap();
                stream.write_all(&[SOCKS5_VERSION, SOCKS5_NO_AUTH]).unwrap();

                let mut header = [0u8; 5];
                stream.read_exact(&mut header).unwrap();
                let domain_len = header[4] as usize;
                let mut rest = vec![0u8; domain_len + 2];
                stream.read_exact(&mut rest).unwrap();

                // success, bound address type IPv4, 4+2 zero bytes.
                stream.write_all(&[SOCKS5_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).unwrap();

                // Echo back one framed payload so recv_payload has
                // something to decode.
                let mut buf = [0u8; 4096];
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n]);
                }
            }
        });
        port
    }

    #[test]
    fn handshake_succeeds_against_stub_streamer() {
        let port = spawn_stub_streamer();
        let bs = Bytestream::connect("127.0.0.1", port, "sid-test").unwrap();

        let payload = wire::BytestreamPayload::Delta(crate::wire::DeltaPayload {
            from: "alice@example.com".into(),
            rid: "r1".into(),
            project: "p".into(),
            delta: vec![],
        });
        bs.send_payload(&payload).unwrap();
        let echoed = bs.recv_payload().unwrap();
        match echoed {
            wire::BytestreamPayload::Delta(d) => assert_eq!(d.rid, "r1"),
            _ => panic!("expected delta payload"),
        }
    }
}
