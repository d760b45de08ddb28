//! WiZ discovery over UDP broadcast.
//!
//! Bulbs answer a `registration` request on port 38899 with their MAC. Each
//! pass broadcasts it on every usable interface (directed broadcast plus the
//! limited broadcast address), collects replies for the listen window, then
//! asks every responder for `getSystemConfig` to learn its module name.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::net::{create_socket, get_interfaces};
use super::probe::DiscoveryProbe;
use super::types::{DiscoveryError, DiscoveryResult, Sighting};
use crate::adapters::wiz::{capabilities_for_module, WizClient};
use crate::bridge::CommandBridge;
use crate::model::{Endpoint, Protocol};
use crate::protocol_constants::{WIZ_DISCOVERY_SENDS, WIZ_DISCOVERY_SPACING_MS, WIZ_PORT};

pub struct WizProbe {
    listen: Duration,
    timeout: Duration,
    bridge: CommandBridge,
}

impl WizProbe {
    /// `listen` bounds the broadcast phase; follow-up requests use the
    /// bridge's pool and `timeout`.
    pub fn new(listen: Duration, timeout: Duration, bridge: CommandBridge) -> Self {
        Self {
            listen,
            timeout,
            bridge,
        }
    }

    /// Sends `registration` to `targets` and collects `(mac, source)` replies.
    ///
    /// Fails only if no datagram could be sent at all.
    async fn listen_on(
        &self,
        socket: &UdpSocket,
        phone_ip: Ipv4Addr,
        targets: &[SocketAddr],
    ) -> io::Result<Vec<(String, SocketAddr)>> {
        let body = registration_message(phone_ip);

        let sender = async {
            let mut sent = 0usize;
            let mut last_error = None;
            for attempt in 0..WIZ_DISCOVERY_SENDS {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_millis(WIZ_DISCOVERY_SPACING_MS)).await;
                }
                for target in targets {
                    match socket.send_to(&body, target).await {
                        Ok(_) => sent += 1,
                        Err(e) => {
                            log::debug!(
                                "[WiZ] Failed to send registration from {} to {}: {}",
                                phone_ip,
                                target,
                                e
                            );
                            last_error = Some(e);
                        }
                    }
                }
            }
            (sent, last_error)
        };

        let receiver = async {
            let deadline = Instant::now() + self.listen;
            let mut found = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, from))) => {
                        if let Some(mac) = parse_registration(&buf[..len]) {
                            log::trace!("[WiZ] Registration reply from {} ({})", from, mac);
                            found.push((mac, from));
                        }
                    }
                    Ok(Err(e)) => {
                        log::warn!("[WiZ] Socket recv error on {}: {}", phone_ip, e);
                    }
                    Err(_) => break,
                }
            }
            found
        };

        let ((sent, last_error), found) = tokio::join!(sender, receiver);
        match (sent, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(found),
        }
    }

    /// Builds the sighting for a responder, narrowing capabilities when the
    /// bulb reports its module.
    async fn describe(&self, mac: String, addr: SocketAddr) -> Sighting {
        let label = format!("wiz:{mac} getSystemConfig");
        let config = self
            .bridge
            .run(&label, async {
                WizClient::connect(addr, self.timeout)
                    .await?
                    .request("getSystemConfig", json!({}))
                    .await
            })
            .await;

        let module = match config {
            Ok(result) => result
                .get("moduleName")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                log::debug!("[WiZ] {} failed: {}", label, e);
                None
            }
        };

        let address = Endpoint::new(addr.ip().to_string(), addr.port());
        match module {
            Some(module) => Sighting::new(Protocol::Wiz, &mac, format!("WiZ {module}"), address)
                .with_capabilities(capabilities_for_module(&module))
                .with_model(Some(module)),
            None => {
                let name = match addr.ip() {
                    std::net::IpAddr::V4(v4) => format!("WiZ {}", v4.octets()[3]),
                    ip => format!("WiZ {ip}"),
                };
                Sighting::new(Protocol::Wiz, &mac, name, address)
            }
        }
    }
}

#[async_trait]
impl DiscoveryProbe for WizProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Wiz
    }

    async fn scan(&self) -> DiscoveryResult<Vec<Sighting>> {
        let interfaces = get_interfaces();
        if interfaces.is_empty() {
            return Err(DiscoveryError::NoInterfaces);
        }

        let mut sockets = Vec::new();
        for iface in interfaces {
            match create_socket(iface.ip, true) {
                Ok(socket) => sockets.push((iface, socket)),
                Err(e) => log::warn!(
                    "[WiZ] Failed to create socket for {} ({}): {}",
                    iface.name,
                    iface.ip,
                    e
                ),
            }
        }
        if sockets.is_empty() {
            return Err(DiscoveryError::NoInterfaces);
        }

        log::debug!(
            "[WiZ] Broadcasting registration on {} interface(s)",
            sockets.len()
        );
        let limited = SocketAddr::from((Ipv4Addr::BROADCAST, WIZ_PORT));
        let results = join_all(sockets.iter().map(|(iface, socket)| {
            let targets = [SocketAddr::from((iface.broadcast, WIZ_PORT)), limited];
            async move { self.listen_on(socket, iface.ip, &targets).await }
        }))
        .await;

        // A bulb usually answers on several interfaces; one entry per MAC.
        let mut responders = BTreeMap::new();
        let mut send_error = None;
        let mut any_sent = false;
        for result in results {
            match result {
                Ok(found) => {
                    any_sent = true;
                    responders.extend(found);
                }
                Err(e) => send_error = Some(e),
            }
        }
        if let (false, Some(e)) = (any_sent, send_error) {
            return Err(DiscoveryError::Send(e));
        }

        let sightings = join_all(
            responders
                .into_iter()
                .map(|(mac, addr)| self.describe(mac, addr)),
        )
        .await;
        log::debug!("[WiZ] Pass complete: {} bulb(s)", sightings.len());
        Ok(sightings)
    }
}

fn registration_message(phone_ip: Ipv4Addr) -> Vec<u8> {
    json!({
        "method": "registration",
        "params": {
            "phoneMac": "AAAAAAAAAAAA",
            "register": false,
            "phoneIp": phone_ip.to_string(),
            "id": "1"
        }
    })
    .to_string()
    .into_bytes()
}

/// Returns the bulb MAC from a `registration` reply.
fn parse_registration(datagram: &[u8]) -> Option<String> {
    let reply: Value = serde_json::from_slice(datagram).ok()?;
    if reply.get("method").and_then(Value::as_str) != Some("registration") {
        return None;
    }
    let mac = reply.get("result")?.get("mac")?.as_str()?.trim();
    (!mac.is_empty()).then(|| mac.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Capability;

    /// Answers registration and getSystemConfig like a dimmable-white bulb.
    async fn fake_bulb(mac: &'static str, module: &'static str) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
                let reply = match request["method"].as_str() {
                    Some("registration") => {
                        json!({"method": "registration", "env": "pro", "result": {"mac": mac, "success": true}})
                    }
                    Some("getSystemConfig") => {
                        json!({"method": "getSystemConfig", "env": "pro", "result": {"mac": mac, "moduleName": module}})
                    }
                    _ => continue,
                };
                let _ = socket.send_to(reply.to_string().as_bytes(), from).await;
            }
        });
        addr
    }

    fn probe() -> WizProbe {
        WizProbe::new(
            Duration::from_millis(300),
            Duration::from_secs(1),
            CommandBridge::new(2, Duration::from_secs(2)),
        )
    }

    #[test]
    fn registration_reply_yields_lowercase_mac() {
        let reply = br#"{"method":"registration","env":"pro","result":{"mac":"A8BB5006C3F1","success":true}}"#;
        assert_eq!(parse_registration(reply), Some("a8bb5006c3f1".into()));
        assert_eq!(
            parse_registration(br#"{"method":"getPilot","result":{"mac":"a8bb5006c3f1"}}"#),
            None
        );
        assert_eq!(parse_registration(b"not json"), None);
    }

    #[test]
    fn registration_message_carries_phone_ip() {
        let body: Value =
            serde_json::from_slice(&registration_message(Ipv4Addr::new(192, 168, 1, 20))).unwrap();
        assert_eq!(body["method"], "registration");
        assert_eq!(body["params"]["phoneIp"], "192.168.1.20");
        assert_eq!(body["params"]["register"], false);
    }

    #[tokio::test]
    async fn listen_collects_replies_from_targets() {
        let bulb = fake_bulb("a8bb5006c3f1", "ESP01_SHRGB1C_31").await;
        let socket = create_socket(Ipv4Addr::LOCALHOST, true).unwrap();

        let found = probe()
            .listen_on(&socket, Ipv4Addr::LOCALHOST, &[bulb])
            .await
            .unwrap();
        assert!(!found.is_empty());
        assert!(found
            .iter()
            .all(|(mac, from)| mac == "a8bb5006c3f1" && *from == bulb));
    }

    #[tokio::test]
    async fn describe_narrows_capabilities_by_module() {
        let bulb = fake_bulb("d8a01122aabb", "ESP03_SHDW1_01").await;
        let sighting = probe().describe("d8a01122aabb".into(), bulb).await;

        assert_eq!(sighting.id.as_str(), "wiz:d8a01122aabb");
        assert_eq!(sighting.display_name, "WiZ ESP03_SHDW1_01");
        assert_eq!(sighting.model.as_deref(), Some("ESP03_SHDW1_01"));
        let caps = sighting.effective_capabilities();
        assert!(caps.contains(Capability::Brightness));
        assert!(!caps.contains(Capability::Color));
        assert!(!caps.contains(Capability::ColorTemp));
    }

    #[tokio::test]
    async fn silent_bulb_keeps_default_capabilities() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let probe = WizProbe::new(
            Duration::from_millis(100),
            Duration::from_millis(200),
            CommandBridge::new(1, Duration::from_secs(1)),
        );

        let sighting = probe.describe("a1".into(), addr).await;
        assert_eq!(sighting.display_name, "WiZ 1");
        assert_eq!(sighting.capabilities, None);
        assert_eq!(sighting.address, Endpoint::new("127.0.0.1", addr.port()));
    }
}
