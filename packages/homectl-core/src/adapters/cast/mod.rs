//! Google Cast adapter (push).
//!
//! Commands and state fetches use a short-lived connection: CONNECT to the
//! platform receiver, one request/reply exchange, CLOSE. [`CastAdapter::watch`]
//! holds a connection open, answers heartbeats and turns unsolicited
//! `RECEIVER_STATUS` / `MEDIA_STATUS` broadcasts into [`StatePatch`]es.

mod channel;
mod messages;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use self::channel::{read_message, write_message, CastMessage};
use self::messages::{Application, Incoming, MediaStatus, ReceiverStatus};
use super::{DeviceAdapter, DeviceSession};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capability, DeviceCommand, DeviceDescriptor, DeviceState, MediaInfo, MediaPatch,
    PlaybackState, Protocol, StatePatch, Transport,
};
use crate::protocol_constants::{
    CAST_HEARTBEAT_INTERVAL_SECS, CAST_IDLE_TIMEOUT_SECS, CAST_NS_CONNECTION, CAST_NS_HEARTBEAT,
    CAST_NS_MEDIA, CAST_NS_RECEIVER, CAST_RECEIVER_ID, CAST_SENDER_ID,
};
use crate::utils::now_millis;

pub struct CastAdapter {
    timeout: Duration,
}

impl CastAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DeviceAdapter for CastAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Chromecast
    }

    fn transport(&self) -> Transport {
        Transport::Push
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceSession>> {
        let addr = descriptor.address.socket_addr()?;
        let stream = channel::open(addr, self.timeout).await?;
        let session = CastSession::start(stream, self.timeout).await?;
        Ok(Box::new(session))
    }

    async fn watch(
        &self,
        descriptor: &DeviceDescriptor,
        sink: mpsc::Sender<StatePatch>,
    ) -> DeviceResult<()> {
        let addr = descriptor.address.socket_addr()?;
        let stream = channel::open(addr, self.timeout).await?;
        log::debug!("[Cast] Watching {} at {}", descriptor.id, addr);
        run_watch(
            stream,
            sink,
            Duration::from_secs(CAST_HEARTBEAT_INTERVAL_SECS),
            Duration::from_secs(CAST_IDLE_TIMEOUT_SECS),
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/reply session
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct CastSession<S> {
    stream: S,
    timeout: Duration,
    next_request: u32,
    /// Application transports this session has sent CONNECT to.
    connected: HashSet<String>,
}

impl<S> CastSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) async fn start(stream: S, timeout: Duration) -> DeviceResult<Self> {
        let mut session = Self {
            stream,
            timeout,
            next_request: 0,
            connected: HashSet::new(),
        };
        session
            .send(CAST_RECEIVER_ID, CAST_NS_CONNECTION, &messages::connect())
            .await?;
        Ok(session)
    }

    async fn send(&mut self, destination: &str, namespace: &str, payload: &Value) -> DeviceResult<()> {
        let message = CastMessage::json(CAST_SENDER_ID, destination, namespace, payload);
        write_message(&mut self.stream, &message).await
    }

    /// Sends a request and waits for the reply carrying the same request id.
    async fn request(
        &mut self,
        destination: &str,
        namespace: &str,
        build: impl FnOnce(u32) -> Value,
    ) -> DeviceResult<Incoming> {
        self.next_request += 1;
        let request_id = self.next_request;
        let payload = build(request_id);
        let timeout = self.timeout;

        let exchange = async {
            self.send(destination, namespace, &payload).await?;
            loop {
                let message = read_message(&mut self.stream).await?;
                let (reply_id, incoming) = messages::parse(&message.payload()?)?;
                match incoming {
                    Incoming::Ping => {
                        let reply = CastMessage::json(
                            CAST_SENDER_ID,
                            &message.source_id,
                            CAST_NS_HEARTBEAT,
                            &messages::pong(),
                        );
                        write_message(&mut self.stream, &reply).await?;
                    }
                    Incoming::Close if message.source_id == CAST_RECEIVER_ID => {
                        return Err(DeviceError::DeviceUnreachable(
                            "receiver closed the connection".into(),
                        ));
                    }
                    Incoming::Failure(reason) if reply_id == request_id => {
                        return Err(DeviceError::ProtocolError(reason));
                    }
                    incoming if reply_id == request_id => return Ok(incoming),
                    _ => {}
                }
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DeviceError::DeviceUnreachable("no reply from receiver".into()))?
    }

    async fn receiver_status(&mut self) -> DeviceResult<ReceiverStatus> {
        match self
            .request(CAST_RECEIVER_ID, CAST_NS_RECEIVER, messages::get_status)
            .await?
        {
            Incoming::Receiver(status) => Ok(status),
            other => Err(unexpected("RECEIVER_STATUS", &other)),
        }
    }

    async fn media_status(&mut self, app: &Application) -> DeviceResult<Option<MediaStatus>> {
        let transport = app.transport_id.clone();
        if self.connected.insert(transport.clone()) {
            self.send(&transport, CAST_NS_CONNECTION, &messages::connect())
                .await?;
        }
        match self
            .request(&transport, CAST_NS_MEDIA, messages::get_status)
            .await?
        {
            Incoming::Media(status) => Ok(status),
            other => Err(unexpected("MEDIA_STATUS", &other)),
        }
    }

    async fn set_volume(&mut self, build: impl FnOnce(u32) -> Value) -> DeviceResult<()> {
        match self.request(CAST_RECEIVER_ID, CAST_NS_RECEIVER, build).await? {
            Incoming::Receiver(_) => Ok(()),
            other => Err(unexpected("RECEIVER_STATUS", &other)),
        }
    }

    async fn stop_app(&mut self) -> DeviceResult<()> {
        let status = self.receiver_status().await?;
        let Some(app) = status.active_app() else {
            return Ok(());
        };
        log::info!("[Cast] Stopping {} ({})", app.display_name, app.app_id);
        let session_id = app.session_id.clone();
        match self
            .request(CAST_RECEIVER_ID, CAST_NS_RECEIVER, |id| {
                messages::stop_app(id, &session_id)
            })
            .await?
        {
            Incoming::Receiver(_) => Ok(()),
            other => Err(unexpected("RECEIVER_STATUS", &other)),
        }
    }

    async fn media_command(&mut self, action: crate::model::MediaAction) -> DeviceResult<()> {
        let status = self.receiver_status().await?;
        let app = status
            .media_app()
            .cloned()
            .ok_or_else(|| DeviceError::ProtocolError("no active media session".into()))?;
        let media = self
            .media_status(&app)
            .await?
            .ok_or_else(|| DeviceError::ProtocolError("no active media session".into()))?;
        let media_session_id = media.media_session_id;
        match self
            .request(&app.transport_id, CAST_NS_MEDIA, |id| {
                messages::media_control(id, media_session_id, action)
            })
            .await?
        {
            Incoming::Media(_) => Ok(()),
            other => Err(unexpected("MEDIA_STATUS", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Incoming) -> DeviceError {
    DeviceError::ProtocolError(format!("expected {wanted}, got {got:?}"))
}

#[async_trait]
impl<S> DeviceSession for CastSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        match *command {
            DeviceCommand::SetPower { on: false } => self.stop_app().await,
            // No remote power-on; answering GET_STATUS is all "on" can mean.
            DeviceCommand::SetPower { on: true } => self.receiver_status().await.map(|_| ()),
            DeviceCommand::SetVolume { level } => {
                self.set_volume(|id| messages::set_volume_level(id, level))
                    .await
            }
            DeviceCommand::SetMuted { muted } => {
                self.set_volume(|id| messages::set_muted(id, muted)).await
            }
            DeviceCommand::Media { action } => self.media_command(action).await,
            DeviceCommand::SetBrightness { .. } => {
                Err(DeviceError::UnsupportedCapability(Capability::Brightness))
            }
            DeviceCommand::SetColor { .. } => {
                Err(DeviceError::UnsupportedCapability(Capability::Color))
            }
        }
    }

    async fn fetch_state(&mut self) -> DeviceResult<DeviceState> {
        let status = self.receiver_status().await?;
        let media = match (status.media_app().cloned(), status.active_app()) {
            (Some(app), _) => {
                let info = match self.media_status(&app).await? {
                    Some(media) => media.to_info(Some(&app.display_name)),
                    None => idle_app(&app),
                };
                Some(info)
            }
            (None, Some(app)) => Some(idle_app(app)),
            (None, None) => None,
        };

        Ok(DeviceState {
            power: !status.is_stand_by,
            volume: status.volume_percent(),
            muted: status.volume.muted,
            media,
            reachable: true,
            last_updated: now_millis(),
            ..DeviceState::default()
        })
    }

    async fn close(mut self: Box<Self>) {
        let transports: Vec<String> = self.connected.drain().collect();
        for transport in transports {
            let _ = self
                .send(&transport, CAST_NS_CONNECTION, &messages::close())
                .await;
        }
        let _ = self
            .send(CAST_RECEIVER_ID, CAST_NS_CONNECTION, &messages::close())
            .await;
        let _ = self.stream.shutdown().await;
    }
}

fn idle_app(app: &Application) -> MediaInfo {
    MediaInfo {
        playback: PlaybackState::Idle,
        app: Some(app.display_name.clone()),
        ..MediaInfo::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch loop
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks which media transport the watcher is subscribed to.
#[derive(Default)]
struct WatchState {
    media_transport: Option<String>,
    app_name: Option<String>,
    next_request: u32,
}

impl WatchState {
    fn request_id(&mut self) -> u32 {
        self.next_request += 1;
        self.next_request
    }

    /// Translates a receiver broadcast. Returns the patch and, when a new
    /// media application appeared, the transport to subscribe to.
    fn on_receiver(&mut self, status: &ReceiverStatus) -> (StatePatch, Option<String>) {
        let mut patch = StatePatch {
            power: Some(!status.is_stand_by),
            volume: status.volume_percent(),
            muted: status.volume.muted,
            media: MediaPatch::Keep,
        };

        let mut subscribe = None;
        match (status.media_app(), status.active_app()) {
            (Some(app), _) => {
                self.app_name = Some(app.display_name.clone());
                if self.media_transport.as_deref() != Some(app.transport_id.as_str()) {
                    self.media_transport = Some(app.transport_id.clone());
                    subscribe = Some(app.transport_id.clone());
                }
            }
            (None, Some(app)) => {
                self.media_transport = None;
                self.app_name = Some(app.display_name.clone());
                patch.media = MediaPatch::Set(idle_app(app));
            }
            (None, None) => {
                self.media_transport = None;
                self.app_name = None;
                patch.media = MediaPatch::Clear;
            }
        }
        (patch, subscribe)
    }

    fn on_media(&self, status: Option<&MediaStatus>) -> StatePatch {
        let info = match status {
            Some(status) => status.to_info(self.app_name.as_deref()),
            None => MediaInfo {
                playback: PlaybackState::Idle,
                app: self.app_name.clone(),
                ..MediaInfo::default()
            },
        };
        StatePatch {
            media: MediaPatch::Set(info),
            ..StatePatch::default()
        }
    }
}

/// Runs the push subscription on an established stream.
///
/// Frames are read on a separate task so that a heartbeat tick never cancels
/// a partially read frame.
pub(crate) async fn run_watch<S>(
    stream: S,
    sink: mpsc::Sender<StatePatch>,
    heartbeat: Duration,
    idle_timeout: Duration,
) -> DeviceResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (frames_tx, mut frames_rx) = mpsc::channel(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_message(&mut reader).await;
            let failed = frame.is_err();
            if frames_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let result = watch_loop(&mut writer, &mut frames_rx, &sink, heartbeat, idle_timeout).await;
    reader_task.abort();
    let _ = writer.shutdown().await;
    result
}

async fn watch_loop<W>(
    writer: &mut W,
    frames: &mut mpsc::Receiver<DeviceResult<CastMessage>>,
    sink: &mpsc::Sender<StatePatch>,
    heartbeat: Duration,
    idle_timeout: Duration,
) -> DeviceResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut state = WatchState::default();
    let send = |destination: &str, namespace: &str, payload: Value| {
        CastMessage::json(CAST_SENDER_ID, destination, namespace, &payload)
    };

    write_message(writer, &send(CAST_RECEIVER_ID, CAST_NS_CONNECTION, messages::connect())).await?;
    let request_id = state.request_id();
    write_message(
        writer,
        &send(CAST_RECEIVER_ID, CAST_NS_RECEIVER, messages::get_status(request_id)),
    )
    .await?;

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_traffic = Instant::now();

    loop {
        tokio::select! {
            _ = sink.closed() => return Ok(()),
            _ = ticker.tick() => {
                if last_traffic.elapsed() >= idle_timeout {
                    return Err(DeviceError::DeviceUnreachable(format!(
                        "no traffic for {}s",
                        idle_timeout.as_secs()
                    )));
                }
                write_message(writer, &send(CAST_RECEIVER_ID, CAST_NS_HEARTBEAT, messages::ping())).await?;
            }
            frame = frames.recv() => {
                let message = match frame {
                    Some(frame) => frame?,
                    None => return Err(DeviceError::DeviceUnreachable("connection closed".into())),
                };
                last_traffic = Instant::now();

                let payload = match message.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::debug!("[Cast] Ignoring frame on {}: {}", message.namespace, e);
                        continue;
                    }
                };
                let incoming = match messages::parse(&payload) {
                    Ok((_, incoming)) => incoming,
                    Err(e) => {
                        log::debug!("[Cast] Ignoring reply: {}", e);
                        continue;
                    }
                };

                let patch = match incoming {
                    Incoming::Ping => {
                        write_message(writer, &send(&message.source_id, CAST_NS_HEARTBEAT, messages::pong())).await?;
                        None
                    }
                    Incoming::Close if message.source_id == CAST_RECEIVER_ID => {
                        return Err(DeviceError::DeviceUnreachable("receiver closed the connection".into()));
                    }
                    Incoming::Receiver(status) => {
                        let (patch, subscribe) = state.on_receiver(&status);
                        if let Some(transport) = subscribe {
                            let request_id = state.request_id();
                            write_message(writer, &send(&transport, CAST_NS_CONNECTION, messages::connect())).await?;
                            write_message(writer, &send(&transport, CAST_NS_MEDIA, messages::get_status(request_id))).await?;
                        }
                        Some(patch)
                    }
                    Incoming::Media(status) => Some(state.on_media(status.as_ref())),
                    _ => None,
                };

                if let Some(patch) = patch {
                    if sink.send(patch).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaAction;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    type Log = Arc<Mutex<Vec<(String, Value)>>>;

    fn receiver_status(request_id: u32, with_media: bool) -> Value {
        let applications = if with_media {
            json!([{
                "appId": "CC1AD845",
                "displayName": "Default Media Receiver",
                "sessionId": "session-1",
                "transportId": "web-5",
                "namespaces": [{ "name": CAST_NS_MEDIA }],
            }])
        } else {
            json!([])
        };
        json!({
            "type": "RECEIVER_STATUS",
            "requestId": request_id,
            "status": {
                "applications": applications,
                "volume": { "level": 0.6, "muted": true },
                "isStandBy": false,
            }
        })
    }

    fn media_status(request_id: u32) -> Value {
        json!({
            "type": "MEDIA_STATUS",
            "requestId": request_id,
            "status": [{
                "mediaSessionId": 11,
                "playerState": "PLAYING",
                "currentTime": 3.0,
                "media": { "metadata": { "title": "So What" } }
            }]
        })
    }

    /// Plays a receiver: answers GET_STATUS and volume/stop/media requests and
    /// logs every (namespace, payload) it sees.
    fn spawn_receiver(stream: DuplexStream, with_media: bool) -> Log {
        let log: Log = Arc::default();
        let seen = log.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(stream);
            while let Ok(message) = read_message(&mut reader).await {
                let payload = message.payload().unwrap();
                seen.lock().push((message.namespace.clone(), payload.clone()));
                let id = payload["requestId"].as_u64().unwrap_or(0) as u32;
                let reply = match (message.namespace.as_str(), payload["type"].as_str()) {
                    (CAST_NS_RECEIVER, Some(_)) => Some(receiver_status(id, with_media)),
                    (CAST_NS_MEDIA, Some(_)) => Some(media_status(id)),
                    _ => None,
                };
                if let Some(reply) = reply {
                    let frame = CastMessage::json(
                        &message.destination_id,
                        CAST_SENDER_ID,
                        &message.namespace,
                        &reply,
                    );
                    if write_message(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
            }
        });
        log
    }

    async fn session(with_media: bool) -> (CastSession<DuplexStream>, Log) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let log = spawn_receiver(server, with_media);
        let session = CastSession::start(client, Duration::from_secs(2))
            .await
            .unwrap();
        (session, log)
    }

    #[tokio::test]
    async fn fetch_state_reads_receiver_and_media_status() {
        let (mut session, _) = session(true).await;
        let state = session.fetch_state().await.unwrap();

        assert!(state.power);
        assert!(state.reachable);
        assert_eq!(state.volume, Some(60));
        assert_eq!(state.muted, Some(true));
        let media = state.media.unwrap();
        assert_eq!(media.playback, PlaybackState::Playing);
        assert_eq!(media.title.as_deref(), Some("So What"));
        assert_eq!(media.app.as_deref(), Some("Default Media Receiver"));
    }

    #[tokio::test]
    async fn power_off_stops_the_running_app() {
        let (mut session, log) = session(true).await;
        session
            .apply_command(&DeviceCommand::SetPower { on: false })
            .await
            .unwrap();

        let stop = log
            .lock()
            .iter()
            .find(|(_, payload)| payload["type"] == "STOP")
            .map(|(_, payload)| payload.clone())
            .unwrap();
        assert_eq!(stop["sessionId"], "session-1");
    }

    #[tokio::test]
    async fn media_command_targets_the_media_session() {
        let (mut session, log) = session(true).await;
        session
            .apply_command(&DeviceCommand::Media {
                action: MediaAction::Pause,
            })
            .await
            .unwrap();

        let pause = log
            .lock()
            .iter()
            .find(|(ns, payload)| ns == CAST_NS_MEDIA && payload["type"] == "PAUSE")
            .map(|(_, payload)| payload.clone())
            .unwrap();
        assert_eq!(pause["mediaSessionId"], 11);
    }

    #[tokio::test]
    async fn media_command_without_session_is_a_protocol_error() {
        let (mut session, _) = session(false).await;
        let err = session
            .apply_command(&DeviceCommand::Media {
                action: MediaAction::Play,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn brightness_is_unsupported() {
        let (mut session, _) = session(false).await;
        let err = session
            .apply_command(&DeviceCommand::SetBrightness { level: 10 })
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::UnsupportedCapability(Capability::Brightness));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_receiver_times_out_as_unreachable() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut session = CastSession::start(client, Duration::from_secs(2))
            .await
            .unwrap();
        let err = session.fetch_state().await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnreachable(_)));
    }

    #[tokio::test]
    async fn watch_reports_patches_and_answers_heartbeats() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sink, mut patches) = mpsc::channel(8);
        let watcher = tokio::spawn(run_watch(
            client,
            sink,
            Duration::from_secs(60),
            Duration::from_secs(120),
        ));

        let (mut reader, mut writer) = tokio::io::split(server);
        // CONNECT, then GET_STATUS.
        read_message(&mut reader).await.unwrap();
        let get_status = read_message(&mut reader).await.unwrap();
        let id = get_status.payload().unwrap()["requestId"].as_u64().unwrap() as u32;

        let ping = CastMessage::json(CAST_RECEIVER_ID, CAST_SENDER_ID, CAST_NS_HEARTBEAT, &messages::ping());
        write_message(&mut writer, &ping).await.unwrap();
        let pong = read_message(&mut reader).await.unwrap();
        assert_eq!(pong.payload().unwrap()["type"], "PONG");

        let status = CastMessage::json(
            CAST_RECEIVER_ID,
            CAST_SENDER_ID,
            CAST_NS_RECEIVER,
            &receiver_status(id, false),
        );
        write_message(&mut writer, &status).await.unwrap();
        let patch = patches.recv().await.unwrap();
        assert_eq!(patch.power, Some(true));
        assert_eq!(patch.volume, Some(60));
        assert_eq!(patch.media, MediaPatch::Clear);

        drop(writer);
        drop(reader);
        let result = watcher.await.unwrap();
        assert!(matches!(result, Err(DeviceError::DeviceUnreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_gives_up_on_a_silent_receiver() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let (sink, _patches) = mpsc::channel(8);
        let result = run_watch(
            client,
            sink,
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(DeviceError::DeviceUnreachable(m)) if m.contains("30s")));
    }

    #[tokio::test]
    async fn watch_ends_quietly_when_the_sink_closes() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let (sink, patches) = mpsc::channel(8);
        drop(patches);
        let result = run_watch(client, sink, Duration::from_secs(5), Duration::from_secs(30)).await;
        assert!(result.is_ok());
    }
}
