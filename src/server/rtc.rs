//! Peer-connection wiring.
//!
//! Bridges the WebRTC transport to the session core: inbound RTP is
//! Opus-decoded into PCM frames for the detector, the player's paced
//! frames are Opus-encoded onto the outbound track, and data channels
//! are routed to either the pingpong echo or the session's signaller.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::ServerState;
use crate::activity::ActivityKind;
use crate::audio::{AudioFrame, ChannelLayout};
use crate::config::AudioConfig;
use crate::player::PlayerStream;
use crate::session::Chatter;
use crate::signal::SignalChannel;
use crate::track::{AudioSource, TrackError};

/// Label the client uses for its liveness channel.
const PINGPONG_LABEL: &str = "pingpong";

/// Opus supports at most 120 ms per packet; at 48 kHz stereo that is
/// the decode buffer we need.
const MAX_OPUS_SAMPLES: usize = 5760;

/// Open peer connections, closed together on shutdown.
pub struct CallRegistry {
    calls: StdMutex<Vec<Arc<RTCPeerConnection>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn register(&self, pc: Arc<RTCPeerConnection>) {
        let mut calls = self.calls.lock().unwrap();
        // Drop handles whose connection already closed.
        calls.retain(|pc| {
            pc.connection_state() != RTCPeerConnectionState::Closed
        });
        calls.push(pc);
    }

    pub async fn close_all(&self) {
        let calls: Vec<_> = self.calls.lock().unwrap().drain(..).collect();
        for pc in calls {
            let _ = pc.close().await;
        }
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn opus_sample_rate(rate: u32) -> Result<SampleRate> {
    Ok(match rate {
        8_000 => SampleRate::Hz8000,
        12_000 => SampleRate::Hz12000,
        16_000 => SampleRate::Hz16000,
        24_000 => SampleRate::Hz24000,
        48_000 => SampleRate::Hz48000,
        other => bail!("sample rate {other} not supported by opus"),
    })
}

fn opus_channels(layout: ChannelLayout) -> Channels {
    match layout {
        ChannelLayout::Mono => Channels::Mono,
        ChannelLayout::Stereo => Channels::Stereo,
    }
}

/// The reply for one pingpong line, if it is one.
fn pingpong_reply(text: &str) -> Option<String> {
    text.strip_prefix("ping").map(|rest| format!("pong{rest}"))
}

// ---------------------------------------------------------------------------
// Inbound: RTP → PCM frames
// ---------------------------------------------------------------------------

/// Wraps a remote track, decoding its Opus payloads into the session's
/// PCM frame format.
pub struct RemoteAudioSource {
    track: Arc<TrackRemote>,
    id: String,
    decoder: StdMutex<OpusDecoder>,
    layout: ChannelLayout,
    rate: u32,
    pts: AtomicI64,
}

impl RemoteAudioSource {
    pub fn new(track: Arc<TrackRemote>, audio: &AudioConfig) -> Result<Self> {
        let decoder = OpusDecoder::new(
            opus_sample_rate(audio.sample_rate)?,
            opus_channels(audio.layout),
        )
        .context("Failed to create opus decoder")?;
        let id = track.id();
        Ok(Self {
            track,
            id,
            decoder: StdMutex::new(decoder),
            layout: audio.layout,
            rate: audio.sample_rate,
            pts: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl AudioSource for RemoteAudioSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn recv(&self) -> Result<AudioFrame, TrackError> {
        loop {
            let (packet, _) = self
                .track
                .read_rtp()
                .await
                .map_err(|_| TrackError::Ended)?;
            if packet.payload.is_empty() {
                continue;
            }
            let channels = self.layout.channels();
            let mut pcm = vec![0i16; MAX_OPUS_SAMPLES * channels];
            let samples = {
                let mut decoder = self.decoder.lock().unwrap();
                match decoder.decode(Some(packet.payload.as_ref()), &mut pcm, false) {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable packet");
                        continue;
                    }
                }
            };
            pcm.truncate(samples * channels);
            let pts = self.pts.fetch_add(samples as i64, Ordering::SeqCst);
            return Ok(AudioFrame::from_samples(pcm, self.layout, self.rate)
                .with_pts(Some(pts)));
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: PCM frames → Opus samples
// ---------------------------------------------------------------------------

/// Poll the player stream (which paces itself to real time), encode
/// each frame and hand it to the transport. Exits when the track
/// rejects a write, i.e. the connection is gone.
fn spawn_player_pump(
    stream: Arc<PlayerStream>,
    track: Arc<TrackLocalStaticSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let encoder = OpusEncoder::new(
            match opus_sample_rate(stream.rate()) {
                Ok(rate) => rate,
                Err(e) => {
                    error!(error = %e, "cannot encode outbound audio");
                    return;
                }
            },
            opus_channels(stream.layout()),
            Application::Voip,
        );
        let mut encoder = match encoder {
            Ok(encoder) => encoder,
            Err(e) => {
                error!(error = %e, "failed to create opus encoder");
                return;
            }
        };
        let mut out = vec![0u8; 1500];
        loop {
            let frame = stream.recv().await;
            let len = match encoder.encode(frame.data(), &mut out) {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "opus encode failed, skipping frame");
                    continue;
                }
            };
            let sample = webrtc::media::Sample {
                data: Bytes::copy_from_slice(&out[..len]),
                duration: Duration::from_secs_f64(frame.duration_secs()),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(error = %e, "outbound track closed, pump exiting");
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Signalling channel
// ---------------------------------------------------------------------------

struct RtcSignalChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl RtcSignalChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let label = dc.label().to_string();
        Self { dc, label }
    }
}

impl SignalChannel for RtcSignalChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, line: &str) {
        // The orchestrator never awaits a send; failures only matter
        // to the log.
        let dc = Arc::clone(&self.dc);
        let line = line.to_string();
        tokio::spawn(async move {
            if let Err(e) = dc.send_text(line).await {
                debug!(error = %e, "data channel send failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Offer handling
// ---------------------------------------------------------------------------

/// Accept an SDP offer: build the peer connection, allocate one
/// session, wire the callbacks and return the answer SDP.
pub async fn answer_call(state: &ServerState, offer_sdp: String) -> Result<String> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .context("Failed to register codecs")?;
    let api = APIBuilder::new().with_media_engine(media).build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .context("Failed to create peer connection")?,
    );
    info!("created peer connection");

    let chatter = Arc::new(Chatter::new(
        (*state.config).clone(),
        ActivityKind::Unstructured,
        "anonymous",
        state.services.clone(),
        Arc::clone(&state.store),
    ));

    // Outbound audio: the player's track, encoded to Opus.
    let audio = state.config.audio.clone();
    let local_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: audio.sample_rate,
            channels: audio.layout.channels() as u16,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            ..Default::default()
        },
        "audio".to_string(),
        "kaiwa".to_string(),
    ));
    pc.add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("Failed to add outbound track")?;
    let _pump = spawn_player_pump(chatter.audio_out(), local_track);

    // Inbound audio: decode and hand to the detector. The transport
    // surfaces remote tracks only once media flows, which can be after
    // the connection state reaches connected, so the session is also
    // (re)started here.
    let chatter_on_track = Arc::clone(&chatter);
    let track_audio = audio.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let chatter = Arc::clone(&chatter_on_track);
        let audio = track_audio.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                warn!(kind = %track.kind(), "ignoring non-audio track");
                return;
            }
            info!("audio track received");
            match RemoteAudioSource::new(track, &audio) {
                Ok(source) => {
                    if let Err(e) = chatter.detector().set_track(Arc::new(source)) {
                        warn!(error = %e, "rejected inbound track");
                        return;
                    }
                    if let Err(e) = chatter.start() {
                        error!(error = %e, "failed to start session");
                    }
                }
                Err(e) => error!(error = %e, "failed to wrap inbound track"),
            }
        })
    }));

    // Data channels: liveness echo or session signalling.
    let chatter_on_dc = Arc::clone(&chatter);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let chatter = Arc::clone(&chatter_on_dc);
        Box::pin(async move {
            info!(label = dc.label(), "data channel opened");
            if dc.label() == PINGPONG_LABEL {
                let replier = Arc::clone(&dc);
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let dc = Arc::clone(&replier);
                    Box::pin(async move {
                        if !msg.is_string {
                            return;
                        }
                        if let Ok(text) = std::str::from_utf8(&msg.data) {
                            if let Some(reply) = pingpong_reply(text) {
                                let _ = dc.send_text(reply).await;
                            }
                        }
                    })
                }));
            } else {
                chatter.attach_channel(Arc::new(RtcSignalChannel::new(dc)));
            }
        })
    }));

    // Lifecycle: start on connecting (a no-op until the track exists),
    // bound the data-channel wait once connected, tear down on failure.
    let chatter_on_state = Arc::clone(&chatter);
    let pc_weak = Arc::downgrade(&pc);
    let connect_timeout = Duration::from_secs_f64(state.config.session.connection_timeout_secs);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let chatter = Arc::clone(&chatter_on_state);
        let pc_weak = pc_weak.clone();
        Box::pin(async move {
            info!(state = %s, "connection state changed");
            match s {
                RTCPeerConnectionState::Connecting => {
                    if let Err(e) = chatter.start() {
                        debug!(error = %e, "session not startable yet");
                    }
                }
                RTCPeerConnectionState::Connected => {
                    if tokio::time::timeout(connect_timeout, chatter.wait_connected())
                        .await
                        .is_err()
                    {
                        warn!("timed out waiting for the signalling channel");
                    }
                }
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed => {
                    chatter.stop().await;
                    if let Some(pc) = pc_weak.upgrade() {
                        let _ = pc.close().await;
                    }
                }
                _ => {}
            }
        })
    }));

    // Offer/answer exchange, answering once ICE gathering settles.
    let offer = RTCSessionDescription::offer(offer_sdp).context("Failed to parse offer SDP")?;
    pc.set_remote_description(offer)
        .await
        .context("Failed to set remote description")?;
    let answer = pc
        .create_answer(None)
        .await
        .context("Failed to create answer")?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("Failed to set local description")?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .context("No local description after gathering")?;
    state.calls.register(pc);
    Ok(local.sdp)
}
