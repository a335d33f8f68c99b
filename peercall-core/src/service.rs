//! Call service facade and dispatch loop.
//!
//! [`CallService`] is the one object an application embeds. It wires the
//! signaling client, the media source, and the transport factory into a
//! [`CallStateMachine`], then runs the dispatch loop that feeds the machine
//! inbound signals, transport updates, and timer inputs one at a time.

use crate::call::{CallError, CallStateMachine, MachineHandles};
use crate::media::{MediaSource, MediaStream};
use crate::profile::DeviceSignals;
use crate::signaling::{SignalingChannel, SignalingClient};
use crate::transport::{PeerTransportFactory, ReconnectPolicy, TransportConfig};
use crate::types::{CallEvent, CallId, CallSnapshot};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// How long an unanswered call rings before timing out, on both sides.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(45);

/// Service errors.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The builder was missing a required component.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A call operation failed.
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Tunables for call sessions.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Ring window for unanswered calls.
    pub ring_timeout: Duration,
    /// Recovery policy applied when a connected link degrades.
    pub reconnect: ReconnectPolicy,
    /// Transport configuration handed to the backend factory.
    pub transport: TransportConfig,
    /// Device signals used to pick capture presets.
    pub device: DeviceSignals,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            transport: TransportConfig::default(),
            device: DeviceSignals::default(),
        }
    }
}

/// Peer-to-peer call service.
///
/// Owns the state machine and the dispatch loop driving it. All call
/// operations delegate to the machine; observation happens through
/// [`CallService::snapshot`], [`CallService::watch_snapshot`], and
/// [`CallService::subscribe_events`].
pub struct CallService<C: SignalingChannel> {
    local_user: C::PeerId,
    machine: Arc<CallStateMachine<C>>,
    signaling: Arc<SignalingClient<C>>,
    dispatch: JoinHandle<()>,
}

impl<C: SignalingChannel> CallService<C> {
    /// Creates a builder for a service bound to `local_user` on `channel`.
    #[must_use]
    pub fn builder(local_user: C::PeerId, channel: Arc<C>) -> CallServiceBuilder<C> {
        CallServiceBuilder::new(local_user, channel)
    }

    /// The identity this service answers signaling for.
    #[must_use]
    pub fn local_user(&self) -> &C::PeerId {
        &self.local_user
    }

    /// Starts an outgoing call.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] through [`ServiceError::Call`] when a
    /// session already exists.
    #[tracing::instrument(skip_all, fields(peer = %peer, video))]
    pub async fn start_call(&self, peer: C::PeerId, video: bool) -> Result<CallId, ServiceError> {
        let call_id = self.machine.start_call(peer, video).await?;
        Ok(call_id)
    }

    /// Accepts the currently ringing incoming call.
    ///
    /// # Errors
    ///
    /// Returns an error if no call is ringing.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), ServiceError> {
        self.machine.accept_call().await?;
        Ok(())
    }

    /// Declines the currently ringing incoming call.
    ///
    /// # Errors
    ///
    /// Returns an error if no call is ringing.
    #[tracing::instrument(skip(self))]
    pub async fn decline_call(&self) -> Result<(), ServiceError> {
        self.machine.decline_call().await?;
        Ok(())
    }

    /// Ends the active call; a no-op when idle.
    ///
    /// # Errors
    ///
    /// Currently infallible, kept fallible for facade symmetry.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        self.machine.end_call().await?;
        Ok(())
    }

    /// Toggles the microphone; returns the new muted state.
    ///
    /// # Errors
    ///
    /// Returns an error when no session with local media exists.
    pub async fn toggle_audio_mute(&self) -> Result<bool, ServiceError> {
        Ok(self.machine.toggle_audio_mute().await?)
    }

    /// Toggles the camera; returns the new muted state.
    ///
    /// # Errors
    ///
    /// Returns an error when the session carries no video track.
    pub async fn toggle_video_mute(&self) -> Result<bool, ServiceError> {
        Ok(self.machine.toggle_video_mute().await?)
    }

    /// Switches between voice and video; returns whether the session is a
    /// video call afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when no session exists or the camera cannot be
    /// acquired for an upgrade.
    pub async fn switch_call_type(&self) -> Result<bool, ServiceError> {
        Ok(self.machine.switch_call_type().await?)
    }

    /// Current call snapshot for UI rendering.
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.machine.snapshot()
    }

    /// Watch channel yielding a fresh snapshot on every change.
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.machine.watch_snapshot()
    }

    /// Subscribes to call events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<C::PeerId>> {
        self.machine.subscribe_events()
    }

    /// Local capture stream of the active session, if any.
    pub async fn local_stream(&self) -> Option<Arc<MediaStream>> {
        self.machine.local_stream().await
    }

    /// Remote stream of the active session, once available.
    pub async fn remote_stream(&self) -> Option<Arc<MediaStream>> {
        self.machine.remote_stream().await
    }

    /// Ends any active call and stops the signaling pump. The dispatch loop
    /// drains and exits once the subscription closes.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        tracing::info!("shutting down call service");
        if let Err(error) = self.machine.end_call().await {
            tracing::warn!(error = %error, "failed to end call during shutdown");
        }
        self.signaling.shutdown();
    }
}

impl<C: SignalingChannel> Drop for CallService<C> {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Builder for [`CallService`].
///
/// The signaling channel, media source, and transport factory are the three
/// seams an application provides; everything else defaults.
pub struct CallServiceBuilder<C: SignalingChannel> {
    local_user: C::PeerId,
    channel: Arc<C>,
    config: CallConfig,
    media: Option<Arc<dyn MediaSource>>,
    transports: Option<Arc<dyn PeerTransportFactory>>,
}

impl<C: SignalingChannel> CallServiceBuilder<C> {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new(local_user: C::PeerId, channel: Arc<C>) -> Self {
        Self {
            local_user,
            channel,
            config: CallConfig::default(),
            media: None,
            transports: None,
        }
    }

    /// Overrides the call configuration.
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the capture device source.
    #[must_use]
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Sets the peer transport factory.
    #[must_use]
    pub fn with_transport_factory(mut self, transports: Arc<dyn PeerTransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Builds the service and starts its dispatch loop.
    ///
    /// Spawns the signaling pump and the dispatch task, so it must be called
    /// from within a Tokio runtime even though it performs no I/O itself.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if the media source or transport
    /// factory was not provided.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<CallService<C>, ServiceError> {
        let media = self
            .media
            .ok_or_else(|| ServiceError::Config("a media source is required".to_string()))?;
        let transports = self
            .transports
            .ok_or_else(|| ServiceError::Config("a transport factory is required".to_string()))?;

        let signaling = Arc::new(SignalingClient::new(self.channel));
        // Subscribe before starting the pump so no early message is lost.
        let mut subscription = signaling.subscribe();
        signaling.start();

        let (machine, handles) = CallStateMachine::new(
            self.local_user.clone(),
            self.config,
            Arc::clone(&signaling),
            media,
            transports,
        );
        let MachineHandles {
            mut inputs,
            mut updates,
        } = handles;

        let loop_machine = Arc::clone(&machine);
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = subscription.recv() => match inbound {
                        Some(signal) => loop_machine.handle_signal(signal).await,
                        None => break,
                    },
                    Some((call_id, update)) = updates.recv() => {
                        loop_machine.handle_transport_update(call_id, update).await;
                    }
                    Some(input) = inputs.recv() => {
                        loop_machine.handle_input(input).await;
                    }
                }
            }
            tracing::debug!("call dispatch loop stopped");
        });

        Ok(CallService {
            local_user: self.local_user,
            machine,
            signaling,
            dispatch,
        })
    }
}
