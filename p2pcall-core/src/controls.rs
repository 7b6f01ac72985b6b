//! In-call media controls
//!
//! Mute and camera toggles flip the `enabled` flag of the local tracks; the
//! devices stay open. Camera switching opens the next camera, swaps the
//! outbound track on the peer session without renegotiation, and replaces
//! the track inside the local stream.

use crate::call::{CallError, CallManager};
use crate::events::CallEvent;
use crate::media::{MediaError, TrackKind};
use crate::types::{CallPhase, CallType};
use std::time::Duration;

impl CallManager {
    /// Mute or unmute the microphone. Returns the new muted flag.
    ///
    /// Without a local stream nothing changes and the current flag is
    /// returned.
    pub fn toggle_mute(&self) -> bool {
        let mut ctx = self.inner.context.lock();
        let Some(stream) = ctx.snapshot.local_stream.clone() else {
            return ctx.snapshot.is_muted;
        };
        let muted = !ctx.snapshot.is_muted;
        for track in stream.audio_tracks() {
            track.set_enabled(!muted);
        }
        ctx.snapshot.is_muted = muted;
        tracing::debug!(call_id = ?ctx.snapshot.call_id, muted, "Microphone toggled");
        muted
    }

    /// Enable or disable the camera. Returns the new enabled flag.
    ///
    /// Without a local stream nothing changes and the current flag is
    /// returned.
    pub fn toggle_video(&self) -> bool {
        let mut ctx = self.inner.context.lock();
        let Some(stream) = ctx.snapshot.local_stream.clone() else {
            return ctx.snapshot.is_video_enabled;
        };
        let enabled = !ctx.snapshot.is_video_enabled;
        for track in stream.video_tracks() {
            track.set_enabled(enabled);
        }
        ctx.snapshot.is_video_enabled = enabled;
        tracing::debug!(call_id = ?ctx.snapshot.call_id, enabled, "Camera toggled");
        enabled
    }

    /// Switch to the next camera
    ///
    /// Cameras are taken in platform order, wrapping around. Returns
    /// `Ok(false)` when fewer than two cameras exist. On success the local
    /// stream keeps its id, the old camera track is stopped and
    /// `stream-ready` fires with the updated stream. A failed switch leaves
    /// the call and the current camera as they were.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless a video call is connected,
    /// or the device/peer error that stopped the switch.
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self) -> Result<bool, CallError> {
        let (call_id, current_device, peer, video_enabled) = {
            let ctx = self.inner.context.lock();
            let phase = ctx.snapshot.phase();
            let video_call = ctx.snapshot.call_type == Some(CallType::Video);
            match (phase, video_call, ctx.snapshot.call_id, &ctx.snapshot.local_stream) {
                (CallPhase::Connected, true, Some(call_id), Some(local)) => (
                    call_id,
                    local
                        .video_track()
                        .and_then(|t| t.device_id().map(str::to_owned)),
                    ctx.peer.clone(),
                    ctx.snapshot.is_video_enabled,
                ),
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "switch_camera",
                        phase,
                    })
                }
            }
        };

        let cameras = self.inner.media.enumerate_video_inputs().await?;
        if cameras.len() < 2 {
            tracing::debug!(call_id = %call_id, cameras = cameras.len(), "Nothing to switch to");
            return Ok(false);
        }
        let next_index = current_device
            .and_then(|id| cameras.iter().position(|d| d.device_id == id))
            .map_or(0, |i| (i + 1) % cameras.len());
        let next = &cameras[next_index];

        let fresh = self
            .inner
            .media
            .get_video_from_device(&next.device_id)
            .await?;
        let Some(new_track) = fresh.video_track().cloned() else {
            fresh.stop_all();
            return Err(MediaError::StreamError(format!("{} produced no video track", next.label)).into());
        };
        new_track.set_enabled(video_enabled);
        if !self.is_current(call_id) {
            fresh.stop_all();
            return Err(CallError::Superseded(call_id));
        }

        if let Some(peer) = &peer {
            if let Err(e) = peer
                .replace_outbound_track(TrackKind::Video, new_track.clone())
                .await
            {
                tracing::warn!(call_id = %call_id, error = %e, "Outbound track replacement failed");
                fresh.stop_all();
                return Err(e.into());
            }
        }

        let swapped = {
            let mut ctx = self.inner.context.lock();
            let enabled = ctx.snapshot.is_video_enabled;
            match (ctx.is_current(call_id), ctx.snapshot.local_stream.take()) {
                (true, Some(local)) => {
                    new_track.set_enabled(enabled);
                    let (updated, old) = local.with_replaced_track(new_track.clone());
                    ctx.snapshot.local_stream = Some(updated.clone());
                    Some((updated, old))
                }
                (_, local) => {
                    ctx.snapshot.local_stream = local;
                    None
                }
            }
        };
        let Some((updated, old)) = swapped else {
            fresh.stop_all();
            return Err(CallError::Superseded(call_id));
        };
        if let Some(old) = old {
            old.stop();
        }

        tracing::info!(call_id = %call_id, device = %next.device_id, "Camera switched");
        self.emit(CallEvent::StreamReady {
            call_id,
            stream: updated,
        });
        Ok(true)
    }

    /// Time since the call started; zero unless connected
    pub fn get_call_duration(&self) -> Duration {
        let ctx = self.inner.context.lock();
        match (ctx.snapshot.is_in_call, ctx.started_at) {
            (true, Some(started_at)) => started_at.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::call::CallManager;
    use crate::types::{CallType, CallUser};
    use std::time::Duration;

    #[tokio::test]
    async fn test_toggles_without_stream_are_noops() {
        let manager = CallManager::new();
        assert!(!manager.toggle_mute());
        assert!(manager.toggle_video());
        assert!(manager.get_call_state().is_idle());
    }

    #[tokio::test]
    async fn test_toggles_while_ringing() {
        let manager = CallManager::new();
        manager
            .simulate_incoming_call(CallUser::new("dan", "Dan"), CallType::Video)
            .unwrap();
        // no local stream until accepted
        assert!(!manager.toggle_mute());
        assert!(!manager.get_call_state().is_muted);
    }

    #[tokio::test]
    async fn test_duration_zero_when_idle() {
        let manager = CallManager::new();
        assert_eq!(manager.get_call_duration(), Duration::ZERO);
    }
}
