//! Readiness and reachability probing.
//!
//! Before any iSCSI login the plugin waits for the volume to report a
//! state that admits I/O and for the target portal to accept TCP
//! connections. The bounded variants are used on the publish path, where
//! the orchestrator retries on a fixed cadence and a fast failure is
//! preferable to a hung RPC. The unbounded variant is reserved for the
//! repair path, where the mount is already owed and giving up would leave
//! an unusable workload behind.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::control::ControlPlane;
use crate::volume::VolumeState;

/// Retry schedule for the bounded probes.
///
/// The defaults leave roughly twelve seconds per probe, which lets each
/// publish RPC finish before the orchestrator re-issues it on its
/// fourteen-second cadence.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub retry_count: u32,
    pub retry_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            retry_count: 6,
            retry_interval: Duration::from_secs(2),
        }
    }
}

impl ProbeConfig {
    /// One full orchestrator cycle, used by the publish handler before it
    /// re-examines an in-progress mount.
    pub fn republish_delay(&self) -> Duration {
        self.retry_interval * self.retry_count
    }
}

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("volume {volume_id} is not ready: replicas yet to connect to target")]
    NotReady { volume_id: String },

    #[error("iSCSI target not reachable at {target_portal}: {reason}")]
    Unreachable {
        target_portal: String,
        reason: String,
    },

    #[error(transparent)]
    Control(#[from] crate::control::ControlPlaneError),
}

/// Wait until the volume reports a state that admits I/O.
///
/// Polls the control plane on the probe schedule; a status fetch error is
/// returned immediately so the caller can surface it.
pub async fn wait_volume_ready(
    control: &dyn ControlPlane,
    volume_id: &str,
    cfg: &ProbeConfig,
) -> Result<(), ReadinessError> {
    for attempt in 0..=cfg.retry_count {
        let status = control.volume_status(volume_id).await?;
        if status.admits_io() {
            info!(volume_id = %volume_id, status = %status, "volume is ready to accept IOs");
            return Ok(());
        }
        if attempt == cfg.retry_count {
            break;
        }
        tokio::time::sleep(cfg.retry_interval).await;
    }
    Err(ReadinessError::NotReady {
        volume_id: volume_id.to_string(),
    })
}

/// Wait until a short-lived TCP connection to the portal succeeds.
///
/// There is no point issuing iSCSI login commands while the portal does
/// not even accept connections.
pub async fn wait_portal_reachable(
    target_portal: &str,
    cfg: &ProbeConfig,
) -> Result<(), ReadinessError> {
    let mut last_error = String::new();
    for attempt in 1..=cfg.retry_count {
        match tokio::time::timeout(cfg.retry_interval, TcpStream::connect(target_portal)).await {
            Ok(Ok(conn)) => {
                drop(conn);
                info!(target_portal = %target_portal, "portal is reachable");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = "connect timed out".to_string(),
        }
        if attempt == cfg.retry_count {
            break;
        }
        tokio::time::sleep(cfg.retry_interval).await;
    }
    Err(ReadinessError::Unreachable {
        target_portal: target_portal.to_string(),
        reason: last_error,
    })
}

/// Block until the volume is both ready and reachable in the same pass.
///
/// Loops without bound; the only way out is success. Used by the repair
/// worker, where cancellation is equivalent to the volume being
/// unpublished.
pub async fn wait_ready_and_reachable(
    control: &dyn ControlPlane,
    vol: &VolumeState,
    cfg: &ProbeConfig,
) {
    loop {
        if let Err(e) = wait_volume_ready(control, &vol.volume_id, cfg).await {
            error!(volume_id = %vol.volume_id, error = %e, "volume not ready, retrying");
            continue;
        }
        match wait_portal_reachable(&vol.iscsi.target_portal, cfg).await {
            Ok(()) => return,
            Err(e) => {
                error!(volume_id = %vol.volume_id, error = %e, "portal not reachable, retrying")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fake::FakeControlPlane;
    use crate::control::VolumeStatus;
    use std::net::TcpListener;

    fn fast() -> ProbeConfig {
        ProbeConfig {
            retry_count: 3,
            retry_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn ready_when_status_is_healthy() {
        let control = FakeControlPlane::with_volume("pvc-1");
        assert!(wait_volume_ready(&control, "pvc-1", &fast()).await.is_ok());
    }

    #[tokio::test]
    async fn ready_when_status_is_degraded() {
        let control = FakeControlPlane::with_volume("pvc-1");
        control
            .statuses
            .lock()
            .await
            .insert("pvc-1".into(), VolumeStatus::Degraded);
        assert!(wait_volume_ready(&control, "pvc-1", &fast()).await.is_ok());
    }

    #[tokio::test]
    async fn offline_volume_exhausts_the_bound() {
        let control = FakeControlPlane::with_volume("pvc-1");
        control
            .statuses
            .lock()
            .await
            .insert("pvc-1".into(), VolumeStatus::Offline);

        let err = wait_volume_ready(&control, "pvc-1", &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::NotReady { .. }));
    }

    #[tokio::test]
    async fn volume_becoming_ready_within_the_bound_succeeds() {
        let control = FakeControlPlane::with_volume("pvc-1");
        control
            .statuses
            .lock()
            .await
            .insert("pvc-1".into(), VolumeStatus::Offline);

        let flip = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            control
                .statuses
                .lock()
                .await
                .insert("pvc-1".into(), VolumeStatus::Healthy);
        };
        let fast_cfg = fast();
        let wait = wait_volume_ready(&control, "pvc-1", &fast_cfg);
        let (_, result) = tokio::join!(flip, wait);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn reachable_portal_succeeds_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let portal = listener.local_addr().unwrap().to_string();
        assert!(wait_portal_reachable(&portal, &fast()).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_portal_fails_after_the_bound() {
        // Grab a port and close it again so nothing is listening.
        let portal = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = wait_portal_reachable(&portal, &fast()).await.unwrap_err();
        assert!(matches!(err, ReadinessError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn ready_and_reachable_returns_once_both_hold() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let portal = listener.local_addr().unwrap().to_string();

        let control = FakeControlPlane::with_volume("pvc-1");
        let vol = VolumeState {
            volume_id: "pvc-1".into(),
            iscsi: crate::volume::IscsiSpec {
                target_portal: portal,
                ..Default::default()
            },
            ..Default::default()
        };

        wait_ready_and_reachable(&control, &vol, &fast()).await;
    }

    #[test]
    fn republish_delay_is_one_full_cycle() {
        let cfg = ProbeConfig::default();
        assert_eq!(cfg.republish_delay(), Duration::from_secs(12));
    }
}
