//! Telescope unit and typed actor clients

use crate::config::{CameraRole, GuiderConfig};
use crate::error::{GuideError, GuideResult};
use crate::matrix::CalibrationMatrix;
use crate::strategy::Frame;
use autoguide_proxy::{deadline, invoke, PendingCall, ProxyConfig, ProxyError, ProxyResult, Record, RemoteTarget, SharedBus};
use serde_json::Value;
use tokio::sync::RwLock;

/// Mount controller
#[derive(Debug, Clone)]
pub struct MountClient {
    target: RemoteTarget,
}

impl MountClient {
    pub fn new(target: RemoteTarget) -> Self {
        Self { target }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn status(&self) -> PendingCall {
        self.target.command("status").issue()
    }

    /// Relative offset in mount-axis arcsec
    pub fn offset(&self, ra_arcsec: f64, dec_arcsec: f64) -> PendingCall {
        self.target
            .command("offset")
            .kwarg("ra_add_arcsec", ra_arcsec)
            .kwarg("dec_add_arcsec", dec_arcsec)
            .issue()
    }

    /// Current declination in degrees, read from the status reply
    pub async fn declination(&self, key: &str) -> GuideResult<f64> {
        let status = single(invoke(vec![self.status()]).await?, self.name())?;
        Ok(status.require::<f64>(key)?)
    }
}

/// Focuser controller
#[derive(Debug, Clone)]
pub struct FocuserClient {
    target: RemoteTarget,
}

impl FocuserClient {
    pub fn new(target: RemoteTarget) -> Self {
        Self { target }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn move_absolute(&self, value: f64, unit: &str) -> PendingCall {
        self.target.command("moveabsolute").arg(value).arg(unit).issue()
    }

    pub fn move_relative(&self, value: f64, unit: &str) -> PendingCall {
        self.target.command("moverelative").arg(value).arg(unit).issue()
    }
}

/// Field derotator controller
#[derive(Debug, Clone)]
pub struct DerotatorClient {
    target: RemoteTarget,
}

impl DerotatorClient {
    pub fn new(target: RemoteTarget) -> Self {
        Self { target }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn move_relative(&self, degrees: f64) -> PendingCall {
        self.target.command("moverelative").arg(degrees).arg("DEG").issue()
    }
}

/// Guide camera controller
#[derive(Debug, Clone)]
pub struct CameraClient {
    target: RemoteTarget,
    role: CameraRole,
    exposure_buffer_secs: f64,
}

impl CameraClient {
    pub fn new(target: RemoteTarget, role: CameraRole, exposure_buffer_secs: f64) -> Self {
        Self {
            target,
            role,
            exposure_buffer_secs,
        }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn role(&self) -> CameraRole {
        self.role
    }

    /// Expose for `exptime` seconds; the call deadline covers readout
    pub fn expose(&self, exptime: f64) -> ProxyResult<PendingCall> {
        let timeout = deadline(exptime + self.exposure_buffer_secs)?;
        Ok(self.target.command("expose").arg(exptime).timeout(timeout).issue())
    }

    fn frame_from(&self, record: &Record) -> GuideResult<Frame> {
        let filename = record
            .get::<String>("filename")
            .or_else(|| {
                record
                    .as_body()
                    .values()
                    .filter_map(Value::as_object)
                    .find_map(|nested| nested.get("filename").and_then(Value::as_str))
                    .map(str::to_string)
            })
            .ok_or_else(|| ProxyError::MissingKey {
                actor: self.name().to_string(),
                key: "filename".to_string(),
            })?;

        Ok(Frame {
            camera: self.name().to_string(),
            role: self.role,
            filename,
        })
    }
}

/// One telescope with its mount, optional focuser and derotator, and guide cameras
#[derive(Debug)]
pub struct TelescopeUnit {
    name: String,
    mount: MountClient,
    focuser: Option<FocuserClient>,
    derotator: Option<DerotatorClient>,
    cameras: Vec<CameraClient>,
    calibration: RwLock<Option<CalibrationMatrix>>,
}

impl TelescopeUnit {
    pub fn new(name: impl Into<String>, mount: MountClient, cameras: Vec<CameraClient>) -> Self {
        Self {
            name: name.into(),
            mount,
            focuser: None,
            derotator: None,
            cameras,
            calibration: RwLock::new(None),
        }
    }

    pub fn with_focuser(mut self, focuser: FocuserClient) -> Self {
        self.focuser = Some(focuser);
        self
    }

    pub fn with_derotator(mut self, derotator: DerotatorClient) -> Self {
        self.derotator = Some(derotator);
        self
    }

    /// Build the unit's clients from configuration
    pub fn from_config(config: &GuiderConfig, bus: SharedBus) -> GuideResult<Self> {
        let unit = &config.unit;
        if unit.cameras.is_empty() {
            return Err(GuideError::Config(format!("unit {} has no guide cameras", unit.name)));
        }
        let proxy: &ProxyConfig = &config.proxy;

        let cameras = unit
            .cameras
            .iter()
            .map(|c| CameraClient::new(proxy.target(c.actor.clone(), bus.clone()), c.role, proxy.exposure_buffer_secs))
            .collect();
        let mut built = Self::new(
            unit.name.clone(),
            MountClient::new(proxy.target(unit.mount.clone(), bus.clone())),
            cameras,
        );
        if let Some(name) = &unit.focuser {
            built = built.with_focuser(FocuserClient::new(proxy.target(name.clone(), bus.clone())));
        }
        if let Some(name) = &unit.derotator {
            built = built.with_derotator(DerotatorClient::new(proxy.target(name.clone(), bus)));
        }
        Ok(built)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mount(&self) -> &MountClient {
        &self.mount
    }

    pub fn focuser(&self) -> Option<&FocuserClient> {
        self.focuser.as_ref()
    }

    pub fn derotator(&self) -> Option<&DerotatorClient> {
        self.derotator.as_ref()
    }

    pub fn cameras(&self) -> &[CameraClient] {
        &self.cameras
    }

    /// Expose every guide camera at once and collect the frames in camera order
    pub async fn expose_all(&self, exptime: f64) -> GuideResult<Vec<Frame>> {
        let calls = self
            .cameras
            .iter()
            .map(|c| c.expose(exptime))
            .collect::<ProxyResult<Vec<_>>>()?;
        let records = invoke(calls).await?;
        self.cameras
            .iter()
            .zip(records.iter())
            .map(|(camera, record)| camera.frame_from(record))
            .collect()
    }

    pub async fn calibration(&self) -> Option<CalibrationMatrix> {
        *self.calibration.read().await
    }

    /// Replace the stored calibration
    pub async fn set_calibration(&self, matrix: CalibrationMatrix) {
        *self.calibration.write().await = Some(matrix);
        tracing::info!(
            "{}: calibration stored (det={:.4e}, scale={:.3}\"/px)",
            self.name,
            matrix.determinant(),
            matrix.mean_scale()
        );
    }
}

fn single(mut records: Vec<Record>, actor: &str) -> GuideResult<Record> {
    records
        .pop()
        .ok_or_else(|| ProxyError::malformed(actor, "empty reply").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use autoguide_proxy::{ActorHandler, Body, CommandRequest, LocalBus, RemoteError, ReplySink};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        nested: bool,
    }

    #[async_trait]
    impl ActorHandler for Recorder {
        async fn handle(&self, request: &CommandRequest, _replies: &ReplySink) -> Result<Body, RemoteError> {
            self.seen.lock().unwrap().push(request.command_line());
            let filename = format!("{}.fits", request.actor);
            let reply = match request.command.as_str() {
                "expose" if self.nested => {
                    let mut nested = serde_json::Map::new();
                    nested.insert(request.actor.clone(), json!({ "filename": filename }));
                    serde_json::Value::Object(nested)
                }
                "expose" => json!({ "filename": filename }),
                "status" => json!({"dec_j2000_degs": -29.5, "ra_j2000_hours": 12.0}),
                _ => json!({}),
            };
            Ok(reply.as_object().cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_unit_commands() {
        let bus = Arc::new(LocalBus::new());
        let mount = Arc::new(Recorder::default());
        let derot = Arc::new(Recorder::default());
        bus.register("lvm.sci.pwi", mount.clone()).await;
        bus.register("lvm.sci.km", derot.clone()).await;
        bus.register("lvm.sci.foc", Arc::new(Recorder::default())).await;
        bus.register("lvm.sci.agcam.east", Arc::new(Recorder::default())).await;
        bus.register(
            "lvm.sci.agcam.west",
            Arc::new(Recorder {
                nested: true,
                ..Recorder::default()
            }),
        )
        .await;

        let unit = TelescopeUnit::from_config(&GuiderConfig::default(), bus).unwrap();
        assert!(unit.focuser().is_some());

        let frames = unit.expose_all(0.5).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].filename, "lvm.sci.agcam.east.fits");
        assert_eq!(frames[1].role, CameraRole::West);
        assert_eq!(frames[1].filename, "lvm.sci.agcam.west.fits");

        assert_eq!(unit.mount().declination("dec_j2000_degs").await.unwrap(), -29.5);
        invoke(vec![unit.mount().offset(1.5, -0.25)]).await.unwrap();
        invoke(vec![unit.derotator().unwrap().move_relative(0.1)]).await.unwrap();

        let mount_seen = mount.seen.lock().unwrap().clone();
        assert_eq!(mount_seen, vec!["status", "offset --ra_add_arcsec 1.5 --dec_add_arcsec -0.25"]);
        assert_eq!(derot.seen.lock().unwrap().clone(), vec!["moverelative 0.1 DEG"]);
    }

    #[tokio::test]
    async fn test_unusable_exposure_time_is_rejected_before_sending() {
        let bus = Arc::new(LocalBus::new());
        let camera = Arc::new(Recorder::default());
        bus.register("cam", camera.clone()).await;
        let unit = TelescopeUnit::new(
            "u",
            MountClient::new(RemoteTarget::new("mount", bus.clone())),
            vec![CameraClient::new(RemoteTarget::new("cam", bus), CameraRole::Center, 10.0)],
        );

        let err = unit.expose_all(1e300).await.unwrap_err();
        assert!(matches!(err, GuideError::Proxy(ProxyError::InvalidDeadline(_))));
        assert!(camera.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_declination_key() {
        let bus = Arc::new(LocalBus::new());
        bus.register("mount", Arc::new(Recorder::default())).await;
        let mount = MountClient::new(RemoteTarget::new("mount", bus));
        match mount.declination("dec_deg").await {
            Err(GuideError::Proxy(ProxyError::MissingKey { key, .. })) => assert_eq!(key, "dec_deg"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
