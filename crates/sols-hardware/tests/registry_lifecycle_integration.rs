use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use sols_core::capabilities::{Device, DeviceHandle, FocusLock};
use sols_core::clock::{Clock, MonotonicClock};
use sols_core::config::QueueSettings;
use sols_core::device::{DeviceDescriptor, DeviceId, DeviceKind, DeviceStatus, DeviceTarget};
use sols_core::driver::{BuildContext, DeviceComponents, DeviceSpec, DriverFactory};
use sols_core::error::PreflightError;
use sols_driver_mock::{FactoryRegistry, MockAutofocus};
use sols_hardware::{create_mock_registry, DeviceRegistry, FactoryTable, HardwareConfig};

/// Autofocus whose sample detector can be toggled from the test.
struct SwitchableFactory {
    unit: Arc<MockAutofocus>,
}

impl DriverFactory for SwitchableFactory {
    fn driver_type(&self) -> &'static str {
        "switchable_autofocus"
    }

    fn name(&self) -> &'static str {
        "Switchable Autofocus"
    }

    fn kinds(&self) -> &'static [DeviceKind] {
        &[DeviceKind::Autofocus]
    }

    fn validate(&self, _params: &toml::Value) -> Result<()> {
        Ok(())
    }

    fn build(
        &self,
        spec: DeviceSpec,
        _ctx: BuildContext,
    ) -> futures::future::BoxFuture<'static, Result<DeviceComponents>> {
        let unit = self.unit.clone();
        Box::pin(async move {
            Ok(DeviceComponents {
                descriptor: DeviceDescriptor::new(spec.id, DeviceKind::Autofocus),
                handle: DeviceHandle::Autofocus(unit),
            })
        })
    }
}

/// Autofocus whose reset always fails.
struct StubbornAutofocus;

#[async_trait::async_trait]
impl Device for StubbornAutofocus {
    async fn reset_fault(&self) -> Result<()> {
        Err(anyhow!("controller not responding"))
    }
}

#[async_trait::async_trait]
impl FocusLock for StubbornAutofocus {
    async fn set_engaged(&self, _engaged: bool) -> Result<()> {
        Err(anyhow!("lock lost"))
    }

    async fn sample_present(&self) -> Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn preflight_fails_when_sample_removed() {
    let unit = Arc::new(MockAutofocus::instant());
    let factories = FactoryTable::new();
    factories.register_factory(Box::new(SwitchableFactory { unit: unit.clone() }));

    let config = HardwareConfig::from_toml_str(
        "[[devices]]\nid = \"autofocus\"\ndriver = \"switchable_autofocus\"",
    )
    .unwrap();
    let registry = DeviceRegistry::from_config(
        &config,
        &factories,
        Arc::new(MonotonicClock::new()),
        QueueSettings::default(),
    )
    .await
    .unwrap();

    let id = DeviceId::from("autofocus");
    registry.preflight(&[id.clone()]).await.unwrap();

    unit.set_sample_present(false);
    let err = registry.preflight(&[id.clone()]).await.unwrap_err();
    assert!(matches!(err, PreflightError::NotReady { device, .. } if device == id));
}

#[tokio::test]
async fn failed_reset_keeps_fault_latched() {
    let registry = DeviceRegistry::new(Arc::new(MonotonicClock::new()), QueueSettings::default());
    let mut events = registry.take_event_receiver().unwrap();
    registry
        .register(DeviceComponents {
            descriptor: DeviceDescriptor::new("autofocus", DeviceKind::Autofocus),
            handle: DeviceHandle::Autofocus(Arc::new(StubbornAutofocus)),
        })
        .unwrap();
    let id = DeviceId::from("autofocus");

    registry
        .configure(&id, DeviceTarget::FocusLock { engaged: true }, 0)
        .unwrap();
    assert!(events.recv().await.unwrap().is_fault());

    assert!(registry.fault_reset(&id).await.is_err());
    assert_eq!(registry.status(&id).unwrap(), DeviceStatus::Fault);
}

#[tokio::test(start_paused = true)]
async fn realistic_completion_follows_settle_time() {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let registry = create_mock_registry("realistic", clock.clone()).await.unwrap();
    let mut events = registry.take_event_receiver().unwrap();

    registry
        .configure(&DeviceId::from("piezo"), DeviceTarget::Position { value: 100.0 }, 0)
        .unwrap();
    registry
        .configure(&DeviceId::from("galvo"), DeviceTarget::Mirrors(Default::default()), 0)
        .unwrap();

    // galvo settles in 200 us (resolved on the next 1 ms timer tick), piezo in 2 ms
    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!(first.device.as_str(), "galvo");
    assert_eq!(first.ticket.seq, 1);
    assert!(first.timestamp <= Duration::from_millis(1));
    assert_eq!(second.device.as_str(), "piezo");
    assert_eq!(second.ticket.seq, 0);
    assert_eq!(second.timestamp, Duration::from_millis(2));
}
