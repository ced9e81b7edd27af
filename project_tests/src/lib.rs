//! In-memory collaborators for driving `lib_energy` end to end without a
//! broker or a database.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_energy::configs::{PayloadProfile, TopicScheme, WatchdogPolicy, WindowPolicy};
use lib_energy::core::{
    DeltaEngine, DeviceId, DeviceRecord, GatewayError, IngestDispatcher, LivenessClock, PersistenceGateway,
    TopicResolver, TopicSubscriber, TransportError, Watchdog,
};

/// One `write_delta` call as the store saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenDelta {
    pub device_name: String,
    pub utc_timestamp: i64,
    pub delta_kwh: f64,
    pub device_id: DeviceId,
}

/// Device registry and measurement sink held in memory.
#[derive(Default)]
pub struct MemoryGateway {
    registry: Mutex<Vec<(DeviceId, DeviceRecord)>>,
    writes: Mutex<Vec<WrittenDelta>>,
    registry_down: AtomicBool,
    writes_down: AtomicBool,
}

impl MemoryGateway {
    pub fn with_devices(devices: &[(DeviceId, &str, i32)]) -> Self {
        let gateway = Self::default();
        for (id, name, protocol) in devices {
            gateway.register(*id, name, *protocol);
        }
        gateway
    }

    pub fn register(&self, id: DeviceId, name: &str, protocol: i32) {
        self.registry
            .lock()
            .unwrap()
            .push((id, DeviceRecord::new(name, protocol)));
    }

    pub fn set_registry_down(&self, down: bool) {
        self.registry_down.store(down, Ordering::SeqCst);
    }

    pub fn set_writes_down(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<WrittenDelta> {
        self.writes.lock().unwrap().clone()
    }

    fn check_registry(&self) -> Result<(), GatewayError> {
        if self.registry_down.load(Ordering::SeqCst) {
            return Err(GatewayError::Pool("registry unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn lookup_devices_by_protocol(&self) -> Result<Vec<DeviceRecord>, GatewayError> {
        self.check_registry()?;
        Ok(self.registry.lock().unwrap().iter().map(|(_, r)| r.clone()).collect())
    }

    async fn lookup_device_id(&self, device_name: &str) -> Result<Option<DeviceId>, GatewayError> {
        self.check_registry()?;
        Ok(self
            .registry
            .lock()
            .unwrap()
            .iter()
            .find(|(_, r)| r.name == device_name)
            .map(|(id, _)| *id))
    }

    async fn write_delta(
        &self,
        device_name: &str,
        utc_timestamp: i64,
        delta_kwh: f64,
        device_id: DeviceId,
    ) -> Result<(), GatewayError> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(GatewayError::Query("measurement table locked".to_string()));
        }
        self.writes.lock().unwrap().push(WrittenDelta {
            device_name: device_name.to_string(),
            utc_timestamp,
            delta_kwh,
            device_id,
        });
        Ok(())
    }
}

/// Records subscribe requests; topics in `refuse` fail.
#[derive(Default)]
pub struct RecordingSubscriber {
    requests: Mutex<Vec<String>>,
    refuse: Mutex<BTreeSet<String>>,
    rejected: Mutex<BTreeSet<String>>,
}

impl RecordingSubscriber {
    /// Every request in order, failed ones included.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn refuse(&self, topic: &str) {
        self.refuse.lock().unwrap().insert(topic.to_string());
    }

    pub fn accept_all(&self) {
        self.refuse.lock().unwrap().clear();
    }

    /// Reports `topic` as refused by the broker after the request went out.
    pub fn reject_later(&self, topic: &str) {
        self.rejected.lock().unwrap().insert(topic.to_string());
    }
}

#[async_trait]
impl TopicSubscriber for RecordingSubscriber {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(topic.to_string());
        if self.refuse.lock().unwrap().contains(topic) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorised".to_string(),
            });
        }
        Ok(())
    }

    fn take_rejected(&self) -> Vec<String> {
        std::mem::take(&mut *self.rejected.lock().unwrap()).into_iter().collect()
    }
}

/// A dispatcher wired to in-memory collaborators.
pub struct Harness {
    pub gateway: Arc<MemoryGateway>,
    pub subscriber: Arc<RecordingSubscriber>,
    pub dispatcher: Arc<IngestDispatcher>,
}

impl Harness {
    pub fn new(gateway: MemoryGateway, window: WindowPolicy) -> Self {
        Self::with_profile(gateway, window, PayloadProfile::default())
    }

    pub fn with_profile(gateway: MemoryGateway, window: WindowPolicy, profile: PayloadProfile) -> Self {
        let gateway = Arc::new(gateway);
        let subscriber = Arc::new(RecordingSubscriber::default());
        let resolver = Arc::new(TopicResolver::new(
            gateway.clone(),
            subscriber.clone(),
            TopicScheme::default(),
            Duration::from_secs(1),
        ));
        let dispatcher = Arc::new(IngestDispatcher::new(
            DeltaEngine::new(window),
            profile,
            gateway.clone(),
            resolver,
            Arc::new(LivenessClock::new()),
            Duration::from_secs(1),
        ));
        Self {
            gateway,
            subscriber,
            dispatcher,
        }
    }

    pub fn watchdog(&self, policy: WatchdogPolicy) -> Watchdog {
        Watchdog::new(policy, self.dispatcher.clone())
    }
}

/// Data topic of a device under the default scheme.
pub fn topic(device: &str) -> String {
    TopicScheme::default().topic_for(device)
}

/// Payload whose default-profile reading is `kwh`.
pub fn reading(utc_timestamp: i64, kwh: f64) -> Vec<u8> {
    serde_json::json!({
        "utctimestamp": utc_timestamp,
        "measures": {
            "Load_0_30001": kwh * 1000.0,
            "Load_0_30000": 0,
        }
    })
    .to_string()
    .into_bytes()
}
