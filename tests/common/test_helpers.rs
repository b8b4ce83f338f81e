#![allow(dead_code)]

use async_trait::async_trait;
use ninelives_gather::descriptor::DependencyDescriptorBuilder;
use ninelives_gather::{
    CreateClient, DependencyDescriptor, DependencyError, FetchClient, InMemoryStore, PrimaryStore,
    StoreError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tight settings for tests: 10ms doubling backoff, 100ms timeout, 4 slots, threshold 3,
/// 1s open, one trial.
pub fn descriptor(name: &str) -> DependencyDescriptorBuilder {
    DependencyDescriptor::builder(name)
        .max_retries(0)
        .backoff_base(Duration::from_millis(10))
        .request_timeout(Duration::from_millis(100))
        .bulkhead_capacity(4)
        .failure_threshold(3)
        .open_state_duration(Duration::from_secs(1))
        .half_open_trial_count(1)
}

/// How a [`Scripted`] client answers.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(Value),
    Refuse,
    Fail(u16),
    Delay(Duration, Value),
}

/// Client whose answers can be changed mid-test; counts every call that reached it.
#[derive(Debug, Clone)]
pub struct Scripted {
    calls: Arc<AtomicU32>,
    behavior: Arc<Mutex<Behavior>>,
}

impl Scripted {
    pub fn new(behavior: Behavior) -> Self {
        Self { calls: Arc::new(AtomicU32::new(0)), behavior: Arc::new(Mutex::new(behavior)) }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    async fn answer(&self) -> Result<Value, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Reply(v) => Ok(v),
            Behavior::Refuse => Err(DependencyError::Connect("connection refused".into())),
            Behavior::Fail(status) => {
                Err(DependencyError::Remote { status, message: "scripted failure".into() })
            }
            Behavior::Delay(d, v) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
        }
    }
}

#[async_trait]
impl FetchClient<Value> for Scripted {
    async fn fetch(&self, _key: u64) -> Result<Value, DependencyError> {
        self.answer().await
    }
}

#[async_trait]
impl CreateClient<Value> for Scripted {
    async fn create(&self, _payload: &Value) -> Result<Value, DependencyError> {
        self.answer().await
    }
}

/// In-memory store whose reads can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore<String>,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl PrimaryStore<String> for FlakyStore {
    fn get(&self, key: u64) -> Result<Option<String>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store offline".into()));
        }
        self.inner.get(key)
    }

    fn insert(
        &self,
        build: Box<dyn FnOnce(u64) -> String + Send + '_>,
    ) -> Result<(u64, String), StoreError> {
        self.inner.insert(build)
    }

    fn delete(&self, key: u64) -> Result<bool, StoreError> {
        self.inner.delete(key)
    }

    fn list(&self) -> Result<Vec<(u64, String)>, StoreError> {
        self.inner.list()
    }
}
