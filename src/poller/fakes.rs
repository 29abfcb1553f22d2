//! Scriptable probe used by the poller and scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::adapters::{ApiType, ProbeFailure, ProbeResult, UsageProbe, UsageReport};

#[derive(Clone)]
pub(crate) enum Behavior {
    Usage(UsageReport),
    Fail(ProbeFailure),
    Panic,
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct FakeProbe {
    scripted: Mutex<HashMap<String, Behavior>>,
    delay: Duration,
    hook: Option<Hook>,
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeProbe {
    /// Every secret answers 500 / 500000 unless scripted otherwise.
    pub(crate) fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            hook: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `hook(secret)` at the start of every probe.
    pub(crate) fn with_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub(crate) fn script(self, secret: &str, behavior: Behavior) -> Self {
        self.scripted.lock().unwrap().insert(secret.to_string(), behavior);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub(crate) fn free_usage(count: i64, limit: i64) -> UsageReport {
    UsageReport {
        api_type: ApiType::Free,
        character_count: count,
        character_limit: limit,
        key_character_count: None,
        key_character_limit: None,
        billing_start: None,
        billing_end: None,
    }
}

#[async_trait]
impl UsageProbe for FakeProbe {
    fn provider_id(&self) -> &str { "fake" }

    async fn probe(&self, secret: &str) -> ProbeResult {
        self.calls.lock().unwrap().push((secret.to_string(), Utc::now()));
        if let Some(hook) = &self.hook {
            hook(secret);
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let behavior = self.scripted.lock().unwrap().get(secret).cloned();
        match behavior {
            Some(Behavior::Usage(report)) => ProbeResult::success(report),
            Some(Behavior::Fail(failure)) => ProbeResult::failure(failure),
            Some(Behavior::Panic) => panic!("probe exploded for {}", secret),
            None => ProbeResult::success(UsageReport {
                api_type: ApiType::from_secret(secret),
                ..free_usage(500, 500_000)
            }),
        }
    }
}
