//! Session orchestration - drives every configured module through its lifecycle

use crate::config::{SessionConfig, SessionPolicy};
use crate::error::{CaptureError, CaptureResult};
use crate::module::{CaptureModule, ModuleContext, ModuleState, ModuleStats};
use crate::registry::ModuleRegistry;
use crate::sink::EventSink;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Final state of one module after a session
#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub name: String,
    pub state: ModuleState,
    pub stats: ModuleStats,
    /// Fatal error, if the module failed
    pub error: Option<String>,
}

type RunOutcome = (String, Box<dyn CaptureModule>, CaptureResult<()>);

/// Runs a capture session over a set of registered modules
pub struct Orchestrator {
    registry: ModuleRegistry,
    sink: Arc<dyn EventSink>,
    policy: SessionPolicy,
    reports: Vec<ModuleReport>,
}

impl Orchestrator {
    pub fn new(registry: ModuleRegistry, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            sink,
            policy: SessionPolicy::default(),
            reports: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Per-module outcome of the last `start`
    pub fn reports(&self) -> &[ModuleReport] {
        &self.reports
    }

    /// Run a session until `cancel` fires or every module has ended.
    ///
    /// Modules are validated, then initialized, in declaration order. Under
    /// [`SessionPolicy::FailFast`] the first failure in either phase aborts the
    /// session; under [`SessionPolicy::BestEffort`] the failing module is
    /// skipped. A module failing while running never stops its siblings.
    ///
    /// Returns the first fatal error of the session. Every module has been
    /// closed, and so every probe detached, by the time this returns.
    pub async fn start(
        &mut self,
        cancel: CancellationToken,
        names: &[String],
        config: &SessionConfig,
    ) -> CaptureResult<()> {
        self.reports.clear();

        if names.is_empty() {
            return Err(CaptureError::config("session", "no modules selected"));
        }

        let mut first_error: Option<CaptureError> = None;

        // Phase 1: validate, before any kernel-side resource exists
        let mut validated: Vec<Box<dyn CaptureModule>> = Vec::with_capacity(names.len());
        for name in names {
            let outcome = match self.registry.create(name) {
                Ok(mut module) => {
                    let module_config = config.module_config(name);
                    debug!("Validating module {}: {:?}", name, module_config);
                    match module.validate(&module_config) {
                        Ok(()) => Ok(module),
                        Err(e) => {
                            self.retire(module, Some(&e));
                            Err(e)
                        }
                    }
                }
                Err(e) => {
                    self.reports.push(ModuleReport {
                        name: name.clone(),
                        state: ModuleState::Failed,
                        stats: ModuleStats::default(),
                        error: Some(e.to_string()),
                    });
                    Err(e)
                }
            };

            match outcome {
                Ok(module) => {
                    info!("Module {} validated", name);
                    validated.push(module);
                }
                Err(e) => {
                    error!("Module {} failed validation: {}", name, e);
                    if self.policy == SessionPolicy::FailFast {
                        self.retire_all(validated);
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        // Phase 2: init, still nothing attached
        let session = cancel.child_token();
        let mut ready: Vec<Box<dyn CaptureModule>> = Vec::with_capacity(validated.len());
        let mut pending = validated.into_iter();
        while let Some(mut module) = pending.next() {
            let ctx = ModuleContext::new(session.clone(), self.sink.clone());
            match module.init(ctx) {
                Ok(()) => {
                    info!("Module {} initialized", module.name());
                    ready.push(module);
                }
                Err(e) => {
                    error!("Module {} failed init: {}", module.name(), e);
                    self.retire(module, Some(&e));
                    if self.policy == SessionPolicy::FailFast {
                        self.retire_all(ready);
                        self.retire_all(pending.collect());
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        if ready.is_empty() {
            warn!("No module left to run");
            return match first_error {
                Some(e) => Err(e),
                None => Err(CaptureError::config("session", "no module could be started")),
            };
        }

        // Phase 3: one task per module; close always follows run
        let mut tasks: JoinSet<RunOutcome> = JoinSet::new();
        for mut module in ready {
            let name = module.name().to_string();
            info!("Starting module {}", name);
            let span = info_span!("module", name = %name);
            tasks.spawn(
                async move {
                    let result = module.run().await;
                    if let Err(e) = module.close() {
                        warn!("Module {} close failed: {}", name, e);
                    }
                    (name, module, result)
                }
                .instrument(span),
            );
        }

        loop {
            tokio::select! {
                _ = session.cancelled() => {
                    info!("Cancellation requested, stopping modules");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => self.collect(joined, &mut first_error),
                    None => {
                        info!("All modules have ended");
                        break;
                    }
                },
            }
        }

        // One-shot: whatever ended the loop, every remaining task is told to stop
        session.cancel();
        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut first_error);
        }

        if let Err(e) = self.sink.flush().await {
            warn!("Failed to flush sink {}: {}", self.sink.name(), e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn collect(
        &mut self,
        joined: Result<RunOutcome, tokio::task::JoinError>,
        first_error: &mut Option<CaptureError>,
    ) {
        match joined {
            Ok((name, module, result)) => {
                let error = match result {
                    Ok(()) => None,
                    Err(e) if e.is_cancelled() => None,
                    Err(e) => {
                        error!("Module {} failed: {}", name, e);
                        Some(e)
                    }
                };
                let stats = module.stats();
                info!(
                    "Module {} {}: {} events, {} bytes, {} dropped",
                    name,
                    module.state(),
                    stats.events,
                    stats.bytes,
                    stats.dropped
                );
                self.reports.push(ModuleReport {
                    name,
                    state: module.state(),
                    stats,
                    error: error.as_ref().map(ToString::to_string),
                });
                if let Some(e) = error {
                    first_error.get_or_insert(e);
                }
            }
            Err(e) => {
                // Probe handles owned by the task detach on drop
                error!("Module task aborted: {}", e);
                first_error.get_or_insert(CaptureError::Other(anyhow::anyhow!(
                    "module task aborted: {}",
                    e
                )));
            }
        }
    }

    /// Close a module that will not run and record its final state
    fn retire(&mut self, mut module: Box<dyn CaptureModule>, cause: Option<&CaptureError>) {
        if let Err(e) = module.close() {
            warn!("Module {} close failed: {}", module.name(), e);
        }
        self.reports.push(ModuleReport {
            name: module.name().to_string(),
            state: module.state(),
            stats: module.stats(),
            error: cause.map(ToString::to_string),
        });
    }

    fn retire_all(&mut self, modules: Vec<Box<dyn CaptureModule>>) {
        for module in modules {
            self.retire(module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::events::{Direction, Event, RawRecord};
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nowhere,
        Validate,
        Init,
        Run,
    }

    /// Module that emits one event per tick until cancelled
    struct FakeModule {
        name: String,
        fail_at: FailAt,
        state: ModuleState,
        ctx: Option<ModuleContext>,
        stats: ModuleStats,
        attached: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[derive(Clone, Default)]
    struct Probes {
        attached: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeModule {
        fn new(name: &str, fail_at: FailAt, probes: &Probes) -> Self {
            Self {
                name: name.to_string(),
                fail_at,
                state: ModuleState::Created,
                ctx: None,
                stats: ModuleStats::default(),
                attached: probes.attached.clone(),
                closes: probes.closes.clone(),
            }
        }

        fn fail(&mut self, e: CaptureError) -> CaptureResult<()> {
            self.state = ModuleState::Failed;
            Err(e)
        }
    }

    #[async_trait]
    impl CaptureModule for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> ModuleState {
            self.state
        }

        fn validate(&mut self, _config: &ModuleConfig) -> CaptureResult<()> {
            self.state.require(ModuleState::Created, &self.name, "validate")?;
            if self.fail_at == FailAt::Validate {
                return self.fail(CaptureError::NotFound {
                    module: self.name.clone(),
                    searched: vec![],
                });
            }
            self.state = ModuleState::Validated;
            Ok(())
        }

        fn init(&mut self, ctx: ModuleContext) -> CaptureResult<()> {
            self.state.require(ModuleState::Validated, &self.name, "init")?;
            if self.fail_at == FailAt::Init {
                return self.fail(CaptureError::SymbolNotFound {
                    path: "/lib/libfake.so".into(),
                    symbol: "fake_read".into(),
                });
            }
            self.ctx = Some(ctx);
            self.state = ModuleState::Initialized;
            Ok(())
        }

        async fn run(&mut self) -> CaptureResult<()> {
            self.state.require(ModuleState::Initialized, &self.name, "run")?;
            let ctx = match self.ctx.clone() {
                Some(ctx) => ctx,
                None => return self.fail(CaptureError::Cancelled),
            };
            self.state = ModuleState::Running;
            self.attached.fetch_add(1, Ordering::SeqCst);
            self.stats.attached = 1;

            if self.fail_at == FailAt::Run {
                return self.fail(CaptureError::Attach {
                    path: "/lib/libfake.so".into(),
                    symbol: "fake_write".into(),
                    offset: 0x10,
                    message: "permission denied".into(),
                });
            }

            let mut seq = 0u64;
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        seq += 1;
                        let record = RawRecord {
                            timestamp_ns: seq,
                            pid: 1,
                            tid: 1,
                            uid: 0,
                            direction: Direction::Read,
                            data_len: 2,
                            comm: "fake".into(),
                            data: b"ok".to_vec(),
                        };
                        ctx.sink.accept(Event::from_record(&self.name, record, 64)).await?;
                        self.stats.events += 1;
                    }
                }
            }
            self.state = ModuleState::Stopped;
            Ok(())
        }

        fn close(&mut self) -> CaptureResult<()> {
            if self.stats.attached > 0 {
                self.attached.fetch_sub(self.stats.attached, Ordering::SeqCst);
                self.stats.attached = 0;
            }
            self.closes.fetch_add(1, Ordering::SeqCst);
            if !self.state.is_terminal() {
                self.state = ModuleState::Stopped;
            }
            Ok(())
        }

        fn stats(&self) -> ModuleStats {
            self.stats
        }
    }

    fn registry(specs: &[(&'static str, FailAt)], probes: &Probes) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for &(name, fail_at) in specs {
            let probes = probes.clone();
            registry.register(name, move || {
                Box::new(FakeModule::new(name, fail_at, &probes)) as Box<dyn CaptureModule>
            });
        }
        registry
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_registry_lookup() {
        let probes = Probes::default();
        let registry = registry(&[("openssl", FailAt::Nowhere)], &probes);
        assert!(registry.contains("openssl"));
        assert_eq!(registry.names(), vec!["openssl"]);
        assert!(registry.create("openssl").is_ok());
        assert!(matches!(
            registry.create("boringssl"),
            Err(CaptureError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_session() {
        let probes = Probes::default();
        let registry = registry(
            &[("openssl", FailAt::Nowhere), ("gnutls", FailAt::Validate)],
            &probes,
        );
        let sink = Arc::new(MemorySink::new());
        let mut orchestrator = Orchestrator::new(registry, sink.clone());

        let result = orchestrator
            .start(
                CancellationToken::new(),
                &names(&["openssl", "gnutls"]),
                &SessionConfig::default(),
            )
            .await;

        assert!(matches!(result, Err(CaptureError::NotFound { .. })));
        assert!(result.unwrap_err().is_config());
        assert_eq!(probes.attached.load(Ordering::SeqCst), 0);
        assert_eq!(probes.closes.load(Ordering::SeqCst), 2);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_module_is_reported() {
        let probes = Probes::default();
        let mut orchestrator = Orchestrator::new(registry(&[], &probes), Arc::new(MemorySink::new()));
        let result = orchestrator
            .start(
                CancellationToken::new(),
                &names(&["boringssl"]),
                &SessionConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(CaptureError::UnknownModule(_))));
        assert_eq!(orchestrator.reports().len(), 1);
        assert_eq!(orchestrator.reports()[0].state, ModuleState::Failed);
    }

    #[tokio::test]
    async fn test_init_failure_closes_initialized_modules() {
        let probes = Probes::default();
        let registry = registry(
            &[
                ("openssl", FailAt::Nowhere),
                ("gnutls", FailAt::Init),
                ("nspr", FailAt::Nowhere),
            ],
            &probes,
        );
        let mut orchestrator = Orchestrator::new(registry, Arc::new(MemorySink::new()));

        let result = orchestrator
            .start(
                CancellationToken::new(),
                &names(&["openssl", "gnutls", "nspr"]),
                &SessionConfig::default(),
            )
            .await;

        assert!(matches!(result, Err(CaptureError::SymbolNotFound { .. })));
        assert_eq!(probes.closes.load(Ordering::SeqCst), 3);
        assert_eq!(probes.attached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_failing_attach_leaves_siblings_running() {
        let probes = Probes::default();
        let registry = registry(
            &[
                ("openssl", FailAt::Nowhere),
                ("gnutls", FailAt::Run),
                ("nspr", FailAt::Nowhere),
            ],
            &probes,
        );
        let sink = Arc::new(MemorySink::new());
        let mut orchestrator = Orchestrator::new(registry, sink.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let observer = sink.clone();
        tokio::spawn(async move {
            // Let both healthy modules produce for a while after the failure
            while observer.count_for("openssl") < 5 || observer.count_for("nspr") < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.start(
                cancel,
                &names(&["openssl", "gnutls", "nspr"]),
                &SessionConfig::default(),
            ),
        )
        .await
        .expect("session did not stop");

        assert!(matches!(result, Err(CaptureError::Attach { .. })));
        assert!(sink.count_for("openssl") >= 5);
        assert!(sink.count_for("nspr") >= 5);
        assert_eq!(sink.count_for("gnutls"), 0);
        assert_eq!(probes.attached.load(Ordering::SeqCst), 0);
        assert_eq!(probes.closes.load(Ordering::SeqCst), 3);

        let failed: Vec<_> = orchestrator
            .reports()
            .iter()
            .filter(|r| r.state == ModuleState::Failed)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(failed, vec!["gnutls"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_every_module() {
        let probes = Probes::default();
        let registry = registry(
            &[("openssl", FailAt::Nowhere), ("nspr", FailAt::Nowhere)],
            &probes,
        );
        let mut orchestrator = Orchestrator::new(registry, Arc::new(MemorySink::new()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.start(cancel, &names(&["openssl", "nspr"]), &SessionConfig::default()),
        )
        .await
        .expect("session did not stop");

        assert!(result.is_ok());
        assert_eq!(probes.attached.load(Ordering::SeqCst), 0);
        assert!(orchestrator
            .reports()
            .iter()
            .all(|r| r.state == ModuleState::Stopped));
    }

    #[tokio::test]
    async fn test_best_effort_skips_invalid_module() {
        let probes = Probes::default();
        let registry = registry(
            &[("openssl", FailAt::Nowhere), ("gnutls", FailAt::Validate)],
            &probes,
        );
        let sink = Arc::new(MemorySink::new());
        let mut orchestrator =
            Orchestrator::new(registry, sink.clone()).with_policy(SessionPolicy::BestEffort);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let observer = sink.clone();
        tokio::spawn(async move {
            while observer.count_for("openssl") < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.start(cancel, &names(&["openssl", "gnutls"]), &SessionConfig::default()),
        )
        .await
        .expect("session did not stop");

        // The skipped module's error is still the session result
        assert!(matches!(result, Err(CaptureError::NotFound { .. })));
        assert!(sink.count_for("openssl") >= 3);
        assert_eq!(probes.attached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_module_list_is_rejected() {
        let probes = Probes::default();
        let mut orchestrator = Orchestrator::new(registry(&[], &probes), Arc::new(MemorySink::new()));
        let result = orchestrator
            .start(CancellationToken::new(), &[], &SessionConfig::default())
            .await;
        assert!(result.unwrap_err().is_config());
    }
}
