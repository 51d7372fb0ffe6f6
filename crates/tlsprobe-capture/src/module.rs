//! TLS capture module: one crypto library, end to end

use crate::library::LibraryProfile;
use crate::locator::{LibraryLocator, Located};
use crate::resolver::{SymbolRequest, SymbolResolver};
use async_trait::async_trait;
use std::sync::Arc;
use tlsprobe_core::transport::{self, Recv, TransportConsumer, TransportProducer};
use tlsprobe_core::{
    CaptureError, CaptureModule, CaptureResult, Event, ModuleConfig, ModuleContext, ModuleState,
    ModuleStats, ProbeBackend, ProbeHandle, ProbeTarget, RawRecord,
};
use tracing::{debug, info, warn};

/// Capture module driven by a [`LibraryProfile`]
pub struct TlsCaptureModule {
    profile: LibraryProfile,
    locator: Arc<LibraryLocator>,
    resolver: Arc<SymbolResolver>,
    backend: Arc<dyn ProbeBackend>,

    state: ModuleState,
    config: Option<ModuleConfig>,
    library: Option<Located>,
    targets: Vec<ProbeTarget>,
    ctx: Option<ModuleContext>,
    producer: Option<TransportProducer>,
    consumer: Option<TransportConsumer>,
    handles: Vec<ProbeHandle>,
    stats: ModuleStats,
}

impl TlsCaptureModule {
    pub fn new(
        profile: LibraryProfile,
        locator: Arc<LibraryLocator>,
        resolver: Arc<SymbolResolver>,
        backend: Arc<dyn ProbeBackend>,
    ) -> Self {
        Self {
            profile,
            locator,
            resolver,
            backend,
            state: ModuleState::Created,
            config: None,
            library: None,
            targets: Vec::new(),
            ctx: None,
            producer: None,
            consumer: None,
            handles: Vec::new(),
            stats: ModuleStats::default(),
        }
    }

    /// Library chosen by `validate`
    pub fn library(&self) -> Option<&Located> {
        self.library.as_ref()
    }

    /// Targets prepared by `init`
    pub fn targets(&self) -> &[ProbeTarget] {
        &self.targets
    }

    fn fail(&mut self, e: CaptureError) -> CaptureResult<()> {
        warn!("Module {} failed: {}", self.profile.name, e);
        self.state = ModuleState::Failed;
        Err(e)
    }

    fn attach_all(&mut self, producer: &TransportProducer) -> CaptureResult<()> {
        let filter = self
            .config
            .as_ref()
            .map(|c| c.global.process_filter())
            .unwrap_or_default();

        for target in &self.targets {
            let handle = self.backend.attach(filter, target, producer.clone())?;
            info!(
                "Module {} attached {} via {} for {}",
                self.profile.name,
                target,
                self.backend.name(),
                filter
            );
            self.handles.push(handle);
            self.stats.attached = self.handles.len();
        }
        Ok(())
    }

    async fn deliver(&mut self, ctx: &ModuleContext, records: Vec<RawRecord>, max_payload: usize) {
        for record in records {
            let event = Event::from_record(self.profile.name, record, max_payload);
            self.stats.events += 1;
            self.stats.bytes += event.payload().len() as u64;
            if event.is_truncated() {
                self.stats.truncated += 1;
            }
            if let Err(e) = ctx.sink.accept(event).await {
                self.stats.sink_errors += 1;
                debug!("Sink {} rejected event: {}", ctx.sink.name(), e);
            }
        }
    }

    fn note_loss(&mut self, consumer: &TransportConsumer) {
        let total = consumer.dropped();
        if total > self.stats.dropped {
            let loss = CaptureError::TransportLoss {
                module: self.profile.name.to_string(),
                dropped: total - self.stats.dropped,
                total,
            };
            warn!("{}", loss);
            self.stats.dropped = total;
        }
    }

    fn detach_all(&mut self) -> CaptureResult<()> {
        let mut first_error = None;
        for mut handle in self.handles.drain(..) {
            match handle.detach() {
                Ok(()) => debug!("Module {} detached {}", self.profile.name, handle.target()),
                Err(e) => {
                    warn!("Module {} failed to detach: {}", self.profile.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats.attached = 0;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CaptureModule for TlsCaptureModule {
    fn name(&self) -> &str {
        self.profile.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn validate(&mut self, config: &ModuleConfig) -> CaptureResult<()> {
        self.state
            .require(ModuleState::Created, self.profile.name, "validate")?;

        match self.locator.locate(&self.profile, config) {
            Ok(located) => {
                self.library = Some(located);
                self.config = Some(config.clone());
                self.state = ModuleState::Validated;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn init(&mut self, ctx: ModuleContext) -> CaptureResult<()> {
        self.state
            .require(ModuleState::Validated, self.profile.name, "init")?;
        let (Some(library), Some(config)) = (&self.library, &self.config) else {
            return self.fail(CaptureError::config(self.profile.name, "validated without a library"));
        };
        let path = library.path.clone();
        let verbose = config.global.debug;
        let capacity = config.global.transport_capacity;

        let requests: Vec<SymbolRequest> = self
            .profile
            .hooks
            .iter()
            .map(|hook| {
                let request = SymbolRequest::new(hook.symbol);
                if hook.required {
                    request
                } else {
                    request.optional()
                }
            })
            .collect();

        let resolution = match self.resolver.resolve(&path, &requests) {
            Ok(resolution) => resolution,
            Err(e) => return self.fail(e),
        };

        let mut targets = Vec::with_capacity(resolution.symbols.len());
        for hook in self.profile.hooks {
            let Some(symbol) = resolution.symbols.get(hook.symbol) else {
                continue;
            };
            targets.push(ProbeTarget {
                fingerprint: resolution.fingerprint.clone(),
                symbol: hook.symbol.to_string(),
                version: symbol.version.clone(),
                offset: symbol.offset,
                direction: hook.direction,
                args: hook.args,
            });
        }
        for target in &targets {
            if verbose {
                info!("Module {} prepared {}", self.profile.name, target);
            } else {
                debug!("Module {} prepared {}", self.profile.name, target);
            }
        }

        let (producer, consumer) = transport::channel(capacity);
        self.targets = targets;
        self.producer = Some(producer);
        self.consumer = Some(consumer);
        self.ctx = Some(ctx);
        self.state = ModuleState::Initialized;
        Ok(())
    }

    async fn run(&mut self) -> CaptureResult<()> {
        self.state
            .require(ModuleState::Initialized, self.profile.name, "run")?;
        let (Some(ctx), Some(producer), Some(mut consumer)) =
            (self.ctx.clone(), self.producer.clone(), self.consumer.take())
        else {
            return self.fail(CaptureError::config(self.profile.name, "run without init"));
        };
        let global = self
            .config
            .as_ref()
            .map(|c| c.global.clone())
            .unwrap_or_default();

        self.state = ModuleState::Running;
        if ctx.cancel.is_cancelled() {
            self.state = ModuleState::Stopped;
            return Ok(());
        }
        if let Err(e) = self.attach_all(&producer) {
            // Already attached probes are left to close()
            return self.fail(e);
        }
        info!(
            "Module {} capturing {} with {} probes",
            self.profile.name,
            self.library
                .as_ref()
                .map(|l| l.path.display().to_string())
                .unwrap_or_default(),
            self.handles.len()
        );

        let mut closed = false;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                received = consumer.recv_batch(global.batch_size, global.poll_interval) => match received {
                    Recv::Batch(records) => self.deliver(&ctx, records, global.max_payload).await,
                    Recv::Idle => {}
                    Recv::Closed => {
                        closed = true;
                        break;
                    }
                },
            }
            self.note_loss(&consumer);
        }

        // Stop producers before draining so nothing lands after the drain
        let detached = self.detach_all();
        producer.close();
        let remaining = consumer.drain();
        if !remaining.is_empty() {
            debug!(
                "Module {} draining {} buffered events",
                self.profile.name,
                remaining.len()
            );
            self.deliver(&ctx, remaining, global.max_payload).await;
        }
        self.note_loss(&consumer);

        if closed {
            return self.fail(CaptureError::TransportClosed {
                module: self.profile.name.to_string(),
            });
        }
        if let Err(e) = detached {
            return self.fail(e);
        }

        self.state = ModuleState::Stopped;
        info!(
            "Module {} stopped: {} events, {} dropped",
            self.profile.name, self.stats.events, self.stats.dropped
        );
        Ok(())
    }

    fn close(&mut self) -> CaptureResult<()> {
        let detached = self.detach_all();
        if let Some(producer) = self.producer.take() {
            producer.close();
        }
        self.consumer = None;
        self.ctx = None;
        if !self.state.is_terminal() {
            self.state = ModuleState::Stopped;
        }
        detached
    }

    fn stats(&self) -> ModuleStats {
        self.stats
    }
}
